//! SQLite ledger backend.

use crate::store::{location_key, parse_row, AppendOutcome, LedgerStore, Refresh, StoreError};
use crate::types::AttendanceRecord;
use rusqlite::{params, Connection, ErrorCode};
use std::path::{Path, PathBuf};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS attendance (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    time TEXT NOT NULL,
    date TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS attendance_name_date ON attendance (name, date);
";

/// Attendance table in a SQLite database.
///
/// A unique (name, date) index backs up the ledger's own check, so two
/// processes sharing one database still cannot both mark the same person.
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
    location: String,
    last_id: i64,
}

impl SqliteStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "sqlite ledger opened");

        let location = location_key(&path);
        Ok(Self {
            conn,
            path,
            location,
            last_id: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerStore for SqliteStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn refresh(&mut self) -> Result<Refresh, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, name, time, date FROM attendance WHERE id > ?1 ORDER BY id")?;
        let raw = stmt
            .query_map(params![self.last_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let Some(&(max_id, ..)) = raw.last() else {
            return Ok(Refresh::Unchanged);
        };
        self.last_id = max_id;

        let rows = raw
            .iter()
            .map(|(id, name, time, date)| parse_row(*id as u64, name, time, date))
            .collect();
        Ok(Refresh::Appended(rows))
    }

    fn append(&mut self, record: &AttendanceRecord) -> Result<AppendOutcome, StoreError> {
        let result = self.conn.execute(
            "INSERT INTO attendance (name, time, date) VALUES (?1, ?2, ?3)",
            params![record.name, record.time_string(), record.date_string()],
        );
        match result {
            Ok(_) => Ok(AppendOutcome::Appended),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                tracing::debug!(name = %record.name, date = %record.date, "sqlite rejected duplicate row");
                Ok(AppendOutcome::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }
}
