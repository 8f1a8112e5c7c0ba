//! Persistent backends for the attendance ledger.
//!
//! A store only persists and reads back rows. Deduplication and locking live
//! in [`Ledger`](crate::ledger::Ledger), which drives the store through
//! [`LedgerStore`].

use crate::types::{AttendanceRecord, DATE_FORMAT, TIME_FORMAT};
use chrono::{NaiveDate, NaiveTime};
use csv::QuoteStyle;
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const CSV_HEADER: [&str; 3] = ["Name", "Time", "Date"];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("ledger I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("value cannot be stored: {0:?}")]
    InvalidField(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A stored row that could not be parsed into a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed record at {position}: {reason}")]
pub struct MalformedRecord {
    /// Line number (CSV) or row id (SQLite).
    pub position: u64,
    pub reason: String,
}

pub type RowResult = Result<AttendanceRecord, MalformedRecord>;

/// What changed in the store since the handle last looked.
#[derive(Debug)]
pub enum Refresh {
    Unchanged,
    /// New rows after the ones already returned.
    Appended(Vec<RowResult>),
    /// The full contents; previously returned rows must be discarded.
    Reloaded(Vec<RowResult>),
}

/// Result of a successful append call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The store itself rejected a second row for the same (name, date).
    Conflict,
}

/// Backend for [`Ledger`](crate::ledger::Ledger).
///
/// Implementations must leave no partial row behind when `append` fails.
pub trait LedgerStore: Send {
    /// Key identifying the underlying storage location. Handles with the same
    /// key share one write lock.
    fn location(&self) -> &str;

    /// Rows written since the previous call. A missing store has no rows.
    fn refresh(&mut self) -> Result<Refresh, StoreError>;

    fn append(&mut self, record: &AttendanceRecord) -> Result<AppendOutcome, StoreError>;

    /// Exclude other processes from the location until the guard drops.
    /// Stores that enforce (name, date) uniqueness themselves need no lock.
    fn lock_exclusive(&self) -> Result<Option<StoreLock>, StoreError> {
        Ok(None)
    }
}

/// Advisory lock held on a sidecar file. Released when dropped.
#[derive(Debug)]
pub struct StoreLock {
    _file: File,
}

impl StoreLock {
    /// Block until an exclusive lock on `path` is held, creating the file if needed.
    pub fn acquire(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| StoreError::io(path, e))?;
        Ok(Self { _file: file })
    }
}

impl<S: LedgerStore + ?Sized> LedgerStore for Box<S> {
    fn location(&self) -> &str {
        (**self).location()
    }

    fn refresh(&mut self) -> Result<Refresh, StoreError> {
        (**self).refresh()
    }

    fn append(&mut self, record: &AttendanceRecord) -> Result<AppendOutcome, StoreError> {
        (**self).append(record)
    }

    fn lock_exclusive(&self) -> Result<Option<StoreLock>, StoreError> {
        (**self).lock_exclusive()
    }
}

/// Parse one stored row from its three text fields.
pub(crate) fn parse_row(position: u64, name: &str, time: &str, date: &str) -> RowResult {
    let malformed = |reason: String| MalformedRecord { position, reason };
    let time = NaiveTime::parse_from_str(time.trim(), TIME_FORMAT)
        .map_err(|e| malformed(format!("bad time {time:?}: {e}")))?;
    let date = NaiveDate::parse_from_str(date.trim(), DATE_FORMAT)
        .map_err(|e| malformed(format!("bad date {date:?}: {e}")))?;
    Ok(AttendanceRecord {
        name: name.to_string(),
        date,
        time,
    })
}

/// Derive a lock key for a file that may not exist yet.
pub(crate) fn location_key(path: &Path) -> String {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical.to_string_lossy().into_owned();
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
    .to_string_lossy()
    .into_owned()
}

/// Attendance table as a text file: `Name,Time,Date` header, one row per line.
///
/// Reads files whose rows are newline-prefixed with no trailing newline, and
/// appends to them without merging lines. Writers in different processes are
/// serialised through an advisory lock on `<path>.lock`.
pub struct CsvStore {
    path: PathBuf,
    location: String,
    /// File length covered by the last refresh or append. `None` until the first refresh.
    seen_len: Option<u64>,
}

impl CsvStore {
    /// Open a CSV ledger at `path`. The file is created on first append.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let location = location_key(&path);
        Self {
            path,
            location,
            seen_len: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sidecar file that serialises writers across processes.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn current_len(&self) -> Result<u64, StoreError> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    fn read_all(&self) -> Result<(Vec<RowResult>, u64), StoreError> {
        let mut bytes = Vec::new();
        match File::open(&self.path) {
            Ok(mut file) => {
                file.read_to_end(&mut bytes)
                    .map_err(|e| StoreError::io(&self.path, e))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&self.path, e)),
        }
        Ok((parse_csv(&bytes), bytes.len() as u64))
    }

    fn ends_with_newline(file: &mut File, len: u64) -> std::io::Result<bool> {
        if len == 0 {
            return Ok(true);
        }
        file.seek(SeekFrom::Start(len - 1))?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last)?;
        Ok(last[0] == b'\n')
    }
}

impl LedgerStore for CsvStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn refresh(&mut self) -> Result<Refresh, StoreError> {
        let len = self.current_len()?;
        if self.seen_len == Some(len) {
            return Ok(Refresh::Unchanged);
        }
        let (rows, read_len) = self.read_all()?;
        tracing::debug!(path = %self.path.display(), rows = rows.len(), bytes = read_len, "csv ledger reloaded");
        self.seen_len = Some(read_len);
        Ok(Refresh::Reloaded(rows))
    }

    fn append(&mut self, record: &AttendanceRecord) -> Result<AppendOutcome, StoreError> {
        if record.name.contains(['\n', '\r']) {
            return Err(StoreError::InvalidField(record.name.clone()));
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;

        let prev_len = file
            .metadata()
            .map_err(|e| StoreError::io(&self.path, e))?
            .len();

        let mut buf = Vec::new();
        if prev_len > 0 && !Self::ends_with_newline(&mut file, prev_len).map_err(|e| StoreError::io(&self.path, e))? {
            buf.push(b'\n');
        }
        buf.extend(encode_rows(record, prev_len == 0)?);

        if let Err(e) = file.write_all(&buf).and_then(|_| file.flush()) {
            // Drop whatever part of the row made it to disk.
            if let Err(trunc) = file.set_len(prev_len) {
                tracing::error!(path = %self.path.display(), error = %trunc, "failed to roll back partial ledger row");
            }
            return Err(StoreError::io(&self.path, e));
        }

        // Someone else appended since our refresh: leave seen_len stale so the
        // next refresh reloads everything.
        if self.seen_len.unwrap_or(0) == prev_len {
            self.seen_len = Some(prev_len + buf.len() as u64);
        }
        Ok(AppendOutcome::Appended)
    }

    fn lock_exclusive(&self) -> Result<Option<StoreLock>, StoreError> {
        StoreLock::acquire(&self.lock_path()).map(Some)
    }
}

/// Encode one record (and the header, for a new file) as CSV text.
fn encode_rows(record: &AttendanceRecord, with_header: bool) -> Result<Vec<u8>, csv::Error> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .quote_style(QuoteStyle::Necessary)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    if with_header {
        wtr.write_record(CSV_HEADER)?;
    }
    let (time, date) = (record.time_string(), record.date_string());
    wtr.write_record([record.name.as_str(), time.as_str(), date.as_str()])?;
    wtr.into_inner().map_err(|e| csv::Error::from(e.into_error()))
}

fn is_header(record: &csv::ByteRecord) -> bool {
    record.len() == CSV_HEADER.len()
        && record.iter().zip(CSV_HEADER).all(|(field, want)| {
            String::from_utf8_lossy(field)
                .trim_start_matches('\u{feff}')
                .trim()
                .eq_ignore_ascii_case(want)
        })
}

fn parse_csv(contents: &[u8]) -> Vec<RowResult> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(contents);
    let mut rows = Vec::new();
    let mut first = true;

    for result in rdr.byte_records() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                let position = e.position().map_or(0, |p| p.line());
                rows.push(Err(MalformedRecord {
                    position,
                    reason: e.to_string(),
                }));
                continue;
            }
        };
        if record.iter().all(|f| f.iter().all(u8::is_ascii_whitespace)) {
            continue;
        }
        if std::mem::take(&mut first) && is_header(&record) {
            continue;
        }

        let position = record.position().map_or(0, |p| p.line());
        // Invalid UTF-8 only spoils the field it appears in.
        let field = |i: usize| String::from_utf8_lossy(record.get(i).unwrap_or_default()).into_owned();
        let row = if record.len() >= 3 {
            parse_row(position, &field(0), &field(1), &field(2))
        } else {
            Err(MalformedRecord {
                position,
                reason: format!("expected 3 fields, found {}", record.len()),
            })
        };
        rows.push(row);
    }
    rows
}
