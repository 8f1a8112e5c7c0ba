//! Append-only attendance ledger with same-day deduplication.
//!
//! `mark_present` runs "refresh, check, append" as one critical section under a
//! lock shared by every [`Ledger`] in the process that points at the same
//! storage location, plus the store's own cross-process lock when it has one. Each handle keeps a `(name, date)` index over the rows it
//! has seen and refreshes it from the store inside the critical section, so
//! rows written through other handles are never missed.

use crate::store::{AppendOutcome, LedgerStore, Refresh, RowResult, StoreError};
use crate::types::AttendanceRecord;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use thiserror::Error;

type LockRegistry = Mutex<HashMap<String, Weak<Mutex<()>>>>;

static LOCATION_LOCKS: OnceLock<LockRegistry> = OnceLock::new();

/// Shared write lock for a storage location.
fn location_lock(location: &str) -> Arc<Mutex<()>> {
    let registry = LOCATION_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut locks = registry.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(lock) = locks.get(location).and_then(Weak::upgrade) {
        return lock;
    }
    locks.retain(|_, weak| weak.strong_count() > 0);
    let lock = Arc::new(Mutex::new(()));
    locks.insert(location.to_string(), Arc::downgrade(&lock));
    lock
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to read ledger: {0}")]
    Read(#[source] StoreError),
    #[error("failed to lock ledger: {0}")]
    Lock(#[source] StoreError),
    #[error("failed to write ledger: {0}")]
    Write(#[source] StoreError),
    #[error("store rejected {name} on {date} but the existing row is unreadable")]
    Conflict { name: String, date: NaiveDate },
}

/// Successful outcome of [`Ledger::mark_present`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkStatus {
    /// A new row was appended.
    Marked(AttendanceRecord),
    /// The person was already marked that day; this is the original row.
    AlreadyMarked(AttendanceRecord),
}

impl MarkStatus {
    pub fn record(&self) -> &AttendanceRecord {
        match self {
            MarkStatus::Marked(r) | MarkStatus::AlreadyMarked(r) => r,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, MarkStatus::Marked(_))
    }
}

struct LedgerState<S> {
    store: S,
    records: Vec<AttendanceRecord>,
    index: HashMap<(String, NaiveDate), usize>,
    malformed: usize,
}

impl<S: LedgerStore> LedgerState<S> {
    fn refresh(&mut self) -> Result<(), LedgerError> {
        match self.store.refresh().map_err(LedgerError::Read)? {
            Refresh::Unchanged => {}
            Refresh::Appended(rows) => self.absorb(rows),
            Refresh::Reloaded(rows) => {
                self.records.clear();
                self.index.clear();
                self.malformed = 0;
                self.absorb(rows);
            }
        }
        Ok(())
    }

    fn absorb(&mut self, rows: Vec<RowResult>) {
        for row in rows {
            match row {
                Ok(record) => self.push(record),
                Err(bad) => {
                    tracing::warn!(location = self.store.location(), position = bad.position, reason = %bad.reason, "skipping malformed ledger record");
                    self.malformed += 1;
                }
            }
        }
    }

    fn push(&mut self, record: AttendanceRecord) {
        let key = (record.name.clone(), record.date);
        if self.index.contains_key(&key) {
            // A file edited by hand can hold duplicates; the first one stands.
            tracing::warn!(name = %record.name, date = %record.date, "duplicate ledger record ignored");
            return;
        }
        self.index.insert(key, self.records.len());
        self.records.push(record);
    }

    fn find(&self, name: &str, date: NaiveDate) -> Option<&AttendanceRecord> {
        self.index
            .get(&(name.to_string(), date))
            .map(|&i| &self.records[i])
    }
}

/// Attendance ledger over a [`LedgerStore`].
pub struct Ledger<S> {
    location: Arc<Mutex<()>>,
    state: Mutex<LedgerState<S>>,
}

impl<S: LedgerStore> Ledger<S> {
    /// Open a ledger, loading existing records. A missing store is empty.
    pub fn open(store: S) -> Result<Self, LedgerError> {
        let location = location_lock(store.location());
        let mut state = LedgerState {
            store,
            records: Vec::new(),
            index: HashMap::new(),
            malformed: 0,
        };
        {
            let _guard = location.lock().unwrap_or_else(PoisonError::into_inner);
            state.refresh()?;
        }
        tracing::info!(
            location = state.store.location(),
            records = state.records.len(),
            malformed = state.malformed,
            "ledger opened"
        );
        Ok(Self {
            location,
            state: Mutex::new(state),
        })
    }

    /// Mark `name` present at `when`, at most once per calendar day.
    ///
    /// On a write failure the ledger and its store are left as they were.
    pub fn mark_present(&self, name: &str, when: NaiveDateTime) -> Result<MarkStatus, LedgerError> {
        let _guard = self.location.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let _store_lock = state.store.lock_exclusive().map_err(LedgerError::Lock)?;
        state.refresh()?;

        let date = when.date();
        if let Some(existing) = state.find(name, date) {
            tracing::debug!(name, %date, time = %existing.time, "already marked");
            return Ok(MarkStatus::AlreadyMarked(existing.clone()));
        }

        let record = AttendanceRecord::at(name, when);
        match state.store.append(&record).map_err(LedgerError::Write)? {
            AppendOutcome::Appended => {
                tracing::info!(name, %date, time = %record.time, "marked present");
                state.push(record.clone());
                Ok(MarkStatus::Marked(record))
            }
            AppendOutcome::Conflict => {
                state.refresh()?;
                state
                    .find(name, date)
                    .cloned()
                    .map(MarkStatus::AlreadyMarked)
                    .ok_or_else(|| LedgerError::Conflict {
                        name: name.to_string(),
                        date,
                    })
            }
        }
    }

    /// Every readable record, in insertion order.
    pub fn all_records(&self) -> Result<Vec<AttendanceRecord>, LedgerError> {
        self.with_fresh(|state| state.records.clone())
    }

    /// Records for one calendar day, in insertion order.
    pub fn records_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        self.with_fresh(|state| {
            state
                .records
                .iter()
                .filter(|r| r.date == date)
                .cloned()
                .collect()
        })
    }

    pub fn is_present(&self, name: &str, date: NaiveDate) -> Result<bool, LedgerError> {
        self.with_fresh(|state| state.find(name, date).is_some())
    }

    /// Number of stored rows skipped because they could not be parsed.
    pub fn malformed_count(&self) -> Result<usize, LedgerError> {
        self.with_fresh(|state| state.malformed)
    }

    fn with_fresh<T>(&self, f: impl FnOnce(&LedgerState<S>) -> T) -> Result<T, LedgerError> {
        let _guard = self.location.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.refresh()?;
        Ok(f(&state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CsvStore, MalformedRecord, StoreLock};
    use chrono::NaiveTime;
    use std::io::{Error, ErrorKind};
    use std::path::PathBuf;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    /// In-memory store that can be told to fail its next appends.
    struct FlakyStore {
        location: String,
        rows: Vec<RowResult>,
        returned: usize,
        fail_appends: bool,
    }

    impl FlakyStore {
        fn new(location: &str) -> Self {
            Self { location: location.into(), rows: Vec::new(), returned: 0, fail_appends: false }
        }
    }

    impl LedgerStore for FlakyStore {
        fn location(&self) -> &str {
            &self.location
        }

        fn refresh(&mut self) -> Result<Refresh, StoreError> {
            if self.returned == self.rows.len() {
                return Ok(Refresh::Unchanged);
            }
            let rows = self.rows[self.returned..].to_vec();
            self.returned = self.rows.len();
            Ok(Refresh::Appended(rows))
        }

        fn append(&mut self, record: &AttendanceRecord) -> Result<AppendOutcome, StoreError> {
            if self.fail_appends {
                return Err(StoreError::Io {
                    path: PathBuf::from(&self.location),
                    source: Error::new(ErrorKind::Other, "disk full"),
                });
            }
            self.rows.push(Ok(record.clone()));
            self.returned = self.rows.len();
            Ok(AppendOutcome::Appended)
        }
    }

    #[test]
    fn test_mark_is_idempotent_within_a_day() {
        let ledger = Ledger::open(FlakyStore::new("mem:idempotent")).unwrap();

        let first = ledger.mark_present("Alice", at("2024-03-18 09:00:00")).unwrap();
        let second = ledger.mark_present("Alice", at("2024-03-18 17:30:00")).unwrap();

        assert!(first.is_new());
        assert_eq!(second, MarkStatus::AlreadyMarked(first.record().clone()));
        let records = ledger.all_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_new_day_marks_again() {
        let ledger = Ledger::open(FlakyStore::new("mem:cross-day")).unwrap();

        assert!(ledger.mark_present("Alice", at("2024-03-18 23:59:59")).unwrap().is_new());
        assert!(ledger.mark_present("Alice", at("2024-03-19 00:00:00")).unwrap().is_new());
        assert_eq!(ledger.all_records().unwrap().len(), 2);
        assert_eq!(ledger.records_on(date("2024-03-19")).unwrap().len(), 1);
    }

    #[test]
    fn test_names_are_independent() {
        let ledger = Ledger::open(FlakyStore::new("mem:names")).unwrap();

        assert!(ledger.mark_present("Alice", at("2024-03-18 09:00:00")).unwrap().is_new());
        assert!(ledger.mark_present("ALICE", at("2024-03-18 09:00:01")).unwrap().is_new());
        assert!(ledger.is_present("Alice", date("2024-03-18")).unwrap());
        assert!(!ledger.is_present("Bob", date("2024-03-18")).unwrap());
    }

    #[test]
    fn test_write_error_leaves_state_intact() {
        let mut store = FlakyStore::new("mem:write-error");
        store.fail_appends = true;
        let ledger = Ledger::open(store).unwrap();

        let err = ledger.mark_present("Alice", at("2024-03-18 09:00:00")).unwrap_err();
        assert!(matches!(err, LedgerError::Write(_)));
        assert!(ledger.all_records().unwrap().is_empty());

        // Caller-driven retry once the fault clears.
        ledger.state.lock().unwrap().store.fail_appends = false;
        assert!(ledger.mark_present("Alice", at("2024-03-18 09:00:05")).unwrap().is_new());
    }

    #[test]
    fn test_malformed_rows_do_not_block_marking() {
        let mut store = FlakyStore::new("mem:malformed");
        store.rows = vec![
            Ok(AttendanceRecord::at("Alice", at("2024-03-18 08:00:00"))),
            Err(MalformedRecord { position: 2, reason: "garbage".into() }),
        ];
        let ledger = Ledger::open(store).unwrap();

        assert_eq!(ledger.malformed_count().unwrap(), 1);
        assert!(!ledger.mark_present("Alice", at("2024-03-18 09:00:00")).unwrap().is_new());
        assert!(ledger.mark_present("Bob", at("2024-03-18 09:00:00")).unwrap().is_new());
    }

    #[test]
    fn test_concurrent_same_key_marks_once() {
        let ledger = Ledger::open(FlakyStore::new("mem:concurrent")).unwrap();
        let when = at("2024-03-18 09:00:00");

        let results: Vec<MarkStatus> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| s.spawn(|| ledger.mark_present("Bob", when).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_new()).count(), 1);
        assert_eq!(results.len(), 16);
        assert_eq!(ledger.all_records().unwrap().len(), 1);
    }

    #[test]
    fn test_csv_ledger_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");

        {
            let ledger = Ledger::open(CsvStore::open(&path)).unwrap();
            ledger.mark_present("Alice", at("2024-03-18 09:00:00")).unwrap();
        }

        let ledger = Ledger::open(CsvStore::open(&path)).unwrap();
        let again = ledger.mark_present("Alice", at("2024-03-18 12:00:00")).unwrap();
        assert_eq!(again.record().time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert!(!again.is_new());
    }

    /// CSV store under its own lock key, as a second process would see it.
    struct SeparateProcess {
        key: String,
        inner: CsvStore,
    }

    impl LedgerStore for SeparateProcess {
        fn location(&self) -> &str {
            &self.key
        }

        fn refresh(&mut self) -> Result<Refresh, StoreError> {
            self.inner.refresh()
        }

        fn append(&mut self, record: &AttendanceRecord) -> Result<AppendOutcome, StoreError> {
            self.inner.append(record)
        }

        fn lock_exclusive(&self) -> Result<Option<StoreLock>, StoreError> {
            self.inner.lock_exclusive()
        }
    }

    #[test]
    fn test_file_lock_dedups_without_shared_process_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        let ledgers: Vec<_> = (0..4)
            .map(|i| {
                let store = SeparateProcess { key: format!("proc:{i}"), inner: CsvStore::open(&path) };
                Ledger::open(store).unwrap()
            })
            .collect();
        let when = at("2024-03-18 09:00:00");

        let marked = std::thread::scope(|s| {
            let handles: Vec<_> = ledgers
                .iter()
                .flat_map(|ledger| (0..4).map(move |_| ledger))
                .map(|ledger| s.spawn(move || ledger.mark_present("Bob", when).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).filter(MarkStatus::is_new).count()
        });

        assert_eq!(marked, 1);
        assert_eq!(Ledger::open(CsvStore::open(&path)).unwrap().all_records().unwrap().len(), 1);
    }

    #[test]
    fn test_location_lock_is_shared() {
        let a = location_lock("mem:shared");
        let b = location_lock("mem:shared");
        let c = location_lock("mem:other");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
