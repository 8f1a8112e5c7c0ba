//! rollcall-core — Face-match attendance engine.
//!
//! Matches probe embeddings from an external face encoder against a gallery
//! of registered people, and records each match in an append-only ledger
//! that marks a person present at most once per calendar day.

pub mod gallery;
pub mod ledger;
pub mod sqlite;
pub mod store;
pub mod types;

pub use gallery::{Gallery, GalleryCache, GalleryDir, GalleryError, GallerySource};
pub use ledger::{Ledger, LedgerError, MarkStatus};
pub use sqlite::SqliteStore;
pub use store::{AppendOutcome, CsvStore, LedgerStore, MalformedRecord, Refresh, StoreError, StoreLock};
pub use types::{
    AttendanceRecord, Embedding, EuclideanMatcher, FaceEncodings, GalleryEntry, MatchResult, Matcher,
};

/// Distance cutoff used when none is configured.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;
