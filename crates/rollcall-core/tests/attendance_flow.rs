use chrono::NaiveDateTime;
use rollcall_core::{
    CsvStore, Embedding, EuclideanMatcher, FaceEncodings, GalleryCache, GalleryDir, Ledger, MarkStatus,
    MatchResult, Matcher, SqliteStore, DEFAULT_MATCH_THRESHOLD,
};

fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

fn face(values: &[f32]) -> FaceEncodings {
    FaceEncodings { faces: vec![Embedding::new(values.to_vec())] }
}

#[test]
fn register_match_and_mark() {
    let tmp = tempfile::tempdir().unwrap();
    let gallery = GalleryCache::new(GalleryDir::new(tmp.path().join("gallery")));
    let ledger = Ledger::open(CsvStore::open(tmp.path().join("attendance.csv"))).unwrap();
    let probe = Embedding::new(vec![0.12, 0.49, 0.31]);

    // Nothing registered yet
    let current = gallery.get().unwrap();
    assert_eq!(
        EuclideanMatcher.compare(&probe, current.entries(), DEFAULT_MATCH_THRESHOLD),
        MatchResult::EmptyGallery
    );

    gallery.register("Ada Lovelace", &face(&[0.1, 0.5, 0.3])).unwrap();
    gallery.register("Alan Turing", &face(&[0.9, -0.2, 0.4])).unwrap();

    let current = gallery.get().unwrap();
    let result = EuclideanMatcher.compare(&probe, current.entries(), DEFAULT_MATCH_THRESHOLD);
    let name = result.name().expect("probe should match");
    assert_eq!(name, "Ada Lovelace");

    assert!(matches!(ledger.mark_present(name, at("2024-03-18 08:55:00")).unwrap(), MarkStatus::Marked(_)));
    assert!(matches!(
        ledger.mark_present(name, at("2024-03-18 08:56:00")).unwrap(),
        MarkStatus::AlreadyMarked(_)
    ));

    let stranger = Embedding::new(vec![-3.0, 3.0, -3.0]);
    assert!(matches!(
        EuclideanMatcher.compare(&stranger, current.entries(), DEFAULT_MATCH_THRESHOLD),
        MatchResult::Unknown { .. }
    ));
}

#[test]
fn concurrent_handles_on_one_csv_file_mark_once() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("attendance.csv");
    let when = at("2024-03-18 09:00:00");

    let ledgers: Vec<_> = (0..4)
        .map(|_| Ledger::open(CsvStore::open(&path)).unwrap())
        .collect();

    let marked = std::thread::scope(|s| {
        let handles: Vec<_> = ledgers
            .iter()
            .flat_map(|ledger| (0..4).map(move |_| ledger))
            .map(|ledger| s.spawn(move || ledger.mark_present("Bob", when).unwrap().is_new()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).filter(|new| *new).count()
    });

    assert_eq!(marked, 1);
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.matches("Bob,").count(), 1);
    for ledger in &ledgers {
        assert_eq!(ledger.all_records().unwrap().len(), 1);
    }
}

#[test]
fn corrupt_csv_line_does_not_block_others() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("attendance.csv");
    std::fs::write(&path, "Name,Time,Date\nAlice,09:00:00,2024-03-18\nthis is not a row\n").unwrap();

    let ledger = Ledger::open(CsvStore::open(&path)).unwrap();
    assert_eq!(ledger.malformed_count().unwrap(), 1);
    assert!(!ledger.mark_present("Alice", at("2024-03-18 10:00:00")).unwrap().is_new());
    assert!(ledger.mark_present("Carol", at("2024-03-18 10:00:00")).unwrap().is_new());
    assert_eq!(ledger.all_records().unwrap().len(), 2);
}

#[test]
fn sqlite_ledger_dedups_across_handles() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("ledger.db");

    let first = Ledger::open(SqliteStore::open(&path).unwrap()).unwrap();
    let second = Ledger::open(SqliteStore::open(&path).unwrap()).unwrap();

    assert!(first.mark_present("Grace", at("2024-03-18 09:00:00")).unwrap().is_new());
    let again = second.mark_present("Grace", at("2024-03-18 09:30:00")).unwrap();
    assert!(!again.is_new());
    assert_eq!(again.record().time_string(), "09:00:00");
}
