use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use rollcall_core::{
    CsvStore, EuclideanMatcher, FaceEncodings, GalleryCache, GalleryDir, Ledger, LedgerStore, MarkStatus,
    MatchResult, Matcher, SqliteStore,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;
mod storage;

use config::{Config, LedgerBackend};
use storage::StorageLayout;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-match attendance: register faces, check in, review the log")]
struct Cli {
    /// Match threshold: a face matches if its distance is strictly below this
    #[arg(long, global = true)]
    threshold: Option<f32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a person from the encodings of a photo with exactly one face
    Register {
        /// Full name of the person
        #[arg(short, long)]
        name: String,
        /// Encodings JSON produced by the face encoder
        encodings: PathBuf,
    },
    /// Match every face in an encodings file and mark matches present
    CheckIn {
        /// Encodings JSON produced by the face encoder
        encodings: PathBuf,
        /// Record the check-in at this local time instead of now ("YYYY-MM-DD HH:MM:SS")
        #[arg(long, value_parser = parse_timestamp)]
        at: Option<NaiveDateTime>,
    },
    /// Show attendance records
    Log {
        /// Only show records for this day (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
        #[arg(long)]
        json: bool,
    },
    /// List registered people
    Gallery {
        #[arg(long)]
        json: bool,
    },
    /// Show storage and matching settings
    Status,
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map_err(|e| format!("{e} (expected YYYY-MM-DD HH:MM:SS)"))
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("{e} (expected YYYY-MM-DD)"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?.with_threshold(cli.threshold)?;
    let layout = StorageLayout::resolve(&config)?;
    tracing::debug!(?config, ?layout, "resolved storage");

    let gallery = GalleryCache::new(GalleryDir::new(&layout.gallery_dir));

    match cli.command {
        Commands::Register { name, encodings } => {
            let encodings = read_encodings(&encodings)?;
            let entry = gallery
                .register(&name, &encodings)
                .with_context(|| format!("registering {name:?}"))?;
            println!("Registered {} ({} registered)", entry.name, gallery.get()?.len());
        }
        Commands::CheckIn { encodings, at } => {
            let encodings = read_encodings(&encodings)?;
            let ledger = open_ledger(config.ledger_backend, &layout.ledger_path)?;
            let when = at.unwrap_or_else(|| Local::now().naive_local());
            check_in(&gallery, &ledger, &encodings, config.match_threshold, when)?;
        }
        Commands::Log { date, json } => {
            let ledger = open_ledger(config.ledger_backend, &layout.ledger_path)?;
            let records = match date {
                Some(date) => ledger.records_on(date)?,
                None => ledger.all_records()?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No attendance recorded");
            } else {
                println!("Name,Time,Date");
                for r in &records {
                    println!("{},{},{}", r.name, r.time_string(), r.date_string());
                }
            }
        }
        Commands::Gallery { json } => {
            let current = gallery.get()?;
            let names: Vec<&str> = current.names().collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else if names.is_empty() {
                println!("No faces registered");
            } else {
                for name in names {
                    println!("{name}");
                }
            }
        }
        Commands::Status => {
            let current = gallery.get()?;
            let ledger = open_ledger(config.ledger_backend, &layout.ledger_path)?;
            let status = serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "storage": if layout.is_temp { "temporary" } else { "persistent" },
                "copied_gallery_files": layout.copied,
                "data_dir": config.data_dir,
                "gallery_dir": layout.gallery_dir,
                "ledger_path": layout.ledger_path,
                "ledger_backend": config.ledger_backend.to_string(),
                "match_threshold": config.match_threshold,
                "registered": current.len(),
                "records": ledger.all_records()?.len(),
                "malformed_records": ledger.malformed_count()?,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn read_encodings(path: &Path) -> Result<FaceEncodings> {
    let src = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    FaceEncodings::from_json(&src).with_context(|| format!("parsing encodings in {}", path.display()))
}

fn open_ledger(backend: LedgerBackend, path: &Path) -> Result<Ledger<Box<dyn LedgerStore>>> {
    let store: Box<dyn LedgerStore> = match backend {
        LedgerBackend::Csv => Box::new(CsvStore::open(path)),
        LedgerBackend::Sqlite => Box::new(
            SqliteStore::open(path).with_context(|| format!("opening {}", path.display()))?,
        ),
    };
    Ledger::open(store).with_context(|| format!("opening ledger {}", path.display()))
}

/// Match each face in `encodings` and mark matched people present at `when`.
fn check_in<S: LedgerStore>(
    gallery: &GalleryCache<GalleryDir>,
    ledger: &Ledger<S>,
    encodings: &FaceEncodings,
    threshold: f32,
    when: NaiveDateTime,
) -> Result<()> {
    if encodings.faces.is_empty() {
        println!("No face detected in check-in image");
        return Ok(());
    }

    let current = gallery.get()?;
    let mut failures = 0usize;

    for (i, probe) in encodings.faces.iter().enumerate() {
        match EuclideanMatcher.compare(probe, current.entries(), threshold) {
            MatchResult::EmptyGallery => {
                println!("No faces registered yet; run `rollcall register` first");
                return Ok(());
            }
            MatchResult::Unknown { closest_distance } => {
                tracing::info!(face = i, closest_distance, threshold, "face not recognized");
                println!("Face {}: not recognized (closest distance {closest_distance:.2})", i + 1);
            }
            MatchResult::Match { name, distance } => match ledger.mark_present(&name, when) {
                Ok(MarkStatus::Marked(r)) => {
                    println!("Welcome, {name}! Checked in at {} (distance {distance:.2})", r.time_string());
                }
                Ok(MarkStatus::AlreadyMarked(r)) => {
                    println!("{name} already checked in today at {}", r.time_string());
                }
                Err(e) => {
                    tracing::error!(name = %name, error = %e, "could not record attendance");
                    println!("{name}: could not record attendance: {e}");
                    failures += 1;
                }
            },
        }
    }

    if failures > 0 {
        bail!("{failures} check-in(s) could not be recorded");
    }
    Ok(())
}
