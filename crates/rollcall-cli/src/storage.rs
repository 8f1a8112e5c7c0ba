//! Where the gallery and ledger live for this run.
//!
//! The configured locations are used when writable. Otherwise everything moves
//! to a temporary directory, seeded with a copy of the configured gallery, so
//! registration and check-in keep working on read-only deployments. Every run
//! with the same configuration shares that directory.

use crate::config::Config;
use anyhow::{Context, Result};
use rollcall_core::GalleryDir;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

const TEMP_PREFIX: &str = "rollcall_";
const PROBE_FILE: &str = ".rollcall-write-probe";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub gallery_dir: PathBuf,
    pub ledger_path: PathBuf,
    /// True when running from the temporary copy; it does not survive a reboot.
    pub is_temp: bool,
    /// Gallery files copied into the temporary directory by this run.
    pub copied: usize,
}

impl StorageLayout {
    pub fn resolve(config: &Config) -> Result<Self> {
        Self::resolve_in(config, &std::env::temp_dir())
    }

    /// Like [`resolve`](Self::resolve), falling back to a directory under `temp_base`.
    pub fn resolve_in(config: &Config, temp_base: &Path) -> Result<Self> {
        match check_writable(config) {
            Ok(()) => Ok(Self {
                gallery_dir: config.gallery_dir.clone(),
                ledger_path: config.ledger_path.clone(),
                is_temp: false,
                copied: 0,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "configured storage is not writable; switching to a temporary directory");
                Self::temporary(config, temp_base)
            }
        }
    }

    /// Temporary storage for `config`. The directory name depends only on the
    /// configured locations, so later runs pick up the same gallery and ledger.
    /// It is seeded with the configured gallery once, when first created.
    fn temporary(config: &Config, temp_base: &Path) -> Result<Self> {
        let root = temp_base.join(format!("{TEMP_PREFIX}{:016x}", storage_key(config)));
        let copied = if root.is_dir() {
            tracing::debug!(root = %root.display(), "reusing temporary storage");
            0
        } else {
            seed(config, temp_base, &root)?
        };

        let file_name = config
            .ledger_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("attendance.csv"));

        tracing::info!(root = %root.display(), copied, "using temporary storage");
        Ok(Self {
            gallery_dir: root.join("gallery"),
            ledger_path: root.join(file_name),
            is_temp: true,
            copied,
        })
    }
}

fn storage_key(config: &Config) -> u64 {
    let mut hasher = DefaultHasher::new();
    config.data_dir.hash(&mut hasher);
    config.gallery_dir.hash(&mut hasher);
    config.ledger_path.hash(&mut hasher);
    hasher.finish()
}

/// Build the temporary root in a staging directory and move it into place, so
/// a concurrent run never sees a half-copied gallery.
fn seed(config: &Config, temp_base: &Path, root: &Path) -> Result<usize> {
    std::fs::create_dir_all(temp_base).with_context(|| format!("creating {}", temp_base.display()))?;
    let staging = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempdir_in(temp_base)
        .context("creating temporary storage directory")?;

    let gallery_dir = staging.path().join("gallery");
    std::fs::create_dir_all(&gallery_dir).with_context(|| format!("creating {}", gallery_dir.display()))?;
    let copied = copy_gallery(&config.gallery_dir, &gallery_dir);

    match std::fs::rename(staging.path(), root) {
        Ok(()) => {
            let _ = staging.keep();
            Ok(copied)
        }
        // Lost the race to another run; its copy is as good as ours.
        Err(_) if root.is_dir() => Ok(0),
        Err(e) => Err(e).with_context(|| format!("moving temporary storage to {}", root.display())),
    }
}

fn check_writable(config: &Config) -> std::io::Result<()> {
    probe_dir(&config.gallery_dir)?;
    if let Some(parent) = config.ledger_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        probe_dir(parent)?;
    }
    if config.ledger_path.exists() {
        std::fs::OpenOptions::new()
            .append(true)
            .open(&config.ledger_path)?;
    }
    Ok(())
}

fn probe_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(PROBE_FILE);
    std::fs::write(&probe, b"probe")?;
    std::fs::remove_file(&probe)
}

/// Copy gallery files from `from` into `to`. Files that fail to copy are skipped.
fn copy_gallery(from: &Path, to: &Path) -> usize {
    let files = match GalleryDir::new(from).files() {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!(error = %e, "cannot list configured gallery; starting empty");
            return 0;
        }
    };

    let mut copied = 0;
    for src in files {
        let Some(name) = src.file_name() else { continue };
        match std::fs::copy(&src, to.join(name)) {
            Ok(_) => copied += 1,
            Err(e) => tracing::warn!(path = %src.display(), error = %e, "failed to copy gallery file"),
        }
    }
    copied
}
