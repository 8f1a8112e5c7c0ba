//! Registered faces: the in-memory gallery, its on-disk directory, and a
//! memoising cache with explicit invalidation.
//!
//! A gallery directory holds one `<stem>.json` [`FaceEncodings`] file per person.
//! The display name is derived from the file stem, so `Ada_Lovelace_Front.json`
//! registers "Ada Lovelace".

use crate::types::{Embedding, FaceEncodings, GalleryEntry};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

const GALLERY_EXTENSION: &str = "json";

/// Trailing stem segments that describe the photo pose rather than the person.
const POSE_KEYWORDS: [&str; 7] = ["front", "side", "down", "up", "left", "right", "profile"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("name {0:?} cannot be used as a gallery file name")]
    InvalidName(String),
    #[error("no face found in encodings")]
    NoFace,
    #[error("expected exactly one face, found {0}")]
    MultipleFaces(usize),
    #[error("embedding has no values")]
    EmptyEmbedding,
    #[error("embedding has {actual} dimensions, gallery uses {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("gallery I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encodings serialization: {0}")]
    Json(#[from] serde_json::Error),
}

/// Derive a display name from a gallery file stem.
///
/// A final `_`-separated segment naming a pose ("Front", "left", ...) is dropped,
/// then underscores become spaces.
pub fn display_name(stem: &str) -> String {
    let base = match stem.rsplit_once('_') {
        Some((head, last)) if !head.is_empty() && is_pose_segment(last) => head,
        _ => stem,
    };
    base.replace('_', " ")
}

fn is_pose_segment(segment: &str) -> bool {
    POSE_KEYWORDS.iter().any(|k| segment.eq_ignore_ascii_case(k))
}

/// File stem used when registering `name`.
pub fn file_stem(name: &str) -> String {
    name.trim().replace(' ', "_")
}

/// Ordered set of registered people, at most one entry per name.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, replacing any existing entry with the same name in place.
    /// Returns true if an entry was replaced.
    pub fn insert(&mut self, entry: GalleryEntry) -> bool {
        match self.entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => {
                *existing = entry;
                true
            }
            None => {
                self.entries.push(entry);
                false
            }
        }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&GalleryEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Embedding dimension shared by the gallery, if any entry exists.
    pub fn dim(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dim())
    }
}

/// Something that can produce the current gallery.
pub trait GallerySource {
    fn load(&self) -> Result<Gallery, GalleryError>;
}

/// Gallery backed by a directory of encodings files.
#[derive(Debug, Clone)]
pub struct GalleryDir {
    root: PathBuf,
}

impl GalleryDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Gallery files in file-name order. A missing directory has none.
    pub fn files(&self) -> Result<Vec<PathBuf>, GalleryError> {
        let read_dir = match std::fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(GalleryError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut files: Vec<PathBuf> = read_dir
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_gallery_file(p))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Register one person from the encoder output for their reference photo.
    ///
    /// The photo must contain exactly one face. Any existing file that loads as
    /// the same person (including pose-suffixed ones) is replaced.
    pub fn register(&self, name: &str, encodings: &FaceEncodings) -> Result<GalleryEntry, GalleryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GalleryError::EmptyName);
        }
        if name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
            return Err(GalleryError::InvalidName(name.to_string()));
        }
        let embedding = single_face(encodings)?;
        let stem = file_stem(name);
        let display = display_name(&stem);

        let current = self.load()?;
        let others = current.entries().iter().filter(|e| e.name != display);
        if let Some(expected) = others.map(|e| e.embedding.dim()).next() {
            if embedding.dim() != expected {
                return Err(GalleryError::DimensionMismatch {
                    expected,
                    actual: embedding.dim(),
                });
            }
        }

        std::fs::create_dir_all(&self.root).map_err(|source| GalleryError::Io {
            path: self.root.clone(),
            source,
        })?;

        let path = self.root.join(format!("{stem}.{GALLERY_EXTENSION}"));
        let stored = FaceEncodings {
            faces: vec![embedding.clone()],
        };
        std::fs::write(&path, stored.to_json()?).map_err(|source| GalleryError::Io {
            path: path.clone(),
            source,
        })?;

        for stale in self.files()? {
            let same_person = stale
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|s| display_name(s) == display);
            if stale == path || !same_person {
                continue;
            }
            std::fs::remove_file(&stale).map_err(|source| GalleryError::Io {
                path: stale.clone(),
                source,
            })?;
            let removed_name = &display;
            tracing::info!(name = %removed_name, path = %stale.display(), "removed superseded gallery file");
        }

        tracing::info!(name, path = %path.display(), dim = embedding.dim(), "registered face");

        Ok(GalleryEntry {
            name: display,
            embedding,
        })
    }

    fn load_file(path: &Path) -> Result<Option<Embedding>, GalleryError> {
        let src = std::fs::read_to_string(path).map_err(|source| GalleryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let encodings = FaceEncodings::from_json(&src)?;
        Ok(encodings.faces.into_iter().find(|f| !f.values.is_empty()))
    }
}

impl GallerySource for GalleryDir {
    /// Load every gallery file, taking the first face found in each.
    /// Unreadable or face-less files are skipped.
    fn load(&self) -> Result<Gallery, GalleryError> {
        let mut gallery = Gallery::new();

        for path in self.files()? {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let embedding = match Self::load_file(&path) {
                Ok(Some(embedding)) => embedding,
                Ok(None) => {
                    tracing::warn!(path = %path.display(), "no face in gallery file; skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable gallery file; skipping");
                    continue;
                }
            };

            let name = display_name(stem);
            tracing::debug!(name = %name, path = %path.display(), "loaded gallery entry");
            if gallery.insert(GalleryEntry { name: name.clone(), embedding }) {
                tracing::warn!(name = %name, path = %path.display(), "duplicate name in gallery; later file wins");
            }
        }

        tracing::info!(entries = gallery.len(), root = %self.root.display(), "gallery loaded");
        Ok(gallery)
    }
}

fn is_gallery_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(GALLERY_EXTENSION))
}

fn single_face(encodings: &FaceEncodings) -> Result<Embedding, GalleryError> {
    match encodings.faces.as_slice() {
        [] => Err(GalleryError::NoFace),
        [face] if face.values.is_empty() => Err(GalleryError::EmptyEmbedding),
        [face] => Ok(face.clone()),
        faces => Err(GalleryError::MultipleFaces(faces.len())),
    }
}

/// Memoised gallery. The loaded gallery is shared until [`invalidate`](Self::invalidate)
/// is called; registering through the cache invalidates it.
pub struct GalleryCache<S> {
    source: S,
    cached: Mutex<Option<Arc<Gallery>>>,
}

impl<S: GallerySource> GalleryCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Current gallery, loading it from the source on first use.
    pub fn get(&self) -> Result<Arc<Gallery>, GalleryError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(gallery) = cached.as_ref() {
            return Ok(Arc::clone(gallery));
        }
        let gallery = Arc::new(self.source.load()?);
        *cached = Some(Arc::clone(&gallery));
        Ok(gallery)
    }

    /// Drop the memoised gallery; the next [`get`](Self::get) reloads it.
    pub fn invalidate(&self) {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if cached.take().is_some() {
            tracing::debug!("gallery cache invalidated");
        }
    }
}

impl GalleryCache<GalleryDir> {
    pub fn register(&self, name: &str, encodings: &FaceEncodings) -> Result<GalleryEntry, GalleryError> {
        let entry = self.source.register(name, encodings)?;
        self.invalidate();
        Ok(entry)
    }
}
