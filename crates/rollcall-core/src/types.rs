use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// Calendar date format used by the ledger (e.g. "2024-03-18").
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Time-of-day format used by the ledger (e.g. "09:00:00").
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Face embedding vector (typically 128-dimensional, fixed by the external encoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Encoder that produced this embedding, if the producer recorded it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Embeddings of different dimension, or with non-finite values that make
    /// the distance NaN, are infinitely far apart.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        let dist = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt();
        if dist.is_nan() {
            f32::INFINITY
        } else {
            dist
        }
    }
}

/// Everything the external encoder found in one image: one embedding per detected face,
/// in detection order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaceEncodings {
    pub faces: Vec<Embedding>,
}

impl FaceEncodings {
    pub fn from_json(src: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(src)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// One registered person and their reference embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub name: String,
    pub embedding: Embedding,
}

/// One "marked present" row. At most one exists per (name, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub name: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl AttendanceRecord {
    /// Record for `name` at `when`, truncated to whole seconds.
    pub fn at(name: impl Into<String>, when: NaiveDateTime) -> Self {
        let time = when.time();
        Self {
            name: name.into(),
            date: when.date(),
            time: time.with_nanosecond(0).unwrap_or(time),
        }
    }

    pub fn date_string(&self) -> String {
        self.date.format(DATE_FORMAT).to_string()
    }

    pub fn time_string(&self) -> String {
        self.time.format(TIME_FORMAT).to_string()
    }
}

/// Outcome of matching one probe embedding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    /// Nothing is registered yet. Callers should prompt for registration.
    EmptyGallery,
    /// Closest entry was within the threshold.
    Match { name: String, distance: f32 },
    /// Closest entry was too far away; its distance is kept for diagnostics.
    Unknown { closest_distance: f32 },
}

impl MatchResult {
    pub fn name(&self) -> Option<&str> {
        match self {
            MatchResult::Match { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of registered faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// A probe is accepted iff its closest gallery entry is strictly closer than
/// `threshold`. This one rule covers both the "compare with tolerance" and the
/// "raw distance against a cutoff" conventions: a tolerance of 0.6 and a cutoff
/// of 0.6 are the same threshold here. Ties go to the earlier gallery entry.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let mut entries = gallery.iter();
        let Some(first) = entries.next() else {
            return MatchResult::EmptyGallery;
        };

        let mut best = first;
        let mut best_dist = probe.euclidean_distance(&first.embedding);

        for entry in entries {
            let dist = probe.euclidean_distance(&entry.embedding);
            // Strict comparison keeps the first of equidistant entries.
            if dist < best_dist {
                best_dist = dist;
                best = entry;
            }
        }

        if best_dist < threshold {
            MatchResult::Match {
                name: best.name.clone(),
                distance: best_dist,
            }
        } else {
            MatchResult::Unknown {
                closest_distance: best_dist,
            }
        }
    }
}
