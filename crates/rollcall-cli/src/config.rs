use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which ledger backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Csv,
    Sqlite,
}

impl LedgerBackend {
    fn default_file_name(self) -> &'static str {
        match self {
            LedgerBackend::Csv => "attendance.csv",
            LedgerBackend::Sqlite => "attendance.db",
        }
    }
}

impl FromStr for LedgerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(LedgerBackend::Csv),
            "sqlite" => Ok(LedgerBackend::Sqlite),
            other => Err(format!("unknown ledger backend {other:?} (expected csv or sqlite)")),
        }
    }
}

impl std::fmt::Display for LedgerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerBackend::Csv => f.write_str("csv"),
            LedgerBackend::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// Optional `rollcall.toml` contents. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    gallery_dir: Option<PathBuf>,
    ledger_path: Option<PathBuf>,
    ledger_backend: Option<LedgerBackend>,
    match_threshold: Option<f32>,
}

/// CLI configuration: defaults, then the TOML file named by `ROLLCALL_CONFIG`,
/// then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for persistent data (default: `$XDG_DATA_HOME/rollcall`).
    pub data_dir: PathBuf,
    /// Directory of registered face encodings (default: `<data_dir>/gallery`).
    pub gallery_dir: PathBuf,
    /// Attendance ledger file (default: `<data_dir>/attendance.csv` or `.db`).
    pub ledger_path: PathBuf,
    pub ledger_backend: LedgerBackend,
    /// Euclidean distance below which a probe matches a registered face.
    pub match_threshold: f32,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration using `var` to look up environment variables.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file = match var("ROLLCALL_CONFIG") {
            Some(path) => read_file_config(Path::new(&path))?,
            None => FileConfig::default(),
        };

        let data_dir = var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&var));

        let ledger_backend = match var("ROLLCALL_LEDGER_BACKEND") {
            Some(v) => v.parse::<LedgerBackend>().map_err(anyhow::Error::msg)?,
            None => file.ledger_backend.unwrap_or(LedgerBackend::Csv),
        };

        let gallery_dir = var("ROLLCALL_GALLERY_DIR")
            .map(PathBuf::from)
            .or(file.gallery_dir)
            .unwrap_or_else(|| data_dir.join("gallery"));

        let ledger_path = var("ROLLCALL_LEDGER_PATH")
            .map(PathBuf::from)
            .or(file.ledger_path)
            .unwrap_or_else(|| data_dir.join(ledger_backend.default_file_name()));

        let match_threshold = env_f32(&var, "ROLLCALL_MATCH_THRESHOLD")
            .or(file.match_threshold)
            .unwrap_or(rollcall_core::DEFAULT_MATCH_THRESHOLD);

        let config = Self {
            data_dir,
            gallery_dir,
            ledger_path,
            ledger_backend,
            match_threshold,
        };
        config.validate()?;
        Ok(config)
    }

    /// Override the threshold (e.g. from a command-line flag).
    pub fn with_threshold(mut self, threshold: Option<f32>) -> Result<Self> {
        if let Some(t) = threshold {
            self.match_threshold = t;
            self.validate()?;
        }
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            bail!("match threshold must be a positive number, got {}", self.match_threshold);
        }
        Ok(())
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let src = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let file: FileConfig =
        toml::from_str(&src).with_context(|| format!("parsing config file {}", path.display()))?;
    tracing::debug!(path = %path.display(), ?file, "loaded config file");
    Ok(file)
}

fn default_data_dir(var: &impl Fn(&str) -> Option<String>) -> PathBuf {
    var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_f32(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<f32> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable number");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(vars(&[("HOME", "/home/ada")])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/home/ada/.local/share/rollcall"));
        assert_eq!(config.gallery_dir, config.data_dir.join("gallery"));
        assert_eq!(config.ledger_path, config.data_dir.join("attendance.csv"));
        assert_eq!(config.ledger_backend, LedgerBackend::Csv);
        assert_eq!(config.match_threshold, rollcall_core::DEFAULT_MATCH_THRESHOLD);
    }

    #[test]
    fn test_sqlite_backend_changes_default_ledger_name() {
        let config = Config::from_vars(vars(&[
            ("XDG_DATA_HOME", "/data"),
            ("ROLLCALL_LEDGER_BACKEND", "SQLite"),
        ]))
        .unwrap();
        assert_eq!(config.ledger_path, PathBuf::from("/data/rollcall/attendance.db"));
    }

    #[test]
    fn test_env_overrides_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("rollcall.toml");
        std::fs::write(
            &file,
            "data_dir = \"/srv/rollcall\"\nmatch_threshold = 0.5\nledger_backend = \"sqlite\"\n",
        )
        .unwrap();
        let file = file.to_string_lossy().into_owned();

        let config = Config::from_vars(vars(&[
            ("ROLLCALL_CONFIG", file.as_str()),
            ("ROLLCALL_MATCH_THRESHOLD", "0.45"),
        ]))
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/rollcall"));
        assert_eq!(config.ledger_backend, LedgerBackend::Sqlite);
        assert_eq!(config.match_threshold, 0.45);
    }

    #[test]
    fn test_bad_threshold_env_falls_back() {
        let config = Config::from_vars(vars(&[("HOME", "/h"), ("ROLLCALL_MATCH_THRESHOLD", "tight")])).unwrap();
        assert_eq!(config.match_threshold, rollcall_core::DEFAULT_MATCH_THRESHOLD);
    }

    #[test]
    fn test_rejects_non_positive_threshold() {
        let config = Config::from_vars(vars(&[("HOME", "/h")])).unwrap();
        assert!(config.clone().with_threshold(Some(0.0)).is_err());
        assert!(config.with_threshold(Some(0.55)).is_ok());
    }

    #[test]
    fn test_unknown_backend_is_error() {
        assert!(Config::from_vars(vars(&[("HOME", "/h"), ("ROLLCALL_LEDGER_BACKEND", "parquet")])).is_err());
    }

    #[test]
    fn test_unknown_file_key_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("rollcall.toml");
        std::fs::write(&file, "treshold = 0.5\n").unwrap();
        let file = file.to_string_lossy().into_owned();
        assert!(Config::from_vars(vars(&[("HOME", "/h"), ("ROLLCALL_CONFIG", file.as_str())])).is_err());
    }
}
