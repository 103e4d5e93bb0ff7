use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl BusKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "session" => Some(Self::Session),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance threshold used when a request supplies none.
    pub match_threshold: f32,
    /// Bus to claim the service name on.
    pub bus: BusKind,
    /// Capacity of the request queue in front of the registry thread.
    pub request_queue: usize,
}

/// Optional TOML overlay, read from `FACEWHIZ_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    match_threshold: Option<f32>,
    bus: Option<BusKind>,
    request_queue: Option<usize>,
}

impl Config {
    /// Load configuration: defaults, then the TOML file named by
    /// `FACEWHIZ_CONFIG` (if set), then `FACEWHIZ_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("FACEWHIZ_CONFIG") {
            Ok(path) => Some(read_file(Path::new(&path))?),
            Err(_) => None,
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    fn resolve(file: Option<FileConfig>, env: impl Fn(&str) -> Option<String>) -> Self {
        let file = file.unwrap_or_default();

        let db_path = env("FACEWHIZ_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| default_data_dir(&env).join("facewhiz.sqlite"));

        let match_threshold = env_parse(&env, "FACEWHIZ_MATCH_THRESHOLD")
            .or(file.match_threshold)
            .filter(|t: &f32| !t.is_nan())
            .unwrap_or(facewhiz_core::DEFAULT_THRESHOLD);

        let bus = env("FACEWHIZ_BUS")
            .and_then(|v| BusKind::parse(&v))
            .or(file.bus)
            .unwrap_or(BusKind::Session);

        let request_queue = env_parse(&env, "FACEWHIZ_REQUEST_QUEUE")
            .or(file.request_queue)
            .filter(|n: &usize| *n > 0)
            .unwrap_or(16);

        Self {
            db_path,
            match_threshold,
            bus,
            request_queue,
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&src).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewhiz")
}

fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.trim().parse().ok())
}
