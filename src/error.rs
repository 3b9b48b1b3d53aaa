use std::path::PathBuf;

/// Errors raised while reading or mutating durable state.
///
/// Categories:
/// - Config: bad or missing configuration, fatal before any worker is touched
/// - Record: a single record could not be read or written; the cycle continues
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    // Config -- fatal at startup
    #[error("No project configs (*-issues.json) found in {0}")]
    NoConfigs(PathBuf),

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to parse settings {path}: {source}")]
    Settings {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config validation failed:\n{0}")]
    Invalid(String),

    // Record -- log and continue
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Issue #{number} not found in {path}")]
    IssueNotFound { number: u32, path: PathBuf },

    #[error("Issue #{number} already exists in {path}")]
    DuplicateIssue { number: u32, path: PathBuf },
}

impl FleetError {
    /// Returns true if the error means the fleet cannot start at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FleetError::NoConfigs(_)
                | FleetError::Parse { .. }
                | FleetError::Settings { .. }
                | FleetError::Invalid(_)
        )
    }
}

/// Lets `?` lift a `FleetError` into the `Result<T, String>` used by the
/// CLI handlers and adapters.
impl From<FleetError> for String {
    fn from(err: FleetError) -> String {
        err.to_string()
    }
}
