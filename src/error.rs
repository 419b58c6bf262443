use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid slot date {value:?}: {source}")]
    Date {
        value: String,
        source: chrono::ParseError,
    },
    #[error("invalid slot time {value:?}: {source}")]
    Time {
        value: String,
        source: chrono::ParseError,
    },
    #[error("invalid slot identifier {0:?}")]
    SlotId(String),
    #[error("local time {0} does not exist in the activity timezone")]
    NonexistentLocalTime(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("no csrf token found on the reservation page")]
    MissingCsrfToken,
    #[error("malformed listing payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telegram api rejected the request: {0}")]
    Api(String),
    #[error("notifier is not configured: {0}")]
    NotConfigured(&'static str),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("environment variable '{0}' not found")]
    MissingEnv(String),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failure of a single poll cycle. Persisted state is untouched when one of
/// these is returned, except for `Storage` raised by the final write, where
/// the previous snapshot stays in place.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetch failed for {date}: {source}")]
    Fetch { date: String, source: FetchError },
    #[error("snapshot storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("notification failed: {0}")]
    Notify(#[from] NotifyError),
}
