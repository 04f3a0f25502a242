use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings file unreadable: {0}")]
    Read(#[from] std::io::Error),
    /// Covers both malformed JSON and values of the wrong shape after merge.
    #[error("settings file rejected: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;
