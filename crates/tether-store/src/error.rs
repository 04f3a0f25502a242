use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A sub-chat's message document could not be encoded or decoded.
    #[error("message document: {0}")]
    Document(#[from] serde_json::Error),

    #[error("cannot create store directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}
