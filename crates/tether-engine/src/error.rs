use tether_core::errors::UpstreamError;
use tether_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("{0}")]
    Internal(String),
}
