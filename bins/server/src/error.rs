#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("stream: {0}")]
    Stream(#[from] fleet_api::StreamError),

    #[error("store: {0}")]
    Store(#[from] fleet_api::StoreError),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
