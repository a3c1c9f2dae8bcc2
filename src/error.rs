#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cache error: {0}")]
    Cache(String),

    #[error("audit error: {0}")]
    Audit(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("payload error: {0}")]
    Payload(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Short machine-readable kind tag, used by the CLI error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Cache(_) => "cache",
            Error::Audit(_) => "audit",
            Error::Prompt(_) => "prompt",
            Error::Payload(_) => "payload",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
