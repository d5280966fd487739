use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum BoothError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Capture failed: {0}")]
    Capture(String),
    #[error("Analysis failed: {0}")]
    Analysis(String),
    #[error("Transformation failed: {0}")]
    Transform(String),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for BoothError {
    fn from(err: sqlx::Error) -> Self {
        BoothError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BoothError {
    fn from(err: serde_json::Error) -> Self {
        BoothError::Storage(err.to_string())
    }
}

impl From<image::ImageError> for BoothError {
    fn from(err: image::ImageError) -> Self {
        BoothError::Capture(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Bridge call failed: {0}")]
    Host(String),
    #[error("Bridge callback {0} did not resolve within {1}s")]
    TimedOut(String, u64),
    #[error("Bridge call {0} was superseded by a newer request")]
    Superseded(String),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("HTTP {status}: {body}")]
pub struct HttpStatusError {
    pub status: StatusCode,
    pub body: String,
}
