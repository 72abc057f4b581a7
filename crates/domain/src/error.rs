/// Shared error type used across all Valet crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("endpoint {endpoint}: {message}")]
    Endpoint { endpoint: String, message: String },

    #[error("all endpoints failed")]
    AllEndpointsFailed,

    #[error("config: {0}")]
    Config(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("invalid task transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
