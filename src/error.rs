use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Protocol(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] secp256k1::Error),

    #[error("hex error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn event<S: Into<String>>(msg: S) -> Self {
        Self::InvalidEvent(msg.into())
    }
}
