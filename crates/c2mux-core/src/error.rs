use thiserror::Error;

/// Errors produced by the c2mux multiplexing layer.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("connection not found: {0}")]
    ConnectionNotFound(u64),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("too many pending calls ({0})")]
    TooManyPending(usize),

    #[error("tunnel not found: {0}")]
    TunnelNotFound(u64),

    #[error("tunnel closed: {0}")]
    TunnelClosed(u64),

    #[error("beacon not found: {0}")]
    BeaconNotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for MuxError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        MuxError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for MuxError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        MuxError::Codec(e.to_string())
    }
}

pub type MuxResult<T> = Result<T, MuxError>;
