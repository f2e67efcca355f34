use thiserror::Error;

/// Code carried by `error` events synthesised from a failed driver call.
pub const DRIVER_ERROR: &str = "DRIVER_ERROR";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Bus is closed")]
    BusClosed,

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable machine-readable code, used on the wire in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Connection(_) => "CONNECTION_ERROR",
            Error::NotConnected(_) => "NOT_CONNECTED",
            Error::Timeout(_) => "TIMEOUT",
            Error::Driver(_) => DRIVER_ERROR,
            Error::BusClosed => "BUS_CLOSED",
            Error::IllegalState(_) => "ILLEGAL_STATE",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Driver("boom".into()).code(), "DRIVER_ERROR");
        assert_eq!(Error::BusClosed.code(), "BUS_CLOSED");
        assert_eq!(Error::NotConnected("ws-1".into()).code(), "NOT_CONNECTED");
    }

    #[test]
    fn test_display_format() {
        let err = Error::NotFound("image meta:Echo".to_string());
        assert_eq!(err.to_string(), "Not found: image meta:Echo");
    }
}
