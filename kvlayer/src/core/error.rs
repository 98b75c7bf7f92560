use thiserror::Error;

/// Main error type for kvlayer operations
///
/// Every variant carries owned strings so the error is `Clone`: the result of a
/// single bulk flush is handed to every write batched into that flush.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("Failed to decode stored value for key {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("Storage driver error: {0}")]
    Driver(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Unsupported value: {0}")]
    UnsupportedValue(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Stored value for key {key} does not match the requested type: {reason}")]
    TypeMismatch { key: String, reason: String },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Unknown storage driver: {0}")]
    UnknownDriver(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database is closed")]
    Closed,
}

impl KvError {
    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "decode",
            Self::Driver(_) => "driver",
            Self::Io(_) => "io",
            Self::UnsupportedValue(_) => "unsupported_value",
            Self::InvalidValue(_) => "invalid_value",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::InvalidPath(_) => "invalid_path",
            Self::UnknownDriver(_) => "unknown_driver",
            Self::NotSupported(_) => "not_supported",
            Self::Config(_) => "config",
            Self::Closed => "closed",
        }
    }
}

impl From<std::io::Error> for KvError {
    fn from(e: std::io::Error) -> Self {
        KvError::Io(e.to_string())
    }
}

impl From<serde_yaml::Error> for KvError {
    fn from(e: serde_yaml::Error) -> Self {
        KvError::Config(e.to_string())
    }
}

/// Result type alias for kvlayer operations
pub type Result<T> = std::result::Result<T, KvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing file");
        let err: KvError = io.into();
        assert_eq!(err.kind(), "io");
        assert!(err.to_string().contains("missing file"));
    }

    #[test]
    fn test_error_is_cloneable_for_fan_out() {
        let err = KvError::Driver("connection reset".to_string());
        let copies: Vec<KvError> = (0..3).map(|_| err.clone()).collect();
        assert!(copies.iter().all(|e| *e == err));
    }
}
