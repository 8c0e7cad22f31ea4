//! Error types for the Neutron runtime

use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds reported by the runtime
#[derive(Error, Debug)]
pub enum Error {
    /// Bad user input (unknown tensor name, wrong vector length, bad size)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unsupported file-format version, missing sections, inconsistent graph
    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// Engine disposed, pool exhausted, operation in a wrong state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Driver returned an error, firmware signalled an error event
    #[error("Device I/O error: {0}")]
    DeviceIo(String),

    /// Buffer acquire timed out; a true deadlock
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Model path missing
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Optional daemon mode unreachable or failed
    #[error("Service I/O error: {0}")]
    ServiceIo(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Model package deserialization error
    #[error("Model decode error: {0}")]
    ModelDecode(#[from] bincode::Error),
}

impl Error {
    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create a device I/O error
    pub fn device_io(msg: impl Into<String>) -> Self {
        Error::DeviceIo(msg.into())
    }

    /// Whether retrying the same call can succeed once load drains
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ResourceExhausted(_) | Error::InvalidOperation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::ResourceExhausted("pool".into()).is_transient());
        assert!(!Error::InvalidModel("bad".into()).is_transient());
    }

    #[test]
    fn test_display_carries_kind() {
        let err = Error::DeviceIo("write failed".into());
        assert!(err.to_string().contains("Device I/O"));
    }
}
