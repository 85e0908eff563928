use crate::domain::LifecycleState;

/// Result alias that carries the custom [`StateSyncError`] type.
pub type Result<T> = std::result::Result<T, StateSyncError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum StateSyncError {
    /// Free-form error message.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// A listening transport could not be bound. Fatal at initialization.
    #[error("failed to open listener on {address}:{port}: {source}")]
    Bind {
        address: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    /// A state payload did not have the encoded length of the target type.
    #[error("state payload is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    /// A packet on the wire could not be decoded.
    #[error("malformed packet: {0}")]
    Codec(&'static str),
    /// A domain operation was invoked in the wrong lifecycle state.
    #[error("domain `{domain}` is {actual:?}, operation requires {expected:?}")]
    Lifecycle {
        domain: String,
        expected: LifecycleState,
        actual: LifecycleState,
    },
    /// A domain that must be nested was initialized at the root.
    #[error("domain `{0}` must be initialized with a parent domain")]
    MissingParent(String),
    /// The encoded state does not fit the transport for the configured packet size.
    #[error("state payload of {size} bytes exceeds transport capacity of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl StateSyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for StateSyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for StateSyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
