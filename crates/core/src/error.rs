/// Result alias that carries the custom [`BitesError`] type.
pub type Result<T> = std::result::Result<T, BitesError>;

/// Common error type for the core crate.
///
/// Only operations that report a failure result use it. Getters and the
/// real-time read paths return neutral values instead and log a warning.
#[derive(Debug, thiserror::Error)]
pub enum BitesError {
    /// A fixed-capacity structure (sensor table, driver bank, voice pool)
    /// is full.
    #[error("{what} capacity of {capacity} exceeded")]
    CapacityExceeded { what: &'static str, capacity: usize },
    /// The channel id is already registered.
    #[error("channel {0} is already registered")]
    DuplicateChannel(u8),
    /// The channel id is outside the valid range or not registered.
    #[error("invalid channel id {0}")]
    InvalidChannel(u8),
    #[error("invalid track id {0}")]
    InvalidTrack(u8),
    #[error("invalid note id {0}")]
    InvalidNote(u8),
    /// Every voice in the pool is active.
    #[error("voices exhausted")]
    VoicesExhausted,
    /// A device did not respond during init or calibration.
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),
    /// The scheduler could not spawn the named worker.
    #[error("failed to spawn worker `{worker}`: {source}")]
    WorkerSpawn {
        worker: &'static str,
        #[source]
        source: std::io::Error,
    },
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Free-form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
}

impl BitesError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Whether the error reports a full fixed-capacity structure.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::VoicesExhausted
        )
    }
}

impl From<&str> for BitesError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BitesError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
