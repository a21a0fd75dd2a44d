//! Unified error handling for canbench crates
//!
//! One error enum covers the codec, the signal database, the transceiver
//! session and the tooling around them, so a failure keeps its category
//! wherever it surfaces.

use thiserror::Error;

// ============================================================================
// CanError - Main error type
// ============================================================================

/// Main error type for all canbench crates
#[derive(Debug, Error)]
pub enum CanError {
    // ======================================
    // Schema Errors
    // ======================================
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // ======================================
    // Codec Errors
    // ======================================
    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Cannot encode signal '{signal}': {reason}")]
    Encode { signal: String, reason: String },

    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    TruncatedFrame { expected: usize, actual: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    // ======================================
    // Transceiver Errors
    // ======================================
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Channel start failed: {0}")]
    Start(String),

    #[error("Transmit failed with driver status {code}")]
    Transmit { code: u32 },

    #[error("Driver unavailable: running offline")]
    DriverAbsent,

    #[error("Driver binding error: {0}")]
    Driver(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    // ======================================
    // Tooling Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using CanError
pub type Result<T> = std::result::Result<T, CanError>;

impl CanError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Self::OutOfRange(msg.into())
    }

    pub fn encode(signal: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Encode {
            signal: signal.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Stable, machine friendly code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "PARSE_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::OutOfRange(_) => "OUT_OF_RANGE",
            Self::Encode { .. } => "ENCODE_ERROR",
            Self::TruncatedFrame { .. } => "TRUNCATED_FRAME",
            Self::InvalidFrame(_) => "INVALID_FRAME",
            Self::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
            Self::Start(_) => "START_ERROR",
            Self::Transmit { .. } => "TRANSMIT_ERROR",
            Self::DriverAbsent => "DRIVER_ABSENT",
            Self::Driver(_) => "DRIVER_BINDING",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Whether this error means the whole session is running without a driver
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::DriverAbsent)
    }
}
