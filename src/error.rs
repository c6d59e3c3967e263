//! Error types for focusfield.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FocusFieldError {
    // Configuration errors (fatal at startup)
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Geometry errors
    #[error("Array geometry inconsistent: {message}")]
    GeometryInvalid { message: String },

    // Bus errors
    #[error("Bus is shut down")]
    BusShutDown,

    // Runtime faults (recovered locally)
    #[error("DOA estimator fault: {message}")]
    DoaFault { message: String },

    #[error("Beamformer fault: {message}")]
    BeamformFault { message: String },

    // Invariant violations (crash dump + orderly shutdown)
    #[error("Invariant violation in {module}: {message}")]
    InvariantViolation { module: String, message: String },

    // Sink errors
    #[error("Output sink failed: {message}")]
    SinkFailed { message: String },

    // Wire format errors
    #[error("Wire format error: {0}")]
    Wire(#[from] serde_json::Error),

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, FocusFieldError>;

impl FocusFieldError {
    /// True for faults that must abort startup.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            FocusFieldError::ConfigFileNotFound { .. }
                | FocusFieldError::ConfigInvalidValue { .. }
                | FocusFieldError::Config(_)
                | FocusFieldError::GeometryInvalid { .. }
        )
    }

    /// True for invariant violations that require a crash dump.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, FocusFieldError::InvariantViolation { .. })
    }
}
