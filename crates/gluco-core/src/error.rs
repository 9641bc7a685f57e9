//! Unified error types for the gluco core library.
//!
//! This module provides a unified error type [`CoreError`] that covers the failure
//! modes that can surface through the public API. Module-specific errors
//! ([`DecodeError`](crate::wire::DecodeError), [`ConfigError`](crate::config::ConfigError))
//! are used internally and convert into [`CoreError`].
//!
//! Most of the core never fails loudly: a packet that does not decode is simply
//! `None`, and a calibration that cannot be computed yet is also `None`. The
//! variants here cover what remains: configuration, numeric degeneracy that a
//! caller asked to see explicitly, and I/O around configuration files.
//!
//! # Example
//!
//! ```rust
//! use gluco_core::error::{CoreError, Result};
//!
//! fn invert(variance: f64) -> Result<f64> {
//!     if variance.abs() < f64::EPSILON {
//!         return Err(CoreError::SingularCovariance);
//!     }
//!     Ok(1.0 / variance)
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for gluco core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    // =========================================================================
    // WIRE CODEC ERRORS
    // =========================================================================
    /// A transmitter message could not be decoded.
    #[error("Failed to decode transmitter message: {0}")]
    Decode(#[from] crate::wire::DecodeError),

    /// A payload is too large to be split into protocol fragments.
    #[error("Payload of {len} bytes needs more than 255 fragments of {max_packet} bytes")]
    PayloadTooLarge {
        /// Payload length in bytes.
        len: usize,
        /// Negotiated maximum packet size.
        max_packet: usize,
    },

    // =========================================================================
    // NUMERIC ERRORS
    // =========================================================================
    /// A covariance matrix that must be inverted is singular.
    #[error("Residual covariance is singular and cannot be inverted")]
    SingularCovariance,

    /// Matrix operands do not have compatible dimensions.
    #[error("Matrix dimension mismatch: {left:?} vs {right:?}")]
    DimensionMismatch {
        /// Rows and columns of the left operand.
        left: (usize, usize),
        /// Rows and columns of the right operand.
        right: (usize, usize),
    },

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // I/O ERRORS
    // =========================================================================
    /// An error occurred while reading or writing configuration data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for gluco core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Returns `true` if this error came from the wire codec.
    #[inline]
    #[must_use]
    pub const fn is_codec_error(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::PayloadTooLarge { .. })
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is a numeric degeneracy.
    #[inline]
    #[must_use]
    pub const fn is_numeric_error(&self) -> bool {
        matches!(
            self,
            Self::SingularCovariance | Self::DimensionMismatch { .. }
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if the caller can simply wait for more data and retry.
    ///
    /// Corrupted packets are retransmitted or superseded by the next
    /// notification, and a singular step is followed by a regular one.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::SingularCovariance)
    }

    /// Returns a machine-readable error code.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "DECODE_FAILED",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::SingularCovariance => "SINGULAR_COVARIANCE",
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for CoreError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {}: {}", path.display(), source))
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
