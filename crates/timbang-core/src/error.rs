//! Unified error types for the timbang core library.
//!
//! This module provides a unified error type [`TimbangError`] that covers all
//! failure modes surfaced to callers of the scanner and session. Each module
//! also has its own specific error type (`DecodeError`, `TransportError`,
//! `StoreError`, `SettingsError`) for internal use.
//!
//! # Propagation
//!
//! - **Lifecycle errors** (`connect`, `auto_connect`, `scan`, `read_weight`)
//!   are returned as typed variants
//! - **Streamed decode errors** never surface here; the session logs and drops them
//! - **Teardown errors** are logged by `destroy` and never returned
//!
//! # Example
//!
//! ```rust
//! use timbang_core::error::{Result, TimbangError};
//! use timbang_core::LicenseKey;
//!
//! fn require_binding(found: bool, key: &LicenseKey) -> Result<()> {
//!     if !found {
//!         return Err(TimbangError::NoSavedConfiguration(key.clone()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::config::SettingsError;
use crate::decoder::DecodeError;
use crate::storage::StoreError;
use crate::transport::{AdapterState, TransportError};
use crate::types::{DeviceId, LicenseKey};

/// The underlying reason a connect sequence was rolled back.
#[derive(Debug, Error)]
pub enum ConnectFailure {
    /// A transport step (connect, discovery, subscribe) failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The license binding could not be persisted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The unified error type for all timbang operations.
#[derive(Debug, Error)]
pub enum TimbangError {
    // =========================================================================
    // SESSION LIFECYCLE ERRORS
    // =========================================================================
    /// The Bluetooth adapter is off, missing or not authorised.
    #[error("Bluetooth is unavailable (adapter state: {0:?}). Turn Bluetooth on and retry.")]
    TransportUnavailable(AdapterState),

    /// A step of the connect sequence failed; the session was rolled back to idle.
    #[error("Failed to connect to scale {device_id}: {source}")]
    ConnectionFailed {
        /// Device the connect was attempted for.
        device_id: DeviceId,
        /// What went wrong.
        #[source]
        source: ConnectFailure,
    },

    /// Auto-connect was requested but no usable binding exists.
    #[error("No saved scale for license '{0}'. Scan and connect to a scale first.")]
    NoSavedConfiguration(LicenseKey),

    /// The operation requires a connected scale.
    #[error("No scale is connected")]
    NotConnected,

    /// A one-shot read returned a malformed measurement.
    #[error("Failed to decode weight measurement: {0}")]
    DecodeFailed(#[from] DecodeError),

    // =========================================================================
    // COLLABORATOR ERRORS
    // =========================================================================
    /// A transport operation outside the connect sequence failed.
    #[error("Bluetooth transport error: {0}")]
    Transport(TransportError),

    /// The binding store failed.
    #[error("Binding store error: {0}")]
    Store(#[from] StoreError),

    /// Settings could not be loaded or were invalid.
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for timbang operations.
pub type Result<T> = std::result::Result<T, TimbangError>;

impl TimbangError {
    /// Wrap a transport failure that happened while connecting.
    pub fn connection_failed(device_id: &DeviceId, source: impl Into<ConnectFailure>) -> Self {
        Self::ConnectionFailed {
            device_id: device_id.clone(),
            source: source.into(),
        }
    }

    /// Returns `true` if this error originates in the Bluetooth transport.
    #[inline]
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable(_)
                | Self::Transport(_)
                | Self::ConnectionFailed {
                    source: ConnectFailure::Transport(_),
                    ..
                }
        )
    }

    /// Returns `true` if the caller can simply retry the same operation.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. } | Self::DecodeFailed(_))
    }

    /// Returns `true` if the caller should fall back to scan + connect.
    #[inline]
    #[must_use]
    pub const fn requires_rescan(&self) -> bool {
        matches!(self, Self::NoSavedConfiguration(_))
    }

    /// Returns a machine-readable error code.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::TransportUnavailable(_) => "TRANSPORT_UNAVAILABLE",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::NoSavedConfiguration(_) => "NO_SAVED_CONFIGURATION",
            Self::NotConnected => "NOT_CONNECTED",
            Self::DecodeFailed(_) => "DECODE_FAILED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Settings(_) => "SETTINGS_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<TransportError> for TimbangError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable { state } => Self::TransportUnavailable(state),
            other => Self::Transport(other),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_unavailable_transport_maps_to_taxonomy() {
        let err: TimbangError = TransportError::Unavailable {
            state: AdapterState::PoweredOff,
        }
        .into();
        assert!(matches!(
            err,
            TimbangError::TransportUnavailable(AdapterState::PoweredOff)
        ));
        assert!(err.is_transport_error());
    }

    #[test]
    fn test_other_transport_errors_are_wrapped() {
        let err: TimbangError = TransportError::Operation("le-connection-abort-by-local".into()).into();
        assert!(matches!(err, TimbangError::Transport(_)));
        assert_eq!(err.error_code(), "TRANSPORT_ERROR");
    }

    #[test]
    fn test_connection_failed_carries_cause() {
        let id = DeviceId::new("AA:BB:CC:DD:EE:FF");
        let err = TimbangError::connection_failed(
            &id,
            TransportError::DeviceNotFound { id: id.clone() },
        );
        assert!(err.is_transport_error());
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("AA:BB:CC:DD:EE:FF"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_no_saved_configuration_requires_rescan() {
        let err = TimbangError::NoSavedConfiguration(LicenseKey::new("LIC-9"));
        assert!(err.requires_rescan());
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("LIC-9"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(TimbangError::NotConnected.error_code(), "NOT_CONNECTED");
        assert_eq!(
            TimbangError::DecodeFailed(DecodeError::TooShort { len: 1 }).error_code(),
            "DECODE_FAILED"
        );
        assert_eq!(
            TimbangError::TransportUnavailable(AdapterState::Unsupported).error_code(),
            "TRANSPORT_UNAVAILABLE"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoErr::new(ErrorKind::NotFound, "file not found");
        let err: TimbangError = io_err.into();
        assert!(matches!(err, TimbangError::Io(_)));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<TimbangError>();
        assert_sync::<TimbangError>();
    }
}
