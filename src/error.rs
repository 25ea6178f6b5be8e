//! Error types for ADS system service operations.
//!
//! Every fallible operation in this crate returns [`Result<T>`], whose error
//! side is [`AdsError`]. The variants map onto the failure classes a caller
//! has to tell apart:
//!
//! | Variant | Meaning |
//! |---------|---------|
//! | [`AdsError::Protocol`] | The device answered with a non-success result code |
//! | [`AdsError::Decode`] | A response payload did not fit the expected layout |
//! | [`AdsError::Cancelled`] | The caller's cancellation token fired |
//! | [`AdsError::Timeout`] | A bounded wait elapsed |
//! | [`AdsError::Transport`] | The session could not be opened or was dropped |
//! | [`AdsError::InvalidParameter`] | A request was rejected before it was sent |

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for ADS operations.
pub type Result<T> = std::result::Result<T, AdsError>;

/// Numeric result code returned by an ADS device.
///
/// Zero means success. The associated constants cover the codes this crate
/// inspects; anything else is still carried through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdsErrorCode(pub u32);

impl AdsErrorCode {
    /// No error.
    pub const NO_ERROR: Self = Self(0);
    /// Internal router error.
    pub const ROUTER_ERROR: Self = Self(0x0001);
    /// Target port not found.
    pub const TARGET_PORT_NOT_FOUND: Self = Self(0x0006);
    /// Target machine not found.
    pub const TARGET_MACHINE_NOT_FOUND: Self = Self(0x0007);
    /// General device error.
    pub const DEVICE_ERROR: Self = Self(0x0700);
    /// Service is not supported by the server.
    pub const SERVICE_NOT_SUPPORTED: Self = Self(0x0701);
    /// Invalid index group.
    pub const INVALID_INDEX_GROUP: Self = Self(0x0702);
    /// Invalid index offset.
    pub const INVALID_INDEX_OFFSET: Self = Self(0x0703);
    /// Reading or writing not permitted.
    pub const ACCESS_DENIED: Self = Self(0x0704);
    /// Parameter size not correct.
    pub const INVALID_SIZE: Self = Self(0x0705);
    /// Invalid data values.
    pub const INVALID_DATA: Self = Self(0x0706);
    /// Device is not ready to operate.
    pub const NOT_READY: Self = Self(0x0707);
    /// Device is busy.
    pub const BUSY: Self = Self(0x0708);
    /// Not found (files, routes, enumeration end).
    pub const NOT_FOUND: Self = Self(0x070C);
    /// Object already exists.
    pub const ALREADY_EXISTS: Self = Self(0x070F);
    /// Client request timed out.
    pub const CLIENT_TIMEOUT: Self = Self(0x0745);

    /// Returns the raw numeric code.
    pub fn code(self) -> u32 {
        self.0
    }

    /// Returns `true` for [`AdsErrorCode::NO_ERROR`].
    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for AdsErrorCode {
    fn from(code: u32) -> Self {
        Self(code)
    }
}

impl fmt::Display for AdsErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X} ({})", self.0, ads_error_description(*self))
    }
}

/// Returns a human-readable description for an ADS result code.
///
/// # Example
///
/// ```
/// use ads_utilities::{ads_error_description, AdsErrorCode};
///
/// assert_eq!(ads_error_description(AdsErrorCode::NOT_FOUND), "not found");
/// assert_eq!(ads_error_description(AdsErrorCode(0xFFFF)), "unknown error");
/// ```
pub fn ads_error_description(code: AdsErrorCode) -> &'static str {
    match code.0 {
        0x0000 => "no error",
        0x0001 => "internal router error",
        0x0006 => "target port not found",
        0x0007 => "target machine not found",
        0x0700 => "general device error",
        0x0701 => "service not supported",
        0x0702 => "invalid index group",
        0x0703 => "invalid index offset",
        0x0704 => "reading or writing not permitted",
        0x0705 => "parameter size not correct",
        0x0706 => "invalid data values",
        0x0707 => "device not ready",
        0x0708 => "device busy",
        0x070C => "not found",
        0x070F => "object already exists",
        0x0745 => "client timeout",
        _ => "unknown error",
    }
}

/// Errors that can occur during ADS communication.
#[derive(Debug, Error)]
pub enum AdsError {
    /// The device returned a non-success result code.
    #[error("ADS error {code}")]
    Protocol {
        /// Result code reported by the device.
        code: AdsErrorCode,
    },

    /// A response payload was shorter than its layout or otherwise malformed.
    #[error("Decode error: {reason}")]
    Decode {
        /// Description of the decode failure.
        reason: String,
    },

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// A bounded wait elapsed.
    #[error("Operation timed out")]
    Timeout,

    /// The session could not be established or was lost.
    #[error("Transport error: {reason}")]
    Transport {
        /// Description of the transport failure.
        reason: String,
    },

    /// I/O error reported by a transport implementation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid parameter provided.
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Name of the invalid parameter.
        parameter: String,
        /// Description of why the parameter is invalid.
        reason: String,
    },
}

impl AdsError {
    /// Creates a new `Protocol` error from a device result code.
    ///
    /// # Example
    ///
    /// ```
    /// use ads_utilities::{AdsError, AdsErrorCode};
    ///
    /// let err = AdsError::protocol(AdsErrorCode::NOT_FOUND);
    /// assert!(err.is_not_found());
    /// ```
    pub fn protocol(code: impl Into<AdsErrorCode>) -> Self {
        Self::Protocol { code: code.into() }
    }

    /// Creates a new `Decode` error.
    ///
    /// # Example
    ///
    /// ```
    /// use ads_utilities::AdsError;
    ///
    /// let err = AdsError::decode("record too short");
    /// ```
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Creates a new `Transport` error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidParameter` error.
    ///
    /// # Example
    ///
    /// ```
    /// use ads_utilities::AdsError;
    ///
    /// let err = AdsError::invalid_parameter("chunk_size", "must be greater than 0");
    /// ```
    pub fn invalid_parameter(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Returns the device result code for `Protocol` errors.
    pub fn code(&self) -> Option<AdsErrorCode> {
        match self {
            Self::Protocol { code } => Some(*code),
            _ => None,
        }
    }

    /// Returns `true` if the device reported "not found".
    ///
    /// Enumerations treat this as their normal end.
    pub fn is_not_found(&self) -> bool {
        self.code() == Some(AdsErrorCode::NOT_FOUND)
    }

    /// Returns `true` for [`AdsError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
