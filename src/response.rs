//! Result of a single addressed ADS call.
//!
//! A transport reports two things for every `read`, `write` or `read_write`:
//! the device's result code and, for reads, how many bytes the device
//! actually placed in the caller's buffer. [`AdsResponse`] carries both and
//! turns a failure code into an [`AdsError::Protocol`] via
//! [`check_error`](AdsResponse::check_error).
//!
//! Transport-level failures (the session dropped, the connect failed) never
//! produce an `AdsResponse`; they surface as `Err` from the transport call
//! itself.
//!
//! # Example
//!
//! ```
//! use ads_utilities::{AdsErrorCode, AdsResponse};
//!
//! let ok = AdsResponse::success(4);
//! assert!(ok.check_error().is_ok());
//!
//! let buffer = [1, 2, 3, 4, 0, 0];
//! assert_eq!(ok.data(&buffer), &[1, 2, 3, 4]);
//!
//! let failed = AdsResponse::error(AdsErrorCode::NOT_FOUND);
//! assert!(failed.check_error().unwrap_err().is_not_found());
//! ```

use crate::error::{AdsError, AdsErrorCode, Result};

/// Outcome of an addressed call as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdsResponse {
    /// Result code (0 = success).
    pub error_code: AdsErrorCode,
    /// Number of bytes written into the read buffer.
    pub read_bytes: usize,
}

impl AdsResponse {
    /// Creates a successful response with `read_bytes` bytes of data.
    pub fn success(read_bytes: usize) -> Self {
        Self {
            error_code: AdsErrorCode::NO_ERROR,
            read_bytes,
        }
    }

    /// Creates a failed response carrying `code`.
    pub fn error(code: impl Into<AdsErrorCode>) -> Self {
        Self {
            error_code: code.into(),
            read_bytes: 0,
        }
    }

    /// Returns whether the device reported success.
    pub fn is_success(&self) -> bool {
        self.error_code.is_success()
    }

    /// Validates the response and returns an error if it indicates failure.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::Protocol` carrying the device's result code.
    pub fn check_error(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(AdsError::protocol(self.error_code))
        }
    }

    /// Returns the valid prefix of `buffer`, clamped to its length.
    pub fn data<'a>(&self, buffer: &'a [u8]) -> &'a [u8] {
        &buffer[..self.read_bytes.min(buffer.len())]
    }
}
