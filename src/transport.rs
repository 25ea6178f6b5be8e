//! Abstract transport layer for ADS communication.
//!
//! This crate does not open sockets. Framing, AMS routing and TCP handling
//! belong to an external transport which is plugged in through two traits:
//!
//! - [`Connector`] opens a [`Session`] to an [`AmsAddress`].
//! - [`Session`] performs the addressed primitives (`read`, `write`,
//!   `read_write`) and manages device notifications.
//!
//! # Result reporting
//!
//! A session call returns `Err` only when the exchange itself failed (the
//! connection dropped, the call was cancelled). When the device answered, the
//! call returns `Ok(AdsResponse)` even if the device reported an error code;
//! the caller decides what that code means.
//!
//! # Notifications
//!
//! [`Session::add_notification`] takes a [`NotificationCallback`]. The
//! transport invokes it from its own delivery context, so callbacks must
//! return quickly and never block. Everything in this crate only enqueues
//! from a callback.
//!
//! # Cancellation
//!
//! Every request takes a [`CancellationToken`]. Implementations should stop
//! waiting for the device and return [`AdsError::Cancelled`](crate::AdsError)
//! once the token fires.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::address::AmsAddress;
use crate::error::Result;
use crate::response::AdsResponse;

/// How the device decides when to send a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransmissionMode {
    /// Send on every cycle.
    Cyclic,
    /// Send when the watched data changes, checked once per cycle.
    OnChange,
}

/// Settings for a device notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationSettings {
    /// Transmission mode.
    pub mode: TransmissionMode,
    /// Cycle time the device checks at.
    pub cycle_time: Duration,
    /// Maximum delay before a pending notification is sent.
    pub max_delay: Duration,
}

impl NotificationSettings {
    /// Cyclic notifications every `cycle_time`.
    pub fn cyclic(cycle_time: Duration) -> Self {
        Self {
            mode: TransmissionMode::Cyclic,
            cycle_time,
            max_delay: Duration::ZERO,
        }
    }

    /// On-change notifications checked every `cycle_time`.
    pub fn on_change(cycle_time: Duration) -> Self {
        Self {
            mode: TransmissionMode::OnChange,
            cycle_time,
            max_delay: Duration::ZERO,
        }
    }
}

/// One notification delivered by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Time stamp assigned by the device.
    pub timestamp: DateTime<Utc>,
    /// Raw payload.
    pub data: Vec<u8>,
}

/// Callback invoked by the transport for each notification.
pub type NotificationCallback = Arc<dyn Fn(Notification) + Send + Sync>;

/// Handle of a registered device notification.
///
/// Not `Clone`: the handle is consumed by
/// [`Session::delete_notification`].
#[derive(PartialEq, Eq, Hash)]
pub struct NotificationHandle(u32);

impl NotificationHandle {
    /// Wraps a raw handle returned by the device.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw handle value.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for NotificationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NotificationHandle({})", self.0)
    }
}

/// Opens sessions to AMS addresses.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; clients share one connector between
/// concurrent operations and open one session per operation.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Session type produced by this connector.
    type Session: Session + 'static;

    /// Opens a session to `address`.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::Transport` (or `AdsError::Io`) if the target is
    /// unreachable.
    async fn connect(&self, address: AmsAddress) -> Result<Self::Session>;
}

#[async_trait]
impl<T> Connector for Arc<T>
where
    T: Connector + ?Sized,
{
    type Session = T::Session;

    async fn connect(&self, address: AmsAddress) -> Result<Self::Session> {
        (**self).connect(address).await
    }
}

/// An open session to one AMS address.
///
/// A session is owned by exactly one operation at a time; every method takes
/// `&mut self`.
#[async_trait]
pub trait Session: Send {
    /// Returns the address this session talks to.
    fn address(&self) -> AmsAddress;

    /// Reads up to `data.len()` bytes from `(index_group, index_offset)`.
    async fn read(
        &mut self,
        index_group: u32,
        index_offset: u32,
        data: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<AdsResponse>;

    /// Writes `data` to `(index_group, index_offset)`.
    async fn write(
        &mut self,
        index_group: u32,
        index_offset: u32,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<AdsResponse>;

    /// Sends `write_data` and reads the answer into `read_data` in one call.
    async fn read_write(
        &mut self,
        index_group: u32,
        index_offset: u32,
        read_data: &mut [u8],
        write_data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<AdsResponse>;

    /// Registers a device notification on `(index_group, index_offset)`.
    ///
    /// `callback` is invoked once per delivered notification until the
    /// notification is deleted or the session is closed.
    async fn add_notification(
        &mut self,
        index_group: u32,
        index_offset: u32,
        max_size: u32,
        settings: NotificationSettings,
        callback: NotificationCallback,
        cancel: &CancellationToken,
    ) -> Result<NotificationHandle>;

    /// Deletes a notification registered on this session.
    async fn delete_notification(
        &mut self,
        handle: NotificationHandle,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Closes the session.
    async fn disconnect(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_settings() {
        let settings = NotificationSettings::on_change(Duration::from_millis(100));
        assert_eq!(settings.mode, TransmissionMode::OnChange);
        assert_eq!(settings.cycle_time, Duration::from_millis(100));
        assert_eq!(settings.max_delay, Duration::ZERO);

        let settings = NotificationSettings::cyclic(Duration::ZERO);
        assert_eq!(settings.mode, TransmissionMode::Cyclic);
    }

    #[test]
    fn test_notification_handle_debug() {
        let handle = NotificationHandle::new(42);
        assert_eq!(handle.raw(), 42);
        assert_eq!(format!("{:?}", handle), "NotificationHandle(42)");
    }
}
