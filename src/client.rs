//! Addressed operation client for ADS devices.
//!
//! This module provides [`AdsClient`], the entry point for every operation in
//! this crate, and [`ClientConfig`], its configuration.
//!
//! # Overview
//!
//! The client owns a [`Connector`] and the target's Net ID. Each operation:
//! - opens its own session to the port it needs
//! - issues exactly one `read`, `write` or `read_write` per remote step,
//!   with buffers built by the [codec](crate::codec)
//! - turns a non-success result code into [`AdsError::Protocol`]
//! - closes the session on every exit path
//!
//! Capabilities are grouped in separate `impl` blocks: files
//! ([`crate::file`]), routing ([`crate::routing`]), system queries
//! ([`crate::system`]), discovery ([`crate::discovery`]) and event streaming
//! ([`crate::events`]).
//!
//! # Example
//!
//! ```ignore
//! use ads_utilities::{AdsClient, ClientConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ClientConfig::new("192.168.1.10.1.1".parse()?);
//! let client = AdsClient::new(my_connector, config)?;
//! let cancel = CancellationToken::new();
//!
//! client.connect(&cancel).await?;
//! let level = client.platform_level(&cancel).await?;
//! ```
//!
//! # Configuration
//!
//! The [`ClientConfig`] struct allows customization of:
//! - The default chunk size for file transfers
//! - The discovery window and its polling interval
//! - How long disposing an event subscription waits for its consumer

use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address::{ports, AmsAddress, AmsNetId};
use crate::codec::ReadCursor;
use crate::error::{AdsError, Result};
use crate::transport::{Connector, NotificationHandle, Session};

/// Default chunk size for file transfers in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Default discovery window.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval at which discovery checks for new responses.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default bound on waiting for an event consumer to stop.
pub const DEFAULT_DISPOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for creating an ADS client.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientConfig {
    /// Net ID of the target device.
    pub net_id: AmsNetId,
    /// Chunk size for file transfers.
    pub chunk_size: usize,
    /// How long discovery collects responses.
    pub discovery_timeout: Duration,
    /// How often discovery checks for responses.
    pub poll_interval: Duration,
    /// How long disposing an event subscription waits for its consumer.
    pub dispose_timeout: Duration,
}

impl ClientConfig {
    /// Creates a configuration for the device at `net_id` with default settings.
    ///
    /// # Example
    ///
    /// ```
    /// use ads_utilities::{AmsNetId, ClientConfig, DEFAULT_CHUNK_SIZE};
    ///
    /// let config = ClientConfig::new(AmsNetId::new(192, 168, 1, 10, 1, 1));
    /// assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    /// ```
    pub fn new(net_id: AmsNetId) -> Self {
        Self {
            net_id,
            chunk_size: DEFAULT_CHUNK_SIZE,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            dispose_timeout: DEFAULT_DISPOSE_TIMEOUT,
        }
    }

    /// Sets the file transfer chunk size (default is 10 000 bytes).
    ///
    /// # Example
    ///
    /// ```
    /// use ads_utilities::{AmsNetId, ClientConfig};
    ///
    /// let config = ClientConfig::new(AmsNetId::default()).with_chunk_size(64 * 1024);
    /// assert_eq!(config.chunk_size, 65536);
    /// ```
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the discovery window (default is 5 seconds).
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Sets the discovery polling interval (default is 100 ms).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the event subscription dispose timeout (default is 2 seconds).
    pub fn with_dispose_timeout(mut self, timeout: Duration) -> Self {
        self.dispose_timeout = timeout;
        self
    }

    /// Checks the configuration for values no operation can work with.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::InvalidParameter` for a zero chunk size or a zero
    /// polling interval.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(AdsError::invalid_parameter(
                "chunk_size",
                "must be greater than 0",
            ));
        }
        if self.chunk_size > u32::MAX as usize {
            return Err(AdsError::invalid_parameter(
                "chunk_size",
                "must fit in 32 bits",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(AdsError::invalid_parameter(
                "poll_interval",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Client for ADS system service operations on one device.
///
/// The client is cheap to share by reference: it holds no session of its
/// own, every operation opens and closes the sessions it needs.
pub struct AdsClient<C> {
    connector: C,
    config: ClientConfig,
}

impl<C: Connector> AdsClient<C> {
    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn new(connector: C, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { connector, config })
    }

    /// Returns the Net ID of the target device.
    pub fn net_id(&self) -> AmsNetId {
        self.config.net_id
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the connector.
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Verifies that the system service of the target is reachable.
    ///
    /// # Errors
    ///
    /// Returns the transport error if no session can be opened.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let session = self.open_session(ports::SYSTEM_SERVICE, cancel).await?;
        release(session, Ok(())).await
    }

    /// Reads `length` bytes from `(index_group, index_offset)` on `port`.
    ///
    /// The result holds only the bytes the device reported as read.
    pub async fn read_bytes(
        &self,
        port: u16,
        index_group: u32,
        index_offset: u32,
        length: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut session = self.open_session(port, cancel).await?;
        let result = read(&mut session, index_group, index_offset, length, cancel).await;
        release(session, result).await
    }

    /// Reads a little-endian `u16` from `(index_group, index_offset)` on `port`.
    pub async fn read_u16(
        &self,
        port: u16,
        index_group: u32,
        index_offset: u32,
        cancel: &CancellationToken,
    ) -> Result<u16> {
        let data = self
            .read_bytes(port, index_group, index_offset, 2, cancel)
            .await?;
        ReadCursor::new(&data).u16()
    }

    /// Reads a little-endian `u32` from `(index_group, index_offset)` on `port`.
    pub async fn read_u32(
        &self,
        port: u16,
        index_group: u32,
        index_offset: u32,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let data = self
            .read_bytes(port, index_group, index_offset, 4, cancel)
            .await?;
        ReadCursor::new(&data).u32()
    }

    /// Writes `data` to `(index_group, index_offset)` on `port`.
    pub async fn write_bytes(
        &self,
        port: u16,
        index_group: u32,
        index_offset: u32,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut session = self.open_session(port, cancel).await?;
        let result = write(&mut session, index_group, index_offset, data, cancel).await;
        release(session, result).await
    }

    /// Sends `data` and reads up to `read_length` bytes back in one call.
    pub async fn read_write_bytes(
        &self,
        port: u16,
        index_group: u32,
        index_offset: u32,
        read_length: usize,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut session = self.open_session(port, cancel).await?;
        let result = read_write(
            &mut session,
            index_group,
            index_offset,
            read_length,
            data,
            cancel,
        )
        .await;
        release(session, result).await
    }

    /// Opens a session to `port` on the target device.
    pub(crate) async fn open_session(
        &self,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<C::Session> {
        open(&self.connector, AmsAddress::new(self.config.net_id, port), cancel).await
    }
}

impl<C> std::fmt::Debug for AdsClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdsClient")
            .field("net_id", &self.config.net_id)
            .field("config", &self.config)
            .finish()
    }
}

/// Fails with `AdsError::Cancelled` once `cancel` has fired.
pub(crate) fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(AdsError::Cancelled)
    } else {
        Ok(())
    }
}

/// Opens a session through `connector`, giving up when `cancel` fires.
pub(crate) async fn open<C: Connector + ?Sized>(
    connector: &C,
    address: AmsAddress,
    cancel: &CancellationToken,
) -> Result<C::Session> {
    ensure_active(cancel)?;
    debug!(%address, "opening session");
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AdsError::Cancelled),
        session = connector.connect(address) => session,
    }
}

/// Closes `session` and passes `result` through.
///
/// A failing disconnect is logged and only reported when `result` succeeded.
pub(crate) async fn release<S: Session, T>(mut session: S, result: Result<T>) -> Result<T> {
    let address = session.address();
    match session.disconnect().await {
        Ok(()) => result,
        Err(e) => {
            warn!(%address, error = %e, "failed to close session");
            match result {
                Ok(_) => Err(e),
                Err(first) => Err(first),
            }
        }
    }
}

/// Deletes `notification` (if any) and closes `session`, logging failures.
pub(crate) async fn close_quietly<S: Session>(
    mut session: S,
    notification: Option<NotificationHandle>,
) {
    if let Some(handle) = notification {
        if let Err(e) = session
            .delete_notification(handle, &CancellationToken::new())
            .await
        {
            warn!(address = %session.address(), error = %e, "failed to delete notification");
        }
    }
    let _ = release(session, Ok(())).await;
}

/// Closes `session` on a background task.
///
/// Used from `Drop`, where awaiting is not possible. Outside a runtime the
/// session is dropped unclosed and a warning is logged.
pub(crate) fn spawn_close<S: Session + 'static>(
    session: S,
    notification: Option<NotificationHandle>,
) {
    match Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(close_quietly(session, notification));
        }
        Err(_) => {
            warn!(address = %session.address(), "no runtime to close session on");
        }
    }
}

/// A session held across suspension points by a stream or task.
///
/// Dropping the guard before [`release`](Self::release) deletes the
/// notification it carries and disconnects on a background task, so an
/// abandoned stream never leaves a session open.
pub(crate) struct SessionGuard<S: Session + 'static> {
    session: Option<S>,
    notification: Option<NotificationHandle>,
}

impl<S: Session + 'static> SessionGuard<S> {
    pub(crate) fn new(session: S) -> Self {
        Self {
            session: Some(session),
            notification: None,
        }
    }

    /// Records a notification to delete when the session closes.
    pub(crate) fn track(&mut self, handle: NotificationHandle) {
        self.notification = Some(handle);
    }

    pub(crate) fn session(&mut self) -> Result<&mut S> {
        self.session
            .as_mut()
            .ok_or_else(|| AdsError::transport("session already closed"))
    }

    /// Deletes the tracked notification, closes the session and passes
    /// `result` through like [`release`].
    pub(crate) async fn release<T>(mut self, result: Result<T>) -> Result<T> {
        let notification = self.notification.take();
        let Some(mut session) = self.session.take() else {
            return result;
        };
        if let Some(handle) = notification {
            if let Err(e) = session
                .delete_notification(handle, &CancellationToken::new())
                .await
            {
                warn!(address = %session.address(), error = %e, "failed to delete notification");
            }
        }
        release(session, result).await
    }
}

impl<S: Session + 'static> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(address = %session.address(), "closing abandoned session");
            spawn_close(session, self.notification.take());
        }
    }
}

/// Reads from `session` and returns the bytes the device reported.
pub(crate) async fn read<S: Session + ?Sized>(
    session: &mut S,
    index_group: u32,
    index_offset: u32,
    length: usize,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    ensure_active(cancel)?;
    let mut buffer = vec![0u8; length];
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AdsError::Cancelled),
        response = session.read(index_group, index_offset, &mut buffer, cancel) => response?,
    };
    debug!(
        index_group,
        index_offset,
        code = response.error_code.code(),
        read_bytes = response.read_bytes,
        "read"
    );
    response.check_error()?;
    buffer.truncate(response.read_bytes.min(length));
    Ok(buffer)
}

/// Writes `data` through `session`.
pub(crate) async fn write<S: Session + ?Sized>(
    session: &mut S,
    index_group: u32,
    index_offset: u32,
    data: &[u8],
    cancel: &CancellationToken,
) -> Result<()> {
    ensure_active(cancel)?;
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AdsError::Cancelled),
        response = session.write(index_group, index_offset, data, cancel) => response?,
    };
    debug!(
        index_group,
        index_offset,
        code = response.error_code.code(),
        len = data.len(),
        "write"
    );
    response.check_error()
}

/// Performs a `read_write` through `session` and returns the bytes read.
pub(crate) async fn read_write<S: Session + ?Sized>(
    session: &mut S,
    index_group: u32,
    index_offset: u32,
    read_length: usize,
    data: &[u8],
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    ensure_active(cancel)?;
    let mut buffer = vec![0u8; read_length];
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AdsError::Cancelled),
        response = session.read_write(index_group, index_offset, &mut buffer, data, cancel) => {
            response?
        }
    };
    debug!(
        index_group,
        index_offset,
        code = response.error_code.code(),
        read_bytes = response.read_bytes,
        "read_write"
    );
    response.check_error()?;
    buffer.truncate(response.read_bytes.min(read_length));
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_new() {
        let net_id = AmsNetId::new(10, 1, 1, 5, 1, 1);
        let config = ClientConfig::new(net_id);

        assert_eq!(config.net_id, net_id);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.discovery_timeout, DEFAULT_DISCOVERY_TIMEOUT);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.dispose_timeout, DEFAULT_DISPOSE_TIMEOUT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_config_builders() {
        let config = ClientConfig::new(AmsNetId::default())
            .with_chunk_size(4096)
            .with_discovery_timeout(Duration::from_secs(1))
            .with_poll_interval(Duration::from_millis(20))
            .with_dispose_timeout(Duration::from_millis(500));

        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.discovery_timeout, Duration::from_secs(1));
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.dispose_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_client_config_rejects_zero_chunk() {
        let config = ClientConfig::new(AmsNetId::default()).with_chunk_size(0);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AdsError::InvalidParameter { .. }));
    }

    #[test]
    fn test_client_config_rejects_zero_poll_interval() {
        let config = ClientConfig::new(AmsNetId::default()).with_poll_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ensure_active() {
        let cancel = CancellationToken::new();
        assert!(ensure_active(&cancel).is_ok());
        cancel.cancel();
        assert!(ensure_active(&cancel).unwrap_err().is_cancelled());
    }
}
