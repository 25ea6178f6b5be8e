//! Live event log subscription.
//!
//! [`AdsClient::subscribe_events`] streams the device's event log into an
//! [`EventSink`] until the returned [`EventSubscription`] is disposed.
//!
//! # Architecture
//!
//! ```text
//! transport callback ──enqueue──▶ mpsc ──▶ consumer task ──▶ EventSink
//!                                              │
//!                                              └─ detail session (read_write)
//! ```
//!
//! The notification callback only enqueues. A single consumer task parses
//! each payload, resolves the message text with one `read_write` on a second
//! session, and hands the finished [`LogEntry`] to the sink. Entries arrive
//! in notification order.
//!
//! Payloads of 20 bytes or less are cyclic heartbeats and are dropped. A
//! payload whose detail cannot be resolved is logged and skipped; it never
//! ends the subscription.
//!
//! # Example
//!
//! ```ignore
//! use ads_utilities::LogEntry;
//!
//! let mut subscription = client
//!     .subscribe_events(|entry: LogEntry| println!("[{}] {}: {}", entry.severity, entry.sender, entry.message), &cancel)
//!     .await?;
//! // ...
//! subscription.dispose().await;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::ports;
use crate::client::{self, release, AdsClient, SessionGuard};
use crate::codec::RequestWriter;
use crate::error::Result;
use crate::index;
use crate::transport::{
    Connector, Notification, NotificationCallback, NotificationSettings, Session,
};

/// Payloads up to this size are heartbeats.
pub const HEARTBEAT_THRESHOLD: usize = 20;

const EVENT_MAX_SIZE: u32 = 0x2000;
const DETAIL_SIZE: usize = 0x810;

const ADDRESS_OFFSET: usize = 12;
const ADDRESS_SIZE: usize = 24;
const SEVERITY_OFFSET: usize = 36;
const MESSAGE_LENGTH_OFFSET: usize = 24;
const MESSAGE_OFFSET: usize = 28;
const SENDER_MARKER: [u8; 3] = [0x20, 0x50, 0x08];

/// Severity of an event log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Severity {
    /// Diagnostic detail.
    Verbose = 0,
    /// Informational.
    #[default]
    Info = 1,
    /// Warning.
    Warning = 2,
    /// Error.
    Error = 3,
    /// Critical error.
    Critical = 4,
}

impl Severity {
    /// Maps a raw level byte, clamping values above `Critical`.
    pub fn from_raw(level: u8) -> Self {
        match level {
            0 => Severity::Verbose,
            1 => Severity::Info,
            2 => Severity::Warning,
            3 => Severity::Error,
            _ => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Verbose => "Verbose",
            Severity::Info => "Info",
            Severity::Warning => "Warning",
            Severity::Error => "Error",
            Severity::Critical => "Critical",
        };
        f.write_str(name)
    }
}

/// One entry of the device's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogEntry {
    /// Time the device raised the event.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub severity: Severity,
    /// Source of the event, empty if the payload names none.
    pub sender: String,
    /// Message text.
    pub message: String,
}

/// Receives event log entries.
///
/// Called from the subscription's consumer task, one entry at a time.
pub trait EventSink: Send + 'static {
    /// Handles one entry.
    fn on_event(&mut self, entry: LogEntry);
}

impl<F> EventSink for F
where
    F: FnMut(LogEntry) + Send + 'static,
{
    fn on_event(&mut self, entry: LogEntry) {
        self(entry)
    }
}

/// An [`EventSink`] that forwards entries into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<LogEntry>,
}

impl ChannelSink {
    /// Creates a sink sending into `sender`.
    pub fn new(sender: mpsc::UnboundedSender<LogEntry>) -> Self {
        Self { sender }
    }

    /// Creates a sink together with its receiver.
    pub fn with_channel() -> (Self, mpsc::UnboundedReceiver<LogEntry>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl EventSink for ChannelSink {
    fn on_event(&mut self, entry: LogEntry) {
        // A dropped receiver means nobody listens any more.
        let _ = self.sender.send(entry);
    }
}

/// Returns the 24-byte event address of a notification payload.
///
/// Returns `None` for heartbeats and payloads too short to carry an address.
pub fn event_address(payload: &[u8]) -> Option<&[u8]> {
    if payload.len() <= HEARTBEAT_THRESHOLD {
        return None;
    }
    payload.get(ADDRESS_OFFSET..ADDRESS_OFFSET + ADDRESS_SIZE)
}

/// Builds the request that resolves an event address to its detail record.
pub fn detail_request(address: &[u8]) -> Vec<u8> {
    let mut request = RequestWriter::with_capacity(48 + address.len());
    request
        .u32(1)
        .u32(0x64)
        .u32(0x34)
        .zeros(4)
        .bytes(&[0x09, 0x04, 0, 0])
        .bytes(address)
        .zeros(4)
        .u32(0x34)
        .zeros(4)
        .u32(0x34)
        .zeros(8);
    request.into_bytes()
}

/// Builds a [`LogEntry`] from a notification payload and its detail record.
///
/// Returns `None` if the detail holds no message text.
pub fn parse_event(payload: &[u8], detail: &[u8], timestamp: DateTime<Utc>) -> Option<LogEntry> {
    let length = *detail.get(MESSAGE_LENGTH_OFFSET)? as usize;
    if length == 0 {
        return None;
    }
    let text = detail.get(MESSAGE_OFFSET..MESSAGE_OFFSET + length)?;
    let message = String::from_utf8_lossy(text).into_owned();
    if message.is_empty() {
        return None;
    }

    let severity = payload
        .get(SEVERITY_OFFSET)
        .map_or(Severity::Info, |level| Severity::from_raw(*level));

    Some(LogEntry {
        timestamp,
        severity,
        sender: event_sender(payload),
        message,
    })
}

fn event_sender(payload: &[u8]) -> String {
    let Some(start) = payload
        .windows(SENDER_MARKER.len())
        .position(|window| *window == SENDER_MARKER)
        .map(|p| p + SENDER_MARKER.len())
    else {
        return String::new();
    };
    let rest = &payload[start..];
    let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
    String::from_utf8_lossy(&rest[..end]).into_owned()
}

async fn resolve<S: Session>(
    detail: &mut S,
    notification: &Notification,
    cancel: &CancellationToken,
) -> Result<Option<LogEntry>> {
    let Some(address) = event_address(&notification.data) else {
        return Ok(None);
    };
    let request = detail_request(address);
    let record = client::read_write(detail, index::EVENT_DETAIL, 0, DETAIL_SIZE, &request, cancel)
        .await?;
    Ok(parse_event(&notification.data, &record, notification.timestamp))
}

/// Where the detail session lives while the subscription runs.
enum DetailSlot<S> {
    /// Idle, owned by the subscription.
    Parked(S),
    /// On loan to the consumer task.
    Leased,
    /// The subscription is gone; whoever holds the session closes it.
    Abandoned,
}

type SharedDetail<S> = Arc<Mutex<DetailSlot<S>>>;

fn lock_slot<S>(slot: &Mutex<DetailSlot<S>>) -> MutexGuard<'_, DetailSlot<S>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the slot abandoned and returns the session if it was parked.
fn abandon<S>(slot: &Mutex<DetailSlot<S>>) -> Option<S> {
    match std::mem::replace(&mut *lock_slot(slot), DetailSlot::Abandoned) {
        DetailSlot::Parked(session) => Some(session),
        DetailSlot::Leased | DetailSlot::Abandoned => None,
    }
}

/// The detail session on loan to the consumer.
///
/// Dropping the lease, including when the consumer task is aborted, parks
/// the session again or closes it if the subscription was abandoned.
struct DetailLease<S: Session + 'static> {
    session: Option<S>,
    slot: SharedDetail<S>,
}

impl<S: Session + 'static> DetailLease<S> {
    fn take(slot: &SharedDetail<S>) -> Option<Self> {
        let mut guard = lock_slot(slot);
        match std::mem::replace(&mut *guard, DetailSlot::Leased) {
            DetailSlot::Parked(session) => Some(Self {
                session: Some(session),
                slot: Arc::clone(slot),
            }),
            other => {
                *guard = other;
                None
            }
        }
    }
}

impl<S: Session + 'static> Drop for DetailLease<S> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let mut slot = lock_slot(&self.slot);
        if matches!(*slot, DetailSlot::Abandoned) {
            drop(slot);
            client::spawn_close(session, None);
        } else {
            *slot = DetailSlot::Parked(session);
        }
    }
}

async fn consume<S: Session + 'static, K: EventSink>(
    detail: SharedDetail<S>,
    mut queue: mpsc::UnboundedReceiver<Notification>,
    mut sink: K,
    stop: CancellationToken,
) {
    let Some(mut lease) = DetailLease::take(&detail) else {
        return;
    };
    loop {
        let notification = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            notification = queue.recv() => match notification {
                Some(notification) => notification,
                None => break,
            },
        };
        let Some(session) = lease.session.as_mut() else {
            break;
        };
        match resolve(session, &notification, &stop).await {
            Ok(Some(entry)) => sink.on_event(entry),
            Ok(None) => {}
            Err(e) if e.is_cancelled() => break,
            Err(e) => warn!(error = %e, len = notification.data.len(), "skipping event"),
        }
    }
    debug!("event consumer stopped");
}

struct Active<S: Session + 'static> {
    notifications: SessionGuard<S>,
    detail: SharedDetail<S>,
    consumer: JoinHandle<()>,
}

/// A running event log subscription.
///
/// Call [`dispose`](Self::dispose) to tear it down; disposing twice is a
/// no-op. Dropping the subscription without disposing stops the consumer and
/// releases both sessions on a background task.
pub struct EventSubscription<S: Session + 'static> {
    active: Option<Active<S>>,
    stop: CancellationToken,
    accepting: Arc<AtomicBool>,
    dispose_timeout: Duration,
}

impl<S: Session + 'static> EventSubscription<S> {
    /// Returns `true` until the subscription is disposed.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Stops the subscription and releases its sessions.
    ///
    /// Each step is attempted even if an earlier one fails; failures are
    /// logged. A consumer that does not stop within the dispose timeout is
    /// aborted. If it is still stuck in the sink after a second timeout, the
    /// detail session is closed as soon as the sink returns.
    pub async fn dispose(&mut self) {
        let Some(Active {
            notifications,
            detail,
            mut consumer,
        }) = self.active.take()
        else {
            return;
        };

        self.stop.cancel();
        self.accepting.store(false, Ordering::Release);

        match tokio::time::timeout(self.dispose_timeout, &mut consumer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "event consumer failed"),
            Err(_) => {
                warn!(timeout = ?self.dispose_timeout, "event consumer did not stop in time");
                consumer.abort();
                if tokio::time::timeout(self.dispose_timeout, &mut consumer)
                    .await
                    .is_err()
                {
                    warn!("event consumer still busy in its sink");
                }
            }
        }

        let _ = notifications.release(Ok(())).await;
        if let Some(session) = abandon(&detail) {
            let _ = release(session, Ok(())).await;
        }
        info!("event subscription disposed");
    }
}

impl<S: Session + 'static> Drop for EventSubscription<S> {
    fn drop(&mut self) {
        self.accepting.store(false, Ordering::Release);
        self.stop.cancel();
        if let Some(active) = self.active.take() {
            if let Some(session) = abandon(&active.detail) {
                client::spawn_close(session, None);
            }
        }
    }
}

impl<S: Session + 'static> fmt::Debug for EventSubscription<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription")
            .field("active", &self.active.is_some())
            .field("dispose_timeout", &self.dispose_timeout)
            .finish()
    }
}

impl<C: Connector> AdsClient<C> {
    /// Subscribes to the device's event log.
    ///
    /// Opens two sessions to the event log publisher: one carries the
    /// notification, the other resolves message details. Both stay open until
    /// the subscription is disposed.
    ///
    /// # Errors
    ///
    /// Returns an error if either session cannot be opened or the device
    /// rejects the notification. Nothing stays registered in that case.
    pub async fn subscribe_events<K: EventSink>(
        &self,
        sink: K,
        cancel: &CancellationToken,
    ) -> Result<EventSubscription<C::Session>> {
        let mut notifications = SessionGuard::new(
            self.open_session(ports::EVENT_LOG_PUBLISHER, cancel)
                .await?,
        );

        let (sender, queue) = mpsc::unbounded_channel();
        let accepting = Arc::new(AtomicBool::new(true));
        let callback: NotificationCallback = {
            let accepting = Arc::clone(&accepting);
            Arc::new(move |notification: Notification| {
                if accepting.load(Ordering::Acquire) {
                    let _ = sender.send(notification);
                }
            })
        };

        let registered = match notifications.session() {
            Ok(session) => {
                session
                    .add_notification(
                        index::EVENT_STREAM,
                        0,
                        EVENT_MAX_SIZE,
                        NotificationSettings::cyclic(Duration::ZERO),
                        callback,
                        cancel,
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        match registered {
            Ok(handle) => notifications.track(handle),
            Err(e) => return notifications.release(Err(e)).await,
        }

        let detail = match self.open_session(ports::EVENT_LOG_PUBLISHER, cancel).await {
            Ok(detail) => detail,
            Err(e) => {
                accepting.store(false, Ordering::Release);
                return notifications.release(Err(e)).await;
            }
        };
        let detail = Arc::new(Mutex::new(DetailSlot::Parked(detail)));

        let stop = CancellationToken::new();
        let consumer = tokio::spawn(consume(Arc::clone(&detail), queue, sink, stop.clone()));
        info!(net_id = %self.net_id(), "event subscription started");

        Ok(EventSubscription {
            active: Some(Active {
                notifications,
                detail,
                consumer,
            }),
            stop,
            accepting,
            dispose_timeout: self.config().dispose_timeout,
        })
    }
}
