//! Broadcast discovery of ADS devices.
//!
//! Discovery runs through the system service of the client's target device:
//! the target sends UDP search requests on its own network adapters and forwards every
//! answer it receives as a device notification on the broadcast index group.
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> NotificationRegistered -> Requesting -> Collecting -> Draining -> Done
//! ```
//!
//! The notification is registered before the first search request so no early answer
//! is lost. The notification callback only hands the raw payload to an
//! unbounded channel; parsing happens in the consumer. When the discovery
//! window elapses or the caller cancels, the notification is deleted and the
//! session closed, then the answers already buffered are drained.
//!
//! An elapsed window is not an error. Cancellation is: the stream yields
//! `Err(AdsError::Cancelled)` after the drained answers, and the buffered
//! form returns it. A stream dropped while collecting deletes the
//! notification and closes the session on a background task.
//!
//! # Answer format
//!
//! Each answer is a sequence of tagged fields. The parser scans linearly and
//! advances one byte past anything it does not recognise:
//!
//! | Tag | Payload |
//! |-----|---------|
//! | `02 00 BF 03` | IPv4 address (4 bytes) |
//! | `01 00 00 80` | Net ID (6 bytes) |
//! | `05 00 nn 00` | Host name (`nn` bytes, terminated), type (8), OS version (12) |
//! | `03 00 04 00` | Runtime version (major, minor, build as `u16`) |
//! | `12 00 41` | Fingerprint (64 bytes) |
//!
//! Results are not de-duplicated: a device reachable on two adapters answers
//! twice.
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//!
//! let cancel = CancellationToken::new();
//! let mut found = std::pin::pin!(client.broadcast_search_stream(&cancel));
//! while let Some(target) = found.next().await {
//!     let target = target?;
//!     println!("{:?} at {:?}", target.name, target.ip_address);
//! }
//! ```

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, TryStreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::{ports, AmsNetId};
use crate::client::{self, AdsClient, SessionGuard};
use crate::codec::RequestWriter;
use crate::error::{AdsError, Result};
use crate::index::{self, offset};
use crate::routing::NetworkInterfaceInfo;
use crate::transport::{
    Connector, Notification, NotificationCallback, NotificationSettings, Session,
};
use crate::utils::{broadcast_address, format_hex_lower};

/// Size of a broadcast search request.
pub const SEARCH_REQUEST_SIZE: usize = 40;

/// Largest answer the broadcast notification delivers.
const ANSWER_MAX_SIZE: u32 = 2048;

/// Cycle time of the broadcast notification.
const ANSWER_CYCLE_TIME: Duration = Duration::from_millis(100);

const TAG_IP: [u8; 4] = [2, 0, 191, 3];
const TAG_NET_ID: [u8; 4] = [1, 0, 0, 128];
const TAG_VERSION: [u8; 4] = [3, 0, 4, 0];
const TAG_FINGERPRINT: [u8; 3] = [18, 0, 65];

const TC_TYPE_SIZE: usize = 8;
const OS_VERSION_SIZE: usize = 12;
const FINGERPRINT_SIZE: usize = 64;

/// A device that answered a discovery request.
///
/// Every field is optional: devices omit fields depending on their runtime
/// and operating system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TargetInfo {
    /// Host name.
    pub name: Option<String>,
    /// Address the answer was sent from.
    pub ip_address: Option<Ipv4Addr>,
    /// Net ID of the device.
    pub net_id: Option<AmsNetId>,
    /// Operating system, e.g. `Windows 10 (19045) 22H2` or `TwinCAT/BSD (13.2)`.
    pub os_version: Option<String>,
    /// Runtime version as `major.minor.build`.
    pub version: Option<String>,
    /// Lowercase hex fingerprint.
    pub fingerprint: Option<String>,
}

fn has_tag(data: &[u8], index: usize, tag: &[u8]) -> bool {
    data.get(index..index + tag.len()) == Some(tag)
}

/// Parses one discovery answer.
///
/// Unknown bytes are skipped and truncated fields are left unset, so this
/// never fails.
///
/// # Example
///
/// ```
/// use ads_utilities::parse_broadcast_response;
/// use std::net::Ipv4Addr;
///
/// let answer = [2, 0, 191, 3, 192, 168, 1, 20, 3, 0, 4, 0, 3, 1, 0x9E, 0x0F];
/// let target = parse_broadcast_response(&answer);
/// assert_eq!(target.ip_address, Some(Ipv4Addr::new(192, 168, 1, 20)));
/// assert_eq!(target.version.as_deref(), Some("3.1.3998"));
/// ```
pub fn parse_broadcast_response(data: &[u8]) -> TargetInfo {
    let mut target = TargetInfo::default();
    let mut i = 0;
    while i < data.len() {
        if has_tag(data, i, &TAG_IP) {
            i += TAG_IP.len();
            if let Some(ip) = data.get(i..i + 4) {
                target.ip_address = Some(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]));
                i += 4;
            }
        } else if has_tag(data, i, &TAG_NET_ID) {
            i += TAG_NET_ID.len();
            if let Some(net_id) = data.get(i..i + 6) {
                target.net_id = AmsNetId::from_bytes(net_id).ok();
                i += 6;
            }
        } else if let Some(&[5, 0, len, 0]) = data.get(i..i + 4) {
            if len == 0 {
                i += 1;
                continue;
            }
            let len = len as usize;
            i += 4;
            if let Some(name) = data.get(i..i + len) {
                target.name = Some(String::from_utf8_lossy(&name[..len - 1]).into_owned());
                i += len;
            }
            if data.len() >= i + TC_TYPE_SIZE {
                i += TC_TYPE_SIZE;
            }
            if let Some(os) = data.get(i..i + OS_VERSION_SIZE) {
                target.os_version = Some(os_version(os));
                i += OS_VERSION_SIZE;
            }
        } else if has_tag(data, i, &TAG_VERSION) {
            i += TAG_VERSION.len();
            if let Some(v) = data.get(i..i + 4) {
                let build = u16::from_le_bytes([v[2], v[3]]);
                target.version = Some(format!("{}.{}.{}", v[0], v[1], build));
                i += 4;
            }
        } else if has_tag(data, i, &TAG_FINGERPRINT) {
            i += TAG_FINGERPRINT.len();
            if let Some(fingerprint) = data.get(i..i + FINGERPRINT_SIZE) {
                target.fingerprint = Some(format_hex_lower(fingerprint));
                i += FINGERPRINT_SIZE;
            }
        } else {
            i += 1;
        }
    }
    target
}

fn os_name(key: u16) -> Option<&'static str> {
    Some(match key {
        0x0700 => "Windows CE (7.0)",
        0x0602 => "Windows 8/8.1/10",
        0x0A00 => "Windows",
        0x0601 => "Windows 7",
        0x0600 => "Windows CE (6.0)",
        0x0500 => "Windows CE (5.0)",
        0x0501 => "Windows XP",
        0x0009 => "RTOS",
        _ => return None,
    })
}

fn windows_build(key: u16) -> Option<&'static str> {
    Some(match key {
        0x5D58 => "11 (22621) 22H2",
        0x654A => "10 (19045) 22H2",
        0x644A => "10 (19044) 21H2",
        0x634A => "10 (19043) 21H1",
        0x624A => "10 (19042) 20H2",
        0x614A => "10 (19041) 2004",
        0x4447 => "10 (18363) 1909",
        0xBA47 => "10 (18362) 1903",
        0x6345 => "10 (17763) 1809",
        0xEE42 => "10 (17134) 1803",
        0xAB3F => "10 (16299) 1709",
        0xD73A => "10 (15063) 1703",
        0x3938 => "10 (14393) 1607",
        0x5A29 => "10 (10586) 1511",
        0x0028 => "10 (10240) 1507",
        _ => return None,
    })
}

/// Renders the 12-byte OS version field of a discovery answer.
fn os_version(os: &[u8]) -> String {
    let (major, minor) = (os[0], os[4]);
    let key = u16::from_be_bytes([major, minor]);
    let build = u16::from_be_bytes([os[8], os[9]]);
    let name = os_name(key);

    if key > 0x0C00 {
        // TwinCAT/BSD reports no build.
        format!("TwinCAT/BSD ({}.{})", major, minor)
    } else if let Some(name) = name.filter(|name| name.contains("Windows")) {
        match windows_build(build) {
            Some(build) => format!("{} {}", name, build),
            None => format!("{} {:02X}", name, build),
        }
    } else if key > 0x0601 && key < 0x0700 {
        format!("Linux {}.{}", major, minor)
    } else if key < 0x0500 {
        format!("TC/RTOS ({}.{})", major, minor)
    } else {
        name.map_or_else(|| format!("{:02X}", key), str::to_string)
    }
}

/// Builds the search request that asks devices at `ip` to answer.
///
/// `net_id` is the Net ID of the device that sends the request and collects the
/// answers.
pub fn broadcast_request(ip: Ipv4Addr, net_id: &AmsNetId) -> Vec<u8> {
    let mut request = RequestWriter::with_capacity(SEARCH_REQUEST_SIZE);
    request
        .bytes(&TAG_IP)
        .ipv4(ip)
        .zeros(8)
        .bytes(&[3, 102, 20, 113])
        .zeros(4)
        .u8(1)
        .zeros(3)
        .net_id(net_id)
        .bytes(&[16, 39])
        .zeros(4);
    request.into_bytes()
}

/// Returns the directed-broadcast address of every usable adapter.
///
/// Adapters without an address, with `0.0.0.0`, or with an unparseable
/// address or mask are skipped.
pub fn broadcast_targets(interfaces: &[NetworkInterfaceInfo]) -> Vec<Ipv4Addr> {
    interfaces
        .iter()
        .filter_map(|nic| match (nic.ip(), nic.mask()) {
            (Some(ip), Some(mask)) => Some(broadcast_address(ip, mask)),
            _ => {
                warn!(adapter = %nic.name, ip = %nic.ip_address, "skipping adapter without usable address");
                None
            }
        })
        .collect()
}

/// Where a search sends its requests.
enum SearchScope {
    /// Every adapter of the target, fetched when the search starts.
    AllInterfaces,
    /// One address; a failing request fails the search.
    Directed(Ipv4Addr),
}

enum SearchState<S: Session + 'static> {
    Idle,
    Collecting {
        guard: SessionGuard<S>,
        answers: mpsc::UnboundedReceiver<Vec<u8>>,
        deadline: Instant,
    },
    Draining {
        answers: mpsc::UnboundedReceiver<Vec<u8>>,
    },
    Done,
}

struct Search<'a, C: Connector> {
    client: &'a AdsClient<C>,
    scope: SearchScope,
    cancel: CancellationToken,
    state: SearchState<C::Session>,
    cancelled: bool,
    found: usize,
}

impl<C: Connector> Search<'_, C> {
    async fn advance(&mut self) -> Option<Result<TargetInfo>> {
        loop {
            match std::mem::replace(&mut self.state, SearchState::Done) {
                SearchState::Done => return None,
                SearchState::Idle => match self.start().await {
                    Ok(state) => self.state = state,
                    Err(e) => return Some(Err(e)),
                },
                SearchState::Collecting {
                    guard,
                    mut answers,
                    deadline,
                } => {
                    let now = Instant::now();
                    if self.cancel.is_cancelled() || now >= deadline {
                        self.cancelled = self.cancel.is_cancelled();
                        let _ = guard.release(Ok(())).await;
                        self.state = SearchState::Draining { answers };
                        continue;
                    }
                    if let Ok(answer) = answers.try_recv() {
                        self.state = SearchState::Collecting {
                            guard,
                            answers,
                            deadline,
                        };
                        return Some(Ok(self.parsed(&answer)));
                    }
                    let tick = self.client.config().poll_interval.min(deadline - now);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(tick) => {}
                    }
                    self.state = SearchState::Collecting {
                        guard,
                        answers,
                        deadline,
                    };
                }
                SearchState::Draining { mut answers } => {
                    if let Ok(answer) = answers.try_recv() {
                        self.state = SearchState::Draining { answers };
                        return Some(Ok(self.parsed(&answer)));
                    }
                    info!(found = self.found, cancelled = self.cancelled, "discovery finished");
                    if self.cancelled {
                        return Some(Err(AdsError::Cancelled));
                    }
                    return None;
                }
            }
        }
    }

    fn parsed(&mut self, answer: &[u8]) -> TargetInfo {
        self.found += 1;
        let target = parse_broadcast_response(answer);
        debug!(len = answer.len(), name = ?target.name, "discovery answer");
        target
    }

    /// Registers the notification and sends the search requests.
    async fn start(&mut self) -> Result<SearchState<C::Session>> {
        let targets = match self.scope {
            SearchScope::AllInterfaces => {
                broadcast_targets(&self.client.network_interfaces(&self.cancel).await?)
            }
            SearchScope::Directed(ip) => vec![ip],
        };

        let mut guard = SessionGuard::new(
            self.client
                .open_session(ports::SYSTEM_SERVICE, &self.cancel)
                .await?,
        );
        let (sender, answers) = mpsc::unbounded_channel();
        let callback: NotificationCallback = Arc::new(move |notification: Notification| {
            let _ = sender.send(notification.data);
        });
        let registered = match guard.session() {
            Ok(session) => {
                session
                    .add_notification(
                        index::BROADCAST,
                        offset::BROADCAST_RECEIVE,
                        ANSWER_MAX_SIZE,
                        NotificationSettings::on_change(ANSWER_CYCLE_TIME),
                        callback,
                        &self.cancel,
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        match registered {
            Ok(handle) => guard.track(handle),
            Err(e) => return guard.release(Err(e)).await,
        }

        let net_id = self.client.net_id();
        for ip in &targets {
            let request = broadcast_request(*ip, &net_id);
            let sent = match guard.session() {
                Ok(session) => {
                    client::write(
                        session,
                        index::BROADCAST,
                        offset::BROADCAST_SEND,
                        &request,
                        &self.cancel,
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => debug!(%ip, "search request sent"),
                Err(e) if matches!(self.scope, SearchScope::AllInterfaces) && !e.is_cancelled() => {
                    warn!(%ip, error = %e, "search request failed, continuing with next adapter");
                }
                Err(e) => return guard.release(Err(e)).await,
            }
        }

        info!(requests = targets.len(), "discovery started");
        Ok(SearchState::Collecting {
            guard,
            answers,
            deadline: Instant::now() + self.client.config().discovery_timeout,
        })
    }
}

impl<C: Connector> AdsClient<C> {
    /// Searches every network adapter of the target for devices.
    ///
    /// Answers are yielded as they arrive until the configured discovery
    /// window elapses. The stream is single-pass.
    pub fn broadcast_search_stream<'a>(
        &'a self,
        cancel: &CancellationToken,
    ) -> impl Stream<Item = Result<TargetInfo>> + Send + 'a {
        self.search(SearchScope::AllInterfaces, cancel)
    }

    /// Searches every network adapter of the target and collects the answers.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::Cancelled` if `cancel` fires before the window
    /// elapses, and any error raised while setting up the search.
    pub async fn broadcast_search(&self, cancel: &CancellationToken) -> Result<Vec<TargetInfo>> {
        self.search(SearchScope::AllInterfaces, cancel)
            .try_collect()
            .await
    }

    /// Searches a single address and yields its answers.
    ///
    /// Unlike the broadcast search, a failing request fails the stream.
    pub fn search_by_ip<'a>(
        &'a self,
        ip: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> impl Stream<Item = Result<TargetInfo>> + Send + 'a {
        self.search(SearchScope::Directed(ip), cancel)
    }

    fn search<'a>(
        &'a self,
        scope: SearchScope,
        cancel: &CancellationToken,
    ) -> impl Stream<Item = Result<TargetInfo>> + Send + 'a {
        let search = Search {
            client: self,
            scope,
            cancel: cancel.clone(),
            state: SearchState::Idle,
            cancelled: false,
            found: 0,
        };
        stream::unfold(search, |mut search| async move {
            let item = search.advance().await?;
            Some((item, search))
        })
    }
}
