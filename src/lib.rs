//! # ADS Utilities
//!
//! Async system-service utilities for devices speaking the ADS protocol:
//! remote files, route tables, device queries, broadcast discovery, the live
//! event log, and EtherCAT and I/O diagnostics.
//!
//! The library does not open sockets. It drives an external transport through
//! the [`Connector`] and [`Session`] traits and turns the addressed primitives
//! (`read`, `write`, `read_write`, device notifications) into typed
//! operations.
//!
//! ## Features
//!
//! - **Transport-agnostic**: plug any AMS/ADS transport in through two traits
//! - **Session per operation**: every call opens, uses and closes its own
//!   session; nothing is shared between concurrent calls
//! - **Cancellable**: every operation takes a [`CancellationToken`] and always
//!   runs its cleanup
//! - **No panics**: all errors returned as `Result<T, AdsError>`
//! - **Streaming**: directory listings and discovery results as lazy streams
//!
//! ## Quick Start
//!
//! ```ignore
//! use ads_utilities::{AdsClient, ClientConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ClientConfig::new("5.80.12.7.1.1".parse()?);
//! let client = AdsClient::new(my_connector, config)?;
//! let cancel = CancellationToken::new();
//!
//! // Device queries
//! println!("time: {}", client.system_time(&cancel).await?);
//! println!("system id: {}", client.system_id(&cancel).await?);
//!
//! // Files
//! for entry in client.list_directory("C:/TwinCAT/3.1/Boot", &cancel).await? {
//!     println!("{:>10} {}", entry.size, entry.name);
//! }
//! client
//!     .copy_within("C:/data/recipe.csv", "C:/backup/recipe.csv", |p| println!("{p:.0}%"), &cancel)
//!     .await?;
//!
//! // Discovery
//! for target in client.broadcast_search(&cancel).await? {
//!     println!("{:?} {:?} {:?}", target.name, target.net_id, target.os_version);
//! }
//! ```
//!
//! ## Capabilities
//!
//! | Area | Module | Operations |
//! |------|--------|------------|
//! | Files | [`file`] | open/read/write/close, delete, rename, directories, listing, process start |
//! | Transfer | [`transfer`] | chunked copy within or across devices with progress |
//! | Routing | [`routing`] | add/remove/list routes, remote routes, host lookup, adapters, fingerprint |
//! | System | [`system`] | clock, CPU load, router status and memory, licenses, registry, Net ID change |
//! | Discovery | [`discovery`] | broadcast and directed search, buffered or streamed |
//! | Events | [`events`] | live event log subscription |
//! | EtherCAT | [`ethercat`] | CoE and ESC access, frame statistics, master state, slave CRCs |
//! | I/O | [`io`] | I/O devices and their boxes |
//!
//! ## Error Handling
//!
//! ```ignore
//! use ads_utilities::{AdsError, AdsErrorCode};
//!
//! match client.file_info("C:/missing.txt", &cancel).await {
//!     Ok(info) => println!("{} bytes", info.size),
//!     Err(e) if e.is_not_found() => println!("no such file"),
//!     Err(AdsError::Protocol { code }) => println!("device error {}", code),
//!     Err(AdsError::Cancelled) => println!("cancelled"),
//!     Err(e) => println!("error: {}", e),
//! }
//! ```
//!
//! ## Addresses
//!
//! ```
//! use ads_utilities::{ports, AmsAddress, AmsNetId};
//!
//! let net_id: AmsNetId = "192.168.1.10.1.1".parse()?;
//! let address = AmsAddress::new(net_id, ports::SYSTEM_SERVICE);
//! assert_eq!(address.to_string(), "192.168.1.10.1.1:10000");
//! # Ok::<(), ads_utilities::AdsError>(())
//! ```
//!
//! ## Configuration
//!
//! ```
//! use ads_utilities::{AmsNetId, ClientConfig};
//! use std::time::Duration;
//!
//! let config = ClientConfig::new(AmsNetId::new(192, 168, 1, 10, 1, 1))
//!     .with_chunk_size(64 * 1024)                       // default: 10 000 bytes
//!     .with_discovery_timeout(Duration::from_secs(2))   // default: 5 s
//!     .with_poll_interval(Duration::from_millis(50))    // default: 100 ms
//!     .with_dispose_timeout(Duration::from_secs(1));    // default: 2 s
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Logging
//!
//! The library logs through [`tracing`] and never installs a subscriber.
//! Protocol exchanges log at `debug`, lifecycle events at `info`, recovered
//! faults (failed cleanup, skipped adapters or events) at `warn`.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod address;
mod client;
pub mod codec;
mod directory;
pub mod discovery;
mod error;
pub mod ethercat;
pub mod events;
pub mod file;
pub mod index;
pub mod io;
mod response;
pub mod routing;
pub mod system;
pub mod transfer;
mod transport;
pub mod utils;

#[doc(no_inline)]
pub use tokio_util::sync::CancellationToken;

// Public re-exports
pub use address::{ports, AmsAddress, AmsNetId, NET_ID_SIZE};
pub use client::{
    AdsClient, ClientConfig, DEFAULT_CHUNK_SIZE, DEFAULT_DISCOVERY_TIMEOUT,
    DEFAULT_DISPOSE_TIMEOUT, DEFAULT_POLL_INTERVAL,
};
pub use codec::{ReadCursor, RequestWriter};
pub use directory::{BaseDirectory, OpenMode};
pub use discovery::{broadcast_request, broadcast_targets, parse_broadcast_response, TargetInfo};
pub use error::{ads_error_description, AdsError, AdsErrorCode, Result};
pub use ethercat::{EcDeviceState, EcState, FrameStatistics, SlaveAddressing};
pub use events::{ChannelSink, EventSink, EventSubscription, LogEntry, Severity};
pub use file::{FileAttributes, FileHandle, FileInfo, FILE_RECORD_SIZE};
pub use io::{IoBox, IoDevice};
pub use response::AdsResponse;
pub use routing::{
    parse_network_interfaces, NetworkInterfaceInfo, RemoteRouteConfig, RouteConfig, RouteEntry,
    RouteKind,
};
pub use system::{CpuUsage, LicenseInfo, LicenseState, RegistryValueKind, RouterStatus};
pub use transfer::{copy_file, CopyReport};
pub use transport::{
    Connector, Notification, NotificationCallback, NotificationHandle, NotificationSettings,
    Session, TransmissionMode,
};
