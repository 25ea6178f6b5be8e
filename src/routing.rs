//! Route table and network queries.
//!
//! This module adds the routing capability to [`AdsClient`]:
//!
//! - [`add_route`](AdsClient::add_route) / [`remove_route`](AdsClient::remove_route)
//!   edit the device's local route table
//! - [`routes`](AdsClient::routes) enumerates it
//! - [`network_interfaces`](AdsClient::network_interfaces) decodes the adapter
//!   table used to choose broadcast targets
//! - [`add_remote_route_by_ip`](AdsClient::add_remote_route_by_ip) /
//!   [`add_remote_route_by_name`](AdsClient::add_remote_route_by_name) ask a
//!   remote system to add a route back to the device, authenticated with that
//!   system's credentials; [`add_route_by_ip`](AdsClient::add_route_by_ip) and
//!   [`add_route_by_name`](AdsClient::add_route_by_name) add both directions
//! - [`ip_from_hostname`](AdsClient::ip_from_hostname) and
//!   [`fingerprint`](AdsClient::fingerprint) are single-shot queries
//!
//! # Route entry layout
//!
//! Route add requests and route enumeration records share a 44-byte header
//! followed by two zero-terminated strings:
//!
//! | Offset | Size | Field |
//! |-------:|-----:|-------|
//! | 0 | 6 | Net ID |
//! | 6 | 3 | Route type |
//! | 32 | 1 | Address length including terminator |
//! | 36 | 1 | Name length including terminator |
//! | 44 | n | Address (IP or host name), then name |

use std::net::Ipv4Addr;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address::{ports, AmsNetId};
use crate::client::{self, release, AdsClient};
use crate::codec::{
    announced_length, nul_terminated, string_prefix, strip_nuls, ReadCursor, RequestWriter,
};
use crate::error::{AdsError, AdsErrorCode, Result};
use crate::index::{self, offset};
use crate::transport::Connector;

/// Upper bound on route enumeration.
pub const MAX_ROUTES: u32 = 100;

/// Size of one route enumeration record.
pub const ROUTE_RECORD_SIZE: usize = 235;

/// Size of the header before the strings of a route entry.
const ROUTE_HEADER_SIZE: usize = 44;

/// Size of the fingerprint response.
const FINGERPRINT_SIZE: usize = 129;

/// Byte ranges of the adapter fields inside one adapter record.
const NIC_ID: std::ops::Range<usize> = 8..267;
const NIC_NAME: std::ops::Range<usize> = 268..380;
const NIC_IP: std::ops::Range<usize> = 432..447;
const NIC_MASK: std::ops::Range<usize> = 448..463;
const NIC_GATEWAY: std::ops::Range<usize> = 472..487;
const NIC_DHCP: std::ops::Range<usize> = 512..527;

/// Smallest adapter record that holds every decoded field.
pub const MIN_NIC_RECORD_SIZE: usize = 527;

/// Upper bound on the adapter table size a device may announce.
pub const MAX_ADAPTER_TABLE_SIZE: usize = 64 * 1024;

/// Read buffer for the answer to a remote route request.
const REMOTE_ROUTE_ANSWER_SIZE: usize = 2048;

/// Tags of the remote route request.
const TAG_ROUTE_NAME: u8 = 12;
const TAG_NET_ID: u8 = 7;
const TAG_USERNAME: u8 = 13;
const TAG_PASSWORD: u8 = 2;
const TAG_HOST: u8 = 5;
const TAG_TEMPORARY: u8 = 9;

/// Lifetime of a route entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RouteKind {
    /// Persisted in the device's route configuration.
    #[default]
    Static,
    /// Dropped when the device's router restarts.
    Temporary,
}

impl RouteKind {
    fn segment(self) -> [u8; 3] {
        match self {
            RouteKind::Static => [0x01, 0x00, 0x00],
            RouteKind::Temporary => [0x01, 0x00, 0x01],
        }
    }
}

/// A route to add to the device's route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    /// Net ID the route points to.
    pub net_id: AmsNetId,
    /// IPv4 address or host name of the route target.
    pub address: String,
    /// Display name of the route.
    pub name: String,
    /// Route lifetime.
    pub kind: RouteKind,
}

impl RouteConfig {
    /// Creates a static route configuration.
    pub fn new(net_id: AmsNetId, address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            net_id,
            address: address.into(),
            name: name.into(),
            kind: RouteKind::Static,
        }
    }

    /// Marks the route as temporary.
    pub fn temporary(mut self) -> Self {
        self.kind = RouteKind::Temporary;
        self
    }

    /// Encodes the route add request.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::InvalidParameter` if the address or the name is too
    /// long for its length field.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let address_len = string_prefix(&self.address)?;
        let name_len = string_prefix(&self.name)?;
        let capacity = ROUTE_HEADER_SIZE + self.address.len() + self.name.len() + 2;
        let mut request = RequestWriter::with_capacity(capacity);
        request
            .net_id(&self.net_id)
            .bytes(&self.kind.segment())
            .zeros(23)
            .u8(address_len)
            .zeros(3)
            .u8(name_len)
            .zeros(7)
            .string(&self.address)
            .string(&self.name);
        Ok(request.into_bytes())
    }
}

/// A route to add on a remote system, pointing back to the device.
///
/// The password is sent to the remote system in the request and is never
/// printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteRouteConfig {
    /// Name of the route entry on the remote system.
    pub name: String,
    /// User on the remote system.
    pub username: String,
    password: String,
    /// Route lifetime.
    pub kind: RouteKind,
}

impl RemoteRouteConfig {
    /// Creates a static remote route configuration.
    pub fn new(
        name: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            username: username.into(),
            password: password.into(),
            kind: RouteKind::Static,
        }
    }

    /// Marks the route as temporary.
    pub fn temporary(mut self) -> Self {
        self.kind = RouteKind::Temporary;
        self
    }

    /// Encodes the request asking the system at `remote_ip` to add a route
    /// to `net_id`, reachable at `host`.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::InvalidParameter` if a string is too long for its
    /// tag.
    pub fn to_request(
        &self,
        remote_ip: Ipv4Addr,
        net_id: &AmsNetId,
        host: &str,
    ) -> Result<Vec<u8>> {
        let tag_count: u8 = match self.kind {
            RouteKind::Static => 5,
            RouteKind::Temporary => 6,
        };
        let mut request = RequestWriter::new();
        request
            .bytes(&[2, 0, 191, 3])
            .ipv4(remote_ip)
            .zeros(8)
            .bytes(&[3, 102, 20, 113])
            .zeros(4)
            .u8(6)
            .zeros(3)
            .net_id(net_id)
            .bytes(&[16, 39])
            .u8(tag_count)
            .zeros(3);
        string_tag(&mut request, TAG_ROUTE_NAME, &self.name)?;
        request.bytes(&[TAG_NET_ID, 0, 6, 0]).net_id(net_id);
        string_tag(&mut request, TAG_USERNAME, &self.username)?;
        string_tag(&mut request, TAG_PASSWORD, &self.password)?;
        string_tag(&mut request, TAG_HOST, host)?;
        if self.kind == RouteKind::Temporary {
            request.bytes(&[TAG_TEMPORARY, 0, 4, 0]).u32(1);
        }
        Ok(request.into_bytes())
    }
}

impl std::fmt::Debug for RemoteRouteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRouteConfig")
            .field("name", &self.name)
            .field("username", &self.username)
            .field("password", &"***")
            .field("kind", &self.kind)
            .finish()
    }
}

fn string_tag(request: &mut RequestWriter, tag: u8, value: &str) -> Result<()> {
    let len = string_prefix(value)?;
    request.bytes(&[tag, 0, len, 0]).string(value);
    Ok(())
}

/// Returns true if `ip` lies in the subnet of `nic`.
fn same_subnet(nic: &NetworkInterfaceInfo, ip: Ipv4Addr) -> bool {
    match (nic.ip(), nic.mask()) {
        (Some(own), Some(mask)) => {
            let mask = u32::from(mask);
            u32::from(own) & mask == u32::from(ip) & mask
        }
        _ => false,
    }
}

/// One entry of the device's route table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RouteEntry {
    /// Net ID of the route target.
    pub net_id: AmsNetId,
    /// Display name.
    pub name: String,
    /// IPv4 address or host name.
    pub address: String,
}

impl RouteEntry {
    /// Decodes a route enumeration record.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::Decode` if the record is shorter than its header.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = ReadCursor::new(data);
        let net_id = cursor.net_id()?;
        cursor.skip(ROUTE_HEADER_SIZE - 6)?;
        let address = cursor.string_until_nul()?;
        let name = cursor.string_until_nul()?;
        Ok(Self {
            net_id,
            name,
            address,
        })
    }
}

/// One network adapter of the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkInterfaceInfo {
    /// Adapter id (a GUID on Windows targets).
    pub id: String,
    /// Adapter description.
    pub name: String,
    /// IPv4 address as reported.
    pub ip_address: String,
    /// Subnet mask as reported.
    pub subnet_mask: String,
    /// Default gateway as reported.
    pub default_gateway: String,
    /// DHCP server as reported.
    pub dhcp_server: String,
}

impl NetworkInterfaceInfo {
    /// Returns the parsed IPv4 address, if it is set and valid.
    ///
    /// `0.0.0.0` counts as not set.
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.ip_address
            .trim()
            .parse()
            .ok()
            .filter(|ip: &Ipv4Addr| !ip.is_unspecified())
    }

    /// Returns the parsed subnet mask, if valid.
    pub fn mask(&self) -> Option<Ipv4Addr> {
        self.subnet_mask.trim().parse().ok()
    }
}

/// Decodes the adapter table returned by the IP helper service.
///
/// The first `u32` holds the size of one adapter record; the table holds as
/// many whole records as fit.
///
/// # Errors
///
/// Returns `AdsError::Decode` if the record size is smaller than
/// [`MIN_NIC_RECORD_SIZE`] or larger than the table.
pub fn parse_network_interfaces(data: &[u8]) -> Result<Vec<NetworkInterfaceInfo>> {
    let stride = ReadCursor::new(data).u32()? as usize;
    if stride < MIN_NIC_RECORD_SIZE || stride > data.len() {
        return Err(AdsError::decode(format!(
            "adapter record size {} invalid for a {}-byte table",
            stride,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(stride)
        .map(|record| NetworkInterfaceInfo {
            id: strip_nuls(&record[NIC_ID]),
            name: strip_nuls(&record[NIC_NAME]),
            ip_address: strip_nuls(&record[NIC_IP]),
            subnet_mask: strip_nuls(&record[NIC_MASK]),
            default_gateway: strip_nuls(&record[NIC_GATEWAY]),
            dhcp_server: strip_nuls(&record[NIC_DHCP]),
        })
        .collect())
}

impl<C: Connector> AdsClient<C> {
    /// Adds a route to the device's local route table.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use ads_utilities::RouteConfig;
    ///
    /// let route = RouteConfig::new("10.0.0.5.1.1".parse()?, "10.0.0.5", "ENGINEERING-PC");
    /// client.add_route(&route, &cancel).await?;
    /// ```
    pub async fn add_route(&self, route: &RouteConfig, cancel: &CancellationToken) -> Result<()> {
        let request = route.to_bytes()?;
        self.write_bytes(ports::SYSTEM_SERVICE, index::ROUTE_ADD, 0, &request, cancel)
            .await?;
        debug!(net_id = %route.net_id, name = %route.name, kind = ?route.kind, "route added");
        Ok(())
    }

    /// Removes the route called `name`.
    ///
    /// Some devices answer a successful removal with a client timeout; that
    /// code is logged and treated as success.
    pub async fn remove_route(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let mut request = RequestWriter::new();
        request.string(name);
        match self
            .write_bytes(
                ports::SYSTEM_SERVICE,
                index::ROUTE_REMOVE,
                0,
                request.as_bytes(),
                cancel,
            )
            .await
        {
            Err(e) if e.code() == Some(AdsErrorCode::CLIENT_TIMEOUT) => {
                warn!(name, "route removal answered with timeout, assuming success");
                Ok(())
            }
            other => other,
        }
    }

    /// Asks the system at `remote_ip` to add a route back to the device.
    ///
    /// The route points at the address of the device's adapter that shares
    /// a subnet with `remote_ip`.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::InvalidParameter` if no adapter of the device is in
    /// the subnet of `remote_ip`, and the protocol error if the remote system
    /// rejects the request (e.g. wrong credentials).
    pub async fn add_remote_route_by_ip(
        &self,
        remote_ip: Ipv4Addr,
        route: &RemoteRouteConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let interfaces = self.network_interfaces(cancel).await?;
        let host = interfaces
            .iter()
            .find(|nic| same_subnet(nic, remote_ip))
            .and_then(NetworkInterfaceInfo::ip)
            .ok_or_else(|| {
                AdsError::invalid_parameter(
                    "remote_ip",
                    format!("no adapter of the device is in the subnet of {}", remote_ip),
                )
            })?;
        self.send_remote_route(remote_ip, route, &host.to_string(), cancel)
            .await
    }

    /// Asks the system called `remote_host` to add a route back to the device.
    ///
    /// The device resolves `remote_host`; the route points at `local_host`,
    /// the device's own host name as the remote system can resolve it.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::InvalidParameter` if the device cannot resolve
    /// `remote_host`.
    pub async fn add_remote_route_by_name(
        &self,
        remote_host: &str,
        local_host: &str,
        route: &RemoteRouteConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let remote_ip = self
            .ip_from_hostname(remote_host, cancel)
            .await?
            .ok_or_else(|| {
                AdsError::invalid_parameter(
                    "remote_host",
                    format!("{} could not be resolved", remote_host),
                )
            })?;
        self.send_remote_route(remote_ip, route, local_host, cancel)
            .await
    }

    /// Adds `route` to the device and a matching route back on the remote
    /// system, whose IPv4 address is `route.address`.
    pub async fn add_route_by_ip(
        &self,
        route: &RouteConfig,
        remote: &RemoteRouteConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let remote_ip: Ipv4Addr = route.address.trim().parse().map_err(|_| {
            AdsError::invalid_parameter(
                "address",
                format!("{} is not an IPv4 address", route.address),
            )
        })?;
        self.add_route(route, cancel).await?;
        self.add_remote_route_by_ip(remote_ip, remote, cancel).await
    }

    /// Adds `route` to the device and a matching route back on the remote
    /// system, whose host name is `route.address`.
    pub async fn add_route_by_name(
        &self,
        route: &RouteConfig,
        remote: &RemoteRouteConfig,
        local_host: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.add_route(route, cancel).await?;
        self.add_remote_route_by_name(&route.address, local_host, remote, cancel)
            .await
    }

    async fn send_remote_route(
        &self,
        remote_ip: Ipv4Addr,
        route: &RemoteRouteConfig,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = route.to_request(remote_ip, &self.net_id(), host)?;
        self.read_write_bytes(
            ports::SYSTEM_SERVICE,
            index::BROADCAST,
            offset::BROADCAST_RECEIVE,
            REMOTE_ROUTE_ANSWER_SIZE,
            &request,
            cancel,
        )
        .await?;
        debug!(%remote_ip, name = %route.name, host, kind = ?route.kind, "remote route added");
        Ok(())
    }

    /// Lists the device's route table.
    ///
    /// Reads entries by index until the device reports an error or
    /// [`MAX_ROUTES`] entries have been read.
    pub async fn routes(&self, cancel: &CancellationToken) -> Result<Vec<RouteEntry>> {
        let mut session = self.open_session(ports::SYSTEM_SERVICE, cancel).await?;
        let result: Result<Vec<RouteEntry>> = async {
            let mut routes = Vec::new();
            for i in 0..MAX_ROUTES {
                let data = match client::read(
                    &mut session,
                    index::ROUTE_ENUM,
                    i,
                    ROUTE_RECORD_SIZE,
                    cancel,
                )
                .await
                {
                    Ok(data) => data,
                    Err(AdsError::Protocol { code }) => {
                        debug!(count = routes.len(), %code, "route enumeration finished");
                        break;
                    }
                    Err(e) => return Err(e),
                };
                routes.push(RouteEntry::from_bytes(&data)?);
            }
            Ok(routes)
        }
        .await;
        release(session, result).await
    }

    /// Resolves a host name on the device.
    ///
    /// Returns `None` if the device could not resolve it.
    pub async fn ip_from_hostname(
        &self,
        hostname: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Ipv4Addr>> {
        let mut request = RequestWriter::new();
        request.string(hostname);
        let data = self
            .read_write_bytes(
                ports::SYSTEM_SERVICE,
                index::IP_HELPER,
                offset::IP_HELPER_HOST_TO_IP,
                4,
                request.as_bytes(),
                cancel,
            )
            .await?;
        let ip = ReadCursor::new(&data).ipv4()?;
        Ok(if ip.is_unspecified() { None } else { Some(ip) })
    }

    /// Reads the device fingerprint.
    pub async fn fingerprint(&self, cancel: &CancellationToken) -> Result<String> {
        let data = self
            .read_bytes(
                ports::SYSTEM_SERVICE,
                index::SYSTEM_INFO,
                offset::SYSTEM_INFO_FINGERPRINT,
                FINGERPRINT_SIZE,
                cancel,
            )
            .await?;
        Ok(nul_terminated(&data))
    }

    /// Reads the device's network adapters.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::Decode` if the device announces a table larger than
    /// [`MAX_ADAPTER_TABLE_SIZE`] or returns a malformed one.
    pub async fn network_interfaces(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<NetworkInterfaceInfo>> {
        let mut session = self.open_session(ports::SYSTEM_SERVICE, cancel).await?;
        let result: Result<Vec<u8>> = async {
            let size = client::read(
                &mut session,
                index::IP_HELPER,
                offset::IP_HELPER_ADAPTERS,
                4,
                cancel,
            )
            .await?;
            let size = announced_length(ReadCursor::new(&size).u32()?, 1, MAX_ADAPTER_TABLE_SIZE)?;
            client::read(
                &mut session,
                index::IP_HELPER,
                offset::IP_HELPER_ADAPTERS,
                size,
                cancel,
            )
            .await
        }
        .await;
        let table = release(session, result).await?;
        parse_network_interfaces(&table)
    }
}
