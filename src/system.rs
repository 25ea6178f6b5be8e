//! System service, router and license queries.
//!
//! This module adds single-shot device queries to [`AdsClient`]:
//!
//! | Method | Port | Result |
//! |--------|------|--------|
//! | [`system_time`](AdsClient::system_time) | system service | Device clock |
//! | [`system_info_xml`](AdsClient::system_info_xml) | system service | Raw system info document |
//! | [`cpu_usage`](AdsClient::cpu_usage) | real-time | Per-core load and latency |
//! | [`router_status`](AdsClient::router_status) | router | Router memory and registrations |
//! | [`available_router_memory`](AdsClient::available_router_memory) | router | Free router memory |
//! | [`platform_level`](AdsClient::platform_level) | license server | Platform level |
//! | [`system_id`](AdsClient::system_id) | license server | System id |
//! | [`volume_number`](AdsClient::volume_number) | license server | Volume number |
//! | [`licenses`](AdsClient::licenses) | license server | Online licenses |
//!
//! Registry access goes through the system service and is limited to
//! `HKEY_LOCAL_MACHINE`.

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::address::{ports, AmsNetId};
use crate::client::{self, release, AdsClient};
use crate::codec::{announced_length, nul_terminated, ReadCursor, RequestWriter};
use crate::error::{AdsError, Result};
use crate::index::{self, offset};
use crate::transport::Connector;
use crate::utils::{filetime_to_utc, system_time_to_naive};

/// Size of a SYSTEMTIME record.
const SYSTEM_TIME_SIZE: usize = 16;

/// Size of one per-core record; the read buffer holds up to 100 cores.
const CPU_RECORD_SIZE: usize = 24;
const CPU_BUFFER_SIZE: usize = CPU_RECORD_SIZE * 100;

const ROUTER_STATUS_SIZE: usize = 32;
const SYSTEM_INFO_SIZE: usize = 2048;
const LICENSE_RECORD_SIZE: usize = 48;
/// Upper bound on the license count a device may announce.
pub const MAX_LICENSE_COUNT: usize = 4096;
const LICENSE_NAME_SIZE: usize = 64;

/// Registry key holding the Net ID the runtime applies on its next start.
const NET_ID_KEY: &str = r"Software\Beckhoff\TwinCAT3\System";
const NET_ID_VALUE: &str = "RequestedAmsNetId";

/// Load and latency of one real-time core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CpuUsage {
    /// Core number.
    pub cpu: u8,
    /// Utilization in percent.
    pub utilization: u8,
    /// Current system latency in microseconds.
    pub latency: u16,
    /// Latency warning threshold in microseconds.
    pub latency_warning: u16,
}

/// Decodes the per-core table; a trailing partial record is ignored.
pub fn parse_cpu_usage(data: &[u8]) -> Vec<CpuUsage> {
    data.chunks_exact(CPU_RECORD_SIZE)
        .map(|record| CpuUsage {
            cpu: record[0],
            utilization: record[16],
            latency: u16::from_le_bytes([record[8], record[9]]),
            latency_warning: u16::from_le_bytes([record[12], record[13]]),
        })
        .collect()
}

/// Decodes a SYSTEMTIME record.
///
/// # Errors
///
/// Returns `AdsError::Decode` if the record is short or not a valid date.
pub fn parse_system_time(data: &[u8]) -> Result<NaiveDateTime> {
    let mut cursor = ReadCursor::new(data);
    let year = cursor.u16()?;
    let month = cursor.u16()?;
    let _day_of_week = cursor.u16()?;
    let day = cursor.u16()?;
    let hour = cursor.u16()?;
    let minute = cursor.u16()?;
    let second = cursor.u16()?;
    let millisecond = cursor.u16()?;
    system_time_to_naive(year, month, day, hour, minute, second, millisecond).ok_or_else(|| {
        AdsError::decode(format!(
            "invalid system time {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            year, month, day, hour, minute, second
        ))
    })
}

/// Router memory and registration counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RouterStatus {
    /// Bytes reserved for the router.
    pub memory_reserved: u32,
    /// Bytes still available.
    pub memory_available: u32,
    /// Registered ports.
    pub registered_ports: u32,
    /// Registered drivers.
    pub registered_drivers: u32,
}

impl RouterStatus {
    /// Decodes the router status block.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = ReadCursor::new(data);
        Ok(Self {
            memory_reserved: cursor.u32()?,
            memory_available: cursor.u32()?,
            registered_ports: cursor.u32()?,
            registered_drivers: cursor.u32()?,
        })
    }
}

/// Validation state of a license.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LicenseState {
    /// Valid.
    Valid,
    /// Valid, activation pending.
    ValidPending,
    /// Valid trial license.
    ValidTrial,
    /// Valid OEM license.
    ValidOem,
    /// Any other result code.
    Other(u32),
}

impl From<u32> for LicenseState {
    fn from(code: u32) -> Self {
        match code {
            0 => LicenseState::Valid,
            515 => LicenseState::ValidPending,
            596 => LicenseState::ValidTrial,
            597 => LicenseState::ValidOem,
            other => LicenseState::Other(other),
        }
    }
}

/// One license known to the license server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LicenseInfo {
    /// License id.
    pub id: Uuid,
    /// Expiry, `None` for licenses that never expire.
    pub expires: Option<DateTime<Utc>>,
    /// Licensed instance count.
    pub count: u32,
    /// Instances in use.
    pub used: u32,
    /// Validation state.
    pub state: LicenseState,
    /// Volume number the license is bound to.
    pub volume_number: u32,
}

impl LicenseInfo {
    /// Decodes one 48-byte license record.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = ReadCursor::new(data);
        let id = Uuid::from_bytes_le(cursor.array::<16>()?);
        let expires = filetime_to_utc(cursor.u64()?);
        let count = cursor.u32()?;
        let used = cursor.u32()?;
        let state = LicenseState::from(cursor.u32()?);
        let volume_number = cursor.u32()?;
        cursor.skip(8)?;
        Ok(Self {
            id,
            expires,
            count,
            used,
            state,
            volume_number,
        })
    }
}

/// Type of a registry value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegistryValueKind {
    /// `REG_NONE`
    None = 0,
    /// `REG_SZ`
    String = 1,
    /// `REG_EXPAND_SZ`
    ExpandString = 2,
    /// `REG_BINARY`
    Binary = 3,
    /// `REG_DWORD`
    DWord = 4,
    /// `REG_MULTI_SZ`
    MultiString = 7,
    /// `REG_QWORD`
    QWord = 11,
}

/// Builds a registry write request: key, value name, type tag, data.
pub fn registry_write_request(
    subkey: &str,
    value_name: &str,
    kind: RegistryValueKind,
    value: &[u8],
) -> Vec<u8> {
    let mut request =
        RequestWriter::with_capacity(subkey.len() + value_name.len() + 7 + value.len());
    request
        .string(subkey)
        .string(value_name)
        .bytes(&[0, kind as u8, 0, 0, 0])
        .bytes(value);
    request.into_bytes()
}

impl<C: Connector> AdsClient<C> {
    /// Reads the device clock.
    ///
    /// The device reports local time without a zone, so the result is naive.
    pub async fn system_time(&self, cancel: &CancellationToken) -> Result<NaiveDateTime> {
        let data = self
            .read_bytes(
                ports::SYSTEM_SERVICE,
                index::TIME_SERVICES,
                offset::TIME_SYSTEM_TIME,
                SYSTEM_TIME_SIZE,
                cancel,
            )
            .await?;
        parse_system_time(&data)
    }

    /// Reads the system information document as returned by the device.
    pub async fn system_info_xml(&self, cancel: &CancellationToken) -> Result<String> {
        let data = self
            .read_bytes(
                ports::SYSTEM_SERVICE,
                index::SYSTEM_INFO,
                offset::SYSTEM_INFO_XML,
                SYSTEM_INFO_SIZE,
                cancel,
            )
            .await?;
        Ok(nul_terminated(&data))
    }

    /// Reads load and latency of every real-time core.
    pub async fn cpu_usage(&self, cancel: &CancellationToken) -> Result<Vec<CpuUsage>> {
        let data = self
            .read_bytes(
                ports::REALTIME,
                index::CPU_USAGE,
                offset::CPU_USAGE_ALL,
                CPU_BUFFER_SIZE,
                cancel,
            )
            .await?;
        Ok(parse_cpu_usage(&data))
    }

    /// Reads the router status block.
    pub async fn router_status(&self, cancel: &CancellationToken) -> Result<RouterStatus> {
        let data = self
            .read_bytes(
                ports::ROUTER,
                index::ROUTER_STATUS,
                offset::ROUTER_STATUS_INFO,
                ROUTER_STATUS_SIZE,
                cancel,
            )
            .await?;
        RouterStatus::from_bytes(&data)
    }

    /// Reads the router memory still available, in bytes.
    pub async fn available_router_memory(&self, cancel: &CancellationToken) -> Result<u32> {
        Ok(self.router_status(cancel).await?.memory_available)
    }

    /// Reads the platform level of the device.
    pub async fn platform_level(&self, cancel: &CancellationToken) -> Result<u16> {
        self.read_u16(
            ports::LICENSE_SERVER,
            index::LICENSE_INFO,
            offset::LICENSE_PLATFORM_LEVEL,
            cancel,
        )
        .await
    }

    /// Reads the system id.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let id = client.system_id(&cancel).await?;
    /// println!("{}", id.hyphenated());
    /// ```
    pub async fn system_id(&self, cancel: &CancellationToken) -> Result<Uuid> {
        let data = self
            .read_bytes(
                ports::LICENSE_SERVER,
                index::LICENSE_INFO,
                offset::LICENSE_SYSTEM_ID,
                16,
                cancel,
            )
            .await?;
        Ok(Uuid::from_bytes_le(ReadCursor::new(&data).array::<16>()?))
    }

    /// Reads the volume number licenses are bound to.
    pub async fn volume_number(&self, cancel: &CancellationToken) -> Result<u32> {
        self.read_u32(
            ports::LICENSE_SERVER,
            index::LICENSE_INFO,
            offset::LICENSE_VOLUME_NUMBER,
            cancel,
        )
        .await
    }

    /// Lists the licenses known to the license server.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::Decode` if the device returns fewer records than it
    /// announced, or announces more than [`MAX_LICENSE_COUNT`].
    pub async fn licenses(&self, cancel: &CancellationToken) -> Result<Vec<LicenseInfo>> {
        let mut session = self.open_session(ports::LICENSE_SERVER, cancel).await?;
        let result: Result<Vec<LicenseInfo>> = async {
            let count = client::read(&mut session, index::LICENSE_ONLINE, 0, 4, cancel).await?;
            let expected = announced_length(
                ReadCursor::new(&count).u32()?,
                LICENSE_RECORD_SIZE,
                MAX_LICENSE_COUNT * LICENSE_RECORD_SIZE,
            )?;
            if expected == 0 {
                return Ok(Vec::new());
            }
            let data =
                client::read(&mut session, index::LICENSE_ONLINE, 0, expected, cancel).await?;
            if data.len() != expected {
                return Err(AdsError::decode(format!(
                    "expected {} license bytes, got {}",
                    expected,
                    data.len()
                )));
            }
            data.chunks_exact(LICENSE_RECORD_SIZE)
                .map(LicenseInfo::from_bytes)
                .collect()
        }
        .await;
        release(session, result).await
    }

    /// Reads the display name of a license.
    pub async fn license_name(&self, id: Uuid, cancel: &CancellationToken) -> Result<String> {
        let data = self
            .read_write_bytes(
                ports::LICENSE_SERVER,
                index::LICENSE_NAME,
                0,
                LICENSE_NAME_SIZE,
                &id.to_bytes_le(),
                cancel,
            )
            .await?;
        Ok(nul_terminated(&data))
    }

    /// Writes a value below `HKEY_LOCAL_MACHINE`.
    ///
    /// # Arguments
    ///
    /// * `subkey` - Key path, e.g. `Software\Beckhoff\TwinCAT3\System`
    /// * `value_name` - Name of the value
    /// * `kind` - Registry type of `value`
    /// * `value` - Raw value bytes
    pub async fn set_registry_value(
        &self,
        subkey: &str,
        value_name: &str,
        kind: RegistryValueKind,
        value: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = registry_write_request(subkey, value_name, kind, value);
        self.write_bytes(
            ports::SYSTEM_SERVICE,
            index::REGISTRY_HKLM,
            0,
            &request,
            cancel,
        )
        .await?;
        debug!(subkey, value_name, ?kind, len = value.len(), "registry value written");
        Ok(())
    }

    /// Reads up to `size` bytes of a value below `HKEY_LOCAL_MACHINE`.
    pub async fn query_registry_value(
        &self,
        subkey: &str,
        value_name: &str,
        size: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut request = RequestWriter::new();
        request.string(subkey).string(value_name);
        self.read_write_bytes(
            ports::SYSTEM_SERVICE,
            index::REGISTRY_HKLM,
            0,
            size,
            request.as_bytes(),
            cancel,
        )
        .await
    }

    /// Requests a new Net ID for the device.
    ///
    /// The runtime applies the Net ID on its next start; this call does not
    /// restart the device.
    pub async fn change_net_id(&self, net_id: AmsNetId, cancel: &CancellationToken) -> Result<()> {
        self.set_registry_value(
            NET_ID_KEY,
            NET_ID_VALUE,
            RegistryValueKind::Binary,
            &net_id.octets(),
            cancel,
        )
        .await?;
        info!(current = %self.net_id(), requested = %net_id, "net id change requested");
        Ok(())
    }
}
