//! EtherCAT master diagnostics and slave access.
//!
//! Point the client at the Net ID of the EtherCAT master device. Master-wide
//! queries then go to [`ports::ETHERCAT_MASTER`], and each slave is reached
//! on a port equal to its EtherCAT address.
//!
//! | Method | Target | Result |
//! |--------|--------|--------|
//! | [`read_coe`](AdsClient::read_coe) / [`write_coe`](AdsClient::write_coe) | slave port | CoE object data |
//! | [`read_esc_register`](AdsClient::read_esc_register) / [`write_esc_register`](AdsClient::write_esc_register) | master | ESC register value |
//! | [`ec_frame_statistics`](AdsClient::ec_frame_statistics) | master | Frame rates and losses |
//! | [`ec_master_device_state`](AdsClient::ec_master_device_state) | master | [`EcDeviceState`] bits |
//! | [`ec_master_state`](AdsClient::ec_master_state) | master | [`EcState`] |
//! | [`ec_slave_crcs`](AdsClient::ec_slave_crcs) | master | CRC counter per slave |

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::address::ports;
use crate::client::{self, release, AdsClient};
use crate::codec::{announced_length, ReadCursor, RequestWriter};
use crate::error::{AdsError, Result};
use crate::index::{self, offset};
use crate::transport::{Connector, Session};

/// Size of the frame counter block.
const FRAME_COUNTERS_SIZE: usize = 20;

/// Pause between the two frame counter samples.
pub const FRAME_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// Sample pairs taken before giving up on wrapped counters.
const FRAME_SAMPLE_ATTEMPTS: usize = 5;

/// Deltas at or above this value mean a counter wrapped between samples.
const COUNTER_WRAP: u32 = 0x8000_0000;

/// Frame counter ticks per second (100 ns resolution).
const TICKS_PER_SECOND: f64 = 10_000_000.0;

/// ESC access header: command, index, slave address, register, length, irq.
const ESC_HEADER_SIZE: usize = 10;
/// Working counter trailing the data of an ESC access.
const ESC_TRAILER_SIZE: usize = 2;

/// Upper bound on the slave count the master may announce.
pub const MAX_SLAVE_COUNT: usize = 4096;

/// Builds the index offset of a CoE object entry.
///
/// # Example
///
/// ```
/// use ads_utilities::ethercat::coe_offset;
///
/// assert_eq!(coe_offset(0x1018, 2), 0x1018_0002);
/// ```
pub fn coe_offset(index: u16, sub_index: u16) -> u32 {
    (u32::from(index) << 16) | u32::from(sub_index)
}

/// How a slave is addressed on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SlaveAddressing {
    /// Configured station address (e.g. 1001).
    #[default]
    Fixed,
    /// Position on the bus, counted from zero downwards.
    AutoIncrement,
}

impl SlaveAddressing {
    /// EtherCAT read command (`FPRD` or `APRD`).
    pub fn read_command(self) -> u8 {
        match self {
            SlaveAddressing::AutoIncrement => 1,
            SlaveAddressing::Fixed => 4,
        }
    }

    /// EtherCAT write command (`FPWR` or `APWR`).
    pub fn write_command(self) -> u8 {
        match self {
            SlaveAddressing::AutoIncrement => 2,
            SlaveAddressing::Fixed => 5,
        }
    }
}

/// Builds a physical ESC access request.
///
/// The data area is `data` for writes and zeros of the register width for
/// reads; a zero working counter follows it.
///
/// # Errors
///
/// Returns `AdsError::InvalidParameter` if `data` does not fit a 16-bit length.
pub fn esc_request(command: u8, slave: u16, register: u16, data: &[u8]) -> Result<Vec<u8>> {
    let length = u16::try_from(data.len()).map_err(|_| {
        AdsError::invalid_parameter("data", format!("{} bytes exceed a 16-bit length", data.len()))
    })?;
    let mut request =
        RequestWriter::with_capacity(ESC_HEADER_SIZE + data.len() + ESC_TRAILER_SIZE);
    request
        .u8(command)
        .u8(0)
        .u16(slave)
        .u16(register)
        .u16(length)
        .u16(0)
        .bytes(data)
        .u16(0);
    Ok(request.into_bytes())
}

bitflags! {
    /// Device state bits of the EtherCAT master.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct EcDeviceState: u16 {
        /// Link error.
        const LINK_ERROR = 0x0001;
        /// I/O locked after a link error; needs an I/O reset.
        const IO_LOCKED = 0x0002;
        /// Link error on the redundancy adapter.
        const REDUNDANCY_LINK_ERROR = 0x0004;
        /// A frame went missing in redundancy mode.
        const MISSING_FRAME = 0x0008;
        /// Out of send resources; needs an I/O reset.
        const OUT_OF_SEND_RESOURCES = 0x0010;
        /// Watchdog triggered.
        const WATCHDOG = 0x0020;
        /// Ethernet miniport driver not found.
        const DRIVER_NOT_FOUND = 0x0040;
        /// I/O reset active.
        const IO_RESET_ACTIVE = 0x0080;
        /// At least one slave in INIT.
        const SLAVE_IN_INIT = 0x0100;
        /// At least one slave in PRE-OP.
        const SLAVE_IN_PREOP = 0x0200;
        /// At least one slave in SAFE-OP.
        const SLAVE_IN_SAFEOP = 0x0400;
        /// At least one slave reports an error.
        const SLAVE_ERROR = 0x0800;
        /// Distributed clocks not in sync.
        const DC_NOT_IN_SYNC = 0x1000;
    }
}

impl EcDeviceState {
    /// Returns true if no fault bit is set.
    ///
    /// Slave state bits alone do not count as faults.
    pub fn is_healthy(self) -> bool {
        let states = Self::SLAVE_IN_INIT | Self::SLAVE_IN_PREOP | Self::SLAVE_IN_SAFEOP;
        self.difference(states).is_empty()
    }
}

/// EtherCAT state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EcState {
    /// INIT
    Init,
    /// PRE-OP
    PreOp,
    /// BOOT
    Bootstrap,
    /// SAFE-OP
    SafeOp,
    /// OP
    Op,
    /// Any other value, e.g. with the error bit set.
    Unknown(u16),
}

impl From<u16> for EcState {
    fn from(raw: u16) -> Self {
        match raw {
            0x01 => EcState::Init,
            0x02 => EcState::PreOp,
            0x03 => EcState::Bootstrap,
            0x04 => EcState::SafeOp,
            0x08 => EcState::Op,
            other => EcState::Unknown(other),
        }
    }
}

impl fmt::Display for EcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcState::Init => f.write_str("INIT"),
            EcState::PreOp => f.write_str("PRE-OP"),
            EcState::Bootstrap => f.write_str("BOOT"),
            EcState::SafeOp => f.write_str("SAFE-OP"),
            EcState::Op => f.write_str("OP"),
            EcState::Unknown(raw) => write!(f, "0x{:04X}", raw),
        }
    }
}

/// One sample of the master's frame counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameCounters {
    /// Master time in 100 ns ticks.
    pub system_time: u32,
    /// Cyclic frames sent.
    pub cyclic_frames: u32,
    /// Cyclic frames lost.
    pub cyclic_lost: u32,
    /// Queued frames sent.
    pub queued_frames: u32,
    /// Queued frames lost.
    pub queued_lost: u32,
}

impl FrameCounters {
    /// Decodes the 20-byte counter block.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = ReadCursor::new(data);
        Ok(Self {
            system_time: cursor.u32()?,
            cyclic_frames: cursor.u32()?,
            cyclic_lost: cursor.u32()?,
            queued_frames: cursor.u32()?,
            queued_lost: cursor.u32()?,
        })
    }
}

/// Frame rates and loss counters of the EtherCAT master.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameStatistics {
    /// Cyclic frames per second.
    pub frames_per_second: f64,
    /// Queued (acyclic) frames per second.
    pub queued_frames_per_second: f64,
    /// Lost cyclic frames since start.
    pub cyclic_lost_frames: u32,
    /// Lost queued frames since start.
    pub queued_lost_frames: u32,
}

impl FrameStatistics {
    /// Derives rates from two samples.
    ///
    /// Returns `None` when no time passed or a counter wrapped in between.
    pub fn between(earlier: &FrameCounters, later: &FrameCounters) -> Option<Self> {
        let delta_time = later.system_time.wrapping_sub(earlier.system_time);
        let delta_frames = later.cyclic_frames.wrapping_sub(earlier.cyclic_frames);
        let delta_queued = later.queued_frames.wrapping_sub(earlier.queued_frames);
        if delta_time == 0 || delta_time >= COUNTER_WRAP || delta_frames >= COUNTER_WRAP {
            return None;
        }
        let seconds = f64::from(delta_time) / TICKS_PER_SECOND;
        Some(Self {
            frames_per_second: f64::from(delta_frames) / seconds,
            queued_frames_per_second: f64::from(delta_queued) / seconds,
            cyclic_lost_frames: later.cyclic_lost,
            queued_lost_frames: later.queued_lost,
        })
    }
}

impl<C: Connector> AdsClient<C> {
    /// Reads `length` bytes of a CoE object entry from the slave at `slave_port`.
    pub async fn read_coe(
        &self,
        slave_port: u16,
        index: u16,
        sub_index: u16,
        length: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.read_bytes(
            slave_port,
            index::COE,
            coe_offset(index, sub_index),
            length,
            cancel,
        )
        .await
    }

    /// Writes a CoE object entry on the slave at `slave_port`.
    pub async fn write_coe(
        &self,
        slave_port: u16,
        index: u16,
        sub_index: u16,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.write_bytes(
            slave_port,
            index::COE,
            coe_offset(index, sub_index),
            data,
            cancel,
        )
        .await?;
        debug!(slave_port, index, sub_index, len = data.len(), "CoE entry written");
        Ok(())
    }

    /// Reads a 16-bit ESC register of one slave through the master.
    pub async fn read_esc_register(
        &self,
        slave: u16,
        addressing: SlaveAddressing,
        register: u16,
        cancel: &CancellationToken,
    ) -> Result<u16> {
        let request = esc_request(addressing.read_command(), slave, register, &[0; 2])?;
        let response = self
            .read_write_bytes(
                ports::ETHERCAT_MASTER,
                index::EC_PHYSICAL_ACCESS,
                0,
                request.len(),
                &request,
                cancel,
            )
            .await?;
        let mut cursor = ReadCursor::new(&response);
        cursor.skip(ESC_HEADER_SIZE)?;
        cursor.u16()
    }

    /// Writes `value` to an ESC register of one slave through the master.
    pub async fn write_esc_register(
        &self,
        slave: u16,
        addressing: SlaveAddressing,
        register: u16,
        value: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = esc_request(addressing.write_command(), slave, register, value)?;
        self.read_write_bytes(
            ports::ETHERCAT_MASTER,
            index::EC_PHYSICAL_ACCESS,
            0,
            request.len(),
            &request,
            cancel,
        )
        .await?;
        debug!(slave, ?addressing, register, len = value.len(), "ESC register written");
        Ok(())
    }

    /// Samples the frame counters twice, [`FRAME_SAMPLE_INTERVAL`] apart, and
    /// derives the frame rates.
    ///
    /// A sample pair with a wrapped counter is retried.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::Decode` if every sample pair wrapped, and
    /// `AdsError::Cancelled` if `cancel` fires while waiting.
    pub async fn ec_frame_statistics(&self, cancel: &CancellationToken) -> Result<FrameStatistics> {
        let mut session = self.open_session(ports::ETHERCAT_MASTER, cancel).await?;
        let result = async {
            for attempt in 1..=FRAME_SAMPLE_ATTEMPTS {
                let earlier = read_frame_counters(&mut session, cancel).await?;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AdsError::Cancelled),
                    _ = tokio::time::sleep(FRAME_SAMPLE_INTERVAL) => {}
                }
                let later = read_frame_counters(&mut session, cancel).await?;
                match FrameStatistics::between(&earlier, &later) {
                    Some(statistics) => return Ok(statistics),
                    None => debug!(attempt, "frame counters wrapped, sampling again"),
                }
            }
            Err(AdsError::decode(format!(
                "frame counters wrapped in {} sample pairs",
                FRAME_SAMPLE_ATTEMPTS
            )))
        }
        .await;
        release(session, result).await
    }

    /// Reads the device state bits of the master.
    pub async fn ec_master_device_state(
        &self,
        cancel: &CancellationToken,
    ) -> Result<EcDeviceState> {
        let raw = self
            .read_u16(ports::ETHERCAT_MASTER, index::EC_DEVICE_STATE, 0, cancel)
            .await?;
        Ok(EcDeviceState::from_bits_retain(raw))
    }

    /// Reads the state of the master's own state machine.
    pub async fn ec_master_state(&self, cancel: &CancellationToken) -> Result<EcState> {
        let raw = self
            .read_u16(
                ports::ETHERCAT_MASTER,
                index::EC_MASTER_STATE,
                offset::EC_MASTER_STATE,
                cancel,
            )
            .await?;
        Ok(EcState::from(raw))
    }

    /// Reads the CRC error counter of every configured slave, in bus order.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::Decode` if the master announces more than
    /// [`MAX_SLAVE_COUNT`] slaves or returns fewer counters than announced.
    pub async fn ec_slave_crcs(&self, cancel: &CancellationToken) -> Result<Vec<u32>> {
        let mut session = self.open_session(ports::ETHERCAT_MASTER, cancel).await?;
        let result = async {
            let count = client::read(&mut session, index::EC_SLAVE_COUNT, 0, 2, cancel).await?;
            let count = ReadCursor::new(&count).u16()?;
            let expected = announced_length(u32::from(count), 4, MAX_SLAVE_COUNT * 4)?;
            if expected == 0 {
                return Ok(Vec::new());
            }
            let data = client::read(&mut session, index::EC_SLAVE_CRC, 0, expected, cancel).await?;
            if data.len() != expected {
                return Err(AdsError::decode(format!(
                    "expected {} CRC bytes, got {}",
                    expected,
                    data.len()
                )));
            }
            Ok(data
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect())
        }
        .await;
        release(session, result).await
    }
}

async fn read_frame_counters<S: Session>(
    session: &mut S,
    cancel: &CancellationToken,
) -> Result<FrameCounters> {
    let data = client::read(
        session,
        index::EC_FRAME_STATISTICS,
        0,
        FRAME_COUNTERS_SIZE,
        cancel,
    )
    .await?;
    FrameCounters::from_bytes(&data)
}
