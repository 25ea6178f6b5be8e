//! I/O device enumeration.
//!
//! The I/O runtime lists its devices (EtherCAT masters, fieldbus cards) by
//! id. Each device reports its own Net ID, a name and the boxes configured
//! below it.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::address::{ports, AmsNetId};
use crate::client::{self, release, AdsClient};
use crate::codec::{announced_length, ReadCursor};
use crate::error::{AdsError, Result};
use crate::index::{self, offset};
use crate::transport::Connector;

/// Size of the device id list: a count and up to 200 ids.
const DEVICE_LIST_SIZE: usize = 402;

/// Upper bound on the device info length the runtime may announce.
pub const MAX_IO_DEVICE_INFO_SIZE: usize = 64 * 1024;

/// One box (slave) below an I/O device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IoBox {
    /// Box id within the device.
    pub id: u32,
    /// Configured name.
    pub name: String,
    /// ADS port of the box, its EtherCAT address for EtherCAT slaves.
    pub port: u16,
}

/// One I/O device with its boxes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IoDevice {
    /// Device id within the I/O runtime.
    pub id: u32,
    /// Configured name.
    pub name: String,
    /// Net ID the device is reachable on.
    pub net_id: AmsNetId,
    /// Box count as announced by the device.
    pub box_count: u32,
    /// Boxes decoded from the device info.
    pub boxes: Vec<IoBox>,
}

/// Decodes the device id list: a `u16` count, then one `u16` id per device.
pub fn parse_io_device_ids(data: &[u8]) -> Result<Vec<u16>> {
    let mut cursor = ReadCursor::new(data);
    let count = cursor.u16()?;
    (0..count).map(|_| cursor.u16()).collect()
}

/// Decodes the full info block of the device `id`.
///
/// The master part is followed by box records until the block ends.
pub fn parse_io_device_info(id: u32, data: &[u8]) -> Result<IoDevice> {
    let mut cursor = ReadCursor::new(data);
    let _length = cursor.u32()?;
    cursor.skip(2)?;
    cursor.skip(4)?;
    let box_count = u32::from(cursor.u8()?);
    cursor.skip(1)?;
    let net_id = cursor.net_id()?;
    cursor.skip(2)?;
    let name = cursor.prefixed_string()?;

    let mut boxes = Vec::new();
    while !cursor.is_empty() {
        cursor.skip(2)?;
        let box_id = u32::from(cursor.u8()?);
        cursor.skip(1)?;
        cursor.skip(2)?;
        let port = cursor.u16()?;
        // Net ID of the owning device, then a port copy that is often zero.
        cursor.skip(6)?;
        cursor.skip(2)?;
        let box_name = cursor.prefixed_string()?;
        boxes.push(IoBox {
            id: box_id,
            name: box_name,
            port,
        });
    }

    Ok(IoDevice {
        id,
        name,
        net_id,
        box_count,
        boxes,
    })
}

impl<C: Connector> AdsClient<C> {
    /// Lists every I/O device with its boxes.
    pub async fn io_devices(&self, cancel: &CancellationToken) -> Result<Vec<IoDevice>> {
        let data = self
            .read_bytes(
                ports::IO,
                index::IO_DEVICE_STATE_BASE,
                offset::IO_DEVICE_IDS,
                DEVICE_LIST_SIZE,
                cancel,
            )
            .await?;
        let ids = parse_io_device_ids(&data)?;
        debug!(count = ids.len(), "I/O devices listed");
        let mut devices = Vec::with_capacity(ids.len());
        for id in ids {
            devices.push(self.io_device_info(u32::from(id), cancel).await?);
        }
        Ok(devices)
    }

    /// Reads the info block of one I/O device.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::Decode` if the device announces more than
    /// [`MAX_IO_DEVICE_INFO_SIZE`] bytes or the block is malformed.
    pub async fn io_device_info(&self, id: u32, cancel: &CancellationToken) -> Result<IoDevice> {
        let group = index::IO_DEVICE_STATE_BASE.checked_add(id).ok_or_else(|| {
            AdsError::invalid_parameter("id", format!("device id {} out of range", id))
        })?;
        let mut session = self.open_session(ports::IO, cancel).await?;
        let result = async {
            let length =
                client::read(&mut session, group, offset::IO_DEVICE_FULL_INFO, 4, cancel).await?;
            let length =
                announced_length(ReadCursor::new(&length).u32()?, 1, MAX_IO_DEVICE_INFO_SIZE)?;
            client::read(&mut session, group, offset::IO_DEVICE_FULL_INFO, length, cancel).await
        }
        .await;
        let data = release(session, result).await?;
        parse_io_device_info(id, &data)
    }
}
