//! Index groups and offsets of the ADS system service and related ports.
//!
//! Values are part of the wire protocol and must not change.

// Some of these are undocumented; names follow their use.
#![allow(missing_docs)]

/// Open a file. Offset is [`OpenMode`](crate::OpenMode) bits ORed with a
/// [`BaseDirectory`](crate::BaseDirectory) selector; write data is the path.
pub const FILE_OPEN: u32 = 120;
/// Close a file. Offset is the file handle.
pub const FILE_CLOSE: u32 = 121;
/// Read from a file. Offset is the file handle.
pub const FILE_READ: u32 = 122;
/// Write to a file. Offset is the file handle.
pub const FILE_WRITE: u32 = 123;
/// Delete a file. Offset is the base directory selector.
pub const FILE_DELETE: u32 = 131;
/// Rename a file. Write data is the old and the new path.
pub const FILE_RENAME: u32 = 132;
/// Find files. Offset is the path selector for the first call, then the
/// previous record's handle.
pub const FILE_FIND: u32 = 133;
/// Create a directory.
pub const MKDIR: u32 = 138;
/// Remove a directory.
pub const RMDIR: u32 = 139;
/// Broadcast search. Offset 0 carries responses, offset 1 sends search requests.
pub const BROADCAST: u32 = 141;

/// Registry access (HKEY_LOCAL_MACHINE).
pub const REGISTRY_HKLM: u32 = 200;
/// Time services; offset 1 reads the system time.
pub const TIME_SERVICES: u32 = 400;
/// Start a process.
pub const START_PROCESS: u32 = 500;

/// System information. Offset 1 is the XML description, offset 9 the
/// fingerprint.
pub const SYSTEM_INFO: u32 = 700;
/// IP helper API. Offset 1 reads adapter info, offset 4 resolves a host name.
pub const IP_HELPER: u32 = 701;

/// Add a route. Offset 0.
pub const ROUTE_ADD: u32 = 801;
/// Remove a route. Offset 0, write data is the route name.
pub const ROUTE_REMOVE: u32 = 802;
/// Enumerate routes. Offset is the route index.
pub const ROUTE_ENUM: u32 = 803;

/// License server: per-device information. Offset selects the field.
pub const LICENSE_INFO: u32 = 0x0101_0004;
/// License server: online license list.
pub const LICENSE_ONLINE: u32 = 0x0101_0006;
/// License server: license name lookup by id.
pub const LICENSE_NAME: u32 = 0x0101_000C;

/// Router port: router memory status.
pub const ROUTER_STATUS: u32 = 1;
/// Real-time port: per-core usage.
pub const CPU_USAGE: u32 = 1;

/// Event log publisher: live message stream.
pub const EVENT_STREAM: u32 = 777;
/// Event log publisher: message detail lookup.
pub const EVENT_DETAIL: u32 = 500;

/// I/O runtime: device information. Add the device id to address one device.
pub const IO_DEVICE_STATE_BASE: u32 = 0x5000;

/// EtherCAT slave port: CoE object dictionary. Offset is `index << 16 | sub_index`.
pub const COE: u32 = 0xF302;
/// EtherCAT master: master state.
pub const EC_MASTER_STATE: u32 = 0x3;
/// EtherCAT master: configured slave count.
pub const EC_SLAVE_COUNT: u32 = 0x6;
/// EtherCAT master: physical access to a slave's ESC registers (read/write).
pub const EC_PHYSICAL_ACCESS: u32 = 0x8;
/// EtherCAT master: cyclic and queued frame counters.
pub const EC_FRAME_STATISTICS: u32 = 0xC;
/// EtherCAT master: CRC error counters of every slave.
pub const EC_SLAVE_CRC: u32 = 0x12;
/// EtherCAT master: device state bits.
pub const EC_DEVICE_STATE: u32 = 0x45;

pub mod offset {
    //! Index offsets paired with the groups in the parent module.
    #![allow(missing_docs)]

    /// [`FILE_FIND`](super::FILE_FIND) / [`MKDIR`](super::MKDIR) with a plain path.
    pub const PATH_GENERIC: u32 = 1;

    pub const SYSTEM_INFO_XML: u32 = 1;
    pub const SYSTEM_INFO_FINGERPRINT: u32 = 9;

    pub const IP_HELPER_ADAPTERS: u32 = 1;
    pub const IP_HELPER_HOST_TO_IP: u32 = 4;

    pub const TIME_SYSTEM_TIME: u32 = 1;

    pub const BROADCAST_RECEIVE: u32 = 0;
    pub const BROADCAST_SEND: u32 = 1;

    pub const LICENSE_SYSTEM_ID: u32 = 1;
    pub const LICENSE_PLATFORM_LEVEL: u32 = 2;
    pub const LICENSE_VOLUME_NUMBER: u32 = 5;

    pub const ROUTER_STATUS_INFO: u32 = 1;
    pub const CPU_USAGE_ALL: u32 = 15;

    pub const IO_DEVICE_IDS: u32 = 1;
    pub const IO_DEVICE_FULL_INFO: u32 = 8;

    pub const EC_MASTER_STATE: u32 = 0x100;
}
