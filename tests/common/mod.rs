//! In-memory ADS device for integration tests.
//!
//! [`MockDevice`] answers the system service, route, broadcast and event log
//! calls the crate issues, keeps a small file system, and counts sessions,
//! handles and chunk round-trips so tests can check cleanup.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ads_utilities::{
    index, ports, AdsClient, AdsError, AdsErrorCode, AdsResponse, AmsAddress, AmsNetId,
    CancellationToken, ClientConfig, Connector, Notification, NotificationCallback,
    NotificationHandle, NotificationSettings, Result, Session,
};
use async_trait::async_trait;
use chrono::Utc;

/// Net ID of the mock target.
pub const TARGET: AmsNetId = AmsNetId([5, 80, 12, 7, 1, 1]);

/// Stride of the adapter records built by [`adapter_record`].
pub const ADAPTER_STRIDE: usize = 640;

/// 2024-01-01 00:00:00 UTC as FILETIME.
pub const WRITE_TIME: u64 = 133_485_408_000_000_000;

const FILE_RECORD_SIZE: usize = 324;
const FIRST_FILE_HANDLE: u32 = 100;
const FIRST_FIND_HANDLE: u32 = 0x20;

struct OpenFile {
    path: String,
    position: usize,
}

struct Find {
    entries: Vec<Entry>,
    position: usize,
}

#[derive(Clone)]
struct Entry {
    name: String,
    directory: bool,
    size: u64,
}

struct Registration {
    session: u64,
    index_group: u32,
    callback: NotificationCallback,
}

/// Mutable device state, exposed for fixtures and assertions.
#[derive(Default)]
pub struct DeviceState {
    pub files: BTreeMap<String, Vec<u8>>,
    pub directories: BTreeSet<String>,
    /// `(net_id, address, name)` in insertion order.
    pub routes: Vec<(AmsNetId, String, String)>,
    pub route_remove_times_out: bool,
    pub hostnames: HashMap<String, Ipv4Addr>,
    pub adapters: Vec<u8>,
    /// Overrides the announced adapter table size.
    pub adapter_table_size: Option<u32>,
    /// Answers delivered when a search request for the key address arrives.
    pub answers: HashMap<Ipv4Addr, Vec<Vec<u8>>>,
    pub failing_targets: BTreeSet<Ipv4Addr>,
    pub search_requests: Vec<Vec<u8>>,
    /// Event message text by 24-byte event address.
    pub event_messages: HashMap<Vec<u8>, String>,
    /// 48-byte license records.
    pub licenses: Vec<Vec<u8>>,
    /// Overrides the announced license count.
    pub license_count: Option<u32>,
    /// Fixed answers for plain reads and read_writes by `(port, group, offset)`.
    pub values: HashMap<(u16, u32, u32), Vec<u8>>,
    /// Answers for successive plain reads, consumed before `values`.
    pub sequences: HashMap<(u16, u32, u32), VecDeque<Vec<u8>>>,
    pub writes: Vec<(u16, u32, u32, Vec<u8>)>,
    pub unreachable: bool,
    pub sessions_open: usize,
    pub sessions_opened: usize,
    pub chunk_reads: usize,
    pub chunk_writes: usize,
    open_files: HashMap<u32, OpenFile>,
    finds: HashMap<u32, Find>,
    notifications: HashMap<u32, Registration>,
    next_file_handle: u32,
    next_find_handle: u32,
    next_notification: u32,
    next_session: u64,
}

impl DeviceState {
    pub fn open_file_handles(&self) -> usize {
        self.open_files.len()
    }

    pub fn active_notifications(&self) -> usize {
        self.notifications.len()
    }

    fn children(&self, directory: &str) -> Vec<Entry> {
        let prefix = format!("{}/", directory);
        let child = |path: &String| {
            path.strip_prefix(&prefix)
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(str::to_string)
        };
        let mut entries: Vec<Entry> = self
            .directories
            .iter()
            .filter_map(|path| {
                child(path).map(|name| Entry {
                    name,
                    directory: true,
                    size: 0,
                })
            })
            .chain(self.files.iter().filter_map(|(path, data)| {
                child(path).map(|name| Entry {
                    name,
                    directory: false,
                    size: data.len() as u64,
                })
            }))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

/// Shared in-memory device.
#[derive(Default)]
pub struct MockDevice {
    state: Mutex<DeviceState>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        let device = Self::default();
        {
            let mut state = device.state();
            state.next_file_handle = FIRST_FILE_HANDLE;
            state.next_find_handle = FIRST_FIND_HANDLE;
            state.next_notification = 1;
        }
        Arc::new(device)
    }

    pub fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    pub fn add_file(&self, path: &str, data: Vec<u8>) {
        self.state().files.insert(path.to_string(), data);
    }

    pub fn add_directory(&self, path: &str) {
        self.state().directories.insert(path.to_string());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    /// Delivers `data` to every notification registered on `index_group`.
    pub fn emit(&self, index_group: u32, data: &[u8]) {
        let callbacks: Vec<NotificationCallback> = self
            .state()
            .notifications
            .values()
            .filter(|r| r.index_group == index_group)
            .map(|r| Arc::clone(&r.callback))
            .collect();
        for callback in callbacks {
            callback(Notification {
                timestamp: Utc::now(),
                data: data.to_vec(),
            });
        }
    }

    fn handle_read(&self, port: u16, group: u32, offset: u32, out: &mut [u8]) -> AdsResponse {
        let mut state = self.state();
        if let Some(next) = state
            .sequences
            .get_mut(&(port, group, offset))
            .and_then(VecDeque::pop_front)
        {
            return copy_out(out, &next);
        }
        match (port, group) {
            (ports::SYSTEM_SERVICE, index::ROUTE_ENUM) => {
                match state.routes.get(offset as usize) {
                    Some((net_id, address, name)) => {
                        let mut record = net_id.octets().to_vec();
                        record.resize(44, 0);
                        record.extend_from_slice(address.as_bytes());
                        record.push(0);
                        record.extend_from_slice(name.as_bytes());
                        record.push(0);
                        copy_out(out, &record)
                    }
                    None => AdsResponse::error(AdsErrorCode::NOT_FOUND),
                }
            }
            (ports::SYSTEM_SERVICE, index::IP_HELPER) if out.len() == 4 => {
                let size = state
                    .adapter_table_size
                    .unwrap_or(state.adapters.len() as u32);
                copy_out(out, &size.to_le_bytes())
            }
            (ports::SYSTEM_SERVICE, index::IP_HELPER) => copy_out(out, &state.adapters),
            (ports::LICENSE_SERVER, index::LICENSE_ONLINE) if out.len() == 4 => {
                let count = state
                    .license_count
                    .unwrap_or(state.licenses.len() as u32);
                copy_out(out, &count.to_le_bytes())
            }
            (ports::LICENSE_SERVER, index::LICENSE_ONLINE) => {
                copy_out(out, &state.licenses.concat())
            }
            _ => match state.values.get(&(port, group, offset)) {
                Some(value) => copy_out(out, value),
                None => AdsResponse::error(AdsErrorCode::SERVICE_NOT_SUPPORTED),
            },
        }
    }

    fn handle_write(&self, port: u16, group: u32, offset: u32, data: &[u8]) -> AdsResponse {
        let mut deliver = Vec::new();
        let response = {
            let mut state = self.state();
            state.writes.push((port, group, offset, data.to_vec()));
            match group {
                index::FILE_DELETE => {
                    let path = cstr(data);
                    match state.files.remove(&path) {
                        Some(_) => AdsResponse::success(0),
                        None => AdsResponse::error(AdsErrorCode::NOT_FOUND),
                    }
                }
                index::FILE_RENAME => {
                    let old = cstr(data);
                    let new = cstr(&data[old.len() + 1..]);
                    match state.files.remove(&old) {
                        Some(contents) => {
                            state.files.insert(new, contents);
                            AdsResponse::success(0)
                        }
                        None => AdsResponse::error(AdsErrorCode::NOT_FOUND),
                    }
                }
                index::MKDIR => {
                    if state.directories.insert(cstr(data)) {
                        AdsResponse::success(0)
                    } else {
                        AdsResponse::error(AdsErrorCode::ALREADY_EXISTS)
                    }
                }
                index::RMDIR => {
                    let path = cstr(data);
                    if !state.children(&path).is_empty() {
                        AdsResponse::error(AdsErrorCode::ACCESS_DENIED)
                    } else if state.directories.remove(&path) {
                        AdsResponse::success(0)
                    } else {
                        AdsResponse::error(AdsErrorCode::NOT_FOUND)
                    }
                }
                index::ROUTE_ADD => {
                    let net_id = AmsNetId::from_bytes(&data[..6]).unwrap();
                    let address = cstr(&data[44..]);
                    let name = cstr(&data[44 + address.len() + 1..]);
                    state.routes.push((net_id, address, name));
                    AdsResponse::success(0)
                }
                index::ROUTE_REMOVE => {
                    let name = cstr(data);
                    let before = state.routes.len();
                    state.routes.retain(|(_, _, n)| *n != name);
                    if state.route_remove_times_out {
                        AdsResponse::error(AdsErrorCode::CLIENT_TIMEOUT)
                    } else if state.routes.len() < before {
                        AdsResponse::success(0)
                    } else {
                        AdsResponse::error(AdsErrorCode::NOT_FOUND)
                    }
                }
                index::BROADCAST => {
                    let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
                    state.search_requests.push(data.to_vec());
                    if state.failing_targets.contains(&ip) {
                        AdsResponse::error(AdsErrorCode::DEVICE_ERROR)
                    } else {
                        deliver = state.answers.get(&ip).cloned().unwrap_or_default();
                        AdsResponse::success(0)
                    }
                }
                _ => AdsResponse::success(0),
            }
        };
        for answer in deliver {
            self.emit(index::BROADCAST, &answer);
        }
        response
    }

    fn handle_read_write(
        &self,
        port: u16,
        group: u32,
        offset: u32,
        out: &mut [u8],
        data: &[u8],
    ) -> AdsResponse {
        let mut state = self.state();
        match (port, group) {
            (ports::SYSTEM_SERVICE, index::FILE_OPEN) => {
                let path = cstr(data);
                let mode = offset & 0xFFFF;
                if mode & 0x2 != 0 {
                    state.files.insert(path.clone(), Vec::new());
                } else if !state.files.contains_key(&path) {
                    return AdsResponse::error(AdsErrorCode::NOT_FOUND);
                }
                let handle = state.next_file_handle;
                state.next_file_handle += 1;
                state.open_files.insert(handle, OpenFile { path, position: 0 });
                copy_out(out, &handle.to_le_bytes())
            }
            (ports::SYSTEM_SERVICE, index::FILE_CLOSE) => match state.open_files.remove(&offset) {
                Some(_) => AdsResponse::success(0),
                None => AdsResponse::error(AdsErrorCode::NOT_FOUND),
            },
            (ports::SYSTEM_SERVICE, index::FILE_READ) => {
                let DeviceState {
                    open_files, files, ..
                } = &mut *state;
                let Some(file) = open_files.get_mut(&offset) else {
                    return AdsResponse::error(AdsErrorCode::NOT_FOUND);
                };
                let contents = files.get(&file.path).cloned().unwrap_or_default();
                let end = (file.position + out.len()).min(contents.len());
                let chunk = contents[file.position.min(end)..end].to_vec();
                file.position = end;
                state.chunk_reads += 1;
                copy_out(out, &chunk)
            }
            (ports::SYSTEM_SERVICE, index::FILE_WRITE) => {
                let Some(path) = state.open_files.get(&offset).map(|f| f.path.clone()) else {
                    return AdsResponse::error(AdsErrorCode::NOT_FOUND);
                };
                state.files.entry(path).or_default().extend_from_slice(data);
                state.chunk_writes += 1;
                AdsResponse::success(0)
            }
            (ports::SYSTEM_SERVICE, index::FILE_FIND) => {
                state.writes.push((port, group, offset, data.to_vec()));
                find(&mut state, offset, out, data)
            }
            (ports::SYSTEM_SERVICE, index::IP_HELPER) => {
                let ip = state
                    .hostnames
                    .get(&cstr(data))
                    .copied()
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                copy_out(out, &ip.octets())
            }
            (ports::EVENT_LOG_PUBLISHER, index::EVENT_DETAIL) => {
                let address = data.get(20..44).unwrap_or_default();
                match state.event_messages.get(address) {
                    Some(message) => {
                        let mut detail = vec![0u8; 28];
                        detail[24] = message.len() as u8;
                        detail.extend_from_slice(message.as_bytes());
                        copy_out(out, &detail)
                    }
                    None => AdsResponse::error(AdsErrorCode::NOT_FOUND),
                }
            }
            _ => {
                state.writes.push((port, group, offset, data.to_vec()));
                match state.values.get(&(port, group, offset)) {
                    Some(value) => copy_out(out, value),
                    None => AdsResponse::error(AdsErrorCode::SERVICE_NOT_SUPPORTED),
                }
            }
        }
    }
}

fn find(state: &mut DeviceState, offset: u32, out: &mut [u8], data: &[u8]) -> AdsResponse {
    if data.is_empty() {
        let Some(find) = state.finds.get_mut(&offset) else {
            return AdsResponse::error(AdsErrorCode::NOT_FOUND);
        };
        find.position += 1;
        match find.entries.get(find.position).cloned() {
            Some(entry) => copy_out(out, &file_record(&entry, offset)),
            None => {
                state.finds.remove(&offset);
                AdsResponse::error(AdsErrorCode::NOT_FOUND)
            }
        }
    } else if offset == 1 {
        let pattern = cstr(data);
        let directory = pattern
            .trim_end_matches('*')
            .trim_end_matches(|c: char| c == '/' || c == '\\')
            .to_string();
        if !state.directories.contains(&directory) {
            return AdsResponse::error(AdsErrorCode::NOT_FOUND);
        }
        let dot = |name: &str| Entry {
            name: name.to_string(),
            directory: true,
            size: 0,
        };
        let mut entries = vec![dot("."), dot("..")];
        entries.extend(state.children(&directory));
        let handle = state.next_find_handle;
        state.next_find_handle += 1;
        let record = file_record(&entries[0], handle);
        state.finds.insert(
            handle,
            Find {
                entries,
                position: 0,
            },
        );
        copy_out(out, &record)
    } else {
        if !state.open_files.contains_key(&offset) {
            return AdsResponse::error(AdsErrorCode::INVALID_INDEX_OFFSET);
        }
        let path = cstr(data);
        match state.files.get(&path) {
            Some(contents) => {
                let name = path.rsplit('/').next().unwrap_or(&path).to_string();
                let entry = Entry {
                    name,
                    directory: false,
                    size: contents.len() as u64,
                };
                copy_out(out, &file_record(&entry, 0))
            }
            None => AdsResponse::error(AdsErrorCode::NOT_FOUND),
        }
    }
}

fn file_record(entry: &Entry, next: u32) -> Vec<u8> {
    let mut record = vec![0u8; FILE_RECORD_SIZE];
    record[0..2].copy_from_slice(&(next as u16).to_le_bytes());
    let attributes: u32 = if entry.directory { 0x10 } else { 0x20 };
    record[4..8].copy_from_slice(&attributes.to_le_bytes());
    record[24..28].copy_from_slice(&(WRITE_TIME as u32).to_le_bytes());
    record[28..32].copy_from_slice(&((WRITE_TIME >> 32) as u32).to_le_bytes());
    record[32..36].copy_from_slice(&((entry.size >> 32) as u32).to_le_bytes());
    record[36..40].copy_from_slice(&(entry.size as u32).to_le_bytes());
    record[48..48 + entry.name.len()].copy_from_slice(entry.name.as_bytes());
    record
}

fn copy_out(out: &mut [u8], data: &[u8]) -> AdsResponse {
    let n = out.len().min(data.len());
    out[..n].copy_from_slice(&data[..n]);
    AdsResponse::success(n)
}

fn cstr(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Builds one adapter record of [`ADAPTER_STRIDE`] bytes.
pub fn adapter_record(name: &str, ip: &str, mask: &str) -> Vec<u8> {
    let mut record = vec![0u8; ADAPTER_STRIDE];
    record[0..4].copy_from_slice(&(ADAPTER_STRIDE as u32).to_le_bytes());
    record[268..268 + name.len()].copy_from_slice(name.as_bytes());
    record[432..432 + ip.len()].copy_from_slice(ip.as_bytes());
    record[448..448 + mask.len()].copy_from_slice(mask.as_bytes());
    record
}

/// Connector opening [`MockSession`]s on one device.
#[derive(Clone)]
pub struct MockConnector {
    device: Arc<MockDevice>,
}

impl MockConnector {
    pub fn new(device: &Arc<MockDevice>) -> Self {
        Self {
            device: Arc::clone(device),
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self, address: AmsAddress) -> Result<MockSession> {
        let mut state = self.device.state();
        if state.unreachable {
            return Err(AdsError::transport(format!("{} unreachable", address)));
        }
        state.sessions_open += 1;
        state.sessions_opened += 1;
        state.next_session += 1;
        Ok(MockSession {
            device: Arc::clone(&self.device),
            address,
            id: state.next_session,
            open: true,
        })
    }
}

/// One session on a [`MockDevice`].
pub struct MockSession {
    device: Arc<MockDevice>,
    address: AmsAddress,
    id: u64,
    open: bool,
}

impl MockSession {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(AdsError::transport("session closed"))
        }
    }
}

#[async_trait]
impl Session for MockSession {
    fn address(&self) -> AmsAddress {
        self.address
    }

    async fn read(
        &mut self,
        index_group: u32,
        index_offset: u32,
        data: &mut [u8],
        _cancel: &CancellationToken,
    ) -> Result<AdsResponse> {
        self.ensure_open()?;
        Ok(self
            .device
            .handle_read(self.address.port, index_group, index_offset, data))
    }

    async fn write(
        &mut self,
        index_group: u32,
        index_offset: u32,
        data: &[u8],
        _cancel: &CancellationToken,
    ) -> Result<AdsResponse> {
        self.ensure_open()?;
        Ok(self
            .device
            .handle_write(self.address.port, index_group, index_offset, data))
    }

    async fn read_write(
        &mut self,
        index_group: u32,
        index_offset: u32,
        read_data: &mut [u8],
        write_data: &[u8],
        _cancel: &CancellationToken,
    ) -> Result<AdsResponse> {
        self.ensure_open()?;
        Ok(self.device.handle_read_write(
            self.address.port,
            index_group,
            index_offset,
            read_data,
            write_data,
        ))
    }

    async fn add_notification(
        &mut self,
        index_group: u32,
        _index_offset: u32,
        _max_size: u32,
        _settings: NotificationSettings,
        callback: NotificationCallback,
        _cancel: &CancellationToken,
    ) -> Result<NotificationHandle> {
        self.ensure_open()?;
        let mut state = self.device.state();
        let handle = state.next_notification;
        state.next_notification += 1;
        state.notifications.insert(
            handle,
            Registration {
                session: self.id,
                index_group,
                callback,
            },
        );
        Ok(NotificationHandle::new(handle))
    }

    async fn delete_notification(
        &mut self,
        handle: NotificationHandle,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_open()?;
        match self.device.state().notifications.remove(&handle.raw()) {
            Some(_) => Ok(()),
            None => Err(AdsError::protocol(AdsErrorCode::NOT_FOUND)),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            let mut state = self.device.state();
            state.sessions_open -= 1;
            let id = self.id;
            state.notifications.retain(|_, r| r.session != id);
        }
        Ok(())
    }
}

/// Client for the mock target with default settings.
pub fn client(device: &Arc<MockDevice>) -> AdsClient<MockConnector> {
    client_with(device, ClientConfig::new(TARGET))
}

pub fn client_with(device: &Arc<MockDevice>, config: ClientConfig) -> AdsClient<MockConnector> {
    AdsClient::new(MockConnector::new(device), config).unwrap()
}

/// Waits until background cleanup has closed every session and notification.
///
/// Panics if sessions are still open after about a second.
pub async fn wait_for_cleanup(device: &MockDevice) {
    for _ in 0..100 {
        if is_clean(device) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let state = device.state();
    panic!(
        "{} sessions and {} notifications still open",
        state.sessions_open,
        state.active_notifications()
    );
}

fn is_clean(device: &MockDevice) -> bool {
    let state = device.state();
    state.sessions_open == 0 && state.active_notifications() == 0
}
