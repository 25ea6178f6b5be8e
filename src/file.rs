//! Remote file service operations.
//!
//! This module adds the file capability to [`AdsClient`]: opening, reading,
//! writing and closing files on the device, plus deletion, renaming,
//! directory management, metadata queries, directory enumeration and process
//! launch.
//!
//! # Handles
//!
//! [`open_file`](AdsClient::open_file) returns a [`FileHandle`]. The handle is
//! move-only and [`close_file`](AdsClient::close_file) consumes it, so a closed
//! handle cannot be used again. A handle that is dropped without being closed
//! stays open on the device until the device reclaims it.
//!
//! # File record layout
//!
//! Metadata arrives as a fixed 324-byte record:
//!
//! | Offset | Size | Field |
//! |-------:|-----:|-------|
//! | 0 | 2 | Find handle (continuation token) |
//! | 2 | 2 | Reserved |
//! | 4 | 4 | Attribute flags |
//! | 8 | 8 | Creation time (FILETIME, low word first) |
//! | 16 | 8 | Last access time |
//! | 24 | 8 | Last write time |
//! | 32 | 4 | Size, high 32 bits |
//! | 36 | 4 | Size, low 32 bits |
//! | 40 | 8 | Reserved |
//! | 48 | 260 | File name, zero-terminated |
//! | 308 | 16 | Alternate (8.3) name, zero-terminated |
//!
//! # Example
//!
//! ```ignore
//! use futures::TryStreamExt;
//!
//! let cancel = CancellationToken::new();
//! let entries: Vec<_> = client.directory_entries("C:/TwinCAT/Boot", &cancel)
//!     .try_collect()
//!     .await?;
//! for entry in entries {
//!     println!("{} {} bytes dir={}", entry.name, entry.size, entry.is_directory());
//! }
//! ```

use std::fmt;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address::ports;
use crate::client::{self, release, AdsClient, SessionGuard};
use crate::codec::{ReadCursor, RequestWriter};
use crate::directory::{BaseDirectory, OpenMode};
use crate::error::{AdsError, Result};
use crate::index::{self, offset};
use crate::transport::{Connector, Session};
use crate::utils::filetime_to_utc;

/// Size of a file record in bytes.
pub const FILE_RECORD_SIZE: usize = 324;

const NAME_SIZE: usize = 260;
const ALTERNATE_NAME_SIZE: usize = 16;

bitflags! {
    /// Attribute flags of a remote file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FileAttributes: u32 {
        /// Read-only.
        const READ_ONLY = 0x0001;
        /// Hidden.
        const HIDDEN = 0x0002;
        /// System file.
        const SYSTEM = 0x0004;
        /// Directory.
        const DIRECTORY = 0x0010;
        /// Archive bit.
        const ARCHIVE = 0x0020;
        /// No other attributes.
        const NORMAL = 0x0080;
        /// Compressed.
        const COMPRESSED = 0x0800;
        /// Encrypted.
        const ENCRYPTED = 0x4000;
    }
}

/// Metadata of a remote file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileInfo {
    /// File name.
    pub name: String,
    /// Alternate (8.3) file name, often empty.
    pub alternate_name: String,
    /// Size in bytes.
    pub size: u64,
    /// Creation time, if set.
    pub creation_time: Option<DateTime<Utc>>,
    /// Last access time, if set.
    pub last_access_time: Option<DateTime<Utc>>,
    /// Last write time, if set.
    pub last_write_time: Option<DateTime<Utc>>,
    /// Attribute flags.
    pub attributes: FileAttributes,
}

impl FileInfo {
    /// Decodes a file record.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::Decode` if `data` is shorter than
    /// [`FILE_RECORD_SIZE`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        decode_record(data).map(|record| record.info)
    }

    /// Returns `true` for directories.
    pub fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }

    /// Returns `true` for read-only entries.
    pub fn is_read_only(&self) -> bool {
        self.attributes.contains(FileAttributes::READ_ONLY)
    }

    /// Returns `true` for hidden entries.
    pub fn is_hidden(&self) -> bool {
        self.attributes.contains(FileAttributes::HIDDEN)
    }

    /// Returns `true` for system entries.
    pub fn is_system(&self) -> bool {
        self.attributes.contains(FileAttributes::SYSTEM)
    }

    /// Returns `true` for compressed entries.
    pub fn is_compressed(&self) -> bool {
        self.attributes.contains(FileAttributes::COMPRESSED)
    }

    /// Returns `true` for encrypted entries.
    pub fn is_encrypted(&self) -> bool {
        self.attributes.contains(FileAttributes::ENCRYPTED)
    }
}

/// A decoded record plus the handle that continues its enumeration.
struct FindRecord {
    next: u32,
    info: FileInfo,
}

fn decode_record(data: &[u8]) -> Result<FindRecord> {
    if data.len() < FILE_RECORD_SIZE {
        return Err(AdsError::decode(format!(
            "file record too short: expected {} bytes, got {}",
            FILE_RECORD_SIZE,
            data.len()
        )));
    }
    let mut cursor = ReadCursor::new(data);
    let next = cursor.u16()? as u32;
    cursor.skip(2)?;
    let attributes = FileAttributes::from_bits_retain(cursor.u32()?);
    let creation = filetime(&mut cursor)?;
    let access = filetime(&mut cursor)?;
    let write = filetime(&mut cursor)?;
    let size_high = cursor.u32()? as u64;
    let size_low = cursor.u32()? as u64;
    cursor.skip(8)?;
    let name = cursor.fixed_string(NAME_SIZE)?;
    let alternate_name = cursor.fixed_string(ALTERNATE_NAME_SIZE)?;

    Ok(FindRecord {
        next,
        info: FileInfo {
            name,
            alternate_name,
            size: (size_high << 32) | size_low,
            creation_time: filetime_to_utc(creation),
            last_access_time: filetime_to_utc(access),
            last_write_time: filetime_to_utc(write),
            attributes,
        },
    })
}

fn filetime(cursor: &mut ReadCursor<'_>) -> Result<u64> {
    let low = cursor.u32()? as u64;
    let high = cursor.u32()? as u64;
    Ok((high << 32) | low)
}

/// Turns a directory path into the wildcard pattern the find service expects.
pub(crate) fn search_pattern(path: &str) -> String {
    if path.ends_with('*') {
        path.to_string()
    } else if path.ends_with('/') || path.ends_with('\\') {
        format!("{}*", path)
    } else {
        format!("{}/*", path)
    }
}

/// Handle of a file opened on the device.
///
/// Consumed by [`AdsClient::close_file`].
#[must_use = "file handles must be closed with close_file"]
#[derive(PartialEq, Eq, Hash)]
pub struct FileHandle(u32);

impl FileHandle {
    /// Returns the raw handle value used as index offset.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHandle({})", self.0)
    }
}

pub(crate) async fn open_on<S: Session + ?Sized>(
    session: &mut S,
    path: &str,
    mode: OpenMode,
    directory: BaseDirectory,
    cancel: &CancellationToken,
) -> Result<FileHandle> {
    let mut request = RequestWriter::with_capacity(path.len() + 1);
    request.ascii_string(path);
    let result = client::read_write(
        session,
        index::FILE_OPEN,
        directory.open_offset(mode),
        4,
        request.as_bytes(),
        cancel,
    )
    .await;
    let data = match result {
        Ok(data) => data,
        Err(e) => {
            if e.is_not_found() {
                debug!(path, "file not found");
            }
            return Err(e);
        }
    };
    let handle = ReadCursor::new(&data).u32()?;
    debug!(path, handle, ?mode, %directory, "opened file");
    Ok(FileHandle(handle))
}

pub(crate) async fn close_on<S: Session + ?Sized>(
    session: &mut S,
    handle: FileHandle,
    cancel: &CancellationToken,
) -> Result<()> {
    client::read_write(session, index::FILE_CLOSE, handle.0, 0, &[], cancel).await?;
    debug!(handle = handle.0, "closed file");
    Ok(())
}

pub(crate) async fn read_on<S: Session + ?Sized>(
    session: &mut S,
    handle: &FileHandle,
    max_len: usize,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    client::read_write(session, index::FILE_READ, handle.0, max_len, &[0u8; 4], cancel).await
}

pub(crate) async fn write_on<S: Session + ?Sized>(
    session: &mut S,
    handle: &FileHandle,
    data: &[u8],
    cancel: &CancellationToken,
) -> Result<()> {
    client::read_write(session, index::FILE_WRITE, handle.0, 4, data, cancel)
        .await
        .map(|_| ())
}

/// Closes `handle` with a fresh token so cleanup runs after cancellation.
pub(crate) async fn close_quietly<S: Session + ?Sized>(session: &mut S, handle: FileHandle) {
    let raw = handle.0;
    if let Err(e) = close_on(session, handle, &CancellationToken::new()).await {
        warn!(handle = raw, error = %e, "failed to close file handle");
    }
}

async fn find_on<S: Session + ?Sized>(
    session: &mut S,
    index_offset: u32,
    request: &[u8],
    cancel: &CancellationToken,
) -> Result<FindRecord> {
    let data = client::read_write(
        session,
        index::FILE_FIND,
        index_offset,
        FILE_RECORD_SIZE,
        request,
        cancel,
    )
    .await?;
    decode_record(&data)
}

enum ListingCursor<S: Session + 'static> {
    Start,
    Next { guard: SessionGuard<S>, handle: u32 },
    Done,
}

struct Listing<'a, C: Connector> {
    client: &'a AdsClient<C>,
    pattern: String,
    cancel: CancellationToken,
    cursor: ListingCursor<C::Session>,
}

impl<C: Connector> Listing<'_, C> {
    async fn advance(&mut self) -> Option<Result<FileInfo>> {
        loop {
            let (mut guard, index_offset, request) =
                match std::mem::replace(&mut self.cursor, ListingCursor::Done) {
                    ListingCursor::Done => return None,
                    ListingCursor::Start => {
                        let session = match self
                            .client
                            .open_session(ports::SYSTEM_SERVICE, &self.cancel)
                            .await
                        {
                            Ok(session) => session,
                            Err(e) => return Some(Err(e)),
                        };
                        let mut request = RequestWriter::new();
                        request.string(&self.pattern);
                        (
                            SessionGuard::new(session),
                            offset::PATH_GENERIC,
                            request.into_bytes(),
                        )
                    }
                    ListingCursor::Next { guard, handle } => (guard, handle, Vec::new()),
                };

            let found = match guard.session() {
                Ok(session) => find_on(session, index_offset, &request, &self.cancel).await,
                Err(e) => Err(e),
            };
            match found {
                Ok(record) => {
                    self.cursor = ListingCursor::Next {
                        guard,
                        handle: record.next,
                    };
                    if record.info.name == "." || record.info.name == ".." {
                        continue;
                    }
                    return Some(Ok(record.info));
                }
                Err(e) if e.is_not_found() => {
                    debug!(pattern = %self.pattern, "directory enumeration finished");
                    return guard.release(Ok(())).await.err().map(Err);
                }
                Err(e) => {
                    warn!(pattern = %self.pattern, error = %e, "directory enumeration failed");
                    return Some(guard.release(Err(e)).await);
                }
            }
        }
    }
}

impl<C: Connector> AdsClient<C> {
    /// Opens a file on the device.
    ///
    /// # Arguments
    ///
    /// * `path` - Path on the device, encoded as ASCII
    /// * `mode` - Open flags
    /// * `directory` - Base directory the path is resolved against
    ///
    /// # Errors
    ///
    /// Returns `AdsError::Protocol` with
    /// [`AdsErrorCode::NOT_FOUND`](crate::AdsErrorCode::NOT_FOUND) if the file
    /// does not exist.
    pub async fn open_file(
        &self,
        path: &str,
        mode: OpenMode,
        directory: BaseDirectory,
        cancel: &CancellationToken,
    ) -> Result<FileHandle> {
        let mut session = self.open_session(ports::SYSTEM_SERVICE, cancel).await?;
        let result = open_on(&mut session, path, mode, directory, cancel).await;
        release(session, result).await
    }

    /// Closes a file handle.
    pub async fn close_file(&self, handle: FileHandle, cancel: &CancellationToken) -> Result<()> {
        let mut session = self.open_session(ports::SYSTEM_SERVICE, cancel).await?;
        let result = close_on(&mut session, handle, cancel).await;
        release(session, result).await
    }

    /// Reads up to `max_len` bytes from an open file.
    ///
    /// A result shorter than `max_len` means the end of the file was reached.
    pub async fn read_chunk(
        &self,
        handle: &FileHandle,
        max_len: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut session = self.open_session(ports::SYSTEM_SERVICE, cancel).await?;
        let result = read_on(&mut session, handle, max_len, cancel).await;
        release(session, result).await
    }

    /// Writes `data` to an open file.
    pub async fn write_chunk(
        &self,
        handle: &FileHandle,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut session = self.open_session(ports::SYSTEM_SERVICE, cancel).await?;
        let result = write_on(&mut session, handle, data, cancel).await;
        release(session, result).await
    }

    /// Deletes a file.
    pub async fn delete_file(
        &self,
        path: &str,
        directory: BaseDirectory,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut request = RequestWriter::new();
        request.string(path);
        self.write_bytes(
            ports::SYSTEM_SERVICE,
            index::FILE_DELETE,
            directory.selector(),
            request.as_bytes(),
            cancel,
        )
        .await
    }

    /// Renames a file.
    pub async fn rename_file(
        &self,
        old_path: &str,
        new_path: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut request = RequestWriter::new();
        request.string(old_path).string(new_path);
        self.write_bytes(
            ports::SYSTEM_SERVICE,
            index::FILE_RENAME,
            BaseDirectory::Generic.selector(),
            request.as_bytes(),
            cancel,
        )
        .await
    }

    /// Creates a directory.
    pub async fn create_directory(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        let mut request = RequestWriter::new();
        request.string(path);
        self.write_bytes(
            ports::SYSTEM_SERVICE,
            index::MKDIR,
            offset::PATH_GENERIC,
            request.as_bytes(),
            cancel,
        )
        .await
    }

    /// Removes an empty directory.
    pub async fn remove_directory(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        let mut request = RequestWriter::new();
        request.string(path);
        self.write_bytes(
            ports::SYSTEM_SERVICE,
            index::RMDIR,
            offset::PATH_GENERIC,
            request.as_bytes(),
            cancel,
        )
        .await
    }

    /// Enumerates a directory lazily.
    ///
    /// `path` may name the directory (`C:/data`, `C:/data/`) or carry its own
    /// wildcard (`C:/data/*.csv`). Entries arrive in device order; `.` and
    /// `..` are skipped. The stream ends when the device reports "not found",
    /// and yields a final `Err` for any other failure, including cancellation.
    ///
    /// The stream holds one session until it ends; dropping it earlier closes
    /// the session on a background task. It is single-pass.
    pub fn directory_entries<'a>(
        &'a self,
        path: &str,
        cancel: &CancellationToken,
    ) -> impl Stream<Item = Result<FileInfo>> + Send + 'a {
        let listing = Listing {
            client: self,
            pattern: search_pattern(path),
            cancel: cancel.clone(),
            cursor: ListingCursor::Start,
        };
        stream::unfold(listing, |mut listing| async move {
            let item = listing.advance().await?;
            Some((item, listing))
        })
    }

    /// Collects a directory listing.
    pub async fn list_directory(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileInfo>> {
        self.directory_entries(path, cancel).try_collect().await
    }

    /// Returns the metadata of a file.
    ///
    /// The lookup runs against an open handle, with the path sent as is,
    /// without a terminator.
    pub async fn file_info(&self, path: &str, cancel: &CancellationToken) -> Result<FileInfo> {
        let mut session = self.open_session(ports::SYSTEM_SERVICE, cancel).await?;
        let result: Result<FileInfo> = async {
            let handle =
                open_on(&mut session, path, OpenMode::READ, BaseDirectory::Generic, cancel).await?;
            let found = find_on(&mut session, handle.raw(), path.as_bytes(), cancel).await;
            close_quietly(&mut session, handle).await;
            found.map(|record| record.info)
        }
        .await;
        release(session, result).await
    }

    /// Returns whether a file can be opened for reading.
    ///
    /// # Errors
    ///
    /// Device errors mean `false`; only cancellation and transport failures
    /// are returned as errors.
    pub async fn file_exists(&self, path: &str, cancel: &CancellationToken) -> Result<bool> {
        let mut session = self.open_session(ports::SYSTEM_SERVICE, cancel).await?;
        let result = match open_on(
            &mut session,
            path,
            OpenMode::READ,
            BaseDirectory::Generic,
            cancel,
        )
        .await
        {
            Ok(handle) => {
                let exists = handle.raw() != 0;
                close_quietly(&mut session, handle).await;
                Ok(exists)
            }
            Err(AdsError::Protocol { .. }) => Ok(false),
            Err(e) => Err(e),
        };
        release(session, result).await
    }

    /// Reads a whole file in chunks of the configured size.
    pub async fn read_file(&self, path: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let chunk_size = self.config().chunk_size;
        let mut session = self.open_session(ports::SYSTEM_SERVICE, cancel).await?;
        let result: Result<Vec<u8>> = async {
            let handle = open_on(
                &mut session,
                path,
                OpenMode::READ | OpenMode::BINARY,
                BaseDirectory::Generic,
                cancel,
            )
            .await?;
            let mut contents = Vec::new();
            let read = loop {
                match read_on(&mut session, &handle, chunk_size, cancel).await {
                    Ok(chunk) => {
                        let done = chunk.len() < chunk_size;
                        contents.extend_from_slice(&chunk);
                        if done {
                            break Ok(());
                        }
                    }
                    Err(e) => break Err(e),
                }
            };
            close_quietly(&mut session, handle).await;
            read.map(|_| contents)
        }
        .await;
        release(session, result).await
    }

    /// Creates or truncates a file and writes `data` to it.
    pub async fn write_file(
        &self,
        path: &str,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let chunk_size = self.config().chunk_size;
        let mut session = self.open_session(ports::SYSTEM_SERVICE, cancel).await?;
        let result: Result<()> = async {
            let handle = open_on(
                &mut session,
                path,
                OpenMode::WRITE | OpenMode::BINARY,
                BaseDirectory::Generic,
                cancel,
            )
            .await?;
            let mut written = Ok(());
            for chunk in data.chunks(chunk_size) {
                written = write_on(&mut session, &handle, chunk, cancel).await;
                if written.is_err() {
                    break;
                }
            }
            match written {
                Ok(()) => close_on(&mut session, handle, cancel).await,
                Err(e) => {
                    close_quietly(&mut session, handle).await;
                    Err(e)
                }
            }
        }
        .await;
        release(session, result).await
    }

    /// Starts a process on the device.
    ///
    /// Only the launch acknowledgement is checked; the process runs detached.
    pub async fn start_process(
        &self,
        path: &str,
        working_directory: &str,
        arguments: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut request = RequestWriter::with_capacity(
            12 + path.len() + working_directory.len() + arguments.len() + 3,
        );
        request
            .u32(path.chars().count() as u32)
            .u32(working_directory.chars().count() as u32)
            .u32(arguments.chars().count() as u32)
            .ascii_string(path)
            .ascii_string(working_directory)
            .ascii_string(arguments);
        self.write_bytes(
            ports::SYSTEM_SERVICE,
            index::START_PROCESS,
            0,
            request.as_bytes(),
            cancel,
        )
        .await
    }
}
