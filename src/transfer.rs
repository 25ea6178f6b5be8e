//! Chunked file transfer between devices.
//!
//! [`copy_file`] streams a remote file from one client to another. The same
//! algorithm serves copies within one device: pass the same client twice, or
//! use [`AdsClient::copy_within`].
//!
//! # Algorithm
//!
//! 1. Query the source size once.
//! 2. Open the source for reading and the destination for writing.
//! 3. Repeat: check for cancellation, read one chunk, write it, report
//!    cumulative progress. A chunk shorter than the chunk size ends the loop.
//! 4. Close both handles, whatever happened before.
//!
//! Chunks are never pipelined: each read completes before its write starts and
//! each write completes before the next read.
//!
//! # Example
//!
//! ```ignore
//! use ads_utilities::copy_file;
//!
//! let report = copy_file(
//!     &plc_a, "C:/TwinCAT/Boot/Plc/Port_851.app",
//!     &plc_b, "C:/backup/Port_851.app",
//!     64 * 1024,
//!     |percent| println!("{percent:.1}%"),
//!     &cancel,
//! ).await?;
//! println!("copied {} bytes in {} chunks", report.bytes_copied, report.chunks);
//! ```

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::ports;
use crate::client::{ensure_active, release, AdsClient};
use crate::directory::{BaseDirectory, OpenMode};
use crate::error::{AdsError, Result};
use crate::file::{close_on, close_quietly, open_on, read_on, write_on, FileHandle};
use crate::transport::{Connector, Session};

/// Outcome of a completed copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyReport {
    /// Bytes written to the destination.
    pub bytes_copied: u64,
    /// Number of chunk round-trips (read plus write) performed.
    pub chunks: usize,
    /// Source size reported before the copy started.
    pub source_size: u64,
}

fn percent(copied: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (copied as f64 * 100.0 / total as f64).min(100.0)
    }
}

/// Copies `source_path` on `source` to `destination_path` on `destination`.
///
/// # Arguments
///
/// * `chunk_size` - Bytes per read/write round-trip
/// * `progress` - Called after every written chunk with the cumulative
///   percentage (0.0 to 100.0)
/// * `cancel` - Checked before every chunk; also interrupts the call in flight
///
/// # Errors
///
/// Returns the first failure of the transfer. Both file handles are closed
/// before returning, also on cancellation; a failure to close the destination
/// is returned only when the transfer itself succeeded.
pub async fn copy_file<A, B, P>(
    source: &AdsClient<A>,
    source_path: &str,
    destination: &AdsClient<B>,
    destination_path: &str,
    chunk_size: usize,
    mut progress: P,
    cancel: &CancellationToken,
) -> Result<CopyReport>
where
    A: Connector,
    B: Connector,
    P: FnMut(f64),
{
    if chunk_size == 0 || chunk_size > u32::MAX as usize {
        return Err(AdsError::invalid_parameter(
            "chunk_size",
            "must be between 1 and u32::MAX",
        ));
    }
    ensure_active(cancel)?;

    let source_size = source.file_info(source_path, cancel).await?.size;
    debug!(source_path, destination_path, source_size, chunk_size, "starting copy");

    let mut source_session = source.open_session(ports::SYSTEM_SERVICE, cancel).await?;
    let mut destination_session = match destination
        .open_session(ports::SYSTEM_SERVICE, cancel)
        .await
    {
        Ok(session) => session,
        Err(e) => return release(source_session, Err(e)).await,
    };

    let result = copy_between(
        &mut source_session,
        source_path,
        &mut destination_session,
        destination_path,
        source_size,
        chunk_size,
        &mut progress,
        cancel,
    )
    .await;

    let result = release(destination_session, result).await;
    let result = release(source_session, result).await;
    match &result {
        Ok(report) => info!(
            source_path,
            destination_path,
            bytes = report.bytes_copied,
            chunks = report.chunks,
            "copy finished"
        ),
        Err(e) => warn!(source_path, destination_path, error = %e, "copy failed"),
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn copy_between<S, D, P>(
    source: &mut S,
    source_path: &str,
    destination: &mut D,
    destination_path: &str,
    source_size: u64,
    chunk_size: usize,
    progress: &mut P,
    cancel: &CancellationToken,
) -> Result<CopyReport>
where
    S: Session,
    D: Session,
    P: FnMut(f64),
{
    let source_handle = open_on(
        source,
        source_path,
        OpenMode::READ | OpenMode::BINARY,
        BaseDirectory::Generic,
        cancel,
    )
    .await?;
    let destination_handle = match open_on(
        destination,
        destination_path,
        OpenMode::WRITE | OpenMode::BINARY,
        BaseDirectory::Generic,
        cancel,
    )
    .await
    {
        Ok(handle) => handle,
        Err(e) => {
            close_quietly(source, source_handle).await;
            return Err(e);
        }
    };

    let transferred = transfer_chunks(
        source,
        &source_handle,
        destination,
        &destination_handle,
        source_size,
        chunk_size,
        progress,
        cancel,
    )
    .await;

    close_quietly(source, source_handle).await;
    match transferred {
        Ok(report) => {
            // The destination close commits the file, so its failure counts.
            close_on(destination, destination_handle, &CancellationToken::new()).await?;
            Ok(report)
        }
        Err(e) => {
            close_quietly(destination, destination_handle).await;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn transfer_chunks<S, D, P>(
    source: &mut S,
    source_handle: &FileHandle,
    destination: &mut D,
    destination_handle: &FileHandle,
    source_size: u64,
    chunk_size: usize,
    progress: &mut P,
    cancel: &CancellationToken,
) -> Result<CopyReport>
where
    S: Session,
    D: Session,
    P: FnMut(f64),
{
    let mut report = CopyReport {
        bytes_copied: 0,
        chunks: 0,
        source_size,
    };
    loop {
        ensure_active(cancel)?;
        let chunk = read_on(source, source_handle, chunk_size, cancel).await?;
        if chunk.is_empty() {
            break;
        }
        write_on(destination, destination_handle, &chunk, cancel).await?;
        report.bytes_copied += chunk.len() as u64;
        report.chunks += 1;
        progress(percent(report.bytes_copied, source_size));
        if chunk.len() < chunk_size {
            break;
        }
    }
    if report.chunks == 0 {
        progress(100.0);
    }
    Ok(report)
}

impl<C: Connector> AdsClient<C> {
    /// Copies a file within this device using the configured chunk size.
    ///
    /// See [`copy_file`] for the transfer semantics.
    pub async fn copy_within<P: FnMut(f64)>(
        &self,
        source_path: &str,
        destination_path: &str,
        progress: P,
        cancel: &CancellationToken,
    ) -> Result<CopyReport> {
        copy_file(
            self,
            source_path,
            self,
            destination_path,
            self.config().chunk_size,
            progress,
            cancel,
        )
        .await
    }

    /// Copies a file from this device to `destination` using the configured
    /// chunk size.
    pub async fn copy_to<B: Connector, P: FnMut(f64)>(
        &self,
        source_path: &str,
        destination: &AdsClient<B>,
        destination_path: &str,
        progress: P,
        cancel: &CancellationToken,
    ) -> Result<CopyReport> {
        copy_file(
            self,
            source_path,
            destination,
            destination_path,
            self.config().chunk_size,
            progress,
            cancel,
        )
        .await
    }
}
