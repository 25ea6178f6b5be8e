//! Chunked transfer and whole-file helpers against the in-memory device.

mod common;

use ads_utilities::{copy_file, BaseDirectory, CancellationToken, ClientConfig, OpenMode};
use common::{client, client_with, MockDevice, TARGET};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_copy_within_reports_progress_per_chunk() {
    let device = MockDevice::new();
    device.add_file("C:/data/a.txt", pattern(10_000));
    let client = client_with(&device, ClientConfig::new(TARGET).with_chunk_size(4096));
    let cancel = CancellationToken::new();

    let mut progress = Vec::new();
    let report = client
        .copy_within("C:/data/a.txt", "C:/data/b.txt", |p| progress.push(p), &cancel)
        .await
        .unwrap();

    assert_eq!(report.chunks, 3);
    assert_eq!(report.bytes_copied, 10_000);
    assert_eq!(report.source_size, 10_000);
    assert_eq!(progress.len(), 3);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*progress.last().unwrap(), 100.0);
    assert_eq!(device.file("C:/data/b.txt").unwrap(), pattern(10_000));

    let state = device.state();
    assert_eq!(state.chunk_reads, 3);
    assert_eq!(state.chunk_writes, 3);
    assert_eq!(state.open_file_handles(), 0);
    assert_eq!(state.sessions_open, 0);
}

#[tokio::test]
async fn test_copy_exact_multiple_ends_on_empty_read() {
    let device = MockDevice::new();
    device.add_file("C:/a.bin", pattern(8192));
    let client = client_with(&device, ClientConfig::new(TARGET).with_chunk_size(4096));
    let cancel = CancellationToken::new();

    let report = client
        .copy_within("C:/a.bin", "C:/b.bin", |_| {}, &cancel)
        .await
        .unwrap();

    assert_eq!(report.chunks, 2);
    assert_eq!(report.bytes_copied, 8192);
    let state = device.state();
    assert_eq!(state.chunk_reads, 3);
    assert_eq!(state.chunk_writes, 2);
    assert_eq!(state.files["C:/b.bin"], pattern(8192));
}

#[tokio::test]
async fn test_copy_empty_file_reports_complete() {
    let device = MockDevice::new();
    device.add_file("C:/empty", Vec::new());
    let client = client(&device);
    let cancel = CancellationToken::new();

    let mut progress = Vec::new();
    let report = client
        .copy_within("C:/empty", "C:/copy", |p| progress.push(p), &cancel)
        .await
        .unwrap();

    assert_eq!(report.chunks, 0);
    assert_eq!(progress, vec![100.0]);
    assert_eq!(device.file("C:/copy").unwrap(), Vec::<u8>::new());
}

#[tokio::test]
async fn test_copy_cancelled_from_progress_closes_handles() {
    let device = MockDevice::new();
    device.add_file("C:/big.bin", pattern(10_000));
    let client = client_with(&device, ClientConfig::new(TARGET).with_chunk_size(1000));
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    let mut calls = 0;
    let err = client
        .copy_within(
            "C:/big.bin",
            "C:/partial.bin",
            |_| {
                calls += 1;
                if calls == 2 {
                    token.cancel();
                }
            },
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(calls, 2);
    {
        let state = device.state();
        assert_eq!(state.open_file_handles(), 0);
        assert_eq!(state.sessions_open, 0);
        assert!(state.files["C:/partial.bin"].len() <= 2000);
    }

    // The destination is not left locked.
    let fresh = CancellationToken::new();
    let handle = client
        .open_file("C:/partial.bin", OpenMode::WRITE, BaseDirectory::Generic, &fresh)
        .await
        .unwrap();
    client.close_file(handle, &fresh).await.unwrap();
}

#[tokio::test]
async fn test_copy_cancelled_before_start() {
    let device = MockDevice::new();
    device.add_file("C:/a", pattern(10));
    let client = client(&device);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = client
        .copy_within("C:/a", "C:/b", |_| {}, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(device.state().sessions_opened, 0);
    assert!(device.file("C:/b").is_none());
}

#[tokio::test]
async fn test_copy_missing_source() {
    let device = MockDevice::new();
    let client = client(&device);
    let cancel = CancellationToken::new();

    let err = client
        .copy_within("C:/missing", "C:/b", |_| {}, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    let state = device.state();
    assert_eq!(state.open_file_handles(), 0);
    assert_eq!(state.sessions_open, 0);
}

#[tokio::test]
async fn test_copy_between_devices() {
    let source = MockDevice::new();
    let destination = MockDevice::new();
    source.add_file("C:/recipe.csv", pattern(2500));
    let from = client(&source);
    let to = client(&destination);
    let cancel = CancellationToken::new();

    let report = copy_file(&from, "C:/recipe.csv", &to, "D:/recipe.csv", 1024, |_| {}, &cancel)
        .await
        .unwrap();

    assert_eq!(report.chunks, 3);
    assert_eq!(destination.file("D:/recipe.csv").unwrap(), pattern(2500));
    assert!(source.file("D:/recipe.csv").is_none());
    assert_eq!(source.state().sessions_open, 0);
    assert_eq!(destination.state().sessions_open, 0);
}

#[tokio::test]
async fn test_copy_rejects_zero_chunk_size() {
    let device = MockDevice::new();
    let client = client(&device);
    let cancel = CancellationToken::new();

    let err = copy_file(&client, "C:/a", &client, "C:/b", 0, |_| {}, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ads_utilities::AdsError::InvalidParameter { .. }));
    assert_eq!(device.state().sessions_opened, 0);
}

#[tokio::test]
async fn test_write_then_read_file() {
    let device = MockDevice::new();
    let client = client_with(&device, ClientConfig::new(TARGET).with_chunk_size(100));
    let cancel = CancellationToken::new();

    client
        .write_file("C:/config.xml", &pattern(350), &cancel)
        .await
        .unwrap();
    assert_eq!(device.state().chunk_writes, 4);

    let data = client.read_file("C:/config.xml", &cancel).await.unwrap();
    assert_eq!(data, pattern(350));
    assert_eq!(device.state().open_file_handles(), 0);
}

#[tokio::test]
async fn test_chunk_primitives() {
    let device = MockDevice::new();
    device.add_file("C:/log.txt", b"hello world".to_vec());
    let client = client(&device);
    let cancel = CancellationToken::new();

    let handle = client
        .open_file("C:/log.txt", OpenMode::READ, BaseDirectory::Generic, &cancel)
        .await
        .unwrap();
    assert_eq!(client.read_chunk(&handle, 5, &cancel).await.unwrap(), b"hello");
    assert_eq!(client.read_chunk(&handle, 100, &cancel).await.unwrap(), b" world");
    assert!(client.read_chunk(&handle, 100, &cancel).await.unwrap().is_empty());
    client.close_file(handle, &cancel).await.unwrap();
    assert_eq!(device.state().open_file_handles(), 0);
}
