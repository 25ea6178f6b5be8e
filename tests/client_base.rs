//! Connection check, typed reads and registry queries against the in-memory device.

mod common;

use ads_utilities::{index, ports, AdsError, CancellationToken};
use common::{client, MockDevice};

#[tokio::test]
async fn test_connect_reaches_device() {
    let device = MockDevice::new();
    let client = client(&device);

    client.connect(&CancellationToken::new()).await.unwrap();
    let state = device.state();
    assert_eq!(state.sessions_opened, 1);
    assert_eq!(state.sessions_open, 0);
}

#[tokio::test]
async fn test_connect_unreachable() {
    let device = MockDevice::new();
    device.state().unreachable = true;
    let client = client(&device);

    let err = client.connect(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, AdsError::Transport { .. }));
}

#[tokio::test]
async fn test_connect_cancelled() {
    let device = MockDevice::new();
    let client = client(&device);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = client.connect(&cancel).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(device.state().sessions_open, 0);
}

#[tokio::test]
async fn test_typed_reads() {
    let device = MockDevice::new();
    {
        let mut state = device.state();
        state
            .values
            .insert((ports::PLC, 0x4020, 0), vec![0x34, 0x12, 0x78, 0x56]);
        state
            .values
            .insert((ports::PLC, 0x4020, 8), b"PLC-01\0".to_vec());
        state.values.insert((ports::PLC, 0x4020, 16), vec![0x01]);
    }
    let client = client(&device);
    let cancel = CancellationToken::new();

    assert_eq!(
        client.read_u16(ports::PLC, 0x4020, 0, &cancel).await.unwrap(),
        0x1234
    );
    assert_eq!(
        client.read_u32(ports::PLC, 0x4020, 0, &cancel).await.unwrap(),
        0x5678_1234
    );
    assert_eq!(
        client
            .read_bytes(ports::PLC, 0x4020, 8, 32, &cancel)
            .await
            .unwrap(),
        b"PLC-01\0".to_vec()
    );

    // Only one byte reported as read.
    let err = client
        .read_u16(ports::PLC, 0x4020, 16, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, AdsError::Decode { .. }));
    assert_eq!(device.state().sessions_open, 0);
}

#[tokio::test]
async fn test_query_registry_value() {
    let device = MockDevice::new();
    device.state().values.insert(
        (ports::SYSTEM_SERVICE, index::REGISTRY_HKLM, 0),
        vec![5, 80, 12, 7, 1, 1],
    );
    let client = client(&device);

    let value = client
        .query_registry_value(
            "Software\\Beckhoff\\TwinCAT3\\System",
            "AmsNetId",
            6,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(value, vec![5, 80, 12, 7, 1, 1]);

    let state = device.state();
    let (port, group, _, request) = state.writes.last().unwrap();
    assert_eq!(*port, ports::SYSTEM_SERVICE);
    assert_eq!(*group, index::REGISTRY_HKLM);
    assert_eq!(
        request,
        &b"Software\\Beckhoff\\TwinCAT3\\System\0AmsNetId\0".to_vec()
    );
}
