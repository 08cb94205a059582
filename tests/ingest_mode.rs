mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use kvrestore::RestoreError;
use kvrestore::config::RestoreConfig;
use kvrestore::restore::cluster::{ConnectOptions, IngestMode};

#[tokio::test]
async fn test_switch_mode_reaches_every_store() -> anyhow::Result<()> {
    let harness = Harness::new(FakeImporter::default());
    let client = harness.client(test_config());

    client.switch_to_import_mode().await?;
    client.switch_to_normal_mode().await?;

    let applied = harness.connector.applied();
    assert_eq!(applied.len(), 6);
    assert!(applied[..3].iter().all(|(_, mode)| *mode == IngestMode::Import));
    assert!(applied[3..].iter().all(|(_, mode)| *mode == IngestMode::Normal));
    assert_eq!(harness.connector.closed.load(Ordering::SeqCst), 6);
    Ok(())
}

#[tokio::test]
async fn test_switch_mode_stops_at_unreachable_store() {
    let mut harness = Harness::new(FakeImporter::default());
    let mut connector = FakeConnector::default();
    connector.unreachable.insert("store-2:20160".to_string());
    harness.connector = Arc::new(connector);
    let client = harness.client(test_config());

    let result = client.switch_ingest_mode(IngestMode::Import).await;

    match result {
        Err(RestoreError::Broadcast { store_id, address, .. }) => {
            assert_eq!(store_id, 2);
            assert_eq!(address, "store-2:20160");
        }
        other => panic!("expected broadcast failure, got {other:?}"),
    }
    let applied = harness.connector.applied();
    assert_eq!(applied, vec![("store-1:20160".to_string(), IngestMode::Import)]);
}

#[tokio::test]
async fn test_switch_mode_times_out_on_hanging_connect() {
    let mut harness = Harness::new(FakeImporter::default());
    let mut connector = FakeConnector::default();
    connector.hang.insert("store-1:20160".to_string());
    harness.connector = Arc::new(connector);
    let client = harness.client(RestoreConfig {
        switch_mode: ConnectOptions {
            connect_timeout: Duration::from_millis(20),
            ..ConnectOptions::default()
        },
        ..test_config()
    });

    let result = tokio::time::timeout(TEST_TIMEOUT, client.switch_ingest_mode(IngestMode::Normal))
        .await
        .expect("bounded by connect timeout");

    assert!(matches!(result, Err(RestoreError::Broadcast { store_id: 1, .. })));
    assert!(harness.connector.applied().is_empty());
}

#[tokio::test]
async fn test_failed_close_does_not_stop_broadcast() -> anyhow::Result<()> {
    let mut harness = Harness::new(FakeImporter::default());
    let mut connector = FakeConnector::default();
    connector.failing_close.insert("store-2:20160".to_string());
    harness.connector = Arc::new(connector);
    let client = harness.client(test_config());

    client.switch_ingest_mode(IngestMode::Import).await?;

    let stores: Vec<String> = harness.connector.applied().into_iter().map(|(addr, _)| addr).collect();
    assert_eq!(stores, vec!["store-1:20160", "store-2:20160", "store-3:20160"]);
    assert_eq!(harness.connector.closed.load(Ordering::SeqCst), 2);
    Ok(())
}
