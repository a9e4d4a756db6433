//! End-to-end exchanges against simulated devices.

use std::time::Duration;

use tokio_stream::StreamExt;

use sharelink::sim::{SimBackend, SimDevice};
use sharelink::{LinkConfig, MessageType, Response, ShareLink, COMMON_SHARE_ID};

fn stack_with(devices: &[&str]) -> (ShareLink<SimBackend>, SimBackend) {
    let _ = tracing_subscriber::fmt::try_init();
    let backend = SimBackend::new();
    for id in devices {
        backend.add_device(SimDevice::new(*id));
    }
    (ShareLink::new(backend.clone()), backend)
}

#[tokio::test]
async fn async_request_resolves_through_the_callback() {
    let (link, _backend) = stack_with(&["dev-1"]);
    assert!(link.connect_device("dev-1").await);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    link.register_callback(move |response: &Response| {
        let _ = tx.send(response.clone());
    });

    link.request_message("dev-1", MessageType::Share, 2).await.unwrap();
    assert_eq!(link.pending_transactions(), 1);

    let response = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("response within a second")
        .expect("channel open");
    assert_eq!(response.device_id, "dev-1");
    assert_eq!(response.share_id, 2);
    assert_eq!(response.data, 100u32.to_le_bytes());
    assert_eq!(link.pending_transactions(), 0);

    link.stop().await;
}

#[tokio::test]
async fn sync_request_returns_the_share_payload() {
    let (link, _backend) = stack_with(&["dev-1"]);
    assert!(link.connect_device("dev-1").await);

    let payload = link.request_message_sync("dev-1", MessageType::Share, 2).await;
    assert_eq!(payload, 100u32.to_le_bytes());

    let payload = link.request_message_sync("dev-1", MessageType::Share, 3).await;
    assert_eq!(payload, b"simulated");

    link.stop().await;
}

#[tokio::test]
async fn publish_updates_the_device_share() {
    let (link, backend) = stack_with(&["dev-1"]);
    assert!(link.connect_device("dev-1").await);

    let value = 42u32.to_le_bytes();
    link.publish_message("dev-1", MessageType::Share, 2, &value).await.unwrap();

    // The device echoes the stored value, resolving the transaction.
    tokio::time::timeout(Duration::from_secs(1), async {
        while link.pending_transactions() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("publish acknowledged within a second");

    let device = backend.device("dev-1").unwrap();
    assert_eq!(device.share_value(2).unwrap(), value);

    let payload = link.request_message_sync("dev-1", MessageType::Share, 2).await;
    assert_eq!(payload, value);

    link.stop().await;
}

#[tokio::test]
async fn oversize_publish_degrades_to_an_empty_share() {
    let (link, backend) = stack_with(&["dev-1"]);
    assert!(link.connect_device("dev-1").await);

    let oversize = vec![0xAB; 200];
    link.publish_message("dev-1", MessageType::Share, 2, &oversize).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while link.pending_transactions() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("publish acknowledged within a second");

    assert!(backend.device("dev-1").unwrap().share_value(2).unwrap().is_empty());
    link.stop().await;
}

#[tokio::test]
async fn subscription_stream_carries_responses() {
    let (link, _backend) = stack_with(&["dev-1"]);
    assert!(link.connect_device("dev-1").await);

    let mut stream = link.subscribe();
    link.request_message("dev-1", MessageType::Share, 3).await.unwrap();

    let response = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("response within a second")
        .expect("stream open")
        .expect("no lag on a fresh stream");
    assert_eq!(response.device_id, "dev-1");
    assert_eq!(response.data, b"simulated");

    link.stop().await;
}

#[tokio::test]
async fn devices_detailed_reads_every_descriptor() {
    let (link, _backend) = stack_with(&["alpha", "beta"]);

    let mut details = link.devices_detailed().await;
    details.sort_by(|a, b| a.device_id.cmp(&b.device_id));

    assert_eq!(details.len(), 2);
    assert_eq!(details[0].device_name, "alpha");
    assert_eq!(details[1].device_name, "beta");
    assert!(details.iter().all(|d| d.registry_id == 1001));

    // The probe connections were temporary.
    assert!(link.connected_devices().await.is_empty());
    link.stop().await;
}

#[tokio::test]
async fn devices_detailed_skips_unresponsive_devices() {
    let _ = tracing_subscriber::fmt::try_init();
    let backend = SimBackend::new();
    backend.add_device(SimDevice::new("good"));
    backend.add_device(SimDevice::new("mute"));
    backend.device("mute").unwrap().set_mute(true);

    // Short handshake so the mute device fails fast.
    let config =
        LinkConfig { handshake_timeout: Duration::from_millis(50), ..LinkConfig::default() };
    let link = ShareLink::with_config(backend.clone(), config);

    let details = link.devices_detailed().await;
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].device_id, "good");
    link.stop().await;
}

#[tokio::test]
async fn common_request_sync_yields_the_descriptor() {
    let (link, _backend) = stack_with(&["dev-1"]);
    assert!(link.connect_device("dev-1").await);

    let payload = link.request_message_sync("dev-1", MessageType::Common, COMMON_SHARE_ID).await;
    let descriptor = sharelink::CommonDescriptor::decode(&payload).unwrap();
    assert_eq!(descriptor.device_name, "dev-1");

    link.stop().await;
}

#[tokio::test]
async fn disconnect_drops_the_device_schedules() {
    let (link, _backend) = stack_with(&["dev-1", "dev-2"]);
    assert!(link.connect_device("dev-1").await);
    assert!(link.connect_device("dev-2").await);

    link.set_scheduled_message("dev-1", MessageType::Share, 2, Duration::from_millis(100));
    link.set_scheduled_message("dev-2", MessageType::Share, 2, Duration::from_millis(100));
    assert_eq!(link.scheduled_messages().len(), 2);

    assert!(link.disconnect_device("dev-1").await);
    let remaining = link.scheduled_messages();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].device_id, "dev-2");

    link.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_fires_on_the_interval_without_spinning() {
    let (link, backend) = stack_with(&["dev-1"]);
    assert!(link.connect_device("dev-1").await);
    link.start();

    link.set_scheduled_message("dev-1", MessageType::Share, 2, Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(280)).await;

    // Due at ~100 ms and ~200 ms; a third firing would land past 300 ms.
    let fired = backend.device("dev-1").unwrap().request_count();
    assert_eq!(fired, 2, "expected the schedule to fire exactly twice, got {fired}");

    // A cleared schedule never fires again.
    assert!(link.clear_scheduled_message("dev-1", MessageType::Share, 2));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.device("dev-1").unwrap().request_count(), fired);

    link.stop().await;
}

#[tokio::test]
async fn reconnect_after_disconnect() {
    let (link, _backend) = stack_with(&["dev-1"]);
    assert!(link.connect_device("dev-1").await);
    assert!(link.disconnect_device("dev-1").await);
    assert!(!link.check_device("dev-1").await);

    assert!(link.connect_device("dev-1").await);
    let payload = link.request_message_sync("dev-1", MessageType::Share, 2).await;
    assert_eq!(payload, 100u32.to_le_bytes());
    link.stop().await;
}
