//! Transaction layer and public entry point.
//!
//! [`ShareLink`] sits on top of the comms manager and speaks in
//! [`TransactionMessage`]s instead of raw bytes. Every outgoing request or
//! publish carries a fresh random token and is recorded as a pending
//! [`Transaction`]; an incoming message is matched back to its transaction
//! by `(token, device id)` before it reaches any subscriber, so responses
//! from two devices that happen to share a token can never cross.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::sync::broadcast;
use tokio::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::manager::CommsManager;
use crate::message::{CommonDescriptor, MessageType, TransactionMessage};
use crate::transport::{Backend, DeviceCallback};
use crate::types::{DeviceDetails, LinkConfig, Response, ScheduledRequest, Transaction};
use crate::{LinkError, Result};

/// Share id reserved for the device identity descriptor.
pub const COMMON_SHARE_ID: u32 = 1;

const BROADCAST_CAPACITY: usize = 128;

type ResponseCallback = Box<dyn Fn(&Response) + Send + Sync>;

/// Handle to one link stack instance.
///
/// Cheap to clone; all clones share the same connections, transactions and
/// schedules. There is no global instance: embedders construct a `ShareLink`
/// around whatever [`Backend`] they have and pass clones where needed.
pub struct ShareLink<B: Backend> {
    inner: Arc<LinkInner<B>>,
}

impl<B: Backend> Clone for ShareLink<B> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct LinkInner<B: Backend> {
    manager: tokio::sync::Mutex<CommsManager<B>>,
    transactions: Mutex<Vec<Transaction>>,
    schedules: Mutex<Vec<ScheduledRequest>>,
    callbacks: Mutex<Vec<ResponseCallback>>,
    responses: broadcast::Sender<Response>,
    config: LinkConfig,
    scheduler: CancellationToken,
}

impl<B: Backend> ShareLink<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, LinkConfig::default())
    }

    pub fn with_config(backend: B, config: LinkConfig) -> Self {
        let (responses, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(LinkInner {
                manager: tokio::sync::Mutex::new(CommsManager::new(backend, config.clone())),
                transactions: Mutex::new(Vec::new()),
                schedules: Mutex::new(Vec::new()),
                callbacks: Mutex::new(Vec::new()),
                responses,
                config,
                scheduler: CancellationToken::new(),
            }),
        }
    }

    /// Start the schedule runner.
    ///
    /// The runner scans the standing schedules on a fixed cadence and issues
    /// a request for each one whose interval has elapsed. It holds only a
    /// weak reference to the stack, so dropping every `ShareLink` clone also
    /// ends the runner.
    pub fn start(&self) {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.scheduler.clone();
        let scan = self.inner.config.scheduler_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scan);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                let due = inner.take_due_schedules();
                for (device_id, message_type, share_id) in due {
                    if let Err(e) = inner.request_message(&device_id, message_type, share_id).await
                    {
                        debug!(%device_id, share_id, "scheduled request failed: {e}");
                    }
                }
            }
            trace!("schedule runner stopped");
        });
    }

    /// Stop the schedule runner and disconnect every device. Terminal: the
    /// runner cannot be restarted on this instance.
    pub async fn stop(&self) {
        self.inner.scheduler.cancel();
        self.inner.manager.lock().await.disconnect_all();
    }

    /// Send a request for a share and record the pending transaction.
    /// Returns the transaction token; the response arrives through the
    /// subscriber surfaces.
    pub async fn request_message(
        &self,
        device_id: &str,
        message_type: MessageType,
        share_id: u32,
    ) -> Result<u64> {
        self.inner.request_message(device_id, message_type, share_id).await
    }

    /// Send a request and wait for the next completed message on that
    /// connection, up to the configured sync timeout.
    ///
    /// Returns the response payload, or empty bytes when the device is not
    /// connected, the wait times out, or the reply fails to decode. No
    /// transaction is recorded; the reply is consumed here and does not
    /// reach subscribers.
    pub async fn request_message_sync(
        &self,
        device_id: &str,
        message_type: MessageType,
        share_id: u32,
    ) -> Vec<u8> {
        self.request_message_sync_with_timeout(
            device_id,
            message_type,
            share_id,
            self.inner.config.sync_timeout,
        )
        .await
    }

    /// [`ShareLink::request_message_sync`] with an explicit timeout.
    pub async fn request_message_sync_with_timeout(
        &self,
        device_id: &str,
        message_type: MessageType,
        share_id: u32,
        timeout: Duration,
    ) -> Vec<u8> {
        let Some(comm) = self.inner.manager.lock().await.comm(device_id) else {
            debug!(device_id, "sync request on unconnected device");
            return Vec::new();
        };
        let message = TransactionMessage::request(rand::random(), message_type, share_id);
        // Timeouts and decode failures both degrade to empty bytes: callers
        // of the sync surface cannot distinguish "no data" from "no reply".
        let reply = match comm.send_then_receive(message.encode(), timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(device_id, share_id, "sync request failed: {e}");
                return Vec::new();
            }
        };
        match TransactionMessage::decode(&reply) {
            Ok(response) => response.payload().to_vec(),
            Err(e) => {
                debug!(device_id, share_id, "sync reply failed to decode: {e}");
                Vec::new()
            }
        }
    }

    /// Publish data to a share and record the pending transaction.
    pub async fn publish_message(
        &self,
        device_id: &str,
        message_type: MessageType,
        share_id: u32,
        data: &[u8],
    ) -> Result<u64> {
        let comm = {
            let manager = self.inner.manager.lock().await;
            manager.comm(device_id).ok_or_else(|| LinkError::not_connected(device_id))?
        };
        let token = rand::random();
        let message = TransactionMessage::publish(token, message_type, share_id, data);
        self.inner.record_transaction(token, device_id);
        comm.send(message.encode());
        Ok(token)
    }

    /// Register a plain function subscriber. Subscribers run on the
    /// transport task of whichever device produced the response; a panic in
    /// one subscriber is logged and does not affect the others.
    pub fn register_callback(&self, callback: impl Fn(&Response) + Send + Sync + 'static) {
        if let Ok(mut callbacks) = self.inner.callbacks.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    pub fn clear_callbacks(&self) {
        if let Ok(mut callbacks) = self.inner.callbacks.lock() {
            callbacks.clear();
        }
    }

    /// Stream of matched responses across all devices. Slow consumers lag
    /// rather than block the transport tasks.
    pub fn subscribe(&self) -> BroadcastStream<Response> {
        BroadcastStream::new(self.inner.responses.subscribe())
    }

    /// Install or update a standing schedule for (device, type, share).
    pub fn set_scheduled_message(
        &self,
        device_id: &str,
        message_type: MessageType,
        share_id: u32,
        interval: Duration,
    ) {
        let Ok(mut schedules) = self.inner.schedules.lock() else { return };
        match schedules.iter_mut().find(|s| s.matches(device_id, message_type, share_id)) {
            Some(existing) => existing.update_interval(interval),
            None => {
                schedules.push(ScheduledRequest::new(device_id, message_type, share_id, interval))
            }
        }
    }

    /// Remove one standing schedule. `true` if it existed.
    pub fn clear_scheduled_message(
        &self,
        device_id: &str,
        message_type: MessageType,
        share_id: u32,
    ) -> bool {
        let Ok(mut schedules) = self.inner.schedules.lock() else { return false };
        let before = schedules.len();
        schedules.retain(|s| !s.matches(device_id, message_type, share_id));
        schedules.len() != before
    }

    /// Remove every standing schedule for one device.
    pub fn clear_device_schedules(&self, device_id: &str) {
        if let Ok(mut schedules) = self.inner.schedules.lock() {
            schedules.retain(|s| s.device_id != device_id);
        }
    }

    pub fn clear_all_schedules(&self) {
        if let Ok(mut schedules) = self.inner.schedules.lock() {
            schedules.clear();
        }
    }

    /// Snapshot of the standing schedules.
    pub fn scheduled_messages(&self) -> Vec<ScheduledRequest> {
        self.inner.schedules.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_transactions(&self) -> usize {
        self.inner
            .transactions
            .lock()
            .map(|t| t.iter().filter(|tx| tx.received_at.is_none()).count())
            .unwrap_or(0)
    }

    /// Connect a device and route its messages into the transaction layer.
    pub async fn connect_device(&self, device_id: &str) -> bool {
        let weak = Arc::downgrade(&self.inner);
        let callback: DeviceCallback = Arc::new(move |device_id, message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_receive(device_id, message);
            }
        });
        self.inner.manager.lock().await.connect(device_id, callback).await
    }

    /// Disconnect a device, dropping its standing schedules first so the
    /// runner cannot fire into a dead connection.
    pub async fn disconnect_device(&self, device_id: &str) -> bool {
        self.clear_device_schedules(device_id);
        self.inner.manager.lock().await.disconnect(device_id)
    }

    pub async fn disconnect_all_devices(&self) {
        self.clear_all_schedules();
        self.inner.manager.lock().await.disconnect_all();
    }

    pub async fn check_device(&self, device_id: &str) -> bool {
        self.inner.manager.lock().await.is_connected(device_id)
    }

    /// Device ids the backend can currently see.
    pub async fn get_devices(&self) -> Vec<String> {
        self.inner.manager.lock().await.available_devices().await
    }

    pub async fn connected_devices(&self) -> Vec<String> {
        self.inner.manager.lock().await.connected_devices()
    }

    /// Enumerate devices with their identity descriptors.
    ///
    /// Devices that are not connected are connected for the duration of the
    /// probe and disconnected afterwards; already-connected devices are left
    /// alone. A device that fails to connect or answer is skipped.
    pub async fn devices_detailed(&self) -> Vec<DeviceDetails> {
        let mut details = Vec::new();
        for device_id in self.get_devices().await {
            let was_connected = self.check_device(&device_id).await;
            if !was_connected && !self.connect_device(&device_id).await {
                debug!(%device_id, "skipping device that failed to connect");
                continue;
            }
            let payload =
                self.request_message_sync(&device_id, MessageType::Common, COMMON_SHARE_ID).await;
            match CommonDescriptor::decode(&payload) {
                Ok(descriptor) => details.push(DeviceDetails {
                    device_id: device_id.clone(),
                    device_name: descriptor.device_name,
                    registry_id: descriptor.registry_id,
                    serial_number: descriptor.serial_number,
                    shares_version: descriptor.shares_version,
                    firmware_version: descriptor.firmware_version,
                }),
                Err(e) => debug!(%device_id, "skipping device without descriptor: {e}"),
            }
            if !was_connected {
                self.disconnect_device(&device_id).await;
            }
        }
        details
    }
}

impl<B: Backend> LinkInner<B> {
    async fn request_message(
        self: &Arc<Self>,
        device_id: &str,
        message_type: MessageType,
        share_id: u32,
    ) -> Result<u64> {
        let comm = {
            let manager = self.manager.lock().await;
            manager.comm(device_id).ok_or_else(|| LinkError::not_connected(device_id))?
        };
        let token = rand::random();
        let message = TransactionMessage::request(token, message_type, share_id);
        // Record before sending so a fast reply always finds its record.
        self.record_transaction(token, device_id);
        comm.send(message.encode());
        Ok(token)
    }

    fn record_transaction(&self, token: u64, device_id: &str) {
        if let Ok(mut transactions) = self.transactions.lock() {
            transactions.push(Transaction::new(token, device_id));
        }
    }

    /// Pop the keys of every schedule whose interval has elapsed, stamping
    /// each as fired.
    fn take_due_schedules(&self) -> Vec<(String, MessageType, u32)> {
        let Ok(mut schedules) = self.schedules.lock() else { return Vec::new() };
        let now = Instant::now();
        let mut due = Vec::new();
        for schedule in schedules.iter_mut() {
            if schedule.is_due(now) {
                schedule.tick();
                due.push((schedule.device_id.clone(), schedule.message_type, schedule.share_id));
            }
        }
        due
    }

    /// Entry point for every completed message coming off a transport loop.
    fn on_receive(&self, device_id: &str, payload: &[u8]) {
        let message = match TransactionMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(device_id, "dropping undecodable message: {e}");
                return;
            }
        };
        if !self.resolve_transaction(message.token, device_id) {
            debug!(device_id, token = message.token, "dropping message with unmatched token");
            return;
        }
        let response = Response {
            device_id: device_id.to_string(),
            action: message.action,
            share_id: message.share_id,
            data: message.payload().to_vec(),
        };
        self.dispatch(&response);
    }

    /// Match `(token, device_id)` against the pending transactions, stamping
    /// and retiring the record on success.
    fn resolve_transaction(&self, token: u64, device_id: &str) -> bool {
        let Ok(mut transactions) = self.transactions.lock() else { return false };
        let Some(index) = transactions
            .iter()
            .position(|t| t.id == token && t.device_id == device_id && t.received_at.is_none())
        else {
            return false;
        };
        let mut transaction = transactions.remove(index);
        transaction.received_at = Some(Instant::now());
        trace!(
            device_id,
            token,
            elapsed_us = transaction.sent_at.elapsed().as_micros() as u64,
            "transaction resolved"
        );
        true
    }

    fn dispatch(&self, response: &Response) {
        // Receiver-less is fine: nobody has subscribed yet.
        let _ = self.responses.send(response.clone());
        let Ok(callbacks) = self.callbacks.lock() else { return };
        for callback in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(response))).is_err() {
                error!(
                    device_id = %response.device_id,
                    share_id = response.share_id,
                    "response subscriber panicked"
                );
            }
        }
    }
}

/// Drop the scheduler with the last handle so the runner task exits even if
/// `stop` was never called.
impl<B: Backend> Drop for LinkInner<B> {
    fn drop(&mut self) {
        self.scheduler.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Action;
    use crate::sim::SimBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn link() -> ShareLink<SimBackend> {
        ShareLink::new(SimBackend::new())
    }

    fn response_bytes(token: u64, share_id: u32, data: &[u8]) -> Vec<u8> {
        TransactionMessage::response(token, MessageType::Share, share_id, data).encode()
    }

    #[tokio::test]
    async fn matched_response_reaches_subscribers() {
        let link = link();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        link.register_callback(move |response: &Response| {
            sink.lock().unwrap().push(response.clone());
        });

        link.inner.record_transaction(42, "dev-a");
        assert_eq!(link.pending_transactions(), 1);

        link.inner.on_receive("dev-a", &response_bytes(42, 7, b"value"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].device_id, "dev-a");
        assert_eq!(seen[0].action, Action::ShareResponse);
        assert_eq!(seen[0].share_id, 7);
        assert_eq!(seen[0].data, b"value");
        drop(seen);
        assert_eq!(link.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn identical_tokens_on_different_devices_stay_isolated() {
        let link = link();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        link.register_callback(move |response: &Response| {
            sink.lock().unwrap().push(response.device_id.clone());
        });

        link.inner.record_transaction(42, "dev-a");
        link.inner.record_transaction(42, "dev-b");

        link.inner.on_receive("dev-b", &response_bytes(42, 1, b"b"));

        assert_eq!(*seen.lock().unwrap(), vec!["dev-b"]);
        // dev-a's transaction is still pending.
        assert_eq!(link.pending_transactions(), 1);
    }

    #[tokio::test]
    async fn unmatched_token_is_dropped() {
        let link = link();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        link.register_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        link.inner.on_receive("dev-a", &response_bytes(99, 1, b"stray"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // A resolved transaction does not match twice.
        link.inner.record_transaction(5, "dev-a");
        link.inner.on_receive("dev-a", &response_bytes(5, 1, b"first"));
        link.inner.on_receive("dev-a", &response_bytes(5, 1, b"replay"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn undecodable_message_is_dropped() {
        let link = link();
        link.inner.record_transaction(1, "dev-a");
        link.inner.on_receive("dev-a", &[0xFF; 10]);
        assert_eq!(link.pending_transactions(), 1);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_starve_the_rest() {
        let link = link();
        let calls = Arc::new(AtomicUsize::new(0));

        link.register_callback(|_| panic!("bad subscriber"));
        let counter = Arc::clone(&calls);
        link.register_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        link.inner.record_transaction(3, "dev-a");
        link.inner.on_receive("dev-a", &response_bytes(3, 1, b"x"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn schedules_upsert_and_clear() {
        let link = link();
        link.set_scheduled_message("dev-a", MessageType::Share, 2, Duration::from_millis(100));
        link.set_scheduled_message("dev-a", MessageType::Share, 2, Duration::from_millis(250));
        link.set_scheduled_message("dev-a", MessageType::Share, 3, Duration::from_millis(100));

        let schedules = link.scheduled_messages();
        assert_eq!(schedules.len(), 2);
        let updated = schedules.iter().find(|s| s.share_id == 2).unwrap();
        assert_eq!(updated.interval, Duration::from_millis(250));

        assert!(link.clear_scheduled_message("dev-a", MessageType::Share, 2));
        assert!(!link.clear_scheduled_message("dev-a", MessageType::Share, 2));

        link.set_scheduled_message("dev-b", MessageType::Share, 3, Duration::from_millis(100));
        link.clear_device_schedules("dev-a");
        let schedules = link.scheduled_messages();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].device_id, "dev-b");

        link.clear_all_schedules();
        assert!(link.scheduled_messages().is_empty());
    }

    #[tokio::test]
    async fn requests_require_a_connection() {
        let link = link();
        let result = link.request_message("ghost", MessageType::Share, 1).await;
        assert!(matches!(result, Err(LinkError::NotConnected { .. })));
        let result = link.publish_message("ghost", MessageType::Share, 1, b"x").await;
        assert!(matches!(result, Err(LinkError::NotConnected { .. })));
        // The sync path degrades to empty bytes instead.
        assert!(link.request_message_sync("ghost", MessageType::Share, 1).await.is_empty());
    }
}
