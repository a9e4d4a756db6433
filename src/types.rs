//! Plain data types shared across the link stack.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::message::{Action, MessageType};

/// Tunables for the link stack. The defaults match the cadence the protocol
/// was designed around: a 1 ms transport tick and sub-second request
/// round trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Sleep between transport loop ticks.
    pub tick_interval: Duration,
    /// Scheduler scan cadence. Must stay below the smallest schedule
    /// interval callers are expected to use.
    pub scheduler_interval: Duration,
    /// Default timeout for synchronous request/response exchanges.
    pub sync_timeout: Duration,
    /// How long to wait for a discovery response during connect.
    pub handshake_timeout: Duration,
    /// Time-to-live for incomplete reassembly buckets. Fragments that never
    /// complete a message are evicted after this long instead of leaking.
    pub bucket_ttl: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1),
            scheduler_interval: Duration::from_millis(25),
            sync_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(250),
            bucket_ttl: Duration::from_secs(1),
        }
    }
}

/// Normalized response handed to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub device_id: String,
    pub action: Action,
    pub share_id: u32,
    /// The meaningful bytes of the response payload.
    pub data: Vec<u8>,
}

impl Response {
    /// Payload as standard base64, the encoding gateway endpoints emit.
    pub fn data_base64(&self) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }
}

/// Identity and version metadata for one discoverable device, assembled from
/// its common descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDetails {
    pub device_id: String,
    pub device_name: String,
    pub registry_id: u32,
    pub serial_number: u32,
    pub shares_version: u32,
    pub firmware_version: u32,
}

/// One outstanding request awaiting its response.
///
/// Created when a request or publish is issued, removed when a response with
/// a matching `(id, device_id)` pair arrives. There is no expiry: a response
/// that never comes leaves the record pending.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// The request token.
    pub id: u64,
    pub device_id: String,
    pub sent_at: Instant,
    pub received_at: Option<Instant>,
    pub created_at: Instant,
}

impl Transaction {
    pub fn new(id: u64, device_id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self { id, device_id: device_id.into(), sent_at: now, received_at: None, created_at: now }
    }
}

/// A standing polling policy: re-issue a request for (device, type, share)
/// every `interval`.
#[derive(Debug, Clone)]
pub struct ScheduledRequest {
    pub device_id: String,
    pub message_type: MessageType,
    pub share_id: u32,
    pub interval: Duration,
    pub last_scheduled: Instant,
    pub updated_at: Instant,
    pub created_at: Instant,
}

impl ScheduledRequest {
    pub fn new(
        device_id: impl Into<String>,
        message_type: MessageType,
        share_id: u32,
        interval: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            device_id: device_id.into(),
            message_type,
            share_id,
            interval,
            last_scheduled: now,
            updated_at: now,
            created_at: now,
        }
    }

    /// Whether the schedule matches a (device, type, share) key.
    pub fn matches(&self, device_id: &str, message_type: MessageType, share_id: u32) -> bool {
        self.device_id == device_id
            && self.message_type == message_type
            && self.share_id == share_id
    }

    /// Stamp the schedule as fired now.
    pub fn tick(&mut self) {
        self.last_scheduled = Instant::now();
    }

    /// Replace the interval and stamp the update time.
    pub fn update_interval(&mut self, interval: Duration) {
        self.interval = interval;
        self.updated_at = Instant::now();
    }

    /// Whether enough time has elapsed since the last firing.
    pub fn is_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_scheduled) > self.interval
    }
}
