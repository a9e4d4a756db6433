//! Per-device transport loop.
//!
//! One background task per connected device drives the raw transport: it
//! fragments outgoing application messages into frames, reassembles incoming
//! frames into messages, and publishes each completed message to a callback
//! and to a "last message" watch slot used by the synchronous request path.
//!
//! The loop is cooperative: cancellation is observed at the top of each tick
//! and never preempts work already in flight.

use std::collections::HashMap;

use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::frame::{Frame, ADDRESS_BROADCAST, ADDRESS_HOST, FRAME_PAYLOAD_SIZE, FRAME_SIZE, PREAMBLE_DATA};
use crate::transport::{ReceiveCallback, Transport};
use crate::types::LinkConfig;
use crate::{LinkError, Result};

/// Split a message into data frames sharing one `frame_id`.
///
/// Fragments carry consecutive `frame_order` values starting at 1; the last
/// slice is zero-padded to [`FRAME_PAYLOAD_SIZE`] by the codec. An empty
/// message produces no frames at all.
pub(crate) fn fragment_message(
    destination: u8,
    source: u8,
    frame_id: u32,
    message: &[u8],
) -> Vec<Frame> {
    let required = message.len().div_ceil(FRAME_PAYLOAD_SIZE);
    let mut frames = Vec::with_capacity(required);
    for (index, chunk) in message.chunks(FRAME_PAYLOAD_SIZE).enumerate() {
        frames.push(Frame::data(
            destination,
            source,
            frame_id,
            (index + 1) as u8,
            required as u8,
            chunk.to_vec(),
        ));
    }
    frames
}

/// Transient per-`frame_id` collection of received fragments.
struct Bucket {
    frames: Vec<Frame>,
    created_at: Instant,
}

/// Frame-to-message reassembly state.
///
/// Buckets accumulate fragments keyed by `frame_id`; a message completes
/// when its bucket holds every `frame_order` from 1 to `frame_total`,
/// regardless of arrival order. Buckets that never complete are evicted
/// after a TTL instead of leaking.
pub(crate) struct Reassembler {
    buckets: HashMap<u32, Bucket>,
}

impl Reassembler {
    pub(crate) fn new() -> Self {
        Self { buckets: HashMap::new() }
    }

    /// Insert one received frame into its bucket.
    pub(crate) fn accept(&mut self, frame: Frame) {
        self.buckets
            .entry(frame.frame_id)
            .or_insert_with(|| Bucket { frames: Vec::new(), created_at: Instant::now() })
            .frames
            .push(frame);
    }

    /// Scan every bucket for a complete fragment set, returning the
    /// reassembled messages and deleting their buckets. Incomplete buckets
    /// are left untouched for a future tick.
    pub(crate) fn drain_complete(&mut self) -> Vec<Vec<u8>> {
        let mut complete: Vec<(u32, Vec<u8>)> = Vec::new();
        for (&frame_id, bucket) in &self.buckets {
            let Some(first) = bucket.frames.iter().find(|f| f.frame_order == 1) else {
                continue;
            };
            let total = first.frame_total as usize;
            if total == 1 {
                // Single-fragment fast path.
                complete.push((frame_id, first.payload.clone()));
                continue;
            }
            if bucket.frames.len() != total {
                continue;
            }
            // Concatenate payloads by ascending order; bail if any position
            // is missing (duplicate orders can fake the length check).
            let mut message = Vec::with_capacity(total * FRAME_PAYLOAD_SIZE);
            let mut whole = true;
            for order in 1..=total as u8 {
                match bucket.frames.iter().find(|f| f.frame_order == order) {
                    Some(fragment) => message.extend_from_slice(&fragment.payload),
                    None => {
                        whole = false;
                        break;
                    }
                }
            }
            if whole {
                complete.push((frame_id, message));
            }
        }
        complete
            .into_iter()
            .map(|(frame_id, message)| {
                self.buckets.remove(&frame_id);
                message
            })
            .collect()
    }

    /// Evict buckets whose fragments stopped arriving.
    pub(crate) fn evict_expired(&mut self, ttl: Duration) {
        let now = Instant::now();
        self.buckets.retain(|frame_id, bucket| {
            let keep = now.duration_since(bucket.created_at) <= ttl;
            if !keep {
                trace!(frame_id, fragments = bucket.frames.len(), "evicting stale reassembly bucket");
            }
            keep
        });
    }

    #[cfg(test)]
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Handle to one running transport loop.
///
/// Cheap to clone; all clones drive the same background task. Stopping is
/// explicit via [`Comm::stop`], which also closes the underlying transport.
#[derive(Clone)]
pub struct Comm {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    last_message: watch::Receiver<(u64, Vec<u8>)>,
    cancel: CancellationToken,
}

impl Comm {
    /// Spawn the transport loop for an opened transport. Each completed
    /// incoming message is handed to `on_receive`.
    pub fn spawn(
        transport: Box<dyn Transport>,
        config: &LinkConfig,
        on_receive: ReceiveCallback,
    ) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (last_tx, last_rx) = watch::channel((0u64, Vec::new()));
        let cancel = CancellationToken::new();

        let task = CommTask {
            transport,
            reassembly: Reassembler::new(),
            outgoing: outgoing_rx,
            last_message: last_tx,
            sequence: 0,
            on_receive,
            config: config.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        Self { outgoing: outgoing_tx, last_message: last_rx, cancel }
    }

    /// Queue one message for transmission.
    ///
    /// The queue is unbounded: callers that enqueue faster than the
    /// transport drains accumulate memory without backpressure.
    pub fn send(&self, message: Vec<u8>) {
        if self.outgoing.send(message).is_err() {
            debug!("send on stopped comm dropped");
        }
    }

    /// Send a message, then wait until the *next* message completes or the
    /// timeout elapses.
    ///
    /// This is single-flight correlation: it identifies "the most recently
    /// completed message", not a response by identity, so concurrent
    /// synchronous calls on one connection must be serialized by the caller.
    pub async fn send_then_receive(&self, message: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let mut receiver = self.last_message.clone();
        // Capture the current sequence so only a later completion counts.
        receiver.borrow_and_update();
        if self.outgoing.send(message).is_err() {
            return Err(LinkError::transport_failed("comm task stopped"));
        }
        match tokio::time::timeout(timeout, receiver.changed()).await {
            Ok(Ok(())) => Ok(receiver.borrow().1.clone()),
            Ok(Err(_)) => Err(LinkError::transport_failed("comm task stopped")),
            Err(_) => Err(LinkError::Timeout { duration: timeout }),
        }
    }

    /// Request the loop to stop. Observed at the top of the next tick; the
    /// transport is closed by the task before it exits.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the loop has been asked to stop.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct CommTask {
    transport: Box<dyn Transport>,
    reassembly: Reassembler,
    outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    last_message: watch::Sender<(u64, Vec<u8>)>,
    sequence: u64,
    on_receive: ReceiveCallback,
    config: LinkConfig,
    cancel: CancellationToken,
}

impl CommTask {
    async fn run(mut self) {
        debug!("comm task started");
        // Cancellation is checked only between ticks: work in flight runs to
        // completion, so a fragment set mid-write is never cut off. Only the
        // inter-tick sleep races the token.
        while !self.cancel.is_cancelled() {
            self.process_incoming().await;
            self.reassembly.evict_expired(self.config.bucket_ttl);
            self.process_outgoing().await;
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
        }
        if let Err(e) = self.transport.close().await {
            debug!("transport close failed: {e}");
        }
        debug!("comm task stopped");
    }

    async fn process_incoming(&mut self) {
        let data = match self.transport.read().await {
            Ok(data) => data,
            Err(e) => {
                trace!("transport read failed: {e}");
                return;
            }
        };
        if data.len() != FRAME_SIZE {
            // Nothing pending, or noise that cannot be a frame.
            return;
        }
        let Ok(frame) = Frame::decode(&data) else {
            return;
        };
        // Foreign traffic on a shared bus is expected: anything that is not
        // a valid data frame addressed to the host is dropped silently.
        if !frame.is_valid() || frame.preamble != PREAMBLE_DATA || frame.destination != ADDRESS_HOST
        {
            trace!(
                frame_id = frame.frame_id,
                preamble = frame.preamble,
                destination = frame.destination,
                "dropping frame"
            );
            return;
        }
        self.reassembly.accept(frame);
        for message in self.reassembly.drain_complete() {
            self.sequence += 1;
            self.last_message.send_replace((self.sequence, message.clone()));
            (self.on_receive)(&message);
        }
    }

    async fn process_outgoing(&mut self) {
        // One message per tick; its fragments are written back-to-back so
        // two messages never interleave on the wire.
        let Ok(message) = self.outgoing.try_recv() else {
            return;
        };
        let frame_id = rand::random::<u32>();
        for frame in fragment_message(ADDRESS_BROADCAST, ADDRESS_HOST, frame_id, &message) {
            if let Err(e) = self.transport.write(&frame.encode()).await {
                warn!("transport write failed: {e}");
                return;
            }
        }
    }
}
