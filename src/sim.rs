//! In-process simulated devices.
//!
//! The simulator speaks the real wire protocol at the frame level: discovery
//! handshakes, fragment reassembly, token echoing. It backs the integration
//! tests and gives embedders a device to develop against without hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::api::COMMON_SHARE_ID;
use crate::frame::{
    Frame, ADDRESS_HOST, FRAME_SIZE, PREAMBLE_DATA, PREAMBLE_DISCOVERY_REQUEST,
};
use crate::message::{Action, CommonDescriptor, MessageType, TransactionMessage};
use crate::transport::{Backend, Transport};
use crate::{LinkError, Result};

/// Bus address the simulated devices answer from.
const DEVICE_ADDRESS: u8 = 0x02;

/// One simulated device.
///
/// Shares are plain byte buffers keyed by id; share 2 starts as a `u32`
/// counter value and share 3 as a short text, which is enough surface for
/// request and publish flows. Cloning shares the underlying device.
#[derive(Clone)]
pub struct SimDevice {
    inner: Arc<SimDeviceInner>,
}

struct SimDeviceInner {
    id: String,
    descriptor: CommonDescriptor,
    state: Mutex<SimState>,
}

struct SimState {
    shares: HashMap<u32, Vec<u8>>,
    outbox: VecDeque<Vec<u8>>,
    buckets: HashMap<u32, Vec<Frame>>,
    request_count: usize,
    mute: bool,
}

impl SimDevice {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let descriptor = CommonDescriptor {
            registry_id: 1001,
            serial_number: 123_456,
            shares_version: 1,
            firmware_version: 1,
            device_name: id.clone(),
        };
        let mut shares = HashMap::new();
        shares.insert(2, 100u32.to_le_bytes().to_vec());
        shares.insert(3, b"simulated".to_vec());
        Self {
            inner: Arc::new(SimDeviceInner {
                id,
                descriptor,
                state: Mutex::new(SimState {
                    shares,
                    outbox: VecDeque::new(),
                    buckets: HashMap::new(),
                    request_count: 0,
                    mute: false,
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// A muted device ignores all traffic, including discovery.
    pub fn set_mute(&self, mute: bool) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.mute = mute;
        }
    }

    /// Current bytes of a share, if it exists.
    pub fn share_value(&self, share_id: u32) -> Option<Vec<u8>> {
        self.inner.state.lock().ok()?.shares.get(&share_id).cloned()
    }

    pub fn set_share(&self, share_id: u32, value: Vec<u8>) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.shares.insert(share_id, value);
        }
    }

    /// Number of share requests the device has answered.
    pub fn request_count(&self) -> usize {
        self.inner.state.lock().map(|s| s.request_count).unwrap_or(0)
    }

    fn pop_outgoing(&self) -> Vec<u8> {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|mut state| state.outbox.pop_front())
            .unwrap_or_default()
    }

    /// Process one raw block arriving from the host.
    fn handle_write(&self, buffer: &[u8]) {
        if buffer.len() != FRAME_SIZE {
            return;
        }
        let Ok(frame) = Frame::decode(buffer) else { return };
        if !frame.is_valid() {
            return;
        }
        let Ok(mut state) = self.inner.state.lock() else { return };
        if state.mute {
            return;
        }
        match frame.preamble {
            PREAMBLE_DISCOVERY_REQUEST => {
                let response = Frame::discovery_response(DEVICE_ADDRESS);
                state.outbox.push_back(response.encode().to_vec());
            }
            PREAMBLE_DATA => {
                if let Some(message) = Self::reassemble(&mut state, frame) {
                    self.handle_message(&mut state, &message);
                }
            }
            _ => {}
        }
    }

    /// Device-side reassembly: one bucket per frame id, completed when all
    /// orders from 1 to the total have arrived.
    fn reassemble(state: &mut SimState, frame: Frame) -> Option<Vec<u8>> {
        let frame_id = frame.frame_id;
        let bucket = state.buckets.entry(frame_id).or_default();
        bucket.push(frame);
        let total = bucket.iter().find(|f| f.frame_order == 1)?.frame_total as usize;
        if bucket.len() < total {
            return None;
        }
        let mut message = Vec::new();
        for order in 1..=total as u8 {
            let fragment = bucket.iter().find(|f| f.frame_order == order)?;
            message.extend_from_slice(&fragment.payload);
        }
        state.buckets.remove(&frame_id);
        Some(message)
    }

    fn handle_message(&self, state: &mut SimState, payload: &[u8]) {
        let Ok(message) = TransactionMessage::decode(payload) else { return };
        let reply = match message.action {
            Action::CommonRequest if message.share_id == COMMON_SHARE_ID => {
                TransactionMessage::response(
                    message.token,
                    MessageType::Common,
                    message.share_id,
                    &self.inner.descriptor.encode(),
                )
            }
            Action::ShareRequest => {
                state.request_count += 1;
                let data = state.shares.get(&message.share_id).cloned().unwrap_or_default();
                TransactionMessage::response(
                    message.token,
                    MessageType::Share,
                    message.share_id,
                    &data,
                )
            }
            Action::SharePublish | Action::CommonPublish => {
                state.shares.insert(message.share_id, message.payload().to_vec());
                let message_type = match message.action {
                    Action::CommonPublish => MessageType::Common,
                    _ => MessageType::Share,
                };
                let data = state.shares.get(&message.share_id).cloned().unwrap_or_default();
                TransactionMessage::response(message.token, message_type, message.share_id, &data)
            }
            // Host-bound actions arriving at a device are protocol noise.
            _ => return,
        };
        let frame_id = rand::random::<u32>();
        for frame in crate::comm::fragment_message(
            ADDRESS_HOST,
            DEVICE_ADDRESS,
            frame_id,
            &reply.encode(),
        ) {
            state.outbox.push_back(frame.encode().to_vec());
        }
    }
}

/// One open channel to a simulated device.
pub struct SimTransport {
    device: SimDevice,
    closed: bool,
}

#[async_trait::async_trait]
impl Transport for SimTransport {
    async fn read(&mut self) -> Result<Vec<u8>> {
        if self.closed {
            return Err(LinkError::Closed { device_id: self.device.id().to_string() });
        }
        Ok(self.device.pop_outgoing())
    }

    async fn write(&mut self, buffer: &[u8]) -> Result<()> {
        if self.closed {
            return Err(LinkError::Closed { device_id: self.device.id().to_string() });
        }
        self.device.handle_write(buffer);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Backend over a mutable roster of simulated devices.
#[derive(Clone, Default)]
pub struct SimBackend {
    devices: Arc<Mutex<HashMap<String, SimDevice>>>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device: SimDevice) {
        if let Ok(mut devices) = self.devices.lock() {
            devices.insert(device.id().to_string(), device);
        }
    }

    /// Unplug a device; open transports keep their handle but new opens fail.
    pub fn remove_device(&self, device_id: &str) {
        if let Ok(mut devices) = self.devices.lock() {
            devices.remove(device_id);
        }
    }

    pub fn device(&self, device_id: &str) -> Option<SimDevice> {
        self.devices.lock().ok()?.get(device_id).cloned()
    }
}

#[async_trait::async_trait]
impl Backend for SimBackend {
    async fn devices(&self) -> Vec<String> {
        self.devices.lock().map(|d| d.keys().cloned().collect()).unwrap_or_default()
    }

    async fn open(&self, device_id: &str) -> Result<Box<dyn Transport>> {
        let device = self
            .device(device_id)
            .ok_or_else(|| LinkError::transport_failed(format!("no such device {device_id}")))?;
        Ok(Box::new(SimTransport { device, closed: false }))
    }
}
