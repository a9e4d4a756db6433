//! Connection lifecycle across devices.
//!
//! [`CommsManager`] owns one [`Comm`] per connected device and gates every
//! connection behind a discovery handshake, so a device that enumerates on
//! the bus but does not speak the protocol is never handed to callers.

use std::collections::HashMap;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::comm::Comm;
use crate::frame::{Frame, FRAME_SIZE, PREAMBLE_DISCOVERY_RESPONSE};
use crate::transport::{Backend, DeviceCallback, Transport};
use crate::types::LinkConfig;
use crate::{LinkError, Result};

pub struct CommsManager<B: Backend> {
    backend: B,
    config: LinkConfig,
    connections: HashMap<String, Comm>,
}

impl<B: Backend> CommsManager<B> {
    pub fn new(backend: B, config: LinkConfig) -> Self {
        Self { backend, config, connections: HashMap::new() }
    }

    /// Device ids the backend can currently see, connected or not.
    pub async fn available_devices(&self) -> Vec<String> {
        self.backend.devices().await
    }

    /// Device ids with a live transport loop.
    pub fn connected_devices(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.connections.contains_key(device_id)
    }

    /// Clone of the transport handle for a connected device.
    pub fn comm(&self, device_id: &str) -> Option<Comm> {
        self.connections.get(device_id).cloned()
    }

    /// Open a device and start its transport loop.
    ///
    /// Returns `true` once the device has answered the discovery handshake
    /// and the loop is running. Returns `true` immediately when the device
    /// is already connected. On any failure the transport is torn down and
    /// no connection is recorded.
    pub async fn connect(&mut self, device_id: &str, on_receive: DeviceCallback) -> bool {
        if self.is_connected(device_id) {
            return true;
        }
        let mut transport = match self.backend.open(device_id).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(device_id, "open failed: {e}");
                return false;
            }
        };
        if let Err(e) = self.handshake(device_id, &mut transport).await {
            warn!(device_id, "handshake failed: {e}");
            if let Err(close_err) = transport.close().await {
                debug!(device_id, "close after failed handshake: {close_err}");
            }
            return false;
        }

        let id = device_id.to_string();
        let comm = Comm::spawn(
            transport,
            &self.config,
            std::sync::Arc::new(move |message| on_receive(&id, message)),
        );
        self.connections.insert(device_id.to_string(), comm);
        debug!(device_id, "device connected");
        true
    }

    /// Stop a device's transport loop. `true` if it was connected.
    pub fn disconnect(&mut self, device_id: &str) -> bool {
        match self.connections.remove(device_id) {
            Some(comm) => {
                comm.stop();
                debug!(device_id, "device disconnected");
                true
            }
            None => false,
        }
    }

    pub fn disconnect_all(&mut self) {
        for (device_id, comm) in self.connections.drain() {
            comm.stop();
            debug!(%device_id, "device disconnected");
        }
    }

    /// Probe a freshly opened transport with a discovery request and wait
    /// for a valid discovery response within the handshake timeout.
    ///
    /// Empty reads are retried until the deadline; the first non-empty
    /// reply settles the outcome. Anything other than one 64-byte frame
    /// with a valid CRC and the discovery-response preamble means the
    /// device does not speak the protocol.
    async fn handshake(&self, device_id: &str, transport: &mut Box<dyn Transport>) -> Result<()> {
        transport.write(&Frame::discovery_request().encode()).await?;
        let deadline = Instant::now() + self.config.handshake_timeout;
        while Instant::now() < deadline {
            let data = transport.read().await?;
            if data.is_empty() {
                tokio::time::sleep(self.config.tick_interval).await;
                continue;
            }
            if data.len() != FRAME_SIZE {
                return Err(LinkError::handshake_failed(
                    device_id,
                    format!("unexpected {} byte reply", data.len()),
                ));
            }
            let frame = Frame::decode(&data)?;
            if frame.is_valid() && frame.preamble == PREAMBLE_DISCOVERY_RESPONSE {
                return Ok(());
            }
            return Err(LinkError::handshake_failed(
                device_id,
                "reply is not a valid discovery response",
            ));
        }
        Err(LinkError::handshake_failed(device_id, "no discovery response before deadline"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBackend, SimDevice};
    use std::sync::Arc;

    fn noop_callback() -> DeviceCallback {
        Arc::new(|_, _| {})
    }

    #[tokio::test]
    async fn lists_backend_devices() {
        let backend = SimBackend::new();
        backend.add_device(SimDevice::new("dev-1"));
        backend.add_device(SimDevice::new("dev-2"));
        let manager = CommsManager::new(backend, LinkConfig::default());

        let mut devices = manager.available_devices().await;
        devices.sort();
        assert_eq!(devices, vec!["dev-1", "dev-2"]);
        assert!(manager.connected_devices().is_empty());
    }

    #[tokio::test]
    async fn connect_runs_discovery_handshake() {
        let backend = SimBackend::new();
        backend.add_device(SimDevice::new("dev-1"));
        let mut manager = CommsManager::new(backend, LinkConfig::default());

        assert!(manager.connect("dev-1", noop_callback()).await);
        assert!(manager.is_connected("dev-1"));
        assert!(manager.comm("dev-1").is_some());

        // Connecting again is a no-op success.
        assert!(manager.connect("dev-1", noop_callback()).await);
        assert_eq!(manager.connected_devices().len(), 1);

        assert!(manager.disconnect("dev-1"));
        assert!(!manager.is_connected("dev-1"));
        assert!(!manager.disconnect("dev-1"));
    }

    #[tokio::test]
    async fn unknown_device_fails_to_connect() {
        let backend = SimBackend::new();
        let mut manager = CommsManager::new(backend, LinkConfig::default());
        assert!(!manager.connect("missing", noop_callback()).await);
        assert!(!manager.is_connected("missing"));
    }

    #[tokio::test]
    async fn mute_device_fails_the_handshake() {
        let backend = SimBackend::new();
        let device = SimDevice::new("dev-1");
        device.set_mute(true);
        backend.add_device(device);
        let config = LinkConfig {
            handshake_timeout: tokio::time::Duration::from_millis(30),
            ..LinkConfig::default()
        };
        let mut manager = CommsManager::new(backend, config);

        assert!(!manager.connect("dev-1", noop_callback()).await);
        assert!(!manager.is_connected("dev-1"));
    }

    /// Backend whose device answers every read with a data frame instead of
    /// a discovery response.
    struct WrongReplyBackend;

    struct WrongReplyTransport;

    #[async_trait::async_trait]
    impl crate::transport::Transport for WrongReplyTransport {
        async fn read(&mut self) -> crate::Result<Vec<u8>> {
            Ok(Frame::data(crate::frame::ADDRESS_HOST, 0x02, 1, 1, 1, Vec::new())
                .encode()
                .to_vec())
        }

        async fn write(&mut self, _buffer: &[u8]) -> crate::Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Backend for WrongReplyBackend {
        async fn devices(&self) -> Vec<String> {
            vec!["dev-1".to_string()]
        }

        async fn open(&self, _device_id: &str) -> crate::Result<Box<dyn Transport>> {
            Ok(Box::new(WrongReplyTransport))
        }
    }

    #[tokio::test]
    async fn wrong_reply_fails_the_handshake_without_waiting_out_the_deadline() {
        // Generous deadline: a wrong reply must settle the handshake at
        // once, not after retries.
        let config = LinkConfig {
            handshake_timeout: tokio::time::Duration::from_secs(30),
            ..LinkConfig::default()
        };
        let mut manager = CommsManager::new(WrongReplyBackend, config);

        let connected =
            tokio::time::timeout(tokio::time::Duration::from_millis(500), async {
                manager.connect("dev-1", noop_callback()).await
            })
            .await
            .expect("handshake settles on the first reply");
        assert!(!connected);
        assert!(!manager.is_connected("dev-1"));
    }

    #[tokio::test]
    async fn disconnect_all_stops_every_loop() {
        let backend = SimBackend::new();
        backend.add_device(SimDevice::new("dev-1"));
        backend.add_device(SimDevice::new("dev-2"));
        let mut manager = CommsManager::new(backend, LinkConfig::default());

        assert!(manager.connect("dev-1", noop_callback()).await);
        assert!(manager.connect("dev-2", noop_callback()).await);
        let comm = manager.comm("dev-1").unwrap();

        manager.disconnect_all();
        assert!(manager.connected_devices().is_empty());
        assert!(comm.is_stopped());
    }
}
