//! Transport and backend seams.
//!
//! The link stack never talks to hardware directly. A [`Transport`] is one
//! open byte channel to one device (HID interrupt endpoints, a serial port,
//! or the in-process simulator); a [`Backend`] knows how to enumerate device
//! ids and open transports for them. Both are object-safe so drivers live in
//! their own crates.

use std::sync::Arc;

use crate::Result;

/// One open byte-oriented channel to a device.
///
/// Reads are polled from the transport loop: an implementation either blocks
/// briefly or returns an empty buffer when nothing is pending. Anything that
/// is not exactly one 64-byte frame is ignored by the caller, so partial
/// reads are safe to surface as-is.
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    /// Read one raw block from the device. An empty buffer means nothing was
    /// available this tick.
    async fn read(&mut self) -> Result<Vec<u8>>;

    /// Write one raw block to the device.
    async fn write(&mut self, buffer: &[u8]) -> Result<()>;

    /// Close the channel. Further reads and writes fail.
    async fn close(&mut self) -> Result<()>;
}

/// Device discovery and transport construction.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Enumerate currently discoverable device ids.
    async fn devices(&self) -> Vec<String>;

    /// Open a transport to a device. The caller still runs the discovery
    /// handshake before the connection is considered usable.
    async fn open(&self, device_id: &str) -> Result<Box<dyn Transport>>;
}

/// Callback invoked with each completed (reassembled) message.
pub type ReceiveCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback invoked with each completed message and the device it came from.
pub type DeviceCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;
