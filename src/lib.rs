//! Host-side library for exchanging share data with embedded devices.
//!
//! Devices expose their state as numbered *shares*, read and written through
//! a fixed 64-byte framed protocol over packet transports such as USB HID.
//! The stack has three layers:
//!
//! - [`Frame`] and [`TransactionMessage`]: the wire codec. Frames carry
//!   CRC-32 protected 50-byte fragments; messages are the token-correlated
//!   request/response/publish envelopes reassembled from them.
//! - [`Comm`] and [`CommsManager`]: one background transport loop per
//!   connected device, with a discovery handshake gating every connection.
//! - [`ShareLink`]: the transaction layer. Fire-and-forget requests with
//!   token matching, synchronous request/response with a timeout, standing
//!   request schedules, and fan-out to callbacks and streams.
//!
//! Hardware access sits behind the [`Transport`] and [`Backend`] traits;
//! the [`sim`] module provides an in-process implementation that speaks the
//! full protocol.
//!
//! ```no_run
//! use sharelink::{sim::{SimBackend, SimDevice}, MessageType, ShareLink};
//!
//! # async fn demo() {
//! let backend = SimBackend::new();
//! backend.add_device(SimDevice::new("dev-1"));
//!
//! let link = ShareLink::new(backend);
//! link.start();
//! link.connect_device("dev-1").await;
//! let value = link.request_message_sync("dev-1", MessageType::Share, 2).await;
//! println!("share 2 = {value:?}");
//! link.stop().await;
//! # }
//! ```

mod api;
mod comm;
mod error;
mod frame;
mod manager;
mod message;
pub mod sim;
mod transport;
mod types;

pub use api::{ShareLink, COMMON_SHARE_ID};
pub use comm::Comm;
pub use error::{LinkError, Result};
pub use frame::{
    Frame, ADDRESS_BROADCAST, ADDRESS_HOST, FRAME_PAYLOAD_SIZE, FRAME_SIZE, PREAMBLE_DATA,
    PREAMBLE_DISCOVERY_REQUEST, PREAMBLE_DISCOVERY_RESPONSE,
};
pub use manager::CommsManager;
pub use message::{
    Action, CommonDescriptor, MessageType, TransactionMessage, DATA_MAX_SIZE, MESSAGE_MAX_SIZE,
    MESSAGE_SIZE,
};
pub use transport::{Backend, DeviceCallback, ReceiveCallback, Transport};
pub use types::{DeviceDetails, LinkConfig, Response, ScheduledRequest, Transaction};
