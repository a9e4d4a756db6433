//! Application message envelope.
//!
//! A transaction message is the logical request/response/publish unit carried
//! inside one or more frames. It is encoded as a fixed little-endian layout:
//!
//! ```text
//! [u64 token][u8 action][u32 share_id][u8 data_length][80B data]
//! ```
//!
//! Receivers clamp input to the first [`MESSAGE_MAX_SIZE`] bytes before
//! decoding, which tolerates the trailing zeros that 50-byte fragment
//! granularity produces on reassembled payloads.

use serde::Serialize;
use tracing::warn;

use crate::{LinkError, Result};

/// Maximum number of meaningful bytes in a message's data field.
pub const DATA_MAX_SIZE: usize = 80;

/// Encoded size of a transaction message.
pub const MESSAGE_SIZE: usize = 8 + 1 + 4 + 1 + DATA_MAX_SIZE;

/// Upper bound applied to reassembled payloads before decoding.
pub const MESSAGE_MAX_SIZE: usize = 99;

/// Transaction action carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    CommonRequest = 0,
    CommonPublish = 1,
    CommonResponse = 2,
    ShareRequest = 3,
    SharePublish = 4,
    ShareResponse = 5,
}

impl Action {
    /// Whether this action is a device-to-host response.
    pub fn is_response(self) -> bool {
        matches!(self, Action::CommonResponse | Action::ShareResponse)
    }
}

impl TryFrom<u8> for Action {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Action::CommonRequest),
            1 => Ok(Action::CommonPublish),
            2 => Ok(Action::CommonResponse),
            3 => Ok(Action::ShareRequest),
            4 => Ok(Action::SharePublish),
            5 => Ok(Action::ShareResponse),
            other => {
                Err(LinkError::parse_error("action", format!("unknown action value {other}")))
            }
        }
    }
}

/// Message class selector used by the transaction layer: `Common` targets the
/// reserved device-identity share, `Share` targets application data topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Common,
    Share,
}

impl MessageType {
    /// The request action for this message class.
    pub fn request_action(self) -> Action {
        match self {
            MessageType::Common => Action::CommonRequest,
            MessageType::Share => Action::ShareRequest,
        }
    }

    /// The publish action for this message class.
    pub fn publish_action(self) -> Action {
        match self {
            MessageType::Common => Action::CommonPublish,
            MessageType::Share => Action::SharePublish,
        }
    }
}

/// One application message.
///
/// `data_length` is carried explicitly rather than derived from `data`: the
/// request convention sets `data_length = 1` with zeroed data to mean "pull
/// the current value".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMessage {
    pub token: u64,
    pub action: Action,
    pub share_id: u32,
    pub data_length: u8,
    pub data: Vec<u8>,
}

impl TransactionMessage {
    /// Build a request message for a share. The zeroed one-byte payload is
    /// the wire convention for "no payload, pull current value".
    pub fn request(token: u64, message_type: MessageType, share_id: u32) -> Self {
        Self {
            token,
            action: message_type.request_action(),
            share_id,
            data_length: 1,
            data: vec![0u8; DATA_MAX_SIZE],
        }
    }

    /// Build a publish message for a share.
    ///
    /// A payload longer than [`DATA_MAX_SIZE`] is replaced with an *empty*
    /// payload (`data_length = 0`, zeroed data) rather than rejected or
    /// truncated. This mirrors the device-side fail-closed convention; the
    /// device will observe an empty publish, not an error.
    pub fn publish(token: u64, message_type: MessageType, share_id: u32, data: &[u8]) -> Self {
        let data: &[u8] = if data.len() > DATA_MAX_SIZE {
            warn!(
                share_id,
                len = data.len(),
                "publish payload exceeds {DATA_MAX_SIZE} bytes, coercing to empty payload"
            );
            &[]
        } else {
            data
        };
        Self {
            token,
            action: message_type.publish_action(),
            share_id,
            data_length: data.len() as u8,
            data: data.to_vec(),
        }
    }

    /// Build a response message, as a device would reply to a request.
    pub fn response(token: u64, message_type: MessageType, share_id: u32, data: &[u8]) -> Self {
        let data: &[u8] = if data.len() > DATA_MAX_SIZE { &[] } else { data };
        let action = match message_type {
            MessageType::Common => Action::CommonResponse,
            MessageType::Share => Action::ShareResponse,
        };
        Self { token, action, share_id, data_length: data.len() as u8, data: data.to_vec() }
    }

    /// The meaningful prefix of the data field.
    pub fn payload(&self) -> &[u8] {
        let length = (self.data_length as usize).min(self.data.len());
        &self.data[..length]
    }

    /// Pack into the fixed [`MESSAGE_SIZE`] wire form, zero-padding the data
    /// field.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.data.len() <= DATA_MAX_SIZE);
        let mut bytes = Vec::with_capacity(MESSAGE_SIZE);
        bytes.extend_from_slice(&self.token.to_le_bytes());
        bytes.push(self.action as u8);
        bytes.extend_from_slice(&self.share_id.to_le_bytes());
        bytes.push(self.data_length);
        bytes.extend_from_slice(&self.data);
        bytes.resize(MESSAGE_SIZE, 0);
        bytes
    }

    /// Decode a reassembled payload. Input is clamped to the first
    /// [`MESSAGE_MAX_SIZE`] bytes; anything shorter than [`MESSAGE_SIZE`]
    /// or carrying an unknown action or an out-of-range `data_length` fails
    /// closed with a parse error.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes = &bytes[..bytes.len().min(MESSAGE_MAX_SIZE)];
        if bytes.len() < MESSAGE_SIZE {
            return Err(LinkError::parse_error(
                "envelope",
                format!("{} bytes is shorter than the {} byte envelope", bytes.len(), MESSAGE_SIZE),
            ));
        }
        let token = u64::from_le_bytes(bytes[0..8].try_into().expect("fixed slice"));
        let action = Action::try_from(bytes[8])?;
        let share_id = u32::from_le_bytes(bytes[9..13].try_into().expect("fixed slice"));
        let data_length = bytes[13];
        if data_length as usize > DATA_MAX_SIZE {
            return Err(LinkError::parse_error(
                "envelope",
                format!("data length {data_length} exceeds {DATA_MAX_SIZE}"),
            ));
        }
        Ok(Self {
            token,
            action,
            share_id,
            data_length,
            data: bytes[14..14 + DATA_MAX_SIZE].to_vec(),
        })
    }
}

/// Device identity carried by the reserved common share (share 1).
///
/// Encoded little-endian inside a message's data field:
///
/// ```text
/// [u32 registry_id][u32 serial_number][u32 shares_version][u32 firmware_version][u8 name_len][name]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommonDescriptor {
    pub registry_id: u32,
    pub serial_number: u32,
    pub shares_version: u32,
    pub firmware_version: u32,
    pub device_name: String,
}

impl CommonDescriptor {
    /// Maximum UTF-8 length of the device name inside the 80-byte data field.
    pub const NAME_MAX: usize = DATA_MAX_SIZE - 17;

    pub fn encode(&self) -> Vec<u8> {
        let name = self.device_name.as_bytes();
        let name_length = name.len().min(Self::NAME_MAX);
        let mut bytes = Vec::with_capacity(17 + name_length);
        bytes.extend_from_slice(&self.registry_id.to_le_bytes());
        bytes.extend_from_slice(&self.serial_number.to_le_bytes());
        bytes.extend_from_slice(&self.shares_version.to_le_bytes());
        bytes.extend_from_slice(&self.firmware_version.to_le_bytes());
        bytes.push(name_length as u8);
        bytes.extend_from_slice(&name[..name_length]);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 17 {
            return Err(LinkError::parse_error(
                "common descriptor",
                format!("{} bytes is too short", bytes.len()),
            ));
        }
        let name_length = bytes[16] as usize;
        if bytes.len() < 17 + name_length {
            return Err(LinkError::parse_error(
                "common descriptor",
                format!("name length {name_length} exceeds remaining {}", bytes.len() - 17),
            ));
        }
        let device_name = String::from_utf8(bytes[17..17 + name_length].to_vec())
            .map_err(|e| LinkError::parse_error("common descriptor", e.to_string()))?;
        Ok(Self {
            registry_id: u32::from_le_bytes(bytes[0..4].try_into().expect("fixed slice")),
            serial_number: u32::from_le_bytes(bytes[4..8].try_into().expect("fixed slice")),
            shares_version: u32::from_le_bytes(bytes[8..12].try_into().expect("fixed slice")),
            firmware_version: u32::from_le_bytes(bytes[12..16].try_into().expect("fixed slice")),
            device_name,
        })
    }
}
