//! Link-layer frame codec.
//!
//! Every physical packet on the wire is exactly [`FRAME_SIZE`] (64) bytes,
//! little-endian:
//!
//! ```text
//! [u16 preamble][u8 dest][u8 src][u32 frame_id][u8 order][u8 total][50B payload][u32 crc]
//! ```
//!
//! The CRC is CRC-32 (ISO-HDLC, the zlib variant) over the first 60 packed
//! bytes. A frame whose stored CRC does not match its own encoding is invalid
//! and must never reach reassembly.

use crate::{LinkError, Result};

/// Size of one frame on the wire.
pub const FRAME_SIZE: usize = 64;

/// Payload capacity of one frame. Longer application messages are fragmented
/// into multiple frames sharing a `frame_id`.
pub const FRAME_PAYLOAD_SIZE: usize = 50;

/// Byte offset of the CRC field; the checksum covers everything before it.
const CRC_OFFSET: usize = 60;

/// Preamble tag for data frames.
pub const PREAMBLE_DATA: u16 = 0x01;
/// Preamble tag for discovery (compatibility check) requests.
pub const PREAMBLE_DISCOVERY_REQUEST: u16 = 0x02;
/// Preamble tag for discovery responses.
pub const PREAMBLE_DISCOVERY_RESPONSE: u16 = 0x03;

/// Broadcast address: first receiving device responds.
pub const ADDRESS_BROADCAST: u8 = 0x00;
/// Address of the host (PC side) on the local bus.
pub const ADDRESS_HOST: u8 = 0x01;

/// One link-layer frame.
///
/// `payload` holds the logical slice (at most [`FRAME_PAYLOAD_SIZE`] bytes);
/// encoding zero-pads it to the fixed width. Frames decoded off the wire
/// always carry the full 50-byte padded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub preamble: u16,
    pub destination: u8,
    pub source: u8,
    pub frame_id: u32,
    pub frame_order: u8,
    pub frame_total: u8,
    pub payload: Vec<u8>,
    pub crc: u32,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            preamble: PREAMBLE_DATA,
            destination: ADDRESS_BROADCAST,
            source: ADDRESS_HOST,
            frame_id: 1,
            frame_order: 1,
            frame_total: 1,
            payload: Vec::new(),
            crc: 0,
        }
    }
}

impl Frame {
    /// Build a data frame and stamp its checksum.
    pub fn data(
        destination: u8,
        source: u8,
        frame_id: u32,
        frame_order: u8,
        frame_total: u8,
        payload: Vec<u8>,
    ) -> Self {
        let mut frame = Self {
            preamble: PREAMBLE_DATA,
            destination,
            source,
            frame_id,
            frame_order,
            frame_total,
            payload,
            crc: 0,
        };
        frame.checksum();
        frame
    }

    /// Build a discovery request frame (empty payload, checksummed).
    pub fn discovery_request() -> Self {
        let mut frame = Self { preamble: PREAMBLE_DISCOVERY_REQUEST, ..Self::default() };
        frame.checksum();
        frame
    }

    /// Build a discovery response frame, as a compatible device would reply.
    pub fn discovery_response(source: u8) -> Self {
        let mut frame = Self {
            preamble: PREAMBLE_DISCOVERY_RESPONSE,
            destination: ADDRESS_HOST,
            source,
            ..Self::default()
        };
        frame.checksum();
        frame
    }

    /// Pack the frame into its 64-byte wire form.
    ///
    /// The CRC is recomputed from the packed header and payload; the `crc`
    /// field of `self` is not consulted. A payload longer than
    /// [`FRAME_PAYLOAD_SIZE`] is a programming error: fragmentation must
    /// never produce an oversize slice.
    ///
    /// # Panics
    ///
    /// Panics if `payload.len() > FRAME_PAYLOAD_SIZE`.
    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        assert!(
            self.payload.len() <= FRAME_PAYLOAD_SIZE,
            "frame payload of {} bytes exceeds the {} byte capacity",
            self.payload.len(),
            FRAME_PAYLOAD_SIZE
        );
        let mut bytes = [0u8; FRAME_SIZE];
        bytes[0..2].copy_from_slice(&self.preamble.to_le_bytes());
        bytes[2] = self.destination;
        bytes[3] = self.source;
        bytes[4..8].copy_from_slice(&self.frame_id.to_le_bytes());
        bytes[8] = self.frame_order;
        bytes[9] = self.frame_total;
        bytes[10..10 + self.payload.len()].copy_from_slice(&self.payload);
        // Remaining payload bytes stay zero (padding).
        let crc = crc32fast::hash(&bytes[..CRC_OFFSET]);
        bytes[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Unpack a 64-byte wire frame. Fails with a length error for any other
    /// input size; no validation beyond length is performed here, use
    /// [`Frame::is_valid`] after decoding.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != FRAME_SIZE {
            return Err(LinkError::frame_length(bytes.len()));
        }
        Ok(Self {
            preamble: u16::from_le_bytes([bytes[0], bytes[1]]),
            destination: bytes[2],
            source: bytes[3],
            frame_id: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            frame_order: bytes[8],
            frame_total: bytes[9],
            payload: bytes[10..CRC_OFFSET].to_vec(),
            crc: u32::from_le_bytes([bytes[60], bytes[61], bytes[62], bytes[63]]),
        })
    }

    /// Recompute the checksum over this frame's own encoding and compare it
    /// to the stored `crc`. Called on every received frame.
    pub fn is_valid(&self) -> bool {
        self.crc == self.calculate_crc()
    }

    /// Stamp the `crc` field from the current header and payload.
    pub fn checksum(&mut self) {
        self.crc = self.calculate_crc();
    }

    fn calculate_crc(&self) -> u32 {
        crc32fast::hash(&self.encode()[..CRC_OFFSET])
    }
}
