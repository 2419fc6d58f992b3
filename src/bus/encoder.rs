//! # Bus Frame Encoder
//!
//! Serializes [`BusFrame`]s for the serial bridge.

use super::crc::frame_crc;
use super::protocol::*;

/// Encode a bus frame into its serial representation
///
/// # Examples
///
/// ```
/// use armcam_node::bus::encoder::encode_frame;
/// use armcam_node::bus::protocol::{BusFrame, BUS_ID_STATUS_REQUEST};
///
/// let bytes = encode_frame(&BusFrame::empty(BUS_ID_STATUS_REQUEST));
/// assert_eq!(bytes.len(), 5);
/// ```
pub fn encode_frame(frame: &BusFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.wire_len());
    out.push(BUS_SYNC_BYTE);
    out.extend_from_slice(&frame.id.to_le_bytes());
    out.push(frame.data.len() as u8);
    out.extend_from_slice(&frame.data);

    // CRC over id + len + data (everything after sync)
    let crc = frame_crc(&out[1..]);
    out.push(crc);

    out
}
