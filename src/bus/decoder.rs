//! # Bus Frame Decoder
//!
//! Incremental decoder for the serial byte stream. Bytes are pushed as they
//! arrive; complete frames are pulled out one at a time. Garbage before a
//! sync byte, oversize lengths and CRC failures are skipped by resyncing on
//! the next sync byte.

use bytes::{Buf, BytesMut};
use tracing::debug;

use super::crc::frame_crc;
use super::protocol::*;
use crate::error::{NodeError, Result};

/// Decode exactly one complete serial frame
///
/// # Errors
///
/// Returns error if:
/// - Frame is too short
/// - Sync byte is incorrect
/// - Length field exceeds [`BUS_MAX_DATA`] or disagrees with the slice
/// - CRC check fails
pub fn decode_frame(bytes: &[u8]) -> Result<BusFrame> {
    if bytes.len() < BUS_FRAME_OVERHEAD {
        return Err(NodeError::BusProtocol("Frame too short".to_string()));
    }

    if bytes[0] != BUS_SYNC_BYTE {
        return Err(NodeError::BusProtocol(format!(
            "Invalid sync byte: 0x{:02X}",
            bytes[0]
        )));
    }

    let len = bytes[3] as usize;
    if len > BUS_MAX_DATA {
        return Err(NodeError::BusProtocol(format!("Invalid data length: {}", len)));
    }

    if bytes.len() != BUS_FRAME_OVERHEAD + len {
        return Err(NodeError::BusProtocol(format!(
            "Frame length mismatch: expected {} bytes, got {}",
            BUS_FRAME_OVERHEAD + len,
            bytes.len()
        )));
    }

    let received_crc = bytes[4 + len];
    let calculated_crc = frame_crc(&bytes[1..4 + len]);
    if received_crc != calculated_crc {
        return Err(NodeError::BusProtocol(format!(
            "CRC mismatch: expected 0x{:02X}, got 0x{:02X}",
            calculated_crc, received_crc
        )));
    }

    let id = u16::from_le_bytes([bytes[1], bytes[2]]);
    BusFrame::new(id, bytes[4..4 + len].to_vec())
}

/// Stateful stream decoder
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the serial line
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet decoded bytes
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything buffered, complete frames included
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Pull the next valid frame, if a complete one is buffered
    pub fn next_frame(&mut self) -> Option<BusFrame> {
        loop {
            // Discard anything before the next sync byte
            match self.buf.iter().position(|&b| b == BUS_SYNC_BYTE) {
                Some(0) => {}
                Some(pos) => {
                    debug!("Skipping {} bytes before sync", pos);
                    self.buf.advance(pos);
                }
                None => {
                    self.buf.clear();
                    return None;
                }
            }

            if self.buf.len() < 4 {
                return None;
            }

            let len = self.buf[3] as usize;
            if len > BUS_MAX_DATA {
                debug!("Oversize length {} after sync, resyncing", len);
                self.buf.advance(1);
                continue;
            }

            let total = BUS_FRAME_OVERHEAD + len;
            if self.buf.len() < total {
                return None;
            }

            match decode_frame(&self.buf[..total]) {
                Ok(frame) => {
                    self.buf.advance(total);
                    return Some(frame);
                }
                Err(e) => {
                    debug!("Dropping bus frame: {}", e);
                    self.buf.advance(1);
                }
            }
        }
    }
}
