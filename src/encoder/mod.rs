//! # Encoder Module
//!
//! Turns a captured frame and its telemetry into something that can leave
//! the node:
//!
//! - [`Observation`] - JSON envelope with the image as base64, for HTTP push
//! - [`ChunkHeader`] - fixed 24-byte binary header placed before raw JPEG
//!   bytes on the stream
//! - [`exif`] - synthetic EXIF APP1 segment spliced into the JPEG
//!
//! Every encoding is bounded by a scratch capacity and fails closed with
//! [`NodeError::EncodeTooLarge`] instead of producing partial output.

pub mod exif;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::camera::CapturedFrame;
use crate::config::Envelope;
use crate::error::{NodeError, Result};
use crate::telemetry::TelemetrySnapshot;

/// Magic tag opening every binary chunk
pub const CHUNK_MAGIC: [u8; 4] = *b"CHDR";

/// Size of [`ChunkHeader`] on the wire
pub const CHUNK_HEADER_LEN: usize = 24;

/// Milliseconds since the Unix epoch, with sub-millisecond precision
pub fn epoch_millis(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1000.0
}

/// Length of the padded base64 encoding of `n` bytes
pub fn base64_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}

/// One frame ready for push delivery
///
/// Serializes as `{ "time_stamp", "image" }`, or with telemetry present as
/// `{ "time_stamp", "homed", "positions", "gripper", "image" }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    time_stamp: f64,
    #[serde(flatten)]
    telemetry: Option<TelemetrySnapshot>,
    image: String,
}

impl Observation {
    pub fn new(time_stamp: f64, telemetry: Option<TelemetrySnapshot>, image: String) -> Self {
        Self {
            time_stamp,
            telemetry,
            image,
        }
    }

    /// Capture time in epoch milliseconds
    pub fn time_stamp(&self) -> f64 {
        self.time_stamp
    }

    pub fn telemetry(&self) -> Option<&TelemetrySnapshot> {
        self.telemetry.as_ref()
    }

    /// Base64 image text
    pub fn image(&self) -> &str {
        &self.image
    }
}

/// Gripper state sample for the `/gripper` endpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GripperSample {
    pub time_stamp: f64,
    pub state: f32,
}

/// Reusable base64 output buffer with a hard capacity
#[derive(Debug)]
pub struct ScratchBuffer {
    buf: String,
    capacity: usize,
}

impl ScratchBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: String::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Base64-encode `data` into the buffer
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::EncodeTooLarge`] when the encoded text would not
    /// fit; the buffer is left empty.
    pub fn encode_base64(&mut self, data: &[u8]) -> Result<&str> {
        self.buf.clear();

        let size = base64_len(data.len());
        if size > self.capacity {
            return Err(NodeError::EncodeTooLarge {
                size,
                capacity: self.capacity,
            });
        }

        STANDARD.encode_string(data, &mut self.buf);
        Ok(&self.buf)
    }
}

/// Builds push observations in the configured envelope
#[derive(Debug)]
pub struct ObservationEncoder {
    scratch: ScratchBuffer,
    envelope: Envelope,
}

impl ObservationEncoder {
    pub fn new(envelope: Envelope, capacity: usize) -> Self {
        Self {
            scratch: ScratchBuffer::new(capacity),
            envelope,
        }
    }

    /// Encode one frame and the telemetry read alongside it
    ///
    /// The basic envelope drops the telemetry fields.
    ///
    /// # Errors
    ///
    /// [`NodeError::EncodeTooLarge`] if the base64 image exceeds the scratch
    /// capacity.
    pub fn encode(&mut self, frame: &CapturedFrame, telemetry: Option<TelemetrySnapshot>) -> Result<Observation> {
        let image = self.scratch.encode_base64(&frame.data)?.to_owned();
        let telemetry = match self.envelope {
            Envelope::Basic => None,
            Envelope::Extended => telemetry,
        };

        Ok(Observation::new(epoch_millis(frame.captured_at), telemetry, image))
    }
}

/// Fixed-layout binary header for the stream payload (little-endian)
///
/// ```text
/// 0..4   magic "CHDR"
/// 4..8   u32 total length (header + JPEG)
/// 8..16  i64 capture seconds
/// 16..20 i32 capture microseconds
/// 20..24 f32 gripper angle
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkHeader {
    pub total_len: u32,
    pub seconds: i64,
    pub micros: i32,
    pub gripper: f32,
}

impl ChunkHeader {
    /// Header for a JPEG of `jpeg_len` bytes
    ///
    /// # Errors
    ///
    /// [`NodeError::EncodeTooLarge`] if header plus JPEG exceed `capacity`.
    pub fn for_frame(jpeg_len: usize, captured_at: DateTime<Utc>, gripper: f32, capacity: usize) -> Result<Self> {
        let size = CHUNK_HEADER_LEN + jpeg_len;
        if size > capacity {
            return Err(NodeError::EncodeTooLarge { size, capacity });
        }

        Ok(Self {
            total_len: size as u32,
            seconds: captured_at.timestamp(),
            micros: captured_at.timestamp_subsec_micros().min(999_999) as i32,
            gripper,
        })
    }

    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut out = [0u8; CHUNK_HEADER_LEN];
        out[0..4].copy_from_slice(&CHUNK_MAGIC);
        out[4..8].copy_from_slice(&self.total_len.to_le_bytes());
        out[8..16].copy_from_slice(&self.seconds.to_le_bytes());
        out[16..20].copy_from_slice(&self.micros.to_le_bytes());
        out[20..24].copy_from_slice(&self.gripper.to_le_bytes());
        out
    }

    /// Parse a header from the start of `data`
    #[cfg(test)]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < CHUNK_HEADER_LEN || data[0..4] != CHUNK_MAGIC {
            return None;
        }

        let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let mut seconds = [0u8; 8];
        seconds.copy_from_slice(&data[8..16]);

        Some(Self {
            total_len: u32_at(4),
            seconds: i64::from_le_bytes(seconds),
            micros: u32_at(16) as i32,
            gripper: f32::from_bits(u32_at(20)),
        })
    }
}
