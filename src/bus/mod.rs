//! # Command Bus Module
//!
//! Serial bridge to the arm controller's message bus.
//!
//! This module handles:
//! - Bus frame layout and message identifiers
//! - CRC-8 (DVB-S2) frame checksums
//! - Encoding outgoing frames and resynchronising decoder for incoming bytes
//! - The async [`link::BusLink`] used by the telemetry request/reply exchange

pub mod crc;
pub mod decoder;
pub mod encoder;
pub mod link;
pub mod protocol;
