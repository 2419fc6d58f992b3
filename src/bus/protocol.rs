//! # Bus Protocol Constants and Types
//!
//! The arm controller speaks a CAN-style message bus. The node reaches it
//! through a serial bridge that carries one bus message per serial frame:
//!
//! ```text
//! +------+---------+---------+-----+-----------+-----+
//! | 0xAA | id (lo) | id (hi) | len | data[len] | crc |
//! +------+---------+---------+-----+-----------+-----+
//! ```
//!
//! `len` is at most 8 (one CAN data field); the CRC covers id, len and data.

use crate::error::{NodeError, Result};

/// Serial frame sync byte
pub const BUS_SYNC_BYTE: u8 = 0xAA;

/// Maximum data bytes per bus message
pub const BUS_MAX_DATA: usize = 8;

/// Bytes around the data field: sync + id(2) + len + crc
pub const BUS_FRAME_OVERHEAD: usize = 5;

/// Status request sent by the node
pub const BUS_ID_STATUS_REQUEST: u16 = 0x300;

/// One fragment of the status payload
pub const BUS_ID_STATUS_DATA: u16 = 0x301;

/// Terminates a status payload
pub const BUS_ID_STATUS_END: u16 = 0x302;

/// A single bus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    /// Message identifier
    pub id: u16,

    /// Data field (0-8 bytes)
    pub data: Vec<u8>,
}

impl BusFrame {
    /// Create a new bus frame
    ///
    /// # Errors
    ///
    /// Returns error if `data` exceeds [`BUS_MAX_DATA`]
    pub fn new(id: u16, data: Vec<u8>) -> Result<Self> {
        if data.len() > BUS_MAX_DATA {
            return Err(NodeError::BusProtocol(format!(
                "Data length {} exceeds maximum {}",
                data.len(),
                BUS_MAX_DATA
            )));
        }

        Ok(Self { id, data })
    }

    /// Frame with no data bytes, e.g. the status request
    pub fn empty(id: u16) -> Self {
        Self { id, data: Vec::new() }
    }

    /// Size of this frame on the serial line
    pub fn wire_len(&self) -> usize {
        BUS_FRAME_OVERHEAD + self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ids_are_distinct() {
        assert_ne!(BUS_ID_STATUS_REQUEST, BUS_ID_STATUS_DATA);
        assert_ne!(BUS_ID_STATUS_DATA, BUS_ID_STATUS_END);
    }

    #[test]
    fn test_frame_max_data() {
        let frame = BusFrame::new(BUS_ID_STATUS_DATA, vec![0u8; 8]).unwrap();
        assert_eq!(frame.wire_len(), 13);
    }

    #[test]
    fn test_frame_data_too_large() {
        assert!(BusFrame::new(BUS_ID_STATUS_DATA, vec![0u8; 9]).is_err());
    }

    #[test]
    fn test_empty_frame() {
        let frame = BusFrame::empty(BUS_ID_STATUS_REQUEST);
        assert!(frame.data.is_empty());
        assert_eq!(frame.wire_len(), BUS_FRAME_OVERHEAD);
    }
}
