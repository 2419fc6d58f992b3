//! Status exchange over the command bus.
//!
//! The node sends one status request; the arm controller answers with a run
//! of data frames carrying the status payload, then an end-of-message frame:
//!
//! ```text
//! node -> 0x300 (empty)
//! arm  -> 0x301 [8 bytes] ... 0x301 [n bytes]
//! arm  -> 0x302
//! ```
//!
//! Payload layout: byte 0 homed flag, bytes 1-3 padding, then one
//! little-endian f32 per joint.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::{TelemetrySnapshot, TelemetrySource};
use crate::bus::link::BusLink;
use crate::bus::protocol::{BusFrame, BUS_ID_STATUS_DATA, BUS_ID_STATUS_END, BUS_ID_STATUS_REQUEST};
use crate::config::TelemetryConfig;
use crate::error::{NodeError, Result};
use crate::manipulator::Manipulator;

/// Offset of the first joint position in the status payload
pub const POSITIONS_OFFSET: usize = 4;

/// Telemetry read through a [`BusLink`]
pub struct BusTelemetry<L> {
    link: L,
    manipulator: Arc<dyn Manipulator>,
    joint_count: usize,
    max_attempts: u32,
    attempt_timeout: Duration,
}

impl<L: BusLink> BusTelemetry<L> {
    pub fn new(link: L, manipulator: Arc<dyn Manipulator>, config: &TelemetryConfig) -> Self {
        Self {
            link,
            manipulator,
            joint_count: config.joint_count,
            max_attempts: config.max_attempts,
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }

    /// Run one request/reply exchange and return the reassembled payload
    async fn exchange(&mut self) -> Result<Vec<u8>> {
        // A reply to an earlier request that timed out must not answer this one
        let stale = self
            .link
            .clear()
            .await
            .map_err(|e| NodeError::TelemetryUnavailable(format!("bus flush failed: {}", e)))?;
        if stale > 0 {
            debug!("Dropped {} stale bytes before status request", stale);
        }

        self.link
            .send(&BusFrame::empty(BUS_ID_STATUS_REQUEST))
            .await
            .map_err(|e| NodeError::TelemetryUnavailable(format!("status request failed: {}", e)))?;

        let mut payload = Vec::new();
        for attempt in 0..self.max_attempts {
            let frame = self
                .link
                .recv(self.attempt_timeout)
                .await
                .map_err(|e| NodeError::TelemetryUnavailable(e.to_string()))?;

            match frame {
                Some(frame) if frame.id == BUS_ID_STATUS_DATA => {
                    payload.extend_from_slice(&frame.data);
                }
                Some(frame) if frame.id == BUS_ID_STATUS_END => {
                    trace!("Status payload complete after {} attempts", attempt + 1);
                    return Ok(payload);
                }
                Some(frame) => {
                    debug!("Ignoring bus frame 0x{:03X} during status exchange", frame.id);
                }
                None => {}
            }
        }

        Err(NodeError::TelemetryUnavailable(format!(
            "no end of message after {} attempts",
            self.max_attempts
        )))
    }
}

/// Decode a status payload
///
/// # Errors
///
/// Returns [`NodeError::TelemetryUnavailable`] if the payload is shorter than
/// the header or carries a different number of joints than configured.
pub fn parse_status(payload: &[u8], joint_count: usize, gripper: f32) -> Result<TelemetrySnapshot> {
    if payload.len() < POSITIONS_OFFSET {
        return Err(NodeError::TelemetryUnavailable(format!(
            "status payload too short: {} bytes",
            payload.len()
        )));
    }

    let positions: Vec<f32> = payload[POSITIONS_OFFSET..]
        .chunks_exact(4)
        .map(|w| f32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();

    if positions.len() != joint_count {
        return Err(NodeError::TelemetryUnavailable(format!(
            "expected {} joints, got {}",
            joint_count,
            positions.len()
        )));
    }

    Ok(TelemetrySnapshot {
        homed: payload[0] != 0,
        positions,
        gripper,
    })
}

#[async_trait]
impl<L: BusLink> TelemetrySource for BusTelemetry<L> {
    async fn read(&mut self) -> Result<TelemetrySnapshot> {
        let payload = self.exchange().await?;
        let snapshot = parse_status(&payload, self.joint_count, self.manipulator.angle())?;
        debug!("Telemetry: {}", snapshot.describe());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::link::mocks::{Reply, ScriptedLink};
    use crate::manipulator::MockManipulator;

    fn status_payload(homed: bool, positions: &[f32]) -> Vec<u8> {
        let mut payload = vec![homed as u8, 0, 0, 0];
        for p in positions {
            payload.extend_from_slice(&p.to_le_bytes());
        }
        payload
    }

    fn data_replies(payload: &[u8]) -> Vec<Reply> {
        payload
            .chunks(8)
            .map(|c| Reply::Frame(BusFrame::new(BUS_ID_STATUS_DATA, c.to_vec()).unwrap()))
            .collect()
    }

    fn servo(angle: f32) -> Arc<dyn Manipulator> {
        let mut servo = MockManipulator::new();
        servo.expect_angle().return_const(angle);
        Arc::new(servo)
    }

    fn config(joints: usize, attempts: u32) -> TelemetryConfig {
        TelemetryConfig {
            joint_count: joints,
            max_attempts: attempts,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_read_reassembles_payload() {
        let positions = [0.0, 1.5, -0.75, 3.25, 0.125, -2.0];
        let mut replies = data_replies(&status_payload(true, &positions));
        replies.insert(1, Reply::Timeout);
        replies.push(Reply::Frame(BusFrame::empty(BUS_ID_STATUS_END)));

        let link = ScriptedLink::new(replies);
        let mut telemetry = BusTelemetry::new(link.clone(), servo(30.0), &config(6, 20));

        let snapshot = telemetry.read().await.unwrap();
        assert!(snapshot.homed);
        assert_eq!(snapshot.positions, positions.to_vec());
        assert_eq!(snapshot.gripper, 30.0);
        assert_eq!(link.sent_ids(), vec![BUS_ID_STATUS_REQUEST]);
    }

    #[tokio::test]
    async fn test_missing_end_is_unavailable() {
        let replies = data_replies(&status_payload(false, &[1.0, 2.0]));
        let link = ScriptedLink::new(replies);
        let mut telemetry = BusTelemetry::new(link.clone(), servo(0.0), &config(2, 20));

        let err = telemetry.read().await.unwrap_err();
        assert!(matches!(err, NodeError::TelemetryUnavailable(_)));
        assert_eq!(link.recv_count(), 20);
    }

    #[tokio::test]
    async fn test_ignores_unrelated_frames() {
        let mut replies = vec![Reply::Frame(BusFrame::new(0x123, vec![9, 9]).unwrap())];
        replies.extend(data_replies(&status_payload(true, &[4.0])));
        replies.push(Reply::Frame(BusFrame::empty(BUS_ID_STATUS_END)));

        let mut telemetry = BusTelemetry::new(ScriptedLink::new(replies), servo(0.0), &config(1, 20));
        let snapshot = telemetry.read().await.unwrap();
        assert_eq!(snapshot.positions, vec![4.0]);
    }

    #[tokio::test]
    async fn test_late_reply_is_not_served_to_next_read() {
        let mut replies = vec![Reply::Timeout; 20];
        for frame in data_replies(&status_payload(true, &[1.0])) {
            if let Reply::Frame(frame) = frame {
                replies.push(Reply::Stale(frame));
            }
        }
        replies.push(Reply::Stale(BusFrame::empty(BUS_ID_STATUS_END)));
        replies.extend(data_replies(&status_payload(true, &[2.0])));
        replies.push(Reply::Frame(BusFrame::empty(BUS_ID_STATUS_END)));

        let link = ScriptedLink::new(replies);
        let mut telemetry = BusTelemetry::new(link.clone(), servo(0.0), &config(1, 20));

        assert!(telemetry.read().await.is_err());
        let snapshot = telemetry.read().await.unwrap();
        assert_eq!(snapshot.positions, vec![2.0]);
        assert_eq!(link.sent_ids(), vec![BUS_ID_STATUS_REQUEST, BUS_ID_STATUS_REQUEST]);
    }

    #[tokio::test]
    async fn test_link_error_is_unavailable() {
        let link = ScriptedLink::new(vec![Reply::Fail]);
        let mut telemetry = BusTelemetry::new(link, servo(0.0), &config(6, 20));

        let err = telemetry.read().await.unwrap_err();
        assert!(matches!(err, NodeError::TelemetryUnavailable(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_parse_status_rejects_short_payload() {
        assert!(parse_status(&[1, 0], 0, 0.0).is_err());
    }

    #[test]
    fn test_parse_status_rejects_wrong_joint_count() {
        let payload = status_payload(true, &[1.0, 2.0, 3.0]);
        let err = parse_status(&payload, 6, 0.0).unwrap_err();
        assert!(err.to_string().contains("expected 6 joints, got 3"));
    }

    #[test]
    fn test_parse_status_ignores_trailing_partial_word() {
        let mut payload = status_payload(false, &[7.5]);
        payload.extend_from_slice(&[0xAB, 0xCD]);
        let snapshot = parse_status(&payload, 1, 12.0).unwrap();
        assert_eq!(snapshot.positions, vec![7.5]);
        assert!(!snapshot.homed);
    }
}
