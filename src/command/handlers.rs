//! Handlers for the node's remote commands.
//!
//! | Topic | Payload |
//! |---|---|
//! | `/manipulator/command` | ASCII angle in degrees, clamped to [0, 180] |
//! | `/camera/command` | `on...` enables capture, anything else disables |
//!
//! Both commands are short, so only the first fragment is inspected.

use std::sync::Arc;
use tracing::{info, warn};

use super::{CommandHandler, Fragment};
use crate::manipulator::{clamp_angle, Manipulator};
use crate::pipeline::SharedFlag;

pub const MANIPULATOR_TOPIC: &str = "/manipulator/command";
pub const CAMERA_TOPIC: &str = "/camera/command";

/// Longest angle text considered
const MAX_ANGLE_TEXT: usize = 63;

/// Parse the leading decimal number of a payload and clamp it to the servo
/// range; `None` if there is no number
pub fn parse_angle(payload: &[u8]) -> Option<f32> {
    let payload = &payload[..payload.len().min(MAX_ANGLE_TEXT)];
    let text = std::str::from_utf8(payload).ok()?.trim();

    let end = text
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E')))
        .unwrap_or(text.len());
    let mut candidate = &text[..end];

    // Longest prefix that parses, like strtof
    while !candidate.is_empty() {
        if let Ok(value) = candidate.parse::<f32>() {
            return Some(clamp_angle(value));
        }
        candidate = &candidate[..candidate.len() - 1];
    }
    None
}

/// Moves the gripper servo
pub struct ManipulatorCommandHandler {
    manipulator: Arc<dyn Manipulator>,
}

impl ManipulatorCommandHandler {
    pub fn new(manipulator: Arc<dyn Manipulator>) -> Self {
        Self { manipulator }
    }
}

impl CommandHandler for ManipulatorCommandHandler {
    fn on_fragment(&mut self, fragment: &Fragment<'_>) {
        if !fragment.is_first() {
            return;
        }

        let Some(angle) = parse_angle(fragment.payload) else {
            warn!(
                "Ignoring manipulator command {:?}",
                String::from_utf8_lossy(fragment.payload)
            );
            return;
        };

        info!("Manipulator command: {:.2}", angle);
        if let Err(e) = self.manipulator.set_angle(angle) {
            warn!("Manipulator command failed: {}", e);
        }
    }
}

/// Switches the capture producer on and off
pub struct CameraCommandHandler {
    enabled: SharedFlag,
}

impl CameraCommandHandler {
    pub fn new(enabled: SharedFlag) -> Self {
        Self { enabled }
    }
}

impl CommandHandler for CameraCommandHandler {
    fn on_fragment(&mut self, fragment: &Fragment<'_>) {
        if !fragment.is_first() {
            return;
        }

        let on = fragment.payload.starts_with(b"on");
        self.enabled.set(on);
        info!("Camera capture {}", if on { "enabled" } else { "disabled" });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRouter;
    use crate::manipulator::MockManipulator;
    use mockall::predicate::eq;

    fn expecting(angle: f32) -> Arc<dyn Manipulator> {
        let mut servo = MockManipulator::new();
        servo
            .expect_set_angle()
            .with(eq(angle))
            .times(1)
            .returning(|_| Ok(()));
        Arc::new(servo)
    }

    fn router(manipulator: Arc<dyn Manipulator>, enabled: SharedFlag) -> CommandRouter {
        CommandRouter::builder()
            .subscribe(MANIPULATOR_TOPIC, Box::new(ManipulatorCommandHandler::new(manipulator)))
            .subscribe(CAMERA_TOPIC, Box::new(CameraCommandHandler::new(enabled)))
            .build()
    }

    #[test]
    fn test_angle_command() {
        let mut router = router(expecting(45.0), SharedFlag::default());
        assert!(router.dispatch(&Fragment::whole(MANIPULATOR_TOPIC, b"45.0")));
    }

    #[test]
    fn test_angle_clamped_high() {
        let mut router = router(expecting(180.0), SharedFlag::default());
        router.dispatch(&Fragment::whole(MANIPULATOR_TOPIC, b"200"));
    }

    #[test]
    fn test_angle_clamped_low() {
        let mut router = router(expecting(0.0), SharedFlag::default());
        router.dispatch(&Fragment::whole(MANIPULATOR_TOPIC, b"-10"));
    }

    #[test]
    fn test_fragmented_command_uses_first_fragment() {
        let mut router = router(expecting(90.0), SharedFlag::default());
        router.dispatch(&Fragment { topic: MANIPULATOR_TOPIC, payload: b"90", offset: 0, total: 4 });
        router.dispatch(&Fragment { topic: "", payload: b".5", offset: 2, total: 4 });
    }

    #[test]
    fn test_invalid_angle_is_ignored() {
        let mut servo = MockManipulator::new();
        servo.expect_set_angle().never();
        let mut router = router(Arc::new(servo), SharedFlag::default());

        router.dispatch(&Fragment::whole(MANIPULATOR_TOPIC, b"open"));
    }

    #[test]
    fn test_camera_on_off() {
        let enabled = SharedFlag::new(false);
        let mut servo = MockManipulator::new();
        servo.expect_set_angle().never();
        let mut router = router(Arc::new(servo), enabled.clone());

        router.dispatch(&Fragment::whole(CAMERA_TOPIC, b"on"));
        assert!(enabled.get());
        router.dispatch(&Fragment::whole(CAMERA_TOPIC, b"off"));
        assert!(!enabled.get());
        router.dispatch(&Fragment::whole(CAMERA_TOPIC, b"online"));
        assert!(enabled.get());
        router.dispatch(&Fragment::whole(CAMERA_TOPIC, b""));
        assert!(!enabled.get());
    }

    #[test]
    fn test_parse_angle_forms() {
        assert_eq!(parse_angle(b"  12.5\n"), Some(12.5));
        assert_eq!(parse_angle(b"30deg"), Some(30.0));
        assert_eq!(parse_angle(b"1e1"), Some(10.0));
        assert_eq!(parse_angle(b"7e"), Some(7.0));
        assert_eq!(parse_angle(b"-"), None);
        assert_eq!(parse_angle(b""), None);
        assert_eq!(parse_angle(&[0xFF, 0xFE]), None);
    }
}
