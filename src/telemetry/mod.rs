//! # Telemetry Module
//!
//! Robot state sampled once per capture tick.
//!
//! Sources:
//! - [`bus::BusTelemetry`] - request/reply exchange over the command bus
//! - [`LocalTelemetry`] - gripper angle only, for arms without a bus bridge

pub mod bus;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::Result;
use crate::manipulator::Manipulator;

/// Manipulator state at one instant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Arm has completed its homing sequence
    pub homed: bool,
    /// Joint positions in robot order
    pub positions: Vec<f32>,
    /// Gripper angle in degrees, [0, 180]
    pub gripper: f32,
}

impl TelemetrySnapshot {
    /// One-line summary for debug logs
    pub fn describe(&self) -> String {
        let mut out = format!(
            "homed={} gripper={:.2}",
            if self.homed { "yes" } else { "no" },
            self.gripper
        );
        if !self.positions.is_empty() {
            out.push_str(" positions=[");
            for (i, p) in self.positions.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{:.3}", p);
            }
            out.push(']');
        }
        out
    }
}

/// Producer of robot state
#[async_trait]
pub trait TelemetrySource: Send {
    /// Take a fresh snapshot
    ///
    /// # Errors
    ///
    /// [`crate::error::NodeError::TelemetryUnavailable`] when the exchange did
    /// not complete; the caller skips the tick.
    async fn read(&mut self) -> Result<TelemetrySnapshot>;
}

/// Gripper-only telemetry read from the local servo
pub struct LocalTelemetry {
    manipulator: Arc<dyn Manipulator>,
}

impl LocalTelemetry {
    pub fn new(manipulator: Arc<dyn Manipulator>) -> Self {
        Self { manipulator }
    }
}

#[async_trait]
impl TelemetrySource for LocalTelemetry {
    async fn read(&mut self) -> Result<TelemetrySnapshot> {
        Ok(TelemetrySnapshot {
            homed: false,
            positions: Vec::new(),
            gripper: self.manipulator.angle(),
        })
    }
}
