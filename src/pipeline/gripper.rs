//! Gripper state producer.
//!
//! Posts `{ "time_stamp", "state" }` samples of the last commanded servo
//! angle at its own rate, independent of the camera.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::governor::RateGovernor;
use super::sink::{BatchingSink, PushTransport};
use super::status::StatusIndicator;
use crate::config::GripperConfig;
use crate::encoder::{epoch_millis, GripperSample};
use crate::error::Result;
use crate::manipulator::Manipulator;

pub struct GripperProducer<T> {
    manipulator: Arc<dyn Manipulator>,
    sink: BatchingSink<GripperSample, T>,
    indicator: Arc<dyn StatusIndicator>,
    governor: RateGovernor,
}

impl<T: PushTransport> GripperProducer<T> {
    pub fn new(
        manipulator: Arc<dyn Manipulator>,
        sink: BatchingSink<GripperSample, T>,
        indicator: Arc<dyn StatusIndicator>,
        config: &GripperConfig,
    ) -> Self {
        Self {
            manipulator,
            sink,
            indicator,
            governor: RateGovernor::new(
                "gripper",
                config.target_fps,
                Duration::from_secs(config.report_interval_s),
            ),
        }
    }

    /// Sample the servo and offer it to the sink
    ///
    /// Returns whether the sample was accepted.
    pub async fn tick(&mut self) -> bool {
        let sample = GripperSample {
            time_stamp: epoch_millis(Utc::now()),
            state: self.manipulator.angle(),
        };

        match self.sink.offer(sample).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Gripper push failed: {}", e);
                self.indicator.pulse().await;
                false
            }
        }
    }

    pub async fn run(mut self) -> Result<()> {
        info!("Gripper producer started ({:?} budget)", self.governor.budget());
        loop {
            self.tick().await;
            self.governor.pace().await;
        }
    }
}
