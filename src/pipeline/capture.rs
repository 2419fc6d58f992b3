//! Frame + telemetry producer.
//!
//! One tick: read the camera and the robot state concurrently, encode, then
//! hand the observation to the network sink or write the raw JPEG to the
//! spool. Retryable failures skip the tick and pulse the status indicator;
//! fatal ones end the task.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::governor::RateGovernor;
use super::sink::{BatchingSink, PushTransport};
use super::spool::Spool;
use super::status::StatusIndicator;
use super::SharedFlag;
use crate::camera::{capture_jpeg, SharedFrameSource};
use crate::config::{CaptureConfig, DeliveryMode};
use crate::encoder::{Observation, ObservationEncoder};
use crate::error::{NodeError, Result};
use crate::telemetry::TelemetrySource;

/// Handles the producer owns for its whole life
pub struct CaptureContext<T> {
    pub source: SharedFrameSource,
    pub telemetry: Box<dyn TelemetrySource>,
    pub sink: BatchingSink<Observation, T>,
    pub spool: Option<Spool>,
    /// Written by the camera command handler
    pub enabled: SharedFlag,
    /// Cleared on a failed flush, set again by the drainer
    pub network_up: SharedFlag,
    pub indicator: Arc<dyn StatusIndicator>,
}

/// What one tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Capture is switched off
    Idle,
    /// Observation added to a batch that is not yet full
    Batched,
    /// Observation completed a batch of this many items, now delivered
    Sent(usize),
    /// Raw frame written to the spool
    Spooled,
    /// Retryable failure; nothing delivered
    Skipped,
}

pub struct CapturePipeline<T> {
    ctx: CaptureContext<T>,
    encoder: ObservationEncoder,
    delivery: DeliveryMode,
    governor: RateGovernor,
}

impl<T: PushTransport> CapturePipeline<T> {
    /// # Errors
    ///
    /// Returns [`NodeError::ConfigurationFatal`] when spool delivery is
    /// configured without a spool.
    pub fn new(ctx: CaptureContext<T>, config: &CaptureConfig) -> Result<Self> {
        if config.delivery != DeliveryMode::Network && ctx.spool.is_none() {
            return Err(NodeError::ConfigurationFatal(format!(
                "{:?} delivery needs a spool directory",
                config.delivery
            )));
        }

        Ok(Self {
            ctx,
            encoder: ObservationEncoder::new(config.envelope, config.scratch_capacity),
            delivery: config.delivery,
            governor: RateGovernor::new(
                "capture",
                config.target_fps,
                Duration::from_secs(config.report_interval_s),
            ),
        })
    }

    fn spool_active(&self) -> bool {
        match self.delivery {
            DeliveryMode::Network => false,
            DeliveryMode::Spool => true,
            DeliveryMode::Auto => !self.ctx.network_up.get(),
        }
    }

    /// Run one capture cycle
    ///
    /// # Errors
    ///
    /// Only fatal errors are returned; everything else becomes
    /// [`TickOutcome::Skipped`].
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        if !self.ctx.enabled.get() {
            return Ok(TickOutcome::Idle);
        }

        match self.capture_once().await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_fatal() => {
                error!("Capture stopped: {}", e);
                Err(e)
            }
            Err(e) => {
                warn!("Capture tick failed: {}", e);
                self.ctx.indicator.pulse().await;
                Ok(TickOutcome::Skipped)
            }
        }
    }

    async fn capture_once(&mut self) -> Result<TickOutcome> {
        let (frame, telemetry) = tokio::join!(capture_jpeg(&self.ctx.source), self.ctx.telemetry.read());
        let frame = frame?;
        let telemetry = telemetry?;
        debug!("Captured {} bytes, {}", frame.data.len(), telemetry.describe());

        if self.spool_active() {
            let spool = self
                .ctx
                .spool
                .as_ref()
                .ok_or_else(|| NodeError::ConfigurationFatal("spool missing".to_string()))?;
            spool.write(frame.captured_at, &frame.data).await?;
            return Ok(TickOutcome::Spooled);
        }

        let observation = self.encoder.encode(&frame, Some(telemetry))?;
        match self.ctx.sink.offer(observation).await {
            Ok(None) => Ok(TickOutcome::Batched),
            Ok(Some(count)) => Ok(TickOutcome::Sent(count)),
            Err(e) => {
                if self.delivery == DeliveryMode::Auto && self.ctx.network_up.get() {
                    info!("Push failed, spooling until the drainer reaches the server");
                    self.ctx.network_up.set(false);
                }
                Err(e)
            }
        }
    }

    /// Tick and pace until a fatal error
    pub async fn run(mut self) -> Result<()> {
        info!(
            "Capture producer started ({:?} delivery, {:?} budget)",
            self.delivery,
            self.governor.budget()
        );
        loop {
            self.tick().await?;
            self.governor.pace().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::mocks::{fake_jpeg, ScriptedSource};
    use crate::camera::{shared, PixelFormat};
    use crate::config::Envelope;
    use crate::pipeline::sink::MockPushTransport;
    use crate::pipeline::status::mocks::CountingIndicator;
    use crate::telemetry::mocks::{snapshot, ScriptedTelemetry};
    use tempfile::TempDir;

    struct Harness {
        pipeline: CapturePipeline<MockPushTransport>,
        indicator: Arc<CountingIndicator>,
        network_up: SharedFlag,
    }

    fn harness(
        frames: Vec<Option<(Vec<u8>, PixelFormat)>>,
        telemetry: Vec<Option<crate::telemetry::TelemetrySnapshot>>,
        transport: MockPushTransport,
        config: CaptureConfig,
        spool: Option<Spool>,
    ) -> Harness {
        let indicator = Arc::new(CountingIndicator::default());
        let network_up = SharedFlag::new(true);
        let ctx = CaptureContext {
            source: shared(Box::new(ScriptedSource::new(frames))),
            telemetry: Box::new(ScriptedTelemetry::new(telemetry)),
            sink: BatchingSink::new(transport, "/camera", 2),
            spool,
            enabled: SharedFlag::new(true),
            network_up: network_up.clone(),
            indicator: indicator.clone(),
        };
        Harness {
            pipeline: CapturePipeline::new(ctx, &config).unwrap(),
            indicator,
            network_up,
        }
    }

    fn jpegs(n: usize) -> Vec<Option<(Vec<u8>, PixelFormat)>> {
        vec![Some((fake_jpeg(16), PixelFormat::Jpeg)); n]
    }

    fn readings(n: usize) -> Vec<Option<crate::telemetry::TelemetrySnapshot>> {
        vec![Some(snapshot(45.0)); n]
    }

    #[tokio::test]
    async fn test_batches_then_sends() {
        let mut transport = MockPushTransport::new();
        transport
            .expect_post_json()
            .times(1)
            .withf(|_, body| {
                let value: serde_json::Value = serde_json::from_str(body).unwrap();
                value.as_array().map(|a| a.len()) == Some(2)
            })
            .returning(|_, _| Ok(()));
        let mut h = harness(jpegs(2), readings(2), transport, CaptureConfig::default(), None);

        assert_eq!(h.pipeline.tick().await.unwrap(), TickOutcome::Batched);
        assert_eq!(h.pipeline.tick().await.unwrap(), TickOutcome::Sent(2));
        assert_eq!(h.indicator.count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_capture_is_idle() {
        let mut h = harness(jpegs(1), readings(1), MockPushTransport::new(), CaptureConfig::default(), None);
        h.pipeline.ctx.enabled.set(false);

        assert_eq!(h.pipeline.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_camera_failure_skips_tick() {
        let mut h = harness(vec![None], readings(1), MockPushTransport::new(), CaptureConfig::default(), None);

        assert_eq!(h.pipeline.tick().await.unwrap(), TickOutcome::Skipped);
        assert_eq!(h.indicator.count(), 1);
    }

    #[tokio::test]
    async fn test_telemetry_failure_skips_tick() {
        let mut h = harness(jpegs(1), vec![None], MockPushTransport::new(), CaptureConfig::default(), None);

        assert_eq!(h.pipeline.tick().await.unwrap(), TickOutcome::Skipped);
        assert_eq!(h.indicator.count(), 1);
    }

    #[tokio::test]
    async fn test_wrong_pixel_format_is_fatal() {
        let frames = vec![Some((vec![0u8; 8], PixelFormat::Unknown))];
        let mut h = harness(frames, readings(1), MockPushTransport::new(), CaptureConfig::default(), None);

        let err = h.pipeline.tick().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_dropped() {
        let config = CaptureConfig {
            scratch_capacity: 8,
            ..Default::default()
        };
        let mut h = harness(jpegs(1), readings(1), MockPushTransport::new(), config, None);

        assert_eq!(h.pipeline.tick().await.unwrap(), TickOutcome::Skipped);
        assert_eq!(h.pipeline.ctx.sink.pending(), 0);
    }

    #[tokio::test]
    async fn test_spool_delivery_writes_raw_jpeg() {
        let dir = TempDir::new().unwrap();
        let config = CaptureConfig {
            delivery: DeliveryMode::Spool,
            ..Default::default()
        };
        let spool = Spool::new(dir.path());
        let mut h = harness(jpegs(1), readings(1), MockPushTransport::new(), config, Some(spool.clone()));

        assert_eq!(h.pipeline.tick().await.unwrap(), TickOutcome::Spooled);
        let files = spool.list().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(&files[0]).unwrap(), fake_jpeg(16));
    }

    #[tokio::test]
    async fn test_auto_delivery_falls_back_to_spool() {
        let dir = TempDir::new().unwrap();
        let config = CaptureConfig {
            delivery: DeliveryMode::Auto,
            envelope: Envelope::Basic,
            ..Default::default()
        };
        let mut transport = MockPushTransport::new();
        transport
            .expect_post_json()
            .times(1)
            .returning(|_, _| Err(NodeError::Network("timeout".to_string())));
        let spool = Spool::new(dir.path());
        let mut h = harness(jpegs(3), readings(3), transport, config, Some(spool.clone()));

        assert_eq!(h.pipeline.tick().await.unwrap(), TickOutcome::Batched);
        assert_eq!(h.pipeline.tick().await.unwrap(), TickOutcome::Skipped);
        assert!(!h.network_up.get());

        assert_eq!(h.pipeline.tick().await.unwrap(), TickOutcome::Spooled);
        assert_eq!(spool.list().await.unwrap().len(), 1);
    }

    #[test]
    fn test_spool_delivery_requires_spool() {
        let config = CaptureConfig {
            delivery: DeliveryMode::Spool,
            ..Default::default()
        };
        let ctx = CaptureContext {
            source: shared(Box::new(ScriptedSource::new(vec![]))),
            telemetry: Box::new(ScriptedTelemetry::new(vec![])),
            sink: BatchingSink::new(MockPushTransport::new(), "/camera", 1),
            spool: None,
            enabled: SharedFlag::new(true),
            network_up: SharedFlag::new(true),
            indicator: Arc::new(CountingIndicator::default()),
        };

        assert!(CapturePipeline::new(ctx, &config).is_err());
    }
}
