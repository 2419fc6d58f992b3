//! # ArmCam Node
//!
//! Observation node firmware for a camera-equipped robotic arm.
//!
//! # Control Flow
//!
//! 1. **Initialization**
//!    - Load and validate `config/default.toml` (or the path given as the
//!      first argument)
//!    - Set up console and optional rolling file logging
//!    - Open the servo, camera and telemetry source once
//!
//! 2. **Tasks**
//!    - Capture producer (frames + telemetry to HTTP or spool)
//!    - Spool drainer, gripper producer, MQTT commands and the stream
//!      responder when configured
//!
//! 3. **Shutdown**
//!    - Ctrl+C exits cleanly
//!    - A fatal task error exits with an error status
//!
//! Expected output:
//! ```text
//! INFO armcam_node: ArmCam node v0.1.0 starting...
//! INFO armcam_node::camera::libcamera: Starting libcamera-vid: 640x480 @ 30fps (mjpeg)
//! INFO armcam_node::command::mqtt: Connected to MQTT broker
//! INFO armcam_node::pipeline::governor: capture: 29.8 fps, avg elapsed 12.4 ms, avg delay 21.0 ms
//! ```

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use armcam_node::bus::link::SerialBusLink;
use armcam_node::camera::libcamera::LibcameraSource;
use armcam_node::camera::still::StillSource;
use armcam_node::camera::{self, FrameSource};
use armcam_node::command::handlers::{CameraCommandHandler, ManipulatorCommandHandler, CAMERA_TOPIC, MANIPULATOR_TOPIC};
use armcam_node::command::mqtt::MqttChannel;
use armcam_node::command::CommandRouter;
use armcam_node::config::{CameraConfig, CameraSourceKind, Config, DeliveryMode, Envelope, LoggingConfig, TelemetryConfig, TelemetrySourceKind};
use armcam_node::manipulator::{Manipulator, PwmServo};
use armcam_node::pipeline::capture::{CaptureContext, CapturePipeline};
use armcam_node::pipeline::gripper::GripperProducer;
use armcam_node::pipeline::sink::{BatchingSink, BodyShape, HttpTransport};
use armcam_node::pipeline::spool::{Drainer, Spool};
use armcam_node::pipeline::{status, SharedFlag};
use armcam_node::stream::{self, StreamSettings, StreamState};
use armcam_node::telemetry::bus::BusTelemetry;
use armcam_node::telemetry::{LocalTelemetry, TelemetrySource};

/// Configuration file used when no path is given
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Log file name prefix inside `[logging].log_dir`
const LOG_FILE_PREFIX: &str = "armcam-node.log";

type TaskResult = (&'static str, armcam_node::error::Result<()>);

fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::from_default_env().add_directive(
        config
            .level
            .parse()
            .with_context(|| format!("Invalid log level {:?}", config.level))?,
    );

    if config.log_dir.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    }

    let appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();

    Ok(Some(guard))
}

fn open_camera(config: &CameraConfig) -> Result<Box<dyn FrameSource>> {
    let source: Box<dyn FrameSource> = match config.source {
        CameraSourceKind::Libcamera => Box::new(LibcameraSource::start(config)?),
        CameraSourceKind::Still => Box::new(StillSource::open(&config.still_path)?),
    };
    Ok(source)
}

fn open_telemetry(config: &TelemetryConfig, manipulator: Arc<dyn Manipulator>) -> Result<Box<dyn TelemetrySource>> {
    let source: Box<dyn TelemetrySource> = match config.source {
        TelemetrySourceKind::Local => Box::new(LocalTelemetry::new(manipulator)),
        TelemetrySourceKind::Bus => {
            let link = SerialBusLink::open(&config.port, config.baud_rate)?;
            Box::new(BusTelemetry::new(link, manipulator, config))
        }
    };
    Ok(source)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;
    let _log_guard = init_logging(&config.logging)?;

    info!("ArmCam node v{} starting...", env!("CARGO_PKG_VERSION"));

    // Peripherals, opened once
    let manipulator: Arc<dyn Manipulator> = Arc::new(PwmServo::open(&config.manipulator)?);
    let source = camera::shared(open_camera(&config.camera)?);
    let telemetry = open_telemetry(&config.telemetry, manipulator.clone())?;

    let enabled = SharedFlag::new(config.capture.enabled_at_start);
    let network_up = SharedFlag::new(true);
    let indicator = status::from_config(&config.status);
    let endpoint = config.push_endpoint()?;

    let spool = if config.spool.enabled || config.capture.delivery != DeliveryMode::Network {
        let spool = Spool::new(&config.spool.dir);
        spool.ensure_dir().await?;
        Some(spool)
    } else {
        None
    };

    let mut tasks: JoinSet<TaskResult> = JoinSet::new();

    // Capture producer
    let shape = match config.capture.envelope {
        Envelope::Basic => BodyShape::Array,
        Envelope::Extended => BodyShape::SingleObject,
    };
    let sink = BatchingSink::new(
        HttpTransport::new(&endpoint, config.push.auth_scheme, &config.push.token)?,
        config.push.camera_path.clone(),
        config.push.batch_size,
    )
    .with_shape(shape);
    let capture = CapturePipeline::new(
        CaptureContext {
            source: source.clone(),
            telemetry,
            sink,
            spool: spool.clone(),
            enabled: enabled.clone(),
            network_up: network_up.clone(),
            indicator: indicator.clone(),
        },
        &config.capture,
    )?;
    tasks.spawn(async move { ("capture", capture.run().await) });

    // Spool drainer
    if let Some(spool) = spool {
        let drainer = Drainer::new(
            spool,
            HttpTransport::new(&endpoint, config.push.auth_scheme, &config.push.token)?,
            config.push.camera_path.clone(),
            config.spool.max_file_bytes,
            Duration::from_millis(config.spool.idle_ms),
            network_up.clone(),
        );
        tasks.spawn(async move { ("spool drainer", drainer.run().await) });
    }

    // Gripper producer
    if config.gripper.enabled {
        let producer = GripperProducer::new(
            manipulator.clone(),
            BatchingSink::new(
                HttpTransport::new(&endpoint, config.push.auth_scheme, &config.push.token)?,
                config.push.gripper_path.clone(),
                config.push.batch_size,
            ),
            indicator.clone(),
            &config.gripper,
        );
        tasks.spawn(async move { ("gripper", producer.run().await) });
    }

    // Remote commands
    if config.mqtt.enabled {
        let router = CommandRouter::builder()
            .subscribe(MANIPULATOR_TOPIC, Box::new(ManipulatorCommandHandler::new(manipulator.clone())))
            .subscribe(CAMERA_TOPIC, Box::new(CameraCommandHandler::new(enabled.clone())))
            .build();
        let channel = MqttChannel::new(&config.mqtt, &config.mqtt_endpoint()?, router);
        tasks.spawn(async move { ("mqtt", channel.run().await) });
    }

    // Stream responder
    if config.stream.enabled {
        let state = StreamState::new(
            source.clone(),
            manipulator.clone(),
            StreamSettings::from_config(&config.stream, config.capture.scratch_capacity),
        );
        let bind = config.stream.bind.clone();
        tasks.spawn(async move { ("stream", stream::serve(&bind, state).await) });
    }

    info!("Capture {} at start", if enabled.get() { "enabled" } else { "disabled" });
    info!("Press Ctrl+C to exit");

    loop {
        tokio::select! {
            Some(joined) = tasks.join_next() => {
                match joined {
                    Ok((name, Err(e))) if e.is_fatal() => {
                        error!("{} task failed: {}", name, e);
                        return Err(anyhow!(e).context(format!("{} task failed", name)));
                    }
                    Ok((name, Err(e))) => warn!("{} task stopped: {}", name, e),
                    Ok((name, Ok(()))) => info!("{} task finished", name),
                    Err(e) => return Err(anyhow!(e).context("task panicked")),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    Ok(())
}
