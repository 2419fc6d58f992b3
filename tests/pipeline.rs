//! End-to-end pipeline tests through the public API, with fake peripherals
//! and a recording transport.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use armcam_node::camera::{self, Frame, FrameSource, PixelFormat};
use armcam_node::command::handlers::{CameraCommandHandler, CAMERA_TOPIC};
use armcam_node::command::{CommandRouter, Fragment};
use armcam_node::config::{CaptureConfig, Config, DeliveryMode, Envelope};
use armcam_node::error::{NodeError, Result};
use armcam_node::manipulator::Manipulator;
use armcam_node::pipeline::capture::{CaptureContext, CapturePipeline, TickOutcome};
use armcam_node::pipeline::sink::{BatchingSink, PushTransport};
use armcam_node::pipeline::spool::{Drainer, Spool};
use armcam_node::pipeline::status::LogIndicator;
use armcam_node::pipeline::SharedFlag;
use armcam_node::telemetry::LocalTelemetry;

fn jpeg() -> Vec<u8> {
    let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, b'J', b'F'];
    data.extend_from_slice(b"scan data");
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

/// Camera returning the same JPEG, one second apart per frame
struct FakeCamera {
    buf: Vec<u8>,
    next: DateTime<Utc>,
}

impl FakeCamera {
    fn new() -> Self {
        Self {
            buf: jpeg(),
            next: Utc.timestamp_opt(1_700_000_000, 500_000_000).unwrap(),
        }
    }
}

#[async_trait]
impl FrameSource for FakeCamera {
    async fn acquire(&mut self) -> Result<Frame<'_>> {
        let at = self.next;
        self.next += chrono::Duration::seconds(1);
        Ok(Frame::new(&self.buf, PixelFormat::Jpeg, at))
    }
}

struct FakeServo(AtomicU32);

impl Manipulator for FakeServo {
    fn set_angle(&self, angle: f32) -> Result<()> {
        self.0.store(angle.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn angle(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Records every POST; fails while `failing` is set
#[derive(Clone, Default)]
struct RecordingTransport {
    posts: Arc<Mutex<Vec<(String, String)>>>,
    failing: SharedFlag,
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn post_json(&self, path: &str, body: String) -> Result<()> {
        if self.failing.get() {
            return Err(NodeError::Network("503 Service Unavailable".to_string()));
        }
        self.posts.lock().unwrap().push((path.to_string(), body));
        Ok(())
    }
}

struct Node {
    capture: CapturePipeline<RecordingTransport>,
    transport: RecordingTransport,
    enabled: SharedFlag,
    network_up: SharedFlag,
}

fn node(config: &CaptureConfig, batch_size: usize, spool: Option<Spool>) -> Node {
    let servo: Arc<dyn Manipulator> = Arc::new(FakeServo(AtomicU32::new(30.0f32.to_bits())));
    let transport = RecordingTransport::default();
    let enabled = SharedFlag::new(true);
    let network_up = SharedFlag::new(true);

    let capture = CapturePipeline::new(
        CaptureContext {
            source: camera::shared(Box::new(FakeCamera::new())),
            telemetry: Box::new(LocalTelemetry::new(servo)),
            sink: BatchingSink::new(transport.clone(), "/camera", batch_size),
            spool,
            enabled: enabled.clone(),
            network_up: network_up.clone(),
            indicator: Arc::new(LogIndicator),
        },
        config,
    )
    .unwrap();

    Node {
        capture,
        transport,
        enabled,
        network_up,
    }
}

fn drainer(spool: &Spool, transport: RecordingTransport, network_up: SharedFlag) -> Drainer<RecordingTransport> {
    Drainer::new(spool.clone(), transport, "/camera", 128 * 1024, Duration::from_millis(10), network_up)
}

fn decode(body: &str) -> serde_json::Value {
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn capture_batches_reach_the_server() {
    let mut node = node(&CaptureConfig::default(), 2, None);

    let mut outcomes = Vec::new();
    for _ in 0..4 {
        outcomes.push(node.capture.tick().await.unwrap());
    }
    assert_eq!(
        outcomes,
        vec![
            TickOutcome::Batched,
            TickOutcome::Sent(2),
            TickOutcome::Batched,
            TickOutcome::Sent(2)
        ]
    );

    let posts = node.transport.posts.lock().unwrap();
    assert_eq!(posts.len(), 2);
    let first = decode(&posts[0].1);
    assert_eq!(posts[0].0, "/camera");
    assert_eq!(first[0]["time_stamp"], serde_json::json!(1_700_000_000_500.0));
    assert_eq!(first[1]["time_stamp"], serde_json::json!(1_700_000_001_500.0));
    assert_eq!(STANDARD.decode(first[0]["image"].as_str().unwrap()).unwrap(), jpeg());
}

#[tokio::test]
async fn extended_envelope_carries_telemetry() {
    let config = CaptureConfig {
        envelope: Envelope::Extended,
        ..Default::default()
    };
    let mut node = node(&config, 1, None);

    assert_eq!(node.capture.tick().await.unwrap(), TickOutcome::Sent(1));

    let posts = node.transport.posts.lock().unwrap();
    let observation = &decode(&posts[0].1)[0];
    assert_eq!(observation["gripper"], serde_json::json!(30.0));
    assert_eq!(observation["homed"], serde_json::json!(false));
    assert_eq!(observation["positions"], serde_json::json!([]));
}

#[tokio::test]
async fn spooled_captures_drain_to_the_server() {
    let dir = TempDir::new().unwrap();
    let spool = Spool::new(dir.path());
    let config = CaptureConfig {
        delivery: DeliveryMode::Spool,
        ..Default::default()
    };
    let mut node = node(&config, 1, Some(spool.clone()));

    for _ in 0..3 {
        assert_eq!(node.capture.tick().await.unwrap(), TickOutcome::Spooled);
    }
    assert_eq!(spool.list().await.unwrap().len(), 3);
    assert!(node.transport.posts.lock().unwrap().is_empty());

    let transport = RecordingTransport::default();
    let mut drainer = drainer(&spool, transport.clone(), node.network_up.clone());
    let report = drainer.drain_once().await.unwrap();

    assert_eq!(report.uploaded, 3);
    assert!(spool.list().await.unwrap().is_empty());

    let stamps: Vec<f64> = transport
        .posts
        .lock()
        .unwrap()
        .iter()
        .map(|(_, body)| decode(body)["time_stamp"].as_f64().unwrap())
        .collect();
    assert_eq!(stamps, vec![1_700_000_000_500.0, 1_700_000_001_500.0, 1_700_000_002_500.0]);
}

#[tokio::test]
async fn auto_delivery_spools_until_drainer_recovers() {
    let dir = TempDir::new().unwrap();
    let spool = Spool::new(dir.path());
    let config = CaptureConfig {
        delivery: DeliveryMode::Auto,
        ..Default::default()
    };
    let mut node = node(&config, 1, Some(spool.clone()));

    // Server down: the failed flush drops the frame and flips to the spool
    node.transport.failing.set(true);
    assert_eq!(node.capture.tick().await.unwrap(), TickOutcome::Skipped);
    assert!(!node.network_up.get());
    assert_eq!(node.capture.tick().await.unwrap(), TickOutcome::Spooled);

    // Server back: the drainer uploads the backlog and restores the network path
    let mut drainer = drainer(&spool, RecordingTransport::default(), node.network_up.clone());
    assert_eq!(drainer.drain_once().await.unwrap().uploaded, 1);
    assert!(node.network_up.get());

    node.transport.failing.set(false);
    assert_eq!(node.capture.tick().await.unwrap(), TickOutcome::Sent(1));
}

#[tokio::test]
async fn camera_command_switches_capture() {
    let mut node = node(&CaptureConfig::default(), 1, None);
    let mut router = CommandRouter::builder()
        .subscribe(CAMERA_TOPIC, Box::new(CameraCommandHandler::new(node.enabled.clone())))
        .build();

    router.dispatch(&Fragment::whole(CAMERA_TOPIC, b"off"));
    assert_eq!(node.capture.tick().await.unwrap(), TickOutcome::Idle);
    assert!(node.transport.posts.lock().unwrap().is_empty());

    router.dispatch(&Fragment::whole(CAMERA_TOPIC, b"on"));
    assert_eq!(node.capture.tick().await.unwrap(), TickOutcome::Sent(1));
}

#[test]
fn shipped_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml");
    let config = Config::load(path).unwrap();

    assert_eq!(config.capture.delivery, DeliveryMode::Network);
    assert_eq!(config.push_endpoint().unwrap().port, 8080);
    assert_eq!(config.mqtt_endpoint().unwrap().port, 1883);
}
