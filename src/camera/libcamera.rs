//! MJPEG capture from a `libcamera-vid` child process.
//!
//! A reader task splits stdout into JPEG images and publishes only the newest
//! one through a watch channel, so a slow consumer always gets the latest
//! frame instead of a queue of stale ones.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::jpeg::{detect_format, JpegSplitter};
use super::{Frame, FrameSource};
use crate::config::CameraConfig;
use crate::error::{NodeError, Result};

/// Newest complete image, stamped when the reader split it off the pipe
#[derive(Debug, Clone)]
struct LatestFrame {
    data: Bytes,
    arrived_at: DateTime<Utc>,
}

/// Handle to a running capture process
pub struct LibcameraSource {
    _child: Child,
    reader: JoinHandle<()>,
    latest: watch::Receiver<Option<LatestFrame>>,
    buf: Vec<u8>,
    captured_at: DateTime<Utc>,
    acquire_timeout: Duration,
}

impl std::fmt::Debug for LibcameraSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibcameraSource")
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

/// Command-line arguments for an endless MJPEG capture to stdout
pub fn capture_args(config: &CameraConfig) -> Vec<String> {
    vec![
        "-t".to_string(),
        "0".to_string(),
        "--codec".to_string(),
        "mjpeg".to_string(),
        "--width".to_string(),
        config.width.to_string(),
        "--height".to_string(),
        config.height.to_string(),
        "--framerate".to_string(),
        config.fps.to_string(),
        "--flush".to_string(),
        "-o".to_string(),
        "-".to_string(),
    ]
}

impl LibcameraSource {
    /// Spawn the capture process
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::ConfigurationFatal`] if the process cannot be
    /// started; there is no camera to fall back to.
    pub fn start(config: &CameraConfig) -> Result<Self> {
        info!(
            "Starting {}: {}x{} @ {}fps (mjpeg)",
            config.command, config.width, config.height, config.fps
        );

        let mut child = Command::new(&config.command)
            .args(capture_args(config))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                NodeError::ConfigurationFatal(format!("Failed to spawn {}: {}", config.command, e))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            NodeError::ConfigurationFatal(format!("{} has no stdout", config.command))
        })?;

        let (tx, rx) = watch::channel(None);
        let reader = tokio::spawn(read_frames(stdout, tx, config.max_frame_bytes));

        Ok(Self::with_feed(
            child,
            reader,
            rx,
            Duration::from_millis(config.acquire_timeout_ms),
        ))
    }

    fn with_feed(
        child: Child,
        reader: JoinHandle<()>,
        latest: watch::Receiver<Option<LatestFrame>>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            _child: child,
            reader,
            latest,
            buf: Vec::new(),
            captured_at: Utc::now(),
            acquire_timeout,
        }
    }
}

impl Drop for LibcameraSource {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_frames(mut stdout: ChildStdout, tx: watch::Sender<Option<LatestFrame>>, max_frame: usize) {
    let mut splitter = JpegSplitter::new(max_frame);
    let mut chunk = vec![0u8; 64 * 1024];
    let mut frames: u64 = 0;

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => {
                warn!("Camera process closed its output after {} frames", frames);
                return;
            }
            Ok(n) => {
                splitter.push(&chunk[..n]);
                let arrived_at = Utc::now();
                while let Some(data) = splitter.next_frame() {
                    frames += 1;
                    tx.send_replace(Some(LatestFrame { data, arrived_at }));
                }
            }
            Err(e) => {
                warn!("Camera read error: {}", e);
                return;
            }
        }
    }
}

#[async_trait]
impl FrameSource for LibcameraSource {
    async fn acquire(&mut self) -> Result<Frame<'_>> {
        match tokio::time::timeout(self.acquire_timeout, self.latest.changed()).await {
            Err(_) => {
                return Err(NodeError::CaptureUnavailable(format!(
                    "no frame within {:?}",
                    self.acquire_timeout
                )))
            }
            Ok(Err(_)) => {
                return Err(NodeError::CaptureUnavailable("camera process exited".to_string()))
            }
            Ok(Ok(())) => {}
        }

        let latest = self.latest.borrow_and_update().clone();
        let Some(frame) = latest else {
            return Err(NodeError::CaptureUnavailable("empty frame buffer".to_string()));
        };

        self.buf.clear();
        self.buf.extend_from_slice(&frame.data);
        self.captured_at = frame.arrived_at;
        debug!("Acquired frame ({} bytes)", self.buf.len());

        Ok(Frame::new(&self.buf, detect_format(&self.buf), self.captured_at))
    }
}
