//! # Stream Module
//!
//! `multipart/x-mixed-replace` responder serving live frames to one client
//! at a time.
//!
//! A session goes `Setup` (headers and the opening boundary) to `Sending`
//! (one part per frame, paced by its own governor) to `Closed`. A failed
//! capture or a client that went away closes the session; a second client
//! arriving while a session is open gets `503 Service Unavailable`.
//!
//! Each part is written as separate chunks:
//!
//! ```text
//! Content-Type: image/jpeg\r\nContent-Length: N\r\n\r\n
//! [24-byte chunk header | SOI + EXIF APP1]   (depending on payload kind)
//! JPEG bytes
//! \r\n--<boundary>\r\n
//! ```

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::camera::{capture_jpeg, CapturedFrame, SharedFrameSource};
use crate::config::{StreamConfig, StreamPayload};
use crate::encoder::exif::{body_offset, exif_prefix};
use crate::encoder::ChunkHeader;
use crate::error::{NodeError, Result};
use crate::manipulator::Manipulator;
use crate::pipeline::governor::RateGovernor;

/// Multipart boundary token
pub const BOUNDARY: &str = "123456789000000000000987654321";

/// Chunks buffered between the session task and the HTTP body
const CHANNEL_DEPTH: usize = 8;

pub fn content_type() -> String {
    format!("multipart/x-mixed-replace;boundary={}", BOUNDARY)
}

/// Delimiter written before the first part and after every part
pub fn boundary_chunk() -> Bytes {
    Bytes::from(format!("\r\n--{}\r\n", BOUNDARY))
}

pub fn part_header(len: usize) -> Bytes {
    Bytes::from(format!("Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", len))
}

/// Payload segments for one frame
///
/// # Errors
///
/// [`NodeError::EncodeTooLarge`] if the part would exceed `capacity`.
pub fn encode_part(
    frame: &CapturedFrame,
    gripper: f32,
    payload: StreamPayload,
    capacity: usize,
) -> Result<Vec<Bytes>> {
    let segments = match payload {
        StreamPayload::Raw => vec![frame.data.clone()],
        StreamPayload::ChunkHeader => {
            let header = ChunkHeader::for_frame(frame.data.len(), frame.captured_at, gripper, capacity)?;
            vec![Bytes::copy_from_slice(&header.to_bytes()), frame.data.clone()]
        }
        StreamPayload::Exif => {
            let prefix = exif_prefix(frame.captured_at, gripper);
            let body = frame.data.slice(body_offset(&frame.data)..);
            vec![Bytes::from(prefix), body]
        }
    };

    let size: usize = segments.iter().map(Bytes::len).sum();
    if size > capacity {
        return Err(NodeError::EncodeTooLarge { size, capacity });
    }
    Ok(segments)
}

/// Destination of a session's chunks
#[async_trait]
pub trait ChunkSink: Send {
    /// # Errors
    ///
    /// [`NodeError::Network`] once the client is gone.
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()>;

    /// Tear the response down with an error
    async fn abort(&mut self, reason: &str);
}

#[async_trait]
impl ChunkSink for mpsc::Sender<io::Result<Bytes>> {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.send(Ok(chunk))
            .await
            .map_err(|_| NodeError::Network("stream client disconnected".to_string()))
    }

    async fn abort(&mut self, reason: &str) {
        let _ = self.send(Err(io::Error::new(io::ErrorKind::Other, reason.to_string()))).await;
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Setup,
    Sending,
    Closed,
}

/// Session parameters shared by every connection
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub payload: StreamPayload,
    pub capacity: usize,
    pub target_fps: f64,
    pub report_every: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &StreamConfig, capacity: usize) -> Self {
        Self {
            payload: config.payload,
            capacity,
            target_fps: config.target_fps,
            report_every: Duration::from_secs(config.report_interval_s),
        }
    }
}

/// One streaming connection
pub struct StreamSession<S> {
    source: SharedFrameSource,
    manipulator: Arc<dyn Manipulator>,
    settings: StreamSettings,
    sink: S,
    governor: RateGovernor,
    state: SessionState,
    frames_sent: u64,
}

impl<S: ChunkSink> StreamSession<S> {
    pub fn new(
        source: SharedFrameSource,
        manipulator: Arc<dyn Manipulator>,
        settings: StreamSettings,
        sink: S,
    ) -> Self {
        Self {
            source,
            manipulator,
            settings,
            sink,
            governor: RateGovernor::new("stream", settings.target_fps, settings.report_every),
            state: SessionState::Setup,
            frames_sent: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Send one frame as a multipart part
    ///
    /// Returns `false` if the frame was dropped as too large.
    async fn send_frame(&mut self) -> Result<bool> {
        let frame = match capture_jpeg(&self.source).await {
            Ok(frame) => frame,
            Err(e) => {
                self.sink.abort(&e.to_string()).await;
                return Err(e);
            }
        };

        let segments = match encode_part(&frame, self.manipulator.angle(), self.settings.payload, self.settings.capacity) {
            Ok(segments) => segments,
            Err(e @ NodeError::EncodeTooLarge { .. }) => {
                warn!("Stream frame dropped: {}", e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let len = segments.iter().map(Bytes::len).sum();
        self.sink.write_chunk(part_header(len)).await?;
        for segment in segments {
            self.sink.write_chunk(segment).await?;
        }
        self.sink.write_chunk(boundary_chunk()).await?;

        self.frames_sent += 1;
        Ok(true)
    }

    /// Stream until the client leaves or capture fails
    ///
    /// Always ends in [`SessionState::Closed`] with the reason as the error.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.stream().await;
        self.state = SessionState::Closed;
        result
    }

    async fn stream(&mut self) -> Result<()> {
        self.sink.write_chunk(boundary_chunk()).await?;
        self.state = SessionState::Sending;

        loop {
            self.send_frame().await?;
            self.governor.pace().await;
        }
    }
}

/// Exclusive right to stream, released on drop
#[derive(Debug)]
pub struct StreamSlot(Arc<AtomicBool>);

impl StreamSlot {
    pub fn try_acquire(busy: &Arc<AtomicBool>) -> Option<Self> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(busy.clone()))
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Axum state for the stream route
#[derive(Clone)]
pub struct StreamState {
    source: SharedFrameSource,
    manipulator: Arc<dyn Manipulator>,
    settings: StreamSettings,
    busy: Arc<AtomicBool>,
}

impl StreamState {
    pub fn new(source: SharedFrameSource, manipulator: Arc<dyn Manipulator>, settings: StreamSettings) -> Self {
        Self {
            source,
            manipulator,
            settings,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }
}

async fn stream_handler(State(state): State<StreamState>) -> Response {
    let Some(slot) = StreamSlot::try_acquire(&state.busy) else {
        info!("Rejecting stream request: a stream is already open");
        return (StatusCode::SERVICE_UNAVAILABLE, "stream busy").into_response();
    };

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);
    let mut session = StreamSession::new(state.source.clone(), state.manipulator.clone(), state.settings, tx);

    tokio::spawn(async move {
        let _slot = slot;
        info!("Stream client connected");
        match session.run().await {
            Err(NodeError::Network(e)) => info!("Stream closed after {} frames: {}", session.frames_sent(), e),
            Err(e) => warn!("Stream aborted after {} frames: {}", session.frames_sent(), e),
            Ok(()) => debug!("Stream ended"),
        }
    });

    let headers = [
        (CONTENT_TYPE, content_type()),
        (ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_string()),
    ];
    (headers, Body::from_stream(ReceiverStream::new(rx))).into_response()
}

/// Stream route at `/`
pub fn router(state: StreamState) -> Router {
    Router::new().route("/", get(stream_handler)).with_state(state)
}

/// Bind and serve the stream until the process exits
///
/// # Errors
///
/// Returns [`NodeError::ConfigurationFatal`] if `bind` cannot be bound.
pub async fn serve(bind: &str, state: StreamState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| NodeError::ConfigurationFatal(format!("Cannot bind stream to {}: {}", bind, e)))?;
    info!("Streaming on http://{}/", bind);

    axum::serve(listener, router(state)).await?;
    Ok(())
}
