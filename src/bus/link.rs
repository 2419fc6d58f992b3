//! Async link to the command bus bridge.
//!
//! [`BusLink`] is the seam the telemetry source talks through; the serial
//! implementation is generic over any byte stream so tests can script it.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

use super::decoder::FrameDecoder;
use super::encoder::encode_frame;
use super::protocol::BusFrame;
use crate::error::{NodeError, Result};

/// Request/response access to the bus
#[async_trait]
pub trait BusLink: Send {
    /// Queue one frame for transmission
    async fn send(&mut self, frame: &BusFrame) -> Result<()>;

    /// Wait up to `timeout` for the next frame; `Ok(None)` on timeout
    async fn recv(&mut self, timeout: Duration) -> Result<Option<BusFrame>>;

    /// Discard input that is already waiting, returning how many bytes were dropped
    async fn clear(&mut self) -> Result<usize>;
}

/// Bus link over any async byte stream
pub struct StreamBusLink<S> {
    io: S,
    decoder: FrameDecoder,
    label: String,
}

/// Bus link over a USB serial bridge
pub type SerialBusLink = StreamBusLink<tokio_serial::SerialStream>;

impl<S> std::fmt::Debug for StreamBusLink<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBusLink")
            .field("label", &self.label)
            .field("buffered", &self.decoder.buffered())
            .finish_non_exhaustive()
    }
}

impl<S> StreamBusLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: S, label: impl Into<String>) -> Self {
        Self {
            io,
            decoder: FrameDecoder::new(),
            label: label.into(),
        }
    }

    /// Name of the underlying device
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl SerialBusLink {
    /// Open the serial bridge at `path` (8N1, no flow control)
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| NodeError::BusProtocol(format!("Failed to open {}: {}", path, e)))?;

        info!("Opened bus bridge at {} ({} baud)", path, baud_rate);
        Ok(Self::new(port, path))
    }
}

#[async_trait]
impl<S> BusLink for StreamBusLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: &BusFrame) -> Result<()> {
        let bytes = encode_frame(frame);
        self.io.write_all(&bytes).await?;
        self.io.flush().await?;
        debug!("Sent bus frame 0x{:03X} ({} bytes)", frame.id, bytes.len());
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<BusFrame>> {
        if let Some(frame) = self.decoder.next_frame() {
            return Ok(Some(frame));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut chunk = [0u8; 64];

        loop {
            match tokio::time::timeout_at(deadline, self.io.read(&mut chunk)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    return Err(NodeError::BusProtocol(format!("{}: link closed", self.label)));
                }
                Ok(Ok(n)) => {
                    self.decoder.push(&chunk[..n]);
                    if let Some(frame) = self.decoder.next_frame() {
                        return Ok(Some(frame));
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn clear(&mut self) -> Result<usize> {
        let mut dropped = self.decoder.buffered();
        self.decoder.reset();

        let mut chunk = [0u8; 64];
        loop {
            match tokio::time::timeout(Duration::ZERO, self.io.read(&mut chunk)).await {
                Err(_) | Ok(Ok(0)) => break,
                Ok(Ok(n)) => dropped += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        if dropped > 0 {
            debug!("{}: discarded {} stale bytes", self.label, dropped);
        }
        Ok(dropped)
    }
}
