//! # Camera Module
//!
//! Frame acquisition with scoped buffer ownership.
//!
//! A [`Frame`] borrows the source's internal buffer, so at most one frame is
//! outstanding per source and the borrow checker forces callers to copy what
//! they keep before the frame is released (dropped). The buffer is refilled
//! on the next [`FrameSource::acquire`].
//!
//! Sources:
//! - [`libcamera::LibcameraSource`] - MJPEG from a `libcamera-vid` child process
//! - [`still::StillSource`] - one JPEG file served repeatedly

pub mod jpeg;
pub mod libcamera;
pub mod still;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{NodeError, Result};

/// Pixel encoding of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Baseline JPEG (starts with an SOI marker)
    Jpeg,
    /// Anything else; the pipeline cannot transmit it
    Unknown,
}

/// A captured frame borrowed from its source
#[derive(Debug)]
pub struct Frame<'a> {
    data: &'a [u8],
    format: PixelFormat,
    captured_at: DateTime<Utc>,
}

impl<'a> Frame<'a> {
    pub fn new(data: &'a [u8], format: PixelFormat, captured_at: DateTime<Utc>) -> Self {
        Self {
            data,
            format,
            captured_at,
        }
    }

    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Fail closed on anything but JPEG
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::ConfigurationFatal`]: a source that delivers the
    /// wrong encoding is misconfigured, retrying will not help.
    pub fn ensure_jpeg(&self) -> Result<()> {
        if self.format != PixelFormat::Jpeg {
            return Err(NodeError::ConfigurationFatal(format!(
                "Wrong pixel format in frame buffer: {:?}",
                self.format
            )));
        }
        Ok(())
    }

    /// Return the buffer to the source
    pub fn release(self) {}
}

/// Owned copy of a frame, taken before release
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub data: Bytes,
    pub captured_at: DateTime<Utc>,
}

/// Camera peripheral
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame
    ///
    /// # Errors
    ///
    /// [`NodeError::CaptureUnavailable`] when no frame arrived; callers skip
    /// the tick and try again.
    async fn acquire(&mut self) -> Result<Frame<'_>>;
}

/// Frame source shared between the push producer and the stream responder
pub type SharedFrameSource = Arc<Mutex<Box<dyn FrameSource>>>;

/// Wrap a source for sharing across tasks
pub fn shared(source: Box<dyn FrameSource>) -> SharedFrameSource {
    Arc::new(Mutex::new(source))
}

/// Acquire one JPEG frame, copy it out and release it
///
/// The source lock is held only for the duration of the copy.
pub async fn capture_jpeg(source: &SharedFrameSource) -> Result<CapturedFrame> {
    let mut guard = source.lock().await;
    let frame = guard.acquire().await?;
    frame.ensure_jpeg()?;

    let captured = CapturedFrame {
        data: Bytes::copy_from_slice(frame.data()),
        captured_at: frame.captured_at(),
    };
    frame.release();

    Ok(captured)
}
