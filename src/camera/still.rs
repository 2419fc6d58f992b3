//! Bench source: one JPEG file served on every acquire.

use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use tracing::info;

use super::jpeg::detect_format;
use super::{Frame, FrameSource, PixelFormat};
use crate::error::{NodeError, Result};

/// Serves the same image until the process exits
#[derive(Debug)]
pub struct StillSource {
    image: Vec<u8>,
    format: PixelFormat,
    buf: Vec<u8>,
}

impl StillSource {
    /// Load the image once
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::ConfigurationFatal`] when the file cannot be read
    /// or is empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let image = std::fs::read(path).map_err(|e| {
            NodeError::ConfigurationFatal(format!("Cannot read still image {}: {}", path.display(), e))
        })?;

        if image.is_empty() {
            return Err(NodeError::ConfigurationFatal(format!(
                "Still image {} is empty",
                path.display()
            )));
        }

        info!("Serving still image {} ({} bytes)", path.display(), image.len());
        Ok(Self::from_bytes(image))
    }

    pub fn from_bytes(image: Vec<u8>) -> Self {
        let format = detect_format(&image);
        Self {
            image,
            format,
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl FrameSource for StillSource {
    async fn acquire(&mut self) -> Result<Frame<'_>> {
        self.buf.clear();
        self.buf.extend_from_slice(&self.image);
        Ok(Frame::new(&self.buf, self.format, Utc::now()))
    }
}
