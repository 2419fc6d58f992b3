//! JPEG marker helpers and the MJPEG stream splitter.

use bytes::{Buf, Bytes, BytesMut};
use tracing::warn;

use super::PixelFormat;

/// Start-of-image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// End-of-image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Tag a buffer by its leading marker
pub fn detect_format(data: &[u8]) -> PixelFormat {
    if data.starts_with(&SOI) {
        PixelFormat::Jpeg
    } else {
        PixelFormat::Unknown
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

/// Splits a concatenated MJPEG byte stream into individual JPEG images
///
/// Entropy-coded JPEG data byte-stuffs every `0xFF`, so the first EOI after
/// an SOI ends the image.
#[derive(Debug)]
pub struct JpegSplitter {
    buf: BytesMut,
    in_image: bool,
    scan_from: usize,
    max_frame: usize,
}

impl JpegSplitter {
    /// `max_frame` bounds how much is buffered while waiting for an EOI
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            in_image: false,
            scan_from: 0,
            max_frame,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete image, if one is buffered
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if !self.in_image {
            match find_marker(&self.buf, SOI) {
                Some(pos) => {
                    self.buf.advance(pos);
                    self.in_image = true;
                    self.scan_from = SOI.len();
                }
                None => {
                    // A trailing 0xFF may be the first half of an SOI
                    let keep = usize::from(self.buf.last() == Some(&0xFF));
                    let drop = self.buf.len() - keep;
                    self.buf.advance(drop);
                    return None;
                }
            }
        }

        if let Some(pos) = find_marker(&self.buf[self.scan_from..], EOI) {
            let end = self.scan_from + pos + EOI.len();
            self.in_image = false;
            self.scan_from = 0;
            return Some(self.buf.split_to(end).freeze());
        }

        if self.buf.len() > self.max_frame {
            warn!(
                "Discarding {} buffered bytes without an end-of-image marker",
                self.buf.len()
            );
            self.buf.clear();
            self.in_image = false;
            self.scan_from = 0;
            return None;
        }

        // Resume one byte early so a marker split across pushes is found
        self.scan_from = self.buf.len().saturating_sub(1).max(SOI.len());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::mocks::fake_jpeg;

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(&fake_jpeg(4)), PixelFormat::Jpeg);
        assert_eq!(detect_format(&[0x89, b'P', b'N', b'G']), PixelFormat::Unknown);
        assert_eq!(detect_format(&[]), PixelFormat::Unknown);
    }

    #[test]
    fn test_splits_back_to_back_images() {
        let a = fake_jpeg(10);
        let b = fake_jpeg(20);
        let mut splitter = JpegSplitter::new(1024);
        splitter.push(&a);
        splitter.push(&b);

        assert_eq!(splitter.next_frame().unwrap().as_ref(), a.as_slice());
        assert_eq!(splitter.next_frame().unwrap().as_ref(), b.as_slice());
        assert!(splitter.next_frame().is_none());
    }

    #[test]
    fn test_marker_split_across_pushes() {
        let image = fake_jpeg(8);
        let cut = image.len() - 1; // between 0xFF and 0xD9
        let mut splitter = JpegSplitter::new(1024);

        splitter.push(&image[..cut]);
        assert!(splitter.next_frame().is_none());
        splitter.push(&image[cut..]);
        assert_eq!(splitter.next_frame().unwrap().as_ref(), image.as_slice());
    }

    #[test]
    fn test_leading_garbage_is_dropped() {
        let image = fake_jpeg(5);
        let mut splitter = JpegSplitter::new(1024);
        splitter.push(&[0x00, 0x01, 0x02]);
        assert!(splitter.next_frame().is_none());
        splitter.push(&image);

        assert_eq!(splitter.next_frame().unwrap().as_ref(), image.as_slice());
    }

    #[test]
    fn test_oversize_image_is_discarded() {
        let mut splitter = JpegSplitter::new(16);
        splitter.push(&SOI);
        splitter.push(&[0x42; 32]);
        assert!(splitter.next_frame().is_none());

        let image = fake_jpeg(2);
        splitter.push(&image);
        assert_eq!(splitter.next_frame().unwrap().as_ref(), image.as_slice());
    }
}
