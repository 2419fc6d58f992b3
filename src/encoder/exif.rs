//! Synthetic EXIF metadata for streamed frames.
//!
//! Builds an APP1 segment holding a big-endian TIFF structure:
//!
//! ```text
//! IFD0:      DateTime (0x0132)  "YYYY:MM:DD HH:MM:SS"
//!            ExifIFD  (0x8769)  -> Exif IFD
//! Exif IFD:  SubSecTime (0x9290) six-digit microseconds
//!            ImageTitle (0xA436) gripper angle, "%.2f"
//! ```
//!
//! The segment replaces any APP0/APP1 segments leading the camera's JPEG.

use chrono::{DateTime, Utc};

const MARKER_SOI: [u8; 2] = [0xFF, 0xD8];
const MARKER_APP0: u8 = 0xE0;
const MARKER_APP1: u8 = 0xE1;

const EXIF_ID: &[u8; 6] = b"Exif\0\0";
const TIFF_HEADER_LEN: usize = 8;

const TAG_DATE_TIME: u16 = 0x0132;
const TAG_EXIF_IFD: u16 = 0x8769;
const TAG_SUB_SEC_TIME: u16 = 0x9290;
const TAG_IMAGE_TITLE: u16 = 0xA436;

const TYPE_ASCII: u16 = 2;
const TYPE_LONG: u16 = 4;

struct IfdEntry {
    tag: u16,
    kind: u16,
    count: u32,
    value: Vec<u8>,
}

impl IfdEntry {
    fn ascii(tag: u16, text: &str) -> Self {
        let mut value = text.as_bytes().to_vec();
        value.push(0);
        Self {
            tag,
            kind: TYPE_ASCII,
            count: value.len() as u32,
            value,
        }
    }

    fn long(tag: u16, v: u32) -> Self {
        Self {
            tag,
            kind: TYPE_LONG,
            count: 1,
            value: v.to_be_bytes().to_vec(),
        }
    }

    fn external_len(&self) -> usize {
        if self.value.len() > 4 {
            self.value.len() + self.value.len() % 2
        } else {
            0
        }
    }
}

fn ifd_len(entries: &[IfdEntry]) -> usize {
    2 + entries.len() * 12 + 4 + entries.iter().map(IfdEntry::external_len).sum::<usize>()
}

/// Append an IFD located at TIFF offset `offset`, values over four bytes
/// placed right after the entry table
fn write_ifd(out: &mut Vec<u8>, entries: &[IfdEntry], offset: usize) {
    let mut data_offset = offset + 2 + entries.len() * 12 + 4;
    let mut data = Vec::new();

    out.extend_from_slice(&(entries.len() as u16).to_be_bytes());
    for entry in entries {
        out.extend_from_slice(&entry.tag.to_be_bytes());
        out.extend_from_slice(&entry.kind.to_be_bytes());
        out.extend_from_slice(&entry.count.to_be_bytes());

        if entry.value.len() <= 4 {
            let mut inline = [0u8; 4];
            inline[..entry.value.len()].copy_from_slice(&entry.value);
            out.extend_from_slice(&inline);
        } else {
            out.extend_from_slice(&(data_offset as u32).to_be_bytes());
            data.extend_from_slice(&entry.value);
            if entry.value.len() % 2 == 1 {
                data.push(0);
            }
            data_offset += entry.external_len();
        }
    }
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&data);
}

/// Complete APP1 segment (marker, length, `Exif\0\0`, TIFF)
pub fn build_app1(captured_at: DateTime<Utc>, gripper: f32) -> Vec<u8> {
    let date_time = captured_at.format("%Y:%m:%d %H:%M:%S").to_string();
    let sub_sec = format!("{:06}", captured_at.timestamp_subsec_micros().min(999_999));
    let title = format!("{:.2}", gripper);

    let exif_entries = [
        IfdEntry::ascii(TAG_SUB_SEC_TIME, &sub_sec),
        IfdEntry::ascii(TAG_IMAGE_TITLE, &title),
    ];

    // IFD0 length does not depend on the pointer value
    let ifd0_len = ifd_len(&[
        IfdEntry::ascii(TAG_DATE_TIME, &date_time),
        IfdEntry::long(TAG_EXIF_IFD, 0),
    ]);
    let exif_offset = TIFF_HEADER_LEN + ifd0_len;
    let ifd0_entries = [
        IfdEntry::ascii(TAG_DATE_TIME, &date_time),
        IfdEntry::long(TAG_EXIF_IFD, exif_offset as u32),
    ];

    let mut tiff = Vec::with_capacity(exif_offset + ifd_len(&exif_entries));
    tiff.extend_from_slice(b"MM");
    tiff.extend_from_slice(&42u16.to_be_bytes());
    tiff.extend_from_slice(&(TIFF_HEADER_LEN as u32).to_be_bytes());
    write_ifd(&mut tiff, &ifd0_entries, TIFF_HEADER_LEN);
    write_ifd(&mut tiff, &exif_entries, exif_offset);

    let segment_len = 2 + EXIF_ID.len() + tiff.len();
    let mut app1 = Vec::with_capacity(2 + segment_len);
    app1.extend_from_slice(&[0xFF, MARKER_APP1]);
    app1.extend_from_slice(&(segment_len as u16).to_be_bytes());
    app1.extend_from_slice(EXIF_ID);
    app1.extend_from_slice(&tiff);
    app1
}

/// Offset of the first JPEG byte kept after splicing
///
/// Skips SOI plus any APP0/APP1 segments that immediately follow it. Returns
/// 0 when the data does not start with SOI.
pub fn body_offset(jpeg: &[u8]) -> usize {
    if !jpeg.starts_with(&MARKER_SOI) {
        return 0;
    }

    let mut pos = MARKER_SOI.len();
    while pos + 4 <= jpeg.len()
        && jpeg[pos] == 0xFF
        && (jpeg[pos + 1] == MARKER_APP0 || jpeg[pos + 1] == MARKER_APP1)
    {
        let len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        if len < 2 || pos + 2 + len > jpeg.len() {
            return MARKER_SOI.len();
        }
        pos += 2 + len;
    }
    pos
}

/// SOI followed by the EXIF segment; the JPEG from [`body_offset`] follows it
pub fn exif_prefix(captured_at: DateTime<Utc>, gripper: f32) -> Vec<u8> {
    let mut prefix = MARKER_SOI.to_vec();
    prefix.extend(build_app1(captured_at, gripper));
    prefix
}

/// Splice EXIF metadata into a JPEG as one contiguous buffer
#[cfg(test)]
pub fn encode_exif(jpeg: &[u8], captured_at: DateTime<Utc>, gripper: f32) -> Vec<u8> {
    let body = &jpeg[body_offset(jpeg)..];
    let mut out = exif_prefix(captured_at, gripper);
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::mocks::fake_jpeg;
    use chrono::TimeZone;

    fn be_u16(data: &[u8], at: usize) -> u16 {
        u16::from_be_bytes([data[at], data[at + 1]])
    }

    fn be_u32(data: &[u8], at: usize) -> u32 {
        u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
    }

    /// Find `tag` in the IFD at `offset` and return its ASCII value
    fn ascii_tag(tiff: &[u8], offset: usize, tag: u16) -> Option<String> {
        let count = be_u16(tiff, offset) as usize;
        (0..count).find_map(|i| {
            let entry = offset + 2 + i * 12;
            if be_u16(tiff, entry) != tag {
                return None;
            }
            let len = be_u32(tiff, entry + 4) as usize;
            let start = if len <= 4 { entry + 8 } else { be_u32(tiff, entry + 8) as usize };
            let text = &tiff[start..start + len - 1];
            Some(String::from_utf8(text.to_vec()).unwrap())
        })
    }

    fn long_tag(tiff: &[u8], offset: usize, tag: u16) -> Option<u32> {
        let count = be_u16(tiff, offset) as usize;
        (0..count)
            .map(|i| offset + 2 + i * 12)
            .find(|&entry| be_u16(tiff, entry) == tag)
            .map(|entry| be_u32(tiff, entry + 8))
    }

    #[test]
    fn test_app1_tags_are_readable() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap() + chrono::Duration::microseconds(42_017);
        let app1 = build_app1(at, 87.456);

        assert_eq!(&app1[0..2], &[0xFF, 0xE1]);
        assert_eq!(be_u16(&app1, 2) as usize, app1.len() - 2);
        assert_eq!(&app1[4..10], b"Exif\0\0");

        let tiff = &app1[10..];
        assert_eq!(&tiff[0..4], b"MM\0\x2A");
        let ifd0 = be_u32(tiff, 4) as usize;

        assert_eq!(ascii_tag(tiff, ifd0, TAG_DATE_TIME).unwrap(), "2024:03:09 14:05:07");
        let exif_ifd = long_tag(tiff, ifd0, TAG_EXIF_IFD).unwrap() as usize;
        assert_eq!(ascii_tag(tiff, exif_ifd, TAG_SUB_SEC_TIME).unwrap(), "042017");
        assert_eq!(ascii_tag(tiff, exif_ifd, TAG_IMAGE_TITLE).unwrap(), "87.46");
    }

    #[test]
    fn test_body_offset_skips_app_segments() {
        let jpeg = fake_jpeg(8);
        assert_eq!(body_offset(&jpeg), 8);

        let mut with_app1 = vec![0xFF, 0xD8, 0xFF, 0xE1, 0x00, 0x03, 0x00];
        with_app1.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x02, 0xFF, 0xD9]);
        assert_eq!(body_offset(&with_app1), 7);
    }

    #[test]
    fn test_body_offset_without_soi() {
        assert_eq!(body_offset(&[0x00, 0x01, 0x02]), 0);
    }

    #[test]
    fn test_body_offset_truncated_segment() {
        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x40, 0x00];
        assert_eq!(body_offset(&jpeg), 2);
    }

    #[test]
    fn test_encode_exif_replaces_app0() {
        let jpeg = fake_jpeg(8);
        let at = Utc::now();
        let out = encode_exif(&jpeg, at, 10.0);

        assert!(out.starts_with(&[0xFF, 0xD8, 0xFF, 0xE1]));
        assert!(out.ends_with(&jpeg[8..]));
        assert_eq!(out.len(), 2 + build_app1(at, 10.0).len() + jpeg.len() - 8);
    }
}
