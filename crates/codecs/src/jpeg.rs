//! JPEG APP-segment scanner
//!
//! Walks the marker segments of a JPEG stream to surface container
//! metadata without a full Exif library: the raw Exif payload from APP1,
//! the ICC profile reassembled from concatenated APP2 segments, and the
//! Baseline TIFF orientation code parsed out of the Exif IFD.
//!
//! APP2 ICC segments carry `<seq>/<total>` bytes after the profile tag;
//! segments must agree on the total and arrive with strictly increasing
//! sequence numbers or the profile is discarded.

use crate::CodecError;
use tracing::warn;

const EXIF_TAG: &[u8] = b"Exif\0\0";
const ICC_TAG: &[u8] = b"ICC_PROFILE\0";
const ORIENTATION_TAG: u16 = 0x0112;

/// Metadata gathered from a JPEG's APP segments.
#[derive(Debug, Default, PartialEq)]
pub struct JpegMetadata {
    /// Exif payload starting at the TIFF header.
    pub exif: Option<Vec<u8>>,
    /// Reassembled ICC profile bytes.
    pub icc_profile: Option<Vec<u8>>,
    /// Orientation code 1..8, if the Exif IFD carries one.
    pub orientation: Option<u8>,
}

/// Scan marker segments up to SOS, collecting Exif and ICC payloads.
pub fn scan_app_segments(bytes: &[u8]) -> Result<JpegMetadata, CodecError> {
    if !bytes.starts_with(&[0xff, 0xd8]) {
        return Err(CodecError::DecodeFailure("missing JPEG SOI marker".into()));
    }

    let mut meta = JpegMetadata::default();
    let mut icc_parts: Vec<(u8, Vec<u8>)> = Vec::new();
    let mut icc_total: Option<u8> = None;
    let mut icc_valid = true;

    let mut pos = 2;
    while pos + 1 < bytes.len() {
        if bytes[pos] != 0xff {
            return Err(CodecError::DecodeFailure(format!(
                "expected marker at offset {pos}"
            )));
        }
        // Fill bytes before a marker are legal.
        while pos + 1 < bytes.len() && bytes[pos + 1] == 0xff {
            pos += 1;
        }
        let marker = bytes[pos + 1];
        pos += 2;

        match marker {
            // Standalone markers carry no length.
            0x01 | 0xd0..=0xd7 => continue,
            // Start of scan: entropy-coded data follows, metadata is over.
            0xda => break,
            0xd9 => break,
            _ => {}
        }

        if pos + 2 > bytes.len() {
            return Err(CodecError::DecodeFailure("truncated segment length".into()));
        }
        let len = u16::from_be_bytes([bytes[pos], bytes[pos + 1]]) as usize;
        if len < 2 || pos + len > bytes.len() {
            return Err(CodecError::DecodeFailure("segment overruns input".into()));
        }
        let payload = &bytes[pos + 2..pos + len];
        pos += len;

        match marker {
            0xe1 if payload.starts_with(EXIF_TAG) && meta.exif.is_none() => {
                meta.exif = Some(payload[EXIF_TAG.len()..].to_vec());
            }
            0xe2 if payload.starts_with(ICC_TAG) && icc_valid => {
                let rest = &payload[ICC_TAG.len()..];
                if rest.len() < 2 {
                    warn!("APP2 ICC segment too short, discarding profile");
                    icc_valid = false;
                    continue;
                }
                let seq = rest[0];
                let total = rest[1];
                match icc_total {
                    None => icc_total = Some(total),
                    Some(t) if t != total => {
                        warn!("APP2 ICC segments disagree on count, discarding profile");
                        icc_valid = false;
                        continue;
                    }
                    Some(_) => {}
                }
                let expected = icc_parts.len() as u8 + 1;
                if seq != expected {
                    warn!(seq, expected, "APP2 ICC sequence out of order, discarding profile");
                    icc_valid = false;
                    continue;
                }
                icc_parts.push((seq, rest[2..].to_vec()));
            }
            _ => {}
        }
    }

    if icc_valid && !icc_parts.is_empty() {
        if icc_total == Some(icc_parts.len() as u8) {
            let mut profile = Vec::new();
            for (_, part) in icc_parts {
                profile.extend_from_slice(&part);
            }
            meta.icc_profile = Some(profile);
        } else {
            warn!("APP2 ICC segments incomplete, discarding profile");
        }
    }

    if let Some(exif) = &meta.exif {
        meta.orientation = parse_orientation(exif);
    }
    Ok(meta)
}

/// Parse the orientation entry out of IFD0 of an Exif TIFF block.
/// Returns None for anything malformed; metadata is best-effort.
fn parse_orientation(tiff: &[u8]) -> Option<u8> {
    if tiff.len() < 8 {
        return None;
    }
    let big_endian = match &tiff[..4] {
        b"II\x2a\x00" => false,
        b"MM\x00\x2a" => true,
        _ => return None,
    };
    let read_u16 = |at: usize| -> Option<u16> {
        let b = tiff.get(at..at + 2)?;
        Some(if big_endian {
            u16::from_be_bytes([b[0], b[1]])
        } else {
            u16::from_le_bytes([b[0], b[1]])
        })
    };
    let read_u32 = |at: usize| -> Option<u32> {
        let b = tiff.get(at..at + 4)?;
        Some(if big_endian {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        } else {
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        })
    };

    let ifd0 = read_u32(4)? as usize;
    let count = read_u16(ifd0)? as usize;
    for i in 0..count {
        let entry = ifd0 + 2 + i * 12;
        if read_u16(entry)? == ORIENTATION_TAG {
            // Type 3 (SHORT), count 1: the value sits in the first two
            // bytes of the inline value field.
            if read_u16(entry + 2)? != 3 {
                return None;
            }
            let value = read_u16(entry + 8)? as u8;
            return (1..=8).contains(&value).then_some(value);
        }
    }
    None
}
