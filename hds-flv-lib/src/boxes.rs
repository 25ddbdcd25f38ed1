//! ISO-BMFF box scanning.
//!
//! HDS fragments are small ISO-BMFF objects; the media payload lives in the
//! `mdat` box and is already a sequence of FLV tags. Nothing else in the
//! fragment is interpreted, so the scanner only walks box headers.

use crate::error::{HdsError, Result};

/// Locate the `mdat` payload in a downloaded fragment.
///
/// Returns `(offset, len)` of the payload within `data`. The declared box
/// size is clamped to the buffer, since the fragment usually ends inside
/// its `mdat`.
pub(crate) fn find_mdat(data: &[u8]) -> Result<(usize, usize)> {
    let mut offset = 0usize;

    while data.len() - offset >= 8 {
        let size32 = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as u64;
        let box_type: [u8; 4] = data[offset + 4..offset + 8].try_into().unwrap();

        let (header_len, size) = if size32 == 1 {
            // 64-bit extended size follows the type field.
            if data.len() - offset < 16 {
                return Err(HdsError::BoxLayout(
                    "truncated extended box header".to_string(),
                ));
            }
            let ext = u64::from_be_bytes(data[offset + 8..offset + 16].try_into().unwrap());
            (16usize, ext)
        } else {
            (8usize, size32)
        };

        if &box_type == b"mdat" {
            let payload_offset = offset + header_len;
            // size == 0 means the box extends to the end of the object.
            let payload_len = if size == 0 {
                data.len() - payload_offset
            } else {
                let declared = size.saturating_sub(header_len as u64) as usize;
                declared.min(data.len() - payload_offset)
            };
            return Ok((payload_offset, payload_len));
        }

        if size < header_len as u64 {
            return Err(HdsError::BoxLayout(format!(
                "box {} declares size {} smaller than its header",
                fourcc(&box_type),
                size
            )));
        }
        if size > (data.len() - offset) as u64 {
            return Err(HdsError::BoxLayout(format!(
                "box {} overruns the fragment",
                fourcc(&box_type)
            )));
        }
        offset += size as usize;
    }

    Err(HdsError::BoxLayout(
        "no mdat box before end of fragment".to_string(),
    ))
}

fn fourcc(tag: &[u8; 4]) -> String {
    tag.iter()
        .map(|&b| {
            if b.is_ascii_graphic() {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(tag);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_find_mdat_after_leading_boxes() {
        let mut frag = boxed(b"afra", &[0u8; 12]);
        frag.extend_from_slice(&boxed(b"mdat", b"flv tag bytes"));

        let (off, len) = find_mdat(&frag).unwrap();
        assert_eq!(&frag[off..off + len], b"flv tag bytes");
    }

    #[test]
    fn test_find_mdat_extended_size() {
        let payload = b"payload under extended size";
        let mut frag = Vec::new();
        frag.extend_from_slice(&1u32.to_be_bytes());
        frag.extend_from_slice(b"mdat");
        frag.extend_from_slice(&((payload.len() + 16) as u64).to_be_bytes());
        frag.extend_from_slice(payload);

        let (off, len) = find_mdat(&frag).unwrap();
        assert_eq!(off, 16);
        assert_eq!(&frag[off..off + len], payload);
    }

    #[test]
    fn test_mdat_size_clamped_to_buffer() {
        let mut frag = Vec::new();
        frag.extend_from_slice(&1000u32.to_be_bytes());
        frag.extend_from_slice(b"mdat");
        frag.extend_from_slice(b"short");

        let (off, len) = find_mdat(&frag).unwrap();
        assert_eq!((off, len), (8, 5));
    }

    #[test]
    fn test_mdat_size_zero_extends_to_end() {
        let mut frag = Vec::new();
        frag.extend_from_slice(&0u32.to_be_bytes());
        frag.extend_from_slice(b"mdat");
        frag.extend_from_slice(b"rest of object");

        let (off, len) = find_mdat(&frag).unwrap();
        assert_eq!(&frag[off..off + len], b"rest of object");
    }

    #[test]
    fn test_no_mdat_is_an_error() {
        let frag = boxed(b"abst", &[0u8; 29]);
        assert!(find_mdat(&frag).is_err());
    }

    #[test]
    fn test_overrunning_box_is_an_error() {
        let mut frag = Vec::new();
        frag.extend_from_slice(&64u32.to_be_bytes());
        frag.extend_from_slice(b"afra");
        frag.extend_from_slice(&[0u8; 4]);
        assert!(find_mdat(&frag).is_err());
    }

    #[test]
    fn test_undersized_box_is_an_error() {
        let mut frag = Vec::new();
        frag.extend_from_slice(&4u32.to_be_bytes());
        frag.extend_from_slice(b"afra");
        frag.extend_from_slice(&[0u8; 16]);
        assert!(find_mdat(&frag).is_err());
    }
}
