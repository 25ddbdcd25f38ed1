//! Bootstrap (`abst`) box parsing.
//!
//! The bootstrap box carries the compact description of the stream timeline:
//! a segment-run table (`asrt`) and a fragment-run table (`afrt`), plus the
//! server list and live clock. Parsing is tolerant: any underrun fails with
//! a soft error so the caller can discard this bootstrap and try another.

use bytes::Buf;

use crate::error::{HdsError, Result};

/// Server entries beyond this count are consumed but ignored.
pub(crate) const MAX_SERVER_ENTRIES: usize = 10;
/// Segment-run table hard cap; more is a structural error.
pub(crate) const MAX_SEGMENT_RUNS: usize = 256;
/// Fragment-run table hard cap; more is a structural error.
pub(crate) const MAX_FRAGMENT_RUNS: usize = 10_000;

/// A range of contiguous segments sharing a fragments-per-segment count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentRun {
    pub first_segment: u32,
    pub fragments_per_segment: u32,
}

/// A range of contiguous fragments sharing a duration and timestamp origin.
///
/// A run with `duration == 0` is a discontinuity marker; the wire format
/// appends a one-byte discontinuity tag to such entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FragmentRun {
    pub first_fragment: u32,
    pub timestamp: u64,
    pub duration: u32,
    pub discontinuity: u8,
}

/// Decoded `abst` contents.
#[derive(Debug, Clone)]
pub(crate) struct BootstrapInfo {
    /// Ticks per second for `live_current_time`.
    pub timescale: u32,
    /// Live playhead position in `timescale` units.
    pub live_current_time: u64,
    pub movie_id: String,
    pub server_entries: Vec<String>,
    pub quality_segment_modifier: Option<String>,
    /// Ticks per second for fragment timestamps and durations.
    pub afrt_timescale: u32,
    pub segment_runs: Vec<SegmentRun>,
    pub fragment_runs: Vec<FragmentRun>,
}

impl Default for BootstrapInfo {
    fn default() -> Self {
        Self {
            timescale: 1000,
            live_current_time: 0,
            movie_id: String::new(),
            server_entries: Vec::new(),
            quality_segment_modifier: None,
            afrt_timescale: 1000,
            segment_runs: Vec::new(),
            fragment_runs: Vec::new(),
        }
    }
}

impl BootstrapInfo {
    /// Parse the raw bytes of an `abst` box, including its box header.
    pub fn parse(data: &[u8]) -> Result<BootstrapInfo> {
        let mut r = ByteReader::new(data);

        let _box_size = r.u32()?;
        let tag = r.tag()?;
        if &tag != b"abst" {
            return Err(HdsError::Bootstrap(format!(
                "expected abst box, found {}",
                String::from_utf8_lossy(&tag)
            )));
        }
        r.skip(4)?; // version and flags
        r.skip(4)?; // bootstrap info version
        r.skip(1)?; // profile/live/update flags, decided at manifest level

        let timescale = r.u32()?;
        let live_current_time = r.u64()?;
        r.skip(8)?; // SMPTE time code offset

        let movie_id = r.cstring()?;

        let server_count = r.u8()?;
        let mut server_entries = Vec::new();
        for _ in 0..server_count {
            let entry = r.cstring()?;
            if server_entries.len() < MAX_SERVER_ENTRIES {
                server_entries.push(entry);
            }
        }

        let quality_count = r.u8()?;
        if quality_count > 1 {
            return Err(HdsError::Bootstrap(
                "more than one quality entry is not supported".to_string(),
            ));
        }
        let quality_segment_modifier = if quality_count == 1 {
            Some(r.cstring()?)
        } else {
            None
        };

        let _drm_data = r.cstring()?;
        let _metadata = r.cstring()?;

        let mut info = BootstrapInfo {
            timescale,
            live_current_time,
            movie_id,
            server_entries,
            quality_segment_modifier,
            ..BootstrapInfo::default()
        };

        let asrt_count = r.u8()?;
        for _ in 0..asrt_count {
            parse_asrt(&mut r, &mut info)?;
        }

        let afrt_count = r.u8()?;
        for _ in 0..afrt_count {
            parse_afrt(&mut r, &mut info)?;
        }

        Ok(info)
    }

    /// Quality matching rule shared by `asrt` and `afrt`: a table applies
    /// when no modifier is set, or when one of its quality entries starts
    /// with the modifier.
    fn quality_matches(&self, entries: &[String]) -> bool {
        match &self.quality_segment_modifier {
            None => true,
            Some(modifier) => entries.iter().any(|e| e.starts_with(modifier.as_str())),
        }
    }
}

fn parse_asrt(r: &mut ByteReader<'_>, info: &mut BootstrapInfo) -> Result<()> {
    let _box_size = r.u32()?;
    let tag = r.tag()?;
    if &tag != b"asrt" {
        return Err(HdsError::Bootstrap(format!(
            "expected asrt box, found {}",
            String::from_utf8_lossy(&tag)
        )));
    }
    r.skip(4)?; // version and flags

    let quality_count = r.u8()?;
    let mut entries = Vec::with_capacity(quality_count as usize);
    for _ in 0..quality_count {
        entries.push(r.cstring()?);
    }
    let matched = info.quality_matches(&entries);

    let run_count = r.u32()?;
    for _ in 0..run_count {
        let first_segment = r.u32()?;
        let fragments_per_segment = r.u32()?;
        if matched {
            if info.segment_runs.len() >= MAX_SEGMENT_RUNS {
                return Err(HdsError::Bootstrap(format!(
                    "more than {} segment runs",
                    MAX_SEGMENT_RUNS
                )));
            }
            info.segment_runs.push(SegmentRun {
                first_segment,
                fragments_per_segment,
            });
        }
    }
    Ok(())
}

fn parse_afrt(r: &mut ByteReader<'_>, info: &mut BootstrapInfo) -> Result<()> {
    let _box_size = r.u32()?;
    let tag = r.tag()?;
    if &tag != b"afrt" {
        return Err(HdsError::Bootstrap(format!(
            "expected afrt box, found {}",
            String::from_utf8_lossy(&tag)
        )));
    }
    r.skip(4)?; // version and flags

    // The fragment-run timescale is authoritative for chunk timestamps.
    info.afrt_timescale = r.u32()?;

    let quality_count = r.u8()?;
    let mut entries = Vec::with_capacity(quality_count as usize);
    for _ in 0..quality_count {
        entries.push(r.cstring()?);
    }
    let matched = info.quality_matches(&entries);

    let run_count = r.u32()?;
    for _ in 0..run_count {
        let first_fragment = r.u32()?;
        let timestamp = r.u64()?;
        let duration = r.u32()?;
        let discontinuity = if duration == 0 { r.u8()? } else { 0 };
        if matched {
            if info.fragment_runs.len() >= MAX_FRAGMENT_RUNS {
                return Err(HdsError::Bootstrap(format!(
                    "more than {} fragment runs",
                    MAX_FRAGMENT_RUNS
                )));
            }
            info.fragment_runs.push(FragmentRun {
                first_fragment,
                timestamp,
                duration,
                discontinuity,
            });
        }
    }
    Ok(())
}

/// Checked big-endian reads over a byte slice.
struct ByteReader<'a> {
    buf: &'a [u8],
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(HdsError::Bootstrap(format!(
                "truncated bootstrap: wanted {} more bytes, have {}",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    fn tag(&mut self) -> Result<[u8; 4]> {
        self.need(4)?;
        let mut tag = [0u8; 4];
        self.buf.copy_to_slice(&mut tag);
        Ok(tag)
    }

    fn cstring(&mut self) -> Result<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| HdsError::Bootstrap("unterminated string".to_string()))?;
        let s = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.advance(end + 1);
        Ok(s)
    }
}
