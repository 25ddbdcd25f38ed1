//! Fragment timeline.
//!
//! Turns the run tables from the bootstrap into concrete chunk descriptors:
//! which `(segment, fragment)` pair to fetch next, at which timestamp, and
//! for how long. Generation is sequential; each chunk caches the fragment-run
//! index it matched so the next lookup starts where the previous one ended.

use bytes::Bytes;

use crate::bootstrap::BootstrapInfo;
use crate::error::{HdsError, Result};

/// One scheduled fragment in the queue.
#[derive(Debug, Clone)]
pub(crate) struct Chunk {
    pub seg_num: u32,
    pub frag_num: u32,
    /// Start time in `afrt_timescale` units.
    pub timestamp: u64,
    /// Duration in `afrt_timescale` units.
    pub duration: u32,
    /// Fragment-run index this chunk matched.
    pub frun_entry: usize,
    /// Downloaded fragment bytes; `None` until the download worker publishes.
    pub data: Option<Bytes>,
    /// `mdat` payload window within `data`.
    pub mdat_off: usize,
    pub mdat_len: usize,
    /// Read cursor within the `mdat` window.
    pub mdat_pos: usize,
    /// Last download attempt failed; the worker will retry.
    pub failed: bool,
    /// VOD only: this chunk reaches the end of the presentation.
    pub eof: bool,
}

impl Chunk {
    /// Payload published and fully consumed.
    pub fn is_drained(&self) -> bool {
        self.data.is_some() && self.mdat_pos >= self.mdat_len
    }
}

/// Produce the next chunk descriptor after `prev` (or the first one).
///
/// For live streams the first chunk is located by the live playhead; for VOD
/// it starts at the first fragment run. `duration_secs` is the VOD
/// presentation length used for the EOF mark; it is ignored for live.
pub(crate) fn next_chunk(
    bootstrap: &BootstrapInfo,
    live: bool,
    prev: Option<&Chunk>,
    duration_secs: u64,
) -> Result<Chunk> {
    let runs = &bootstrap.fragment_runs;
    if runs.is_empty() {
        return Err(HdsError::Timeline("empty fragment run table".to_string()));
    }
    if bootstrap.timescale == 0 || bootstrap.afrt_timescale == 0 {
        return Err(HdsError::Timeline("zero timescale".to_string()));
    }

    let (mut timestamp, mut frag_num, start_entry) = match prev {
        Some(p) => (
            p.timestamp + p.duration as u64,
            p.frag_num + 1,
            // Live tables are rewritten on refresh, so the cached index is
            // only trusted for VOD.
            if live { 0 } else { p.frun_entry.min(runs.len() - 1) },
        ),
        None if live => {
            let now = bootstrap.live_current_time as u128 * bootstrap.afrt_timescale as u128
                / bootstrap.timescale as u128;
            (now as u64, 0, 0)
        }
        None => (runs[0].timestamp, runs[0].first_fragment, 0),
    };

    let mut matched: Option<usize> = None;
    let mut duration = 0u32;

    let mut entry = start_entry;
    while entry < runs.len() {
        let run = &runs[entry];

        if run.duration == 0 {
            // Discontinuity marker: restart from the following run.
            let Some(next) = runs.get(entry + 1) else {
                return Err(HdsError::Timeline(
                    "discontinuity marker at end of fragment run table".to_string(),
                ));
            };
            frag_num = next.first_fragment;
            timestamp = next.timestamp;
            duration = next.duration;
            matched = Some(entry + 1);
            break;
        }

        if frag_num == 0 {
            // Fragment number unknown: locate the run by timestamp.
            let last = entry + 1 >= runs.len();
            if last || (timestamp >= run.timestamp && timestamp < runs[entry + 1].timestamp) {
                let offset = timestamp.saturating_sub(run.timestamp) / run.duration as u64;
                frag_num = run.first_fragment + offset as u32;
                duration = run.duration;
                matched = Some(entry);
                break;
            }
        } else if run.first_fragment <= frag_num
            && (entry + 1 >= runs.len() || runs[entry + 1].first_fragment > frag_num)
        {
            duration = run.duration;
            timestamp =
                run.timestamp + run.duration as u64 * (frag_num - run.first_fragment) as u64;
            matched = Some(entry);
            break;
        }

        entry += 1;
    }

    let Some(frun_entry) = matched else {
        return Err(HdsError::Timeline(format!(
            "no fragment run matches fragment {} at timestamp {}",
            frag_num, timestamp
        )));
    };

    let seg_num = segment_for_fragment(bootstrap, frag_num)?;

    let eof = !live
        && (timestamp + duration as u64) / bootstrap.afrt_timescale as u64 >= duration_secs;

    Ok(Chunk {
        seg_num,
        frag_num,
        timestamp,
        duration,
        frun_entry,
        data: None,
        mdat_off: 0,
        mdat_len: 0,
        mdat_pos: 0,
        failed: false,
        eof,
    })
}

/// Map a fragment number onto the segment-run table.
///
/// The accumulator is seeded with the fragment numbering base (the first
/// fragment run's start number) so that within each segment run
/// `seg = first_segment + (frag - run_base) / fragments_per_segment`, where
/// `run_base` is the number of the first fragment covered by that run.
fn segment_for_fragment(bootstrap: &BootstrapInfo, frag_num: u32) -> Result<u32> {
    let sruns = &bootstrap.segment_runs;
    if sruns.is_empty() {
        return Err(HdsError::Timeline("empty segment run table".to_string()));
    }

    let mut fragments_accum = bootstrap
        .fragment_runs
        .first()
        .map(|r| r.first_fragment)
        .unwrap_or(0);
    let mut seg_num = 0u32;

    for (i, srun) in sruns.iter().enumerate() {
        if srun.fragments_per_segment == 0 {
            return Err(HdsError::Timeline(
                "segment run with zero fragments per segment".to_string(),
            ));
        }
        seg_num = srun.first_segment
            + frag_num.saturating_sub(fragments_accum) / srun.fragments_per_segment;
        if i + 1 >= sruns.len() || sruns[i + 1].first_segment > seg_num {
            break;
        }
        fragments_accum +=
            (sruns[i + 1].first_segment - srun.first_segment) * srun.fragments_per_segment;
    }

    Ok(seg_num)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{FragmentRun, SegmentRun};

    fn vod_bootstrap() -> BootstrapInfo {
        BootstrapInfo {
            timescale: 1000,
            afrt_timescale: 1000,
            segment_runs: vec![SegmentRun { first_segment: 1, fragments_per_segment: 4 }],
            fragment_runs: vec![FragmentRun {
                first_fragment: 1,
                timestamp: 0,
                duration: 2500,
                discontinuity: 0,
            }],
            ..BootstrapInfo::default()
        }
    }

    fn generate(bootstrap: &BootstrapInfo, live: bool, duration_secs: u64, n: usize) -> Vec<Chunk> {
        let mut out: Vec<Chunk> = Vec::new();
        for _ in 0..n {
            let next = next_chunk(bootstrap, live, out.last(), duration_secs).unwrap();
            out.push(next);
        }
        out
    }

    #[test]
    fn test_vod_chunk_sequence() {
        let bs = vod_bootstrap();
        let chunks = generate(&bs, false, 10, 4);

        let got: Vec<(u32, u32, u64)> =
            chunks.iter().map(|c| (c.seg_num, c.frag_num, c.timestamp)).collect();
        assert_eq!(got, vec![(1, 1, 0), (1, 2, 2500), (1, 3, 5000), (1, 4, 7500)]);

        assert!(chunks[..3].iter().all(|c| !c.eof));
        assert!(chunks[3].eof, "chunk ending at the total duration is eof");
    }

    #[test]
    fn test_timeline_is_monotonic() {
        let bs = vod_bootstrap();
        let chunks = generate(&bs, false, 10, 4);
        for pair in chunks.windows(2) {
            assert!(pair[1].timestamp > pair[0].timestamp);
            assert!(pair[1].frag_num > pair[0].frag_num);
        }
    }

    #[test]
    fn test_discontinuity_adopts_following_run() {
        let mut bs = vod_bootstrap();
        bs.fragment_runs = vec![
            FragmentRun { first_fragment: 1, timestamp: 0, duration: 1000, discontinuity: 0 },
            FragmentRun { first_fragment: 2, timestamp: 0, duration: 0, discontinuity: 1 },
            FragmentRun { first_fragment: 10, timestamp: 100_000, duration: 1000, discontinuity: 0 },
        ];

        let first = next_chunk(&bs, false, None, 1000).unwrap();
        assert_eq!((first.frag_num, first.timestamp), (1, 0));

        let second = next_chunk(&bs, false, Some(&first), 1000).unwrap();
        assert_eq!(second.frag_num, 10);
        assert_eq!(second.timestamp, 100_000);
        assert_eq!(second.duration, 1000);
    }

    #[test]
    fn test_trailing_discontinuity_marker_is_fatal() {
        let mut bs = vod_bootstrap();
        bs.fragment_runs = vec![
            FragmentRun { first_fragment: 1, timestamp: 0, duration: 1000, discontinuity: 0 },
            FragmentRun { first_fragment: 2, timestamp: 0, duration: 0, discontinuity: 1 },
        ];
        let first = next_chunk(&bs, false, None, 1000).unwrap();
        assert!(next_chunk(&bs, false, Some(&first), 1000).is_err());
    }

    #[test]
    fn test_live_first_chunk_located_by_playhead() {
        let mut bs = vod_bootstrap();
        bs.live_current_time = 5000;
        bs.fragment_runs = vec![FragmentRun {
            first_fragment: 1,
            timestamp: 0,
            duration: 1000,
            discontinuity: 0,
        }];

        let chunk = next_chunk(&bs, true, None, 0).unwrap();
        assert_eq!(chunk.frag_num, 6, "frag 1 + 5000/1000");
        assert_eq!(chunk.timestamp, 5000);
        assert!(!chunk.eof);
    }

    #[test]
    fn test_live_playhead_scaled_between_timescales() {
        let mut bs = vod_bootstrap();
        bs.timescale = 1000;
        bs.afrt_timescale = 10_000;
        bs.live_current_time = 5000;
        bs.fragment_runs = vec![FragmentRun {
            first_fragment: 1,
            timestamp: 0,
            duration: 10_000,
            discontinuity: 0,
        }];

        let chunk = next_chunk(&bs, true, None, 0).unwrap();
        assert_eq!(chunk.timestamp, 50_000);
        assert_eq!(chunk.frag_num, 6);
    }

    #[test]
    fn test_segments_across_multiple_runs() {
        let mut bs = vod_bootstrap();
        // Segments 1..2 hold 2 fragments each, segments 3.. hold 4.
        bs.segment_runs = vec![
            SegmentRun { first_segment: 1, fragments_per_segment: 2 },
            SegmentRun { first_segment: 3, fragments_per_segment: 4 },
        ];
        bs.fragment_runs = vec![FragmentRun {
            first_fragment: 1,
            timestamp: 0,
            duration: 1000,
            discontinuity: 0,
        }];

        let expect = [
            (1, 1),
            (2, 1),
            (3, 2),
            (4, 2),
            (5, 3),
            (8, 3),
            (9, 4),
            (12, 4),
            (13, 5),
        ];
        for (frag, seg) in expect {
            assert_eq!(
                segment_for_fragment(&bs, frag).unwrap(),
                seg,
                "fragment {}",
                frag
            );
        }
    }

    #[test]
    fn test_no_matching_run_is_fatal() {
        let mut bs = vod_bootstrap();
        bs.fragment_runs = vec![FragmentRun {
            first_fragment: 5,
            timestamp: 0,
            duration: 1000,
            discontinuity: 0,
        }];
        // prev points past the only run's coverage window start rules:
        // frag 3 is below first_fragment 5, no run matches.
        let prev = Chunk {
            seg_num: 1,
            frag_num: 2,
            timestamp: 0,
            duration: 1000,
            frun_entry: 0,
            data: None,
            mdat_off: 0,
            mdat_len: 0,
            mdat_pos: 0,
            failed: false,
            eof: false,
        };
        assert!(next_chunk(&bs, false, Some(&prev), 100).is_err());
    }
}
