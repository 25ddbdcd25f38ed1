//! Chunk pipeline.
//!
//! A stream owns a queue of chunk descriptors and up to two workers:
//!
//! - the *download worker* walks the queue and fills in fragment payloads,
//! - the *live worker* (live mode only) re-polls the bootstrap and extends
//!   the queue as the live playhead advances.
//!
//! The reader drains `mdat` bytes from the front of the queue; in VOD mode
//! it also schedules new chunks up to the lead-time horizon. Payload bytes
//! are published under the queue lock strictly before the download cursor
//! advances, so the reader never observes a partially verified fragment.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::boxes;
use crate::bootstrap::BootstrapInfo;
use crate::config::HdsConfig;
use crate::error::{HdsError, Result};
use crate::fetch::HttpFetch;
use crate::timeline::{self, Chunk};

/// Chunk queue with stable sequence numbers.
///
/// Sequence numbers only grow; `head_seq` names the front element, so
/// cursors survive the front being released.
#[derive(Default)]
pub(crate) struct ChunkQueue {
    chunks: VecDeque<Chunk>,
    head_seq: u64,
    /// Next chunk the download worker should fill; `None` after the cursor
    /// walks off the tail (it is re-derived from the queue on wakeup).
    download_seq: Option<u64>,
    /// The chunk the reader is currently consuming.
    read_seq: u64,
    /// A timeline gap was hit; no further chunks can be generated.
    pub timeline_failed: bool,
}

impl ChunkQueue {
    pub fn next_seq(&self) -> u64 {
        self.head_seq + self.chunks.len() as u64
    }

    pub fn get(&self, seq: u64) -> Option<&Chunk> {
        self.chunks.get(usize::try_from(seq.checked_sub(self.head_seq)?).ok()?)
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut Chunk> {
        let idx = usize::try_from(seq.checked_sub(self.head_seq)?).ok()?;
        self.chunks.get_mut(idx)
    }

    pub fn read_head(&self) -> Option<&Chunk> {
        self.get(self.read_seq)
    }

    pub fn read_head_mut(&mut self) -> Option<&mut Chunk> {
        self.get_mut(self.read_seq)
    }

    pub fn advance_read(&mut self) {
        self.read_seq += 1;
    }

    pub fn tail(&self) -> Option<&Chunk> {
        self.chunks.back()
    }

    pub fn front(&self) -> Option<&Chunk> {
        self.chunks.front()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn push(&mut self, chunk: Chunk) {
        self.chunks.push_back(chunk);
    }

    /// Seed the read cursor at the current front (live startup).
    pub fn reset_read_to_head(&mut self) {
        self.read_seq = self.head_seq;
    }

    /// Release drained chunks the reader has moved past. The end-of-stream
    /// chunk and the sole remaining chunk are kept so the tail stays valid
    /// for timeline continuation.
    pub fn release_consumed(&mut self) {
        while self.head_seq < self.read_seq && self.chunks.len() > 1 {
            let Some(front) = self.chunks.front() else { break };
            if !front.is_drained() || front.eof {
                break;
            }
            self.chunks.pop_front();
            self.head_seq += 1;
        }
    }
}

/// State shared between the facade, the download worker and the live worker.
pub(crate) struct StreamShared {
    pub stream_id: Uuid,
    pub live: bool,
    /// VOD presentation length in whole seconds (zero for live).
    pub duration_secs: u64,
    /// Manifest URL up to its last path component.
    pub base_url: String,
    /// The media element's url attribute, if any.
    pub media_url: Option<String>,
    /// Live mode: resolved URL the bootstrap is refetched from.
    pub abst_url: Option<String>,
    pub config: HdsConfig,
    pub fetcher: Arc<dyn HttpFetch>,

    /// Protects the bootstrap tables during live refresh. Lock order:
    /// `bootstrap` before `queue`.
    pub bootstrap: Mutex<BootstrapInfo>,
    pub queue: Mutex<ChunkQueue>,
    /// Wakes the download worker when new work or a retry request arrives.
    pub download_notify: Notify,
    /// Wakes a parked reader when a payload is published.
    pub data_notify: Notify,
    /// Wakes the live worker out of its poll sleep at teardown.
    pub close_notify: Notify,
    pub closed: AtomicBool,
    /// Fragments published since the stream opened.
    pub chunk_count: AtomicU64,
}

impl StreamShared {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.download_notify.notify_one();
        self.close_notify.notify_one();
        self.data_notify.notify_one();
    }
}

/// Build the URL of one fragment.
///
/// A fully qualified media URL replaces both the server entry and the movie
/// id; otherwise the media URL (or, absent that, the bootstrap movie id) is
/// appended to the first server entry, falling back to the manifest base.
pub(crate) fn fragment_url(
    base_url: &str,
    media_url: Option<&str>,
    bootstrap: &BootstrapInfo,
    seg_num: u32,
    frag_num: u32,
) -> String {
    let quality = bootstrap.quality_segment_modifier.as_deref().unwrap_or("");

    if let Some(media) = media_url {
        if is_fully_qualified(media) {
            return format!("{}/{}Seg{}-Frag{}", media, quality, seg_num, frag_num);
        }
    }

    let base = bootstrap
        .server_entries
        .first()
        .map(String::as_str)
        .unwrap_or(base_url);
    let movie = media_url.unwrap_or(bootstrap.movie_id.as_str());
    format!("{}/{}{}Seg{}-Frag{}", base, movie, quality, seg_num, frag_num)
}

fn is_fully_qualified(url: &str) -> bool {
    let lower_starts = |p: &str| url.len() >= p.len() && url[..p.len()].eq_ignore_ascii_case(p);
    lower_starts("http://") || lower_starts("https://")
}

/// VOD: append chunks until the lead-time horizon past the queue front is
/// covered, or the end-of-stream chunk exists. Signals the download worker
/// when anything was added.
pub(crate) fn extend_vod_queue(shared: &StreamShared) {
    if shared.live {
        return;
    }
    let bootstrap = shared.bootstrap.lock();
    let mut queue = shared.queue.lock();
    if queue.timeline_failed {
        return;
    }

    let horizon =
        shared.config.download_lead_time_secs * bootstrap.afrt_timescale.max(1) as u64;
    let mut added = false;
    loop {
        let next = match queue.tail() {
            Some(tail) => {
                if tail.eof {
                    break;
                }
                let base = queue.front().map(|c| c.timestamp).unwrap_or(tail.timestamp);
                if (tail.timestamp + tail.duration as u64).saturating_sub(base) >= horizon {
                    break;
                }
                timeline::next_chunk(&bootstrap, false, Some(tail), shared.duration_secs)
            }
            None => timeline::next_chunk(&bootstrap, false, None, shared.duration_secs),
        };
        match next {
            Ok(chunk) => {
                queue.push(chunk);
                added = true;
            }
            Err(e) => {
                tracing::warn!("[{}] timeline exhausted: {}", shared.stream_id, e);
                queue.timeline_failed = true;
                break;
            }
        }
    }

    if added {
        shared.download_notify.notify_one();
    }
}

/// Live: bring the queue in line with a fresh bootstrap snapshot.
///
/// Seeds the queue from the live playhead if empty, extends it until the
/// tail passes the live time, and releases the consumed prefix.
pub(crate) fn maintain_live_chunks(shared: &StreamShared) {
    let bootstrap = shared.bootstrap.lock();
    let mut queue = shared.queue.lock();
    if queue.timeline_failed {
        return;
    }

    let mut added = false;
    if queue.is_empty() {
        match timeline::next_chunk(&bootstrap, true, None, 0) {
            Ok(chunk) => {
                queue.push(chunk);
                queue.reset_read_to_head();
                added = true;
            }
            Err(e) => {
                tracing::warn!("[{}] cannot seed live queue: {}", shared.stream_id, e);
                queue.timeline_failed = true;
                return;
            }
        }
    }

    loop {
        let tail = queue.tail().expect("queue seeded above");
        let tail_time = tail.timestamp as u128 * bootstrap.timescale as u128
            / bootstrap.afrt_timescale.max(1) as u128;
        if tail_time > bootstrap.live_current_time as u128 {
            break;
        }
        match timeline::next_chunk(&bootstrap, true, Some(tail), 0) {
            Ok(chunk) => {
                queue.push(chunk);
                added = true;
            }
            Err(e) => {
                tracing::warn!("[{}] live timeline stalled: {}", shared.stream_id, e);
                queue.timeline_failed = true;
                break;
            }
        }
    }

    if added {
        shared.download_notify.notify_one();
    }
    queue.release_consumed();
}

/// Download worker: fetch fragment payloads in queue order.
pub(crate) async fn download_worker(shared: Arc<StreamShared>) {
    tracing::debug!("[{}] download worker started", shared.stream_id);
    loop {
        if shared.is_closed() {
            break;
        }

        let Some((seq, url)) = next_download_job(&shared) else {
            wait_for_signal(&shared).await;
            continue;
        };

        match fetch_fragment(&shared, &url).await {
            Ok((data, mdat_off, mdat_len)) => {
                tracing::trace!(
                    "[{}] fetched {} ({} bytes, mdat {})",
                    shared.stream_id,
                    url,
                    data.len(),
                    mdat_len
                );
                publish(&shared, seq, data, mdat_off, mdat_len);
            }
            Err(e) => {
                tracing::warn!("[{}] fragment download failed: {}: {}", shared.stream_id, url, e);
                if let Some(chunk) = shared.queue.lock().get_mut(seq) {
                    chunk.failed = true;
                }
                // The cursor stays put; the next signal retries this chunk.
                wait_for_signal(&shared).await;
            }
        }
    }
    tracing::debug!("[{}] download worker stopped", shared.stream_id);
}

/// Pick the next chunk needing a payload and precompute its URL.
fn next_download_job(shared: &StreamShared) -> Option<(u64, String)> {
    let bootstrap = shared.bootstrap.lock();
    let mut queue = shared.queue.lock();

    if queue.download_seq.is_none() {
        let end = queue.next_seq();
        let mut seq = queue.head_seq;
        while seq < end {
            if queue.get(seq).is_some_and(|c| c.data.is_none()) {
                queue.download_seq = Some(seq);
                break;
            }
            seq += 1;
        }
    }

    let seq = queue.download_seq?;
    let chunk = match queue.get(seq) {
        Some(c) => c,
        None => {
            queue.download_seq = None;
            return None;
        }
    };
    let url = fragment_url(
        &shared.base_url,
        shared.media_url.as_deref(),
        &bootstrap,
        chunk.seg_num,
        chunk.frag_num,
    );
    Some((seq, url))
}

async fn fetch_fragment(shared: &StreamShared, url: &str) -> Result<(Bytes, usize, usize)> {
    let data = shared.fetcher.fetch(url).await?;
    if data.len() > shared.config.max_fragment_bytes {
        return Err(HdsError::FragmentTooLarge(data.len()));
    }
    let (off, len) = match boxes::find_mdat(&data) {
        Ok(window) => window,
        Err(e) => {
            // Defensive fallback: ship the whole object as payload.
            tracing::warn!("[{}] {} for {}, using whole payload", shared.stream_id, e, url);
            (0, data.len())
        }
    };
    Ok((data, off, len))
}

/// Store the payload and advance the cursor, in that order, under the lock.
fn publish(shared: &StreamShared, seq: u64, data: Bytes, mdat_off: usize, mdat_len: usize) {
    {
        let mut queue = shared.queue.lock();
        let Some(chunk) = queue.get_mut(seq) else {
            return;
        };
        chunk.data = Some(data);
        chunk.mdat_off = mdat_off;
        chunk.mdat_len = mdat_len;
        chunk.mdat_pos = 0;
        chunk.failed = false;
        queue.download_seq = if seq + 1 < queue.next_seq() {
            Some(seq + 1)
        } else {
            None
        };
    }
    shared.chunk_count.fetch_add(1, Ordering::Relaxed);
    shared.data_notify.notify_one();
}

async fn wait_for_signal(shared: &StreamShared) {
    if shared.is_closed() {
        return;
    }
    shared.download_notify.notified().await;
}

/// Live worker: re-poll the bootstrap and extend the queue, at the cadence
/// of the current fragment duration.
pub(crate) async fn live_worker(shared: Arc<StreamShared>) {
    let Some(url) = shared.abst_url.clone() else {
        tracing::warn!("[{}] live stream without a bootstrap URL", shared.stream_id);
        return;
    };
    tracing::debug!("[{}] live worker polling {}", shared.stream_id, url);

    loop {
        if shared.is_closed() {
            break;
        }
        let started = tokio::time::Instant::now();

        match shared.fetcher.fetch(&url).await {
            Ok(data) => match BootstrapInfo::parse(&data) {
                Ok(info) => {
                    *shared.bootstrap.lock() = info;
                    maintain_live_chunks(&shared);
                }
                Err(e) => {
                    tracing::warn!("[{}] live bootstrap discarded: {}", shared.stream_id, e);
                }
            },
            Err(e) => {
                tracing::warn!("[{}] bootstrap refetch failed: {}", shared.stream_id, e);
            }
        }

        if shared.is_closed() {
            break;
        }
        let micros = {
            let bootstrap = shared.bootstrap.lock();
            match bootstrap.fragment_runs.last() {
                Some(run) if bootstrap.afrt_timescale > 0 => {
                    run.duration as u64 * 1_000_000 / bootstrap.afrt_timescale as u64
                }
                _ => 0,
            }
        };
        let micros = micros.max(shared.config.live_poll_floor_ms * 1000);
        tokio::select! {
            _ = tokio::time::sleep_until(started + Duration::from_micros(micros)) => {}
            _ = shared.close_notify.notified() => {}
        }
    }
    tracing::debug!("[{}] live worker stopped", shared.stream_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootstrap_with(servers: &[&str], movie_id: &str, quality: Option<&str>) -> BootstrapInfo {
        BootstrapInfo {
            movie_id: movie_id.to_string(),
            server_entries: servers.iter().map(|s| s.to_string()).collect(),
            quality_segment_modifier: quality.map(|q| q.to_string()),
            ..BootstrapInfo::default()
        }
    }

    #[test]
    fn test_fragment_url_relative_media() {
        let bs = bootstrap_with(&[], "ignored", None);
        let url = fragment_url("http://h/app", Some("vid"), &bs, 3, 7);
        assert_eq!(url, "http://h/app/vidSeg3-Frag7");
    }

    #[test]
    fn test_fragment_url_fully_qualified_media_overrides_server() {
        let bs = bootstrap_with(&["http://a"], "ignored", None);
        let url = fragment_url("http://base", Some("http://b/v"), &bs, 2, 5);
        assert_eq!(url, "http://b/v/Seg2-Frag5");
    }

    #[test]
    fn test_fragment_url_prefers_server_entry() {
        let bs = bootstrap_with(&["http://cdn-a", "http://cdn-b"], "movie", None);
        let url = fragment_url("http://base", None, &bs, 1, 1);
        assert_eq!(url, "http://cdn-a/movieSeg1-Frag1");
    }

    #[test]
    fn test_fragment_url_includes_quality_modifier() {
        let bs = bootstrap_with(&[], "", Some("hi-"));
        let url = fragment_url("http://h", Some("vid"), &bs, 1, 2);
        assert_eq!(url, "http://h/vidhi-Seg1-Frag2");
    }

    #[test]
    fn test_queue_release_keeps_eof_and_tail() {
        let mut q = ChunkQueue::default();
        for i in 0..3u32 {
            let mut c = crate::timeline::Chunk {
                seg_num: 1,
                frag_num: i + 1,
                timestamp: i as u64 * 1000,
                duration: 1000,
                frun_entry: 0,
                data: Some(Bytes::from_static(b"x")),
                mdat_off: 0,
                mdat_len: 1,
                mdat_pos: 1,
                failed: false,
                eof: false,
            };
            c.eof = i == 2;
            q.push(c);
        }
        q.read_seq = 2;
        q.release_consumed();
        assert_eq!(q.head_seq, 2);
        assert!(q.get(2).unwrap().eof);

        // The eof chunk itself is never released.
        q.read_seq = 3;
        q.release_consumed();
        assert_eq!(q.head_seq, 2);
    }
}
