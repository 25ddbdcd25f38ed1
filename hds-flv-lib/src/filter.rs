//! Stream facade.
//!
//! [`HdsStream`] ties the pieces together: it recognizes HDS input, parses
//! the manifest, picks a media/bootstrap pair, starts the workers and
//! exposes the synthesized FLV byte stream to the host. The output is the
//! fixed 13-byte FLV signature followed by the concatenated `mdat` payloads
//! of every fragment, in timeline order.

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use url::Url;
use uuid::Uuid;

use crate::bootstrap::BootstrapInfo;
use crate::config::HdsConfig;
use crate::error::{HdsError, Result};
use crate::fetch::HttpFetch;
use crate::manifest::{BootstrapEntry, Manifest, MediaEntry};
use crate::pipeline::{self, ChunkQueue, StreamShared};

/// FLV signature: version 1, audio + video present, 9-byte header, zero
/// previous-tag size.
pub static FLV_HEADER: [u8; 13] = [
    0x46, 0x4C, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

/// Bytes the detection probe requires.
const MIN_PROBE_BYTES: usize = 200;
/// Bytes of the probe window that are decoded and searched.
const PROBE_WINDOW: usize = 512;

/// Host-queried stream capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCapabilities {
    pub can_seek: bool,
    pub can_fastseek: bool,
    pub can_pause: bool,
    pub can_control_pace: bool,
    /// PTS delay in microseconds.
    pub pts_delay_us: u64,
}

/// Recognize HDS input from a peek at the source.
///
/// The probe needs at least 200 bytes; the first 512 are decoded (UTF-16
/// when a byte-order mark leads, 8-bit otherwise) and searched for a
/// `<manifest` element.
pub fn probe_is_hds(peek: &[u8]) -> bool {
    if peek.len() < MIN_PROBE_BYTES {
        return false;
    }
    let window = &peek[..peek.len().min(PROBE_WINDOW)];
    decode_manifest_text(window).contains("<manifest")
}

/// Decode manifest bytes to text, honoring a UTF-16 byte-order mark.
pub(crate) fn decode_manifest_text(bytes: &[u8]) -> String {
    match bytes {
        [0xFF, 0xFE, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        [0xFE, 0xFF, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// An open HDS stream producing FLV bytes.
pub struct HdsStream {
    shared: Arc<StreamShared>,
    header_pos: usize,
    download_task: tokio::task::JoinHandle<()>,
    live_task: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for HdsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HdsStream").finish_non_exhaustive()
    }
}

impl HdsStream {
    /// Open a stream from a fetched manifest document.
    ///
    /// `manifest_url` is the location the document came from; fragment and
    /// bootstrap URLs resolve against it. Must be called within a Tokio
    /// runtime, since the workers are spawned here.
    pub fn open(
        manifest_url: &str,
        manifest_bytes: &[u8],
        fetcher: Arc<dyn HttpFetch>,
        config: HdsConfig,
    ) -> Result<HdsStream> {
        let text = decode_manifest_text(manifest_bytes);
        if !text.contains("<manifest") {
            return Err(HdsError::NotHds);
        }
        let manifest = Manifest::parse(&text)?;
        let live = manifest.is_live();
        let base_url = base_url_of(manifest_url);

        // Expose the first usable media/bootstrap pairing; a structurally
        // bad bootstrap is skipped in favor of the next candidate.
        for media in &manifest.media {
            for entry in &manifest.bootstraps {
                if !ids_match(media.bootstrap_id.as_deref(), entry.id.as_deref()) {
                    continue;
                }
                match Self::open_pair(manifest_url, &base_url, &manifest, media, entry, live, &fetcher, &config) {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        tracing::warn!(
                            "bootstrap {} unusable: {}",
                            entry.id.as_deref().unwrap_or("(unnamed)"),
                            e
                        );
                    }
                }
            }
        }

        Err(HdsError::Manifest(
            "no usable media/bootstrap pairing".to_string(),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn open_pair(
        manifest_url: &str,
        base_url: &str,
        manifest: &Manifest,
        media: &MediaEntry,
        entry: &BootstrapEntry,
        live: bool,
        fetcher: &Arc<dyn HttpFetch>,
        config: &HdsConfig,
    ) -> Result<HdsStream> {
        let stream_id = Uuid::new_v4();

        let (bootstrap, abst_url) = if live {
            // Live timelines come from the refetched bootstrap; the inline
            // snapshot, if any, would be stale by the first poll anyway.
            let rel = entry.url.as_deref().ok_or_else(|| {
                HdsError::Manifest("live bootstrap without a url".to_string())
            })?;
            let resolved = resolve_url(manifest_url, base_url, rel)?;
            (BootstrapInfo::default(), Some(resolved))
        } else {
            (BootstrapInfo::parse(&entry.data)?, None)
        };

        tracing::info!(
            "[{}] opening {} stream, media {}",
            stream_id,
            if live { "live" } else { "vod" },
            media.url.as_deref().unwrap_or(&bootstrap.movie_id),
        );

        let shared = Arc::new(StreamShared {
            stream_id,
            live,
            duration_secs: manifest.duration_secs,
            base_url: base_url.to_string(),
            media_url: media.url.clone(),
            abst_url,
            config: config.clone(),
            fetcher: Arc::clone(fetcher),
            bootstrap: Mutex::new(bootstrap),
            queue: Mutex::new(ChunkQueue::default()),
            download_notify: Notify::new(),
            data_notify: Notify::new(),
            close_notify: Notify::new(),
            closed: AtomicBool::new(false),
            chunk_count: AtomicU64::new(0),
        });

        if !live {
            // Preseed the queue out to the lead-time horizon.
            pipeline::extend_vod_queue(&shared);
            if shared.queue.lock().is_empty() {
                return Err(HdsError::Timeline(
                    "bootstrap yields no fragments".to_string(),
                ));
            }
        }

        let download_task = tokio::spawn(pipeline::download_worker(Arc::clone(&shared)));
        let live_task =
            live.then(|| tokio::spawn(pipeline::live_worker(Arc::clone(&shared))));

        Ok(HdsStream {
            shared,
            header_pos: 0,
            download_task,
            live_task,
        })
    }

    /// Read FLV bytes into `buf`.
    ///
    /// Returns the number of bytes written; `0` means no payload is ready
    /// yet (retry after [`readable`](Self::readable)) or, once
    /// [`is_eof`](Self::is_eof) reports true, end of stream. Never blocks
    /// on the network.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.shared.is_closed() {
            return Err(HdsError::Closed);
        }

        let mut written = self.drain_header(buf);
        if written == buf.len() {
            return Ok(written);
        }

        if !self.shared.live {
            pipeline::extend_vod_queue(&self.shared);
        }

        let mut queue = self.shared.queue.lock();
        loop {
            if written == buf.len() {
                break;
            }
            let live = self.shared.live;
            let Some(chunk) = queue.read_head_mut() else {
                if queue.timeline_failed && written == 0 {
                    return Err(HdsError::Timeline("stream timeline failed".to_string()));
                }
                break;
            };
            let Some(data) = chunk.data.as_ref() else {
                // Not downloaded yet, or a failed attempt: nudge the worker
                // and let the host retry.
                self.shared.download_notify.notify_one();
                break;
            };

            let avail = chunk.mdat_len - chunk.mdat_pos;
            if avail > 0 {
                let n = avail.min(buf.len() - written);
                let start = chunk.mdat_off + chunk.mdat_pos;
                buf[written..written + n].copy_from_slice(&data[start..start + n]);
                chunk.mdat_pos += n;
                written += n;
            }

            if chunk.mdat_pos >= chunk.mdat_len {
                if chunk.eof {
                    break;
                }
                queue.advance_read();
                if !live {
                    queue.release_consumed();
                }
            }
        }

        Ok(written)
    }

    /// Look at upcoming bytes without consuming them.
    ///
    /// Returns a view of at most `n` bytes: the unsent FLV header remainder,
    /// or the head chunk's unread `mdat` window. Never spans chunks; empty
    /// when nothing is ready.
    pub fn peek(&self, n: usize) -> Bytes {
        if self.header_pos < FLV_HEADER.len() {
            let end = (self.header_pos + n).min(FLV_HEADER.len());
            return Bytes::from_static(&FLV_HEADER[self.header_pos..end]);
        }
        let queue = self.shared.queue.lock();
        if let Some(chunk) = queue.read_head() {
            if let Some(data) = chunk.data.as_ref() {
                let start = chunk.mdat_off + chunk.mdat_pos;
                let end = (start + n).min(chunk.mdat_off + chunk.mdat_len);
                return data.slice(start..end);
            }
        }
        Bytes::new()
    }

    /// Host capability query.
    pub fn control(&self) -> StreamCapabilities {
        StreamCapabilities {
            can_seek: false,
            can_fastseek: false,
            can_pause: false,
            can_control_pace: true,
            pts_delay_us: self.shared.config.network_caching_ms * 1000,
        }
    }

    /// The end-of-stream chunk exists and is fully drained (VOD only; live
    /// streams never end on their own).
    pub fn is_eof(&self) -> bool {
        if self.header_pos < FLV_HEADER.len() {
            return false;
        }
        let queue = self.shared.queue.lock();
        queue
            .read_head()
            .is_some_and(|c| c.eof && c.is_drained())
    }

    /// Fragments published so far.
    pub fn chunk_count(&self) -> u64 {
        self.shared
            .chunk_count
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Park until a read can make progress (payload published, timeline
    /// failure, or teardown).
    pub async fn readable(&self) {
        loop {
            {
                let queue = self.shared.queue.lock();
                if self.header_pos < FLV_HEADER.len()
                    || self.shared.is_closed()
                    || queue.timeline_failed
                {
                    return;
                }
                if let Some(chunk) = queue.read_head() {
                    if chunk.data.is_some() && (chunk.mdat_pos < chunk.mdat_len || chunk.eof) {
                        return;
                    }
                }
            }
            self.shared.data_notify.notified().await;
        }
    }

    /// Tear the stream down: cancel and join both workers.
    pub async fn close(mut self) {
        self.shared.close();
        let _ = (&mut self.download_task).await;
        if let Some(task) = self.live_task.as_mut() {
            let _ = task.await;
        }
    }

    fn drain_header(&mut self, buf: &mut [u8]) -> usize {
        if self.header_pos >= FLV_HEADER.len() {
            return 0;
        }
        let n = (FLV_HEADER.len() - self.header_pos).min(buf.len());
        buf[..n].copy_from_slice(&FLV_HEADER[self.header_pos..self.header_pos + n]);
        self.header_pos += n;
        n
    }
}

impl Drop for HdsStream {
    fn drop(&mut self) {
        // close() joins; this is the fallback for a dropped stream.
        self.shared.close();
        self.download_task.abort();
        if let Some(task) = &self.live_task {
            task.abort();
        }
    }
}

/// Both ids absent counts as a match; otherwise they must be equal.
fn ids_match(media_ref: Option<&str>, bootstrap_id: Option<&str>) -> bool {
    match (media_ref, bootstrap_id) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// The manifest URL up to its last path component.
fn base_url_of(url: &str) -> String {
    let scheme_end = url.find("://").map(|i| i + 3).unwrap_or(0);
    match url[scheme_end..].rfind('/') {
        Some(i) => url[..scheme_end + i].to_string(),
        None => url.to_string(),
    }
}

/// Resolve a possibly relative bootstrap URL against the manifest location.
fn resolve_url(manifest_url: &str, base_url: &str, rel: &str) -> Result<String> {
    if rel.len() >= 7 && rel[..7].eq_ignore_ascii_case("http://")
        || rel.len() >= 8 && rel[..8].eq_ignore_ascii_case("https://")
    {
        return Ok(rel.to_string());
    }
    match Url::parse(manifest_url).and_then(|u| u.join(rel)) {
        Ok(joined) => Ok(joined.to_string()),
        Err(_) => Ok(format!("{}/{}", base_url, rel)),
    }
}
