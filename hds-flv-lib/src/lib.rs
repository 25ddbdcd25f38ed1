//! # HDS → FLV library
//!
//! `hds-flv-lib` consumes an HTTP Dynamic Streaming (HDS) manifest and
//! produces a continuous FLV byte stream, suitable for feeding a demuxer
//! that understands FLV but not HDS. The manifest's compact bootstrap
//! description (segment and fragment run tables) is expanded into concrete
//! `Seg{n}-Frag{m}` fetches; a background worker prefetches fragments, and
//! the reader receives the fixed FLV signature followed by each fragment's
//! `mdat` payload spliced in timeline order.
//!
//! Both video-on-demand and live streams are handled; live streams re-poll
//! the bootstrap to extend the timeline as the broadcast advances.
//!
//! ## Usage
//!
//! ```ignore
//! let fetcher = Arc::new(ReqwestFetch::new());
//! let manifest = fetcher.fetch(url).await?;
//! if !hds_flv_lib::probe_is_hds(&manifest) {
//!     return Err(HdsError::NotHds);
//! }
//!
//! let mut stream = HdsStream::open(url, &manifest, fetcher, HdsConfig::default())?;
//! let mut buf = vec![0u8; 64 * 1024];
//! loop {
//!     let n = stream.read(&mut buf)?;
//!     if n == 0 {
//!         if stream.is_eof() { break; }
//!         stream.readable().await;
//!         continue;
//!     }
//!     out.write_all(&buf[..n])?;
//! }
//! stream.close().await;
//! ```
//!
//! Reads never block on the network: a read that finds no payload ready
//! returns `0` and the caller parks on [`HdsStream::readable`].

pub(crate) mod boxes;
pub(crate) mod bootstrap;
pub(crate) mod manifest;
pub(crate) mod pipeline;
pub(crate) mod timeline;

pub mod config;
pub mod error;
pub mod fetch;
pub mod filter;

#[cfg(test)]
pub(crate) mod tests;

pub use config::HdsConfig;
pub use error::{HdsError, Result};
pub use fetch::{HttpFetch, ReqwestFetch};
pub use filter::{probe_is_hds, HdsStream, StreamCapabilities, FLV_HEADER};
