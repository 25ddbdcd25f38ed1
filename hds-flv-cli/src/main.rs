//! HDS → FLV remux tool
//!
//! Fetches an HDS manifest, drives the stream filter in hds-flv-lib, and
//! writes the synthesized FLV byte stream to a file or stdout. Live streams
//! run until interrupted.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hds_flv_lib::{probe_is_hds, HdsConfig, HdsStream, HttpFetch, ReqwestFetch, Result};

/// Application name
const APP_NAME: &str = "hds-flv";

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = APP_NAME, version, about = "Remux an HDS stream to FLV")]
struct Args {
    /// Manifest (.f4m) URL
    url: String,

    /// Output file; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Network caching delay in milliseconds [default: 1000]
    #[arg(long)]
    network_caching: Option<u64>,

    /// VOD prefetch horizon in seconds [default: 15]
    #[arg(long)]
    lead_time: Option<u64>,

    /// Optional TOML configuration file; command-line flags win
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Configuration file format
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    stream: Option<StreamSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StreamSettings {
    /// Network caching delay in milliseconds
    network_caching_ms: Option<u64>,
    /// VOD prefetch horizon in seconds
    lead_time_secs: Option<u64>,
    /// Per-fragment size cap in megabytes
    max_fragment_mb: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args = Args::parse();
    tracing::info!("{} v{} starting", APP_NAME, VERSION);

    let config = build_config(&args);
    tracing::debug!("configuration: {:?}", config);

    let fetcher: Arc<dyn HttpFetch> = Arc::new(ReqwestFetch::new());
    let manifest = fetcher.fetch(&args.url).await?;
    if !probe_is_hds(&manifest) {
        tracing::error!("{} does not look like an HDS manifest", args.url);
        return Err(hds_flv_lib::HdsError::NotHds);
    }

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout().lock()),
    };

    let mut stream = HdsStream::open(&args.url, &manifest, fetcher, config)?;

    tokio::select! {
        result = pump(&mut stream, &mut out) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
    }

    out.flush()?;
    stream.close().await;
    Ok(())
}

/// Copy FLV bytes from the stream to the writer until EOF.
async fn pump(stream: &mut HdsStream, out: &mut Box<dyn Write>) -> Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            if stream.is_eof() {
                tracing::info!("end of stream, {} fragments", stream.chunk_count());
                return Ok(());
            }
            stream.readable().await;
            continue;
        }
        out.write_all(&buf[..n])?;
    }
}

/// Layer command-line flags over the optional config file.
fn build_config(args: &Args) -> HdsConfig {
    let mut config = HdsConfig::default();

    if let Some(path) = &args.config {
        match std::fs::read_to_string(path).map_err(|e| e.to_string()).and_then(|text| {
            toml::from_str::<ConfigFile>(&text).map_err(|e| e.to_string())
        }) {
            Ok(file) => {
                let stream = file.stream.unwrap_or_default();
                if let Some(v) = stream.network_caching_ms {
                    config.network_caching_ms = v;
                }
                if let Some(v) = stream.lead_time_secs {
                    config.download_lead_time_secs = v;
                }
                if let Some(v) = stream.max_fragment_mb {
                    config.max_fragment_bytes = v * 1024 * 1024;
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to load config file {}: {}. Using defaults.",
                    path.display(),
                    e
                );
            }
        }
    }

    // Explicit flags win over the config file.
    if let Some(v) = args.network_caching {
        config.network_caching_ms = v;
    }
    if let Some(v) = args.lead_time {
        config.download_lead_time_secs = v;
    }
    config
}

/// Initialize logging with tracing
fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hds_flv=info,hds_flv_lib=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_config_file_overrides() {
        let file: ConfigFile = toml::from_str(
            r#"
            [stream]
            network_caching_ms = 2500
            lead_time_secs = 30
            max_fragment_mb = 10
            "#,
        )
        .unwrap();
        let stream = file.stream.unwrap();
        assert_eq!(stream.network_caching_ms, Some(2500));
        assert_eq!(stream.lead_time_secs, Some(30));
        assert_eq!(stream.max_fragment_mb, Some(10));
    }
}
