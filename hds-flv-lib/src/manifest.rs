//! F4M manifest parsing.
//!
//! The manifest is pull-parsed; only the `manifest`, `media`,
//! `bootstrapInfo`, `duration` and `id` elements are interpreted, everything
//! else is skipped. Inline bootstrap bodies are base64 of a raw `abst` box.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{HdsError, Result};

/// Media entries beyond this count are a fatal manifest error.
pub(crate) const MAX_MEDIA_ENTRIES: usize = 10;
/// Bootstrap entries beyond this count are warned about and dropped.
pub(crate) const MAX_BOOTSTRAP_ENTRIES: usize = 10;
/// Element nesting bound.
const MAX_ELEMENT_DEPTH: usize = 256;

/// A `<media>` element.
#[derive(Debug, Clone, Default)]
pub(crate) struct MediaEntry {
    pub stream_id: Option<String>,
    pub url: Option<String>,
    pub bootstrap_id: Option<String>,
}

/// A `<bootstrapInfo>` element.
#[derive(Debug, Clone, Default)]
pub(crate) struct BootstrapEntry {
    pub id: Option<String>,
    pub url: Option<String>,
    pub profile: Option<String>,
    /// Decoded inline `abst` bytes; empty when the element only carries a URL.
    pub data: Vec<u8>,
}

/// Parsed manifest contents.
#[derive(Debug, Default)]
pub(crate) struct Manifest {
    pub media_id: Option<String>,
    /// Total duration in whole seconds; zero means live.
    pub duration_secs: u64,
    pub media: Vec<MediaEntry>,
    pub bootstraps: Vec<BootstrapEntry>,
}

impl Manifest {
    /// A manifest without a positive `<duration>` describes a live stream.
    pub fn is_live(&self) -> bool {
        self.duration_secs == 0
    }

    /// Pull-parse a manifest document.
    pub fn parse(text: &str) -> Result<Manifest> {
        let mut reader = Reader::from_str(text);
        let mut manifest = Manifest::default();

        let mut stack: Vec<String> = Vec::new();
        let mut text_buf = String::new();
        let mut current_bootstrap: Option<BootstrapEntry> = None;
        let mut dropped_bootstraps = 0usize;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    if stack.len() >= MAX_ELEMENT_DEPTH {
                        return Err(HdsError::Manifest(
                            "manifest nesting too deep".to_string(),
                        ));
                    }
                    let name = local_name(&e);
                    text_buf.clear();
                    match name.as_str() {
                        "media" => manifest.push_media(media_entry(&e)?)?,
                        "bootstrapInfo" => {
                            if manifest.bootstraps.len() < MAX_BOOTSTRAP_ENTRIES {
                                current_bootstrap = Some(bootstrap_entry(&e)?);
                            } else {
                                dropped_bootstraps += 1;
                            }
                        }
                        _ => {}
                    }
                    stack.push(name);
                }
                Event::Empty(e) => {
                    let name = local_name(&e);
                    match name.as_str() {
                        "media" => manifest.push_media(media_entry(&e)?)?,
                        "bootstrapInfo" => {
                            if manifest.bootstraps.len() < MAX_BOOTSTRAP_ENTRIES {
                                manifest.bootstraps.push(bootstrap_entry(&e)?);
                            } else {
                                dropped_bootstraps += 1;
                            }
                        }
                        _ => {}
                    }
                }
                Event::Text(t) => {
                    let piece = t
                        .unescape()
                        .map_err(|e| HdsError::Manifest(e.to_string()))?;
                    text_buf.push_str(&piece);
                }
                Event::End(_) => {
                    let Some(name) = stack.pop() else { continue };
                    let parent = stack.last().map(String::as_str);
                    match name.as_str() {
                        "bootstrapInfo" => {
                            if let Some(mut entry) = current_bootstrap.take() {
                                let body: String = text_buf
                                    .chars()
                                    .filter(|c| !c.is_whitespace())
                                    .collect();
                                if !body.is_empty() {
                                    entry.data = BASE64.decode(body.as_bytes())?;
                                }
                                manifest.bootstraps.push(entry);
                            }
                        }
                        "duration" if parent == Some("manifest") => {
                            let secs: f64 = text_buf.trim().parse().unwrap_or(0.0);
                            manifest.duration_secs = if secs.is_finite() && secs > 0.0 {
                                secs.floor() as u64
                            } else {
                                0
                            };
                        }
                        "id" if parent == Some("manifest") => {
                            manifest.media_id = Some(text_buf.trim().to_string());
                        }
                        _ => {}
                    }
                    text_buf.clear();
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if dropped_bootstraps > 0 {
            tracing::warn!(
                "manifest has too many bootstrapInfo elements, dropped {}",
                dropped_bootstraps
            );
        }
        if manifest.media.is_empty() {
            return Err(HdsError::Manifest("no media entries".to_string()));
        }

        Ok(manifest)
    }

    fn push_media(&mut self, entry: MediaEntry) -> Result<()> {
        if self.media.len() >= MAX_MEDIA_ENTRIES {
            return Err(HdsError::Manifest(format!(
                "more than {} media entries",
                MAX_MEDIA_ENTRIES
            )));
        }
        self.media.push(entry);
        Ok(())
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attr_value(e: &BytesStart<'_>, wanted: &str) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| HdsError::Manifest(e.to_string()))?;
        if attr.key.local_name().as_ref() == wanted.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|e| HdsError::Manifest(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn media_entry(e: &BytesStart<'_>) -> Result<MediaEntry> {
    Ok(MediaEntry {
        stream_id: attr_value(e, "streamId")?,
        url: attr_value(e, "url")?,
        bootstrap_id: attr_value(e, "bootstrapInfoId")?,
    })
}

fn bootstrap_entry(e: &BytesStart<'_>) -> Result<BootstrapEntry> {
    Ok(BootstrapEntry {
        id: attr_value(e, "id")?,
        url: attr_value(e, "url")?,
        profile: attr_value(e, "profile")?,
        data: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOD_MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<manifest xmlns="http://ns.adobe.com/f4m/1.0">
  <id>example-movie</id>
  <duration>10.5</duration>
  <bootstrapInfo profile="named" id="boot1">AAAAGGFic3Q=</bootstrapInfo>
  <media streamId="main" url="video" bootstrapInfoId="boot1"/>
</manifest>"#;

    #[test]
    fn test_vod_manifest() {
        let m = Manifest::parse(VOD_MANIFEST).unwrap();
        assert_eq!(m.media_id.as_deref(), Some("example-movie"));
        assert_eq!(m.duration_secs, 10);
        assert!(!m.is_live());

        assert_eq!(m.media.len(), 1);
        assert_eq!(m.media[0].stream_id.as_deref(), Some("main"));
        assert_eq!(m.media[0].url.as_deref(), Some("video"));
        assert_eq!(m.media[0].bootstrap_id.as_deref(), Some("boot1"));

        assert_eq!(m.bootstraps.len(), 1);
        assert_eq!(m.bootstraps[0].id.as_deref(), Some("boot1"));
        assert_eq!(m.bootstraps[0].profile.as_deref(), Some("named"));
        // 0x18 "abst" prefix survives the round trip.
        assert_eq!(&m.bootstraps[0].data[4..8], b"abst");
    }

    #[test]
    fn test_live_manifest_without_duration() {
        let text = r#"<manifest>
            <bootstrapInfo id="b" url="bootstrap"/>
            <media url="video" bootstrapInfoId="b"/>
        </manifest>"#;
        let m = Manifest::parse(text).unwrap();
        assert!(m.is_live());
        assert_eq!(m.bootstraps[0].url.as_deref(), Some("bootstrap"));
        assert!(m.bootstraps[0].data.is_empty());
    }

    #[test]
    fn test_zero_duration_is_live() {
        let text = r#"<manifest><duration>0</duration><media url="v"/></manifest>"#;
        assert!(Manifest::parse(text).unwrap().is_live());
    }

    #[test]
    fn test_whitespace_in_bootstrap_body() {
        let text = "<manifest><bootstrapInfo id=\"b\">\n  AAAA\n  GGFi\n  c3Q=\n</bootstrapInfo><media url=\"v\"/></manifest>";
        let m = Manifest::parse(text).unwrap();
        assert_eq!(&m.bootstraps[0].data[4..8], b"abst");
    }

    #[test]
    fn test_nested_duration_ignored() {
        let text = r#"<manifest>
            <media url="v"><duration>99</duration></media>
            <duration>7.9</duration>
        </manifest>"#;
        let m = Manifest::parse(text).unwrap();
        assert_eq!(m.duration_secs, 7);
    }

    #[test]
    fn test_too_many_media_entries_fatal() {
        let mut text = String::from("<manifest>");
        for i in 0..11 {
            text.push_str(&format!("<media url=\"v{}\"/>", i));
        }
        text.push_str("</manifest>");
        assert!(Manifest::parse(&text).is_err());
    }

    #[test]
    fn test_excess_bootstraps_dropped_not_fatal() {
        let mut text = String::from("<manifest><media url=\"v\"/>");
        for i in 0..12 {
            text.push_str(&format!("<bootstrapInfo id=\"b{}\" url=\"u\"/>", i));
        }
        text.push_str("</manifest>");
        let m = Manifest::parse(&text).unwrap();
        assert_eq!(m.bootstraps.len(), MAX_BOOTSTRAP_ENTRIES);
    }

    #[test]
    fn test_no_media_is_fatal() {
        assert!(Manifest::parse("<manifest><duration>5</duration></manifest>").is_err());
    }

    #[test]
    fn test_invalid_base64_is_fatal() {
        let text = r#"<manifest><bootstrapInfo id="b">!!!</bootstrapInfo><media url="v"/></manifest>"#;
        assert!(Manifest::parse(text).is_err());
    }
}
