//! Source reference parsing and canonical URL derivation

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Supported video source platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoSource {
    Bilibili,
    Tver,
    Youtube,
    Unknown,
}

impl VideoSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoSource::Bilibili => "bilibili",
            VideoSource::Tver => "tver",
            VideoSource::Youtube => "youtube",
            VideoSource::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "bilibili" => Ok(VideoSource::Bilibili),
            "tver" => Ok(VideoSource::Tver),
            "youtube" => Ok(VideoSource::Youtube),
            "unknown" => Ok(VideoSource::Unknown),
            other => Err(Error::Infrastructure(format!(
                "Unknown video source in database: {other}"
            ))),
        }
    }
}

fn patterns() -> &'static [(regex::Regex, VideoSource)] {
    static PATTERNS: OnceLock<Vec<(regex::Regex, VideoSource)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                regex::Regex::new(r"[Bb][Vv][A-Za-z0-9]{10}").unwrap(),
                VideoSource::Bilibili,
            ),
            (
                regex::Regex::new(r"episodes/(\w+)").unwrap(),
                VideoSource::Tver,
            ),
            (
                regex::Regex::new(r"(?:v=|youtu\.be/)([A-Za-z0-9_-]{11})").unwrap(),
                VideoSource::Youtube,
            ),
            (
                regex::Regex::new(r"^[A-Za-z0-9_-]{6,30}$").unwrap(),
                VideoSource::Unknown,
            ),
        ]
    })
}

/// Extract `(source, source_video_id)` from a raw user input.
///
/// Patterns are tried in declaration order; a bilibili BV id is upper-cased
/// on the `BV` prefix as the platform requires. Unmatched input is a
/// validation error.
pub fn parse_source(input: &str) -> Result<(VideoSource, String)> {
    let input = input.trim();

    for (pattern, source) in patterns() {
        if let Some(caps) = pattern.captures(input) {
            let id = caps
                .get(1)
                .unwrap_or_else(|| caps.get(0).expect("match has group 0"))
                .as_str();
            let id = match source {
                VideoSource::Bilibili => {
                    let mut id = id.to_string();
                    id.replace_range(0..2, "BV");
                    id
                }
                _ => id.to_string(),
            };
            return Ok((*source, id));
        }
    }

    Err(Error::Validation(format!(
        "Unrecognized video source: {input}"
    )))
}

/// Canonical URL handed to yt-dlp.
///
/// An input that already is a URL wins; otherwise the platform's canonical
/// form is built from the id, falling back to the raw input for sources
/// without a known URL shape.
pub fn derive_source_url(source: VideoSource, source_video_id: &str, original_input: &str) -> String {
    if original_input.starts_with("http://") || original_input.starts_with("https://") {
        return original_input.to_string();
    }
    match source {
        VideoSource::Bilibili => format!("https://www.bilibili.com/video/{source_video_id}"),
        VideoSource::Youtube => format!("https://www.youtube.com/watch?v={source_video_id}"),
        VideoSource::Tver => format!("https://tver.jp/episodes/{source_video_id}"),
        VideoSource::Unknown => original_input.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bilibili_id_and_url() {
        let (source, id) = parse_source("BV18KBJBeEmV").unwrap();
        assert_eq!(source, VideoSource::Bilibili);
        assert_eq!(id, "BV18KBJBeEmV");

        let (source, id) =
            parse_source("https://www.bilibili.com/video/BV18KBJBeEmV?p=2").unwrap();
        assert_eq!(source, VideoSource::Bilibili);
        assert_eq!(id, "BV18KBJBeEmV");
    }

    #[test]
    fn normalizes_bilibili_prefix_case() {
        let (_, id) = parse_source("bv18KBJBeEmV").unwrap();
        assert_eq!(id, "BV18KBJBeEmV");
    }

    #[test]
    fn parses_tver_episode_url() {
        let (source, id) = parse_source("https://tver.jp/episodes/epc1abcde").unwrap();
        assert_eq!(source, VideoSource::Tver);
        assert_eq!(id, "epc1abcde");
    }

    #[test]
    fn parses_youtube_watch_and_short_urls() {
        let (source, id) =
            parse_source("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap();
        assert_eq!(source, VideoSource::Youtube);
        assert_eq!(id, "dQw4w9WgXcQ");

        let (source, id) = parse_source("https://youtu.be/dQw4w9WgXcQ").unwrap();
        assert_eq!(source, VideoSource::Youtube);
        assert_eq!(id, "dQw4w9WgXcQ");
    }

    #[test]
    fn bare_token_falls_back_to_unknown() {
        let (source, id) = parse_source("epc1abcde").unwrap();
        assert_eq!(source, VideoSource::Unknown);
        assert_eq!(id, "epc1abcde");
    }

    #[test]
    fn rejects_unparseable_input() {
        assert!(parse_source("https://example.com/nothing-here").is_err());
        assert!(parse_source("!!").is_err());
    }

    #[test]
    fn canonical_urls_round_trip_through_the_parser() {
        for (source, id) in [
            (VideoSource::Bilibili, "BV18KBJBeEmV"),
            (VideoSource::Youtube, "dQw4w9WgXcQ"),
            (VideoSource::Tver, "epc1abcde"),
        ] {
            let url = derive_source_url(source, id, id);
            let (parsed_source, parsed_id) = parse_source(&url).unwrap();
            assert_eq!(parsed_source, source, "{url}");
            assert_eq!(parsed_id, id, "{url}");
        }
    }

    #[test]
    fn url_input_is_used_verbatim() {
        let url = "https://www.bilibili.com/video/BV18KBJBeEmV?p=3";
        assert_eq!(
            derive_source_url(VideoSource::Bilibili, "BV18KBJBeEmV", url),
            url
        );
    }
}
