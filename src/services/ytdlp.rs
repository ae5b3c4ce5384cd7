//! yt-dlp invocations
//!
//! Builds the argument lists for metadata probing and video download and
//! parses the probe output. The actual process handling lives in
//! [`super::command`]; callers supply the line hooks and cancellation probe.

use super::command::{run_command, CommandOptions};
use crate::{Error, Result};
use std::path::Path;

/// Metadata extracted from `--dump-single-json` output.
#[derive(Debug, Clone)]
pub struct VideoMetadata {
    pub title: String,
    pub thumbnail_url: Option<String>,
    pub raw: serde_json::Value,
}

/// Probe a source URL without downloading.
///
/// yt-dlp interleaves progress chatter with the JSON document, so only the
/// last non-empty stdout line is parsed.
pub async fn fetch_metadata(
    bin: &str,
    source_url: &str,
    cwd: &Path,
    opts: CommandOptions,
) -> Result<VideoMetadata> {
    let output = run_command(
        bin,
        &["--dump-single-json", "--skip-download", source_url],
        Some(cwd),
        opts,
    )
    .await?;

    let json_line = output
        .stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| {
            Error::Infrastructure(format!("yt-dlp produced no metadata for {source_url}"))
        })?;

    let raw: serde_json::Value = serde_json::from_str(json_line).map_err(|e| {
        Error::Infrastructure(format!("Failed to parse yt-dlp metadata JSON: {e}"))
    })?;

    let title = raw
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or("video")
        .to_string();
    let thumbnail_url = raw
        .get("thumbnail")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(VideoMetadata {
        title,
        thumbnail_url,
        raw,
    })
}

/// Argument list for the download invocation.
///
/// Output templates are relative to the project directory the command runs
/// in: video parts land as `<playlist_index|0>.<ext>`, the info JSON as
/// `metadata.info.json`, the thumbnail as `poster.jpg`.
pub fn download_args(source_url: &str) -> Vec<String> {
    [
        "--format",
        "bestvideo+bestaudio/best",
        "--merge-output-format",
        "mp4",
        "--write-thumbnail",
        "--write-info-json",
        "--embed-metadata",
        "--embed-chapters",
        "--convert-thumbnails",
        "jpg",
        "--output",
        "%(playlist_index|0)s.%(ext)s",
        "--output",
        "infojson:metadata",
        "--output",
        "thumbnail:poster.%(ext)s",
        source_url,
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Run the download invocation in the project directory.
pub async fn download(
    bin: &str,
    source_url: &str,
    cwd: &Path,
    opts: CommandOptions,
) -> Result<()> {
    let args = download_args(source_url);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    run_command(bin, &args, Some(cwd), opts).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_args_request_mp4_merge_and_templates() {
        let args = download_args("https://www.bilibili.com/video/BV18KBJBeEmV");
        let joined = args.join(" ");
        assert!(joined.contains("bestvideo+bestaudio/best"));
        assert!(joined.contains("--merge-output-format mp4"));
        assert!(joined.contains("%(playlist_index|0)s.%(ext)s"));
        assert!(joined.contains("infojson:metadata"));
        assert!(joined.contains("thumbnail:poster.%(ext)s"));
        assert!(joined.ends_with("https://www.bilibili.com/video/BV18KBJBeEmV"));
    }
}
