//! ffmpeg invocations and the downloaded-part merge
//!
//! Audio extraction targets the ASR service's preferred input: mono, 16 kHz,
//! 24k opus. The merge step handles playlists that yt-dlp leaves as several
//! numbered mp4 parts.

use super::command::{run_command, CommandOptions};
use crate::{Error, Result};
use std::path::{Path, PathBuf};

pub const VIDEO_FILE_NAME: &str = "video.mp4";
pub const AUDIO_FILE_NAME: &str = "audio.opus";
const CONCAT_FILE_NAME: &str = "concat.txt";

/// Extract mono 16 kHz opus audio from a video file.
pub async fn extract_audio(
    bin: &str,
    video_path: &Path,
    audio_path: &Path,
    cwd: &Path,
    opts: CommandOptions,
) -> Result<()> {
    let video = video_path.to_string_lossy();
    let audio = audio_path.to_string_lossy();
    run_command(
        bin,
        &[
            "-y", "-i", &video, "-ac", "1", "-ar", "16000", "-b:a", "24k", &audio,
        ],
        Some(cwd),
        opts,
    )
    .await?;
    Ok(())
}

/// Concat-demuxer file body for ffmpeg. Single quotes in a filename are
/// escaped by doubling them, matching the quoting the downloader has always
/// produced.
pub fn concat_file_body(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|part| {
            let name = part.to_string_lossy().replace('\'', "''");
            format!("file '{name}'\n")
        })
        .collect()
}

/// Downloaded mp4 parts in the project directory, sorted lexicographically
/// by file name. The merged output file is excluded so a resumed task does
/// not re-merge its own result.
pub fn list_downloaded_parts(project_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut parts: Vec<PathBuf> = std::fs::read_dir(project_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path.extension().is_some_and(|ext| ext == "mp4")
                && path.file_name().is_some_and(|name| name != VIDEO_FILE_NAME)
        })
        .collect();
    parts.sort_by_key(|path| path.file_name().map(|n| n.to_os_string()));
    Ok(parts)
}

/// Combine the downloaded parts into `video.mp4`.
///
/// One part is renamed in place. Several parts are concatenated with the
/// concat demuxer and `-c copy`; the partials and the concat list are
/// removed afterwards.
pub async fn merge_parts(
    bin: &str,
    project_dir: &Path,
    parts: Vec<PathBuf>,
    opts: CommandOptions,
) -> Result<PathBuf> {
    let output = project_dir.join(VIDEO_FILE_NAME);

    match parts.len() {
        0 => Err(Error::Infrastructure(format!(
            "No downloaded mp4 parts found in {}",
            project_dir.display()
        ))),
        1 => {
            std::fs::rename(&parts[0], &output)?;
            Ok(output)
        }
        _ => {
            let concat_path = project_dir.join(CONCAT_FILE_NAME);
            std::fs::write(&concat_path, concat_file_body(&parts))?;

            let concat = concat_path.to_string_lossy();
            let out = output.to_string_lossy();
            run_command(
                bin,
                &[
                    "-y", "-f", "concat", "-safe", "0", "-i", &concat, "-c", "copy",
                    "-movflags", "faststart", &out,
                ],
                Some(project_dir),
                opts,
            )
            .await?;

            for part in &parts {
                std::fs::remove_file(part)?;
            }
            std::fs::remove_file(&concat_path)?;
            Ok(output)
        }
    }
}

/// The downloaded poster file, if the thumbnail postprocessor produced one.
pub fn find_poster(project_dir: &Path) -> Result<Option<String>> {
    let poster = std::fs::read_dir(project_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| {
            path.is_file()
                && path
                    .file_stem()
                    .is_some_and(|stem| stem.to_string_lossy() == "poster")
        });
    Ok(poster.and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned())))
}
