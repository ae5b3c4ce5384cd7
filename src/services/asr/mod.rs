//! Speech recognition providers
//!
//! The pipeline talks to a [`SpeechRecognizer`]; mock mode writes a fixed
//! transcript, live mode drives the DashScope transcription service with
//! OSS staging for the audio upload.

pub mod dashscope;
mod normalize;
pub mod oss;

pub use dashscope::DashScopeSpeechRecognizer;
pub use normalize::{normalize_transcript, FunAsrResult};

use crate::logging::TaskLogger;
use crate::services::subtitles::{render_srt, SubtitleCue};
use crate::Result;
use async_trait::async_trait;
use std::path::Path;
use uuid::Uuid;

pub struct AsrRequest<'a> {
    pub project_id: Uuid,
    pub audio_path: &'a Path,
    pub output_json_path: &'a Path,
    pub output_srt_path: &'a Path,
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe the audio; both output files exist on success.
    async fn run_asr(&self, request: AsrRequest<'_>, logger: &TaskLogger) -> Result<()>;
}

/// Deterministic placeholder transcription for mock mode.
pub struct MockSpeechRecognizer;

#[async_trait]
impl SpeechRecognizer for MockSpeechRecognizer {
    async fn run_asr(&self, request: AsrRequest<'_>, logger: &TaskLogger) -> Result<()> {
        logger.info("Writing placeholder transcription").await;

        let cues = vec![
            SubtitleCue {
                begin_ms: 0,
                end_ms: 2000,
                text: "こんにちは".into(),
            },
            SubtitleCue {
                begin_ms: 2000,
                end_ms: 4000,
                text: "今日はいい天気ですね".into(),
            },
        ];

        let transcript = serde_json::json!({
            "transcripts": [{
                "channel_id": 0,
                "text": cues.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join(""),
                "sentences": cues.iter().map(|c| serde_json::json!({
                    "begin_time": c.begin_ms,
                    "end_time": c.end_ms,
                    "text": c.text,
                    "words": [],
                })).collect::<Vec<_>>(),
            }],
        });

        tokio::fs::write(
            request.output_json_path,
            serde_json::to_string_pretty(&transcript)?,
        )
        .await?;
        tokio::fs::write(request.output_srt_path, render_srt(&cues)).await?;
        Ok(())
    }
}
