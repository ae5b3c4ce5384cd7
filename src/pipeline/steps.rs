//! Pipeline step definitions and bodies
//!
//! Seven steps in fixed order. Each has a stable id, the progress percent
//! and task message applied when entering it, and the project status it
//! implies. Step bodies return a typed output that is persisted with the
//! checkpoint and read back by `finalize_project` on resume.

use crate::config::{Config, PipelineMode};
use crate::db::{ProjectPatch, Store};
use crate::logging::TaskLogger;
use crate::models::{Project, ProjectStatus, TaskStepState};
use crate::services::asr::{AsrRequest, SpeechRecognizer};
use crate::services::command::{CancelHook, CommandOptions, LineHook};
use crate::services::retry::{retry_backoff, RetryPolicy};
use crate::services::subtitles::srt_to_vtt;
use crate::services::translate::{SubtitleTranslator, TranslateRequest, TranslationResult};
use crate::services::{ffmpeg, ytdlp};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepId {
    FetchMetadata,
    DownloadVideo,
    ExtractAudio,
    RunAsr,
    TranslateSubtitles,
    BuildVtt,
    FinalizeProject,
}

impl StepId {
    pub const ALL: [StepId; 7] = [
        StepId::FetchMetadata,
        StepId::DownloadVideo,
        StepId::ExtractAudio,
        StepId::RunAsr,
        StepId::TranslateSubtitles,
        StepId::BuildVtt,
        StepId::FinalizeProject,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            StepId::FetchMetadata => "fetch_metadata",
            StepId::DownloadVideo => "download_video",
            StepId::ExtractAudio => "extract_audio",
            StepId::RunAsr => "run_asr",
            StepId::TranslateSubtitles => "translate_subtitles",
            StepId::BuildVtt => "build_vtt",
            StepId::FinalizeProject => "finalize_project",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            StepId::FetchMetadata => "Fetching video metadata",
            StepId::DownloadVideo => "Downloading video",
            StepId::ExtractAudio => "Extracting audio",
            StepId::RunAsr => "Transcribing audio",
            StepId::TranslateSubtitles => "Translating subtitles",
            StepId::BuildVtt => "Building subtitle file",
            StepId::FinalizeProject => "Finalizing project",
        }
    }

    /// Task progress percent on entering the step.
    pub fn percent(&self) -> i64 {
        match self {
            StepId::FetchMetadata => 10,
            StepId::DownloadVideo => 25,
            StepId::ExtractAudio => 40,
            StepId::RunAsr => 55,
            StepId::TranslateSubtitles => 75,
            StepId::BuildVtt => 88,
            StepId::FinalizeProject => 95,
        }
    }

    pub fn project_status(&self) -> ProjectStatus {
        match self {
            StepId::FetchMetadata | StepId::DownloadVideo => ProjectStatus::Downloading,
            StepId::ExtractAudio | StepId::RunAsr => ProjectStatus::Asr,
            StepId::TranslateSubtitles | StepId::BuildVtt | StepId::FinalizeProject => {
                ProjectStatus::Translating
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchMetadataOutput {
    pub title: String,
    pub thumbnail_url: Option<String>,
    pub source_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadVideoOutput {
    pub media_path: String,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractAudioOutput {
    pub audio_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAsrOutput {
    pub asr_json_path: String,
    pub asr_srt_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateSubtitlesOutput {
    pub translation: TranslationResult,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildVttOutput {
    pub subtitle_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeProjectOutput {
    pub media_path: String,
    pub subtitle_path: String,
}

/// Everything a step body needs: ids, canonical paths, the checkpoint map
/// and the process-scope collaborators.
pub struct StepContext {
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub project: Project,
    pub store: Store,
    pub config: Arc<Config>,
    pub asr: Arc<dyn SpeechRecognizer>,
    pub translator: Arc<dyn SubtitleTranslator>,
    pub project_dir: PathBuf,
    pub source_url: String,
    pub video_path: PathBuf,
    pub audio_path: PathBuf,
    pub metadata_path: PathBuf,
    pub asr_json_path: PathBuf,
    pub asr_srt_path: PathBuf,
    pub asr_vtt_path: PathBuf,
    pub translated_srt_path: PathBuf,
    pub translated_vtt_path: PathBuf,
    pub states: HashMap<String, TaskStepState>,
}

impl StepContext {
    /// Path under the media root, as stored on the project row.
    pub fn rel(&self, file_name: &str) -> String {
        format!("{}/{}", self.project_id, file_name)
    }

    fn stdout_hook(&self, logger: &TaskLogger) -> LineHook {
        let logger = logger.clone();
        Box::new(move |line| {
            let logger = logger.clone();
            Box::pin(async move {
                logger.trace(&line).await;
            })
        })
    }

    fn stderr_hook(&self, logger: &TaskLogger) -> LineHook {
        let logger = logger.clone();
        Box::new(move |line| {
            let logger = logger.clone();
            Box::pin(async move {
                logger.debug(&line).await;
            })
        })
    }

    fn cancel_hook(&self) -> CancelHook {
        let store = self.store.clone();
        let task_id = self.task_id;
        Box::new(move || {
            let store = store.clone();
            Box::pin(async move {
                store
                    .is_task_cancel_requested(task_id)
                    .await
                    .unwrap_or(false)
            })
        })
    }

    /// Supervisor options wired to the step logger and the store-backed
    /// cancellation predicate.
    pub fn command_options(&self, logger: &TaskLogger) -> CommandOptions {
        CommandOptions {
            on_stdout_line: Some(self.stdout_hook(logger)),
            on_stderr_line: Some(self.stderr_hook(logger)),
            should_cancel: Some(self.cancel_hook()),
        }
    }
}

/// Keep cancellation intact; classify everything else as a retryable
/// failure of `step` so the in-step backoff applies.
fn classify_transient(step: StepId, err: Error) -> Error {
    match err {
        Error::Canceled(_) => err,
        Error::Pipeline { .. } => err.into_step_error(step.id()),
        other => Error::pipeline_retryable(step.id(), other.to_string()),
    }
}

/// Decode a completed checkpoint's output. A missing or corrupted blob is
/// reported as a non-retryable failure naming the step it belongs to.
fn decode_output<T: DeserializeOwned>(cx: &StepContext, step: StepId) -> Result<T> {
    let state = cx.states.get(step.id()).ok_or_else(|| {
        Error::pipeline_fatal(
            StepId::FinalizeProject.id(),
            format!("Missing checkpoint for step {}", step.id()),
        )
    })?;
    let output_json = state.output_json.as_deref().ok_or_else(|| {
        Error::pipeline_fatal(
            StepId::FinalizeProject.id(),
            format!("Checkpoint for step {} has no output", step.id()),
        )
    })?;
    serde_json::from_str(output_json).map_err(|e| {
        Error::pipeline_fatal(
            StepId::FinalizeProject.id(),
            format!("Corrupted checkpoint output for step {}: {e}", step.id()),
        )
    })
}

/// Run one step body; the returned value is persisted as the checkpoint
/// output.
pub async fn run_step(
    step: StepId,
    cx: &StepContext,
    logger: &TaskLogger,
) -> Result<serde_json::Value> {
    match step {
        StepId::FetchMetadata => fetch_metadata(cx, logger).await,
        StepId::DownloadVideo => download_video(cx, logger).await,
        StepId::ExtractAudio => extract_audio(cx, logger).await,
        StepId::RunAsr => run_asr(cx, logger).await,
        StepId::TranslateSubtitles => translate_subtitles(cx, logger).await,
        StepId::BuildVtt => build_vtt(cx).await,
        StepId::FinalizeProject => finalize_project(cx, logger).await,
    }
}

async fn fetch_metadata(cx: &StepContext, logger: &TaskLogger) -> Result<serde_json::Value> {
    let step = StepId::FetchMetadata;

    let (title, thumbnail_url, raw) = match cx.config.pipeline_mode {
        PipelineMode::Mock => {
            let title = cx.project.source_video_id.clone();
            let raw = serde_json::json!({
                "id": cx.project.source_video_id,
                "title": title,
            });
            (title, None, raw)
        }
        PipelineMode::Live => {
            let metadata = retry_backoff(RetryPolicy::new(2, 500), || async {
                ytdlp::fetch_metadata(
                    &cx.config.yt_dlp_bin,
                    &cx.source_url,
                    &cx.project_dir,
                    cx.command_options(logger),
                )
                .await
                .map_err(|e| classify_transient(step, e))
            })
            .await?;
            (metadata.title, metadata.thumbnail_url, metadata.raw)
        }
    };

    tokio::fs::write(&cx.metadata_path, serde_json::to_string_pretty(&raw)?).await?;

    cx.store
        .update_project_from_pipeline(
            cx.project_id,
            ProjectPatch {
                status: Some(ProjectStatus::Downloading),
                title: Some(title.clone()),
                thumbnail_url: thumbnail_url.clone(),
                source_url: Some(cx.source_url.clone()),
                ..ProjectPatch::default()
            },
        )
        .await?;

    logger.info(&format!("Resolved title: {title}")).await;

    Ok(serde_json::to_value(FetchMetadataOutput {
        title,
        thumbnail_url,
        source_url: cx.source_url.clone(),
    })?)
}

async fn download_video(cx: &StepContext, logger: &TaskLogger) -> Result<serde_json::Value> {
    let step = StepId::DownloadVideo;

    let thumbnail_url = match cx.config.pipeline_mode {
        PipelineMode::Mock => {
            tokio::fs::write(&cx.video_path, format!("mock video {}", cx.project_id)).await?;
            None
        }
        PipelineMode::Live => {
            retry_backoff(RetryPolicy::new(2, 1000), || async {
                ytdlp::download(
                    &cx.config.yt_dlp_bin,
                    &cx.source_url,
                    &cx.project_dir,
                    cx.command_options(logger),
                )
                .await
                .map_err(|e| classify_transient(step, e))
            })
            .await?;

            let parts = ffmpeg::list_downloaded_parts(&cx.project_dir)?;
            logger
                .info(&format!("Combining {} downloaded part(s)", parts.len()))
                .await;
            ffmpeg::merge_parts(
                &cx.config.ffmpeg_bin,
                &cx.project_dir,
                parts,
                cx.command_options(logger),
            )
            .await?;

            ffmpeg::find_poster(&cx.project_dir)?.map(|poster| cx.rel(&poster))
        }
    };

    Ok(serde_json::to_value(DownloadVideoOutput {
        media_path: cx.rel(ffmpeg::VIDEO_FILE_NAME),
        thumbnail_url,
    })?)
}

async fn extract_audio(cx: &StepContext, logger: &TaskLogger) -> Result<serde_json::Value> {
    let step = StepId::ExtractAudio;

    match cx.config.pipeline_mode {
        PipelineMode::Mock => {
            tokio::fs::write(&cx.audio_path, format!("mock audio {}", cx.project_id)).await?;
        }
        PipelineMode::Live => {
            retry_backoff(RetryPolicy::new(2, 800), || async {
                ffmpeg::extract_audio(
                    &cx.config.ffmpeg_bin,
                    &cx.video_path,
                    &cx.audio_path,
                    &cx.project_dir,
                    cx.command_options(logger),
                )
                .await
                .map_err(|e| classify_transient(step, e))
            })
            .await?;
        }
    }

    Ok(serde_json::to_value(ExtractAudioOutput {
        audio_path: cx.rel(ffmpeg::AUDIO_FILE_NAME),
    })?)
}

async fn run_asr(cx: &StepContext, logger: &TaskLogger) -> Result<serde_json::Value> {
    cx.asr
        .run_asr(
            AsrRequest {
                project_id: cx.project_id,
                audio_path: &cx.audio_path,
                output_json_path: &cx.asr_json_path,
                output_srt_path: &cx.asr_srt_path,
            },
            logger,
        )
        .await?;

    // The raw transcript gets a VTT rendition for in-browser preview.
    let srt = tokio::fs::read_to_string(&cx.asr_srt_path).await?;
    tokio::fs::write(&cx.asr_vtt_path, srt_to_vtt(&srt)).await?;

    cx.store
        .update_project_from_pipeline(
            cx.project_id,
            ProjectPatch {
                asr_vtt_path: Some(cx.rel("asr.vtt")),
                ..ProjectPatch::default()
            },
        )
        .await?;

    Ok(serde_json::to_value(RunAsrOutput {
        asr_json_path: cx.rel("asr.json"),
        asr_srt_path: cx.rel("asr.srt"),
    })?)
}

async fn translate_subtitles(cx: &StepContext, logger: &TaskLogger) -> Result<serde_json::Value> {
    let translation = cx
        .translator
        .run_translate(
            TranslateRequest {
                project_id: cx.project_id,
                asr_srt_path: &cx.asr_srt_path,
                audio_path: &cx.audio_path,
                output_srt_path: &cx.translated_srt_path,
                translation_hint: cx.project.translation_hint.as_deref(),
            },
            logger,
        )
        .await?;

    cx.store
        .update_project_from_pipeline(
            cx.project_id,
            ProjectPatch {
                status: Some(ProjectStatus::Translating),
                llm_cost_twd: Some(translation.total_cost_twd),
                llm_provider: Some(translation.llm_provider.clone()),
                llm_model: Some(translation.llm_model.clone()),
                input_tokens: Some(translation.input_tokens),
                output_tokens: Some(translation.output_tokens),
                ..ProjectPatch::default()
            },
        )
        .await?;

    Ok(serde_json::to_value(TranslateSubtitlesOutput {
        translation,
    })?)
}

async fn build_vtt(cx: &StepContext) -> Result<serde_json::Value> {
    let srt = tokio::fs::read_to_string(&cx.translated_srt_path).await?;
    tokio::fs::write(&cx.translated_vtt_path, srt_to_vtt(&srt)).await?;

    Ok(serde_json::to_value(BuildVttOutput {
        subtitle_path: cx.rel("video.vtt"),
    })?)
}

async fn finalize_project(cx: &StepContext, logger: &TaskLogger) -> Result<serde_json::Value> {
    let metadata: FetchMetadataOutput = decode_output(cx, StepId::FetchMetadata)?;
    let download: DownloadVideoOutput = decode_output(cx, StepId::DownloadVideo)?;
    let translated: TranslateSubtitlesOutput = decode_output(cx, StepId::TranslateSubtitles)?;

    let subtitle_path = cx.rel("video.vtt");
    let translation = translated.translation;

    cx.store
        .update_project_from_pipeline(
            cx.project_id,
            ProjectPatch {
                status: Some(ProjectStatus::Completed),
                title: Some(metadata.title),
                source_url: Some(metadata.source_url),
                thumbnail_url: download.thumbnail_url.or(metadata.thumbnail_url),
                media_path: Some(download.media_path.clone()),
                subtitle_path: Some(subtitle_path.clone()),
                llm_cost_twd: Some(translation.total_cost_twd),
                llm_provider: Some(translation.llm_provider),
                llm_model: Some(translation.llm_model),
                input_tokens: Some(translation.input_tokens),
                output_tokens: Some(translation.output_tokens),
                ..ProjectPatch::default()
            },
        )
        .await?;

    logger.info("Project outputs published").await;

    Ok(serde_json::to_value(FinalizeProjectOutput {
        media_path: download.media_path,
        subtitle_path,
    })?)
}
