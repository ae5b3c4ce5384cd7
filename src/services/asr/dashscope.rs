//! DashScope transcription client
//!
//! Async flow: stage the audio, submit a transcription task, poll until the
//! service reports a terminal status, fetch the result JSON, normalize and
//! render SRT, then remove the staging object whatever the outcome.

use super::normalize::{normalize_transcript, DEFAULT_MAX_CHARS};
use super::oss::OssStorage;
use super::{AsrRequest, FunAsrResult, SpeechRecognizer};
use crate::config::Config;
use crate::logging::TaskLogger;
use crate::services::classify_http_status;
use crate::services::retry::{retry_backoff, RetryPolicy};
use crate::services::subtitles::render_srt;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const STEP: &str = "run_asr";

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    output: SubmitOutput,
}

#[derive(Debug, Deserialize)]
struct SubmitOutput {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    output: PollOutput,
}

#[derive(Debug, Deserialize)]
struct PollOutput {
    task_status: String,
    #[serde(default)]
    results: Vec<TranscriptionResult>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResult {
    #[serde(default)]
    subtask_status: Option<String>,
    #[serde(default)]
    transcription_url: Option<String>,
}

pub struct DashScopeSpeechRecognizer {
    http: reqwest::Client,
    storage: OssStorage,
    base_url: String,
    api_key: String,
    model: String,
    poll_max_attempts: u32,
    poll_interval: Duration,
}

impl DashScopeSpeechRecognizer {
    pub fn from_config(config: &Config) -> Result<Self> {
        let missing = |name: &str| Error::Infrastructure(format!("{name} is not configured"));
        Ok(Self {
            http: reqwest::Client::new(),
            storage: OssStorage::new(
                config.oss_bucket.clone().ok_or_else(|| missing("OSS_BUCKET"))?,
                config.oss_region.clone().ok_or_else(|| missing("OSS_REGION"))?,
                config
                    .oss_access_key_id
                    .clone()
                    .ok_or_else(|| missing("OSS_ACCESS_KEY_ID"))?,
                config
                    .oss_access_key_secret
                    .clone()
                    .ok_or_else(|| missing("OSS_ACCESS_KEY_SECRET"))?,
            ),
            base_url: config
                .dashscope_api_url
                .clone()
                .ok_or_else(|| missing("DASHSCOPE_API_URL"))?,
            api_key: config
                .dashscope_api_key
                .clone()
                .ok_or_else(|| missing("DASHSCOPE_API_KEY"))?,
            model: config.fun_asr_model.clone(),
            poll_max_attempts: config.asr_poll_max_attempts,
            poll_interval: Duration::from_millis(config.asr_poll_interval_ms),
        })
    }

    async fn submit_transcription(&self, file_url: &str) -> Result<String> {
        let response = self
            .http
            .post(format!(
                "{}/services/audio/asr/transcription",
                self.base_url
            ))
            .bearer_auth(&self.api_key)
            .header("X-DashScope-Async", "enable")
            .json(&serde_json::json!({
                "model": self.model,
                "input": { "file_urls": [file_url] },
                "parameters": { "language_hints": ["ja"] },
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_http_status(STEP, status, &detail));
        }

        let submitted: SubmitResponse = response.json().await?;
        Ok(submitted.output.task_id)
    }

    /// Poll until the task reaches a terminal status; bounded attempts with
    /// a fixed sleep between them.
    async fn poll_transcription(&self, task_id: &str, logger: &TaskLogger) -> Result<String> {
        for attempt in 1..=self.poll_max_attempts {
            let response = self
                .http
                .get(format!("{}/tasks/{}", self.base_url, task_id))
                .bearer_auth(&self.api_key)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let detail = response.text().await.unwrap_or_default();
                return Err(classify_http_status(STEP, status, &detail));
            }

            let poll: PollResponse = response.json().await?;
            match poll.output.task_status.as_str() {
                "PENDING" | "RUNNING" => {
                    if attempt % 30 == 0 {
                        logger
                            .debug(&format!(
                                "Transcription still {} (poll {attempt}/{})",
                                poll.output.task_status, self.poll_max_attempts
                            ))
                            .await;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                "SUCCEEDED" => {
                    let result = poll.output.results.first().ok_or_else(|| {
                        Error::pipeline_fatal(STEP, "Transcription succeeded without results")
                    })?;
                    if result.subtask_status.as_deref() != Some("SUCCEEDED") {
                        return Err(Error::pipeline_fatal(
                            STEP,
                            format!(
                                "Transcription subtask failed: {}",
                                result.subtask_status.as_deref().unwrap_or("unknown")
                            ),
                        ));
                    }
                    return result.transcription_url.clone().ok_or_else(|| {
                        Error::pipeline_fatal(STEP, "Transcription result has no URL")
                    });
                }
                // Explicit terminal failure from the service is not retried.
                "FAILED" | "CANCELED" => {
                    return Err(Error::pipeline_fatal(
                        STEP,
                        format!(
                            "Transcription task {}: {}",
                            poll.output.task_status,
                            poll.output.message.unwrap_or_default()
                        ),
                    ));
                }
                other => {
                    return Err(Error::pipeline_fatal(
                        STEP,
                        format!("Unknown transcription task status: {other}"),
                    ));
                }
            }
        }

        Err(Error::pipeline_fatal(
            STEP,
            format!(
                "Transcription did not finish within {} polls",
                self.poll_max_attempts
            ),
        ))
    }

    async fn fetch_result(&self, url: &str) -> Result<serde_json::Value> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(classify_http_status(STEP, status, "transcription fetch"));
        }
        Ok(response.json().await?)
    }

    async fn transcribe(&self, request: &AsrRequest<'_>, logger: &TaskLogger) -> Result<()> {
        let key = format!("asr-staging/{}.opus", request.project_id);

        retry_backoff(RetryPolicy::new(2, 500), || async {
            self.storage
                .ensure_uploaded(&key, request.audio_path)
                .await
                .map_err(|e| e.into_step_error(STEP))
        })
        .await?;

        let file_url = self.storage.public_url(&key);
        logger
            .info(&format!("Submitting transcription task ({})", self.model))
            .await;
        let task_id = self.submit_transcription(&file_url).await?;
        logger
            .info(&format!("Transcription task submitted: {task_id}"))
            .await;

        let transcription_url = self.poll_transcription(&task_id, logger).await?;
        let raw = self.fetch_result(&transcription_url).await?;

        tokio::fs::write(
            request.output_json_path,
            serde_json::to_string_pretty(&raw)?,
        )
        .await?;

        let parsed: FunAsrResult = serde_json::from_value(raw)
            .map_err(|e| Error::pipeline_fatal(STEP, format!("Unexpected result shape: {e}")))?;
        let cues = normalize_transcript(&parsed, 0, DEFAULT_MAX_CHARS)?;
        tokio::fs::write(request.output_srt_path, render_srt(&cues)).await?;

        logger
            .info(&format!("Transcription produced {} cues", cues.len()))
            .await;
        Ok(())
    }
}

#[async_trait]
impl SpeechRecognizer for DashScopeSpeechRecognizer {
    async fn run_asr(&self, request: AsrRequest<'_>, logger: &TaskLogger) -> Result<()> {
        let outcome = self.transcribe(&request, logger).await;

        // Staging cleanup happens on both paths; a cleanup failure is logged
        // but never masks the transcription outcome.
        let key = format!("asr-staging/{}.opus", request.project_id);
        if let Err(e) = self.storage.delete(&key).await {
            logger
                .warn(&format!("Failed to delete staging object {key}: {e}"))
                .await;
        }

        outcome
    }
}
