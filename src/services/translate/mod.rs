//! Subtitle translation providers

pub mod gemini;

pub use gemini::GeminiSubtitleTranslator;

use crate::logging::TaskLogger;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

pub struct TranslateRequest<'a> {
    pub project_id: Uuid,
    pub asr_srt_path: &'a Path,
    pub audio_path: &'a Path,
    pub output_srt_path: &'a Path,
    pub translation_hint: Option<&'a str>,
}

/// Usage and cost record for one translation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranslationResult {
    pub llm_provider: String,
    pub llm_model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost_twd: f64,
}

impl TranslationResult {
    pub fn zero(provider: &str, model: &str) -> Self {
        Self {
            llm_provider: provider.to_string(),
            llm_model: model.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            total_cost_twd: 0.0,
        }
    }
}

#[async_trait]
pub trait SubtitleTranslator: Send + Sync {
    /// Translate the ASR SRT into the target SRT, returning usage and cost.
    async fn run_translate(
        &self,
        request: TranslateRequest<'_>,
        logger: &TaskLogger,
    ) -> Result<TranslationResult>;
}

/// Mock translator: copies the SRT, substituting each cue text with a
/// marked placeholder, and reports zero usage.
pub struct MockSubtitleTranslator;

#[async_trait]
impl SubtitleTranslator for MockSubtitleTranslator {
    async fn run_translate(
        &self,
        request: TranslateRequest<'_>,
        logger: &TaskLogger,
    ) -> Result<TranslationResult> {
        logger.info("Writing placeholder translation").await;

        let srt = tokio::fs::read_to_string(request.asr_srt_path).await?;
        let translated: String = srt
            .replace("\r\n", "\n")
            .lines()
            .map(|line| {
                let trimmed = line.trim();
                let is_index = !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit());
                let is_timing = trimmed.contains("-->");
                if trimmed.is_empty() || is_index || is_timing {
                    line.to_string()
                } else {
                    format!("譯: {line}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n");

        tokio::fs::write(request.output_srt_path, translated).await?;
        Ok(TranslationResult::zero("mock", "mock"))
    }
}
