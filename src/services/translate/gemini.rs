//! Gemini translation client
//!
//! Uploads the audio once (deterministic display name, re-uploaded only
//! when absent), then runs a multi-turn generateContent conversation: the
//! fixed system instruction, the SRT with optional program context, and a
//! continuation prompt whenever the model stops on MAX_TOKENS, up to a
//! bounded number of continuations. Token usage accumulates across turns
//! and is priced per model, converted to TWD.

use super::{SubtitleTranslator, TranslateRequest, TranslationResult};
use crate::config::Config;
use crate::logging::TaskLogger;
use crate::services::classify_http_status;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

const STEP: &str = "translate_subtitles";
const BASE_URL: &str = "https://generativelanguage.googleapis.com";
const MAX_CONTINUATIONS: u32 = 10;
const AUDIO_MIME_TYPE: &str = "audio/ogg";

/// USD per 1M tokens: (input, cache hit, output).
const PRICING: [(&str, f64, f64, f64); 2] = [
    ("gemini-3-flash-preview", 0.50, 0.10, 3.00),
    ("gemini-3-pro-preview", 2.00, 0.20, 12.00),
];

const TRANSLATION_INSTRUCTION: &str = r#"You are an expert subtitle translator and localizer specializing in Japanese Variety Shows and Owarai (Comedy). Your goal is to convert Japanese content (SRT text + Audio) into natural, high-quality Traditional Chinese (Taiwan) subtitles.

1. CONTEXT & AUDIO INTEGRATION: internally analyze the provided audio and program description to guide the translation; do not output this analysis. Use the audio to confirm speaker identity, tone and timing; use the description to standardize proper nouns before generating the SRT.

2. CORE TRANSLATION: target Traditional Chinese (Taiwan). Use natural, spoken Taiwanese Mandarin suitable for variety shows; translate tsukkomi retorts with punchy phrasing; use sentence-ending particles naturally.

3. EXPLANATIONS: add concise full-width parenthetical notes only when a joke relies on a Japanese pun or obscure culture.

4. NON-DIALOGUE: if a subtitle entry consists only of descriptive sounds or scene descriptions, delete the text content but keep the timecode block.

5. OUTPUT FORMATTING: output the raw SRT text strictly, with no conversational filler. Never alter index numbers or timecodes. If the output stops due to token limits, stop exactly at the last complete line; when the user asks to continue, resume immediately from the next line without repeating anything.

You must output ONLY the localized Traditional Chinese SRT."#;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: ContentBody,
    contents: Vec<Content>,
    safety_settings: Vec<SafetySetting>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Serialize)]
struct ContentBody {
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
enum Part {
    #[serde(rename = "text")]
    Text(String),
    #[serde(rename = "fileData", rename_all = "camelCase")]
    FileData { file_uri: String, mime_type: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

fn safety_off() -> Vec<SafetySetting> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .into_iter()
    .map(|category| SafetySetting {
        category,
        threshold: "BLOCK_NONE",
    })
    .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    thinking_config: ThinkingConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_level: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i64,
    #[serde(default)]
    cached_content_token_count: i64,
    #[serde(default)]
    candidates_token_count: i64,
    #[serde(default)]
    thoughts_token_count: i64,
}

#[derive(Debug, Deserialize)]
struct FileListResponse {
    #[serde(default)]
    files: Vec<FileInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileInfo {
    #[serde(default)]
    display_name: Option<String>,
    uri: String,
}

#[derive(Debug, Deserialize)]
struct FileUploadResponse {
    file: FileInfo,
}

/// Accumulated USD cost in TWD for one response's usage.
fn response_cost_twd(model: &str, usage: &UsageMetadata, usd_to_twd: f64) -> f64 {
    let Some((_, input_rate, cache_rate, output_rate)) =
        PRICING.iter().find(|(name, ..)| *name == model)
    else {
        tracing::warn!(model, "No pricing entry for model; cost recorded as 0");
        return 0.0;
    };

    // prompt_token_count includes the cached tokens.
    let fresh_input = (usage.prompt_token_count - usage.cached_content_token_count).max(0);
    let usd = (fresh_input as f64 / 1e6) * input_rate
        + (usage.cached_content_token_count as f64 / 1e6) * cache_rate
        + (usage.candidates_token_count as f64 / 1e6) * output_rate
        + (usage.thoughts_token_count as f64 / 1e6) * output_rate;
    usd * usd_to_twd
}

pub struct GeminiSubtitleTranslator {
    http: reqwest::Client,
    api_key: String,
    model: String,
    continuation_prompt: String,
    usd_to_twd: f64,
}

impl GeminiSubtitleTranslator {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            api_key: config
                .gemini_api_key
                .clone()
                .ok_or_else(|| Error::Infrastructure("GEMINI_API_KEY is not configured".into()))?,
            model: config.gemini_model.clone(),
            continuation_prompt: config.translate_continuation_prompt.clone(),
            usd_to_twd: config.usd_to_twd_rate,
        })
    }

    /// Deterministic display name so a re-run finds the previous upload.
    fn storage_name(&self, project_id: &uuid::Uuid) -> String {
        let mut hasher = Sha256::new();
        hasher.update(project_id.as_bytes());
        hasher.update(self.model.as_bytes());
        hasher.update(self.api_key.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    async fn find_uploaded(&self, display_name: &str) -> Result<Option<String>> {
        let response = self
            .http
            .get(format!("{BASE_URL}/v1beta/files"))
            .query(&[("key", self.api_key.as_str()), ("pageSize", "100")])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_http_status(STEP, status, &detail));
        }

        let listing: FileListResponse = response.json().await?;
        Ok(listing
            .files
            .into_iter()
            .find(|f| f.display_name.as_deref() == Some(display_name))
            .map(|f| f.uri))
    }

    /// Resumable upload in two requests: start (metadata) then upload+finalize.
    async fn upload_audio(&self, display_name: &str, path: &Path) -> Result<String> {
        let body = tokio::fs::read(path).await?;

        let start = self
            .http
            .post(format!("{BASE_URL}/upload/v1beta/files"))
            .query(&[("key", self.api_key.as_str())])
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", body.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", AUDIO_MIME_TYPE)
            .json(&serde_json::json!({ "file": { "display_name": display_name } }))
            .send()
            .await?;

        if !start.status().is_success() {
            let status = start.status();
            let detail = start.text().await.unwrap_or_default();
            return Err(classify_http_status(STEP, status, &detail));
        }

        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::pipeline_fatal(STEP, "Upload session has no upload URL"))?
            .to_string();

        let finish = self
            .http
            .post(&upload_url)
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header("X-Goog-Upload-Offset", "0")
            .body(body)
            .send()
            .await?;

        if !finish.status().is_success() {
            let status = finish.status();
            let detail = finish.text().await.unwrap_or_default();
            return Err(classify_http_status(STEP, status, &detail));
        }

        let uploaded: FileUploadResponse = finish.json().await?;
        Ok(uploaded.file.uri)
    }

    async fn ensure_audio(&self, request: &TranslateRequest<'_>, logger: &TaskLogger) -> Result<String> {
        let name = self.storage_name(&request.project_id);
        if let Some(uri) = self.find_uploaded(&name).await? {
            logger.debug("Audio already uploaded to Gemini storage").await;
            return Ok(uri);
        }
        logger.info("Uploading audio for translation context").await;
        self.upload_audio(&name, request.audio_path).await
    }

    async fn generate(&self, contents: &[Content]) -> Result<GenerateResponse> {
        let request = GenerateRequest {
            system_instruction: ContentBody {
                parts: vec![Part::Text(TRANSLATION_INSTRUCTION.to_string())],
            },
            contents: contents.to_vec(),
            safety_settings: safety_off(),
            generation_config: GenerationConfig {
                thinking_config: ThinkingConfig {
                    thinking_level: "HIGH",
                },
            },
        };

        let response = self
            .http
            .post(format!(
                "{BASE_URL}/v1beta/models/{}:generateContent",
                self.model
            ))
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_http_status(STEP, status, &detail));
        }

        Ok(response.json().await?)
    }

    fn user_message(translation_hint: Option<&str>, srt_text: &str) -> String {
        let mut message = String::from("請根據所附資料，將以下 SRT 文本翻譯為繁體中文。");
        if let Some(hint) = translation_hint {
            message.push_str(&format!("\n節目介紹: {hint}"));
        }
        message.push_str(&format!("\nSRT 文本:\n---\n{srt_text}"));
        message
    }
}

fn candidate_text(response: &GenerateResponse) -> String {
    response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn finish_reason(response: &GenerateResponse) -> Result<&str> {
    response
        .candidates
        .first()
        .and_then(|c| c.finish_reason.as_deref())
        .ok_or_else(|| Error::pipeline_fatal(STEP, "No candidates in translation response"))
}

#[async_trait]
impl SubtitleTranslator for GeminiSubtitleTranslator {
    async fn run_translate(
        &self,
        request: TranslateRequest<'_>,
        logger: &TaskLogger,
    ) -> Result<TranslationResult> {
        let file_uri = self.ensure_audio(&request, logger).await?;
        let srt_text = tokio::fs::read_to_string(request.asr_srt_path).await?;
        let message = Self::user_message(request.translation_hint, &srt_text);

        let mut contents = vec![Content {
            role: "user".into(),
            parts: vec![
                Part::FileData {
                    file_uri,
                    mime_type: AUDIO_MIME_TYPE.into(),
                },
                Part::Text(message),
            ],
        }];

        logger
            .info(&format!(
                "Requesting translation from {} (long audio may take a while)",
                self.model
            ))
            .await;

        let mut translated = String::new();
        let mut input_tokens = 0i64;
        let mut output_tokens = 0i64;
        let mut total_cost_twd = 0.0f64;
        let mut continuations = 0u32;

        loop {
            let response = self.generate(&contents).await?;

            if let Some(usage) = &response.usage_metadata {
                input_tokens += usage.prompt_token_count;
                output_tokens += usage.candidates_token_count + usage.thoughts_token_count;
                total_cost_twd += response_cost_twd(&self.model, usage, self.usd_to_twd);
            }

            let chunk = candidate_text(&response);
            if !translated.is_empty() {
                translated.push_str("\n<BREAK>\n");
            }
            translated.push_str(&chunk);

            match finish_reason(&response)? {
                "STOP" => break,
                "MAX_TOKENS" => {
                    continuations += 1;
                    if continuations > MAX_CONTINUATIONS {
                        return Err(Error::pipeline_fatal(
                            STEP,
                            format!("Exceeded maximum continuations ({MAX_CONTINUATIONS})"),
                        ));
                    }
                    logger
                        .info(&format!(
                            "Response truncated, requesting continuation ({continuations}/{MAX_CONTINUATIONS})"
                        ))
                        .await;
                    contents.push(Content {
                        role: "model".into(),
                        parts: vec![Part::Text(chunk)],
                    });
                    contents.push(Content {
                        role: "user".into(),
                        parts: vec![Part::Text(self.continuation_prompt.clone())],
                    });
                }
                other => {
                    return Err(Error::pipeline_fatal(
                        STEP,
                        format!("Unexpected finish reason: {other}"),
                    ));
                }
            }
        }

        tokio::fs::write(request.output_srt_path, &translated).await?;
        logger
            .info(&format!(
                "Translation finished with {continuations} continuations ({input_tokens} in / {output_tokens} out tokens)"
            ))
            .await;

        Ok(TranslationResult {
            llm_provider: "gemini".into(),
            llm_model: self.model.clone(),
            input_tokens,
            output_tokens,
            total_cost_twd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_uses_per_model_rates_and_twd_conversion() {
        let usage = UsageMetadata {
            prompt_token_count: 1_000_000,
            cached_content_token_count: 0,
            candidates_token_count: 1_000_000,
            thoughts_token_count: 0,
        };
        // 2.00 input + 12.00 output = 14 USD, at 32 TWD/USD.
        let twd = response_cost_twd("gemini-3-pro-preview", &usage, 32.0);
        assert!((twd - 14.0 * 32.0).abs() < 1e-6, "{twd}");
    }

    #[test]
    fn cached_tokens_are_priced_separately() {
        let usage = UsageMetadata {
            prompt_token_count: 1_000_000,
            cached_content_token_count: 1_000_000,
            candidates_token_count: 0,
            thoughts_token_count: 0,
        };
        // All input was cached: 0.20 USD at the cache rate.
        let twd = response_cost_twd("gemini-3-pro-preview", &usage, 32.0);
        assert!((twd - 0.20 * 32.0).abs() < 1e-6, "{twd}");
    }

    #[test]
    fn unknown_model_costs_zero() {
        let usage = UsageMetadata {
            prompt_token_count: 500,
            ..UsageMetadata::default()
        };
        assert_eq!(response_cost_twd("someone-elses-model", &usage, 32.0), 0.0);
    }

    #[test]
    fn user_message_includes_hint_when_present() {
        let with_hint = GeminiSubtitleTranslator::user_message(Some("漫才番組"), "1\n...");
        assert!(with_hint.contains("節目介紹: 漫才番組"));

        let without = GeminiSubtitleTranslator::user_message(None, "1\n...");
        assert!(!without.contains("節目介紹"));
        assert!(without.contains("SRT 文本"));
    }
}
