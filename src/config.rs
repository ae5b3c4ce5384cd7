//! Process-wide configuration
//!
//! All options come from the environment. Mock mode needs nothing beyond the
//! defaults; live mode validates its credential set up front and fails with
//! a single error listing every missing name.

use crate::{Error, Result};
use std::path::PathBuf;

/// Which provider adapters the pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Deterministic local placeholders; no network, no external binaries.
    Mock,
    /// Real yt-dlp/ffmpeg plus the DashScope and Gemini services.
    Live,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub pipeline_mode: PipelineMode,

    /// Executable names resolved on PATH.
    pub yt_dlp_bin: String,
    pub ffmpeg_bin: String,

    /// ASR (DashScope paraformer transcription).
    pub dashscope_api_url: Option<String>,
    pub dashscope_api_key: Option<String>,
    pub fun_asr_model: String,
    pub asr_poll_max_attempts: u32,
    pub asr_poll_interval_ms: u64,

    /// Staging bucket the ASR service reads the audio from.
    pub oss_region: Option<String>,
    pub oss_bucket: Option<String>,
    pub oss_access_key_id: Option<String>,
    pub oss_access_key_secret: Option<String>,

    /// Translation (Gemini).
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub translate_continuation_prompt: String,
    pub usd_to_twd_rate: f64,

    pub sqlite_db_path: PathBuf,
    pub projects_dir: PathBuf,
    pub bind_addr: String,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let pipeline_mode = match env_or("PIPELINE_MODE", "mock").as_str() {
            "mock" => PipelineMode::Mock,
            "live" => PipelineMode::Live,
            other => {
                return Err(Error::Infrastructure(format!(
                    "Unrecognized PIPELINE_MODE: {other} (expected mock or live)"
                )))
            }
        };

        let asr_poll_max_attempts = env_or("ASR_POLL_MAX_ATTEMPTS", "600")
            .parse()
            .map_err(|_| Error::Infrastructure("ASR_POLL_MAX_ATTEMPTS must be an integer".into()))?;
        let asr_poll_interval_ms = env_or("ASR_POLL_INTERVAL_MS", "2000")
            .parse()
            .map_err(|_| Error::Infrastructure("ASR_POLL_INTERVAL_MS must be an integer".into()))?;
        let usd_to_twd_rate = env_or("USD_TO_TWD_RATE", "32")
            .parse()
            .map_err(|_| Error::Infrastructure("USD_TO_TWD_RATE must be a number".into()))?;

        let config = Self {
            pipeline_mode,
            yt_dlp_bin: env_or("YT_DLP_BIN", "yt-dlp"),
            ffmpeg_bin: env_or("FFMPEG_BIN", "ffmpeg"),
            dashscope_api_url: env_opt("DASHSCOPE_API_URL"),
            dashscope_api_key: env_opt("DASHSCOPE_API_KEY"),
            fun_asr_model: env_or("FUN_ASR_MODEL", "fun-asr-2025-11-07"),
            asr_poll_max_attempts,
            asr_poll_interval_ms,
            oss_region: env_opt("OSS_REGION"),
            oss_bucket: env_opt("OSS_BUCKET"),
            oss_access_key_id: env_opt("OSS_ACCESS_KEY_ID"),
            oss_access_key_secret: env_opt("OSS_ACCESS_KEY_SECRET"),
            gemini_api_key: env_opt("GEMINI_API_KEY"),
            gemini_model: env_or("GEMINI_MODEL", "gemini-3-pro-preview"),
            translate_continuation_prompt: env_or("TRANSLATE_CONTINUATION_PROMPT", "繼續"),
            usd_to_twd_rate,
            sqlite_db_path: PathBuf::from(env_or("SQLITE_DB_PATH", "data/grillmaster.db")),
            projects_dir: PathBuf::from(env_or("PROJECTS_DIR", "projects")),
            bind_addr: env_or("BIND_ADDR", "127.0.0.1:5730"),
        };

        if config.pipeline_mode == PipelineMode::Live {
            config.require_live_credentials()?;
        }

        Ok(config)
    }

    /// Verify every credential live mode depends on is present.
    pub fn require_live_credentials(&self) -> Result<()> {
        let required: [(&str, bool); 7] = [
            ("DASHSCOPE_API_URL", self.dashscope_api_url.is_some()),
            ("DASHSCOPE_API_KEY", self.dashscope_api_key.is_some()),
            ("OSS_REGION", self.oss_region.is_some()),
            ("OSS_BUCKET", self.oss_bucket.is_some()),
            ("OSS_ACCESS_KEY_ID", self.oss_access_key_id.is_some()),
            ("OSS_ACCESS_KEY_SECRET", self.oss_access_key_secret.is_some()),
            ("GEMINI_API_KEY", self.gemini_api_key.is_some()),
        ];

        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, present)| !present)
            .map(|(name, _)| *name)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Infrastructure(format!(
                "PIPELINE_MODE=live requires: {}",
                missing.join(", ")
            )))
        }
    }

    /// Directory holding a single project's working files.
    pub fn project_dir(&self, project_id: &uuid::Uuid) -> PathBuf {
        self.projects_dir.join(project_id.to_string())
    }
}

impl Default for Config {
    /// Mock-mode defaults; used by tests that do not touch the environment.
    fn default() -> Self {
        Self {
            pipeline_mode: PipelineMode::Mock,
            yt_dlp_bin: "yt-dlp".into(),
            ffmpeg_bin: "ffmpeg".into(),
            dashscope_api_url: None,
            dashscope_api_key: None,
            fun_asr_model: "fun-asr-2025-11-07".into(),
            asr_poll_max_attempts: 600,
            asr_poll_interval_ms: 2000,
            oss_region: None,
            oss_bucket: None,
            oss_access_key_id: None,
            oss_access_key_secret: None,
            gemini_api_key: None,
            gemini_model: "gemini-3-pro-preview".into(),
            translate_continuation_prompt: "繼續".into(),
            usd_to_twd_rate: 32.0,
            sqlite_db_path: PathBuf::from("data/grillmaster.db"),
            projects_dir: PathBuf::from("projects"),
            bind_addr: "127.0.0.1:5730".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_mode_lists_every_missing_credential() {
        let config = Config::default();
        let err = config.require_live_credentials().unwrap_err();
        let msg = err.to_string();
        for name in [
            "DASHSCOPE_API_URL",
            "DASHSCOPE_API_KEY",
            "OSS_REGION",
            "OSS_BUCKET",
            "OSS_ACCESS_KEY_ID",
            "OSS_ACCESS_KEY_SECRET",
            "GEMINI_API_KEY",
        ] {
            assert!(msg.contains(name), "missing {name} in: {msg}");
        }
    }

    #[test]
    fn live_mode_passes_with_full_credentials() {
        let config = Config {
            pipeline_mode: PipelineMode::Live,
            dashscope_api_url: Some("https://dashscope.example.com/api/v1".into()),
            dashscope_api_key: Some("sk-test".into()),
            oss_region: Some("ap-northeast-1".into()),
            oss_bucket: Some("staging".into()),
            oss_access_key_id: Some("id".into()),
            oss_access_key_secret: Some("secret".into()),
            gemini_api_key: Some("key".into()),
            ..Config::default()
        };
        config.require_live_credentials().unwrap();
    }
}
