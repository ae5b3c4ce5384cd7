//! External-facing services: subprocess supervision, retries, subtitle
//! conversion and the ASR/translation provider adapters.

pub mod asr;
pub mod command;
pub mod ffmpeg;
pub mod retry;
pub mod subtitles;
pub mod translate;
pub mod ytdlp;

use crate::Error;

/// Map an HTTP failure onto the pipeline error taxonomy: 429 and 5xx are
/// retryable, any other 4xx is not.
pub fn classify_http_status(step: &str, status: reqwest::StatusCode, detail: &str) -> Error {
    let message = format!("HTTP {status}: {detail}");
    if status.as_u16() == 429 || status.is_server_error() {
        Error::pipeline_retryable(step, message)
    } else {
        Error::pipeline_fatal(step, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert!(classify_http_status("run_asr", StatusCode::TOO_MANY_REQUESTS, "slow down")
            .is_retryable());
        assert!(classify_http_status("run_asr", StatusCode::BAD_GATEWAY, "upstream").is_retryable());
        assert!(
            !classify_http_status("run_asr", StatusCode::UNAUTHORIZED, "bad key").is_retryable()
        );
        assert!(!classify_http_status("run_asr", StatusCode::NOT_FOUND, "gone").is_retryable());
    }
}
