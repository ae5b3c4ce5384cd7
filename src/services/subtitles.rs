//! SRT/VTT subtitle helpers

use std::sync::OnceLock;

/// A single subtitle cue with millisecond timing.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleCue {
    pub begin_ms: i64,
    pub end_ms: i64,
    pub text: String,
}

fn srt_timestamp_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| regex::Regex::new(r"(\d{2}:\d{2}:\d{2}),(\d{3})").unwrap())
}

/// Convert SRT text to WebVTT: prepend the `WEBVTT` header, normalize CRLF
/// and rewrite `HH:MM:SS,mmm` timestamps to `HH:MM:SS.mmm`.
pub fn srt_to_vtt(srt: &str) -> String {
    let normalized = srt.replace("\r\n", "\n");
    let converted = srt_timestamp_pattern().replace_all(&normalized, "$1.$2");
    format!("WEBVTT\n\n{converted}")
}

/// Format milliseconds as an SRT timestamp (`HH:MM:SS,mmm`).
pub fn format_srt_timestamp(ms: i64) -> String {
    let ms = ms.max(0);
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let millis = ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02},{millis:03}")
}

/// Render cues as SRT, skipping cues whose text is blank.
pub fn render_srt(cues: &[SubtitleCue]) -> String {
    let mut out = String::new();
    let mut index = 0;
    for cue in cues {
        if cue.text.trim().is_empty() {
            continue;
        }
        index += 1;
        out.push_str(&format!(
            "{index}\n{} --> {}\n{}\n\n",
            format_srt_timestamp(cue.begin_ms),
            format_srt_timestamp(cue.end_ms),
            cue.text.trim(),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_timestamps_and_prepends_header() {
        let srt = "1\r\n00:00:01,000 --> 00:00:02,500\r\nhello\r\n";
        let vtt = srt_to_vtt(srt);
        assert_eq!(vtt, "WEBVTT\n\n1\n00:00:01.000 --> 00:00:02.500\nhello\n");
    }

    #[test]
    fn leaves_cue_text_alone() {
        let srt = "1\n00:00:01,000 --> 00:00:02,000\nprice: 1,000 yen\n";
        let vtt = srt_to_vtt(srt);
        assert!(vtt.contains("price: 1,000 yen"));
        assert!(vtt.contains("00:00:01.000 --> 00:00:02.000"));
    }

    #[test]
    fn formats_timestamps() {
        assert_eq!(format_srt_timestamp(0), "00:00:00,000");
        assert_eq!(format_srt_timestamp(3_661_042), "01:01:01,042");
        assert_eq!(format_srt_timestamp(-5), "00:00:00,000");
    }

    #[test]
    fn renders_cues_and_skips_blank_text() {
        let cues = vec![
            SubtitleCue {
                begin_ms: 0,
                end_ms: 1500,
                text: "first".into(),
            },
            SubtitleCue {
                begin_ms: 1500,
                end_ms: 2000,
                text: "   ".into(),
            },
            SubtitleCue {
                begin_ms: 2000,
                end_ms: 3000,
                text: "second".into(),
            },
        ];
        let srt = render_srt(&cues);
        assert_eq!(
            srt,
            "1\n00:00:00,000 --> 00:00:01,500\nfirst\n\n2\n00:00:02,000 --> 00:00:03,000\nsecond\n\n"
        );
    }
}
