//! Transcript normalization before SRT rendering
//!
//! Two fixes applied to the raw service output:
//! 1. merge sentences the recognizer split on an English abbreviation "."
//!    (e.g. "N." + "G." becomes "N.G.") when the time gap is small;
//! 2. split overly long sentences, preferring punctuation boundaries and
//!    falling back to balanced length distribution.

use crate::services::subtitles::SubtitleCue;
use crate::{Error, Result};
use serde::Deserialize;

/// Japanese subtitle convention: 40 characters per cue.
pub const DEFAULT_MAX_CHARS: usize = 40;

/// Maximum gap between sentences still considered a continuation.
const MAX_MERGE_GAP_MS: i64 = 500;

const SPLIT_PUNCTUATION: [&str; 8] = ["、", "。", "！", "？", "!", "?", "，", ","];

#[derive(Debug, Clone, Deserialize)]
pub struct FunAsrWord {
    pub begin_time: i64,
    pub end_time: i64,
    pub text: String,
    #[serde(default)]
    pub punctuation: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunAsrSentence {
    pub begin_time: i64,
    pub end_time: i64,
    pub text: String,
    #[serde(default)]
    pub words: Vec<FunAsrWord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunAsrTranscript {
    pub channel_id: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub sentences: Vec<FunAsrSentence>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunAsrResult {
    pub transcripts: Vec<FunAsrTranscript>,
}

fn is_english_letter(c: char) -> bool {
    c.is_ascii_alphabetic()
}

fn is_split_punctuation(punctuation: &str) -> bool {
    SPLIT_PUNCTUATION.contains(&punctuation.trim())
}

/// A sentence ending in an English-letter "." merges with its neighbour
/// when the gap is small and the neighbour looks like the rest of the
/// abbreviation.
fn should_merge_with_next(current: &FunAsrSentence, next: &FunAsrSentence) -> bool {
    let Some(last_word) = current.words.last() else {
        return false;
    };

    if last_word.punctuation.trim() != "." {
        return false;
    }

    let word_text = last_word.text.trim();
    if !word_text.chars().last().is_some_and(is_english_letter) {
        return false;
    }

    if next.begin_time - current.end_time > MAX_MERGE_GAP_MS {
        return false;
    }

    let Some(next_first) = next.words.first() else {
        return false;
    };
    if !next_first
        .text
        .trim()
        .chars()
        .next()
        .is_some_and(is_english_letter)
    {
        return false;
    }

    if next.text.trim().chars().count() <= 5 {
        return true;
    }

    next.words
        .last()
        .is_some_and(|w| w.punctuation.trim() == ".")
}

fn merge_two(first: FunAsrSentence, second: FunAsrSentence) -> FunAsrSentence {
    let mut words = first.words;
    words.extend(second.words);
    FunAsrSentence {
        begin_time: first.begin_time,
        end_time: second.end_time,
        text: format!("{}{}", first.text.trim_end(), second.text),
        words,
    }
}

fn merge_dotted_sentences(sentences: Vec<FunAsrSentence>) -> (Vec<FunAsrSentence>, usize) {
    let mut result = Vec::with_capacity(sentences.len());
    let mut merges = 0;
    let mut iter = sentences.into_iter().peekable();

    while let Some(mut current) = iter.next() {
        while iter
            .peek()
            .is_some_and(|next| should_merge_with_next(&current, next))
        {
            let next = iter.next().expect("peeked");
            tracing::debug!(first = %current.text, second = %next.text, "Merging split abbreviation");
            current = merge_two(current, next);
            merges += 1;
        }
        result.push(current);
    }

    (result, merges)
}

fn word_len(word: &FunAsrWord) -> usize {
    word.text.chars().count() + word.punctuation.chars().count()
}

fn cue_from_words(words: &[FunAsrWord], text: &str) -> SubtitleCue {
    SubtitleCue {
        begin_ms: words.first().map_or(0, |w| w.begin_time),
        end_ms: words.last().map_or(0, |w| w.end_time),
        text: text.trim().to_string(),
    }
}

fn has_split_punctuation(words: &[FunAsrWord]) -> bool {
    // The last word's punctuation cannot be a split point.
    words.len() > 1
        && words[..words.len() - 1]
            .iter()
            .any(|w| is_split_punctuation(&w.punctuation))
}

/// Split at punctuation marks, backtracking to the nearest mark once the
/// running text exceeds the budget.
fn split_by_punctuation(sentence: &FunAsrSentence, max_chars: usize) -> Vec<SubtitleCue> {
    let mut segments = Vec::new();
    let mut current: Vec<FunAsrWord> = Vec::new();
    let mut current_len = 0usize;
    let mut last_split: Option<usize> = None;

    for word in &sentence.words {
        current.push(word.clone());
        current_len += word_len(word);

        if is_split_punctuation(&word.punctuation) {
            last_split = Some(current.len());
        }

        if current_len >= max_chars {
            if let Some(split_at) = last_split {
                let head: Vec<FunAsrWord> = current.drain(..split_at).collect();
                let head_text: String = head
                    .iter()
                    .map(|w| format!("{}{}", w.text, w.punctuation))
                    .collect();
                segments.push(cue_from_words(&head, &head_text));
                current_len = current.iter().map(word_len).sum();
                last_split = None;
            }
        }
    }

    if !current.is_empty() {
        let text: String = current
            .iter()
            .map(|w| format!("{}{}", w.text, w.punctuation))
            .collect();
        segments.push(cue_from_words(&current, &text));
    }

    segments
}

/// Split by character count, distributing the text evenly across the
/// minimum number of segments.
fn split_by_length(sentence: &FunAsrSentence, max_chars: usize) -> Vec<SubtitleCue> {
    if sentence.words.is_empty() {
        return vec![SubtitleCue {
            begin_ms: sentence.begin_time,
            end_ms: sentence.end_time,
            text: sentence.text.trim().to_string(),
        }];
    }

    let total_chars: usize = sentence.words.iter().map(word_len).sum();
    if total_chars <= max_chars {
        let text: String = sentence
            .words
            .iter()
            .map(|w| format!("{}{}", w.text, w.punctuation))
            .collect();
        return vec![cue_from_words(&sentence.words, &text)];
    }

    let num_segments = total_chars.div_ceil(max_chars);
    let target = total_chars as f64 / num_segments as f64;

    let mut segments = Vec::new();
    let mut current: Vec<FunAsrWord> = Vec::new();
    let mut current_len = 0usize;

    for word in &sentence.words {
        current.push(word.clone());
        current_len += word_len(word);

        if current_len as f64 >= target && segments.len() < num_segments - 1 {
            let text: String = current
                .iter()
                .map(|w| format!("{}{}", w.text, w.punctuation))
                .collect();
            segments.push(cue_from_words(&current, &text));
            current.clear();
            current_len = 0;
        }
    }

    if !current.is_empty() {
        let text: String = current
            .iter()
            .map(|w| format!("{}{}", w.text, w.punctuation))
            .collect();
        segments.push(cue_from_words(&current, &text));
    }

    segments
}

fn split_long_sentence(sentence: &FunAsrSentence, max_chars: usize) -> Vec<SubtitleCue> {
    if sentence.text.chars().count() <= max_chars {
        return vec![SubtitleCue {
            begin_ms: sentence.begin_time,
            end_ms: sentence.end_time,
            text: sentence.text.trim().to_string(),
        }];
    }

    // Aim below the hard budget so the backtracking has room.
    let target = (max_chars as f64 * 0.8) as usize;

    if has_split_punctuation(&sentence.words) {
        split_by_punctuation(sentence, target)
    } else {
        split_by_length(sentence, target)
    }
}

/// Normalize one channel of a transcription result into SRT-ready cues.
pub fn normalize_transcript(
    result: &FunAsrResult,
    channel_id: i64,
    max_chars: usize,
) -> Result<Vec<SubtitleCue>> {
    let transcript = result
        .transcripts
        .iter()
        .find(|t| t.channel_id == channel_id)
        .ok_or_else(|| {
            Error::pipeline_fatal(
                "run_asr",
                format!("Channel {channel_id} not found in transcription result"),
            )
        })?;

    let (merged, merge_count) = merge_dotted_sentences(transcript.sentences.clone());

    let mut cues = Vec::new();
    let mut split_count = 0;
    for sentence in &merged {
        let segments = split_long_sentence(sentence, max_chars);
        if segments.len() > 1 {
            split_count += 1;
        }
        cues.extend(segments);
    }

    if merge_count > 0 {
        tracing::info!(merge_count, "Merged dotted sentence pairs");
    }
    if split_count > 0 {
        tracing::info!(split_count, "Split long sentences");
    }

    Ok(cues)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(begin: i64, end: i64, text: &str, punctuation: &str) -> FunAsrWord {
        FunAsrWord {
            begin_time: begin,
            end_time: end,
            text: text.into(),
            punctuation: punctuation.into(),
        }
    }

    fn sentence(words: Vec<FunAsrWord>) -> FunAsrSentence {
        let text: String = words
            .iter()
            .map(|w| format!("{}{}", w.text, w.punctuation))
            .collect();
        FunAsrSentence {
            begin_time: words.first().map_or(0, |w| w.begin_time),
            end_time: words.last().map_or(0, |w| w.end_time),
            text,
            words,
        }
    }

    fn single_channel(sentences: Vec<FunAsrSentence>) -> FunAsrResult {
        FunAsrResult {
            transcripts: vec![FunAsrTranscript {
                channel_id: 0,
                text: String::new(),
                sentences,
            }],
        }
    }

    #[test]
    fn merges_abbreviation_split_on_dot() {
        let first = sentence(vec![word(0, 400, "N", ".")]);
        let second = sentence(vec![word(600, 900, "G", ".")]);

        let cues = normalize_transcript(&single_channel(vec![first, second]), 0, 40).unwrap();
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "N.G.");
        assert_eq!(cues[0].begin_ms, 0);
        assert_eq!(cues[0].end_ms, 900);
    }

    #[test]
    fn does_not_merge_across_a_long_gap() {
        let first = sentence(vec![word(0, 400, "N", ".")]);
        let second = sentence(vec![word(1200, 1500, "G", ".")]);

        let cues = normalize_transcript(&single_channel(vec![first, second]), 0, 40).unwrap();
        assert_eq!(cues.len(), 2);
    }

    #[test]
    fn does_not_merge_japanese_text_ending_in_dot() {
        let first = sentence(vec![word(0, 400, "一緒やんか", ".")]);
        let second = sentence(vec![word(500, 900, "G", ".")]);

        let cues = normalize_transcript(&single_channel(vec![first, second]), 0, 40).unwrap();
        assert_eq!(cues.len(), 2);
    }

    #[test]
    fn splits_long_sentences_at_punctuation() {
        let words = vec![
            word(0, 1000, "これはとても長い文章です", "、"),
            word(1000, 2000, "まだまだ続きます", "、"),
            word(2000, 3000, "最後まで読んでください", "。"),
        ];
        let cues = normalize_transcript(&single_channel(vec![sentence(words)]), 0, 20).unwrap();
        assert!(cues.len() > 1, "expected a split, got {cues:?}");
        // The split lands on the punctuation at or after the overflow point.
        assert_eq!(cues[0].text, "これはとても長い文章です、まだまだ続きます、");
        assert_eq!(cues[0].begin_ms, 0);
        assert_eq!(cues[0].end_ms, 2000);
        assert_eq!(cues[1].text, "最後まで読んでください。");
    }

    #[test]
    fn splits_unpunctuated_sentences_by_length() {
        let words: Vec<FunAsrWord> = (0..10)
            .map(|i| word(i * 100, (i + 1) * 100, "あいうえお", ""))
            .collect();
        let cues = normalize_transcript(&single_channel(vec![sentence(words)]), 0, 20).unwrap();
        assert!(cues.len() >= 3, "expected several segments, got {cues:?}");
        assert_eq!(cues.first().unwrap().begin_ms, 0);
        assert_eq!(cues.last().unwrap().end_ms, 1000);
    }

    #[test]
    fn short_sentences_pass_through() {
        let words = vec![word(0, 500, "短い", "。")];
        let cues = normalize_transcript(&single_channel(vec![sentence(words)]), 0, 40).unwrap();
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "短い。");
    }

    #[test]
    fn missing_channel_is_an_error() {
        let result = single_channel(vec![]);
        assert!(normalize_transcript(&result, 3, 40).is_err());
    }
}
