//! Chunk stage
//!
//! Splits each message body into evidence spans: paragraphs first, then
//! sentence boundaries within oversized paragraphs, capped at 12 chunks per
//! message, each carrying a deterministic `evidence_id` (`spec.md` §4.3).

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest as _, Sha256};

use crate::types::{ChunkSignals, EvidenceChunk, Importance, Message, Thread};

const MAX_CHUNKS_PER_MESSAGE_HARD_CAP: usize = 12;
const TARGET_MIN_TOKENS: u32 = 256;
const TARGET_MAX_TOKENS: u32 = 512;

static SENTENCE_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)([.!?\u{2026}]+)(\s+)").expect("valid sentence-boundary regex"));

static QUESTION_MARK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\?\s*$").expect("valid question regex"));

static IMPERATIVE_EN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(please|kindly|send|review|approve|confirm|update|fix|check|provide|schedule|share|complete|finalize)\b")
        .expect("valid imperative regex")
});
static IMPERATIVE_RU: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(пожалуйста|просьба|необходимо|нужно|требуется|отправьте|проверьте|подтвердите|согласуйте)\b")
        .expect("valid ru imperative regex")
});

static DEADLINE_EXPRESSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,2}[./]\d{1,2}[./]\d{2,4}|\d{4}-\d{2}-\d{2}|today|tomorrow|tonight|eod|cob|asap|by (?:monday|tuesday|wednesday|thursday|friday|saturday|sunday|end of day|end of week)|завтра|сегодня|до конца дня|до пятницы)\b")
        .expect("valid deadline regex")
});

/// Split a thread's messages into evidence chunks. `user_aliases` is the
/// set of email/name forms the extractor treats as the configured user's
/// identity, used to set [`ChunkSignals::mentions_user_alias`].
pub fn chunk_thread(thread: &Thread, user_aliases: &[String]) -> Vec<EvidenceChunk> {
    let last_message_id = thread.latest().map(|m| m.message_id.clone());
    thread
        .messages
        .iter()
        .flat_map(|message| chunk_message(message, &thread.thread_id, user_aliases, last_message_id.as_deref()))
        .collect()
}

fn chunk_message(
    message: &Message,
    thread_id: &str,
    user_aliases: &[String],
    last_message_id: Option<&str>,
) -> Vec<EvidenceChunk> {
    let spans = split_into_spans(&message.body_normalized);
    let is_last_update = last_message_id == Some(message.message_id.as_str());

    spans
        .into_iter()
        .take(MAX_CHUNKS_PER_MESSAGE_HARD_CAP)
        .map(|(start, end)| {
            let content = message.body_normalized[start..end].to_string();
            let signals = compute_signals(&content, message.importance, user_aliases, is_last_update);
            let token_count = estimate_token_count(&content);
            let evidence_id = evidence_id_for(&message.message_id, start, end);
            let priority_score = priority_score(&signals);
            EvidenceChunk {
                evidence_id,
                message_id: message.message_id.clone(),
                thread_id: thread_id.to_string(),
                start_offset: start,
                end_offset: end,
                content,
                token_count,
                priority_score,
                signals,
            }
        })
        .collect()
}

/// Split body text into `(start, end)` byte-offset spans: paragraphs first,
/// with any paragraph exceeding the target token window split further on
/// sentence boundaries.
fn split_into_spans(body: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    for (para_start, para_end) in paragraph_spans(body) {
        let paragraph = &body[para_start..para_end];
        if estimate_token_count(paragraph) <= TARGET_MAX_TOKENS {
            spans.push((para_start, para_end));
            continue;
        }
        spans.extend(sentence_spans(body, para_start, para_end));
    }
    merge_undersized(spans, body)
}

fn paragraph_spans(body: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    for block in body.split("\n\n") {
        let trimmed = block.trim_matches(|c: char| c == '\n' || c == '\r');
        let block_start = cursor + block.find(trimmed).unwrap_or(0);
        let block_end = block_start + trimmed.len();
        cursor += block.len() + 2;
        if !trimmed.is_empty() {
            spans.push((block_start, block_end));
        }
    }
    if spans.is_empty() && !body.trim().is_empty() {
        spans.push((0, body.len()));
    }
    spans
}

fn sentence_spans(body: &str, para_start: usize, para_end: usize) -> Vec<(usize, usize)> {
    let paragraph = &body[para_start..para_end];
    let mut spans = Vec::new();
    let mut last_match_end = 0;
    for caps in SENTENCE_BOUNDARY.captures_iter(paragraph) {
        let whole = caps.get(0).expect("group 0 always present");
        let punctuation = caps.get(1).expect("punctuation group always present");
        let sentence_end = punctuation.end();
        let sentence = &paragraph[last_match_end..sentence_end];
        if !sentence.trim().is_empty() {
            spans.push((para_start + last_match_end, para_start + sentence_end));
        }
        last_match_end = whole.end();
    }
    let tail = &paragraph[last_match_end..];
    if !tail.trim().is_empty() {
        spans.push((para_start + last_match_end, para_end));
    }
    if spans.is_empty() {
        spans.push((para_start, para_end));
    }
    spans
}

/// Merge adjacent spans under the target minimum token size so a run of
/// short sentences doesn't explode into many tiny chunks.
fn merge_undersized(spans: Vec<(usize, usize)>, body: &str) -> Vec<(usize, usize)> {
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (start, end) in spans {
        if let Some(last) = merged.last_mut() {
            let combined_tokens = estimate_token_count(&body[last.0..end]);
            if estimate_token_count(&body[last.0..last.1]) < TARGET_MIN_TOKENS && combined_tokens <= TARGET_MAX_TOKENS {
                last.1 = end;
                continue;
            }
        }
        merged.push((start, end));
    }
    merged
}

fn estimate_token_count(text: &str) -> u32 {
    let word_count = text.split_whitespace().count() as f64;
    (word_count * 1.3).round() as u32
}

/// Deterministic over `(message_id, start_offset, end_offset)` — a SHA-256
/// hex digest so identical inputs produce identical ids across runs.
pub fn evidence_id_for(message_id: &str, start: usize, end: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message_id.as_bytes());
    hasher.update(b"|");
    hasher.update(start.to_le_bytes());
    hasher.update(b"|");
    hasher.update(end.to_le_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        hex.push_str(&format!("{b:02x}"));
    }
    hex.truncate(chars);
    hex
}

fn compute_signals(content: &str, sender_importance: Importance, user_aliases: &[String], is_last_update: bool) -> ChunkSignals {
    let lower = content.to_lowercase();
    let mentions_user_alias = !user_aliases.is_empty()
        && user_aliases.iter().any(|alias| !alias.is_empty() && lower.contains(&alias.to_lowercase()));
    ChunkSignals {
        has_question_mark: QUESTION_MARK.is_match(content.trim_end()),
        has_imperative_verb: IMPERATIVE_EN.is_match(content.trim_start()) || IMPERATIVE_RU.is_match(content),
        has_deadline_expression: DEADLINE_EXPRESSION.is_match(content),
        mentions_user_alias,
        is_last_update_in_thread: is_last_update,
        sender_importance,
    }
}

/// Cheap rule-feature score used by Select/Rank to cut candidates before
/// the more expensive ranking pass; not the final `rank_score`.
fn priority_score(signals: &ChunkSignals) -> f64 {
    let mut score = 0.0;
    if signals.mentions_user_alias {
        score += 0.4;
    }
    if signals.has_imperative_verb {
        score += 0.25;
    }
    if signals.has_deadline_expression {
        score += 0.2;
    }
    if signals.has_question_mark {
        score += 0.1;
    }
    score += match signals.sender_importance {
        Importance::High => 0.15,
        Importance::Normal => 0.05,
        Importance::Low => 0.0,
    };
    if signals.is_last_update_in_thread {
        score += 0.05;
    }
    score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MergedBy;
    use chrono::DateTime;

    fn message(body: &str, id: &str) -> Message {
        Message {
            message_id: id.to_string(),
            conversation_id: None,
            in_reply_to: vec![],
            received_at: DateTime::parse_from_rfc3339("2024-12-15T09:00:00-03:00").unwrap(),
            from_email: "alice@corp.example".to_string(),
            from_name: None,
            to_emails: vec!["bob@corp.example".to_string()],
            cc_emails: vec![],
            subject: "Status".to_string(),
            body_normalized: body.to_string(),
            importance: Importance::Normal,
            is_flagged: false,
            has_attachments: false,
            attachment_types: vec![],
            body_checksum: "chk".to_string(),
        }
    }

    fn thread(messages: Vec<Message>) -> Thread {
        Thread {
            thread_id: "thread-1".to_string(),
            messages,
            participants_count: 2,
            merged_by: MergedBy::ConversationId,
            duplicate_sources: vec![],
        }
    }

    #[test]
    fn evidence_id_is_deterministic_over_same_inputs() {
        let a = evidence_id_for("m1", 0, 10);
        let b = evidence_id_for("m1", 0, 10);
        assert_eq!(a, b);
    }

    #[test]
    fn evidence_id_differs_for_different_offsets() {
        assert_ne!(evidence_id_for("m1", 0, 10), evidence_id_for("m1", 0, 11));
    }

    #[test]
    fn splits_body_into_paragraph_chunks_with_exact_content_slices() {
        let body = "First paragraph here.\n\nSecond paragraph here.";
        let m = message(body, "m1");
        let t = thread(vec![m.clone()]);
        let chunks = chunk_thread(&t, &[]);
        assert_eq!(chunks.len(), 2);
        for chunk in &chunks {
            assert_eq!(&body[chunk.start_offset..chunk.end_offset], chunk.content);
        }
    }

    #[test]
    fn caps_chunks_per_message_at_twelve() {
        let body = (0..30).map(|i| format!("Paragraph number {i} ends here.")).collect::<Vec<_>>().join("\n\n");
        let m = message(&body, "m1");
        let t = thread(vec![m]);
        let chunks = chunk_thread(&t, &[]);
        assert!(chunks.len() <= 12);
    }

    #[test]
    fn chunks_never_overlap_within_a_message() {
        let body = "Para one is here.\n\nPara two is here.\n\nPara three is here.";
        let m = message(body, "m1");
        let t = thread(vec![m]);
        let chunks = chunk_thread(&t, &[]);
        for w in chunks.windows(2) {
            assert!(w[0].end_offset <= w[1].start_offset);
        }
    }

    #[test]
    fn detects_user_alias_mention() {
        let body = "Please review this, bob@corp.example.";
        let m = message(body, "m1");
        let t = thread(vec![m]);
        let chunks = chunk_thread(&t, &["bob@corp.example".to_string()]);
        assert!(chunks.iter().any(|c| c.signals.mentions_user_alias));
    }

    #[test]
    fn marks_last_message_chunk_as_last_update() {
        let m1 = message("First message body.", "m1");
        let mut m2 = message("Second message body.", "m2");
        m2.received_at = DateTime::parse_from_rfc3339("2024-12-15T10:00:00-03:00").unwrap();
        let t = thread(vec![m1, m2]);
        let chunks = chunk_thread(&t, &[]);
        let last_chunks: Vec<_> = chunks.iter().filter(|c| c.message_id == "m2").collect();
        assert!(last_chunks.iter().all(|c| c.signals.is_last_update_in_thread));
        let first_chunks: Vec<_> = chunks.iter().filter(|c| c.message_id == "m1").collect();
        assert!(first_chunks.iter().all(|c| !c.signals.is_last_update_in_thread));
    }

    #[test]
    fn detects_deadline_expressions() {
        let body = "Please send the report by Friday.";
        let m = message(body, "m1");
        let t = thread(vec![m]);
        let chunks = chunk_thread(&t, &[]);
        assert!(chunks.iter().any(|c| c.signals.has_deadline_expression));
    }
}
