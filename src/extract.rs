//! Extract stage (rule-based)
//!
//! Finds action/question/mention candidates in each evidence chunk,
//! independent of the language model, scored with a fixed-weight logistic
//! (`spec.md` §4.4). Runs in English and Russian.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::PipelineConfig;
use crate::types::{ActionKind, Citation, EvidenceChunk, ExtractedAction, Importance, Message};

const W_USER_MENTION: f64 = 1.5;
const W_IMPERATIVE: f64 = 1.2;
const W_ACTION_MARKER: f64 = 1.0;
const W_QUESTION: f64 = 0.8;
const W_DEADLINE: f64 = 0.6;
const W_SENDER_RANK: f64 = 0.5;
const BIAS: f64 = 1.5;

static SENTENCE_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)(?:[.!?\u{2026}]+\s+|\n+)").expect("valid split regex"));

static IMPERATIVE_EN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(please|kindly|send|review|approve|confirm|update|fix|check|provide|schedule|share|complete|finalize|let me know)\b")
        .expect("valid en imperative regex")
});
static IMPERATIVE_RU: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(пожалуйста|просьба|необходимо|нужно|требуется|отправьте|проверьте|подтвердите|согласуйте|сообщите)\b")
        .expect("valid ru imperative regex")
});

static ACTION_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(please|could you|can you|would you|прошу|нужно|необходимо)\b").expect("valid action marker regex")
});

static QUESTION_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\?\s*$").expect("valid question marker regex"));

static DEADLINE_EXPRESSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,2}[./]\d{1,2}[./]\d{2,4}|\d{4}-\d{2}-\d{2}|today|tomorrow|tonight|eod|cob|asap|by (?:monday|tuesday|wednesday|thursday|friday|saturday|sunday|end of day|end of week)|завтра|сегодня|до конца дня|до пятницы|понедельника|вторника|среды|четверга|пятницы)\b")
        .expect("valid deadline regex")
});

/// `σ(x) = 1 / (1 + e^-x)`.
fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

struct SentenceFeatures {
    imperative: bool,
    action_marker: bool,
    question: bool,
    user_mention: bool,
    deadline: bool,
}

fn sentence_features(sentence: &str, user_aliases: &[String]) -> SentenceFeatures {
    let lower = sentence.to_lowercase();
    SentenceFeatures {
        imperative: IMPERATIVE_EN.is_match(sentence.trim_start()) || IMPERATIVE_RU.is_match(sentence),
        action_marker: ACTION_MARKER.is_match(sentence),
        question: QUESTION_MARKER.is_match(sentence.trim_end()),
        user_mention: !user_aliases.is_empty()
            && user_aliases.iter().any(|alias| !alias.is_empty() && lower.contains(&alias.to_lowercase())),
        deadline: DEADLINE_EXPRESSION.is_match(sentence),
    }
}

fn sender_rank_value(importance: Importance) -> f64 {
    match importance {
        Importance::High => 1.0,
        Importance::Normal => 0.5,
        Importance::Low => 0.0,
    }
}

fn classify(features: &SentenceFeatures) -> ActionKind {
    if features.user_mention && !features.imperative && !features.action_marker {
        ActionKind::Mention
    } else if features.question {
        ActionKind::Question
    } else {
        ActionKind::Action
    }
}

fn verb_for(sentence: &str) -> String {
    sentence
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_string()
}

fn deadline_text(sentence: &str) -> Option<String> {
    DEADLINE_EXPRESSION.find(sentence).map(|m| m.as_str().to_string())
}

/// Run the rule-based extractor over one evidence chunk's sentences.
/// Emits candidates with confidence at or above
/// `cfg.extract_confidence_threshold`.
pub fn extract_from_chunk(
    chunk: &EvidenceChunk,
    message: &Message,
    who: &str,
    user_aliases: &[String],
    cfg: &PipelineConfig,
) -> Vec<ExtractedAction> {
    let mut out = Vec::new();
    for raw_sentence in SENTENCE_SPLIT.split(&chunk.content) {
        let sentence = raw_sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        let features = sentence_features(sentence, user_aliases);
        let score = W_USER_MENTION * bool_f(features.user_mention)
            + W_IMPERATIVE * bool_f(features.imperative)
            + W_ACTION_MARKER * bool_f(features.action_marker)
            + W_QUESTION * bool_f(features.question)
            + W_DEADLINE * bool_f(features.deadline)
            + W_SENDER_RANK * sender_rank_value(chunk.signals.sender_importance);
        let confidence = sigmoid(score - BIAS);
        if confidence < cfg.extract_confidence_threshold {
            continue;
        }
        let text: String = sentence.chars().take(500).collect();
        let kind = classify(&features);
        out.push(ExtractedAction {
            kind,
            who: who.to_string(),
            verb: verb_for(sentence),
            text: text.clone(),
            deadline: deadline_text(sentence),
            confidence,
            evidence_id: chunk.evidence_id.clone(),
            message_id: chunk.message_id.clone(),
            citations: vec![Citation {
                message_id: message.message_id.clone(),
                start: chunk.start_offset,
                end: chunk.end_offset,
                preview: text.chars().take(150).collect(),
                checksum: Some(message.body_checksum.clone()),
            }],
        });
    }
    out
}

fn bool_f(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkSignals;
    use chrono::DateTime;

    fn message() -> Message {
        Message {
            message_id: "m1".to_string(),
            conversation_id: None,
            in_reply_to: vec![],
            received_at: DateTime::parse_from_rfc3339("2024-12-15T09:00:00-03:00").unwrap(),
            from_email: "boss@corp.example".to_string(),
            from_name: None,
            to_emails: vec!["alice@corp.example".to_string()],
            cc_emails: vec![],
            subject: "Report".to_string(),
            body_normalized: String::new(),
            importance: Importance::High,
            is_flagged: false,
            has_attachments: false,
            attachment_types: vec![],
            body_checksum: "chk".to_string(),
        }
    }

    fn chunk(content: &str) -> EvidenceChunk {
        EvidenceChunk {
            evidence_id: "ev1".to_string(),
            message_id: "m1".to_string(),
            thread_id: "t1".to_string(),
            start_offset: 0,
            end_offset: content.len(),
            content: content.to_string(),
            token_count: 10,
            priority_score: 0.5,
            signals: ChunkSignals {
                sender_importance: Importance::High,
                ..Default::default()
            },
        }
    }

    fn cfg() -> PipelineConfig {
        let mut c = crate::config::test_support::default_pipeline_config();
        c.extract_confidence_threshold = 0.5;
        c
    }

    #[test]
    fn extracts_an_action_from_an_imperative_sentence_with_deadline() {
        let content = "Please send the final report by Friday.";
        let chunk = chunk(content);
        let msg = message();
        let actions = extract_from_chunk(&chunk, &msg, "alice", &["alice@corp.example".to_string()], &cfg());
        assert!(!actions.is_empty());
        assert!(actions.iter().any(|a| a.deadline.is_some()));
    }

    #[test]
    fn classifies_questions_distinctly_from_actions() {
        let content = "Can you confirm the budget numbers?";
        let chunk = chunk(content);
        let msg = message();
        let actions = extract_from_chunk(&chunk, &msg, "alice", &[], &cfg());
        assert!(actions.iter().any(|a| a.kind == ActionKind::Question));
    }

    #[test]
    fn low_signal_sentences_fall_below_threshold_and_are_not_emitted() {
        let content = "The weather was nice yesterday.";
        let chunk = chunk(content);
        let msg = message();
        let actions = extract_from_chunk(&chunk, &msg, "alice", &[], &cfg());
        assert!(actions.is_empty());
    }

    #[test]
    fn citations_carry_exact_evidence_offsets() {
        let content = "Please approve this request urgently.";
        let chunk = chunk(content);
        let msg = message();
        let actions = extract_from_chunk(&chunk, &msg, "alice", &[], &cfg());
        assert!(!actions.is_empty());
        let citation = &actions[0].citations[0];
        assert_eq!(citation.start, chunk.start_offset);
        assert_eq!(citation.end, chunk.end_offset);
    }

    #[test]
    fn recognizes_russian_imperative_and_deadline_markers() {
        let content = "Пожалуйста, подтвердите бюджет до пятницы.";
        let chunk = chunk(content);
        let msg = message();
        let actions = extract_from_chunk(&chunk, &msg, "alice", &[], &cfg());
        assert!(!actions.is_empty());
    }
}
