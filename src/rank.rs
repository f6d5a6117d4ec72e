//! Select / Rank stage
//!
//! Scores extracted candidates and evidence chunks under a shared weighted
//! feature model, filters service senders, then greedily selects items
//! under the configured token budget (`spec.md` §4.5).

use once_cell::sync::Lazy;
use regex::RegexSet;

use crate::config::PipelineConfig;
use crate::types::{EvidenceChunk, Importance, Message, Thread};

const W_USER_IN_TO: f64 = 0.15;
const W_USER_IN_CC: f64 = 0.05;
const W_HAS_ACTION_MARKER: f64 = 0.20;
const W_HAS_MENTION: f64 = 0.10;
const W_HAS_DUE_DATE: f64 = 0.15;
const W_SENDER_IMPORTANCE: f64 = 0.10;
const W_THREAD_LENGTH: f64 = 0.05;
const W_RECENCY: f64 = 0.10;
const W_HAS_ATTACHMENTS: f64 = 0.05;
const W_HAS_PROJECT_TAG: f64 = 0.05;

const THREAD_LENGTH_CAP: usize = 10;
const RECENCY_WINDOW_HOURS: f64 = 48.0;

static SERVICE_SENDER: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)^postmaster@",
        r"(?i)auto-submitted",
        r"(?i)undeliverable",
        r"(?i)\[\s*автоответ\s*\]",
        r"(?i)no-?reply@",
        r"(?i)mailer-daemon@",
    ])
    .expect("valid service sender set")
});

static PROJECT_TAG: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"\[[A-Z]{2,}-\d+\]").expect("valid project tag regex"));

/// A candidate unit to be ranked and (optionally) selected: one evidence
/// chunk in the context of its message and thread.
pub struct RankCandidate<'a> {
    pub chunk: &'a EvidenceChunk,
    pub message: &'a Message,
    pub thread: &'a Thread,
    pub digest_now: chrono::DateTime<chrono::FixedOffset>,
}

/// True when the message's sender looks like a service/auto-reply address
/// that should never drive a digest item (§4.5).
pub fn is_service_sender(from_email: &str, subject: &str) -> bool {
    SERVICE_SENDER.is_match(from_email) || SERVICE_SENDER.is_match(subject)
}

/// Weighted feature score mapped into `[0, 1]`, used as `rank_score`.
pub fn rank_score(candidate: &RankCandidate<'_>, user_email: &str) -> f64 {
    let message = candidate.message;
    let chunk = candidate.chunk;

    let user_in_to = message.to_emails.iter().any(|e| e.eq_ignore_ascii_case(user_email));
    let user_in_cc = message.cc_emails.iter().any(|e| e.eq_ignore_ascii_case(user_email));
    let thread_length = (candidate.thread.messages.len().min(THREAD_LENGTH_CAP)) as f64 / THREAD_LENGTH_CAP as f64;
    let hours_old = (candidate.digest_now - message.received_at).num_minutes() as f64 / 60.0;
    let recency = (1.0 - (hours_old / RECENCY_WINDOW_HOURS)).clamp(0.0, 1.0);
    let sender_importance = match chunk.signals.sender_importance {
        Importance::High => 1.0,
        Importance::Normal => 0.5,
        Importance::Low => 0.0,
    };
    let has_project_tag = PROJECT_TAG.is_match(&message.subject);

    let score = W_USER_IN_TO * bool_f(user_in_to)
        + W_USER_IN_CC * bool_f(user_in_cc)
        + W_HAS_ACTION_MARKER * bool_f(chunk.signals.has_imperative_verb)
        + W_HAS_MENTION * bool_f(chunk.signals.mentions_user_alias)
        + W_HAS_DUE_DATE * bool_f(chunk.signals.has_deadline_expression)
        + W_SENDER_IMPORTANCE * sender_importance
        + W_THREAD_LENGTH * thread_length
        + W_RECENCY * recency
        + W_HAS_ATTACHMENTS * bool_f(message.has_attachments)
        + W_HAS_PROJECT_TAG * bool_f(has_project_tag);

    score.clamp(0.0, 1.0)
}

fn bool_f(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Greedily select candidates by descending `rank_score` while the running
/// token total stays within `cfg.token_budget`. Service-sender candidates
/// are dropped before ranking.
pub fn select_within_budget<'a>(
    mut candidates: Vec<(RankCandidate<'a>, f64)>,
    cfg: &PipelineConfig,
) -> Vec<(RankCandidate<'a>, f64)> {
    candidates.retain(|(c, _)| !is_service_sender(&c.message.from_email, &c.message.subject));
    candidates.sort_by(|(a, sa), (b, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.evidence_id.cmp(&b.chunk.evidence_id))
    });

    let mut selected = Vec::new();
    let mut total_tokens: u32 = 0;
    for candidate in candidates {
        let tokens = candidate.0.chunk.token_count;
        if total_tokens + tokens > cfg.token_budget {
            continue;
        }
        total_tokens += tokens;
        selected.push(candidate);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkSignals, MergedBy};
    use chrono::DateTime;

    fn message(from: &str, to: Vec<&str>, subject: &str, received_at: &str) -> Message {
        Message {
            message_id: "m1".to_string(),
            conversation_id: None,
            in_reply_to: vec![],
            received_at: DateTime::parse_from_rfc3339(received_at).unwrap(),
            from_email: from.to_string(),
            from_name: None,
            to_emails: to.into_iter().map(|s| s.to_string()).collect(),
            cc_emails: vec![],
            subject: subject.to_string(),
            body_normalized: String::new(),
            importance: Importance::Normal,
            is_flagged: false,
            has_attachments: false,
            attachment_types: vec![],
            body_checksum: "chk".to_string(),
        }
    }

    fn chunk(signals: ChunkSignals) -> EvidenceChunk {
        EvidenceChunk {
            evidence_id: "ev1".to_string(),
            message_id: "m1".to_string(),
            thread_id: "t1".to_string(),
            start_offset: 0,
            end_offset: 10,
            content: "x".repeat(10),
            token_count: 100,
            priority_score: 0.5,
            signals,
        }
    }

    fn thread(messages: Vec<Message>) -> Thread {
        Thread {
            thread_id: "t1".to_string(),
            messages,
            participants_count: 2,
            merged_by: MergedBy::ConversationId,
            duplicate_sources: vec![],
        }
    }

    #[test]
    fn detects_service_senders_by_address_and_subject() {
        assert!(is_service_sender("postmaster@corp.example", "subj"));
        assert!(is_service_sender("x@corp.example", "[Автоответ] Out of office"));
        assert!(!is_service_sender("alice@corp.example", "Status update"));
    }

    #[test]
    fn rank_score_is_bounded_in_unit_interval() {
        let msg = message("alice@corp.example", vec!["bob@corp.example"], "Status", "2024-12-15T09:00:00-03:00");
        let t = thread(vec![msg.clone()]);
        let chunk = chunk(ChunkSignals {
            has_imperative_verb: true,
            has_deadline_expression: true,
            mentions_user_alias: true,
            sender_importance: Importance::High,
            ..Default::default()
        });
        let candidate = RankCandidate {
            chunk: &chunk,
            message: &msg,
            thread: &t,
            digest_now: DateTime::parse_from_rfc3339("2024-12-15T10:00:00-03:00").unwrap(),
        };
        let score = rank_score(&candidate, "bob@corp.example");
        assert!((0.0..=1.0).contains(&score));
        assert!(score > 0.5);
    }

    #[test]
    fn select_within_budget_drops_service_senders_and_caps_tokens() {
        let msg1 = message("alice@corp.example", vec!["bob@corp.example"], "Status", "2024-12-15T09:00:00-03:00");
        let msg2 = message("postmaster@corp.example", vec!["bob@corp.example"], "Bounce", "2024-12-15T09:00:00-03:00");
        let t1 = thread(vec![msg1.clone()]);
        let t2 = thread(vec![msg2.clone()]);
        let c1 = chunk(ChunkSignals::default());
        let c2 = chunk(ChunkSignals::default());
        let now = DateTime::parse_from_rfc3339("2024-12-15T10:00:00-03:00").unwrap();
        let candidates = vec![
            (RankCandidate { chunk: &c1, message: &msg1, thread: &t1, digest_now: now }, 0.0),
            (RankCandidate { chunk: &c2, message: &msg2, thread: &t2, digest_now: now }, 0.0),
        ];
        let mut cfg = crate::config::test_support::default_pipeline_config();
        cfg.token_budget = 1000;
        let selected = select_within_budget(candidates, &cfg);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0.message.from_email, "alice@corp.example");
    }
}
