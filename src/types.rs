//! Core data model for the digest pipeline
//!
//! Every entity here is value-like: a later stage replaces a record wholesale
//! rather than mutating it in place. Ownership flows strictly forward along
//! the pipeline (Fetch → Normalize → Thread build → Chunk → Extract → Rank →
//! Summarize → Validate → Assemble → Persist); nothing downstream ever holds
//! a mutable reference back into an earlier stage's output.

use chrono::{DateTime, FixedOffset};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Output envelope schema version. Marked on every digest produced.
pub const SCHEMA_VERSION: &str = "3.0";

/// Sender/message importance tier, as reported by the mailbox driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    Normal,
    High,
}

impl Default for Importance {
    fn default() -> Self {
        Self::Normal
    }
}

/// The strongest signal that caused a set of messages to be merged into one
/// thread, recorded for provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MergedBy {
    ConversationId,
    ReplyChain,
    Subject,
    Semantic,
}

/// One email after normalization.
///
/// Invariants: `received_at` is never naive (§5); `body_normalized` carries
/// no HTML tags, no zero-width characters, no tracking pixels; messages that
/// share a `body_checksum` are collapsed into one primary by Thread build.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Message {
    /// Internet-message-id preferred, mailbox item id fallback. Lower-cased,
    /// angle brackets stripped. See [`crate::message_id`].
    pub message_id: String,
    /// Conversation id as reported by the mailbox driver, normalized.
    pub conversation_id: Option<String>,
    /// Reply-chain parent/ancestor ids (`In-Reply-To` + `References`),
    /// normalized the same way as `message_id`.
    pub in_reply_to: Vec<String>,
    /// Timezone-aware instant in the mailbox's timezone.
    pub received_at: DateTime<FixedOffset>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
    /// Original subject, unmodified.
    pub subject: String,
    /// Plain text, at most 200 KiB, truncation marked with a
    /// `[TRUNCATED]` sentinel when cut.
    pub body_normalized: String,
    pub importance: Importance,
    pub is_flagged: bool,
    pub has_attachments: bool,
    /// File extensions only, in driver order.
    pub attachment_types: Vec<String>,
    /// SHA-256 of `body_normalized`, hex-encoded.
    pub body_checksum: String,
}

/// A set of messages belonging to one conversation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Thread {
    /// Derived id, stable across runs given the same input messages.
    pub thread_id: String,
    /// Ordered by `received_at` ascending.
    pub messages: Vec<Message>,
    pub participants_count: usize,
    pub merged_by: MergedBy,
    /// Message ids suppressed as duplicates of a message retained above.
    pub duplicate_sources: Vec<String>,
}

impl Thread {
    /// The most recently received message in the thread.
    pub fn latest(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Rule-derived boolean/scalar signals attached to a chunk, used by Rank and
/// by the extractor without re-scanning the chunk text.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema)]
pub struct ChunkSignals {
    pub has_question_mark: bool,
    pub has_imperative_verb: bool,
    pub has_deadline_expression: bool,
    pub mentions_user_alias: bool,
    pub is_last_update_in_thread: bool,
    pub sender_importance: Importance,
}

/// A verbatim span of a message body that may support a digest item.
///
/// Invariants: `0 <= start_offset < end_offset <= len(message.body_normalized)`;
/// `content == body_normalized[start_offset..end_offset]` exactly; chunks of
/// one message never overlap; at most 12 chunks per message.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EvidenceChunk {
    /// Deterministic over `(message_id, start_offset, end_offset)` — SHA-256
    /// hex digest, truncated. See [`crate::chunk::evidence_id`].
    pub evidence_id: String,
    pub message_id: String,
    pub thread_id: String,
    pub start_offset: usize,
    pub end_offset: usize,
    /// Verbatim slice of `body_normalized[start_offset..end_offset]`.
    pub content: String,
    /// Estimated as `1.3 * word_count`.
    pub token_count: u32,
    pub priority_score: f64,
    pub signals: ChunkSignals,
}

/// What an extracted or digest item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Action,
    Question,
    Mention,
}

/// A candidate item discovered by the rule-based extractor (§4.4),
/// independent of anything the language model produces.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedAction {
    pub kind: ActionKind,
    /// The identity the item is addressed to; for "my actions" this is the
    /// configured user identity.
    pub who: String,
    /// The trigger verb or phrase that matched.
    pub verb: String,
    /// Sentence-sized span, up to ~500 characters.
    pub text: String,
    /// Normalized to an ISO-8601 date in the mailbox timezone, if present.
    pub deadline: Option<String>,
    pub confidence: f64,
    pub evidence_id: String,
    pub message_id: String,
    pub citations: Vec<Citation>,
}

/// A triple proving a digest item came from a real span of a real message.
///
/// Invariants: `start < end`; `end <= len(body)`; `preview ==
/// body[start..end]` exactly, modulo a narrow whitespace-tolerant match
/// (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Citation {
    pub message_id: String,
    pub start: usize,
    pub end: usize,
    pub preview: String,
    /// `body_checksum` of the source message, when available, for an extra
    /// integrity check beyond the offsets.
    pub checksum: Option<String>,
}

/// Confidence tier attached to every digest item by the language model or by
/// the extractive degrade path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// `today`/`tomorrow` label derived automatically from `due_date_normalized`
/// relative to `digest_date`; `None` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DueDateLabel {
    Today,
    Tomorrow,
}

/// Final output item: an action, deadline/meeting, risk, or FYI entry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DigestItem {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Extractive span from evidence, at least 10 characters.
    pub quote: String,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    /// ISO date, e.g. `2024-12-20`.
    pub due_date: Option<String>,
    /// ISO-8601 instant in the mailbox timezone.
    pub due_date_normalized: Option<DateTime<FixedOffset>>,
    pub due_date_label: Option<DueDateLabel>,
    pub confidence: Confidence,
    pub email_subject: String,
    pub rank_score: f64,
    /// Non-empty; enforced at validation (§4.7).
    pub citations: Vec<Citation>,
}

/// The five typed sections of a digest envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DigestSections {
    pub my_actions: Vec<DigestItem>,
    pub others_actions: Vec<DigestItem>,
    pub deadlines_meetings: Vec<DigestItem>,
    pub risks_blockers: Vec<DigestItem>,
    pub fyi: Vec<DigestItem>,
}

impl DigestSections {
    /// Total item count across all five sections.
    pub fn total_items(&self) -> usize {
        self.my_actions.len()
            + self.others_actions.len()
            + self.deadlines_meetings.len()
            + self.risks_blockers.len()
            + self.fyi.len()
    }

    /// Sorts every section's items by `rank_score` descending, then by the
    /// first citation's `evidence_id` lexicographically (§5).
    pub fn sort_all(&mut self) {
        for section in [
            &mut self.my_actions,
            &mut self.others_actions,
            &mut self.deadlines_meetings,
            &mut self.risks_blockers,
            &mut self.fyi,
        ] {
            section.sort_by(|a, b| {
                b.rank_score
                    .partial_cmp(&a.rank_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| first_evidence_id(a).cmp(&first_evidence_id(b)))
            });
        }
    }
}

/// The `evidence_id` of an item's first citation, recomputed with
/// [`crate::chunk::evidence_id_for`] (the same deterministic function that
/// assigned it) since `DigestItem` does not itself carry an `evidence_id`.
fn first_evidence_id(item: &DigestItem) -> String {
    item.citations
        .first()
        .map(|c| crate::chunk::evidence_id_for(&c.message_id, c.start, c.end))
        .unwrap_or_default()
}

/// Why a run produced `partial=true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    LlmTimeout,
    LlmTransport,
    LlmSchema,
    BudgetExhausted,
    CitationMismatch,
}

/// Why hierarchical mode did or did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    AutoThreads,
    AutoMessages,
    Manual,
    Disabled,
}

/// The top-level output envelope.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Digest {
    pub schema_version: String,
    pub prompt_version: String,
    /// The date this digest covers, `YYYY-MM-DD`.
    pub digest_date: String,
    pub trace_id: String,
    /// IANA or fixed-offset label for the mailbox timezone used throughout.
    pub timezone: String,
    #[serde(flatten)]
    pub sections: DigestSections,
    pub rendered_summary: Option<String>,
    pub total_messages_processed: usize,
    pub messages_with_actions: usize,
    pub partial: bool,
    pub degrade_reason: Option<DegradeReason>,
}

impl Digest {
    /// An empty envelope for a day with no fetched messages (§8 scenario 1).
    pub fn empty(digest_date: String, trace_id: String, timezone: String, prompt_version: String) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            prompt_version,
            digest_date,
            trace_id,
            timezone,
            sections: DigestSections::default(),
            rendered_summary: Some("Nothing to report for this date.".to_string()),
            total_messages_processed: 0,
            messages_with_actions: 0,
            partial: false,
            degrade_reason: None,
        }
    }
}

/// One raw record as returned by a [`crate::mailbox::MailboxDriver`], before
/// normalization. Fields mirror the mailbox driver contract in `SPEC_FULL.md`
/// §6.1 and may be incomplete — Normalize validates required fields and
/// raises [`crate::errors::AppError::InputSchema`] when they are missing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawDriverRecord {
    pub item_id: String,
    pub conversation_id: Option<String>,
    pub in_reply_to: Vec<String>,
    /// RFC 3339 instant; may lack an offset if the driver misbehaves, which
    /// is the naive-datetime case handled by `fail_on_naive` (§4.1).
    pub received_at: String,
    pub from_email: String,
    pub from_name: Option<String>,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_plain: Option<String>,
    pub importance: Importance,
    pub is_flagged: bool,
    pub attachment_types: Vec<String>,
    pub headers: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn citation(message_id: &str) -> Citation {
        Citation {
            message_id: message_id.to_string(),
            start: 0,
            end: 3,
            preview: "abc".to_string(),
            checksum: None,
        }
    }

    fn item(rank_score: f64, message_id: &str) -> DigestItem {
        DigestItem {
            title: "t".to_string(),
            description: String::new(),
            quote: "quoted text here".to_string(),
            owners: vec![],
            participants: vec![],
            due_date: None,
            due_date_normalized: None,
            due_date_label: None,
            confidence: Confidence::Medium,
            email_subject: "s".to_string(),
            rank_score,
            citations: vec![citation(message_id)],
        }
    }

    #[test]
    fn sort_all_orders_by_rank_score_desc_then_evidence_tiebreak() {
        // `evidence_id_for` hashes (message_id, start, end); compute the
        // expected lexicographic order from the real function rather than
        // the message_ids themselves, since the tie-break key is the hash.
        let id_m1 = crate::chunk::evidence_id_for("m1", 0, 3);
        let id_m2 = crate::chunk::evidence_id_for("m2", 0, 3);
        let (lower, higher) = if id_m1 <= id_m2 { ("m1", "m2") } else { ("m2", "m1") };

        let mut sections = DigestSections::default();
        sections.fyi = vec![item(0.5, higher), item(0.9, lower), item(0.5, lower)];
        sections.sort_all();
        assert_eq!(sections.fyi[0].rank_score, 0.9);
        assert_eq!(sections.fyi[1].citations[0].message_id, lower);
        assert_eq!(sections.fyi[2].citations[0].message_id, higher);
    }

    #[test]
    fn first_evidence_id_recomputes_from_citation_offsets_not_preview_text() {
        let mut a = item(0.5, "m1");
        a.citations[0].preview = "same-preview".to_string();
        let mut b = item(0.5, "m2");
        b.citations[0].preview = "same-preview".to_string();
        assert_ne!(first_evidence_id(&a), first_evidence_id(&b));
        assert_eq!(first_evidence_id(&a), crate::chunk::evidence_id_for("m1", 0, 3));
    }

    #[test]
    fn empty_digest_has_zero_counts_and_is_not_partial() {
        let digest = Digest::empty(
            "2024-12-15".to_string(),
            "trace-1".to_string(),
            "-03:00".to_string(),
            "v1".to_string(),
        );
        assert_eq!(digest.total_messages_processed, 0);
        assert!(!digest.partial);
        assert_eq!(digest.sections.total_items(), 0);
        assert_eq!(digest.schema_version, SCHEMA_VERSION);
    }
}
