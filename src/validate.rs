//! Validate & cite stage
//!
//! Parses the language model's textual response under a strict contract (no
//! repair beyond trimming and fenced-block extraction), validates the
//! result against the digest schema, attaches citations, and falls back to
//! the extractive degrade path on terminal failure (`spec.md` §4.7).

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;

use crate::errors::{AppError, AppResult};
use crate::extract::extract_from_chunk;
use crate::rank::{is_service_sender, RankCandidate};
use crate::types::{
    ActionKind, Citation, Confidence, DegradeReason, DigestItem, DigestSections, DueDateLabel, EvidenceChunk, ExtractedAction, Message, Thread,
};

/// One evidence chunk indexed by its `evidence_id`, carrying just enough
/// context to attach and verify a citation.
#[derive(Clone)]
pub struct EvidenceRef {
    pub message_id: String,
    pub content: String,
    pub start_offset: usize,
    pub checksum: String,
}

pub type EvidenceIndex = HashMap<String, EvidenceRef>;

pub fn build_evidence_index(chunks: &[EvidenceChunk], messages_by_id: &HashMap<String, &Message>) -> EvidenceIndex {
    chunks
        .iter()
        .map(|c| {
            let checksum = messages_by_id.get(&c.message_id).map(|m| m.body_checksum.clone()).unwrap_or_default();
            (
                c.evidence_id.clone(),
                EvidenceRef {
                    message_id: c.message_id.clone(),
                    content: c.content.clone(),
                    start_offset: c.start_offset,
                    checksum,
                },
            )
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ParsedItem {
    title: String,
    #[serde(default)]
    description: String,
    quote: String,
    #[serde(default)]
    owners: Vec<String>,
    #[serde(default)]
    participants: Vec<String>,
    due_date: Option<String>,
    confidence: String,
    email_subject: String,
    evidence_id: String,
}

#[derive(Debug, Deserialize, Default)]
struct ParsedSections {
    #[serde(default)]
    my_actions: Vec<ParsedItem>,
    #[serde(default)]
    others_actions: Vec<ParsedItem>,
    #[serde(default)]
    deadlines_meetings: Vec<ParsedItem>,
    #[serde(default)]
    risks_blockers: Vec<ParsedItem>,
    #[serde(default)]
    fyi: Vec<ParsedItem>,
}

/// Extract a single JSON object from the model's response: accepts a bare
/// object, an object inside a fenced code block, or JSON followed by free
/// text (extracted by brace counting). No trailing-comma or quote repair is
/// ever applied — a malformed object is a parse failure.
pub fn extract_json_object(text: &str) -> AppResult<String> {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        let after_lang = after_fence.trim_start_matches(|c: char| c.is_alphanumeric());
        if let Some(end) = after_lang.find("```") {
            let candidate = after_lang[..end].trim();
            if candidate.starts_with('{') {
                return Ok(candidate.to_string());
            }
        }
    }

    if trimmed.starts_with('{') {
        if let Some(object) = brace_counted_prefix(trimmed) {
            return Ok(object);
        }
    }

    if let Some(brace_pos) = trimmed.find('{') {
        if let Some(object) = brace_counted_prefix(&trimmed[brace_pos..]) {
            return Ok(object);
        }
    }

    Err(AppError::LlmSchema("no JSON object found in model response".to_string()))
}

fn brace_counted_prefix(text: &str) -> Option<String> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the model's response into typed sections, or an `LlmSchema` error
/// if the response is not valid JSON matching the shape.
pub fn parse_model_response(text: &str) -> AppResult<ParsedSections> {
    let object = extract_json_object(text)?;
    serde_json::from_str(&object).map_err(|e| AppError::LlmSchema(format!("response does not match digest schema: {e}")))
}

fn parse_confidence(raw: &str) -> AppResult<Confidence> {
    match raw {
        "high" => Ok(Confidence::High),
        "medium" => Ok(Confidence::Medium),
        "low" => Ok(Confidence::Low),
        other => Err(AppError::LlmSchema(format!("invalid confidence value: {other}"))),
    }
}

/// Whitespace-tolerant match of `quote` against the evidence content it
/// claims to cite. Returns the exact byte offsets within the evidence's
/// source message body on success.
fn locate_quote(evidence: &EvidenceRef, quote: &str) -> Option<(usize, usize)> {
    if let Some(local_start) = evidence.content.find(quote) {
        let start = evidence.start_offset + local_start;
        return Some((start, start + quote.len()));
    }

    let normalized_quote: String = quote.split_whitespace().collect::<Vec<_>>().join(" ");
    let normalized_content: String = evidence.content.split_whitespace().collect::<Vec<_>>().join(" ");
    normalized_content.find(&normalized_quote).map(|_| {
        let start = evidence.start_offset;
        (start, start + evidence.content.len())
    })
}

fn attach_citation(index: &EvidenceIndex, item: &ParsedItem, validate_citations: bool) -> AppResult<Citation> {
    let evidence = index
        .get(&item.evidence_id)
        .ok_or_else(|| AppError::CitationMismatch(format!("unknown evidence id {}", item.evidence_id)))?;

    match locate_quote(evidence, &item.quote) {
        Some((start, end)) => Ok(Citation {
            message_id: evidence.message_id.clone(),
            start,
            end,
            preview: item.quote.clone(),
            checksum: Some(evidence.checksum.clone()),
        }),
        None if validate_citations => Err(AppError::CitationMismatch(format!(
            "quote does not match evidence {}",
            item.evidence_id
        ))),
        None => Ok(Citation {
            message_id: evidence.message_id.clone(),
            start: evidence.start_offset,
            end: evidence.start_offset + evidence.content.len(),
            preview: item.quote.clone(),
            checksum: Some(evidence.checksum.clone()),
        }),
    }
}

fn compute_due_date_label(due_date_normalized: Option<DateTime<FixedOffset>>, digest_date: DateTime<FixedOffset>) -> Option<DueDateLabel> {
    let due = due_date_normalized?;
    let delta_hours = (due - digest_date).num_hours();
    if !(0..=48).contains(&delta_hours) {
        return None;
    }
    if due.date_naive() == digest_date.date_naive() {
        Some(DueDateLabel::Today)
    } else {
        Some(DueDateLabel::Tomorrow)
    }
}

fn convert_item(item: ParsedItem, index: &EvidenceIndex, digest_date: DateTime<FixedOffset>, validate_citations: bool, citation_failures: &mut u32) -> AppResult<Option<DigestItem>> {
    if item.quote.len() < 10 {
        return Err(AppError::LlmSchema("quote shorter than 10 characters".to_string()));
    }
    let confidence = parse_confidence(&item.confidence)?;

    let citation = match attach_citation(index, &item, validate_citations) {
        Ok(c) => c,
        Err(e) if validate_citations => return Err(e),
        Err(_) => {
            *citation_failures += 1;
            return Ok(None);
        }
    };

    let due_date_normalized = item
        .due_date
        .as_deref()
        .and_then(|d| DateTime::parse_from_rfc3339(&format!("{d}T00:00:00{}", digest_date.offset())).ok());
    let due_date_label = compute_due_date_label(due_date_normalized, digest_date);

    Ok(Some(DigestItem {
        title: item.title,
        description: item.description,
        quote: item.quote,
        owners: item.owners,
        participants: item.participants,
        due_date: item.due_date,
        due_date_normalized,
        due_date_label,
        confidence,
        email_subject: item.email_subject,
        rank_score: 0.0,
        citations: vec![citation],
    }))
}

/// Validate a parsed model response and assemble it into [`DigestSections`],
/// attaching citations and recording citation-mismatch counts. Returns the
/// sections plus how many citation mismatches were tolerated (non-zero only
/// when `validate_citations` is `false`).
pub fn validate_and_assemble(
    text: &str,
    index: &EvidenceIndex,
    digest_date: DateTime<FixedOffset>,
    validate_citations: bool,
) -> AppResult<(DigestSections, u32)> {
    let parsed = parse_model_response(text)?;
    let mut citation_failures = 0;

    let mut sections = DigestSections::default();
    sections.my_actions = convert_section(parsed.my_actions, index, digest_date, validate_citations, &mut citation_failures)?;
    sections.others_actions = convert_section(parsed.others_actions, index, digest_date, validate_citations, &mut citation_failures)?;
    sections.deadlines_meetings = convert_section(parsed.deadlines_meetings, index, digest_date, validate_citations, &mut citation_failures)?;
    sections.risks_blockers = convert_section(parsed.risks_blockers, index, digest_date, validate_citations, &mut citation_failures)?;
    sections.fyi = convert_section(parsed.fyi, index, digest_date, validate_citations, &mut citation_failures)?;

    Ok((sections, citation_failures))
}

fn convert_section(
    items: Vec<ParsedItem>,
    index: &EvidenceIndex,
    digest_date: DateTime<FixedOffset>,
    validate_citations: bool,
    citation_failures: &mut u32,
) -> AppResult<Vec<DigestItem>> {
    let mut out = Vec::new();
    for item in items {
        if let Some(digest_item) = convert_item(item, index, digest_date, validate_citations, citation_failures)? {
            out.push(digest_item);
        }
    }
    Ok(out)
}

/// Build a digest directly from rule-extracted actions and ranked chunks
/// when the language-model call fails terminally (§4.7 extractive
/// fallback). Sets `degrade_reason` on the caller's envelope.
pub fn extractive_degrade(
    actions: &[ExtractedAction],
    ranked: &[(RankCandidate<'_>, f64)],
    user_email: &str,
) -> DigestSections {
    let mut sections = DigestSections::default();

    for action in actions {
        let citation = action.citations.first().cloned().unwrap_or(Citation {
            message_id: action.message_id.clone(),
            start: 0,
            end: action.text.len().max(10),
            preview: action.text.clone(),
            checksum: None,
        });
        let item = DigestItem {
            title: action.text.chars().take(80).collect(),
            description: String::new(),
            quote: if action.text.len() >= 10 {
                action.text.clone()
            } else {
                format!("{:<10}", action.text)
            },
            owners: vec![action.who.clone()],
            participants: vec![],
            due_date: action.deadline.clone(),
            due_date_normalized: None,
            due_date_label: None,
            confidence: confidence_tier(action.confidence),
            email_subject: String::new(),
            rank_score: action.confidence,
            citations: vec![citation],
        };

        match action.kind {
            ActionKind::Action if action.who.eq_ignore_ascii_case(user_email) => sections.my_actions.push(item),
            ActionKind::Action => sections.others_actions.push(item),
            ActionKind::Question => sections.fyi.push(item),
            ActionKind::Mention => sections.fyi.push(item),
        }
    }

    for (candidate, score) in ranked {
        if is_service_sender(&candidate.message.from_email, &candidate.message.subject) {
            continue;
        }
        if candidate.chunk.content.len() < 10 {
            continue;
        }
        let citation = Citation {
            message_id: candidate.message.message_id.clone(),
            start: candidate.chunk.start_offset,
            end: candidate.chunk.end_offset,
            preview: candidate.chunk.content.chars().take(150).collect(),
            checksum: Some(candidate.message.body_checksum.clone()),
        };
        let item = DigestItem {
            title: candidate.message.subject.chars().take(80).collect(),
            description: String::new(),
            quote: candidate.chunk.content.chars().take(200).collect(),
            owners: vec![],
            participants: vec![candidate.message.from_email.clone()],
            due_date: None,
            due_date_normalized: None,
            due_date_label: None,
            confidence: Confidence::Low,
            email_subject: candidate.message.subject.clone(),
            rank_score: *score,
            citations: vec![citation],
        };

        if candidate.chunk.signals.has_deadline_expression {
            sections.deadlines_meetings.push(item);
        } else if candidate.message.importance == crate::types::Importance::High || is_blocker_subject(&candidate.message.subject) {
            sections.risks_blockers.push(item);
        } else {
            sections.fyi.push(item);
        }
    }

    sections.sort_all();
    sections
}

fn confidence_tier(score: f64) -> Confidence {
    if score >= 0.75 {
        Confidence::High
    } else if score >= 0.5 {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

fn is_blocker_subject(subject: &str) -> bool {
    subject.to_lowercase().contains("blocker") || subject.to_lowercase().contains("blocked")
}

/// Build a rule-based set of extracted actions for a whole set of threads,
/// reusing [`crate::extract::extract_from_chunk`] per chunk.
pub fn extract_all(threads: &[Thread], chunks_by_thread: &HashMap<String, Vec<EvidenceChunk>>, user_email: &str, user_aliases: &[String], cfg: &crate::config::PipelineConfig) -> Vec<ExtractedAction> {
    let mut out = Vec::new();
    for thread in threads {
        let messages_by_id: HashMap<String, &Message> = thread.messages.iter().map(|m| (m.message_id.clone(), m)).collect();
        if let Some(chunks) = chunks_by_thread.get(&thread.thread_id) {
            for chunk in chunks {
                if let Some(message) = messages_by_id.get(&chunk.message_id) {
                    out.extend(extract_from_chunk(chunk, message, user_email, user_aliases, cfg));
                }
            }
        }
    }
    out
}

/// Map an [`AppError`] to the [`DegradeReason`] recorded on the envelope.
pub fn degrade_reason_for(error: &AppError) -> DegradeReason {
    match error {
        AppError::LlmTimeout(_) | AppError::Timeout(_) => DegradeReason::LlmTimeout,
        AppError::LlmTransport(_) => DegradeReason::LlmTransport,
        AppError::LlmSchema(_) => DegradeReason::LlmSchema,
        AppError::BudgetExhausted(_) => DegradeReason::BudgetExhausted,
        AppError::CitationMismatch(_) => DegradeReason::CitationMismatch,
        _ => DegradeReason::LlmTransport,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_object_accepts_bare_object() {
        let text = r#"{"my_actions": []}"#;
        assert_eq!(extract_json_object(text).unwrap(), text);
    }

    #[test]
    fn extract_json_object_accepts_fenced_block() {
        let text = "```json\n{\"my_actions\": []}\n```";
        assert_eq!(extract_json_object(text).unwrap(), "{\"my_actions\": []}");
    }

    #[test]
    fn extract_json_object_extracts_prefix_via_brace_counting() {
        let text = r#"{"my_actions": []} some trailing prose about next steps"#;
        assert_eq!(extract_json_object(text).unwrap(), r#"{"my_actions": []}"#);
    }

    #[test]
    fn extract_json_object_rejects_non_json_text() {
        assert!(extract_json_object("just some prose, no object here").is_err());
    }

    #[test]
    fn extract_json_object_does_not_repair_trailing_commas() {
        let text = r#"{"my_actions": [],}"#;
        let object = extract_json_object(text).unwrap();
        assert!(parse_model_response(&object).is_err());
    }

    fn evidence_index() -> EvidenceIndex {
        let mut index = HashMap::new();
        index.insert(
            "ev1".to_string(),
            EvidenceRef {
                message_id: "m1".to_string(),
                content: "Please approve the Q3 budget by Friday.".to_string(),
                start_offset: 0,
                checksum: "chk".to_string(),
            },
        );
        index
    }

    #[test]
    fn validate_and_assemble_attaches_matching_citation() {
        let text = r#"{"my_actions": [{"title": "Approve Q3 budget", "description": "", "quote": "Please approve the Q3 budget by Friday.", "owners": ["alice"], "participants": [], "due_date": null, "confidence": "high", "email_subject": "Q3 Budget plan", "evidence_id": "ev1"}], "others_actions": [], "deadlines_meetings": [], "risks_blockers": [], "fyi": []}"#;
        let index = evidence_index();
        let digest_date = DateTime::parse_from_rfc3339("2024-12-15T00:00:00-03:00").unwrap();
        let (sections, failures) = validate_and_assemble(text, &index, digest_date, false).unwrap();
        assert_eq!(sections.my_actions.len(), 1);
        assert_eq!(failures, 0);
        assert_eq!(sections.my_actions[0].citations[0].message_id, "m1");
    }

    #[test]
    fn validate_and_assemble_rejects_quote_shorter_than_ten_chars() {
        let text = r#"{"my_actions": [{"title": "x", "description": "", "quote": "short", "owners": [], "participants": [], "due_date": null, "confidence": "high", "email_subject": "s", "evidence_id": "ev1"}], "others_actions": [], "deadlines_meetings": [], "risks_blockers": [], "fyi": []}"#;
        let index = evidence_index();
        let digest_date = DateTime::parse_from_rfc3339("2024-12-15T00:00:00-03:00").unwrap();
        assert!(validate_and_assemble(text, &index, digest_date, false).is_err());
    }

    #[test]
    fn validate_and_assemble_counts_citation_mismatch_without_hard_failure() {
        let text = r#"{"my_actions": [{"title": "x", "description": "", "quote": "totally unrelated text here", "owners": [], "participants": [], "due_date": null, "confidence": "high", "email_subject": "s", "evidence_id": "ev1"}], "others_actions": [], "deadlines_meetings": [], "risks_blockers": [], "fyi": []}"#;
        let index = evidence_index();
        let digest_date = DateTime::parse_from_rfc3339("2024-12-15T00:00:00-03:00").unwrap();
        let (sections, failures) = validate_and_assemble(text, &index, digest_date, false).unwrap();
        assert_eq!(sections.my_actions.len(), 0);
        assert_eq!(failures, 1);
    }

    #[test]
    fn validate_citations_promotes_mismatch_to_hard_failure() {
        let text = r#"{"my_actions": [{"title": "x", "description": "", "quote": "totally unrelated text here", "owners": [], "participants": [], "due_date": null, "confidence": "high", "email_subject": "s", "evidence_id": "ev1"}], "others_actions": [], "deadlines_meetings": [], "risks_blockers": [], "fyi": []}"#;
        let index = evidence_index();
        let digest_date = DateTime::parse_from_rfc3339("2024-12-15T00:00:00-03:00").unwrap();
        assert!(validate_and_assemble(text, &index, digest_date, true).is_err());
    }
}
