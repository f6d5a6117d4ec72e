//! Prompt construction for the language-model calls
//!
//! Builds the text sent to the remote model for flat mode, per-thread
//! summarization, and final aggregation. The response *shape* is the
//! contract (`spec.md` §4.7, §9 open question (b)); phrasing here is this
//! implementation's own choice.

use crate::types::{EvidenceChunk, Message, Thread};

const SCHEMA_INSTRUCTION: &str = r#"Respond with a single JSON object only, matching this shape exactly:
{
  "my_actions": [ItemSpec...],
  "others_actions": [ItemSpec...],
  "deadlines_meetings": [ItemSpec...],
  "risks_blockers": [ItemSpec...],
  "fyi": [ItemSpec...]
}
ItemSpec = {
  "title": string,
  "description": string,
  "quote": string (>= 10 chars, copied verbatim from the evidence below),
  "owners": [string...],
  "participants": [string...],
  "due_date": string|null (YYYY-MM-DD),
  "confidence": "high"|"medium"|"low",
  "email_subject": string,
  "evidence_id": string (copy the evidence id shown above the quoted span)
}
Every item must cite an evidence id that appears below. Do not invent evidence ids."#;

/// Truncate prompt text to a hard character budget, so a single oversized
/// chunk cannot blow a request past the model's context window. Cuts on a
/// char boundary.
pub fn truncate_for_prompt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}\u{2026}")
}

fn chunk_header(chunk: &EvidenceChunk, message: &Message, thread: &Thread) -> String {
    let addressed_to_me = chunk.signals.mentions_user_alias;
    format!(
        "--- evidence_id={} message_id={} thread_id={} from={} to={} cc={} subject={:?} received_at={} importance={:?} flagged={} attachments={} addressed_to_me={} signals(question={},imperative={},deadline={},last_update={}) ---",
        chunk.evidence_id,
        message.message_id,
        thread.thread_id,
        message.from_email,
        message.to_emails.join(","),
        message.cc_emails.join(","),
        message.subject,
        message.received_at.to_rfc3339(),
        chunk.signals.sender_importance,
        message.is_flagged,
        message.has_attachments,
        addressed_to_me,
        chunk.signals.has_question_mark,
        chunk.signals.has_imperative_verb,
        chunk.signals.has_deadline_expression,
        chunk.signals.is_last_update_in_thread,
    )
}

/// Build the flat-mode prompt: one block per selected `(chunk, message,
/// thread)` triple, followed by the schema instruction.
pub fn build_flat_prompt(items: &[(&EvidenceChunk, &Message, &Thread)], digest_date: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("Daily email digest for {digest_date}. Evidence follows.\n\n"));
    for (chunk, message, thread) in items {
        out.push_str(&chunk_header(chunk, message, thread));
        out.push('\n');
        out.push_str(&truncate_for_prompt(&chunk.content, 2000));
        out.push_str("\n\n");
    }
    out.push_str(SCHEMA_INSTRUCTION);
    out
}

/// Build a per-thread summarization prompt: the thread's selected chunks
/// plus instructions for the bounded per-thread output shape (§4.6).
pub fn build_thread_prompt(thread: &Thread, chunks: &[&EvidenceChunk], messages_by_id: &std::collections::HashMap<String, &Message>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Summarize this email thread ({} messages). Evidence follows.\n\n",
        thread.messages.len()
    ));
    for chunk in chunks {
        if let Some(message) = messages_by_id.get(&chunk.message_id) {
            out.push_str(&chunk_header(chunk, message, thread));
            out.push('\n');
        }
        out.push_str(&truncate_for_prompt(&chunk.content, 1500));
        out.push_str("\n\n");
    }
    out.push_str(
        "Respond with JSON: {\"title\": string (<=90 tokens), \"citations\": [{\"evidence_id\": string, \"snippet\": string (<=150 chars)}] (3-5 entries), \"pending\": [{\"kind\": \"action\"|\"deadline\"|\"question\", \"evidence_id\": string, \"quote\": string (>=10 chars)}]}. Cite only evidence ids shown above.",
    );
    out
}

/// Build the one permitted repair prompt after a response fails schema
/// validation (`spec.md` §4.7: "retry the language-model call once with an
/// explicit repair instruction; on second failure, degrade"). Repeats the
/// original instructions, shows the rejected response and why it failed,
/// and asks for a single corrected JSON object.
pub fn build_repair_prompt(original_prompt: &str, bad_response: &str, validation_error: &str) -> String {
    format!(
        "{original_prompt}\n\nYour previous response failed validation: {validation_error}\nPrevious response:\n{}\n\nRespond again with a single corrected JSON object only, matching the schema above. Fix the reported error.",
        truncate_for_prompt(bad_response, 4000)
    )
}

/// Build the final aggregation prompt from per-thread summaries and the raw
/// chunks of bypassed small threads.
pub fn build_final_prompt(aggregated_context: &str, digest_date: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Daily email digest for {digest_date}, assembled from per-thread summaries and a few raw threads.\n\n"
    ));
    out.push_str(aggregated_context);
    out.push_str("\n\n");
    out.push_str(SCHEMA_INSTRUCTION);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkSignals, Importance, MergedBy};
    use chrono::DateTime;

    fn message() -> Message {
        Message {
            message_id: "m1".to_string(),
            conversation_id: None,
            in_reply_to: vec![],
            received_at: DateTime::parse_from_rfc3339("2024-12-15T09:00:00-03:00").unwrap(),
            from_email: "alice@corp.example".to_string(),
            from_name: None,
            to_emails: vec!["bob@corp.example".to_string()],
            cc_emails: vec![],
            subject: "Q3 Budget plan".to_string(),
            body_normalized: "Please approve the Q3 budget by Friday.".to_string(),
            importance: Importance::Normal,
            is_flagged: false,
            has_attachments: false,
            attachment_types: vec![],
            body_checksum: "chk".to_string(),
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

    fn chunk() -> EvidenceChunk {
        EvidenceChunk {
            evidence_id: "ev1".to_string(),
            message_id: "m1".to_string(),
            thread_id: "t1".to_string(),
            start_offset: 0,
            end_offset: 10,
            content: "Please approve the Q3 budget by Friday.".to_string(),
            token_count: 9,
            priority_score: 0.8,
            signals: ChunkSignals::default(),
        }
    }

    #[test]
    fn truncate_for_prompt_respects_char_budget() {
        let long = "x".repeat(100);
        let truncated = truncate_for_prompt(&long, 10);
        assert!(truncated.chars().count() <= 11);
        assert!(truncated.ends_with('\u{2026}'));
    }

    #[test]
    fn truncate_for_prompt_leaves_short_text_untouched() {
        assert_eq!(truncate_for_prompt("short", 100), "short");
    }

    #[test]
    fn flat_prompt_includes_evidence_id_and_schema_instruction() {
        let msg = message();
        let t = thread(vec![msg.clone()]);
        let c = chunk();
        let prompt = build_flat_prompt(&[(&c, &msg, &t)], "2024-12-15");
        assert!(prompt.contains("ev1"));
        assert!(prompt.contains("single JSON object"));
    }

    #[test]
    fn repair_prompt_carries_original_instructions_and_error() {
        let original = "Daily email digest for 2024-12-15. Evidence follows.\n\n...schema...";
        let prompt = build_repair_prompt(original, "not json", "no JSON object found in model response");
        assert!(prompt.contains("Evidence follows"));
        assert!(prompt.contains("no JSON object found in model response"));
        assert!(prompt.contains("not json"));
    }

    #[test]
    fn thread_prompt_lists_citation_count_bounds() {
        let msg = message();
        let t = thread(vec![msg.clone()]);
        let c = chunk();
        let mut by_id = std::collections::HashMap::new();
        by_id.insert("m1".to_string(), &msg);
        let prompt = build_thread_prompt(&t, &[&c], &by_id);
        assert!(prompt.contains("3-5 entries"));
    }
}
