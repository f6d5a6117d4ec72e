//! Assemble stage
//!
//! Builds the final [`Digest`] envelope from validated sections and renders
//! the short human-readable Markdown view (`spec.md` §4.8). The structured
//! envelope is the contract; the rendered view is a convenience the core
//! still owns end to end, so it never drifts from the evidence.

use crate::chunk::evidence_id_for;
use crate::types::{Citation, DegradeReason, Digest, DigestItem, DigestSections};

const RENDERED_WORD_BUDGET: usize = 400;

/// Assemble the top-level envelope. `sections` is expected to already be
/// sorted (`DigestSections::sort_all`); this function does not re-sort.
#[allow(clippy::too_many_arguments)]
pub fn assemble_digest(
    digest_date: String,
    trace_id: String,
    timezone: String,
    prompt_version: String,
    mut sections: DigestSections,
    total_messages_processed: usize,
    partial: bool,
    degrade_reason: Option<DegradeReason>,
) -> Digest {
    sections.sort_all();
    let messages_with_actions = count_messages_with_actions(&sections);
    let rendered_summary = Some(render_markdown(&sections));

    Digest {
        schema_version: crate::types::SCHEMA_VERSION.to_string(),
        prompt_version,
        digest_date,
        trace_id,
        timezone,
        sections,
        rendered_summary,
        total_messages_processed,
        messages_with_actions,
        partial,
        degrade_reason,
    }
}

fn count_messages_with_actions(sections: &DigestSections) -> usize {
    let mut ids: Vec<&str> = Vec::new();
    for item in sections.my_actions.iter().chain(sections.others_actions.iter()) {
        for citation in &item.citations {
            ids.push(citation.message_id.as_str());
        }
    }
    ids.sort_unstable();
    ids.dedup();
    ids.len()
}

/// Render the short human-readable view: each item's title, optional
/// due/label, owners, a citation reference, and the quote, capped at
/// [`RENDERED_WORD_BUDGET`] words total.
fn render_markdown(sections: &DigestSections) -> String {
    let mut out = String::new();
    let mut words_used = 0usize;

    for (heading, items) in [
        ("My Actions", &sections.my_actions),
        ("Others' Actions", &sections.others_actions),
        ("Deadlines & Meetings", &sections.deadlines_meetings),
        ("Risks & Blockers", &sections.risks_blockers),
        ("FYI", &sections.fyi),
    ] {
        if items.is_empty() {
            continue;
        }
        let heading_line = format!("## {heading}\n");
        if !push_within_budget(&mut out, &heading_line, &mut words_used) {
            break;
        }
        let mut wrote_any = false;
        for item in items {
            let line = render_item_line(item);
            if !push_within_budget(&mut out, &line, &mut words_used) {
                break;
            }
            wrote_any = true;
        }
        if !wrote_any {
            break;
        }
    }

    if out.is_empty() {
        return "Nothing to report for this date.".to_string();
    }
    out.trim_end().to_string()
}

fn render_item_line(item: &DigestItem) -> String {
    let mut line = format!("- **{}**", item.title);
    if let Some(label) = item.due_date_label {
        line.push_str(&format!(" ({label:?})"));
    } else if let Some(due) = &item.due_date {
        line.push_str(&format!(" (due {due})"));
    }
    if !item.owners.is_empty() {
        line.push_str(&format!(" — owners: {}", item.owners.join(", ")));
    }
    line.push_str(&format!(" [{}]", citation_reference(item)));
    line.push_str(&format!(" — \"{}\"\n", truncate_quote(&item.quote)));
    line
}

/// Builds the `"source: <subject>, evidence <evidence_id>"` reference
/// required by §4.8. `Citation` carries the raw span rather than the id
/// itself, so the id is recomputed the same deterministic way `chunk.rs`
/// assigns it in the first place.
fn citation_reference(item: &DigestItem) -> String {
    match item.citations.first() {
        Some(citation) => format!(
            "source: {}, evidence {}",
            item.email_subject,
            evidence_id_for(&citation.message_id, citation.start, citation.end)
        ),
        None => format!("source: {}", item.email_subject),
    }
}

fn truncate_quote(quote: &str) -> String {
    const MAX_CHARS: usize = 160;
    if quote.chars().count() <= MAX_CHARS {
        return quote.to_string();
    }
    let truncated: String = quote.chars().take(MAX_CHARS).collect();
    format!("{truncated}\u{2026}")
}

fn push_within_budget(out: &mut String, line: &str, words_used: &mut usize) -> bool {
    let words = line.split_whitespace().count();
    if *words_used + words > RENDERED_WORD_BUDGET {
        return false;
    }
    out.push_str(line);
    *words_used += words;
    true
}
