//! Normalize stage
//!
//! Turns one [`crate::types::RawDriverRecord`] into one
//! [`crate::types::Message`], or a skip signal (service mail, delivery
//! notification, out-of-office). Orchestrates [`crate::html_text`],
//! [`crate::cleaner`], unicode composition, truncation, and timezone
//! handling (`spec.md` §4.1).

use chrono::{DateTime, FixedOffset, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::cleaner::{self, CleanerHeaders};
use crate::config::PipelineConfig;
use crate::errors::{AppError, AppResult};
use crate::message_id::{self, split_references};
use crate::observability::ObservabilitySink;
use crate::types::{Importance, Message, RawDriverRecord};

const TRUNCATION_SENTINEL: &str = "\n\n[TRUNCATED]";

/// Outcome of normalizing one driver record.
pub enum NormalizeOutcome {
    Message(Box<Message>),
    /// The record was recognized as service mail / an autoresponse and
    /// should not flow further down the pipeline.
    Skipped,
}

/// Normalize one raw driver record into a [`Message`].
///
/// # Errors
///
/// Returns [`AppError::InputSchema`] when required fields are missing, and
/// [`AppError::TzInvariant`] when `received_at` is naive and
/// `cfg.fail_on_naive` is set.
pub fn normalize_record(
    record: &RawDriverRecord,
    cfg: &PipelineConfig,
    sink: &dyn ObservabilitySink,
) -> AppResult<NormalizeOutcome> {
    if record.item_id.trim().is_empty() {
        sink.inc("ingest_skipped_total", &[]);
        return Err(AppError::InputSchema("driver record missing item_id".to_string()));
    }
    if record.from_email.trim().is_empty() {
        sink.inc("ingest_skipped_total", &[]);
        return Err(AppError::InputSchema("driver record missing from_email".to_string()));
    }

    let received_at = parse_received_at(&record.received_at, cfg, sink)?;

    let internet_message_id = header_value(&record.headers, "message-id");
    let message_id = message_id::normalize_message_id(internet_message_id.as_deref(), &record.item_id);

    let mut in_reply_to: Vec<String> = record.in_reply_to.iter().map(|s| message_id::normalize_reference(s)).collect();
    if let Some(refs) = header_value(&record.headers, "references") {
        in_reply_to.extend(split_references(&refs));
    }
    if let Some(parent) = header_value(&record.headers, "in-reply-to") {
        in_reply_to.extend(split_references(&parent));
    }
    in_reply_to.sort();
    in_reply_to.dedup();

    let headers = CleanerHeaders {
        auto_submitted: header_value(&record.headers, "auto-submitted"),
        x_autoreply: header_value(&record.headers, "x-autoreply").is_some(),
    };

    let raw_text = extract_body_text(record, sink)?;
    let unicode_clean = normalize_unicode(&raw_text);

    let cleaned = cleaner::clean_email_body(&record.subject, &unicode_clean, &headers, cfg);
    if cleaned.is_autoresponse {
        sink.inc("ingest_skipped_total", &[]);
        return Ok(NormalizeOutcome::Skipped);
    }
    if cleaned.quote_removal_capped {
        sink.inc("cleaner_quote_removal_capped_total", &[]);
    }
    for span in &cleaned.removed {
        let label = match span.kind {
            cleaner::RemovedSpanKind::Autoresponse => "autoresponse",
            cleaner::RemovedSpanKind::Disclaimer => "disclaimer",
            cleaner::RemovedSpanKind::Signature => "signature",
            cleaner::RemovedSpanKind::Quote => "quote",
        };
        sink.inc_counter(
            "email_cleaner_removed_chars_total",
            &[("type", label)],
            span.content.chars().count() as u64,
        );
    }

    let body_normalized = truncate_body(&cleaned.text, cfg.max_body_bytes);
    let body_checksum = sha256_hex(&body_normalized);

    let message = Message {
        message_id,
        conversation_id: record.conversation_id.clone(),
        in_reply_to,
        received_at,
        from_email: record.from_email.to_ascii_lowercase(),
        from_name: record.from_name.clone(),
        to_emails: record.to_emails.iter().map(|s| s.to_ascii_lowercase()).collect(),
        cc_emails: record.cc_emails.iter().map(|s| s.to_ascii_lowercase()).collect(),
        subject: record.subject.clone(),
        body_normalized,
        importance: record.importance,
        is_flagged: record.is_flagged,
        has_attachments: !record.attachment_types.is_empty(),
        attachment_types: record.attachment_types.clone(),
        body_checksum,
    };

    sink.inc_counter("messages_fetched_total", &[("status", "normalized")], 1);
    Ok(NormalizeOutcome::Message(Box::new(message)))
}

fn extract_body_text(record: &RawDriverRecord, sink: &dyn ObservabilitySink) -> AppResult<String> {
    match (&record.body_html, &record.body_plain) {
        (Some(html), plain) => match crate::html_text::html_to_text(html, plain.as_deref()) {
            Ok(text) => Ok(text),
            Err(_) => {
                sink.inc("html_parse_errors_total", &[]);
                Ok(plain.clone().unwrap_or_default())
            }
        },
        (None, Some(plain)) => Ok(plain.clone()),
        (None, None) => Err(AppError::InputSchema(format!(
            "driver record {} has neither body_html nor body_plain",
            record.item_id
        ))),
    }
}

fn normalize_unicode(text: &str) -> String {
    let composed: String = text.nfc().collect();
    replace_typographic_chars(&composed)
}

static ZERO_WIDTH: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\u{200B}\u{200C}\u{200D}\u{FEFF}]").expect("valid zero-width regex"));

fn replace_typographic_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\u{2018}' | '\u{2019}' | '\u{201B}' => out.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201F}' => out.push('"'),
            '\u{2013}' => out.push('-'),
            '\u{2014}' => out.push_str("--"),
            '\u{2026}' => out.push_str("..."),
            '\u{00A0}' => out.push(' '),
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' => {}
            other => out.push(other),
        }
    }
    ZERO_WIDTH.replace_all(&out, "").into_owned()
}

fn truncate_body(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let budget = max_bytes.saturating_sub(TRUNCATION_SENTINEL.len());
    let mut cut = budget.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let slice = &text[..cut];
    let boundary = slice
        .rfind("\n\n")
        .or_else(|| slice.rfind(". "))
        .map(|p| p + 1)
        .unwrap_or(cut);
    format!("{}{}", &text[..boundary], TRUNCATION_SENTINEL)
}

fn parse_received_at(raw: &str, cfg: &PipelineConfig, sink: &dyn ObservabilitySink) -> AppResult<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt);
    }
    // Naive instant: no offset present.
    if cfg.fail_on_naive {
        return Err(AppError::TzInvariant(format!("naive received_at '{raw}' with fail_on_naive set")));
    }
    sink.inc("tz_naive_total", &[]);
    let mailbox_offset = parse_fixed_offset(&cfg.timezone)?;
    let naive = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .map_err(|e| AppError::InputSchema(format!("unparseable received_at '{raw}': {e}")))?;
    mailbox_offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| AppError::InputSchema(format!("ambiguous local received_at '{raw}'")))
}

/// Parse a fixed UTC offset like `+03:00`/`-05:30`. Falls back to UTC for
/// any other string (IANA zone names are not resolved here; the pipeline
/// only uses fixed offsets, per `cfg.timezone`'s documented shape).
pub fn parse_fixed_offset(tz: &str) -> AppResult<FixedOffset> {
    if let Some(rest) = tz.strip_prefix('+').or_else(|| tz.strip_prefix('-')) {
        let sign = if tz.starts_with('-') { -1 } else { 1 };
        let mut parts = rest.split(':');
        let hours: i32 = parts
            .next()
            .and_then(|h| h.parse().ok())
            .ok_or_else(|| AppError::InvalidInput(format!("invalid timezone offset '{tz}'")))?;
        let minutes: i32 = parts.next().and_then(|m| m.parse().ok()).unwrap_or(0);
        let seconds = sign * (hours * 3600 + minutes * 60);
        return FixedOffset::east_opt(seconds).ok_or_else(|| AppError::InvalidInput(format!("out-of-range timezone offset '{tz}'")));
    }
    FixedOffset::east_opt(0).ok_or_else(|| AppError::InvalidInput(format!("unsupported timezone '{tz}'")))
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
