//! Email body cleaner
//!
//! Four ordered removal stages — autoresponse detection, legal disclaimers,
//! signatures, and quoted blocks — each producing `RemovedSpan`s that keep
//! offsets consistent with the body that remains. English and Russian
//! patterns throughout (`spec.md` §4.1). Grounded on the teacher's
//! `mime.rs` part-walking discipline (ordered, fallible, always-bounded),
//! generalized here from MIME parts to text spans; patterns are
//! precompiled with `once_cell::sync::Lazy`.

use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};

use crate::config::PipelineConfig;

/// One span removed by the cleaner, kept for observability only — never
/// persisted (`spec.md` §9 open question (c)).
#[derive(Debug, Clone)]
pub struct RemovedSpan {
    pub kind: RemovedSpanKind,
    pub start: usize,
    pub end: usize,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovedSpanKind {
    Autoresponse,
    Disclaimer,
    Signature,
    Quote,
}

/// Outcome of one cleaning pass.
#[derive(Debug, Clone)]
pub struct CleanResult {
    pub text: String,
    pub removed: Vec<RemovedSpan>,
    /// Set when the entire body was recognized as an autoresponse; the
    /// caller should skip the message entirely.
    pub is_autoresponse: bool,
    /// Set when the quote-removal safety cap tripped and the uncut body
    /// was used instead of the heuristically-cleaned one.
    pub quote_removal_capped: bool,
}

/// Headers consulted for autoresponse detection, alongside body patterns.
#[derive(Debug, Clone, Default)]
pub struct CleanerHeaders {
    pub auto_submitted: Option<String>,
    pub x_autoreply: bool,
}

static AUTORESPONSE_SUBJECT: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)^out of office",
        r"(?i)^automatic reply",
        r"(?i)^auto[- ]?reply",
        r"(?i)undeliverable",
        r"(?i)delivery status notification",
        r"(?i)^автоответ",
        r"(?i)не доставлено",
        r"(?i)уведомление о доставке",
    ])
    .expect("valid autoresponse subject set")
});

static AUTORESPONSE_BODY: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)i am currently out of the office",
        r"(?i)i will be out of office",
        r"(?i)this is an automated",
        r"(?i)мы получили ваше письмо",
        r"(?i)я нахожусь вне офиса",
        r"(?i)это автоматическое сообщение",
    ])
    .expect("valid autoresponse body set")
});

/// Stage 1: detect and, if the whole body is an autoresponse, mark it for
/// skipping. Detection uses headers first (cheap, authoritative), then
/// subject, then body patterns.
pub fn detect_autoresponse(subject: &str, body: &str, headers: &CleanerHeaders) -> bool {
    if headers.auto_submitted.as_deref().is_some_and(|v| !v.eq_ignore_ascii_case("no")) {
        return true;
    }
    if headers.x_autoreply {
        return true;
    }
    if AUTORESPONSE_SUBJECT.is_match(subject) {
        return true;
    }
    let head: String = body.chars().take(500).collect();
    AUTORESPONSE_BODY.is_match(&head)
}

static DISCLAIMER_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)confidentiality notice",
        r"(?i)this e-?mail (?:message )?(?:and any attachments )?(?:is|are) intended",
        r"(?i)this message contains confidential information",
        r"(?i)privacy policy",
        r"(?i)to unsubscribe",
        r"(?i)конфиденциальность",
        r"(?i)настоящее сообщение предназначено",
        r"(?i)отказ от ответственности",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid disclaimer pattern"))
    .collect()
});

/// Stage 2: legal disclaimers. Matched conservatively against the tail of
/// the message — once a marker is found, everything from its paragraph
/// start to the end of the body is removed.
fn strip_disclaimer(text: &str) -> (String, Option<RemovedSpan>) {
    let tail_start = text.len().saturating_sub(text.len().min(4000));
    let tail = &text[tail_start..];
    let mut earliest: Option<usize> = None;
    for re in DISCLAIMER_MARKERS.iter() {
        if let Some(m) = re.find(tail) {
            let abs = tail_start + m.start();
            earliest = Some(earliest.map_or(abs, |e: usize| e.min(abs)));
        }
    }
    let Some(marker_pos) = earliest else {
        return (text.to_string(), None);
    };
    let para_start = text[..marker_pos].rfind("\n\n").map(|p| p + 2).unwrap_or(0);
    let removed_content = text[para_start..].to_string();
    let mut kept = text[..para_start].to_string();
    trim_trailing_blank(&mut kept);
    (
        kept,
        Some(RemovedSpan {
            kind: RemovedSpanKind::Disclaimer,
            start: para_start,
            end: text.len(),
            content: removed_content,
        }),
    )
}

static SIGNATURE_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?im)^--\s*$",
        r"(?i)^best regards[,.]?\s*$",
        r"(?i)^kind regards[,.]?\s*$",
        r"(?i)^regards[,.]?\s*$",
        r"(?i)^thanks[,.]?\s*$",
        r"(?i)^sent from my iphone\s*$",
        r"(?i)^sent from my (?:android|mobile) device\s*$",
        r"(?i)^с уважением[,.]?\s*$",
        r"(?i)^с наилучшими пожеланиями[,.]?\s*$",
        r"(?i)^отправлено с iphone\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid signature pattern"))
    .collect()
});

/// Stage 3: signatures. Phrase patterns anchored to paragraph boundaries —
/// a marker line and everything after it is removed, as long as it is not
/// the very first line of the body (which would indicate a false match).
fn strip_signature(text: &str) -> (String, Option<RemovedSpan>) {
    for (line_idx, line) in text.lines().enumerate() {
        if line_idx == 0 {
            continue;
        }
        if SIGNATURE_MARKERS.iter().any(|re| re.is_match(line.trim_end())) {
            let byte_offset = line_byte_offset(text, line_idx);
            let removed_content = text[byte_offset..].to_string();
            let mut kept = text[..byte_offset].to_string();
            trim_trailing_blank(&mut kept);
            return (
                kept,
                Some(RemovedSpan {
                    kind: RemovedSpanKind::Signature,
                    start: byte_offset,
                    end: text.len(),
                    content: removed_content,
                }),
            );
        }
    }
    (text.to_string(), None)
}

static QUOTE_HEADER: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?im)^-{3,}\s*original message\s*-{3,}\s*$",
        r"(?im)^from:\s*.+$",
        r"(?im)^от:\s*.+$",
        r"(?im)^on .+ wrote:\s*$",
        r"(?im)^\d{1,2}[./]\d{1,2}[./]\d{2,4}.*(?:wrote|написал)[:]?\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid quote header pattern"))
    .collect()
});

/// Stage 4: quoted blocks. Finds the earliest quote boundary (a
/// `>`-prefixed line run, or a recognized quote header) and removes from
/// there to the end, honoring `keep_top_quote_head` and
/// `max_quote_removal_ratio`.
fn strip_quotes(text: &str, cfg: &PipelineConfig) -> (String, Option<RemovedSpan>, bool) {
    let boundary = find_quote_boundary(text);
    let Some(mut boundary) = boundary else {
        return (text.to_string(), None, false);
    };

    if cfg.keep_top_quote_head {
        boundary = advance_past_quote_head(text, boundary);
    }

    if boundary >= text.len() {
        return (text.to_string(), None, false);
    }

    let removal_len = text.len() - boundary;
    let ratio = removal_len as f64 / text.len().max(1) as f64;
    if ratio > cfg.max_quote_removal_ratio {
        return (text.to_string(), None, true);
    }

    let removed_content = text[boundary..].to_string();
    let mut kept = text[..boundary].to_string();
    trim_trailing_blank(&mut kept);
    (
        kept,
        Some(RemovedSpan {
            kind: RemovedSpanKind::Quote,
            start: boundary,
            end: text.len(),
            content: removed_content,
        }),
        false,
    )
}

fn find_quote_boundary(text: &str) -> Option<usize> {
    let mut earliest: Option<usize> = None;
    for re in QUOTE_HEADER.iter() {
        if let Some(m) = re.find(text) {
            earliest = Some(earliest.map_or(m.start(), |e: usize| e.min(m.start())));
        }
    }

    let mut consecutive_quote_lines = 0usize;
    let mut run_start: Option<usize> = None;
    for (idx, line) in text.lines().enumerate() {
        if line.trim_start().starts_with('>') {
            if run_start.is_none() {
                run_start = Some(line_byte_offset(text, idx));
            }
            consecutive_quote_lines += 1;
        } else {
            if consecutive_quote_lines >= 2 {
                if let Some(start) = run_start {
                    earliest = Some(earliest.map_or(start, |e: usize| e.min(start)));
                }
            }
            consecutive_quote_lines = 0;
            run_start = None;
        }
    }
    if consecutive_quote_lines >= 2 {
        if let Some(start) = run_start {
            earliest = Some(earliest.map_or(start, |e: usize| e.min(start)));
        }
    }

    earliest
}

/// Retain the first 1-2 paragraphs or 10 lines of the most recent quote
/// (whichever is smaller) when the receiver's own reply ahead of it is very
/// short.
fn advance_past_quote_head(text: &str, boundary: usize) -> usize {
    let reply = &text[..boundary];
    let reply_is_short = reply.trim().len() < 200;
    if !reply_is_short {
        return boundary;
    }

    let quoted = &text[boundary..];
    let mut paragraphs_seen = 0usize;
    let mut lines_seen = 0usize;
    let mut offset = 0usize;
    for line in quoted.lines() {
        lines_seen += 1;
        offset += line.len() + 1;
        if line.trim().is_empty() {
            paragraphs_seen += 1;
            if paragraphs_seen >= 2 {
                break;
            }
        }
        if lines_seen >= 10 {
            break;
        }
    }
    (boundary + offset).min(text.len())
}

fn line_byte_offset(text: &str, line_idx: usize) -> usize {
    text.lines().take(line_idx).map(|l| l.len() + 1).sum()
}

fn trim_trailing_blank(text: &mut String) {
    while text.ends_with('\n') || text.ends_with(' ') {
        text.pop();
    }
}

/// Run all four cleaning stages in order over `body`, given `subject` and
/// `headers` for autoresponse detection.
pub fn clean_email_body(
    subject: &str,
    body: &str,
    headers: &CleanerHeaders,
    cfg: &PipelineConfig,
) -> CleanResult {
    if detect_autoresponse(subject, body, headers) {
        return CleanResult {
            text: String::new(),
            removed: vec![RemovedSpan {
                kind: RemovedSpanKind::Autoresponse,
                start: 0,
                end: body.len(),
                content: body.to_string(),
            }],
            is_autoresponse: true,
            quote_removal_capped: false,
        };
    }

    let mut removed = Vec::new();
    let (after_disclaimer, disclaimer_span) = strip_disclaimer(body);
    removed.extend(disclaimer_span);

    let (after_signature, signature_span) = strip_signature(&after_disclaimer);
    removed.extend(signature_span);

    let (after_quotes, quote_span, capped) = strip_quotes(&after_signature, cfg);
    removed.extend(quote_span);

    CleanResult {
        text: after_quotes,
        removed,
        is_autoresponse: false,
        quote_removal_capped: capped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PipelineConfig {
        crate::config::test_support::default_pipeline_config()
    }

    #[test]
    fn detects_out_of_office_by_subject() {
        let headers = CleanerHeaders::default();
        assert!(detect_autoresponse("Out of Office: vacation", "body", &headers));
    }

    #[test]
    fn detects_autoresponse_by_header() {
        let headers = CleanerHeaders {
            auto_submitted: Some("auto-replied".to_string()),
            x_autoreply: false,
        };
        assert!(detect_autoresponse("Hi", "body", &headers));
    }

    #[test]
    fn does_not_flag_ordinary_mail_as_autoresponse() {
        let headers = CleanerHeaders::default();
        assert!(!detect_autoresponse("Q3 Budget plan", "Please approve the budget.", &headers));
    }

    #[test]
    fn strips_disclaimer_tail() {
        let body = "Please see attached.\n\nConfidentiality Notice: this message is confidential and intended only for the recipient.";
        let (kept, span) = strip_disclaimer(body);
        assert_eq!(kept, "Please see attached.");
        assert!(span.is_some());
    }

    #[test]
    fn strips_signature_after_marker_line() {
        let body = "Sounds good, thanks!\n\nBest regards,\nAlice\nSenior Manager";
        let (kept, span) = strip_signature(body);
        assert_eq!(kept, "Sounds good, thanks!");
        assert!(span.is_some());
    }

    #[test]
    fn removes_quoted_block_on_reply_heavy_english_body() {
        let cfg = cfg();
        let mut quoted_history = String::new();
        for i in 0..40 {
            quoted_history.push_str(&format!("> line {i} of the old thread content here\n"));
        }
        let body = format!("Sure, works for me.\n\nOn Mon, Jan 1, 2024 at 9:00 AM, Bob wrote:\n{quoted_history}");
        let original_len = body.len() as f64;
        let (kept, span, capped) = strip_quotes(&body, &cfg);
        assert!(!capped);
        assert!(span.is_some());
        let removed_len = original_len - kept.len() as f64;
        assert!(removed_len / original_len >= 0.40);
    }

    #[test]
    fn preserves_clean_body_verbatim() {
        let cfg = cfg();
        let body = "Please approve the Q3 budget by Friday.";
        let headers = CleanerHeaders::default();
        let result = clean_email_body("Q3 Budget plan", body, &headers, &cfg);
        assert_eq!(result.text, body);
        assert!(result.removed.is_empty());
    }

    #[test]
    fn quote_removal_safety_cap_falls_back_to_uncut_body() {
        let mut cfg = cfg();
        cfg.max_quote_removal_ratio = 0.0;
        let body = "Hi.\n\nOn Mon wrote:\n> quoted content here\n> more quoted content";
        let (kept, span, capped) = strip_quotes(body, &cfg);
        assert!(capped);
        assert!(span.is_none());
        assert_eq!(kept, body);
    }

    #[test]
    fn whole_body_autoresponse_is_marked_for_skip() {
        let cfg = cfg();
        let headers = CleanerHeaders::default();
        let result = clean_email_body("Automatic reply: Out of office", "I am currently out of the office.", &headers, &cfg);
        assert!(result.is_autoresponse);
    }

    #[test]
    fn clean_is_stable_after_one_pass() {
        let cfg = cfg();
        let headers = CleanerHeaders::default();
        let body = "Sounds good.\n\nBest regards,\nAlice";
        let once = clean_email_body("Re: plan", body, &headers, &cfg);
        let twice = clean_email_body("Re: plan", &once.text, &headers, &cfg);
        assert_eq!(once.text, twice.text);
    }
}
