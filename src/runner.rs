//! Pipeline runner
//!
//! Wires every stage into the end-to-end sequence described in
//! `SPEC_FULL.md` §2: Fetch → Normalize → Thread build → Chunk → Extract →
//! Select/Rank → Summarize → Validate & cite → Assemble → Persist. Mirrors
//! the teacher's `server.rs` role as the orchestration layer sitting above
//! individual operations, but drives one linear run instead of dispatching
//! MCP tool calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use crate::assemble::assemble_digest;
use crate::chunk::{chunk_thread, evidence_id_for};
use crate::cli::Window;
use crate::config::PipelineConfig;
use crate::errors::{AppError, AppResult};
use crate::llm_client::LanguageModelClient;
use crate::mailbox::{FetchWindow, MailboxDriver};
use crate::normalize::{normalize_record, parse_fixed_offset, NormalizeOutcome};
use crate::observability::ObservabilitySink;
use crate::persist;
use crate::rank::{rank_score, select_within_budget, RankCandidate};
use crate::summarize::{summarize, SummarizeOutcome};
use crate::thread_build::build_threads;
use crate::types::{Digest, DigestSections, EvidenceChunk, Message, Thread};
use crate::validate::{build_evidence_index, degrade_reason_for, extract_all, extractive_degrade, validate_and_assemble};

/// Parameters for one pipeline run that are not part of [`PipelineConfig`]
/// because they vary per invocation rather than per deployment (CLI flags,
/// `SPEC_FULL.md` §6).
pub struct RunRequest {
    pub from_date: String,
    pub window: Window,
    pub folders: Vec<String>,
    pub dry_run: bool,
    pub force: bool,
    pub validate_citations: bool,
}

/// Outcome of a run: the produced digest (absent for a `--dry-run`) and the
/// process exit code to use (0 success, 1 failure, 2 partial/warning).
pub struct RunReport {
    pub digest: Option<Digest>,
    pub exit_code: i32,
    pub reused_existing: bool,
}

/// Run the pipeline once, end to end.
///
/// # Errors
///
/// Returns an [`AppError`] only for the two fatal kinds (`TzInvariant`,
/// `Auth`) and for mailbox-fetch failures; every other failure degrades the
/// run and still produces output via [`RunReport`].
pub async fn run(
    cfg: &PipelineConfig,
    mailbox: Arc<dyn MailboxDriver>,
    llm: Arc<dyn LanguageModelClient>,
    sink: Arc<dyn ObservabilitySink>,
    request: RunRequest,
) -> AppResult<RunReport> {
    let build_started = Instant::now();
    let trace_id = Uuid::new_v4().to_string();
    let mailbox_offset = parse_fixed_offset(&cfg.timezone)?;
    let now = Utc::now();

    let (digest_date, window) = compute_window(&request.from_date, request.window, mailbox_offset, now)?;
    let digest_date_str = digest_date.format("%Y-%m-%d").to_string();

    if !request.force {
        let should_rebuild = persist::should_rebuild(&cfg.out_dir, &cfg.account_id, &digest_date_str, cfg.rebuild_window_hours, false, now).await;
        if !should_rebuild {
            if let Some(existing) = persist::load_existing(&cfg.out_dir, &cfg.account_id, &digest_date_str).await {
                sink.inc("runs_total", &[("status", "reused")]);
                return Ok(RunReport {
                    digest: Some(existing),
                    exit_code: 0,
                    reused_existing: true,
                });
            }
        }
    }

    let digest_now = mailbox_offset
        .from_utc_datetime(&now.naive_utc())
        .with_timezone(&mailbox_offset);

    // Stage 1: Fetch
    let records = mailbox.fetch(window, &request.folders).await?;
    sink.inc_counter("messages_fetched_total", &[("status", "fetched")], records.len() as u64);

    if records.is_empty() {
        let digest = Digest::empty(digest_date_str, trace_id, cfg.timezone.clone(), cfg.prompt_version.clone());
        persist::write_outputs(&cfg.out_dir, &cfg.account_id, &digest, now).await?;
        sink.inc("runs_total", &[("status", "success")]);
        sink.observe_histogram("digest_build_seconds", &[], build_started.elapsed().as_secs_f64());
        return Ok(RunReport {
            digest: Some(digest),
            exit_code: 0,
            reused_existing: false,
        });
    }

    // Stage 2: Normalize
    let mut messages = Vec::with_capacity(records.len());
    let mut skipped = 0u32;
    for record in &records {
        match normalize_record(record, cfg, sink.as_ref()) {
            Ok(NormalizeOutcome::Message(message)) => messages.push(*message),
            Ok(NormalizeOutcome::Skipped) => skipped += 1,
            Err(err) if err.is_fatal() => return Err(err),
            Err(_) => skipped += 1,
        }
    }
    sink.inc_counter("messages_fetched_total", &[("status", "skipped")], skipped as u64);

    if messages.is_empty() {
        let digest = Digest::empty(digest_date_str, trace_id, cfg.timezone.clone(), cfg.prompt_version.clone());
        persist::write_outputs(&cfg.out_dir, &cfg.account_id, &digest, now).await?;
        sink.inc("runs_total", &[("status", "success")]);
        return Ok(RunReport {
            digest: Some(digest),
            exit_code: if skipped > 0 { 2 } else { 0 },
            reused_existing: false,
        });
    }

    // Stage 3: Thread build
    let total_messages_processed = messages.len();
    let (threads, _report) = build_threads(messages, cfg, sink.as_ref());

    // Stage 4: Chunk
    let mut chunks_by_thread: HashMap<String, Vec<EvidenceChunk>> = HashMap::new();
    let mut chunk_count = 0usize;
    for thread in &threads {
        let chunks = chunk_thread(thread, &cfg.user_aliases);
        chunk_count += chunks.len();
        chunks_by_thread.insert(thread.thread_id.clone(), chunks);
    }
    sink.inc_counter("chunks_produced_total", &[], chunk_count as u64);

    // Stage 5: Extract (rule-based)
    let actions = extract_all(&threads, &chunks_by_thread, &cfg.user_email, &cfg.user_aliases, cfg);
    for action in &actions {
        let kind_label = match action.kind {
            crate::types::ActionKind::Action => "action",
            crate::types::ActionKind::Question => "question",
            crate::types::ActionKind::Mention => "mention",
        };
        sink.inc("actions_found_total", &[("kind", kind_label)]);
        if action.kind == crate::types::ActionKind::Mention {
            sink.inc("mentions_found_total", &[]);
        }
        sink.observe_histogram("actions_confidence_histogram", &[], action.confidence);
    }

    // Stage 6: Select / Rank
    let messages_by_id: HashMap<String, &Message> = threads.iter().flat_map(|t| t.messages.iter()).map(|m| (m.message_id.clone(), m)).collect();

    let mut candidates = Vec::new();
    for thread in &threads {
        if let Some(chunks) = chunks_by_thread.get(&thread.thread_id) {
            for chunk in chunks {
                if let Some(message) = messages_by_id.get(&chunk.message_id) {
                    let candidate = RankCandidate { chunk, message, thread, digest_now };
                    let score = rank_score(&candidate, &cfg.user_email);
                    candidates.push((candidate, score));
                }
            }
        }
    }
    for (_, score) in &candidates {
        sink.observe_histogram("rank_score_histogram", &[], *score);
    }
    sink.set_gauge("top10_actions_share", &[], top10_share(&candidates));

    let selected = select_within_budget(candidates, cfg);

    if request.dry_run {
        let exit_code = if skipped > 0 { 2 } else { 0 };
        sink.inc("runs_total", &[("status", "dry_run")]);
        return Ok(RunReport {
            digest: None,
            exit_code,
            reused_existing: false,
        });
    }

    let selected_triples: Vec<(&EvidenceChunk, &Message, &Thread)> = selected
        .iter()
        .map(|(candidate, _)| (candidate.chunk, candidate.message, candidate.thread))
        .collect();

    // Stage 7: Summarize
    let (outcome, _trigger, prompt_used, call_timeout_ms) =
        summarize(&threads, &selected_triples, &chunks_by_thread, &digest_date_str, llm.clone(), cfg, sink.clone()).await;

    // Stage 8: Validate & cite
    let evidence_index = build_evidence_index(
        &chunks_by_thread.values().flatten().cloned().collect::<Vec<_>>(),
        &messages_by_id,
    );

    let (mut sections, partial, degrade_reason, from_llm) = match outcome {
        SummarizeOutcome::Response(text) => match validate_and_assemble(&text, &evidence_index, digest_now, request.validate_citations) {
            Ok((sections, citation_failures)) => {
                if citation_failures > 0 {
                    sink.inc_counter("citation_validation_failures_total", &[("type", "mismatch")], citation_failures as u64);
                }
                let partial = citation_failures > 0;
                let reason = if partial { Some(crate::types::DegradeReason::CitationMismatch) } else { None };
                (sections, partial, reason, true)
            }
            Err(err) if request.validate_citations && matches!(err, AppError::CitationMismatch(_)) => {
                sink.inc_counter("citation_validation_failures_total", &[("type", "mismatch")], 1);
                return Err(err);
            }
            // §4.7: a schema failure gets exactly one repair retry before
            // degrading. Any other first-attempt error degrades immediately.
            Err(err @ AppError::LlmSchema(_)) => {
                sink.inc_counter("llm_json_errors_total", &[], 1);
                let repaired = crate::summarize::repair_call(llm.clone(), &prompt_used, &text, &err.to_string(), call_timeout_ms, sink.clone()).await;
                match repaired {
                    SummarizeOutcome::Response(repaired_text) => {
                        match validate_and_assemble(&repaired_text, &evidence_index, digest_now, request.validate_citations) {
                            Ok((sections, citation_failures)) => {
                                if citation_failures > 0 {
                                    sink.inc_counter("citation_validation_failures_total", &[("type", "mismatch")], citation_failures as u64);
                                }
                                let partial = citation_failures > 0;
                                let reason = if partial { Some(crate::types::DegradeReason::CitationMismatch) } else { None };
                                (sections, partial, reason, true)
                            }
                            Err(err2) if request.validate_citations && matches!(err2, AppError::CitationMismatch(_)) => {
                                sink.inc_counter("citation_validation_failures_total", &[("type", "mismatch")], 1);
                                return Err(err2);
                            }
                            Err(err2) => {
                                if matches!(err2, AppError::LlmSchema(_)) {
                                    sink.inc_counter("llm_json_errors_total", &[], 1);
                                }
                                sink.inc("degrade_activated_total", &[("reason", err2.degrade_reason())]);
                                let ranked: Vec<(RankCandidate<'_>, f64)> = rebuild_ranked(&selected);
                                (extractive_degrade(&actions, &ranked, &cfg.user_email), true, Some(degrade_reason_for(&err2)), false)
                            }
                        }
                    }
                    SummarizeOutcome::TerminalFailure => {
                        sink.inc("degrade_activated_total", &[("reason", "llm_schema")]);
                        let ranked: Vec<(RankCandidate<'_>, f64)> = rebuild_ranked(&selected);
                        (extractive_degrade(&actions, &ranked, &cfg.user_email), true, Some(crate::types::DegradeReason::LlmSchema), false)
                    }
                }
            }
            Err(err) => {
                sink.inc("degrade_activated_total", &[("reason", err.degrade_reason())]);
                let ranked: Vec<(RankCandidate<'_>, f64)> = rebuild_ranked(&selected);
                (extractive_degrade(&actions, &ranked, &cfg.user_email), true, Some(degrade_reason_for(&err)), false)
            }
        },
        SummarizeOutcome::TerminalFailure => {
            let ranked: Vec<(RankCandidate<'_>, f64)> = rebuild_ranked(&selected);
            (extractive_degrade(&actions, &ranked, &cfg.user_email), true, Some(crate::types::DegradeReason::LlmTransport), false)
        }
    };
    if from_llm {
        apply_rank_scores(&mut sections, &selected);
    }
    sections.sort_all();

    for item in sections
        .my_actions
        .iter()
        .chain(sections.others_actions.iter())
        .chain(sections.deadlines_meetings.iter())
        .chain(sections.risks_blockers.iter())
        .chain(sections.fyi.iter())
    {
        sink.observe_histogram("citations_per_item_histogram", &[], item.citations.len() as f64);
    }

    // Stage 9: Assemble
    let digest = assemble_digest(
        digest_date_str,
        trace_id,
        cfg.timezone.clone(),
        cfg.prompt_version.clone(),
        sections,
        total_messages_processed,
        partial,
        degrade_reason,
    );

    // Stage 10: Persist & idempotency
    persist::write_outputs(&cfg.out_dir, &cfg.account_id, &digest, now).await?;
    for folder in &request.folders {
        persist::write_watermark(&cfg.out_dir, folder, now).await?;
    }

    sink.observe_histogram("digest_build_seconds", &[], build_started.elapsed().as_secs_f64());

    let exit_code = if partial { 2 } else { 0 };
    sink.inc("runs_total", &[("status", if partial { "partial" } else { "success" })]);

    Ok(RunReport {
        digest: Some(digest),
        exit_code,
        reused_existing: false,
    })
}

/// `select_within_budget` consumes its candidates; the extractive degrade
/// path needs them again, so rebuild the `(candidate, score)` pairs from
/// the already-selected set rather than re-running Select/Rank.
fn rebuild_ranked<'a>(selected: &'a [(RankCandidate<'a>, f64)]) -> Vec<(RankCandidate<'a>, f64)> {
    selected
        .iter()
        .map(|(candidate, score)| {
            (
                RankCandidate {
                    chunk: candidate.chunk,
                    message: candidate.message,
                    thread: candidate.thread,
                    digest_now: candidate.digest_now,
                },
                *score,
            )
        })
        .collect()
}

/// The language model never echoes back a rank score, so every item it
/// produces carries a placeholder `rank_score` of `0.0`. Recover the real
/// score by recomputing the evidence id the citation resolved to (the same
/// deterministic function [`crate::chunk`] used to assign it) and looking it
/// up in the already-ranked candidate set.
fn apply_rank_scores(sections: &mut DigestSections, selected: &[(RankCandidate<'_>, f64)]) {
    let mut score_by_evidence_id: HashMap<String, f64> = HashMap::new();
    for (candidate, score) in selected {
        score_by_evidence_id.insert(candidate.chunk.evidence_id.clone(), *score);
    }
    for item in sections
        .my_actions
        .iter_mut()
        .chain(sections.others_actions.iter_mut())
        .chain(sections.deadlines_meetings.iter_mut())
        .chain(sections.risks_blockers.iter_mut())
        .chain(sections.fyi.iter_mut())
    {
        if let Some(citation) = item.citations.first() {
            let evidence_id = evidence_id_for(&citation.message_id, citation.start, citation.end);
            if let Some(score) = score_by_evidence_id.get(&evidence_id) {
                item.rank_score = *score;
            }
        }
    }
}

/// Share of total rank weight captured by the top 10 selected candidates,
/// used as the `top10_actions_share` gauge (§6): a low value means
/// attention is spread thin rather than concentrated on a few items.
fn top10_share(candidates: &[(RankCandidate<'_>, f64)]) -> f64 {
    if candidates.is_empty() {
        return 0.0;
    }
    let mut scores: Vec<f64> = candidates.iter().map(|(_, s)| *s).collect();
    scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let total: f64 = scores.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let top10: f64 = scores.iter().take(10).sum();
    top10 / total
}

/// Resolve `--from-date`/`--window` into a concrete digest date and UTC
/// fetch window, in the mailbox's configured offset.
fn compute_window(from_date: &str, window: Window, mailbox_offset: FixedOffset, now: DateTime<Utc>) -> AppResult<(NaiveDate, FetchWindow)> {
    let now_local = now.with_timezone(&mailbox_offset);
    let date = if from_date.eq_ignore_ascii_case("today") {
        now_local.date_naive()
    } else {
        NaiveDate::parse_from_str(from_date, "%Y-%m-%d").map_err(|e| AppError::InvalidInput(format!("invalid --from-date '{from_date}': {e}")))?
    };

    let (start, end) = match window {
        Window::CalendarDay => {
            let start = mailbox_offset
                .from_local_datetime(&date.and_hms_opt(0, 0, 0).expect("valid midnight"))
                .single()
                .ok_or_else(|| AppError::InvalidInput(format!("ambiguous local midnight for {date}")))?;
            (start, start + ChronoDuration::days(1))
        }
        Window::Rolling24h => {
            let end = now_local;
            (end - ChronoDuration::hours(24), end)
        }
    };

    Ok((
        date,
        FetchWindow {
            start: start.with_timezone(&Utc),
            end: end.with_timezone(&Utc),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Window;

    #[test]
    fn compute_window_calendar_day_spans_full_local_day() {
        let offset = FixedOffset::east_opt(-3 * 3600).unwrap();
        let now = DateTime::parse_from_rfc3339("2024-12-15T18:00:00-03:00").unwrap().with_timezone(&Utc);
        let (date, window) = compute_window("2024-12-15", Window::CalendarDay, offset, now).unwrap();
        assert_eq!(date.to_string(), "2024-12-15");
        assert_eq!((window.end - window.start).num_hours(), 24);
    }

    #[test]
    fn compute_window_rolling_24h_ends_at_now() {
        let offset = FixedOffset::east_opt(0).unwrap();
        let now = DateTime::parse_from_rfc3339("2024-12-15T18:00:00+00:00").unwrap().with_timezone(&Utc);
        let (_date, window) = compute_window("today", Window::Rolling24h, offset, now).unwrap();
        assert_eq!(window.end, now);
        assert_eq!((window.end - window.start).num_hours(), 24);
    }

    #[test]
    fn compute_window_rejects_malformed_from_date() {
        let offset = FixedOffset::east_opt(0).unwrap();
        let now = Utc::now();
        assert!(compute_window("not-a-date", Window::CalendarDay, offset, now).is_err());
    }

    #[test]
    fn top10_share_is_one_when_ten_or_fewer_candidates() {
        let empty: Vec<(RankCandidate<'_>, f64)> = Vec::new();
        assert_eq!(top10_share(&empty), 0.0);
    }
}
