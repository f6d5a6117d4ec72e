//! Hierarchical summarization orchestrator
//!
//! Per-thread summarization over a cooperative worker pool, must-include
//! chunk selection, graceful per-thread degrade, and final aggregation
//! under a token cap (`spec.md` §4.6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::PipelineConfig;
use crate::llm_client::{LanguageModelClient, LlmRequest};
use crate::observability::ObservabilitySink;
use crate::summarize_prompt::{build_final_prompt, build_thread_prompt};
use crate::types::{EvidenceChunk, Message, Thread};

/// Minimum chunk count for a thread to go through per-thread summarization;
/// below this it bypasses straight to final aggregation (§4.6).
const SMALL_THREAD_CHUNK_THRESHOLD: usize = 3;

#[derive(Debug, Clone)]
pub struct KeyCitation {
    pub evidence_id: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Action,
    Deadline,
    Question,
}

#[derive(Debug, Clone)]
pub struct PendingItem {
    pub kind: PendingKind,
    pub evidence_id: String,
    pub quote: String,
}

/// The output of summarizing one thread, whether by a real LLM call or by
/// the degrade path.
#[derive(Debug, Clone)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub title: String,
    pub citations: Vec<KeyCitation>,
    pub pending: Vec<PendingItem>,
    pub degraded: bool,
}

/// A thread that bypassed per-thread summarization (too small, or zero
/// chunks selected): its evidence flows directly into final aggregation.
#[derive(Debug, Clone)]
pub struct BypassedThread {
    pub thread_id: String,
    pub chunks: Vec<EvidenceChunk>,
}

#[derive(Debug, Deserialize)]
struct ThreadResponseShape {
    title: String,
    #[serde(default)]
    citations: Vec<ThreadCitationShape>,
    #[serde(default)]
    pending: Vec<ThreadPendingShape>,
}

#[derive(Debug, Deserialize)]
struct ThreadCitationShape {
    evidence_id: String,
    snippet: String,
}

#[derive(Debug, Deserialize)]
struct ThreadPendingShape {
    kind: String,
    evidence_id: String,
    quote: String,
}

/// Apply the must-include policy to one thread's chunks: alias-mention
/// chunks and the last-update chunk are always kept; the cap escalates
/// from `per_thread_max_chunks` to `per_thread_max_chunks_exception` when
/// must-include alone exceeds the regular cap, but never beyond the
/// exception cap.
pub fn select_thread_chunks<'a>(chunks: &'a [EvidenceChunk], cfg: &PipelineConfig) -> Vec<&'a EvidenceChunk> {
    let mut must_include: Vec<&EvidenceChunk> = chunks
        .iter()
        .filter(|c| c.signals.mentions_user_alias || c.signals.is_last_update_in_thread)
        .collect();
    must_include.sort_by(|a, b| b.priority_score.partial_cmp(&a.priority_score).unwrap_or(std::cmp::Ordering::Equal));

    let cap = if must_include.len() > cfg.per_thread_max_chunks {
        cfg.per_thread_max_chunks_exception
    } else {
        cfg.per_thread_max_chunks
    };
    must_include.truncate(cap);

    let mut selected_ids: std::collections::HashSet<&str> =
        must_include.iter().map(|c| c.evidence_id.as_str()).collect();
    let mut selected = must_include;

    if selected.len() < cap {
        let mut rest: Vec<&EvidenceChunk> = chunks
            .iter()
            .filter(|c| !selected_ids.contains(c.evidence_id.as_str()))
            .collect();
        rest.sort_by(|a, b| b.priority_score.partial_cmp(&a.priority_score).unwrap_or(std::cmp::Ordering::Equal));
        for chunk in rest {
            if selected.len() >= cap {
                break;
            }
            selected_ids.insert(chunk.evidence_id.as_str());
            selected.push(chunk);
        }
    }
    selected
}

fn stub_summary(thread_id: &str, chunks: &[&EvidenceChunk]) -> ThreadSummary {
    let mut ranked: Vec<&EvidenceChunk> = chunks.to_vec();
    ranked.sort_by(|a, b| b.priority_score.partial_cmp(&a.priority_score).unwrap_or(std::cmp::Ordering::Equal));
    let citations = ranked
        .into_iter()
        .take(2)
        .map(|c| KeyCitation {
            evidence_id: c.evidence_id.clone(),
            snippet: c.content.chars().take(150).collect(),
        })
        .collect();
    ThreadSummary {
        thread_id: thread_id.to_string(),
        title: "Thread summary unavailable".to_string(),
        citations,
        pending: Vec::new(),
        degraded: true,
    }
}

fn parse_thread_response(thread_id: &str, text: &str) -> Option<ThreadSummary> {
    let parsed: ThreadResponseShape = serde_json::from_str(text.trim()).ok()?;
    let pending = parsed
        .pending
        .into_iter()
        .filter_map(|p| {
            let kind = match p.kind.as_str() {
                "action" => PendingKind::Action,
                "deadline" => PendingKind::Deadline,
                "question" => PendingKind::Question,
                _ => return None,
            };
            Some(PendingItem {
                kind,
                evidence_id: p.evidence_id,
                quote: p.quote,
            })
        })
        .collect();
    Some(ThreadSummary {
        thread_id: thread_id.to_string(),
        title: parsed.title,
        citations: parsed
            .citations
            .into_iter()
            .map(|c| KeyCitation {
                evidence_id: c.evidence_id,
                snippet: c.snippet,
            })
            .collect(),
        pending,
        degraded: false,
    })
}

/// Summarize every "large" thread (>= 3 chunks after selection) in a
/// cooperative worker pool of size `cfg.parallel_pool`, returning summaries
/// reordered deterministically by thread id before the caller continues.
pub async fn summarize_threads(
    threads: &[Thread],
    chunks_by_thread: &HashMap<String, Vec<EvidenceChunk>>,
    client: Arc<dyn LanguageModelClient>,
    cfg: &PipelineConfig,
    sink: Arc<dyn ObservabilitySink>,
) -> (Vec<ThreadSummary>, Vec<BypassedThread>) {
    let semaphore = Arc::new(Semaphore::new(cfg.parallel_pool.max(1)));
    let mut join_set: JoinSet<ThreadSummary> = JoinSet::new();
    let mut bypassed = Vec::new();

    for thread in threads {
        let thread_id = thread.thread_id.clone();
        let empty = Vec::new();
        let raw_chunks = chunks_by_thread.get(&thread_id).unwrap_or(&empty);

        if raw_chunks.len() < SMALL_THREAD_CHUNK_THRESHOLD {
            bypassed.push(BypassedThread {
                thread_id,
                chunks: raw_chunks.clone(),
            });
            continue;
        }

        let selected = select_thread_chunks(raw_chunks, cfg);
        if selected.is_empty() {
            sink.inc("saved_tokens_total", &[("skip_reason", "no_eligible_chunks")]);
            bypassed.push(BypassedThread {
                thread_id,
                chunks: Vec::new(),
            });
            continue;
        }
        for chunk in &selected {
            if chunk.signals.mentions_user_alias {
                sink.inc("must_include_chunks_total", &[("chunk_type", "mention")]);
            }
            if chunk.signals.is_last_update_in_thread {
                sink.inc("must_include_chunks_total", &[("chunk_type", "last_update")]);
            }
        }

        let messages_by_id: HashMap<String, &Message> = thread.messages.iter().map(|m| (m.message_id.clone(), m)).collect();
        let prompt = build_thread_prompt(thread, &selected, &messages_by_id);
        let owned_selected: Vec<EvidenceChunk> = selected.iter().map(|c| (**c).clone()).collect();
        let timeout = Duration::from_millis(cfg.per_thread_timeout_ms);
        let client = Arc::clone(&client);
        let sink = Arc::clone(&sink);
        let semaphore = Arc::clone(&semaphore);
        let thread_id_for_task = thread_id.clone();

        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            let req = LlmRequest {
                prompt,
                max_tokens: 800,
                temperature: 0.2,
                timeout,
            };
            let refs: Vec<&EvidenceChunk> = owned_selected.iter().collect();
            let started = std::time::Instant::now();
            match tokio::time::timeout(timeout, client.complete(req)).await {
                Ok(Ok(response)) => {
                    sink.observe_histogram("llm_latency_ms", &[("call", "per_thread")], started.elapsed().as_millis() as f64);
                    sink.inc_counter("llm_tokens_in_total", &[], response.tokens_in as u64);
                    sink.inc_counter("llm_tokens_out_total", &[], response.tokens_out as u64);
                    match parse_thread_response(&thread_id_for_task, &response.text) {
                        Some(summary) => summary,
                        None => {
                            sink.inc("llm_json_errors_total", &[]);
                            stub_summary(&thread_id_for_task, &refs)
                        }
                    }
                }
                Ok(Err(_)) => {
                    sink.inc("degrade_activated_total", &[("reason", "llm_transport")]);
                    stub_summary(&thread_id_for_task, &refs)
                }
                Err(_) => {
                    sink.inc("degrade_activated_total", &[("reason", "llm_timeout")]);
                    stub_summary(&thread_id_for_task, &refs)
                }
            }
        });
    }

    let mut summaries = Vec::new();
    while let Some(result) = join_set.join_next().await {
        if let Ok(summary) = result {
            summaries.push(summary);
        }
    }
    summaries.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
    (summaries, bypassed)
}

fn estimate_tokens(text: &str) -> u32 {
    (text.split_whitespace().count() as f64 * 1.3).round() as u32
}

/// Render one thread summary's contribution to the final aggregation
/// context: title, key citations, pending items.
fn render_thread_summary(summary: &ThreadSummary) -> String {
    let mut out = format!("Thread {}: {}\n", summary.thread_id, summary.title);
    for citation in &summary.citations {
        out.push_str(&format!("  citation[{}]: {}\n", citation.evidence_id, citation.snippet));
    }
    for pending in &summary.pending {
        out.push_str(&format!("  pending[{:?}][{}]: {}\n", pending.kind, pending.evidence_id, pending.quote));
    }
    out
}

fn render_bypassed_thread(bypassed: &BypassedThread) -> String {
    let mut out = format!("Thread {} (raw):\n", bypassed.thread_id);
    for chunk in &bypassed.chunks {
        out.push_str(&format!("  evidence[{}]: {}\n", chunk.evidence_id, chunk.content));
    }
    out
}

/// Build the final aggregation context, shrinking to `final_input_token_cap`
/// by priority: threads with non-empty pending items are kept; others are
/// truncated first.
pub fn build_final_context(summaries: &[ThreadSummary], bypassed: &[BypassedThread], cfg: &PipelineConfig) -> String {
    let mut with_pending: Vec<String> = Vec::new();
    let mut without_pending: Vec<String> = Vec::new();

    for summary in summaries {
        let rendered = render_thread_summary(summary);
        if summary.pending.is_empty() {
            without_pending.push(rendered);
        } else {
            with_pending.push(rendered);
        }
    }
    for thread in bypassed {
        without_pending.push(render_bypassed_thread(thread));
    }

    let mut out = String::new();
    let mut tokens = 0u32;
    for block in with_pending.into_iter().chain(without_pending) {
        let block_tokens = estimate_tokens(&block);
        if tokens + block_tokens > cfg.final_input_token_cap {
            continue;
        }
        tokens += block_tokens;
        out.push_str(&block);
        out.push('\n');
    }
    out
}

/// Build the final-call prompt from the aggregated per-thread context.
pub fn build_final_call_prompt(summaries: &[ThreadSummary], bypassed: &[BypassedThread], digest_date: &str, cfg: &PipelineConfig) -> String {
    let context = build_final_context(summaries, bypassed, cfg);
    build_final_prompt(&context, digest_date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkSignals;

    fn chunk(id: &str, mentions: bool, last_update: bool, priority: f64) -> EvidenceChunk {
        EvidenceChunk {
            evidence_id: id.to_string(),
            message_id: "m1".to_string(),
            thread_id: "t1".to_string(),
            start_offset: 0,
            end_offset: 10,
            content: format!("content {id}"),
            token_count: 20,
            priority_score: priority,
            signals: ChunkSignals {
                mentions_user_alias: mentions,
                is_last_update_in_thread: last_update,
                ..Default::default()
            },
        }
    }

    #[test]
    fn must_include_chunks_are_always_selected() {
        let chunks = vec![chunk("a", true, false, 0.1), chunk("b", false, false, 0.9)];
        let cfg = crate::config::test_support::default_pipeline_config();
        let selected = select_thread_chunks(&chunks, &cfg);
        assert!(selected.iter().any(|c| c.evidence_id == "a"));
    }

    #[test]
    fn cap_escalates_to_exception_when_must_include_exceeds_regular_cap() {
        let mut cfg = crate::config::test_support::default_pipeline_config();
        cfg.per_thread_max_chunks = 2;
        cfg.per_thread_max_chunks_exception = 4;
        let chunks: Vec<EvidenceChunk> = (0..4).map(|i| chunk(&format!("m{i}"), true, false, i as f64)).collect();
        let selected = select_thread_chunks(&chunks, &cfg);
        assert_eq!(selected.len(), 4);
    }

    #[test]
    fn never_exceeds_exception_cap_even_with_more_must_includes() {
        let mut cfg = crate::config::test_support::default_pipeline_config();
        cfg.per_thread_max_chunks = 2;
        cfg.per_thread_max_chunks_exception = 3;
        let chunks: Vec<EvidenceChunk> = (0..6).map(|i| chunk(&format!("m{i}"), true, false, i as f64)).collect();
        let selected = select_thread_chunks(&chunks, &cfg);
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn stub_summary_uses_two_highest_priority_chunks_and_is_marked_degraded() {
        let chunks = vec![chunk("a", false, false, 0.2), chunk("b", false, false, 0.9), chunk("c", false, false, 0.1)];
        let refs: Vec<&EvidenceChunk> = chunks.iter().collect();
        let summary = stub_summary("t1", &refs);
        assert!(summary.degraded);
        assert_eq!(summary.citations.len(), 2);
        assert_eq!(summary.citations[0].evidence_id, "b");
    }

    #[test]
    fn final_context_prioritizes_threads_with_pending_items() {
        let with_pending = ThreadSummary {
            thread_id: "t1".to_string(),
            title: "Has actions".to_string(),
            citations: vec![],
            pending: vec![PendingItem {
                kind: PendingKind::Action,
                evidence_id: "ev1".to_string(),
                quote: "quoted text here".to_string(),
            }],
            degraded: false,
        };
        let without_pending = ThreadSummary {
            thread_id: "t2".to_string(),
            title: "No actions".to_string(),
            citations: vec![],
            pending: vec![],
            degraded: false,
        };
        let mut cfg = crate::config::test_support::default_pipeline_config();
        cfg.final_input_token_cap = 1000;
        let context = build_final_context(&[without_pending, with_pending], &[], &cfg);
        let pos_with = context.find("Has actions").unwrap();
        let pos_without = context.find("No actions").unwrap();
        assert!(pos_with < pos_without);
    }

    #[test]
    fn parse_thread_response_rejects_malformed_json() {
        assert!(parse_thread_response("t1", "not json").is_none());
    }

    #[test]
    fn parse_thread_response_accepts_well_formed_shape() {
        let text = r#"{"title": "Budget thread", "citations": [{"evidence_id": "ev1", "snippet": "hi"}], "pending": [{"kind": "action", "evidence_id": "ev1", "quote": "quoted text here"}]}"#;
        let summary = parse_thread_response("t1", text).unwrap();
        assert_eq!(summary.title, "Budget thread");
        assert_eq!(summary.pending.len(), 1);
    }
}
