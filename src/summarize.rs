//! Summarize stage: mode selection and execution
//!
//! Decides between flat and hierarchical mode (`spec.md` §4.6) and
//! delegates to the matching prompt/call path. Returns the raw model text;
//! parsing and schema validation happen in [`crate::validate`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::llm_client::{LanguageModelClient, LlmRequest};
use crate::observability::ObservabilitySink;
use crate::summarize_hierarchical::{build_final_call_prompt, summarize_threads};
use crate::summarize_prompt::build_flat_prompt;
use crate::types::{EvidenceChunk, Message, Thread, TriggerReason};

/// Outcome of the Summarize stage: either a raw model response to validate,
/// or a signal that the call failed terminally and the extractive degrade
/// path should run instead.
pub enum SummarizeOutcome {
    Response(String),
    TerminalFailure,
}

/// Decide the mode per §4.6: hierarchical activates automatically once
/// `threads >= auto_threads_threshold` or `messages >= auto_messages_threshold`,
/// provided both `hierarchical_enable` and `hierarchical_auto_enable` are set.
pub fn select_trigger_reason(thread_count: usize, message_count: usize, cfg: &PipelineConfig) -> TriggerReason {
    if !cfg.hierarchical_enable {
        return TriggerReason::Disabled;
    }
    if !cfg.hierarchical_auto_enable {
        return TriggerReason::Manual;
    }
    if thread_count >= cfg.auto_threads_threshold {
        TriggerReason::AutoThreads
    } else if message_count >= cfg.auto_messages_threshold {
        TriggerReason::AutoMessages
    } else {
        TriggerReason::Manual
    }
}

fn is_hierarchical(trigger: TriggerReason) -> bool {
    matches!(trigger, TriggerReason::AutoThreads | TriggerReason::AutoMessages)
}

/// Run the Summarize stage: flat mode makes a single call over the
/// selected evidence; hierarchical mode fans out per-thread, then
/// aggregates and makes one final call.
///
/// Returns, alongside the outcome and trigger reason, the exact prompt text
/// sent and the per-call timeout used for that call — the caller needs both
/// to issue the one permitted repair retry if schema validation fails
/// (`spec.md` §4.7).
pub async fn summarize(
    threads: &[Thread],
    selected_chunks: &[(&EvidenceChunk, &Message, &Thread)],
    chunks_by_thread: &HashMap<String, Vec<EvidenceChunk>>,
    digest_date: &str,
    client: Arc<dyn LanguageModelClient>,
    cfg: &PipelineConfig,
    sink: Arc<dyn ObservabilitySink>,
) -> (SummarizeOutcome, TriggerReason, String, u64) {
    let message_count: usize = threads.iter().map(|t| t.messages.len()).sum();
    let trigger = select_trigger_reason(threads.len(), message_count, cfg);
    sink.inc("hierarchical_runs_total", &[("trigger_reason", trigger_label(trigger))]);

    if is_hierarchical(trigger) {
        let (summaries, bypassed) = summarize_threads(threads, chunks_by_thread, client.clone(), cfg, sink.clone()).await;
        if !summaries.is_empty() {
            let total_chunks: usize = summaries.len();
            sink.set_gauge("avg_subsummary_chunks", &[], total_chunks as f64);
        }
        let prompt = build_final_call_prompt(&summaries, &bypassed, digest_date, cfg);
        let outcome = call_once(client, prompt.clone(), cfg.final_call_timeout_ms, sink).await;
        (outcome, trigger, prompt, cfg.final_call_timeout_ms)
    } else {
        let prompt = build_flat_prompt(selected_chunks, digest_date);
        let outcome = call_once(client, prompt.clone(), cfg.flat_call_timeout_ms, sink).await;
        (outcome, trigger, prompt, cfg.flat_call_timeout_ms)
    }
}

/// Issue the single permitted repair call after a response has failed
/// schema validation: rebuilds the prompt with an explicit repair
/// instruction (`spec.md` §4.7) and makes one more call under the same
/// per-call timeout as the call being repaired.
pub async fn repair_call(
    client: Arc<dyn LanguageModelClient>,
    original_prompt: &str,
    bad_response: &str,
    validation_error: &str,
    timeout_ms: u64,
    sink: Arc<dyn ObservabilitySink>,
) -> SummarizeOutcome {
    let prompt = crate::summarize_prompt::build_repair_prompt(original_prompt, bad_response, validation_error);
    call_once(client, prompt, timeout_ms, sink).await
}

async fn call_once(client: Arc<dyn LanguageModelClient>, prompt: String, timeout_ms: u64, sink: Arc<dyn ObservabilitySink>) -> SummarizeOutcome {
    let timeout = Duration::from_millis(timeout_ms);
    let req = LlmRequest {
        prompt,
        max_tokens: 2000,
        temperature: 0.2,
        timeout,
    };
    let started = std::time::Instant::now();
    match tokio::time::timeout(timeout, client.complete(req)).await {
        Ok(Ok(response)) => {
            sink.observe_histogram("llm_latency_ms", &[("call", "flat_or_final")], started.elapsed().as_millis() as f64);
            sink.inc_counter("llm_tokens_in_total", &[], response.tokens_in as u64);
            sink.inc_counter("llm_tokens_out_total", &[], response.tokens_out as u64);
            SummarizeOutcome::Response(response.text)
        }
        Ok(Err(_)) => {
            sink.inc("degrade_activated_total", &[("reason", "llm_transport")]);
            SummarizeOutcome::TerminalFailure
        }
        Err(_) => {
            sink.inc("degrade_activated_total", &[("reason", "llm_timeout")]);
            SummarizeOutcome::TerminalFailure
        }
    }
}

fn trigger_label(trigger: TriggerReason) -> &'static str {
    match trigger {
        TriggerReason::AutoThreads => "auto_threads",
        TriggerReason::AutoMessages => "auto_messages",
        TriggerReason::Manual => "manual",
        TriggerReason::Disabled => "disabled",
    }
}
