//! mail-digest-rs: daily corporate-email digest pipeline
//!
//! Pulls a single user's mailbox for a chosen date, reduces each message to
//! clean text, groups related messages into threads, extracts likely
//! actionable evidence, asks a remote language model to turn that evidence
//! into a structured digest with citations, and writes the result to disk.
//!
//! # Architecture
//!
//! - [`main`]: process entry point — env loading, tracing init, driver
//!   wiring, exit code mapping
//! - [`config`]: environment/TOML-driven [`config::PipelineConfig`]
//! - [`cli`]: `clap` derive surface (`run` command and its flags)
//! - [`errors`]: typed error hierarchy and fatal/degrade classification
//! - [`types`]: core data model (Message, Thread, EvidenceChunk, Digest, ...)
//! - [`mailbox`]: mailbox driver contract + JSONL/static implementations
//! - [`llm_client`]: language-model contract + HTTP/scripted implementations
//! - [`normalize`], [`html_text`], [`cleaner`]: Fetch → Normalize
//! - [`thread_build`]: thread assembly, dedup, subject normalization
//! - [`chunk`]: evidence chunking
//! - [`extract`]: rule-based action/question/mention detection
//! - [`rank`]: ranking and token-budget selection
//! - [`summarize`], [`summarize_prompt`], [`summarize_hierarchical`]: the
//!   flat/hierarchical summarization orchestrator
//! - [`validate`]: strict JSON parsing, schema validation, citation
//!   attachment, extractive degrade fallback
//! - [`assemble`]: envelope and rendered-Markdown assembly
//! - [`persist`]: idempotent output writes and watermark tracking
//! - [`observability`]: counters/histograms/gauges sink, `/healthz`,
//!   `/readyz`, `/metrics`
//! - [`runner`]: top-level stage wiring
//! - [`message_id`]: stable message-id normalization

mod assemble;
mod chunk;
mod cleaner;
mod cli;
mod config;
mod errors;
mod extract;
mod html_text;
mod llm_client;
mod mailbox;
mod message_id;
mod normalize;
mod observability;
mod persist;
mod rank;
mod runner;
mod summarize;
mod summarize_hierarchical;
mod summarize_prompt;
mod thread_build;
mod types;
mod validate;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use secrecy::{ExposeSecret, SecretString};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use config::PipelineConfig;
use llm_client::HttpLlmClient;
use mailbox::{JsonlMailboxDriver, StaticMailboxDriver};
use observability::PrometheusTextSink;
use runner::RunRequest;

/// Application entry point
///
/// Loads configuration (env, then an optional `--config` TOML file, then
/// CLI flags in that priority order), initializes tracing, wires the
/// mailbox and language-model drivers, runs the pipeline once, and maps the
/// outcome to a process exit code (0 success, 1 fatal failure, 2 partial/
/// validation warning), per `SPEC_FULL.md` §6.
#[tokio::main]
async fn main() -> std::process::ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let Command::Run(args) = cli.command;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = match PipelineConfig::load_from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return std::process::ExitCode::from(1);
        }
    };

    if let Some(path) = &args.config {
        if let Err(err) = cfg.apply_file(std::path::Path::new(path)) {
            eprintln!("configuration error: {err}");
            return std::process::ExitCode::from(1);
        }
    }
    if let Some(account) = &args.account {
        cfg.account_id = account.clone();
    }
    if let Some(out) = &args.out {
        cfg.out_dir = out.clone();
    }
    if let Some(model) = &args.model {
        cfg.llm_model = model.clone();
    }
    if let Some(prompt_version) = &args.prompt_version {
        cfg.prompt_version = prompt_version.clone();
    }

    let sink = PrometheusTextSink::new();
    let ready = Arc::new(AtomicBool::new(false));
    let metrics_bind_addr = cfg.metrics_bind_addr.clone();
    let observability_sink = sink.clone();
    let observability_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(err) = observability::serve_observability(observability_sink, observability_ready, &metrics_bind_addr).await {
            tracing::warn!(error = %err, "observability endpoint server exited");
        }
    });

    let mailbox: Arc<dyn mailbox::MailboxDriver> = match &args.mailbox_file {
        Some(path) => Arc::new(JsonlMailboxDriver::new(path)),
        None => Arc::new(StaticMailboxDriver::new(Vec::new())),
    };
    let api_key = cfg.llm_api_key.as_ref().map(|s| SecretString::new(s.expose_secret().to_owned().into()));
    let llm: Arc<dyn llm_client::LanguageModelClient> = Arc::new(HttpLlmClient::new(cfg.llm_endpoint.clone(), cfg.llm_model.clone(), api_key));

    ready.store(true, std::sync::atomic::Ordering::Relaxed);

    let request = RunRequest {
        from_date: args.from_date,
        window: args.window,
        folders: args.folder,
        dry_run: args.dry_run,
        force: args.force,
        validate_citations: args.validate_citations,
    };

    match runner::run(&cfg, mailbox, llm, sink, request).await {
        Ok(report) => std::process::ExitCode::from(report.exit_code as u8),
        Err(err) => {
            eprintln!("{err}");
            std::process::ExitCode::from(1)
        }
    }
}
