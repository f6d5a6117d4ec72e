//! Command-line surface
//!
//! `clap` derive structs mirroring `SPEC_FULL.md` §6's stable CLI contract.
//! Every flag here overrides the matching [`crate::config::PipelineConfig`]
//! field loaded from environment/TOML, following the teacher's layering
//! convention: CLI > TOML file > env > built-in default.

use clap::{Parser, Subcommand, ValueEnum};

/// Daily email digest pipeline.
#[derive(Debug, Parser)]
#[command(name = "mail-digest-rs", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the pipeline for one mailbox account and date window.
    Run(RunArgs),
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Date to build the digest for, or `today`.
    #[arg(long, default_value = "today")]
    pub from_date: String,

    /// The window of mail to consider relative to `--from-date`.
    #[arg(long, value_enum, default_value_t = Window::CalendarDay)]
    pub window: Window,

    /// Run only through Select/Rank; no language-model calls, no final
    /// document. Exit code 2 on any warning, 0 on a clean dry run.
    #[arg(long)]
    pub dry_run: bool,

    /// Bypass the 48-hour idempotency rebuild window.
    #[arg(long)]
    pub force: bool,

    /// Promote citation mismatches to a hard failure (exit code 2) instead
    /// of counting and continuing.
    #[arg(long)]
    pub validate_citations: bool,

    /// Output directory for the digest JSON/Markdown and watermark files.
    /// Overrides `MAIL_DIGEST_OUT_DIR`.
    #[arg(long)]
    pub out: Option<String>,

    /// Language-model identifier to request. Overrides `MAIL_DIGEST_LLM_MODEL`.
    #[arg(long)]
    pub model: Option<String>,

    /// Prompt template version stamped on the output envelope. Overrides
    /// `MAIL_DIGEST_PROMPT_VERSION`.
    #[arg(long)]
    pub prompt_version: Option<String>,

    /// Optional TOML file layered between environment defaults and these
    /// CLI flags.
    #[arg(long)]
    pub config: Option<String>,

    /// Mailbox account to run for. Overrides `MAIL_DIGEST_ACCOUNT_ID`.
    #[arg(long)]
    pub account: Option<String>,

    /// Path to the newline-delimited-JSON mailbox file consumed by
    /// [`crate::mailbox::JsonlMailboxDriver`].
    #[arg(long)]
    pub mailbox_file: Option<String>,

    /// Mailbox folders to fetch from.
    #[arg(long, default_values_t = ["inbox".to_string()])]
    pub folder: Vec<String>,

    /// Structured log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum Window {
    CalendarDay,
    Rolling24h,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Window::CalendarDay => "calendar_day",
            Window::Rolling24h => "rolling_24h",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        };
        write!(f, "{s}")
    }
}
