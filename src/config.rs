//! Configuration module for the digest pipeline
//!
//! All configuration is loaded from environment variables following the
//! pattern `MAIL_DIGEST_<KEY>`, then layered under an optional TOML file
//! (`--config <path>`), then layered under CLI flags (highest priority).
//! Credentials (the LLM API key) are stored using `SecretString` to prevent
//! accidental logging.

use std::env;
use std::env::VarError;
use std::path::Path;

use secrecy::SecretString;
use serde::Deserialize;

use crate::errors::{AppError, AppResult};

/// Pipeline-wide configuration, covering every tunable named in `SPEC_FULL.md`
/// §4 and §6.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Mailbox account identity (used for output file naming and the
    /// mailbox driver's own auth scoping).
    pub account_id: String,
    /// The mailbox owner's own address, used to route "my actions" vs.
    /// "others' actions" and to score to/cc ranking signals (§4.4, §4.5).
    pub user_email: String,
    /// Additional names/addresses that count as "addressed to me" for
    /// mention detection (§4.3, §4.4), e.g. a display name or alias.
    pub user_aliases: Vec<String>,
    /// IANA timezone name or fixed offset applied to every timestamp in the
    /// run (mailbox timezone, §4.1).
    pub timezone: String,
    /// Naive datetimes from the driver are a fatal error when `true`;
    /// otherwise the mailbox timezone is assumed and `tz_naive_total` is
    /// incremented.
    pub fail_on_naive: bool,
    /// Maximum normalized body size before truncation, in bytes.
    pub max_body_bytes: usize,
    /// Cleaner safety cap: never remove more than this fraction of a body.
    pub max_quote_removal_ratio: f64,
    /// Retain the first 1-2 paragraphs or 10 lines of the most recent quote
    /// when the receiver's own reply is very short.
    pub keep_top_quote_head: bool,
    /// Character-trigram Jaccard threshold for the thread semantic-merge
    /// fallback (§4.2).
    pub semantic_merge_threshold: f64,
    /// Hard cap on evidence chunks per message (§4.3).
    pub max_chunks_per_message: usize,
    /// Rule-extractor confidence threshold for emitting a candidate (§4.4).
    pub extract_confidence_threshold: f64,
    /// Total token budget given to the selected evidence (§4.5).
    pub token_budget: u32,
    /// Hierarchical mode toggle and its automatic triggers (§4.6).
    pub hierarchical_enable: bool,
    pub hierarchical_auto_enable: bool,
    pub auto_threads_threshold: usize,
    pub auto_messages_threshold: usize,
    /// Regular and exception per-thread chunk caps.
    pub per_thread_max_chunks: usize,
    pub per_thread_max_chunks_exception: usize,
    /// Size of the cooperative per-thread worker pool.
    pub parallel_pool: usize,
    /// Per-call timeouts, in milliseconds.
    pub per_thread_timeout_ms: u64,
    pub final_call_timeout_ms: u64,
    pub flat_call_timeout_ms: u64,
    /// Token cap enforced before the final aggregation call.
    pub final_input_token_cap: u32,
    /// Run-level token budget; exhausting it triggers the degrade path.
    pub run_token_budget: u64,
    /// Hours within which a rerun reuses the existing output.
    pub rebuild_window_hours: u64,
    /// Output directory for `digest-YYYY-MM-DD.{json,md}` and the watermark
    /// file.
    pub out_dir: String,
    /// Language-model endpoint the `HttpLlmClient` calls.
    pub llm_endpoint: String,
    pub llm_api_key: Option<SecretString>,
    pub llm_model: String,
    pub prompt_version: String,
    /// Bind address for the `/healthz`, `/readyz`, and `/metrics` endpoints
    /// served alongside the run.
    pub metrics_bind_addr: String,
}

/// Overrides loaded from an optional TOML file (`--config <path>`). Every
/// field is optional; present fields override the environment-derived
/// default, and CLI flags override both.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub account_id: Option<String>,
    pub user_email: Option<String>,
    pub user_aliases: Option<Vec<String>>,
    pub timezone: Option<String>,
    pub fail_on_naive: Option<bool>,
    pub token_budget: Option<u32>,
    pub hierarchical_enable: Option<bool>,
    pub hierarchical_auto_enable: Option<bool>,
    pub auto_threads_threshold: Option<usize>,
    pub auto_messages_threshold: Option<usize>,
    pub parallel_pool: Option<usize>,
    pub rebuild_window_hours: Option<u64>,
    pub out_dir: Option<String>,
    pub llm_endpoint: Option<String>,
    pub llm_model: Option<String>,
    pub prompt_version: Option<String>,
    pub metrics_bind_addr: Option<String>,
}

impl PipelineConfig {
    /// Load configuration from environment variables (`MAIL_DIGEST_*`
    /// prefix), falling back to the documented defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a set environment variable cannot be
    /// parsed as the expected type.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_DIGEST_ACCOUNT_ID=default
    /// MAIL_DIGEST_TIMEZONE=-03:00
    /// MAIL_DIGEST_TOKEN_BUDGET=3000
    /// MAIL_DIGEST_LLM_ENDPOINT=https://llm.internal/v1/complete
    /// MAIL_DIGEST_LLM_API_KEY=sk-...
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        Ok(Self {
            account_id: env::var("MAIL_DIGEST_ACCOUNT_ID").unwrap_or_else(|_| "default".to_owned()),
            user_email: env::var("MAIL_DIGEST_USER_EMAIL").unwrap_or_default(),
            user_aliases: env::var("MAIL_DIGEST_USER_ALIASES")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            timezone: env::var("MAIL_DIGEST_TIMEZONE").unwrap_or_else(|_| "+00:00".to_owned()),
            fail_on_naive: parse_bool_env("MAIL_DIGEST_FAIL_ON_NAIVE", false)?,
            max_body_bytes: parse_usize_env("MAIL_DIGEST_MAX_BODY_BYTES", 200 * 1024)?,
            max_quote_removal_ratio: parse_f64_env("MAIL_DIGEST_MAX_QUOTE_REMOVAL_RATIO", 0.95)?,
            keep_top_quote_head: parse_bool_env("MAIL_DIGEST_KEEP_TOP_QUOTE_HEAD", true)?,
            semantic_merge_threshold: parse_f64_env("MAIL_DIGEST_SEMANTIC_MERGE_THRESHOLD", 0.7)?,
            max_chunks_per_message: parse_usize_env("MAIL_DIGEST_MAX_CHUNKS_PER_MESSAGE", 12)?,
            extract_confidence_threshold: parse_f64_env(
                "MAIL_DIGEST_EXTRACT_CONFIDENCE_THRESHOLD",
                0.5,
            )?,
            token_budget: parse_u32_env("MAIL_DIGEST_TOKEN_BUDGET", 3000)?,
            hierarchical_enable: parse_bool_env("MAIL_DIGEST_HIERARCHICAL_ENABLE", true)?,
            hierarchical_auto_enable: parse_bool_env("MAIL_DIGEST_HIERARCHICAL_AUTO_ENABLE", true)?,
            auto_threads_threshold: parse_usize_env("MAIL_DIGEST_AUTO_THREADS_THRESHOLD", 60)?,
            auto_messages_threshold: parse_usize_env("MAIL_DIGEST_AUTO_MESSAGES_THRESHOLD", 300)?,
            per_thread_max_chunks: parse_usize_env("MAIL_DIGEST_PER_THREAD_MAX_CHUNKS", 8)?,
            per_thread_max_chunks_exception: parse_usize_env(
                "MAIL_DIGEST_PER_THREAD_MAX_CHUNKS_EXCEPTION",
                12,
            )?,
            parallel_pool: parse_usize_env("MAIL_DIGEST_PARALLEL_POOL", 8)?,
            per_thread_timeout_ms: parse_u64_env("MAIL_DIGEST_PER_THREAD_TIMEOUT_MS", 20_000)?,
            final_call_timeout_ms: parse_u64_env("MAIL_DIGEST_FINAL_CALL_TIMEOUT_MS", 60_000)?,
            flat_call_timeout_ms: parse_u64_env("MAIL_DIGEST_FLAT_CALL_TIMEOUT_MS", 60_000)?,
            final_input_token_cap: parse_u32_env("MAIL_DIGEST_FINAL_INPUT_TOKEN_CAP", 4000)?,
            run_token_budget: parse_u64_env("MAIL_DIGEST_RUN_TOKEN_BUDGET", 200_000)?,
            rebuild_window_hours: parse_u64_env("MAIL_DIGEST_REBUILD_WINDOW_HOURS", 48)?,
            out_dir: env::var("MAIL_DIGEST_OUT_DIR").unwrap_or_else(|_| "./out".to_owned()),
            llm_endpoint: env::var("MAIL_DIGEST_LLM_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:8080/v1/complete".to_owned()),
            llm_api_key: env::var("MAIL_DIGEST_LLM_API_KEY")
                .ok()
                .map(|s| SecretString::new(s.into())),
            llm_model: env::var("MAIL_DIGEST_LLM_MODEL").unwrap_or_else(|_| "default".to_owned()),
            prompt_version: env::var("MAIL_DIGEST_PROMPT_VERSION").unwrap_or_else(|_| "v1".to_owned()),
            metrics_bind_addr: env::var("MAIL_DIGEST_METRICS_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:9090".to_owned()),
        })
    }

    /// Read an optional TOML override file and apply its present fields on
    /// top of `self`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the file exists but cannot be read or
    /// parsed.
    pub fn apply_file(&mut self, path: &Path) -> AppResult<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::InvalidInput(format!("cannot read config file {path:?}: {e}")))?;
        let file: FileConfig = toml::from_str(&text)
            .map_err(|e| AppError::InvalidInput(format!("cannot parse config file {path:?}: {e}")))?;
        self.apply_file_config(file);
        Ok(())
    }

    fn apply_file_config(&mut self, file: FileConfig) {
        if let Some(v) = file.account_id {
            self.account_id = v;
        }
        if let Some(v) = file.user_email {
            self.user_email = v;
        }
        if let Some(v) = file.user_aliases {
            self.user_aliases = v;
        }
        if let Some(v) = file.timezone {
            self.timezone = v;
        }
        if let Some(v) = file.fail_on_naive {
            self.fail_on_naive = v;
        }
        if let Some(v) = file.token_budget {
            self.token_budget = v;
        }
        if let Some(v) = file.hierarchical_enable {
            self.hierarchical_enable = v;
        }
        if let Some(v) = file.hierarchical_auto_enable {
            self.hierarchical_auto_enable = v;
        }
        if let Some(v) = file.auto_threads_threshold {
            self.auto_threads_threshold = v;
        }
        if let Some(v) = file.auto_messages_threshold {
            self.auto_messages_threshold = v;
        }
        if let Some(v) = file.parallel_pool {
            self.parallel_pool = v;
        }
        if let Some(v) = file.rebuild_window_hours {
            self.rebuild_window_hours = v;
        }
        if let Some(v) = file.out_dir {
            self.out_dir = v;
        }
        if let Some(v) = file.llm_endpoint {
            self.llm_endpoint = v;
        }
        if let Some(v) = file.llm_model {
            self.llm_model = v;
        }
        if let Some(v) = file.prompt_version {
            self.prompt_version = v;
        }
        if let Some(v) = file.metrics_bind_addr {
            self.metrics_bind_addr = v;
        }
    }
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match env::var(key) {
        Ok(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u32_env(key: &str, default: u32) -> AppResult<u32> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u32>()
            .map_err(|_| AppError::InvalidInput(format!("invalid u32 environment variable {key}: '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map_err(|_| AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    match env::var(key) {
        Ok(v) => v.parse::<usize>().map_err(|_| {
            AppError::InvalidInput(format!("invalid usize environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_f64_env(key: &str, default: f64) -> AppResult<f64> {
    match env::var(key) {
        Ok(v) => v
            .parse::<f64>()
            .map_err(|_| AppError::InvalidInput(format!("invalid f64 environment variable {key}: '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }

        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn parse_bool_value_rejects_unrecognized_values() {
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn apply_file_config_only_overrides_present_fields() {
        let mut cfg = PipelineConfig {
            account_id: "default".to_string(),
            user_email: "bob@corp.example".to_string(),
            user_aliases: vec![],
            timezone: "+00:00".to_string(),
            fail_on_naive: false,
            max_body_bytes: 200 * 1024,
            max_quote_removal_ratio: 0.95,
            keep_top_quote_head: true,
            semantic_merge_threshold: 0.7,
            max_chunks_per_message: 12,
            extract_confidence_threshold: 0.5,
            token_budget: 3000,
            hierarchical_enable: true,
            hierarchical_auto_enable: true,
            auto_threads_threshold: 60,
            auto_messages_threshold: 300,
            per_thread_max_chunks: 8,
            per_thread_max_chunks_exception: 12,
            parallel_pool: 8,
            per_thread_timeout_ms: 20_000,
            final_call_timeout_ms: 60_000,
            flat_call_timeout_ms: 60_000,
            final_input_token_cap: 4000,
            run_token_budget: 200_000,
            rebuild_window_hours: 48,
            out_dir: "./out".to_string(),
            llm_endpoint: "http://localhost".to_string(),
            llm_api_key: None,
            llm_model: "default".to_string(),
            prompt_version: "v1".to_string(),
            metrics_bind_addr: "127.0.0.1:9090".to_string(),
        };
        cfg.apply_file_config(FileConfig {
            token_budget: Some(5000),
            ..Default::default()
        });
        assert_eq!(cfg.token_budget, 5000);
        assert_eq!(cfg.account_id, "default");
    }
}

/// Shared test fixture for other modules' `#[cfg(test)]` blocks. Not built
/// into non-test binaries.
#[cfg(test)]
pub mod test_support {
    use super::PipelineConfig;

    pub fn default_pipeline_config() -> PipelineConfig {
        PipelineConfig {
            account_id: "default".to_string(),
            user_email: "bob@corp.example".to_string(),
            user_aliases: vec![],
            timezone: "-03:00".to_string(),
            fail_on_naive: false,
            max_body_bytes: 200 * 1024,
            max_quote_removal_ratio: 0.95,
            keep_top_quote_head: true,
            semantic_merge_threshold: 0.7,
            max_chunks_per_message: 12,
            extract_confidence_threshold: 0.5,
            token_budget: 3000,
            hierarchical_enable: true,
            hierarchical_auto_enable: true,
            auto_threads_threshold: 60,
            auto_messages_threshold: 300,
            per_thread_max_chunks: 8,
            per_thread_max_chunks_exception: 12,
            parallel_pool: 8,
            per_thread_timeout_ms: 20_000,
            final_call_timeout_ms: 60_000,
            flat_call_timeout_ms: 60_000,
            final_input_token_cap: 4000,
            run_token_budget: 200_000,
            rebuild_window_hours: 48,
            out_dir: "./out".to_string(),
            llm_endpoint: "http://localhost".to_string(),
            llm_api_key: None,
            llm_model: "default".to_string(),
            prompt_version: "v1".to_string(),
            metrics_bind_addr: "127.0.0.1:9090".to_string(),
        }
    }
}
