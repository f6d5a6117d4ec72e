//! Mailbox driver contract
//!
//! The mailbox itself — authentication, paging, transient retries — is out
//! of scope for this crate (`SPEC_FULL.md` §6.1). This module defines the
//! contract the rest of the pipeline depends on and ships two
//! implementations that exist purely to make the crate runnable without a
//! live Exchange/Graph backend: a newline-delimited-JSON file reader for
//! local runs/demos, and an in-memory double for tests.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};
use crate::types::RawDriverRecord;

/// The date window a fetch covers, always expressed in UTC; callers convert
/// to/from the mailbox timezone at the edges.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Mailbox access contract. A real implementation wraps an
/// Exchange/Graph/IMAP client; this crate depends only on this trait.
#[async_trait]
pub trait MailboxDriver: Send + Sync {
    /// Retrieve every message received within `window`, across `folders`.
    /// Implementations own pagination and retries; callers see one
    /// materialized sequence.
    async fn fetch(&self, window: FetchWindow, folders: &[String]) -> AppResult<Vec<RawDriverRecord>>;
}

/// Reads a file of newline-delimited JSON [`RawDriverRecord`]s. Stands in
/// for a real mailbox client in local runs and demos; every record in the
/// file is returned regardless of `window`/`folders` filtering on the
/// assumption that the file was already scoped to one day by whoever
/// produced it — a thin driver, not a query engine.
pub struct JsonlMailboxDriver {
    path: std::path::PathBuf,
}

impl JsonlMailboxDriver {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl MailboxDriver for JsonlMailboxDriver {
    async fn fetch(&self, _window: FetchWindow, _folders: &[String]) -> AppResult<Vec<RawDriverRecord>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AppError::NotFound(format!("mailbox jsonl file {:?}: {e}", self.path)))?;
        let mut records = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: RawDriverRecord = serde_json::from_str(line).map_err(|e| {
                AppError::InputSchema(format!(
                    "{:?}:{}: malformed driver record: {e}",
                    self.path,
                    lineno + 1
                ))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

/// In-memory mailbox double for integration tests: returns a fixed set of
/// records regardless of the requested window.
#[derive(Default)]
pub struct StaticMailboxDriver {
    records: Vec<RawDriverRecord>,
}

impl StaticMailboxDriver {
    pub fn new(records: Vec<RawDriverRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl MailboxDriver for StaticMailboxDriver {
    async fn fetch(&self, _window: FetchWindow, _folders: &[String]) -> AppResult<Vec<RawDriverRecord>> {
        Ok(self.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Importance;

    fn sample_record(item_id: &str) -> RawDriverRecord {
        RawDriverRecord {
            item_id: item_id.to_string(),
            conversation_id: None,
            in_reply_to: vec![],
            received_at: "2024-12-15T09:10:00-03:00".to_string(),
            from_email: "alice@corp.example".to_string(),
            from_name: None,
            to_emails: vec!["bob@corp.example".to_string()],
            cc_emails: vec![],
            subject: "Hi".to_string(),
            body_html: None,
            body_plain: Some("Hello.".to_string()),
            importance: Importance::Normal,
            is_flagged: false,
            attachment_types: vec![],
            headers: vec![],
        }
    }

    #[tokio::test]
    async fn static_driver_returns_fixed_records_regardless_of_window() {
        let driver = StaticMailboxDriver::new(vec![sample_record("1"), sample_record("2")]);
        let window = FetchWindow {
            start: Utc::now(),
            end: Utc::now(),
        };
        let out = driver.fetch(window, &["INBOX".to_string()]).await.unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn jsonl_driver_reads_one_record_per_line_and_skips_blanks() {
        let dir = std::env::temp_dir().join(format!("mail-digest-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let file = dir.join("records.jsonl");
        let rec = sample_record("42");
        let line = serde_json::to_string(&rec).unwrap();
        tokio::fs::write(&file, format!("{line}\n\n{line}\n"))
            .await
            .unwrap();

        let driver = JsonlMailboxDriver::new(&file);
        let window = FetchWindow {
            start: Utc::now(),
            end: Utc::now(),
        };
        let out = driver.fetch(window, &[]).await.unwrap();
        assert_eq!(out.len(), 2);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn jsonl_driver_rejects_malformed_lines() {
        let dir = std::env::temp_dir().join(format!("mail-digest-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let file = dir.join("bad.jsonl");
        tokio::fs::write(&file, "{not json}\n").await.unwrap();

        let driver = JsonlMailboxDriver::new(&file);
        let window = FetchWindow {
            start: Utc::now(),
            end: Utc::now(),
        };
        let err = driver.fetch(window, &[]).await.unwrap_err();
        assert!(matches!(err, AppError::InputSchema(_)));
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
