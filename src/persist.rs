//! Persist stage
//!
//! Writes the digest envelope and its rendered Markdown view, and maintains
//! the idempotency/watermark state described in `spec.md` §4.8 and §6. The
//! core never holds a file handle longer than one run: every read/write
//! below opens, does its work, and closes within the call.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};
use crate::types::Digest;

fn json_path(out_dir: &str, account_id: &str, digest_date: &str) -> PathBuf {
    Path::new(out_dir).join(format!("digest-{account_id}-{digest_date}.json"))
}

fn markdown_path(out_dir: &str, account_id: &str, digest_date: &str) -> PathBuf {
    Path::new(out_dir).join(format!("digest-{account_id}-{digest_date}.md"))
}

fn watermark_path(out_dir: &str, folder: &str) -> PathBuf {
    Path::new(out_dir).join(format!(".watermark-{folder}.json"))
}

/// Whether a rerun for `(account_id, digest_date)` should recompute the
/// digest, or reuse the file already on disk.
///
/// Reuses the existing output when it exists and was produced within
/// `rebuild_window_hours` of `now`, unless `force` bypasses the window
/// (§4.8). A missing or unreadable output is always rebuilt.
pub async fn should_rebuild(out_dir: &str, account_id: &str, digest_date: &str, rebuild_window_hours: u64, force: bool, now: DateTime<Utc>) -> bool {
    if force {
        return true;
    }
    let path = json_path(out_dir, account_id, digest_date);
    let Ok(text) = tokio::fs::read_to_string(&path).await else {
        return true;
    };
    let Ok(existing) = serde_json::from_str::<StoredDigest>(&text) else {
        return true;
    };
    let age_hours = (now - existing.generated_at).num_hours();
    age_hours < 0 || age_hours as u64 >= rebuild_window_hours
}

/// Load a previously persisted digest for `(account_id, digest_date)`, if
/// one exists and parses.
pub async fn load_existing(out_dir: &str, account_id: &str, digest_date: &str) -> Option<Digest> {
    let path = json_path(out_dir, account_id, digest_date);
    let text = tokio::fs::read_to_string(&path).await.ok()?;
    let stored: StoredDigest = serde_json::from_str(&text).ok()?;
    Some(stored.digest)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDigest {
    generated_at: DateTime<Utc>,
    #[serde(flatten)]
    digest: Digest,
}

/// Write the digest envelope and its rendered Markdown view for
/// `(account_id, digest_date)`, creating `out_dir` if needed.
///
/// # Errors
///
/// Returns [`AppError::Internal`] if the directory cannot be created or a
/// file cannot be written.
pub async fn write_outputs(out_dir: &str, account_id: &str, digest: &Digest, generated_at: DateTime<Utc>) -> AppResult<()> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .map_err(|e| AppError::Internal(format!("cannot create output directory {out_dir:?}: {e}")))?;

    let stored = StoredDigest {
        generated_at,
        digest: digest.clone(),
    };
    let json = serde_json::to_string_pretty(&stored).map_err(|e| AppError::Internal(format!("cannot serialize digest: {e}")))?;
    let json_path = json_path(out_dir, account_id, &digest.digest_date);
    tokio::fs::write(&json_path, json)
        .await
        .map_err(|e| AppError::Internal(format!("cannot write {json_path:?}: {e}")))?;

    let markdown = digest.rendered_summary.clone().unwrap_or_default();
    let markdown_path = markdown_path(out_dir, account_id, &digest.digest_date);
    tokio::fs::write(&markdown_path, markdown)
        .await
        .map_err(|e| AppError::Internal(format!("cannot write {markdown_path:?}: {e}")))?;

    Ok(())
}

/// Read the watermark for `folder`: the last successfully processed
/// instant. A missing or corrupt watermark file falls back to `now -
/// lookback_hours`, matching the configured lookback window (§6).
pub async fn read_watermark(out_dir: &str, folder: &str, lookback_hours: u64, now: DateTime<Utc>) -> DateTime<Utc> {
    let path = watermark_path(out_dir, folder);
    let fallback = now - chrono::Duration::hours(lookback_hours as i64);
    let Ok(text) = tokio::fs::read_to_string(&path).await else {
        return fallback;
    };
    match serde_json::from_str::<Watermark>(&text) {
        Ok(w) => DateTime::parse_from_rfc3339(&w.last_processed_at).map(|d| d.with_timezone(&Utc)).unwrap_or(fallback),
        Err(_) => fallback,
    }
}

/// Persist the watermark for `folder` as an ISO-8601 instant.
///
/// # Errors
///
/// Returns [`AppError::Internal`] if the file cannot be written.
pub async fn write_watermark(out_dir: &str, folder: &str, instant: DateTime<Utc>) -> AppResult<()> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .map_err(|e| AppError::Internal(format!("cannot create output directory {out_dir:?}: {e}")))?;
    let watermark = Watermark {
        last_processed_at: instant.to_rfc3339(),
    };
    let json = serde_json::to_string(&watermark).map_err(|e| AppError::Internal(format!("cannot serialize watermark: {e}")))?;
    let path = watermark_path(out_dir, folder);
    tokio::fs::write(&path, json)
        .await
        .map_err(|e| AppError::Internal(format!("cannot write {path:?}: {e}")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Watermark {
    last_processed_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Digest;

    fn digest(date: &str) -> Digest {
        Digest::empty(date.to_string(), "trace-1".to_string(), "+00:00".to_string(), "v1".to_string())
    }

    #[tokio::test]
    async fn write_then_load_round_trips() {
        let dir = tempfile_dir();
        let d = digest("2024-12-15");
        write_outputs(dir.to_str().unwrap(), "acct", &d, Utc::now()).await.unwrap();
        let loaded = load_existing(dir.to_str().unwrap(), "acct", "2024-12-15").await.unwrap();
        assert_eq!(loaded.digest_date, "2024-12-15");
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn should_rebuild_is_false_within_window_and_true_outside_it() {
        let dir = tempfile_dir();
        let d = digest("2024-12-15");
        let generated_at = Utc::now() - chrono::Duration::hours(10);
        write_outputs(dir.to_str().unwrap(), "acct", &d, generated_at).await.unwrap();

        let within = should_rebuild(dir.to_str().unwrap(), "acct", "2024-12-15", 48, false, Utc::now()).await;
        assert!(!within);

        let outside = should_rebuild(dir.to_str().unwrap(), "acct", "2024-12-15", 2, false, Utc::now()).await;
        assert!(outside);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn should_rebuild_force_bypasses_window() {
        let dir = tempfile_dir();
        let d = digest("2024-12-15");
        write_outputs(dir.to_str().unwrap(), "acct", &d, Utc::now()).await.unwrap();
        let forced = should_rebuild(dir.to_str().unwrap(), "acct", "2024-12-15", 48, true, Utc::now()).await;
        assert!(forced);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn should_rebuild_is_true_when_no_output_exists() {
        let dir = tempfile_dir();
        let rebuild = should_rebuild(dir.to_str().unwrap(), "acct", "2024-12-15", 48, false, Utc::now()).await;
        assert!(rebuild);
    }

    #[tokio::test]
    async fn watermark_round_trips_and_falls_back_when_corrupt() {
        let dir = tempfile_dir();
        let now = Utc::now();
        write_watermark(dir.to_str().unwrap(), "inbox", now).await.unwrap();
        let read_back = read_watermark(dir.to_str().unwrap(), "inbox", 48, Utc::now()).await;
        assert_eq!(read_back.to_rfc3339(), now.to_rfc3339());

        tokio::fs::write(watermark_path(dir.to_str().unwrap(), "inbox"), "not json").await.unwrap();
        let fallback = read_watermark(dir.to_str().unwrap(), "inbox", 48, now).await;
        assert_eq!(fallback, now - chrono::Duration::hours(48));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    fn tempfile_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("mail-digest-persist-test-{}", uuid::Uuid::new_v4()));
        dir
    }
}
