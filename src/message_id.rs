//! Stable message identifier normalization
//!
//! Turns whatever a mailbox driver reports into the `message_id` carried on
//! every [`crate::types::Message`] downstream. The same normalized id must
//! be produced for the same logical message across reruns — citations,
//! `evidence_id`s, and the idempotency guarantee all depend on it.

/// Normalize a message identifier for use as `Message::message_id`.
///
/// Preference order: the internet `Message-ID` header value when present
/// and non-empty, falling back to the mailbox driver's own item id. The
/// result is lower-cased and has angle brackets (`<...>`) stripped, matching
/// the wire form of an internet message id without its delimiters.
///
/// ```text
/// normalize_message_id(Some("<AbC123@Mail.Example.Com>"), "driver-item-9")
///     == "abc123@mail.example.com"
/// normalize_message_id(None, "Driver-Item-9") == "driver-item-9"
/// ```
pub fn normalize_message_id(internet_message_id: Option<&str>, driver_item_id: &str) -> String {
    let raw = internet_message_id
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(driver_item_id);
    strip_angle_brackets(raw).to_ascii_lowercase()
}

/// Normalize a reply-chain reference (`In-Reply-To`, one entry of
/// `References`) the same way as [`normalize_message_id`], so lookups by id
/// stay consistent between a message and the ids that reference it.
pub fn normalize_reference(raw: &str) -> String {
    strip_angle_brackets(raw.trim()).to_ascii_lowercase()
}

/// Split a whitespace-separated `References` header value into individual
/// normalized reference ids, preserving the header's own (oldest-first)
/// order.
pub fn split_references(raw: &str) -> Vec<String> {
    raw.split_whitespace()
        .map(normalize_reference)
        .filter(|s| !s.is_empty())
        .collect()
}

fn strip_angle_brackets(raw: &str) -> &str {
    raw.trim().trim_start_matches('<').trim_end_matches('>')
}
