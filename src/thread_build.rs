//! Thread build stage
//!
//! Groups normalized messages into conversations: checksum dedup, reply
//! chain indexing, conversation-id/reply-chain/subject grouping, and a
//! trigram-Jaccard semantic-merge fallback (`spec.md` §4.2).

use std::collections::{BTreeMap, HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::config::PipelineConfig;
use crate::observability::ObservabilitySink;
use crate::types::{MergedBy, Message, Thread};

/// Report of what Thread build did, for the counters in `spec.md` §6 and
/// the redundancy-index invariant in §8.
#[derive(Debug, Clone, Default)]
pub struct ThreadBuildReport {
    pub duplicates_found: usize,
    pub original_messages: usize,
    pub unique_messages_after_merge: usize,
}

impl ThreadBuildReport {
    /// `(original_messages - unique_messages_after_merge) / original_messages`.
    pub fn redundancy_index(&self) -> f64 {
        if self.original_messages == 0 {
            return 0.0;
        }
        (self.original_messages - self.unique_messages_after_merge) as f64 / self.original_messages as f64
    }
}

/// Run Thread build over a flat set of normalized messages. Output threads
/// are sorted by latest `received_at` descending.
pub fn build_threads(
    messages: Vec<Message>,
    cfg: &PipelineConfig,
    sink: &dyn ObservabilitySink,
) -> (Vec<Thread>, ThreadBuildReport) {
    let original_messages = messages.len();
    let (primaries, duplicate_map) = dedupe_by_checksum(messages);
    let duplicates_found: usize = duplicate_map.values().map(Vec::len).sum();
    sink.inc_counter("duplicates_found_total", &[], duplicates_found as u64);

    let groups = group_by_conversation_and_reply_chain(&primaries);
    let groups = merge_by_subject(groups, &primaries);
    let groups = semantic_merge(groups, &primaries, cfg.semantic_merge_threshold);

    let mut threads: Vec<Thread> = groups
        .into_iter()
        .map(|group| assemble_thread(group, &primaries, &duplicate_map))
        .collect();

    threads.sort_by(|a, b| b.latest().map(|m| m.received_at).cmp(&a.latest().map(|m| m.received_at)));

    for thread in &threads {
        let label = match thread.merged_by {
            MergedBy::ConversationId => "conversation_id",
            MergedBy::ReplyChain => "reply_chain",
            MergedBy::Subject => "subject",
            MergedBy::Semantic => "semantic",
        };
        sink.inc("threads_merged_total", &[("method", label)]);
    }

    let report = ThreadBuildReport {
        duplicates_found,
        original_messages,
        unique_messages_after_merge: primaries.len(),
    };
    sink.set_gauge("redundancy_index", &[], report.redundancy_index());
    (threads, report)
}

/// Group messages by `body_checksum`; the earliest becomes primary, the
/// rest are recorded against it as duplicate sources.
fn dedupe_by_checksum(messages: Vec<Message>) -> (Vec<Message>, HashMap<String, Vec<String>>) {
    let mut by_checksum: BTreeMap<String, Vec<Message>> = BTreeMap::new();
    for msg in messages {
        by_checksum.entry(msg.body_checksum.clone()).or_default().push(msg);
    }

    let mut primaries = Vec::new();
    let mut duplicate_map = HashMap::new();
    for (_, mut group) in by_checksum {
        group.sort_by_key(|m| m.received_at);
        let primary = group.remove(0);
        if !group.is_empty() {
            duplicate_map.insert(primary.message_id.clone(), group.iter().map(|m| m.message_id.clone()).collect());
        }
        primaries.push(primary);
    }
    primaries.sort_by_key(|m| m.received_at);
    (primaries, duplicate_map)
}

type MessageGroup = (Vec<usize>, MergedBy);

/// Priority 1+2: group by `conversation_id` when present, else by
/// reply-chain closure (`in_reply_to` transitive links).
fn group_by_conversation_and_reply_chain(messages: &[Message]) -> Vec<MessageGroup> {
    let mut id_to_index: HashMap<&str, usize> = HashMap::new();
    for (i, m) in messages.iter().enumerate() {
        id_to_index.insert(m.message_id.as_str(), i);
    }

    // Union-find over message indices.
    let mut parent: Vec<usize> = (0..messages.len()).collect();
    fn find(parent: &mut [usize], x: usize) -> usize {
        if parent[x] != x {
            parent[x] = find(parent, parent[x]);
        }
        parent[x]
    }
    fn union(parent: &mut [usize], a: usize, b: usize) {
        let ra = find(parent, a);
        let rb = find(parent, b);
        if ra != rb {
            parent[rb] = ra;
        }
    }

    let mut conversation_of: HashMap<usize, &str> = HashMap::new();
    let mut by_conversation: HashMap<&str, usize> = HashMap::new();
    for (i, m) in messages.iter().enumerate() {
        if let Some(conv) = m.conversation_id.as_deref() {
            conversation_of.insert(i, conv);
            match by_conversation.get(conv) {
                Some(&root) => union(&mut parent, root, i),
                None => {
                    by_conversation.insert(conv, i);
                }
            }
        }
    }

    for (i, m) in messages.iter().enumerate() {
        for reply_to in &m.in_reply_to {
            if let Some(&j) = id_to_index.get(reply_to.as_str()) {
                union(&mut parent, j, i);
            }
        }
    }

    let mut group_by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..messages.len() {
        let root = find(&mut parent, i);
        group_by_root.entry(root).or_default().push(i);
    }

    group_by_root
        .into_values()
        .map(|indices| {
            let has_conversation = indices.iter().any(|i| conversation_of.contains_key(i));
            let merged_by = if has_conversation {
                MergedBy::ConversationId
            } else if indices.len() > 1 {
                MergedBy::ReplyChain
            } else {
                MergedBy::ReplyChain
            };
            (indices, merged_by)
        })
        .collect()
}

/// Priority 3: for singleton groups with neither conversation id nor reply
/// links, merge by normalized subject.
fn merge_by_subject(groups: Vec<MessageGroup>, messages: &[Message]) -> Vec<MessageGroup> {
    let mut by_subject: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<MessageGroup> = Vec::new();

    for (indices, merged_by) in groups {
        let already_linked = indices.len() > 1 || merged_by == MergedBy::ConversationId;
        if already_linked {
            out.push((indices, merged_by));
            continue;
        }
        let subject = normalize_subject(&messages[indices[0]].subject);
        if subject.is_empty() {
            out.push((indices, merged_by));
            continue;
        }
        match by_subject.get(&subject) {
            Some(&existing) => {
                out[existing].0.extend(indices);
                out[existing].1 = MergedBy::Subject;
            }
            None => {
                by_subject.insert(subject, out.len());
                out.push((indices, merged_by));
            }
        }
    }
    out
}

/// Priority 4: semantic merge fallback. Within groups sharing a normalized
/// subject but with no other link, merge when the character-trigram
/// Jaccard similarity of the first ~200 characters of each group's
/// concatenated bodies is >= `threshold`.
fn semantic_merge(groups: Vec<MessageGroup>, messages: &[Message], threshold: f64) -> Vec<MessageGroup> {
    let mut groups = groups;
    let mut merged_flags = vec![false; groups.len()];

    let signatures: Vec<String> = groups
        .iter()
        .map(|(indices, _)| {
            let mut text = String::new();
            for &i in indices.iter().take(3) {
                text.push_str(&messages[i].body_normalized);
                if text.len() > 200 {
                    break;
                }
            }
            text.chars().take(200).collect()
        })
        .collect();

    let subjects: Vec<String> = groups
        .iter()
        .map(|(indices, _)| normalize_subject(&messages[indices[0]].subject))
        .collect();

    let mut result: Vec<MessageGroup> = Vec::new();
    for i in 0..groups.len() {
        if merged_flags[i] {
            continue;
        }
        let mut combined = std::mem::take(&mut groups[i]);
        for j in (i + 1)..groups.len() {
            if merged_flags[j] || subjects[j] != subjects[i] || subjects[i].is_empty() {
                continue;
            }
            if trigram_jaccard(&signatures[i], &signatures[j]) >= threshold {
                combined.0.extend(std::mem::take(&mut groups[j]).0);
                combined.1 = MergedBy::Semantic;
                merged_flags[j] = true;
            }
        }
        result.push(combined);
    }
    result
}

fn trigrams(text: &str) -> HashSet<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() < 3 {
        return HashSet::from([chars.iter().collect::<String>()]);
    }
    (0..=chars.len() - 3).map(|i| chars[i..i + 3].iter().collect()).collect()
}

fn trigram_jaccard(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn assemble_thread(group: MessageGroup, messages: &[Message], duplicate_map: &HashMap<String, Vec<String>>) -> Thread {
    let (indices, merged_by) = group;
    let mut thread_messages: Vec<Message> = indices.into_iter().map(|i| messages[i].clone()).collect();
    thread_messages.sort_by_key(|m| m.received_at);

    let mut participants: HashSet<String> = HashSet::new();
    let mut duplicate_sources = Vec::new();
    for m in &thread_messages {
        participants.insert(m.from_email.clone());
        participants.extend(m.to_emails.iter().cloned());
        if let Some(dups) = duplicate_map.get(&m.message_id) {
            duplicate_sources.extend(dups.iter().cloned());
        }
    }

    let thread_id = thread_messages
        .first()
        .map(|m| format!("thread-{}", &m.message_id))
        .unwrap_or_default();

    Thread {
        thread_id,
        participants_count: participants.len(),
        merged_by,
        duplicate_sources,
        messages: thread_messages,
    }
}

static RE_REFWD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(re|fwd|fw|ответ|отв|пересл|пер)\s*:\s*").expect("valid re/fwd prefix regex")
});
static BRACKETED_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)[\[(][^\])]*(?:external|внешний|jira-\d+|urgent)[^\])]*[\])]").expect("valid bracketed tag regex"));
static EMOJI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        "[\u{1F300}-\u{1FAFF}",
        "\u{2600}-\u{27BF}",
        "\u{2190}-\u{21FF}",
        "\u{2B00}-\u{2BFF}",
        "\u{FE0F}]",
    ))
    .expect("valid emoji regex")
});

/// Normalize a subject for thread-grouping and deduplication.
///
/// Removes nested `Re:`/`Fwd:`/`Fw:` (and Russian equivalents) in one pass,
/// bracketed/parenthesized tags (`[EXTERNAL]`, `(внешний)`, `[JIRA-123]`,
/// `[URGENT]`), all emoji, and smart-quote characters; replaces em/en
/// dashes with ASCII; lower-cases and whitespace-normalizes the result.
pub fn normalize_subject(subject: &str) -> String {
    let mut text = subject.to_string();
    loop {
        let stripped = RE_REFWD.replace(&text, "").into_owned();
        if stripped == text {
            break;
        }
        text = stripped;
    }
    text = BRACKETED_TAG.replace_all(&text, "").into_owned();
    text = EMOJI.replace_all(&text, "").into_owned();
    text = text
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201C}' | '\u{201D}' => ' ',
            '\u{2013}' | '\u{2014}' => '-',
            other => other,
        })
        .collect();
    let composed: String = text.nfc().collect();
    composed.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}
