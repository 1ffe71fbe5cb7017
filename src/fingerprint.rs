//! Text normalization and content fingerprints.
//!
//! The fingerprint is a sha256 over the normalized title, the sorted tag set
//! and the flattened content blocks. It is deterministic across processes and
//! is the only key the duplicate check uses.

use std::collections::{BTreeSet, HashSet};

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::record::{ContentBlocks, Record};

/// NFKC-fold, lowercase, replace punctuation with spaces and collapse whitespace.
pub fn normalize(text: &str) -> String {
    let folded: String = text
        .nfkc()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compute the content fingerprint for a title, tag set and content.
pub fn fingerprint(title: &str, tags: &BTreeSet<String>, content: &ContentBlocks) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(title).as_bytes());
    hasher.update([0x1e]);
    for tag in tags {
        hasher.update(normalize(tag).as_bytes());
        hasher.update([0x1f]);
    }
    let blocks: [(&str, &Vec<String>); 6] = [
        ("d", &content.definitions),
        ("i", &content.invariants),
        ("c", &content.claims),
        ("e", &content.examples),
        ("n", &content.next_actions),
        ("t", &content.tests),
    ];
    for (marker, items) in blocks {
        hasher.update([0x1e]);
        hasher.update(marker.as_bytes());
        for item in items {
            hasher.update(normalize(item).as_bytes());
            hasher.update([0x1f]);
        }
    }
    hex::encode(hasher.finalize())
}

/// Fingerprint of a record as currently stored.
pub fn record_fingerprint(record: &Record) -> String {
    fingerprint(&record.title, &record.tags, &record.content)
}

/// Function words dropped from similarity token sets.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "these", "those", "from", "into", "onto", "are",
    "was", "were", "has", "have", "had", "been", "its", "their", "not", "but", "any", "all", "per",
    "via", "when", "where", "which", "who", "how", "why", "what", "than", "then", "each", "every",
    "one", "two", "can", "may", "must", "should", "will", "would", "also", "only", "over", "under",
];

/// Token set of a record's title, tags and summary, for similarity.
/// Tokens of two characters or fewer and [`STOPWORDS`] are dropped.
pub fn token_set(record: &Record) -> HashSet<String> {
    let mut text = normalize(&record.title);
    for tag in &record.tags {
        text.push(' ');
        text.push_str(&normalize(tag));
    }
    text.push(' ');
    text.push_str(&normalize(&record.summary));
    text.split_whitespace()
        .filter(|t| t.len() > 2 && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity between two sets; 0.0 when both are empty.
pub fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

/// Jaccard similarity over ordered tag sets.
pub fn tag_jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}
