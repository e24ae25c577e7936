//! Typo-tolerant conversation search.
//!
//! Each field is scored by the edit distance between the query and the
//! best-matching substring of the field. A field matches when that distance is
//! at most a third of the query length. Title and last message are weighted
//! 0.6 and 0.4; conversations where neither field matches are dropped.

use crate::models::Conversation;

pub const TITLE_WEIGHT: f64 = 0.6;
pub const LAST_MESSAGE_WEIGHT: f64 = 0.4;

/// Allowed edits per query character
const MAX_ERROR_RATIO_DIVISOR: usize = 3;

struct Entry {
    title: Vec<char>,
    last_message: Vec<char>,
}

/// Lowercased search buffers for one conversation list. Rebuild it when the list changes.
pub struct ConversationIndex<'a> {
    conversations: &'a [Conversation],
    entries: Vec<Entry>,
}

impl<'a> ConversationIndex<'a> {
    pub fn new(conversations: &'a [Conversation]) -> Self {
        let entries = conversations
            .iter()
            .map(|c| Entry {
                title: normalize(&c.title),
                last_message: normalize(c.last_message.as_deref().unwrap_or("")),
            })
            .collect();
        Self {
            conversations,
            entries,
        }
    }

    /// Matching conversations, best first. Equal scores keep list order.
    /// A blank query returns the whole list untouched.
    pub fn search(&self, query: &str) -> Vec<&'a Conversation> {
        let query = query.trim();
        if query.is_empty() {
            return self.conversations.iter().collect();
        }
        let pattern = normalize(query);

        let mut scored: Vec<(f64, &'a Conversation)> = self
            .entries
            .iter()
            .zip(self.conversations.iter())
            .filter_map(|(entry, conversation)| {
                score_entry(&pattern, entry).map(|score| (score, conversation))
            })
            .collect();

        // sort_by is stable, so ties stay in input order
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().map(|(_, c)| c).collect()
    }
}

/// One-shot form of [`ConversationIndex::search`].
pub fn filter_conversations<'a>(conversations: &'a [Conversation], query: &str) -> Vec<&'a Conversation> {
    ConversationIndex::new(conversations).search(query)
}

fn normalize(text: &str) -> Vec<char> {
    text.chars().flat_map(char::to_lowercase).collect()
}

fn score_entry(pattern: &[char], entry: &Entry) -> Option<f64> {
    let title = field_similarity(pattern, &entry.title);
    let last = field_similarity(pattern, &entry.last_message);
    if title.is_none() && last.is_none() {
        return None;
    }
    Some(TITLE_WEIGHT * title.unwrap_or(0.0) + LAST_MESSAGE_WEIGHT * last.unwrap_or(0.0))
}

/// Similarity in [0, 1] when the field matches within the error budget.
fn field_similarity(pattern: &[char], text: &[char]) -> Option<f64> {
    let max_errors = pattern.len() / MAX_ERROR_RATIO_DIVISOR;
    let distance = substring_distance(pattern, text);
    if distance > max_errors {
        return None;
    }
    Some(1.0 - distance as f64 / pattern.len() as f64)
}

/// Smallest edit distance between `pattern` and any substring of `text`.
fn substring_distance(pattern: &[char], text: &[char]) -> usize {
    let m = pattern.len();
    // column[i]: cost of matching pattern[..i] ending at the current text position
    let mut column: Vec<usize> = (0..=m).collect();
    let mut next = vec![0; m + 1];
    let mut best = column[m];

    for &ch in text {
        next[0] = 0;
        for i in 1..=m {
            let cost = if pattern[i - 1] == ch { 0 } else { 1 };
            next[i] = (column[i] + 1)
                .min(next[i - 1] + 1)
                .min(column[i - 1] + cost);
        }
        std::mem::swap(&mut column, &mut next);
        best = best.min(column[m]);
    }

    best
}
