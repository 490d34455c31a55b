use std::collections::{HashSet, VecDeque};

use serde::Serialize;

use crate::models::ChatNet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Message,
    /// Locally generated system line (media switches and the like).
    Notice,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub id: String,
    pub from: String,
    pub name: String,
    pub message: String,
    pub tone: String,
    pub kind: ChatKind,
    pub at_ms: i64,
}

impl ChatEntry {
    pub fn from_net(chat: ChatNet, at_ms: i64) -> Self {
        Self {
            id: chat.id,
            from: chat.from,
            name: chat.name,
            message: chat.message,
            tone: chat.tone,
            kind: ChatKind::Message,
            at_ms,
        }
    }
}

/// Append-only room chat, deduplicated by message id and capped in length.
#[derive(Debug)]
pub struct ChatLog {
    entries: VecDeque<ChatEntry>,
    seen: HashSet<String>,
    max_entries: usize,
    notice_window_ms: i64,
    last_notice: Option<(String, i64)>,
    next_notice: u64,
}

impl ChatLog {
    pub fn new(max_entries: usize, notice_window_ms: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            seen: HashSet::new(),
            max_entries: max_entries.max(1),
            notice_window_ms: notice_window_ms as i64,
            last_notice: None,
            next_notice: 0,
        }
    }

    /// Append unless an entry with the same id is already present.
    pub fn push(&mut self, entry: ChatEntry) -> bool {
        if !self.seen.insert(entry.id.clone()) {
            return false;
        }
        self.entries.push_back(entry);
        while self.entries.len() > self.max_entries {
            if let Some(old) = self.entries.pop_front() {
                self.seen.remove(&old.id);
            }
        }
        true
    }

    /// Add a system notice, unless the same text was added within the window.
    pub fn notice(&mut self, text: &str, now_ms: i64) -> Option<ChatEntry> {
        if let Some((last, at)) = &self.last_notice {
            if last == text && now_ms - at < self.notice_window_ms {
                return None;
            }
        }
        self.last_notice = Some((text.to_string(), now_ms));
        self.next_notice += 1;
        let entry = ChatEntry {
            id: format!("notice-{}", self.next_notice),
            from: String::new(),
            name: String::new(),
            message: text.to_string(),
            tone: "system".to_string(),
            kind: ChatKind::Notice,
            at_ms: now_ms,
        };
        self.push(entry.clone());
        Some(entry)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ChatEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(id: &str) -> ChatEntry {
        ChatEntry::from_net(
            ChatNet {
                id: id.into(),
                from: "a".into(),
                name: "Ana".into(),
                message: "hi".into(),
                tone: "default".into(),
            },
            0,
        )
    }

    #[test]
    fn dedups_by_id() {
        let mut log = ChatLog::new(10, 3_000);
        assert!(log.push(chat("m1")));
        assert!(!log.push(chat("m1")));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn caps_length() {
        let mut log = ChatLog::new(2, 3_000);
        log.push(chat("m1"));
        log.push(chat("m2"));
        log.push(chat("m3"));
        let ids: Vec<_> = log.entries().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
    }

    #[test]
    fn repeated_notice_is_suppressed_inside_window() {
        let mut log = ChatLog::new(10, 3_000);
        assert!(log.notice("Ana switched to S1E2", 0).is_some());
        assert!(log.notice("Ana switched to S1E2", 1_000).is_none());
        assert!(log.notice("Ana switched to S1E3", 1_500).is_some());
        assert!(log.notice("Ana switched to S1E3", 5_000).is_some());
        assert_eq!(log.len(), 3);
    }
}
