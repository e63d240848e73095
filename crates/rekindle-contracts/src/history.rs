use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    System,
    Generation,
    Edit,
    Variation,
}

/// One ledger record. Timestamps are RFC 3339 strings so entries serialize
/// without a clock dependency downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub kind: EntryKind,
    pub content: String,
    pub timestamp: String,
}

/// Append-only ordered log of generation and edit events. No deletion; the
/// edit orchestrator reads the last N edit entries to build context.
#[derive(Debug, Clone, Default)]
pub struct ConversationLedger {
    entries: Vec<ConversationEntry>,
}

impl ConversationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, kind: EntryKind, content: impl Into<String>) -> &ConversationEntry {
        self.entries.push(ConversationEntry {
            kind,
            content: content.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
        });
        self.entries.last().expect("entry just pushed")
    }

    /// The last `n` entries of `kind`, oldest first.
    pub fn recent(&self, n: usize, kind: EntryKind) -> Vec<&ConversationEntry> {
        let matching: Vec<&ConversationEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .collect();
        let skip = matching.len().saturating_sub(n);
        matching.into_iter().skip(skip).collect()
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
