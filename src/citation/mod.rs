//! Citation markers: rendering provenance into assistant messages and
//! recovering it from a thread's history.
//!
//! A marker block is an opening tag naming the kind, one JSON object per
//! line, and a closing tag, each tag on a line of its own:
//!
//! ```text
//! [[citations:direct]]
//! {"source":"file-abc","name":"report.txt","index":42}
//! [[/citations]]
//! ```
//!
//! Parsing is total: malformed lines are skipped, an unclosed block runs to
//! the next opening tag or the end of the message, and unknown kinds are
//! ignored.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::types::{Message, Role};

pub const CLOSING_TAG: &str = "[[/citations]]";

/// Which provenance rule produced a citation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CitationKind {
    /// A file attached to the turn and cited directly by the model.
    DirectAttachmentCitation,
    /// A hit returned by the hosted file-search tool.
    SearchResultCitation,
}

impl CitationKind {
    /// Marker tag word for this kind.
    pub fn tag(self) -> &'static str {
        match self {
            Self::DirectAttachmentCitation => "direct",
            Self::SearchResultCitation => "search",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "direct" => Some(Self::DirectAttachmentCitation),
            "search" => Some(Self::SearchResultCitation),
            _ => None,
        }
    }

    pub fn opening_tag(self) -> String {
        format!("[[citations:{}]]", self.tag())
    }
}

/// One line inside a marker block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationEntry {
    pub source: String,
    pub name: String,
    pub index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl CitationEntry {
    pub fn new(source: impl Into<String>, name: impl Into<String>, index: u64) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            index,
            text: None,
            tool_call_id: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }
}

/// A normalized citation recovered from history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub name: String,
    pub kind: CitationKind,
    pub index: u64,
    /// Position of the carrying message in the scanned slice.
    pub message_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

fn opening_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\[\[citations:([A-Za-z0-9_-]+)\]\]$")
            .expect("citation tag regex must compile")
    })
}

/// Render a marker block. Returns an empty string for no entries.
pub fn render_block(kind: CitationKind, entries: &[CitationEntry]) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let mut block = kind.opening_tag();
    block.push('\n');
    for entry in entries {
        // Entries only hold strings and integers, which always serialize.
        if let Ok(line) = serde_json::to_string(entry) {
            block.push_str(&line);
            block.push('\n');
        }
    }
    block.push_str(CLOSING_TAG);
    block
}

/// Whether the text carries any marker block.
pub fn has_markers(text: &str) -> bool {
    text.lines()
        .any(|line| opening_tag_pattern().is_match(line.trim()))
}

/// Extract every citation from assistant messages, in message order and
/// then in-text order. Pure; repeated calls give identical output.
pub fn extract(messages: &[Message]) -> Vec<Citation> {
    messages
        .iter()
        .enumerate()
        .filter(|(_, message)| message.role == Role::Assistant)
        .flat_map(|(position, message)| extract_from_text(&message.content, position))
        .collect()
}

/// Extract only citations of one kind.
pub fn extract_kind(messages: &[Message], kind: CitationKind) -> Vec<Citation> {
    extract(messages)
        .into_iter()
        .filter(|citation| citation.kind == kind)
        .collect()
}

fn extract_from_text(text: &str, message_index: usize) -> Vec<Citation> {
    // None: outside a block. Some(None): inside a block of an unknown kind.
    let mut block: Option<Option<CitationKind>> = None;
    let mut citations = Vec::new();

    for line in text.lines().map(str::trim) {
        if line == CLOSING_TAG {
            block = None;
            continue;
        }
        if let Some(caps) = opening_tag_pattern().captures(line) {
            let tag = caps.get(1).map_or("", |m| m.as_str());
            let kind = CitationKind::from_tag(tag);
            if kind.is_none() {
                tracing::debug!(tag, "ignoring unknown citation block");
            }
            block = Some(kind);
            continue;
        }
        let Some(Some(kind)) = block else {
            continue;
        };
        if line.is_empty() {
            continue;
        }
        if let Some(entry) = parse_entry(line) {
            citations.push(Citation {
                source: entry.source,
                name: entry.name,
                kind,
                index: entry.index,
                message_index,
                text: entry.text,
                tool_call_id: entry.tool_call_id,
            });
        }
    }
    citations
}

fn parse_entry(line: &str) -> Option<CitationEntry> {
    match serde_json::from_str::<CitationEntry>(line) {
        Ok(entry) if !entry.source.trim().is_empty() => Some(entry),
        Ok(_) => {
            tracing::debug!("skipping citation entry with empty source");
            None
        }
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed citation entry");
            None
        }
    }
}
