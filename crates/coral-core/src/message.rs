//! Message content carried by events and replies.
//!
//! The engine never interprets message content: a [`MessageChain`] is an
//! ordered list of [`MessageSegment`]s that protocol adapters translate to and
//! from their wire formats. The only operation the framework itself relies on
//! is [`MessageChain::plain_text`], used for command detection.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Message Segment
// ============================================================================

/// A single unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MessageSegment {
    /// Plain text.
    Text(String),
    /// A mention of a user by platform id.
    Mention(String),
    /// An image referenced by URL or platform file id.
    Image(String),
    /// Any other platform-specific segment, kept opaque.
    Other {
        /// Segment type as reported by the platform.
        kind: String,
        /// Raw segment payload.
        data: serde_json::Value,
    },
}

impl MessageSegment {
    /// Returns the type identifier of this segment (e.g. "text", "image").
    pub fn segment_type(&self) -> &str {
        match self {
            Self::Text(_) => "text",
            Self::Mention(_) => "mention",
            Self::Image(_) => "image",
            Self::Other { kind, .. } => kind,
        }
    }

    /// Returns the text content if this is a text segment.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for MessageSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Mention(id) => write!(f, "@{id}"),
            Self::Image(_) => f.write_str("[image]"),
            Self::Other { kind, .. } => write!(f, "[{kind}]"),
        }
    }
}

// ============================================================================
// Message Chain
// ============================================================================

/// An ordered sequence of [`MessageSegment`]s forming one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageChain(Vec<MessageSegment>);

impl MessageChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a chain holding a single text segment.
    pub fn text(text: impl Into<String>) -> Self {
        Self(vec![MessageSegment::Text(text.into())])
    }

    /// Appends a segment, builder style.
    pub fn with(mut self, segment: MessageSegment) -> Self {
        self.0.push(segment);
        self
    }

    /// Appends a segment.
    pub fn push(&mut self, segment: MessageSegment) {
        self.0.push(segment);
    }

    /// Concatenated content of all text segments.
    pub fn plain_text(&self) -> String {
        self.0.iter().filter_map(MessageSegment::as_text).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageSegment> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[MessageSegment] {
        &self.0
    }
}

impl fmt::Display for MessageChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl From<&str> for MessageChain {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for MessageChain {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<Vec<MessageSegment>> for MessageChain {
    fn from(segments: Vec<MessageSegment>) -> Self {
        Self(segments)
    }
}

impl FromIterator<MessageSegment> for MessageChain {
    fn from_iter<I: IntoIterator<Item = MessageSegment>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for MessageChain {
    type Item = MessageSegment;
    type IntoIter = std::vec::IntoIter<MessageSegment>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
