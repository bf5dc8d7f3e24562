//! Event system for the Coral framework.
//!
//! This module provides the event data model consumed by the dispatch core:
//!
//! - [`Event`] - Tagged union over every event variant
//! - [`EventKind`] - Explicit discriminant used for subscription matching
//! - [`EventMeta`] - Fields shared by every variant (id, platform, bot, time)
//! - [`MessageEvent`], [`NoticeEvent`], [`CommandEvent`], [`GenericEvent`]
//!
//! Adapters build events and hand them to the bus; once the middleware chain
//! has finished with an event it is shared immutably (`Arc<Event>`) between
//! handlers.
//!
//! # Example
//!
//! ```rust,ignore
//! use coral_core::{Event, MessageEvent, UserInfo};
//!
//! let event: Event = MessageEvent::new("console", "bot", UserInfo::new("console", "alice"), "hi").into();
//! assert_eq!(event.kind(), EventKind::Message);
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ParseKindError;
use crate::message::MessageChain;

// ============================================================================
// Event Kind
// ============================================================================

/// Discriminant of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Chat messages.
    Message,
    /// Platform notices (joins, recalls, pokes, ...).
    Notice,
    /// Parsed bot commands.
    Command,
    /// Named signals with an opaque payload.
    Generic,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [EventKind; 4] = [Self::Message, Self::Notice, Self::Command, Self::Generic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Notice => "notice",
            Self::Command => "command",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "message" | "message_event" => Ok(Self::Message),
            "notice" | "notice_event" => Ok(Self::Notice),
            "command" | "command_event" => Ok(Self::Command),
            "generic" | "generic_event" => Ok(Self::Generic),
            _ => Err(ParseKindError(s.to_string())),
        }
    }
}

// ============================================================================
// Shared Fields
// ============================================================================

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generates a process-unique event id.
pub fn next_event_id() -> String {
    let seq = EVENT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{seq}", unix_millis())
}

/// Fields carried by every event variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Unique event identifier.
    pub event_id: String,
    /// Originating platform tag (e.g. "qq", "console").
    pub platform: String,
    /// Identity of the bot that received the event.
    pub self_id: String,
    /// Unix timestamp in milliseconds.
    pub time: u64,
}

impl EventMeta {
    /// Creates metadata with a freshly generated id and the current time.
    pub fn new(platform: impl Into<String>, self_id: impl Into<String>) -> Self {
        Self {
            event_id: next_event_id(),
            platform: platform.into(),
            self_id: self_id.into(),
            time: unix_millis(),
        }
    }

    /// Overrides the generated id with one supplied by the platform.
    pub fn with_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }
}

/// A platform user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserInfo {
    pub platform: String,
    pub user_id: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub cardname: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserInfo {
    pub fn new(platform: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    /// Best display name: group card, then nickname, then the raw id.
    pub fn display_name(&self) -> &str {
        self.cardname
            .as_deref()
            .or(self.nickname.as_deref())
            .unwrap_or(&self.user_id)
    }
}

/// A platform group / channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupInfo {
    pub platform: String,
    pub group_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl GroupInfo {
    pub fn new(platform: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            group_id: group_id.into(),
            name: None,
        }
    }
}

// ============================================================================
// Event Variants
// ============================================================================

/// A chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub message: MessageChain,
    pub user: UserInfo,
    #[serde(default)]
    pub group: Option<GroupInfo>,
}

impl MessageEvent {
    pub fn new(
        platform: impl Into<String>,
        self_id: impl Into<String>,
        user: UserInfo,
        message: impl Into<MessageChain>,
    ) -> Self {
        Self {
            meta: EventMeta::new(platform, self_id),
            message: message.into(),
            user,
            group: None,
        }
    }

    pub fn in_group(mut self, group: GroupInfo) -> Self {
        self.group = Some(group);
        self
    }

    pub fn plain_text(&self) -> String {
        self.message.plain_text()
    }
}

/// A platform notice such as a member joining or a message recall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoticeEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Notice subtype as reported by the platform.
    pub notice_type: String,
    #[serde(default)]
    pub user: Option<UserInfo>,
    #[serde(default)]
    pub group: Option<GroupInfo>,
    #[serde(default)]
    pub operator: Option<UserInfo>,
    #[serde(default)]
    pub target: Option<UserInfo>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl NoticeEvent {
    pub fn new(
        platform: impl Into<String>,
        self_id: impl Into<String>,
        notice_type: impl Into<String>,
    ) -> Self {
        Self {
            meta: EventMeta::new(platform, self_id),
            notice_type: notice_type.into(),
            user: None,
            group: None,
            operator: None,
            target: None,
            comment: None,
        }
    }
}

/// A bot command: a name plus whitespace-separated arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Command name without the prefix.
    pub command: String,
    /// Full text the command was parsed from.
    pub raw_message: String,
    pub user: UserInfo,
    #[serde(default)]
    pub group: Option<GroupInfo>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandEvent {
    pub fn new(
        platform: impl Into<String>,
        self_id: impl Into<String>,
        user: UserInfo,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        let command = command.into();
        let raw_message = std::iter::once(command.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            meta: EventMeta::new(platform, self_id),
            command,
            raw_message,
            user,
            group: None,
            args,
        }
    }

    /// Parses a command out of a message whose plain text starts with `prefix`.
    ///
    /// Returns `None` when the text does not start with the prefix or nothing
    /// follows it. The command keeps the message's metadata so replies are
    /// addressed to the original message.
    pub fn from_message(message: &MessageEvent, prefix: &str) -> Option<Self> {
        let text = message.plain_text();
        let body = text.trim_start().strip_prefix(prefix)?;
        let mut parts = body.split_whitespace();
        let command = parts.next()?.to_string();
        Some(Self {
            meta: message.meta.clone(),
            command,
            raw_message: text.trim().to_string(),
            user: message.user.clone(),
            group: message.group.clone(),
            args: parts.map(str::to_string).collect(),
        })
    }
}

/// A named signal with an opaque JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl GenericEvent {
    pub fn new(
        platform: impl Into<String>,
        self_id: impl Into<String>,
        name: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            meta: EventMeta::new(platform, self_id),
            name: name.into(),
            data,
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// Every event the dispatch core understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Message(MessageEvent),
    Notice(NoticeEvent),
    Command(CommandEvent),
    Generic(GenericEvent),
}

impl Event {
    /// The runtime variant, used to match subscriptions.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message(_) => EventKind::Message,
            Self::Notice(_) => EventKind::Notice,
            Self::Command(_) => EventKind::Command,
            Self::Generic(_) => EventKind::Generic,
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::Message(e) => &e.meta,
            Self::Notice(e) => &e.meta,
            Self::Command(e) => &e.meta,
            Self::Generic(e) => &e.meta,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.meta().event_id
    }

    pub fn platform(&self) -> &str {
        &self.meta().platform
    }

    pub fn self_id(&self) -> &str {
        &self.meta().self_id
    }

    pub fn time(&self) -> u64 {
        self.meta().time
    }

    /// The user who caused the event, if any.
    pub fn user(&self) -> Option<&UserInfo> {
        match self {
            Self::Message(e) => Some(&e.user),
            Self::Notice(e) => e.user.as_ref(),
            Self::Command(e) => Some(&e.user),
            Self::Generic(_) => None,
        }
    }

    /// The group the event happened in, if any.
    pub fn group(&self) -> Option<&GroupInfo> {
        match self {
            Self::Message(e) => e.group.as_ref(),
            Self::Notice(e) => e.group.as_ref(),
            Self::Command(e) => e.group.as_ref(),
            Self::Generic(_) => None,
        }
    }

    /// Text content for message and command events.
    pub fn plain_text(&self) -> Option<String> {
        match self {
            Self::Message(e) => Some(e.plain_text()),
            Self::Command(e) => Some(e.raw_message.clone()),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&MessageEvent> {
        match self {
            Self::Message(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_notice(&self) -> Option<&NoticeEvent> {
        match self {
            Self::Notice(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_command(&self) -> Option<&CommandEvent> {
        match self {
            Self::Command(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_generic(&self) -> Option<&GenericEvent> {
        match self {
            Self::Generic(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MessageEvent> for Event {
    fn from(e: MessageEvent) -> Self {
        Self::Message(e)
    }
}

impl From<NoticeEvent> for Event {
    fn from(e: NoticeEvent) -> Self {
        Self::Notice(e)
    }
}

impl From<CommandEvent> for Event {
    fn from(e: CommandEvent) -> Self {
        Self::Command(e)
    }
}

impl From<GenericEvent> for Event {
    fn from(e: GenericEvent) -> Self {
        Self::Generic(e)
    }
}
