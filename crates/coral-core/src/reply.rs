//! Outgoing data produced by handlers.
//!
//! Handlers answer events with [`ReplyResult`]s, which the result queue hands
//! to an external sender. A [`MessageRequest`] is addressed with the same
//! platform/bot/user/group fields as the event it answers; build one with
//! [`MessageRequest::reply_to`] or [`MessageRequest::builder`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::{Event, GroupInfo, UserInfo};
use crate::message::MessageChain;

// ============================================================================
// Message Request
// ============================================================================

/// A request to send a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRequest {
    pub platform: String,
    /// Id of the event being answered; empty for unsolicited messages.
    pub event_id: String,
    pub self_id: String,
    pub message: MessageChain,
    #[serde(default)]
    pub user: Option<UserInfo>,
    #[serde(default)]
    pub group: Option<GroupInfo>,
    /// Mention the sender in group replies.
    #[serde(default)]
    pub at_sender: bool,
    /// Recall the sent message after this delay.
    #[serde(default)]
    pub recall_after: Option<Duration>,
}

impl MessageRequest {
    /// Builds a reply addressed to the sender of `event`.
    pub fn reply_to(event: &Event, message: impl Into<MessageChain>) -> Self {
        MessageRequestBuilder::from_event(event)
            .message(message)
            .build()
    }

    pub fn builder() -> MessageRequestBuilder {
        MessageRequestBuilder::default()
    }
}

/// Builder for [`MessageRequest`].
#[derive(Debug, Clone, Default)]
pub struct MessageRequestBuilder {
    platform: String,
    event_id: String,
    self_id: String,
    message: MessageChain,
    user: Option<UserInfo>,
    group: Option<GroupInfo>,
    at_sender: bool,
    recall_after: Option<Duration>,
}

impl MessageRequestBuilder {
    /// Pre-fills the addressing fields from an event.
    pub fn from_event(event: &Event) -> Self {
        Self {
            platform: event.platform().to_string(),
            event_id: event.event_id().to_string(),
            self_id: event.self_id().to_string(),
            user: event.user().cloned(),
            group: event.group().cloned(),
            ..Default::default()
        }
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn self_id(mut self, self_id: impl Into<String>) -> Self {
        self.self_id = self_id.into();
        self
    }

    pub fn message(mut self, message: impl Into<MessageChain>) -> Self {
        self.message = message.into();
        self
    }

    pub fn user(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }

    pub fn group(mut self, group: GroupInfo) -> Self {
        self.group = Some(group);
        self
    }

    pub fn at_sender(mut self, at_sender: bool) -> Self {
        self.at_sender = at_sender;
        self
    }

    pub fn recall_after(mut self, delay: Duration) -> Self {
        self.recall_after = Some(delay);
        self
    }

    pub fn build(self) -> MessageRequest {
        MessageRequest {
            platform: self.platform,
            event_id: self.event_id,
            self_id: self.self_id,
            message: self.message,
            user: self.user,
            group: self.group,
            at_sender: self.at_sender,
            recall_after: self.recall_after,
        }
    }
}

// ============================================================================
// Action Request
// ============================================================================

/// A platform action that is not a message (kick, mute, set card, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub platform: String,
    pub self_id: String,
    /// Platform action name.
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Delay before the action is performed.
    #[serde(default)]
    pub delay: Option<Duration>,
}

impl ActionRequest {
    pub fn new(
        platform: impl Into<String>,
        self_id: impl Into<String>,
        action: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            platform: platform.into(),
            self_id: self_id.into(),
            action: action.into(),
            params,
            delay: None,
        }
    }

    /// An action on the same platform and bot as `event`.
    pub fn for_event(event: &Event, action: impl Into<String>, params: serde_json::Value) -> Self {
        Self::new(event.platform(), event.self_id(), action, params)
    }
}

// ============================================================================
// Reply Result
// ============================================================================

/// One unit of outgoing data queued for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyResult {
    Message(MessageRequest),
    Action(ActionRequest),
}

impl ReplyResult {
    pub fn platform(&self) -> &str {
        match self {
            Self::Message(m) => &m.platform,
            Self::Action(a) => &a.platform,
        }
    }

    pub fn as_message(&self) -> Option<&MessageRequest> {
        match self {
            Self::Message(m) => Some(m),
            Self::Action(_) => None,
        }
    }

    /// Plain text of a message reply; `None` for actions.
    pub fn text(&self) -> Option<String> {
        self.as_message().map(|m| m.message.plain_text())
    }
}

impl From<MessageRequest> for ReplyResult {
    fn from(m: MessageRequest) -> Self {
        Self::Message(m)
    }
}

impl From<ActionRequest> for ReplyResult {
    fn from(a: ActionRequest) -> Self {
        Self::Action(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MessageEvent, UserInfo};

    #[test]
    fn test_reply_to_copies_addressing() {
        let event: Event = MessageEvent::new("qq", "10001", UserInfo::new("qq", "42"), "ping")
            .in_group(GroupInfo::new("qq", "7"))
            .into();

        let reply = MessageRequest::reply_to(&event, "pong");

        assert_eq!(reply.platform, "qq");
        assert_eq!(reply.self_id, "10001");
        assert_eq!(reply.event_id, event.event_id());
        assert_eq!(reply.user.as_ref().map(|u| u.user_id.as_str()), Some("42"));
        assert_eq!(reply.group.as_ref().map(|g| g.group_id.as_str()), Some("7"));
        assert_eq!(ReplyResult::from(reply).text().as_deref(), Some("pong"));
    }

    #[test]
    fn test_builder_options() {
        let req = MessageRequest::builder()
            .platform("qq")
            .message("hi")
            .at_sender(true)
            .recall_after(Duration::from_secs(30))
            .build();

        assert!(req.at_sender);
        assert_eq!(req.recall_after, Some(Duration::from_secs(30)));
        assert!(req.event_id.is_empty());
    }
}
