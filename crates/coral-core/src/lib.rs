//! # Coral Core
//!
//! The data model of the Coral bot framework.
//!
//! This crate defines what flows through the engine, not how it flows:
//!
//! - **Events** ([`Event`], [`EventKind`]): the tagged union adapters publish
//! - **Messages** ([`MessageChain`], [`MessageSegment`]): opaque message content
//! - **Replies** ([`ReplyResult`], [`MessageRequest`], [`ActionRequest`]): what
//!   handlers produce for delivery
//!
//! ```text
//! ┌─────────────┐  Event   ┌──────────────┐  ReplyResult  ┌──────────────┐
//! │   Adapter   │─────────▶│  Event Bus   │──────────────▶│ Result Queue │──▶ sender
//! └─────────────┘          └──────────────┘               └──────────────┘
//! ```
//!
//! The dispatch core itself lives in `coral-framework`.

pub mod error;
pub mod event;
pub mod message;
pub mod reply;

pub use error::ParseKindError;
pub use event::{
    CommandEvent, Event, EventKind, EventMeta, GenericEvent, GroupInfo, MessageEvent, NoticeEvent,
    UserInfo,
};
pub use message::{MessageChain, MessageSegment};
pub use reply::{ActionRequest, MessageRequest, MessageRequestBuilder, ReplyResult};
