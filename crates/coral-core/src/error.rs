//! Error types for the Coral data model.

use thiserror::Error;

/// Returned when a string does not name an [`EventKind`](crate::EventKind).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event kind '{0}'")]
pub struct ParseKindError(pub String);
