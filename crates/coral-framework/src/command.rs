//! Built-in command router.
//!
//! The engine subscribes one [`CommandRouter`] to [`EventKind::Command`]. It
//! looks the command up in the registry, asks the permission checker when the
//! command names a permission, and forwards the event to the command's
//! handler.
//!
//! [`EventKind::Command`]: coral_core::EventKind::Command

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceExt};
use tracing::{debug, warn};

use coral_core::{Event, MessageRequest, ReplyResult};

use crate::error::BoxError;
use crate::handler::{BoxedHandler, HandlerResult};
use crate::permission::PermissionChecker;
use crate::registry::SharedRegistry;

/// Routes command events to registered [`CommandEntry`](crate::CommandEntry) handlers.
#[derive(Clone)]
pub struct CommandRouter {
    registry: SharedRegistry,
    permissions: Arc<dyn PermissionChecker>,
    reply_unknown: bool,
}

impl CommandRouter {
    pub fn new(registry: SharedRegistry, permissions: Arc<dyn PermissionChecker>) -> Self {
        Self {
            registry,
            permissions,
            reply_unknown: true,
        }
    }

    /// Reply "No command found" for unknown names (default: `true`).
    pub fn reply_unknown(mut self, enabled: bool) -> Self {
        self.reply_unknown = enabled;
        self
    }

    /// Erases the router into a handler suitable for subscription.
    pub fn into_handler(self) -> BoxedHandler {
        BoxCloneSyncService::new(self)
    }

    async fn route(self, event: Arc<Event>) -> HandlerResult {
        let Some(command) = event.as_command() else {
            return Ok(Vec::new());
        };

        let found = self
            .registry
            .read()
            .command(&command.command)
            .map(|entry| (entry.handler.clone(), entry.permission.clone()));

        let Some((handler, permission)) = found else {
            debug!(command = %command.command, "No command found");
            if !self.reply_unknown {
                return Ok(Vec::new());
            }
            let text = format!("No command found: {}", command.command);
            return Ok(vec![reply(&event, text)]);
        };

        if let Some(permission) = permission {
            let allowed = self
                .permissions
                .check_permission(&[permission.as_str()], &command.user, command.group.as_ref())
                .await;
            if !allowed {
                warn!(
                    command = %command.command,
                    user = %command.user.user_id,
                    permission = %permission,
                    "Permission denied"
                );
                return Ok(vec![reply(&event, "Permission denied")]);
            }
        }

        handler.oneshot(event).await
    }
}

fn reply(event: &Event, text: impl Into<String>) -> ReplyResult {
    MessageRequest::reply_to(event, text.into()).into()
}

impl Service<Arc<Event>> for CommandRouter {
    type Response = Vec<ReplyResult>;
    type Error = BoxError;
    type Future = BoxFuture<'static, HandlerResult>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: Arc<Event>) -> Self::Future {
        self.clone().route(event).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_core::{CommandEvent, UserInfo};

    use crate::handler::handler_fn;
    use crate::permission::{AllowAll, PermissionTable};
    use crate::registry::{CommandEntry, Registry};
    use crate::subscription::DEFAULT_PRIORITY;

    fn command(user: &str, name: &str, args: &[&str]) -> Arc<Event> {
        let args = args.iter().map(|a| a.to_string()).collect();
        Arc::new(CommandEvent::new("console", "bot", UserInfo::new("console", user), name, args).into())
    }

    fn registry_with_echo() -> SharedRegistry {
        let registry = Registry::shared(DEFAULT_PRIORITY);
        registry
            .write()
            .register_command(
                CommandEntry::new(
                    "echo",
                    handler_fn(|event: Arc<Event>| async move {
                        event.as_command().map(|c| c.args.join(" "))
                    }),
                )
                .permission("echo.use"),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_routes_to_handler() {
        let router = CommandRouter::new(registry_with_echo(), Arc::new(AllowAll)).into_handler();
        let replies = router.oneshot(command("alice", "echo", &["a", "b"])).await.unwrap();
        assert_eq!(replies[0].text().as_deref(), Some("a b"));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let router = CommandRouter::new(registry_with_echo(), Arc::new(AllowAll));

        let replies = router.clone().into_handler().oneshot(command("alice", "nope", &[])).await.unwrap();
        assert_eq!(replies[0].text().as_deref(), Some("No command found: nope"));

        let silent = router.reply_unknown(false).into_handler();
        assert!(silent.oneshot(command("alice", "nope", &[])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let table = Arc::new(PermissionTable::new());
        table.grant("alice", "echo.use");
        let router = CommandRouter::new(registry_with_echo(), table).into_handler();

        let denied = router.clone().oneshot(command("bob", "echo", &["hi"])).await.unwrap();
        assert_eq!(denied[0].text().as_deref(), Some("Permission denied"));

        let allowed = router.oneshot(command("alice", "echo", &["hi"])).await.unwrap();
        assert_eq!(allowed[0].text().as_deref(), Some("hi"));
    }
}
