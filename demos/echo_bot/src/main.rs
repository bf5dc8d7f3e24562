//! Echo Bot Example
//!
//! A console bot: every line typed on stdin is published as a message from
//! user `console`, and replies are printed to stdout.
//!
//! Two plugins are linked in with `export_plugin!`:
//!
//! - `echo`: `/echo <text>` repeats the text with a configurable prefix and
//!   exposes the `echo.count` function
//! - `greeter`: depends on `echo`, answers `/hello`, and reads `echo.count`
//!   when it loads
//!
//! The built-in `/plugin` command manages both at runtime:
//!
//! ```text
//! /plugin list
//! /plugin unload greeter
//! /plugin info echo
//! ```
//!
//! # Usage
//!
//! ```bash
//! cd demos/echo_bot && cargo run
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use coral::prelude::*;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::{info, warn};

// ============================================================================
// Plugins
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EchoConfig {
    prefix: String,
}

#[derive(Default)]
struct Echo {
    echoed: Arc<AtomicU64>,
}

#[async_trait]
impl Plugin for Echo {
    async fn setup(&self, setup: &mut PluginSetup) -> Result<(), BoxError> {
        let config: EchoConfig = setup.config()?;
        let prefix = Arc::new(config.prefix);
        let echoed = self.echoed.clone();
        let counted = self.echoed.clone();

        setup
            .on(EventKind::Message, |event: Arc<Event>| async move {
                if let (Some(user), Some(text)) = (event.user(), event.plain_text()) {
                    info!(user = %user.user_id, %text, "Message received");
                }
            })
            .command_with(
                CommandEntry::new(
                    "echo",
                    handler_fn(move |event: Arc<Event>| {
                        let prefix = prefix.clone();
                        let echoed = echoed.clone();
                        async move {
                            let Some(command) = event.as_command() else {
                                return None;
                            };
                            echoed.fetch_add(1, Ordering::Relaxed);
                            Some(format!("{prefix}{}", command.args.join(" ")))
                        }
                    }),
                )
                .description("Repeat the given text"),
            )
            .function(
                "echo.count",
                function_fn(move |_args: Value| {
                    let counted = counted.clone();
                    async move { Ok(json!(counted.load(Ordering::Relaxed))) }
                }),
            );
        Ok(())
    }
}

export_plugin!(
    ECHO = PluginDescriptor::new(
        PluginMetadata::new("echo")
            .description("Repeats what it is told")
            .config_default("prefix", ""),
        Echo::default,
    )
);

struct Greeter;

#[async_trait]
impl Plugin for Greeter {
    async fn setup(&self, setup: &mut PluginSetup) -> Result<(), BoxError> {
        setup.command("hello", |event: Arc<Event>| async move {
            let name = event
                .user()
                .map(|u| u.nickname.clone().unwrap_or_else(|| u.user_id.clone()))
                .unwrap_or_default();
            format!("Hello, {name}!")
        });
        Ok(())
    }

    async fn plugin_load(&self, ctx: &PluginContext) -> Result<bool, BoxError> {
        let count = ctx.call_function("echo.count", Value::Null).await?;
        info!(plugin = ctx.name(), echoed = %count, "Greeter ready");
        Ok(true)
    }
}

export_plugin!(
    GREETER = PluginDescriptor::new(
        PluginMetadata::new("greeter")
            .description("Says hello")
            .depends_on("echo"),
        || Greeter,
    )
);

// ============================================================================
// Console adapter and sink
// ============================================================================

struct StdoutSink;

#[async_trait]
impl ReplySink for StdoutSink {
    async fn deliver(&self, reply: ReplyResult) -> Result<(), BoxError> {
        match reply.text() {
            Some(text) => println!("[bot] {text}"),
            None => println!("[bot] <action> {reply:?}"),
        }
        Ok(())
    }
}

/// Publishes each stdin line; signals `done` at end of input.
async fn read_console(engine: Arc<Engine>, done: oneshot::Sender<()>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let user = UserInfo::new("console", "console").with_nickname("you");
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                let event = MessageEvent::new("console", "coral", user.clone(), line);
                engine.publish(event).await;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        }
    }
    let _ = done.send(());
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let runtime = CoralRuntime::builder().sink(Arc::new(StdoutSink)).build()?;

    runtime.start().await?;

    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(read_console(runtime.engine().clone(), done_tx));

    tokio::select! {
        _ = done_rx => info!("Input closed"),
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
    }

    runtime.stop().await?;
    println!("{}", runtime.stats());
    Ok(())
}
