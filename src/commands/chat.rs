//! Chat command handler
//!
//! A turn appends the user message, streams the answer through an
//! [`UpdateSerializer`] into the current chat, and settles the placeholder
//! when the stream ends. The interactive mode wraps turns in a
//! readline-based loop where Ctrl-C cancels the stream in flight.

use crate::chat::{ChatManager, Message, MessageUpdate};
use crate::completion::{CompletionClient, Snapshot, StreamOptions, StreamOutcome};
use crate::config::{Config, StreamingConfig};
use crate::error::{ChatshardError, Result};
use crate::view_sync::{UpdateSerializer, ViewSink};
use async_trait::async_trait;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// How a turn that produced output ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnReport {
    /// The stream completed; holds the final answer
    Completed(Snapshot),
    /// The user cancelled after output arrived; holds what was kept
    Interrupted(Snapshot),
}

/// Everything a turn needs besides its input
#[derive(Clone)]
pub struct TurnContext {
    /// Persistence engine holding the current chat
    pub manager: ChatManager,
    /// Completion endpoint
    pub client: CompletionClient,
    /// Throttle and misfiled reasoning settings
    pub streaming: StreamingConfig,
    /// Renderer of streamed snapshots
    pub view: Arc<dyn ViewSink>,
}

struct Attempt {
    result: Result<StreamOutcome>,
    applied: usize,
}

impl TurnContext {
    /// Run one turn in the current chat
    ///
    /// On `MisfiledReasoning` the turn is retried once with detection off and
    /// content routed to reasoning. When a turn fails before any output was
    /// applied, the user message is rolled back; when output was applied it
    /// is settled and kept.
    ///
    /// # Errors
    ///
    /// - `ChatshardError::StreamAborted` when cancelled before any output
    /// - `ChatshardError::NoActiveChat` when no chat is selected
    /// - any completion error (`Provider`, `Http`, ...)
    pub async fn run_turn(&self, prompt: &str, interrupt: &CancellationToken) -> Result<TurnReport> {
        let chat_id = self
            .manager
            .current_chat_id()
            .ok_or(ChatshardError::NoActiveChat)?;
        self.manager
            .add_message_to_current_chat(Message::user(prompt))?;

        let mut attempt = self
            .attempt(&chat_id, StreamOptions::from_config(&self.streaming), interrupt)
            .await?;

        let misfiled = matches!(
            attempt
                .result
                .as_ref()
                .err()
                .and_then(|e| e.downcast_ref::<ChatshardError>()),
            Some(ChatshardError::MisfiledReasoning { .. })
        );
        if misfiled {
            tracing::info!("Restarting turn with content routed to reasoning");
            attempt = self
                .attempt(&chat_id, StreamOptions::for_restart(&self.streaming), interrupt)
                .await?;
        }

        match attempt.result {
            Ok(StreamOutcome::Completed(snapshot)) => {
                self.manager
                    .update_last_message(&chat_id, &MessageUpdate::settled());
                Ok(TurnReport::Completed(snapshot))
            }
            Ok(StreamOutcome::Aborted(Some(snapshot))) => {
                self.manager
                    .update_last_message(&chat_id, &MessageUpdate::settled());
                Ok(TurnReport::Interrupted(snapshot))
            }
            Ok(StreamOutcome::Aborted(None)) => {
                self.rollback(&chat_id)?;
                Err(ChatshardError::StreamAborted.into())
            }
            Err(e) if attempt.applied > 0 => {
                tracing::warn!("Turn failed after output was stored: {}", e);
                self.manager
                    .update_last_message(&chat_id, &MessageUpdate::settled());
                Err(e)
            }
            Err(e) => {
                self.rollback(&chat_id)?;
                Err(e)
            }
        }
    }

    async fn attempt(
        &self,
        chat_id: &str,
        options: StreamOptions,
        interrupt: &CancellationToken,
    ) -> Result<Attempt> {
        let messages = self
            .manager
            .get_chat(chat_id)
            .map(|chat| chat.messages)
            .ok_or_else(|| ChatshardError::NotFound(chat_id.to_string()))?;

        let (handle, consumer) = self.client.open(&messages, options);
        let watcher = {
            let interrupt = interrupt.clone();
            tokio::spawn(async move {
                interrupt.cancelled().await;
                handle.abort();
            })
        };

        let mut serializer =
            UpdateSerializer::spawn(self.manager.clone(), chat_id, Arc::clone(&self.view));
        let result = consumer.consume(&mut serializer).await;
        let applied = serializer.finish().await?;
        watcher.abort();

        Ok(Attempt { result, applied })
    }

    /// Remove the user message of a turn that produced nothing
    fn rollback(&self, chat_id: &str) -> Result<()> {
        if self.manager.current_chat_id().as_deref() != Some(chat_id) {
            tracing::warn!(chat_id = %chat_id, "Chat changed during the turn; not rolling back");
            return Ok(());
        }
        self.manager.pop_message()?;
        Ok(())
    }
}

/// Prints the growing answer to stdout, writing only what is new
#[derive(Default)]
pub struct TerminalView {
    printed: Mutex<Printed>,
}

#[derive(Default)]
struct Printed {
    reasoning: usize,
    content: usize,
}

impl TerminalView {
    /// Forget what was printed so the next turn starts fresh
    pub fn reset(&self) {
        *self.printed.lock().unwrap_or_else(PoisonError::into_inner) = Printed::default();
    }

    fn new_text(text: &str, printed: &mut usize) -> Option<String> {
        let fresh = text.get(*printed..)?;
        if fresh.is_empty() {
            return None;
        }
        *printed = text.len();
        Some(fresh.to_string())
    }
}

#[async_trait]
impl ViewSink for TerminalView {
    async fn render(&self, _chat_id: &str, snapshot: &Snapshot) {
        let (reasoning, content) = {
            let mut printed = self.printed.lock().unwrap_or_else(PoisonError::into_inner);
            let printed = &mut *printed;
            (
                Self::new_text(&snapshot.reasoning_content, &mut printed.reasoning),
                Self::new_text(&snapshot.content, &mut printed.content),
            )
        };

        let mut stdout = std::io::stdout();
        if let Some(reasoning) = reasoning {
            let _ = write!(stdout, "{}", reasoning.dimmed());
        }
        if let Some(content) = content {
            let _ = write!(stdout, "{}", content);
        }
        let _ = stdout.flush();
    }
}

/// Run the chat command
///
/// With a prompt, runs a single turn and exits; otherwise starts the
/// interactive loop.
///
/// # Arguments
///
/// * `config` - Global configuration (consumed)
/// * `prompt` - Single prompt to send
/// * `chat_id` - Chat to continue instead of the current one
pub async fn run_chat(config: Config, prompt: Option<String>, chat_id: Option<String>) -> Result<()> {
    let manager = super::open_manager(&config).await?;
    if let Some(id) = &chat_id {
        manager.switch_chat(id).await?;
    }

    let view = Arc::new(TerminalView::default());
    let ctx = TurnContext {
        manager: manager.clone(),
        client: CompletionClient::new(&config.provider)?,
        streaming: config.streaming.clone(),
        view: view.clone(),
    };

    let result = match prompt {
        Some(prompt) => run_single(&ctx, &prompt).await,
        None => run_interactive(&ctx, &view).await,
    };

    manager.dispose().await?;
    result
}

async fn run_single(ctx: &TurnContext, prompt: &str) -> Result<()> {
    let interrupt = CancellationToken::new();
    let signal = spawn_interrupt_listener(interrupt.clone());
    let outcome = ctx.run_turn(prompt, &interrupt).await;
    signal.abort();

    match outcome {
        Ok(_) => {
            println!();
            Ok(())
        }
        Err(e) if is_abort(&e) => {
            println!("{}", "[cancelled]".yellow());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn run_interactive(ctx: &TurnContext, view: &TerminalView) -> Result<()> {
    let mut rl = DefaultEditor::new()?;

    if let Some(chat) = ctx.manager.current_chat() {
        println!(
            "{} {} {}",
            "Chat".bold(),
            chat.title.cyan(),
            format!("({})", chat.id).dimmed()
        );
    }
    println!("Type {} or press Ctrl-D to leave.\n", "/exit".cyan());

    loop {
        match rl.readline(&format!("{} ", ">>".green())) {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == "/exit" || trimmed == "/quit" {
                    break;
                }
                rl.add_history_entry(trimmed)?;

                view.reset();
                let interrupt = CancellationToken::new();
                let signal = spawn_interrupt_listener(interrupt.clone());
                let outcome = ctx.run_turn(trimmed, &interrupt).await;
                signal.abort();

                match outcome {
                    Ok(TurnReport::Completed(_)) => println!("\n"),
                    Ok(TurnReport::Interrupted(_)) => println!("\n{}\n", "[interrupted]".yellow()),
                    Err(e) if is_abort(&e) => println!("{}\n", "[cancelled]".yellow()),
                    Err(e) => {
                        tracing::error!("Turn failed: {}", e);
                        eprintln!("{}\n", format!("Error: {}", e).red());
                    }
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = ctx.manager.flush_now().await {
            tracing::warn!("Failed to flush chats: {}", e);
        }
    }

    Ok(())
}

fn spawn_interrupt_listener(interrupt: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    })
}

fn is_abort(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ChatshardError>()
        .is_some_and(ChatshardError::is_abort)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_view_prints_only_new_text() {
        let mut printed = 0;
        assert_eq!(TerminalView::new_text("He", &mut printed).as_deref(), Some("He"));
        assert_eq!(TerminalView::new_text("Hello", &mut printed).as_deref(), Some("llo"));
        assert_eq!(TerminalView::new_text("Hello", &mut printed), None);
        // A shrinking snapshot prints nothing rather than panicking.
        assert_eq!(TerminalView::new_text("Hi", &mut printed), None);
    }

    #[test]
    fn test_terminal_view_respects_char_boundaries() {
        let mut printed = 1;
        assert_eq!(TerminalView::new_text("\u{e9}t\u{e9}", &mut printed), None);
    }

    #[test]
    fn test_is_abort() {
        assert!(is_abort(&ChatshardError::StreamAborted.into()));
        assert!(!is_abort(&ChatshardError::NoActiveChat.into()));
        assert!(!is_abort(&anyhow::anyhow!("other")));
    }
}
