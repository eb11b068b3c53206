use crate::chat::{Chat, ChatManager, Role};
use crate::config::Config;
use crate::error::Result;
use crate::storage::ChatSummary;
use colored::Colorize;
use prettytable::{format, Table};

const TITLE_WIDTH: usize = 40;

/// Chat management actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryAction {
    /// Print a table of chats
    List,
    /// Create a chat
    New {
        /// Title; the configured default when omitted
        title: Option<String>,
    },
    /// Make a chat current
    Switch {
        /// Chat id
        id: String,
    },
    /// Delete a chat
    Delete {
        /// Chat id
        id: String,
    },
    /// Print the messages of a chat
    Show {
        /// Chat id; the current chat when omitted
        id: Option<String>,
    },
}

/// Handle a chat management command
pub async fn handle_history(config: &Config, action: HistoryAction) -> Result<()> {
    let manager = super::open_manager(config).await?;
    let result = apply(&manager, config, action).await;
    manager.dispose().await?;
    result
}

async fn apply(manager: &ChatManager, config: &Config, action: HistoryAction) -> Result<()> {
    match action {
        HistoryAction::List => {
            let chats = manager.list_chats();
            if chats.is_empty() {
                println!("{}", "No chats found.".yellow());
                return Ok(());
            }

            println!("\nChats:");
            render_table(&chats).printstd();
            println!();
            println!("Use {} to continue a chat.", "chatshard chat --chat <ID>".cyan());
            println!();
        }
        HistoryAction::New { title } => {
            let title = title.unwrap_or_else(|| config.storage.default_chat_title.clone());
            let chat = manager.create_new_chat(&title);
            println!("{}", format!("Created chat {} ({})", chat.title, chat.id).green());
        }
        HistoryAction::Switch { id } => {
            let chat = manager.switch_chat(&id).await?;
            println!("{}", format!("Switched to {} ({})", chat.title, chat.id).green());
        }
        HistoryAction::Delete { id } => {
            manager.delete_chat(&id).await?;
            println!("{}", format!("Deleted chat {}", id).green());
        }
        HistoryAction::Show { id } => {
            let chat = match id {
                Some(id) => manager.get_chat(&id),
                None => manager.current_chat(),
            };
            match chat {
                Some(chat) => print!("{}", render_transcript(&chat)),
                None => println!("{}", "No such chat.".yellow()),
            }
        }
    }

    Ok(())
}

fn render_table(chats: &[ChatSummary]) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);

    table.add_row(prettytable::row![
        "".bold(),
        "ID".bold(),
        "Title".bold(),
        "Messages".bold(),
        "Last Updated".bold()
    ]);

    for chat in chats {
        let marker = if chat.is_current { "*" } else { "" };
        let updated = chat.updated_at.format("%Y-%m-%d %H:%M").to_string();
        table.add_row(prettytable::row![
            marker.green(),
            chat.id.cyan(),
            truncate_title(&chat.title),
            chat.message_count,
            updated
        ]);
    }
    table
}

fn truncate_title(title: &str) -> String {
    if title.chars().count() > TITLE_WIDTH {
        let kept: String = title.chars().take(TITLE_WIDTH - 3).collect();
        format!("{}...", kept)
    } else {
        title.to_string()
    }
}

fn render_transcript(chat: &Chat) -> String {
    let mut out = format!("{} {}\n\n", chat.title.bold(), format!("({})", chat.id).dimmed());
    for message in &chat.messages {
        let label = match message.role {
            Role::User => "you".green().bold(),
            Role::Assistant => "assistant".cyan().bold(),
            Role::System => "system".yellow().bold(),
        };
        out.push_str(&format!("{}:\n", label));
        if let Some(reasoning) = message.reasoning_content.as_deref().filter(|r| !r.is_empty()) {
            out.push_str(&format!("{}\n", reasoning.dimmed()));
        }
        out.push_str(&message.content.text());
        if message.updating {
            out.push_str(&format!(" {}", "[incomplete]".yellow()));
        }
        out.push_str("\n\n");
    }
    out
}
