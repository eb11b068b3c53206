//! Command-line interface definition for chatshard
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for chatting and for managing stored chats.

use clap::{Parser, Subcommand};

/// chatshard - streaming chat client with sharded local history
#[derive(Parser, Debug, Clone)]
#[command(name = "chatshard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the chat database directory
    #[arg(long, env = "CHATSHARD_STORAGE_PATH")]
    pub storage_path: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for chatshard
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Send a prompt, or start an interactive chat when no prompt is given
    Chat {
        /// Single prompt to send; the answer is streamed and the command exits
        #[arg(short, long)]
        prompt: Option<String>,

        /// Chat to continue instead of the current one
        #[arg(long = "chat")]
        chat_id: Option<String>,
    },

    /// List stored chats
    List,

    /// Create a chat and make it current
    New {
        /// Title of the chat
        #[arg(short, long)]
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

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            storage_path: None,
            command: Commands::List,
        }
    }
}
