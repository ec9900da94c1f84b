//! CLI definitions for recall.

use clap::{Parser, Subcommand};

/// Hybrid retrieval and user memory
#[derive(Parser)]
#[command(name = "recall")]
#[command(about = "Hybrid retrieval pipeline and per-user memory store")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration profile, read from config/{env}.*
    #[arg(long, env = "RECALL_ENV", global = true)]
    pub env: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the retrieval pipeline over a user's memories
    Query {
        user: String,
        /// Intent selecting budgets and type allow-list (chat, ha, search)
        intent: String,
        collection: String,
        #[arg(required = true)]
        text: Vec<String>,
        /// Print the stage trace as JSON
        #[arg(long)]
        explain: bool,
    },

    /// Store a memory for a user
    Remember {
        user: String,
        #[arg(required = true)]
        text: Vec<String>,
        /// Stable document id; repeated writes replace the memory
        #[arg(long)]
        doc_id: Option<String>,
        /// Metadata `type`, used by intent allow-lists
        #[arg(long = "type")]
        item_type: Option<String>,
        #[arg(long)]
        topic: Option<String>,
        #[arg(long)]
        pinned: bool,
    },

    /// Delete a memory by id
    Forget { user: String, id: String },
}
