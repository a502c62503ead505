//! CLI for inspecting tool servers and persisted threads.

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::mcp::CollisionPolicy;

/// swarmkit CLI
#[derive(Parser, Debug)]
#[command(name = "swarmkit", version, about = "swarmkit tool-server and thread inspector")]
pub struct Cli {
    /// Config file (defaults to $SWARMKIT_CONFIG, then ~/.swarmkit/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the aggregated tool catalog of every configured server
    Tools(ToolsArgs),
    /// Invoke one tool
    Call(CallArgs),
    /// Print citations recorded in persisted threads
    Citations(CitationsArgs),
}

/// How tools with the same name on several servers are exposed.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Collision {
    #[default]
    First,
    Reject,
    Namespace,
}

impl From<Collision> for CollisionPolicy {
    fn from(value: Collision) -> Self {
        match value {
            Collision::First => CollisionPolicy::FirstRegisteredWins,
            Collision::Reject => CollisionPolicy::Reject,
            Collision::Namespace => CollisionPolicy::NamespaceServerAndTool,
        }
    }
}

/// Arguments for `swarmkit tools`.
#[derive(Parser, Debug)]
pub struct ToolsArgs {
    #[arg(long, value_enum, default_value_t = Collision::First)]
    pub collision: Collision,
}

/// Arguments for `swarmkit call`.
#[derive(Parser, Debug)]
pub struct CallArgs {
    /// Exposed tool name
    pub tool: String,

    /// Arguments as a JSON object
    #[arg(short, long, default_value = "{}")]
    pub args: String,

    #[arg(long, value_enum, default_value_t = Collision::First)]
    pub collision: Collision,
}

/// Arguments for `swarmkit citations`.
#[derive(Parser, Debug)]
pub struct CitationsArgs {
    /// Directory written by the file thread persistence
    pub dir: Option<PathBuf>,

    /// Only this thread, as `sender->recipient`
    #[arg(short, long)]
    pub thread: Option<String>,
}
