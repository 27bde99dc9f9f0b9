//! Argument definitions: a top-level `Cli` wrapping a flat `Commands` subcommand enum. No
//! grouped noun/verb subcommands — there is only one collection per container.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "wax", version, about = "Wax memory store CLI", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open (creating if missing) a container and report its generation and frame count.
    Open {
        path: PathBuf,
    },
    /// Append a frame of text to the container and commit.
    Remember {
        path: PathBuf,
        text: String,
        #[arg(long, value_enum, default_value = "document")]
        role: RoleArg,
        /// Free-form tag, e.g. "note", "handoff", "surrogate".
        #[arg(long, default_value = "note")]
        kind: String,
    },
    /// Run unified search and print matching frame ids and scores.
    Recall {
        path: PathBuf,
        query: String,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },
    /// Force a commit of any pending frames (a no-op if nothing changed).
    Flush {
        path: PathBuf,
    },
    /// Verify the container's dual-header/TOC/footer chain without mutating anything.
    Verify {
        path: PathBuf,
    },
    /// Print frame/entity/fact counts.
    Stats {
        path: PathBuf,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
pub enum RoleArg {
    Document,
    Chunk,
    System,
}

impl From<RoleArg> for crate::frame::FrameRole {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Document => Self::Document,
            RoleArg::Chunk => Self::Chunk,
            RoleArg::System => Self::System,
        }
    }
}
