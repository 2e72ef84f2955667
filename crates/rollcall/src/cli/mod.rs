//! Command-line interface for rollcall.
//!
//! This module provides the CLI structure for the `rollcall` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logging::Verbosity;

pub use commands::{
    ConfigCommand, EnsureCommand, ListCommand, MessageCommand, NormalizeCommand, StatusCommand,
    WatchCommand,
};

/// rollcall - Keep child records in sync for a school-bus route
///
/// Creates missing child records, repairs records stored under a stale key,
/// and follows live changes to the collection.
#[derive(Debug, Parser)]
#[command(name = "rollcall")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the canonical key for each display name
    Normalize(NormalizeCommand),

    /// Create records that are missing and fill in absent fields
    Ensure(EnsureCommand),

    /// List every child record
    List(ListCommand),

    /// Update a child's status
    Status(StatusCommand),

    /// Append a message to a child's log
    Message(MessageCommand),

    /// Move records stored under a stale key and wait for the moves
    Reconcile,

    /// Follow the key set and one child's fields until interrupted
    Watch(WatchCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Logging verbosity selected by `-v` and `-q`.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.verbose, self.quiet)
    }
}
