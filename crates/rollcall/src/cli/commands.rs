//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Normalize command arguments.
#[derive(Debug, Args)]
pub struct NormalizeCommand {
    /// Display names to normalize
    #[arg(required = true)]
    pub names: Vec<String>,
}

/// Ensure command arguments.
#[derive(Debug, Args)]
pub struct EnsureCommand {
    /// Comma-separated display names (e.g. "Tom Smith, Ann Lee")
    pub names: String,
}

/// List command arguments.
#[derive(Debug, Args)]
pub struct ListCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Child display name or key
    pub child: String,

    /// New status (e.g. "Boarded", "Dropped", "Absent")
    pub status: String,
}

/// Message command arguments.
#[derive(Debug, Args)]
pub struct MessageCommand {
    /// Child display name or key
    pub child: String,

    /// Action tag for the message (e.g. "pickup")
    pub action: String,

    /// Message text
    pub text: String,
}

/// Watch command arguments.
#[derive(Debug, Args)]
pub struct WatchCommand {
    /// Comma-separated display names to ensure before watching
    #[arg(default_value = "")]
    pub names: String,

    /// Child whose fields to follow (defaults to the first live key)
    #[arg(short, long, value_name = "CHILD")]
    pub select: Option<String>,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_command_debug() {
        let cmd = StatusCommand {
            child: "Tom".to_string(),
            status: "Boarded".to_string(),
        };
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("child"));
        assert!(debug_str.contains("Boarded"));
    }

    #[test]
    fn test_watch_command_debug() {
        let cmd = WatchCommand {
            names: "Tom, Ann".to_string(),
            select: Some("Ann".to_string()),
        };
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("select"));
    }

    #[test]
    fn test_config_command_debug() {
        let cmd = ConfigCommand::Show { json: false };
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("Show"));
    }
}
