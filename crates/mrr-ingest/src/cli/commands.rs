//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Run command arguments.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Serial device to read from (overrides configuration)
    #[arg(short, long)]
    pub device: Option<String>,

    /// Serial read timeout in seconds (overrides configuration)
    #[arg(short, long)]
    pub timeout: Option<f64>,
}

/// Process-hour command arguments.
///
/// Re-runs the hourly conversion for one batch; mainly an operator tool
/// for hours whose converter invocation failed and whose raw files were
/// therefore kept.
#[derive(Debug, Args)]
pub struct ProcessHourCommand {
    /// Hour to process, as a yyMMddHH prefix (e.g. "24010113").
    /// Defaults to the previous hour.
    #[arg(long)]
    pub hour: Option<String>,
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
