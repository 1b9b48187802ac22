//! CLI parse: clap types for komagen. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// komagen - drive an image generation service from panel prompts and story files
#[derive(Parser)]
#[command(name = "komagen")]
#[command(about = "Generate manga panel images with consistent characters")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Project root directory
    #[arg(long, default_value = ".")]
    pub project: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Disable logging entirely
    #[arg(long, default_value = "false")]
    pub quiet: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check the generation service and list installed capabilities
    Probe,
    /// Generate a single panel
    Generate {
        /// Panel prompt
        #[arg(long)]
        prompt: String,
        /// Character id to include (repeatable)
        #[arg(long = "character")]
        characters: Vec<String>,
        /// Negative prompt (defaults to the configured common negative prompt)
        #[arg(long)]
        negative: Option<String>,
        /// Fixed seed (omit to let the service choose)
        #[arg(long)]
        seed: Option<i64>,
        /// Number of candidates to request
        #[arg(long, default_value = "1")]
        count: u32,
        /// Characters file (defaults to <project>/characters.json when present)
        #[arg(long)]
        characters_file: Option<PathBuf>,
        /// Output directory
        #[arg(long, default_value = "out")]
        out: PathBuf,
    },
    /// Generate every panel of a story file
    Story {
        /// Story JSON file
        file: PathBuf,
        /// Characters file (defaults to <project>/characters.json when present)
        #[arg(long)]
        characters: Option<PathBuf>,
        /// Output directory
        #[arg(long, default_value = "out")]
        out: PathBuf,
        /// Generate reference sheets even for characters that already have one
        #[arg(long)]
        regenerate_references: bool,
        /// Retry failed panels once more as a new job
        #[arg(long)]
        retry_failed: bool,
    },
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the effective configuration
    Validate,
}
