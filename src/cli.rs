use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// jobservice - manage init jobs and their settings
#[derive(Parser)]
#[command(name = "jobservice")]
#[command(about = "Inspect and control system jobs and their service-level settings")]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to /etc/jobservice/config.json when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List all jobs known to any backend
    List,
    /// Show description and status of a job
    Show {
        job: String,
    },
    /// Start a job
    Start {
        job: String,
    },
    /// Stop a job
    Stop {
        job: String,
    },
    /// Start a job automatically at boot
    Enable {
        job: String,
    },
    /// Do not start a job automatically
    Disable {
        job: String,
    },
    /// Show a job's settings with their current values
    Settings {
        job: String,
        /// Locale for descriptions, e.g. de_DE.UTF-8
        #[arg(short, long)]
        locale: Option<String>,
    },
    /// Change one or more settings; nothing is written unless all are valid
    Set {
        job: String,
        /// Assignments in KEY=VALUE form
        #[arg(required = true, value_parser = parse_assignment)]
        assignments: Vec<(String, String)>,
    },
    /// Check a value for a setting without changing anything
    Validate {
        job: String,
        key: String,
        value: String,
    },
    /// Comment out or restore a file-backed setting
    Toggle {
        job: String,
        key: String,
        /// Restore the setting line
        #[arg(long, conflicts_with = "off", required_unless_present = "off")]
        on: bool,
        /// Comment the setting line out
        #[arg(long)]
        off: bool,
    },
    /// Validate a configuration file
    CheckConfig {
        path: PathBuf,
    },
}

/// Split `KEY=VALUE` at the first `=`
fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
