//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Traffic governor for rate-limited exchange APIs
#[derive(Parser)]
#[command(
    name = "tg",
    about = "Admission control and priority scheduling for outbound exchange API calls",
    version,
    after_help = "Logs are written to: ~/.local/share/trafficgov/logs/trafficgov.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Drive the governor with a synthetic exchange workload
    Simulate {
        /// Number of requests to submit
        #[arg(short = 'n', long, default_value = "50")]
        requests: usize,

        /// Probability that an attempt fails (0.0 - 1.0)
        #[arg(short = 'r', long, default_value = "0.1")]
        failure_rate: f64,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the effective configuration
    Config {
        /// Output format
        #[arg(short, long, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Run admission checks back to back and print each decision
    Check {
        /// Number of checks to run
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Category to check against its sub-limit
        #[arg(long)]
        category: Option<String>,
    },

    /// Show log output
    Logs {
        /// Number of lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },
}

/// Output format for simulate results
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Output format for the config command
#[derive(Clone, Debug, Default)]
pub enum ConfigFormat {
    #[default]
    Yaml,
    Json,
}

impl std::str::FromStr for ConfigFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: yaml or json", s)),
        }
    }
}

impl std::fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yaml => write!(f, "yaml"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Location of the log file written by `tg`
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trafficgov")
        .join("logs")
        .join("trafficgov.log")
}
