//! phoenix CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use phoenix_common::telemetry::LogFormat;

/// phoenix - control-plane quorum-loss recovery
#[derive(Parser, Debug)]
#[command(name = "phoenix")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Recovery configuration file (YAML); defaults apply when omitted
    #[arg(long, short = 'f', global = true, env = "PHOENIX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to kubeconfig file (falls back to KUBECONFIG / in-cluster)
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,

    /// Format of reports printed on stdout
    #[arg(long, short = 'o', global = true, value_enum, default_value_t = OutputFormat::Yaml)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full quorum-loss recovery
    Recover(commands::recover::RecoverArgs),
    /// Wait for every cluster operator to settle
    Settle(commands::settle::SettleArgs),
    /// Force convergence-gated redeploys of static-pod operands
    Redeploy(commands::redeploy::RedeployArgs),
}

/// `--log-format` values
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// `--output` values
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Yaml,
    Json,
}

/// Options shared by every subcommand
#[derive(Clone, Debug)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub kubeconfig: Option<PathBuf>,
    pub output: OutputFormat,
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let global = GlobalOptions {
            config: self.config,
            kubeconfig: self.kubeconfig,
            output: self.output,
        };
        match self.command {
            Commands::Recover(args) => commands::recover::run(&global, args).await,
            Commands::Settle(args) => commands::settle::run(&global, args).await,
            Commands::Redeploy(args) => commands::redeploy::run(&global, args).await,
        }
    }
}
