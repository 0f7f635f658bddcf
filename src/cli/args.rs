use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::types::BackendType;

#[derive(Parser, Debug)]
#[clap(name = "pyrun")]
#[clap(version, about = "Sandboxed one-shot Python execution")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "PYRUN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute code once in a fresh sandbox
    Exec(ExecArgs),

    /// Show which executor is active and what the start-up probe found
    Status(StatusArgs),

    /// Turn raw interpreter error text into a friendly description
    Classify(ClassifyArgs),

    /// Make sure the container image exists (build or pull if needed)
    Provision,

    /// Initialize a new pyrun configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Execution Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Code to execute ("-" or omitted reads standard input)
    pub code: Option<String>,

    /// Read the code from a file instead
    #[clap(long, short = 'f', conflicts_with = "code")]
    pub file: Option<PathBuf>,

    /// Timeout in seconds (defaults to the configured value)
    #[clap(long, short = 't')]
    pub timeout: Option<u64>,

    /// Override the configured isolation strategy
    #[clap(long, value_enum)]
    pub backend: Option<BackendType>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Override the configured isolation strategy
    #[clap(long, value_enum)]
    pub backend: Option<BackendType>,
}

#[derive(Args, Debug)]
pub struct ClassifyArgs {
    /// Raw error text ("-" or omitted reads standard input)
    pub text: Option<String>,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

// ============================================================================
// Common Types
// ============================================================================

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_exec() {
        let cli = Cli::parse_from(["pyrun", "--format", "json", "exec", "print(1)", "-t", "3", "--backend", "process"]);
        match cli.command {
            Commands::Exec(args) => {
                assert_eq!(args.code.as_deref(), Some("print(1)"));
                assert_eq!(args.timeout, Some(3));
                assert_eq!(args.backend, Some(BackendType::Process));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(matches!(cli.global_opts.format, OutputFormat::Json));
    }

    #[test]
    fn test_file_conflicts_with_inline_code() {
        let parsed = Cli::try_parse_from(["pyrun", "exec", "print(1)", "--file", "x.py"]);
        assert!(parsed.is_err());
    }
}
