//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use procpool::config::default_max_concurrency;
use procpool::logging::LogFormat;

/// Run shell commands in parallel, one forked worker per command.
#[derive(Parser, Debug)]
#[command(name = "procpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormatArg::Pretty, global = true)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run each command with `sh -c` in its own worker process.
    Run(RunArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Maximum number of commands running at once.
    #[arg(short = 'j', long, env = "PROCPOOL_MAX_CONCURRENCY", default_value_t = default_max_concurrency())]
    pub max_concurrency: usize,

    /// Per-command deadline in seconds (0 disables).
    #[arg(short, long, env = "PROCPOOL_CHILD_TIMEOUT", default_value_t = 0.0)]
    pub timeout: f64,

    /// Keep running the remaining commands when one fails.
    #[arg(short, long)]
    pub keep_going: bool,

    /// Print one JSON object per finished command.
    #[arg(long)]
    pub json: bool,

    /// Commands to run.
    #[arg(required = true, last = true)]
    pub commands: Vec<String>,
}

/// Log format option for CLI.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormatArg {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "procpool", "-vv", "run", "-j", "3", "--timeout", "1.5", "--keep-going", "--", "echo a",
            "echo b",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command;
        assert_eq!(args.max_concurrency, 3);
        assert_eq!(args.timeout, 1.5);
        assert!(args.keep_going);
        assert!(!args.json);
        assert_eq!(args.commands, vec!["echo a", "echo b"]);
    }

    #[test]
    fn test_run_requires_commands() {
        assert!(Cli::try_parse_from(["procpool", "run"]).is_err());
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["procpool", "-q", "-v", "run", "--", "true"]).is_err());
    }
}
