//! procpool - run shell commands in a bounded pool of forked workers.

mod cli;
mod exec;

use anyhow::Result;
use clap::Parser;
use procpool::logging::{self, LogConfig};
use procpool::{Outcome, Pool, PoolConfig, TaskFailure};
use serde::Serialize;
use tracing::info;

use cli::{Cli, Commands, RunArgs};
use exec::CommandReport;

fn main() {
    let cli = Cli::parse();

    logging::init(
        LogConfig::from_verbosity(cli.verbose, cli.quiet)
            .with_format(cli.log_format.into())
            .with_env_overrides(),
    );

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("error: {}", e);
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {}", cause);
            }
            std::process::exit(1);
        }
    }
}

/// Run every command and print the reports in completion order.
///
/// Returns whether every command succeeded. A failure that aborts the pool
/// is returned as an error after the reports collected so far are printed.
fn cmd_run(args: &RunArgs) -> Result<bool> {
    let config = PoolConfig::new()
        .with_max_concurrency(args.max_concurrency)
        .child_timeout_secs(args.timeout)
        .raise_exceptions(!args.keep_going);
    let mut pool: Pool<CommandReport> = Pool::new(config)?;

    info!(
        commands = args.commands.len(),
        max_concurrency = args.max_concurrency,
        "Running commands"
    );

    let run = drive(&mut pool, &args.commands);

    for outcome in pool.results() {
        print_outcome(outcome, args.json)?;
    }
    run?;

    let failed = pool.results().iter().filter(|o| o.is_err()).count();
    info!(failed, total = pool.results().len(), "All commands finished");
    Ok(failed == 0)
}

fn drive(pool: &mut Pool<CommandReport>, commands: &[String]) -> procpool::Result<()> {
    for command in commands {
        let command = command.clone();
        pool.submit(move || exec::run_shell(&command))?;
    }
    pool.wait_all()?;
    Ok(())
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ReportLine<'a> {
    Ok(&'a CommandReport),
    Failed { error: &'a TaskFailure },
}

fn print_outcome(outcome: &Outcome<CommandReport>, json: bool) -> Result<()> {
    if json {
        let line = match outcome {
            Ok(report) => ReportLine::Ok(report),
            Err(error) => ReportLine::Failed { error },
        };
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }

    match outcome {
        Ok(report) => {
            println!(
                "==> {} (exit {}, {} ms)",
                report.command, report.exit_code, report.elapsed_ms
            );
            print!("{}", report.stdout);
            eprint!("{}", report.stderr);
        }
        Err(failure) => println!("==> {}", failure),
    }
    Ok(())
}
