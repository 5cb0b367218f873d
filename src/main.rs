use std::time::Instant;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use console::style;
use scflow::{Config, RunOptions, Workflow};

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Run the single-cell analysis workflow")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Configuration file.
    #[arg(long, global = true, default_value = "config/config.yaml")]
    config: Utf8PathBuf,

    /// Working directory that relative paths are resolved against.
    #[arg(long, global = true, default_value = ".")]
    directory: Utf8PathBuf,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run every task that is out of date (default).
    Run,
    /// Print the task graph as a Mermaid diagram.
    Graph,
}

#[derive(clap::Args, Debug, Clone)]
struct RunArgs {
    /// Number of tasks to run at the same time.
    #[arg(long, short, global = true)]
    cores: Option<usize>,

    /// Only report what would run.
    #[arg(long, short = 'n', global = true)]
    dry_run: bool,

    /// Run every selected task, even if its outputs are up to date.
    #[arg(long, global = true)]
    forceall: bool,

    /// Task id such as `normalization[sample=A]`, or a rule name.
    #[arg(long = "target", short, global = true)]
    targets: Vec<String>,

    /// Write a Mermaid diagram of the run, colored by outcome.
    #[arg(long, global = true)]
    report: Option<Utf8PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    scflow::init_logging()?;

    let s = Instant::now();
    let config = Config::load(args.directory.join(&args.config))?;
    let workflow = Workflow::new(config, args.directory.clone())?;

    eprintln!(
        "Built task graph with {} tasks for {} samples {}",
        workflow.graph().len(),
        workflow.samples().len(),
        scflow::as_overhead(s)
    );

    match args.command.unwrap_or(Command::Run) {
        Command::Graph => print!("{}", workflow.graph()),
        Command::Run => {
            let run = args.run;
            let mut options = RunOptions {
                dry_run: run.dry_run,
                forceall: run.forceall,
                targets: run.targets,
                ..RunOptions::default()
            };
            if let Some(cores) = run.cores {
                options.cores = cores;
            }

            let s = Instant::now();
            let executor = workflow.notebook_executor();
            let report = workflow.run_report(&executor, &options)?;
            let summary = report.summary();

            if let Some(path) = run.report {
                std::fs::write(&path, report.render_mermaid(workflow.graph()))
                    .with_context(|| format!("couldn't write report to {path}"))?;
            }

            if summary.failed > 0 {
                eprintln!(
                    "{} {} failed, {} blocked",
                    style("Error:").bold().red(),
                    style(summary.failed).red(),
                    summary.blocked,
                );
                report.into_result()?;
            }

            if options.dry_run {
                eprintln!(
                    "{} {} to run, {} up to date",
                    style("Dry run:").bold(),
                    style(summary.would_run).yellow(),
                    style(summary.cached).blue(),
                );
            } else {
                eprintln!(
                    "{} {} executed, {} up to date {}",
                    style("Done:").bold().green(),
                    summary.executed,
                    style(summary.cached).blue(),
                    scflow::as_overhead(s)
                );
            }
        }
    }

    Ok(())
}
