mod runner;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pipewright_engine::config::EngineConfig;
use runner::{Decision, RunOptions, RunReport};

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(version, about = "Pipewright workflow runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition locally
    ///
    /// Examples:
    ///     pipewright run ./demos/release.yaml
    ///     pipewright run ./demos/release.yaml --set version=1.4.2 --approve
    ///     pipewright run ./demos/release.yaml --secret db_password=hunter2 --json
    #[command(verbatim_doc_comment)]
    Run {
        /// Workflow definition (YAML or JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Set workflow variables (format: key=value), can be repeated
        #[arg(long = "set", value_name = "KEY=VALUE")]
        variables: Vec<String>,

        /// Store a secret (format: name=value), can be repeated
        #[arg(long = "secret", value_name = "NAME=VALUE")]
        secrets: Vec<String>,

        /// Approve every approval gate
        #[arg(long, conflicts_with = "reject")]
        approve: bool,

        /// Reject every approval gate
        #[arg(long)]
        reject: bool,

        /// Emit JSON logs and a JSON report
        #[arg(short, long)]
        json: bool,
    },
    /// Check that a workflow definition compiles
    Validate {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

/// Initialize tracing/logging.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn read_definition(file: &PathBuf) -> Result<String> {
    fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Workflow:  {}", report.workflow);
    println!("Execution: {}", report.execution_uuid);
    for state in &report.states {
        match &state.error {
            Some(error) => println!("  {:<24} {:<10} {}", state.state, state.status.to_string(), error),
            None => println!("  {:<24} {}", state.state, state.status),
        }
    }
    match report.outcome {
        Some(outcome) => println!("Outcome:   {}", outcome),
        None => println!(
            "Outcome:   still waiting on {} state(s); rerun with --approve or --reject",
            report.waiting().len()
        ),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            variables,
            secrets,
            approve,
            reject,
            json,
        } => {
            init_tracing(json);
            let source = read_definition(&file)?;
            let config = EngineConfig::from_env().context("Failed to load configuration")?;
            let decision = match (approve, reject) {
                (true, _) => Some(Decision::Approve),
                (_, true) => Some(Decision::Reject),
                _ => None,
            };
            let options = RunOptions {
                variables: runner::parse_pairs(&variables)?,
                secrets: runner::parse_pairs(&secrets)?,
                decision,
            };

            let report = runner::run_workflow(&source, config, &options).await?;
            print_report(&report, json)?;
            Ok(if report.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Validate { file } => {
            init_tracing(false);
            let source = read_definition(&file)?;
            let (definition, machine) = runner::compile(&source)?;
            println!(
                "{}: {} states, {} transitions, starts at '{}'",
                definition.name,
                definition.states.len(),
                machine.transitions().len(),
                definition.initial_state
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}
