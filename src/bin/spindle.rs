//! Binary entry point for the Spindle query CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use spindle::query::{Plan, QueryOptions};
use spindle::storage::MemoryStore;
use spindle::QueryEngine;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "spindle",
    version,
    about = "Explain and run serialized query plans",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the explain document of a plan
    Explain(ExplainCmd),
    /// Execute a plan against a JSON dataset
    Run(RunCmd),
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[arg(long, value_name = "FILE", help = "Serialized plan (JSON)")]
    plan: PathBuf,

    #[arg(long, value_name = "FILE", help = "Query options (TOML)")]
    options: Option<PathBuf>,

    #[arg(
        long,
        value_name = "TOGGLE",
        num_args = 1,
        allow_hyphen_values = true,
        help = "Optimizer rule toggle such as -all or +inline-subqueries (repeatable)"
    )]
    rules: Vec<String>,
}

#[derive(Args, Debug)]
struct ExplainCmd {
    #[command(flatten)]
    plan: PlanArgs,

    #[arg(
        long,
        value_name = "FILE",
        help = "Dataset providing index metadata for use-indexes"
    )]
    data: Option<PathBuf>,

    #[arg(long, help = "Show the plan before any rewrite")]
    raw: bool,
}

#[derive(Args, Debug)]
struct RunCmd {
    #[command(flatten)]
    plan: PlanArgs,

    #[arg(long, value_name = "FILE", help = "Dataset (JSON)")]
    data: PathBuf,

    #[arg(long, help = "Report the match count ignoring the outermost LIMIT")]
    full_count: bool,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("SPINDLE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Explain(cmd) => {
            let (plan, options) = load_plan(&cmd.plan)?;
            let store = match &cmd.data {
                Some(path) => MemoryStore::load_json_file(path)?,
                None => MemoryStore::new(),
            };
            let engine = QueryEngine::new(Arc::new(store));
            let output = if cmd.raw {
                engine.explain_raw(&plan)?
            } else {
                engine.explain(&plan, &options)?
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Run(cmd) => {
            let (plan, mut options) = load_plan(&cmd.plan)?;
            options.full_count |= cmd.full_count;
            let engine = QueryEngine::new(Arc::new(MemoryStore::load_json_file(&cmd.data)?));
            let result = engine.execute(&plan, &options)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

fn load_plan(args: &PlanArgs) -> Result<(Plan, QueryOptions), Box<dyn Error>> {
    let plan = Plan::from_json(&read(&args.plan)?)?;
    let options = match &args.options {
        Some(path) => QueryOptions::load(path)?,
        None => QueryOptions::default(),
    };
    Ok((plan, options.with_rules(args.rules.iter().cloned())))
}

fn read(path: &Path) -> Result<String, Box<dyn Error>> {
    fs::read_to_string(path).map_err(|err| format!("{}: {err}", path.display()).into())
}
