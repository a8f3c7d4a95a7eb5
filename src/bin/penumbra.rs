//! Command-line front end: parse queries or run them against a JSON fixture.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use penumbra::{
    query::{parser::parse, profile},
    storage::fixture::Fixture,
    EngineConfig, QueryEngine, QueryRequest, QueryResponse,
};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PENUMBRA_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "penumbra",
    version,
    about = "Multi-model query engine over in-memory fixtures",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Json,
        help = "Output format for responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Parse a query and print its syntax tree")]
    Parse {
        #[arg(value_name = "QUERY")]
        query: String,
    },
    #[command(about = "Run a query against a JSON fixture")]
    Query(QueryCmd),
}

#[derive(Args, Debug)]
struct QueryCmd {
    #[arg(long, value_name = "FIXTURE", help = "JSON dataset to query")]
    data: PathBuf,

    #[arg(long, value_name = "FILE", help = "Engine config (TOML)")]
    config: Option<PathBuf>,

    #[arg(long, help = "Include the plan and execution metrics")]
    explain: bool,

    #[arg(long, help = "Permit full scans for predicates without an index")]
    allow_full_scan: bool,

    #[arg(long, help = "Page the result and print a cursor for the rest")]
    use_cursor: bool,

    #[arg(long, value_name = "TOKEN", help = "Resume from a previous page")]
    cursor: Option<String>,

    #[arg(long, help = "Print phase timer totals to stderr")]
    profile: bool,

    #[arg(value_name = "QUERY")]
    query: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Parse { query } => {
            let ast = parse(&query)?;
            println!("{}", serde_json::to_string_pretty(&ast)?);
        }
        Command::Query(cmd) => {
            if cmd.profile {
                profile::enable_profiling();
            }
            let config = EngineConfig::load(cmd.config.clone())?;
            let backend = Fixture::load(&cmd.data)?.into_backend()?;
            let engine = QueryEngine::with_backend(backend, config);
            let mut request = QueryRequest::new(cmd.query);
            request.explain = cmd.explain;
            request.allow_full_scan = cmd.allow_full_scan;
            request.use_cursor = cmd.use_cursor;
            request.cursor = cmd.cursor;
            let response = engine.execute(&request)?;
            emit(cli.format, &response)?;
            if let Some(snapshot) = profile::profile_snapshot(false).filter(|_| cmd.profile) {
                eprintln!("profile: {}", serde_json::to_string(&snapshot)?);
            }
        }
    }
    Ok(())
}

fn emit(format: OutputFormat, response: &QueryResponse) -> Result<(), Box<dyn Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(response)?),
        OutputFormat::Text => print_text(response)?,
    }
    Ok(())
}

fn print_text(response: &QueryResponse) -> Result<(), Box<dyn Error>> {
    for row in &response.rows {
        println!("{row}");
    }
    println!("({} rows)", response.count);
    if let Some(cursor) = &response.next_cursor {
        println!("next cursor: {cursor}");
    }
    if let Some(plan) = &response.plan {
        println!("mode: {}  plan hash: {}", plan.mode.as_str(), plan.plan_hash);
        print!("{}", plan.root.render());
    }
    if let Some(metrics) = &response.metrics {
        println!("metrics: {}", serde_json::to_string(metrics)?);
    }
    Ok(())
}
