//! Canopy CLI
//!
//! Evaluate templates against a state file, list the paths a template reads,
//! or open an app definition against canned responses and print the result.

use ariadne::{Label, Report, ReportKind, Source};
use canopy_ast::Span;
use canopy_eval::EvalError;
use canopy_graph::{extract_paths, TrackError};
use canopy_runtime::{AppDefinition, EngineConfig, FixtureConnector, LogFilter, RuntimeError, Session};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "canopy", version, about = "Reactive state engine for visual app builders")]
struct Cli {
    /// Log engine activity to stderr (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate a template and print its value as JSON
    Eval {
        template: String,
        /// JSON state snapshot, keyed by namespace
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// Print the state paths a template reads
    Deps { template: String },
    /// Open an app definition, load its home page and print the final state
    Run {
        app: PathBuf,
        /// Responses per query id: {"data": ...}, {"error": ..., "code": ...} or {"transport": ...}
        #[arg(long)]
        fixtures: Option<PathBuf>,
        /// Engine configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not valid: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Track(#[from] TrackError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl CliError {
    /// Source text and location for a labelled report
    fn located(&self) -> Option<(&str, Span)> {
        match self {
            CliError::Eval(err) => err.span().map(|span| (err.expression.as_str(), span)),
            _ => None,
        }
    }
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn read_json(path: &Path) -> Result<Value, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn from_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    serde_json::from_value(read_json(path)?).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn eval(template: &str, state: Option<&Path>) -> Result<(), CliError> {
    let state = match state {
        Some(path) => read_json(path)?,
        None => json!({}),
    };
    let value = canopy_eval::evaluate(template, &state)?;
    println!("{}", value);
    Ok(())
}

fn deps(template: &str) -> Result<(), CliError> {
    for path in extract_paths(template)? {
        println!("{}", path);
    }
    Ok(())
}

async fn run(app: &Path, fixtures: Option<&Path>, config: Option<&Path>) -> Result<(), CliError> {
    let definition: AppDefinition = from_json(app)?;
    let connector = match fixtures {
        Some(path) => FixtureConnector::new(from_json(path)?),
        None => FixtureConnector::default(),
    };
    let config = match config {
        Some(path) => from_json(path)?,
        None => EngineConfig::default(),
    };

    let session = Session::builder(definition, Arc::new(connector)).config(config).build()?;
    session.start().await?;
    session.settle().await;
    info!(version = session.version(), "app settled");

    let snapshot = session.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| snapshot.to_string()));
    let entries = session.debug_log(&LogFilter::default());
    if !entries.is_empty() {
        println!();
        println!("debug log ({} entries, newest first):", entries.len());
        for entry in entries {
            println!("  [{:?}] {}: {}", entry.severity, entry.source, entry.message);
        }
    }
    Ok(())
}

fn report(err: &CliError) {
    let Some((text, span)) = err.located() else {
        eprintln!("error: {}", err);
        return;
    };
    let message = match err {
        CliError::Eval(eval) => eval.kind.to_string(),
        other => other.to_string(),
    };
    let printed = Report::build(ReportKind::Error, "<template>", span.start)
        .with_message("template failed to evaluate")
        .with_label(Label::new(("<template>", span.start..span.end.max(span.start + 1))).with_message(message))
        .finish()
        .eprint(("<template>", Source::from(text.to_string())));
    if printed.is_err() {
        eprintln!("error: {}", err);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match &cli.command {
        Command::Eval { template, state } => eval(template, state.as_deref()),
        Command::Deps { template } => deps(template),
        Command::Run { app, fixtures, config } => run(app, fixtures.as_deref(), config.as_deref()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}
