use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};
use tempo_eval::{
    DebugLink, Dialect, EvalError, LocalScheduler, ResumeCommand, Runtime, Settings, Stop, StopCondition,
};
use tempo_types::ast::Model;
use tempo_types::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (JSON); flags below override it
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Evaluate in the real-time dialect
    #[arg(long, global = true)]
    realtime: bool,

    /// Turn fatal errors into exit values
    #[arg(long, global = true)]
    exceptions: bool,

    /// Skip precondition checks
    #[arg(long, global = true)]
    no_pre: bool,

    /// Skip class invariant checks
    #[arg(long, global = true)]
    no_inv: bool,

    /// Stop periodic threads at this virtual time (ns); required to start them
    #[arg(long, global = true)]
    time_limit: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and initialise a model without running anything
    Check {
        /// Executable tree (JSON)
        model: PathBuf,
    },

    /// Call an operation and print its result
    Run(RunArgs),
}

#[derive(Parser)]
struct RunArgs {
    /// Executable tree (JSON)
    model: PathBuf,

    /// Module or class owning the operation
    owner: String,

    /// Operation or function name
    operation: String,

    /// Arguments as JSON literals
    args: Vec<String>,

    /// Report stops at `file:line` on stderr
    #[arg(short, long = "break")]
    breakpoints: Vec<String>,

    /// Write coverage (JSON) to this file
    #[arg(long)]
    coverage: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("cannot write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("invalid {what}: {source}")]
    Json {
        what: String,
        source: serde_json::Error,
    },
    #[error("invalid breakpoint '{0}', expected file:line")]
    Breakpoint(String),
    #[error("no statement at {0}")]
    NoStatement(String),
    #[error("unsupported argument {0}")]
    Argument(String),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Prints each stop and lets the thread continue.
struct StderrLink;

impl DebugLink for StderrLink {
    fn stopped(&self, stop: &Stop<'_>) -> ResumeCommand {
        eprintln!(
            "stopped ({}) at {} on thread {}",
            stop.reason,
            stop.location,
            stop.thread_name()
        );
        for frame in stop.frames() {
            eprintln!("    in {} at {}", frame.title, frame.location);
        }
        for (name, value) in stop.bindings() {
            eprintln!("    {} = {}", name.text, value);
        }
        ResumeCommand::Continue
    }
}

fn read(path: &Path) -> Result<String, CliError> {
    fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn load_model(path: &Path) -> Result<Model, CliError> {
    let text = read(path)?;
    serde_json::from_str(&text).map_err(|source| CliError::Json {
        what: format!("model {}", path.display()),
        source,
    })
}

fn load_settings(cli: &Cli) -> Result<Settings, CliError> {
    let mut settings = match &cli.settings {
        Some(path) => Settings::from_json(&read(path)?).map_err(|source| CliError::Json {
            what: format!("settings {}", path.display()),
            source,
        })?,
        None => Settings::default(),
    };
    if cli.realtime {
        settings.dialect = Dialect::RealTime;
    }
    if cli.exceptions {
        settings.exceptions = true;
    }
    if cli.no_pre {
        settings.pre_checks = false;
    }
    if cli.no_inv {
        settings.inv_checks = false;
    }
    if cli.time_limit.is_some() {
        settings.time_limit = cli.time_limit;
    }
    Ok(settings)
}

/// JSON literal to a runtime value: numbers, booleans, null, strings as
/// text, arrays as sequences.
fn json_value(json: &serde_json::Value) -> Result<Value, CliError> {
    use serde_json::Value as Json;
    Ok(match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Value::Int(i),
            (None, Some(r)) => Value::Real(r),
            _ => return Err(CliError::Argument(n.to_string())),
        },
        Json::String(s) => Value::text(s),
        Json::Array(items) => Value::Seq(items.iter().map(json_value).collect::<Result<_, _>>()?),
        Json::Object(_) => return Err(CliError::Argument(json.to_string())),
    })
}

fn parse_arg(text: &str) -> Result<Value, CliError> {
    let json: serde_json::Value = serde_json::from_str(text).map_err(|source| CliError::Json {
        what: format!("argument {text}"),
        source,
    })?;
    json_value(&json)
}

fn parse_breakpoint(spec: &str) -> Result<(String, u32), CliError> {
    let (file, line) = spec
        .rsplit_once(':')
        .ok_or_else(|| CliError::Breakpoint(spec.to_string()))?;
    let line = line
        .parse()
        .map_err(|_| CliError::Breakpoint(spec.to_string()))?;
    Ok((file.to_string(), line))
}

fn check(cli: &Cli, model: &Path) -> Result<(), CliError> {
    let settings = load_settings(cli)?;
    let model = load_model(model)?;
    let (modules, classes) = (model.modules.len(), model.classes.len());
    Runtime::builder(model).settings(settings).build()?;
    println!("ok: {modules} modules, {classes} classes initialised");
    Ok(())
}

fn run_model(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    let settings = load_settings(cli)?;
    debug!(?settings, "settings loaded");
    let model = load_model(&args.model)?;
    let values = args
        .args
        .iter()
        .map(String::as_str)
        .map(parse_arg)
        .collect::<Result<Vec<_>, _>>()?;

    let scheduler = LocalScheduler::new(settings.default_cpu_hz, settings.time_limit);
    let evaluator = Runtime::builder(model)
        .settings(settings)
        .scheduler(Arc::new(scheduler.clone()))
        .build()?;

    if !args.breakpoints.is_empty() {
        for spec in &args.breakpoints {
            let (file, line) = parse_breakpoint(spec)?;
            let number = evaluator
                .break_at(&file, line, StopCondition::Always)
                .ok_or_else(|| CliError::NoStatement(spec.clone()))?;
            info!(number, %spec, "breakpoint set");
        }
        evaluator.debug().attach(Arc::new(StderrLink));
    }

    let result = evaluator.call(&args.owner, &args.operation, values);
    for outcome in scheduler.join_all() {
        match outcome.result {
            Ok(value) => println!("thread {} ({}) = {}", outcome.id, outcome.name, value),
            Err(e) => warn!(thread = outcome.id, name = %outcome.name, error = %e, "thread failed"),
        }
    }

    if let Some(path) = &args.coverage {
        let coverage = evaluator.coverage();
        eprint!("{coverage}");
        let json = serde_json::to_string_pretty(&coverage).map_err(|source| CliError::Json {
            what: "coverage".into(),
            source,
        })?;
        fs::write(path, json).map_err(|source| CliError::Write {
            path: path.clone(),
            source,
        })?;
    }

    let value = result?;
    println!("{}`{} = {}", args.owner, args.operation, value);
    Ok(())
}

fn run(cli: &Cli) -> Result<(), CliError> {
    match &cli.command {
        Commands::Check { model } => check(cli, model),
        Commands::Run(args) => run_model(cli, args),
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
