//! `attrform` CLI: command-line tool for attribute descriptor sets.
//!
//! Checks descriptor sets for dependency and constraint problems, mounts them
//! as forms against a connector (or a mock), and prints the values a form
//! would submit.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use attrform_core::collector::SubmitMode;
use attrform_core::combiner::combine;
use attrform_core::descriptor::{AttributeContent, AttributeDescriptor, AttributeValue};
use attrform_core::driver::FormDriver;
use attrform_core::error::SubmitError;
use attrform_core::graph::DependencyGraph;
use attrform_core::render::widget_for;
use attrform_core::resolver::CallbackResolver;
use attrform_core::session::{FieldState, FormSession};
use attrform_core::validation::compile_constraints;
use attrform_core::value::FieldValue;
use attrform_transport::{CallbackMethod, CallbackTransport, HttpTransport, MemoryTransport};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;

// ── ANSI color helpers ───────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";

// ── CLI structure ────────────────────────────────────────────────────

/// attrform: attribute forms and connector callbacks.
#[derive(Parser)]
#[command(
    name = "attrform",
    version,
    about = "attrform CLI: inspect attribute descriptor sets, resolve callbacks, collect values",
    long_about = None,
    after_help = format!(
        "{DIM}Environment variables:{RESET}\n  \
         ATTRFORM_CONNECTOR_URL   Connector address (default: http://127.0.0.1:8280)\n  \
         ATTRFORM_TOKEN           Bearer token\n  \
         ATTRFORM_TIMEOUT_SECS    Callback timeout (default: 10)\n  \
         ATTRFORM_MAX_RETRIES     Callback retries (default: 3)\n  \
         ATTRFORM_LOG_LEVEL       Log filter when RUST_LOG is unset (default: warn)\n\n\
         {DIM}Examples:{RESET}\n  \
         attrform validate descriptors.json\n  \
         attrform inspect descriptors.json --mock callbacks.json --values values.json\n  \
         attrform collect descriptors.json --values values.json --original persisted.json --mode update"
    ),
)]
struct Cli {
    /// Connector base URL.
    #[arg(long, global = true, env = "ATTRFORM_CONNECTOR_URL")]
    connector_url: Option<String>,

    /// Bearer token.
    #[arg(long, global = true, env = "ATTRFORM_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Callback timeout in seconds.
    #[arg(
        long,
        global = true,
        env = "ATTRFORM_TIMEOUT_SECS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout: Option<u64>,

    /// Log filter, used when `RUST_LOG` is unset.
    #[arg(long, global = true, env = "ATTRFORM_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a descriptor set: dependency order, misconfigured attributes, constraints.
    Validate {
        /// JSON file holding an array of attribute descriptors.
        file: PathBuf,
    },
    /// Mount a descriptor set, resolve callbacks, and show each field.
    Inspect {
        /// JSON file holding an array of attribute descriptors.
        file: PathBuf,
        #[command(flatten)]
        form: FormArgs,
        /// Print fields as JSON.
        #[arg(long, default_value = "false")]
        json: bool,
    },
    /// Fill a form from a values file and print what it would submit.
    Collect {
        /// JSON file holding an array of attribute descriptors.
        file: PathBuf,
        #[command(flatten)]
        form: FormArgs,
        /// Persisted values (array of `{name, value}`) to edit instead of creating.
        #[arg(long)]
        original: Option<PathBuf>,
        /// Submit everything, or only the changes against `--original`.
        #[arg(long, value_enum, default_value_t = Mode::Create)]
        mode: Mode,
    },
}

#[derive(clap::Args)]
struct FormArgs {
    /// Serve callbacks from a routes file instead of the connector.
    #[arg(long)]
    mock: Option<PathBuf>,
    /// JSON object of values to enter, keyed by field path (`name` or `group/child`).
    #[arg(long)]
    values: Option<PathBuf>,
    /// Scope of the form (prefix of nested scopes).
    #[arg(long, default_value = "")]
    scope: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Create,
    Update,
}

impl From<Mode> for SubmitMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Create => Self::Create,
            Mode::Update => Self::Update,
        }
    }
}

/// One canned callback answer in a `--mock` routes file.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MockRoute {
    #[serde(default)]
    method: CallbackMethod,
    path: String,
    #[serde(default)]
    response: Value,
    status: Option<u16>,
    message: Option<String>,
    delay_ms: Option<u64>,
}

// ── Pretty output helpers ────────────────────────────────────────────

fn header(icon: &str, title: &str) {
    println!("{BOLD}{CYAN}{icon} {title}{RESET}");
    println!("{DIM}─────────────────────────────────────────{RESET}");
}

fn kv_line(key: &str, value: &str) {
    println!("  {DIM}{key:<24}{RESET} {WHITE}{value}{RESET}");
}

fn success(msg: &str) {
    println!("{GREEN}{BOLD}✓{RESET} {msg}");
}

fn warning(msg: &str) {
    println!("{YELLOW}{BOLD}⚠{RESET} {YELLOW}{msg}{RESET}");
}

fn print_json(value: &Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to format JSON")?;
    println!("{text}");
    Ok(())
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = CliConfig::from_env();
    if let Some(url) = cli.connector_url {
        config.connector_url = url;
    }
    if let Some(token) = cli.token {
        config.token = Some(token);
    }
    if let Some(secs) = cli.timeout {
        config.timeout_secs = secs;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_tracing(&config.log_level, cli.log_json);

    match run(&config, cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("  {RED}{BOLD}✗ Error:{RESET} {e:#}");
            eprintln!();
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: &CliConfig, cmd: Commands) -> Result<ExitCode> {
    match cmd {
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Inspect { file, form, json } => cmd_inspect(config, &file, &form, json).await,
        Commands::Collect {
            file,
            form,
            original,
            mode,
        } => cmd_collect(config, &file, &form, original.as_deref(), mode.into()).await,
    }
}

// ── Loading ──────────────────────────────────────────────────────────

fn load_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {what} file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {what} file {}", path.display()))
}

async fn transport(config: &CliConfig, mock: Option<&Path>) -> Result<Arc<dyn CallbackTransport>> {
    let Some(mock) = mock else {
        let http = HttpTransport::new(config.transport())
            .context("failed to configure connector transport")?;
        info!(connector = %http.base_url(), "using connector");
        return Ok(Arc::new(http));
    };

    let routes: Vec<MockRoute> = load_json(mock, "mock routes")?;
    let memory = MemoryTransport::new();
    for route in &routes {
        match route.status {
            Some(status) if status >= 400 => {
                let message = route.message.as_deref().unwrap_or("mock failure");
                memory.fail(route.method, &route.path, status, message).await;
            }
            _ => {
                memory
                    .respond(route.method, &route.path, route.response.clone())
                    .await;
            }
        }
        if let Some(ms) = route.delay_ms {
            memory
                .delay(route.method, &route.path, Duration::from_millis(ms))
                .await;
        }
    }
    info!(routes = routes.len(), "using mock callbacks");
    Ok(Arc::new(memory))
}

async fn mount(
    config: &CliConfig,
    file: &Path,
    form: &FormArgs,
    original: Option<&Path>,
) -> Result<FormDriver> {
    let descriptors: Vec<AttributeDescriptor> = load_json(file, "descriptor")?;
    let resolver = Arc::new(CallbackResolver::new(
        transport(config, form.mock.as_deref()).await?,
    ));

    let mut driver = match original {
        Some(path) => {
            let persisted: Vec<AttributeValue> = load_json(path, "persisted values")?;
            let (session, mounted) =
                FormSession::mount_edit(&form.scope, combine(&descriptors, &persisted));
            FormDriver::new(session, mounted, resolver)
        }
        None => FormDriver::mount(&form.scope, &descriptors, resolver),
    };
    driver.settle().await;

    if let Some(path) = &form.values {
        let values: Map<String, Value> = load_json(path, "values")?;
        apply_values(&mut driver, values).await?;
    }
    Ok(driver)
}

/// Enter values in dependency order: a value waits until its field has
/// settled, which may take earlier values and their callbacks.
async fn apply_values(driver: &mut FormDriver, values: Map<String, Value>) -> Result<()> {
    let mut remaining: Vec<(String, Value)> = values.into_iter().collect();
    while !remaining.is_empty() {
        let before = remaining.len();
        let mut deferred = Vec::new();
        for (path, raw) in remaining {
            let Some(entry) = driver.session().field(&path) else {
                deferred.push((path, raw));
                continue;
            };
            if !matches!(entry.state(), FieldState::Ready | FieldState::Edited) {
                deferred.push((path, raw));
                continue;
            }
            let value = FieldValue::hydrate(entry.descriptor(), entry.content(), &raw);
            driver
                .set_value(&path, value)
                .with_context(|| format!("cannot set '{path}'"))?;
            driver.settle().await;
            debug!(field = %path, "value entered");
        }
        if deferred.len() == before {
            let names: Vec<&str> = deferred.iter().map(|(p, _)| p.as_str()).collect();
            bail!("no settled field for value(s): {}", names.join(", "));
        }
        remaining = deferred;
    }
    Ok(())
}

// ── validate ─────────────────────────────────────────────────────────

fn cmd_validate(file: &Path) -> Result<ExitCode> {
    let descriptors: Vec<AttributeDescriptor> = load_json(file, "descriptor")?;
    let graph = DependencyGraph::build(&descriptors);

    header("◆", "Descriptor set");
    kv_line("attributes", &descriptors.len().to_string());
    kv_line("order", &graph.order().join(" → "));
    println!();

    let mut problems = 0usize;
    for err in graph.duplicates() {
        warning(&err.to_string());
        problems += 1;
    }
    for (name, err) in graph.broken() {
        warning(&format!("{name}: {err}"));
        problems += 1;
    }
    for descriptor in &descriptors {
        if let Err(err) = compile_constraints(descriptor) {
            warning(&err.to_string());
            problems += 1;
        }
    }

    if problems == 0 {
        success("descriptor set is consistent");
        Ok(ExitCode::SUCCESS)
    } else {
        println!();
        println!("  {RED}{problems} problem(s) found{RESET}");
        Ok(ExitCode::FAILURE)
    }
}

// ── inspect ──────────────────────────────────────────────────────────

fn field_rows(session: &FormSession, prefix: &str, rows: &mut Vec<Value>) {
    for entry in session.fields() {
        let descriptor = entry.descriptor();
        let path = format!("{prefix}{}", entry.name());
        let error = match entry.state() {
            FieldState::Error(err) => Some(err.to_string()),
            _ => None,
        };
        let options: Vec<String> = entry.content().iter().map(AttributeContent::display).collect();
        rows.push(json!({
            "path": path,
            "label": descriptor.label(),
            "type": descriptor.attribute_type,
            "contentType": descriptor.content_type,
            "state": entry.state().name(),
            "widget": widget_for(descriptor, entry.state()),
            "dependsOn": session.graph().upstream(entry.name()).collect::<Vec<_>>(),
            "content": entry.content().len(),
            "options": options,
            "value": entry.value().and_then(|v| v.to_submission(descriptor.content_type).ok()),
            "error": error,
        }));
        if let Some(nested) = entry.nested() {
            field_rows(nested, &format!("{path}/"), rows);
        }
    }
}

async fn cmd_inspect(
    config: &CliConfig,
    file: &Path,
    form: &FormArgs,
    json: bool,
) -> Result<ExitCode> {
    let driver = mount(config, file, form, None).await?;
    let mut rows = Vec::new();
    field_rows(driver.session(), "", &mut rows);

    if json {
        print_json(&Value::Array(rows))?;
        return Ok(ExitCode::SUCCESS);
    }

    header("◆", "Form");
    for row in &rows {
        let text = |key: &str| match &row[key] {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let state = text("state");
        let color = match state.as_str() {
            "error" => RED,
            "pending" | "loading" => YELLOW,
            _ => GREEN,
        };
        println!(
            "  {BOLD}{:<24}{RESET} {color}{state:<8}{RESET} {DIM}{}{RESET}",
            text("path"),
            row["widget"]["widget"].as_str().unwrap_or_default(),
        );
        if !row["value"].is_null() {
            kv_line("  value", &text("value"));
        }
        if let Some(options) = row["options"].as_array().filter(|o| !o.is_empty()) {
            let options: Vec<&str> = options.iter().filter_map(Value::as_str).collect();
            kv_line("  options", &options.join(", "));
        }
        if let Some(deps) = row["dependsOn"].as_array().filter(|d| !d.is_empty()) {
            let deps: Vec<&str> = deps.iter().filter_map(Value::as_str).collect();
            kv_line("  depends on", &deps.join(", "));
        }
        if !row["error"].is_null() {
            kv_line("  error", &text("error"));
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ── collect ──────────────────────────────────────────────────────────

async fn cmd_collect(
    config: &CliConfig,
    file: &Path,
    form: &FormArgs,
    original: Option<&Path>,
    mode: SubmitMode,
) -> Result<ExitCode> {
    let driver = mount(config, file, form, original).await?;
    match driver.session().submit(mode) {
        Ok(values) => {
            print_json(&serde_json::to_value(values).context("failed to encode values")?)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(SubmitError::Blocked(issues)) => {
            eprintln!("  {RED}{BOLD}✗ Submission blocked:{RESET}");
            for issue in &issues {
                eprintln!("    {YELLOW}•{RESET} {issue}");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}
