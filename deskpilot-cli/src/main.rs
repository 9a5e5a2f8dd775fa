use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use deskpilot::object_map::ObjectMapDocument;
use deskpilot::runner::check_scenario;
use deskpilot::scenario::SCENARIO_SCHEMA;
use deskpilot::{create_session, ObjectMap, Preset, RunOptions, Runner, ScenarioSchema, TimeConfig, TimingOverride};
use serde_json::{Map, Value};
use tracing::{debug, info};

mod summary;

#[derive(Parser)]
#[command(name = "deskpilot")]
#[command(about = "Keyword-driven desktop UI scenarios with resilient locators")]
#[command(
    long_about = "Deskpilot resolves semantic element names from an object map, runs keyword scenarios against a desktop session and writes a JSON report."
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario and write its report
    Run(RunArgs),
    /// Check a scenario and object map without touching a session
    Validate(ValidateArgs),
    /// Print the effective timings of every preset
    Presets,
    /// Print the scenario JSON schema (or the object map schema)
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Scenario file (YAML or JSON)
    scenario: PathBuf,

    /// Object map file
    #[arg(long, short = 'e')]
    elements: PathBuf,

    /// Variable as NAME=VALUE; overrides the scenario's vars
    #[arg(long = "var", value_parser = parse_var)]
    vars: Vec<(String, Value)>,

    /// Where to write the JSON report
    #[arg(long, env = "DESKPILOT_REPORT")]
    report: Option<PathBuf>,

    /// Application started before the first step
    #[arg(long)]
    app: Option<String>,

    /// Timing preset: default, fast, slow or ci
    #[arg(long, env = "DESKPILOT_PRESET", default_value = "default", value_parser = parse_preset)]
    preset: Preset,

    /// Timing override as category=timeout[,interval[,retries]]
    #[arg(long = "timeout", value_parser = parse_override)]
    timeouts: Vec<TimingOverride>,

    /// UI tree loaded into the in-memory backend
    #[arg(long)]
    fixture: Option<PathBuf>,

    /// Custom scenario schema (JSON, Draft 7)
    #[arg(long)]
    schema: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    /// Scenario file (YAML or JSON)
    scenario: PathBuf,

    /// Object map file
    #[arg(long, short = 'e')]
    elements: PathBuf,

    /// Variable as NAME=VALUE; overrides the scenario's vars
    #[arg(long = "var", value_parser = parse_var)]
    vars: Vec<(String, Value)>,

    /// Custom scenario schema (JSON, Draft 7)
    #[arg(long)]
    schema: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Print the object map schema instead
    #[arg(long)]
    object_map: bool,
}

/// `NAME=VALUE`, with VALUE read as YAML so numbers and booleans keep their type.
fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("variable '{raw}' must look like NAME=VALUE"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("variable '{raw}' has an empty name"));
    }
    let value = serde_yaml::from_str::<Value>(value)
        .ok()
        .filter(|v| !v.is_null() || value.trim() == "null")
        .unwrap_or_else(|| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn parse_preset(raw: &str) -> Result<Preset, String> {
    raw.parse().map_err(|e: deskpilot::AutomationError| e.to_string())
}

fn parse_override(raw: &str) -> Result<TimingOverride, String> {
    raw.parse().map_err(|e: deskpilot::AutomationError| e.to_string())
}

fn variables(vars: Vec<(String, Value)>) -> Map<String, Value> {
    vars.into_iter().collect()
}

fn load_schema(path: Option<&Path>) -> Result<ScenarioSchema> {
    match path {
        Some(path) => {
            ScenarioSchema::from_path(path).with_context(|| format!("Failed to load schema {}", path.display()))
        }
        None => ScenarioSchema::builtin().context("Built-in scenario schema does not compile"),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let default = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn run(args: RunArgs) -> Result<bool> {
    let map = ObjectMap::from_path(&args.elements)
        .with_context(|| format!("Failed to load object map {}", args.elements.display()))?;
    let session = create_session(&map.app().backend, args.fixture.as_deref())
        .with_context(|| format!("Failed to create a '{}' session", map.app().backend))?;
    let schema = load_schema(args.schema.as_deref())?;
    let runner = Runner::new(Arc::new(map), session)?.with_schema(schema);

    let options = RunOptions {
        variables: variables(args.vars),
        report_path: args.report,
        app_path: args.app,
        preset: args.preset,
        overrides: args.timeouts,
    };
    info!(scenario = %args.scenario.display(), preset = %options.preset, "running scenario");
    let report = runner.run(&args.scenario, &options);
    summary::display(&report);
    if let Some(path) = &options.report_path {
        println!("📝 Report: {}", path.display());
    }
    Ok(report.passed())
}

fn validate(args: ValidateArgs) -> Result<bool> {
    let map = ObjectMap::from_path(&args.elements)
        .with_context(|| format!("Failed to load object map {}", args.elements.display()))?;
    let schema = load_schema(args.schema.as_deref())?;
    let commands = check_scenario(&args.scenario, &schema, &variables(args.vars), map.app().strict_locator_keys)
        .with_context(|| format!("Scenario {} is invalid", args.scenario.display()))?;
    debug!(
        windows = map.window_names().count(),
        elements = map.element_names().count(),
        "object map is valid"
    );

    println!("{} {}", "✅ VALID:".green().bold(), args.scenario.display());
    for (i, command) in commands.iter().enumerate() {
        println!("   {:>3}. {}", i + 1, command.keyword());
    }
    Ok(true)
}

fn presets() -> Result<bool> {
    for preset in Preset::ALL {
        println!("{}", preset.to_string().bold());
        for (operation, settings) in TimeConfig::preset(*preset).iter() {
            let retries = settings
                .retry_count
                .map(|n| format!(", {n} attempts"))
                .unwrap_or_default();
            println!(
                "   {:<20} {:>6.2}s every {:.2}s{retries}",
                operation.to_string(),
                settings.timeout.as_secs_f64(),
                settings.interval.as_secs_f64()
            );
        }
        println!();
    }
    Ok(true)
}

fn schema(args: SchemaArgs) -> Result<bool> {
    if args.object_map {
        let schema = schemars::schema_for!(ObjectMapDocument);
        println!(
            "{}",
            serde_json::to_string_pretty(&schema).context("Failed to render the object map schema")?
        );
    } else {
        println!("{SCENARIO_SCHEMA}");
    }
    Ok(true)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let outcome = match cli.command {
        Commands::Run(args) => run(args),
        Commands::Validate(args) => validate(args),
        Commands::Presets => presets(),
        Commands::Schema(args) => schema(args),
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("{} {err:#}", "❌ Error:".red().bold());
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_var_values_keep_yaml_types() {
        assert_eq!(parse_var("PIN=1234").unwrap(), ("PIN".to_string(), json!(1234)));
        assert_eq!(parse_var("ON=true").unwrap(), ("ON".to_string(), json!(true)));
        assert_eq!(parse_var("USER=bob").unwrap(), ("USER".to_string(), json!("bob")));
        assert_eq!(parse_var("EMPTY=").unwrap(), ("EMPTY".to_string(), json!("")));
        assert_eq!(parse_var("URL=a=b").unwrap(), ("URL".to_string(), json!("a=b")));
        assert!(parse_var("nothing").is_err());
        assert!(parse_var("=1").is_err());
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "deskpilot",
            "run",
            "login.yaml",
            "--elements",
            "elements.yaml",
            "--var",
            "USER=bob",
            "--preset",
            "ci",
            "--timeout",
            "click_action=3,0.1,2",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.preset, Preset::Ci);
                assert_eq!(args.vars.len(), 1);
                assert_eq!(args.timeouts[0].retry_count, Some(2));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_bad_preset_is_rejected() {
        let parsed = Cli::try_parse_from([
            "deskpilot",
            "run",
            "login.yaml",
            "--elements",
            "elements.yaml",
            "--preset",
            "turbo",
        ]);
        assert!(parsed.is_err());
    }
}
