use assigner::{AssignError, AssignerError, AssignmentRecord, Experiment, TestName};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod config;
mod telemetry;

use config::{Config, ConfigError};

#[derive(Parser)]
#[command(name = "measure", version, about = "Deterministic A/B variant assignment")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the assignment service
    Serve {
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Assign one identity and print the assignment record as JSON
    Assign(AssignArgs),
}

#[derive(Args)]
struct AssignArgs {
    /// Test name, `[a-z0-9_-]+`
    #[arg(long)]
    test: String,
    /// Identity hash of the visitor
    #[arg(long)]
    hash: String,
    /// Read the variants of `--test` from this config file
    #[arg(long, short, conflicts_with = "variants")]
    config: Option<PathBuf>,
    /// Variant weight as `name=weight`, repeatable
    #[arg(long = "variant", value_parser = parse_variant)]
    variants: Vec<(String, u64)>,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("config has no `{0}` section")]
    MissingSection(&'static str),
    #[error("experiment {0} is not configured")]
    UnknownExperiment(String),
    #[error("either --config or at least one --variant is required")]
    MissingVariants,
    #[error(transparent)]
    Assign(#[from] AssignError),
    #[error(transparent)]
    Assigner(#[from] AssignerError),
    #[error(transparent)]
    Telemetry(#[from] telemetry::TelemetryError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not serialize record: {0}")]
    Json(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        CliCommand::Serve { config } => serve(&config),
        CliCommand::Assign(args) => assign(&args).and_then(|record| {
            println!("{}", serde_json::to_string(&record)?);
            Ok(())
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn serve(path: &Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;

    let _sentry = telemetry::init_logging(config.common.logging.as_ref())?;
    if let Some(metrics) = &config.common.metrics {
        telemetry::init_metrics(metrics)?;
    }

    let assigner_config = config
        .assigner
        .ok_or(CliError::MissingSection("assigner"))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(assigner::run(assigner_config))?;

    Ok(())
}

fn assign(args: &AssignArgs) -> Result<AssignmentRecord, CliError> {
    let Some(path) = &args.config else {
        if args.variants.is_empty() {
            return Err(CliError::MissingVariants);
        }
        let record = assigner::assign(&args.hash, &args.test, args.variants.iter().cloned())?;
        return Ok(record);
    };

    let name = TestName::new(args.test.as_str())?;
    let assigner_config = Config::from_file(path)?
        .assigner
        .ok_or(CliError::MissingSection("assigner"))?;
    let variants = assigner_config
        .experiments
        .get(name.as_str())
        .cloned()
        .ok_or_else(|| CliError::UnknownExperiment(name.to_string()))?;

    Ok(Experiment::new(name, variants).assign(&args.hash))
}

fn parse_variant(s: &str) -> Result<(String, u64), String> {
    let (name, weight) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=weight, got {s:?}"))?;
    let weight = weight
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid weight {weight:?}: {e}"))?;

    Ok((name.trim().to_string(), weight))
}
