mod error;
mod fetch;
mod loader;
mod matcher;
mod models;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use error::{ErrorClass, UploadError};
use fetch::DatasetFetcher;
use loader::{DatasetStore, Snapshot};
use log::{error, info};
use models::{Config, PredictResponse, RawQuery};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

fn cli() -> Command {
    Command::new("cutoff-predictor")
        .version("0.1")
        .about("Lists colleges a student is eligible for based on admission cutoff ranks")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml")
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("predict")
                .about("Find eligible colleges for one student")
                .arg(
                    Arg::new("rank")
                        .short('r')
                        .long("rank")
                        .value_name("RANK")
                        .help("Student rank; omitted or empty means 0"),
                )
                .arg(
                    Arg::new("category")
                        .short('k')
                        .long("category")
                        .value_name("CATEGORY")
                        .help("Category column, e.g. GM, 1G, 2AG"),
                )
                .arg(
                    Arg::new("branch")
                        .short('b')
                        .long("branch")
                        .value_name("BRANCH")
                        .help("Branch substring filter, or 'all'"),
                ),
        )
        .subcommand(
            Command::new("batch")
                .about("Answer a JSON array of {rank, category, branch} queries")
                .arg(Arg::new("file").value_name("FILE").required(true)),
        )
        .subcommand(
            Command::new("upload")
                .about("Replace the dataset from a local CSV file or an http(s) URL")
                .arg(Arg::new("source").value_name("SOURCE").required(true)),
        )
        .subcommand(Command::new("serve").about("Answer newline-delimited JSON queries from stdin"))
        .subcommand(Command::new("categories").about("Show the loaded dataset's category columns"))
}

/// Load the configuration, writing a default one when none exists yet.
fn load_config(config_file: &str) -> Result<(Config, bool)> {
    if Path::new(config_file).exists() {
        let config = Config::load_from_file(config_file)
            .with_context(|| format!("Failed to load configuration from {}", config_file))?;
        Ok((config, false))
    } else {
        let config = Config::default();
        config
            .save_to_file(config_file)
            .with_context(|| format!("Failed to write default configuration to {}", config_file))?;
        Ok((config, true))
    }
}

fn exit_code_for(class: ErrorClass) -> ExitCode {
    match class {
        ErrorClass::BadInput => ExitCode::from(2),
        ErrorClass::DataNotReady => ExitCode::from(3),
        ErrorClass::NotFound => ExitCode::from(4),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct DatasetInfo<'a> {
    version: u64,
    rows: usize,
    categories: Vec<&'a str>,
}

fn dataset_info(snapshot: &Snapshot) -> DatasetInfo<'_> {
    DatasetInfo {
        version: snapshot.version,
        rows: snapshot.table.len(),
        categories: snapshot.table.category_columns().collect(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let matches = cli().get_matches();

    let config_file = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config.toml");
    let (config, created) = load_config(config_file)?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level.as_str())).init();
    if created {
        info!("Created default configuration file: {}", config_file);
    } else {
        info!("Loaded configuration from: {}", config_file);
    }
    let store = DatasetStore::open(&config.data_file);
    info!("Data file path: {}", store.path().display());

    match matches.subcommand() {
        Some(("predict", args)) => run_predict(&store, args),
        Some(("batch", args)) => run_batch(&store, args).await,
        Some(("upload", args)) => run_upload(&store, &config, args).await,
        Some(("serve", _)) => run_serve(&store, &config).await,
        Some(("categories", _)) => {
            print_json(&dataset_info(&store.snapshot()))?;
            Ok(ExitCode::SUCCESS)
        }
        _ => Ok(ExitCode::FAILURE),
    }
}

fn run_predict(store: &DatasetStore, args: &ArgMatches) -> Result<ExitCode> {
    let raw = RawQuery {
        rank: args.get_one::<String>("rank").cloned().map(serde_json::Value::String),
        category: args.get_one::<String>("category").cloned(),
        branch: args.get_one::<String>("branch").cloned(),
    };

    let snapshot = store.snapshot();
    let result = matcher::answer(&snapshot.table, raw);
    let code = match &result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => exit_code_for(e.class()),
    };

    print_json(&PredictResponse::from(result))?;
    Ok(code)
}

async fn run_batch(store: &DatasetStore, args: &ArgMatches) -> Result<ExitCode> {
    let file = args
        .get_one::<String>("file")
        .context("missing batch file argument")?;
    let content = fs::read_to_string(file).with_context(|| format!("Failed to read batch file: {}", file))?;
    let queries: Vec<RawQuery> =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse batch file: {}", file))?;

    info!("Running {} queries", queries.len());
    let responses = matcher::run_batch(store.snapshot(), queries).await?;

    let failed = responses
        .iter()
        .filter(|r| matches!(r, PredictResponse::Error { .. }))
        .count();
    if failed > 0 {
        info!("{} of {} queries were rejected", failed, responses.len());
    }

    print_json(&responses)?;
    Ok(ExitCode::SUCCESS)
}

/// Long-running mode: one JSON query per stdin line, one JSON response per
/// stdout line. `reload` and `upload <SOURCE>` lines swap the dataset.
async fn run_serve(store: &DatasetStore, config: &Config) -> Result<ExitCode> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Serving queries from stdin");

    while let Some(line) = lines.next_line().await.context("Failed to read from stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = if line == "reload" {
            let snapshot = store.reload();
            serde_json::to_value(dataset_info(&snapshot))?
        } else if let Some(source) = line.strip_prefix("upload ") {
            match upload(store, config, source.trim()).await {
                Ok(snapshot) => serde_json::to_value(dataset_info(&snapshot))?,
                Err(e) => serde_json::to_value(PredictResponse::Error { error: e.to_string() })?,
            }
        } else {
            let response = match serde_json::from_str::<RawQuery>(line) {
                Ok(raw) => {
                    let snapshot = store.snapshot();
                    matcher::respond(&snapshot.table, raw)
                }
                Err(e) => PredictResponse::Error {
                    error: format!("Invalid request: {}", e),
                },
            };
            serde_json::to_value(response)?
        };

        println!("{}", serde_json::to_string(&reply)?);
    }

    Ok(ExitCode::SUCCESS)
}

async fn upload(store: &DatasetStore, config: &Config, source: &str) -> Result<Arc<Snapshot>, UploadError> {
    if fetch::is_remote(source) {
        let fetcher = DatasetFetcher::new(config.fetch_timeout_secs);
        let (file_name, content) = fetcher.fetch(source).await?;
        store.upload(&file_name, &content, &config.upload_extension)
    } else {
        store.upload_file(Path::new(source), &config.upload_extension)
    }
}

async fn run_upload(store: &DatasetStore, config: &Config, args: &ArgMatches) -> Result<ExitCode> {
    let source = args
        .get_one::<String>("source")
        .context("missing upload source argument")?;

    match upload(store, config, source).await {
        Ok(snapshot) => {
            print_json(&dataset_info(&snapshot))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("Invalid file format or upload error: {}", e);
            print_json(&PredictResponse::Error { error: e.to_string() })?;
            Ok(match e {
                UploadError::Fetch { .. } | UploadError::Io { .. } => ExitCode::FAILURE,
                UploadError::BadExtension { .. } | UploadError::Invalid(_) => exit_code_for(ErrorClass::BadInput),
            })
        }
    }
}
