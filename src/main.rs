//! axiom-ship: send log lines from files or stdin to a dataset

use axiom_client::blocking::Client;
use axiom_client::{
    AxiomHandler, ClientConfig, ClientError, FlushPolicy, LogRecord, Result, encoder,
};
use clap::Parser;
use serde_json::Value;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Ship newline-delimited logs to an Axiom dataset
#[derive(Parser, Debug)]
#[command(name = "axiom-ship")]
#[command(version, about, long_about = None)]
struct Args {
    /// Dataset to ingest into
    #[arg(short, long, env = "AXIOM_DATASET")]
    dataset: String,

    /// API or ingest token
    #[arg(long, env = "AXIOM_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, env = "AXIOM_ORG_ID")]
    org_id: Option<String>,

    /// API base URL
    #[arg(long, env = "AXIOM_URL")]
    url: Option<String>,

    /// Regional edge URL used for ingest instead of the API URL
    #[arg(long, env = "AXIOM_EDGE_URL")]
    edge_url: Option<String>,

    /// Records per ingest request
    #[arg(long, default_value_t = 1000)]
    batch_size: usize,

    /// Seconds between background flushes
    #[arg(long, default_value_t = 1.0)]
    flush_interval: f64,

    /// Print the records that would be sent instead of sending them
    #[arg(long)]
    dry_run: bool,

    /// Input files; stdin when empty
    files: Vec<PathBuf>,
}

fn main() {
    let args = Args::parse();
    initialize_tracing();

    if let Err(e) = run(args) {
        error!("axiom-ship failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let policy = FlushPolicy {
        max_batch_size: args.batch_size,
        flush_interval: Duration::try_from_secs_f64(args.flush_interval)
            .map_err(|e| ClientError::Config(format!("invalid flush interval: {}", e)))?,
    };

    if args.dry_run {
        let records = read_records(&args.files)?;
        return print_records(&records);
    }

    let client = Client::new(client_config(&args))?;
    let handler = AxiomHandler::new(client, args.dataset.clone(), policy)?;

    info!("Shipping to dataset {}", args.dataset);
    let mut shipped = 0usize;
    for_each_record(&args.files, |record| {
        handler.append(record);
        shipped += 1;
    })?;

    handler.close()?;
    info!("Shipped {} records to {}", shipped, args.dataset);
    Ok(())
}

fn client_config(args: &Args) -> ClientConfig {
    let mut config = ClientConfig::from_env();
    if let Some(token) = &args.token {
        config.token = token.clone();
    }
    if let Some(org_id) = &args.org_id {
        config = config.with_org_id(org_id.clone());
    }
    if let Some(url) = &args.url {
        config = config.with_url(url.clone());
    }
    if let Some(edge_url) = &args.edge_url {
        config = config.with_edge_url(edge_url.clone());
    }
    config
}

fn for_each_record(files: &[PathBuf], mut f: impl FnMut(LogRecord)) -> Result<()> {
    if files.is_empty() {
        for line in io::stdin().lock().lines() {
            if let Some(record) = parse_line(&line?) {
                f(record);
            }
        }
        return Ok(());
    }

    for path in files {
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            if let Some(record) = parse_line(&line?) {
                f(record);
            }
        }
    }
    Ok(())
}

fn read_records(files: &[PathBuf]) -> Result<Vec<LogRecord>> {
    let mut records = Vec::new();
    for_each_record(files, |record| records.push(record))?;
    Ok(records)
}

/// Echo records exactly as they would appear in the request body.
fn print_records(records: &[LogRecord]) -> Result<()> {
    let events = encoder::decode(&encoder::encode(records)?)?;
    let mut stdout = io::stdout().lock();
    for event in events {
        writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
    }
    Ok(())
}

/// JSON object lines keep their fields; anything else becomes a message.
fn parse_line(line: &str) -> Option<LogRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(mut object)) => {
            if !object.contains_key("_time") {
                if let Some(timestamp) = object.remove("timestamp") {
                    object.insert("_time".to_string(), timestamp);
                }
            }
            Some(LogRecord::from_json(object))
        }
        _ => Some(LogRecord::new().with_message(line)),
    }
}

/// Initialize structured logging on stderr
fn initialize_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
