//! kudu-connect - Kudu sink connector tooling
//!
//! # Usage
//!
//! ```bash
//! # Validate configuration
//! kudu-connect -c kudu-connect.yaml validate
//!
//! # Print the configuration schema
//! kudu-connect schema --format yaml
//!
//! # Replay a JSON-lines record file against an in-memory cluster
//! kudu-connect -c kudu-connect.yaml replay --records records.jsonl --tables tables.yaml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kudu_connect::memory::MemoryCluster;
use kudu_connect::record::Record;
use kudu_connect::schema::TableSchema;
use kudu_connect::{KuduSinkConfig, KuduSinkTask};

#[derive(Parser)]
#[command(name = "kudu-connect")]
#[command(version, about = "Sink connector for Kudu-style column stores")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "kudu-connect.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file
    Validate,
    /// Show the configuration schema
    Schema {
        /// Output format (json, yaml)
        #[arg(long, default_value = "json")]
        format: String,
    },
    /// Replay records against an in-memory cluster and print committed offsets
    Replay {
        /// JSON-lines file, one record per line
        #[arg(long)]
        records: PathBuf,
        /// YAML list of table definitions to create before replaying
        #[arg(long)]
        tables: PathBuf,
        /// Records handed to the task per put
        #[arg(long, default_value_t = 500)]
        poll_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Schema { format } = &cli.command {
        return show_schema(format);
    }

    let config = KuduSinkConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Validate => validate_config(&config),
        Commands::Replay {
            records,
            tables,
            poll_size,
        } => replay(&config, &records, &tables, poll_size).await,
        Commands::Schema { .. } => unreachable!(), // handled above
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn validate_config(config: &KuduSinkConfig) -> Result<()> {
    let resolved = config.resolve().context("Configuration is invalid")?;

    println!("✓ Configuration valid!\n");

    println!("Cluster:");
    println!("  Masters:");
    for master in &resolved.masters {
        println!("    - {}", master);
    }
    println!("  Workers: {}", resolved.worker_count);
    println!(
        "  Operation timeout: {}ms",
        resolved.session.operation_timeout.as_millis()
    );
    println!(
        "  Socket read timeout: {}ms",
        resolved.session.socket_read_timeout.as_millis()
    );
    println!();

    println!("Routing:");
    println!(
        "  Table field: {}",
        resolved.routing.table_field.as_deref().unwrap_or("(topic)")
    );
    println!(
        "  Table filter: {}",
        resolved.routing.table_filter.as_deref().unwrap_or("(none)")
    );
    println!(
        "  Key insert: {}",
        if resolved.key_insert {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("  Operation: {}", resolved.operation);
    println!();

    println!("Delivery:");
    println!("  Max retries: {}", resolved.retry.max_retries);
    println!("  Retry backoff: {}ms", resolved.retry.backoff.as_millis());
    println!("  Row error policy: {}", resolved.retry.row_error_policy);
    println!("  Batch max rows: {}", resolved.batch.max_rows);
    println!("  Batch linger: {}ms", resolved.batch.linger.as_millis());
    println!(
        "  Shutdown timeout: {}ms",
        resolved.shutdown_timeout.as_millis()
    );

    Ok(())
}

fn show_schema(format: &str) -> Result<()> {
    use schemars::schema_for;

    let schema = serde_json::to_value(schema_for!(KuduSinkConfig))?;
    match format {
        "yaml" => println!("{}", serde_yaml::to_string(&schema)?),
        _ => println!("{}", serde_json::to_string_pretty(&schema)?),
    }

    Ok(())
}

async fn replay(
    config: &KuduSinkConfig,
    records_path: &Path,
    tables_path: &Path,
    poll_size: usize,
) -> Result<()> {
    let tables = load_tables(tables_path)?;
    let records = load_records(records_path)?;

    let cluster = MemoryCluster::new();
    for table in tables {
        cluster.create_table(table);
    }
    info!(
        tables = cluster.table_names().len(),
        records = records.len(),
        "Replaying records against in-memory cluster"
    );

    let mut task = KuduSinkTask::start(config, Arc::new(cluster.connector()))
        .await
        .context("Failed to start sink task")?;

    let mut outcome = Ok(());
    for chunk in records.chunks(poll_size.max(1)) {
        if let Err(e) = task.put(chunk.to_vec()).await {
            outcome = Err(e);
            break;
        }
    }
    if outcome.is_ok() {
        outcome = task.flush().await.map(|_| ());
    }
    let stats = task.stats();
    let report = task.close().await;

    println!("Committed offsets:");
    let offsets: BTreeMap<_, _> = report.commit_offsets.iter().collect();
    for (partition, offset) in offsets {
        println!("  {}: {}", partition, offset);
    }
    println!();

    println!("Rows:");
    for table in cluster.table_names() {
        println!("  {}: {}", table, cluster.row_count(&table));
    }
    println!();

    println!("Stats:");
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if report.aborted > 0 {
        warn!(aborted = report.aborted, "Some batches were aborted on shutdown");
    }
    outcome.context("Replay failed")
}

fn load_tables(path: &Path) -> Result<Vec<TableSchema>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read table definitions from {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Invalid table definitions in {}", path.display()))
}

fn load_records(path: &Path) -> Result<Vec<Record>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open records file {}", path.display()))?;

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)
            .with_context(|| format!("Invalid record on line {}", index + 1))?;
        records.push(record);
    }
    Ok(records)
}
