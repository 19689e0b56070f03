use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use postgres::{Client, NoTls};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;
use traceload::{IndexReplacer, SearchClient};

#[derive(Parser, Debug)]
#[command(
    name = "traceload-table-indexer",
    about = "Replace a search index with the rows of a relational table"
)]
struct TableCli {
    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Table to export, one document per row
    #[arg(long)]
    table: String,

    /// Search cluster base URL
    #[arg(long, env = "TRACELOAD_SEARCH", default_value = "http://localhost:9200")]
    search_endpoint: String,

    /// Documents per bulk submission
    #[arg(long, env = "TRACELOAD_BATCH", default_value_t = 500)]
    batch_size: usize,

    /// Max seconds to wait for each cluster request
    #[arg(long, env = "TRACELOAD_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Number of retries for transient transport errors
    #[arg(long, env = "TRACELOAD_MAX_RETRIES", default_value_t = 3)]
    max_retries: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = TableCli::parse();
    let table = table_ident(&cli.table)?;

    let mut db = Client::connect(&cli.database_url, NoTls)
        .with_context(|| format!("failed to connect to Postgres at {}", cli.database_url))?;
    let rows = db
        .query(format!("SELECT row_to_json(t) FROM {table} t").as_str(), &[])
        .with_context(|| format!("failed to read table {table}"))?;
    let documents: Vec<Value> = rows.iter().map(|row| row.get(0)).collect();
    info!(table = %table, rows = documents.len(), "table read");

    let client = SearchClient::new(
        &cli.search_endpoint,
        Duration::from_secs(cli.timeout_secs.max(1)),
        cli.max_retries.max(1),
    )?;
    let replacer = IndexReplacer::new(client, cli.batch_size.max(1));
    let index = table.to_lowercase();
    let report = replacer.replace_named(&index, &index, documents)?;

    println!(
        "Indexed {} row{} into {} ({} rejected).",
        report.indexed,
        if report.indexed == 1 { "" } else { "s" },
        report.index,
        report.rejected.len()
    );
    anyhow::ensure!(report.success, "some rows were rejected by the cluster");
    Ok(())
}

/// Guards the table name before splicing it into a query.
fn table_ident(input: &str) -> Result<String> {
    let trimmed = input.trim();
    anyhow::ensure!(!trimmed.is_empty(), "table name is required");
    anyhow::ensure!(
        trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_'),
        "table name may only contain alphanumerics and underscores"
    );
    Ok(trimmed.to_string())
}
