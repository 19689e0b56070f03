use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use traceload::{run_ingestion, LogType, PipelineConfig};
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "traceload-ingest",
    about = "Ingest build-job trace archives into the search cluster"
)]
struct IngestCli {
    /// Build server base URL (e.g. https://ci.example.com/)
    #[arg(long, env = "TRACELOAD_SERVER")]
    server: Option<Url>,

    /// Explicit results URL overriding the computed job layout
    #[arg(long, env = "TRACELOAD_RESULTS_URL")]
    results_url: Option<Url>,

    /// Hardware module under test (e.g. fc6050)
    #[arg(long, env = "TRACELOAD_MODULE")]
    module: String,

    /// Software configuration of the job
    #[arg(long, env = "TRACELOAD_CONFIG")]
    config: String,

    /// Build number, or the server's last-successful alias
    #[arg(long, env = "TRACELOAD_BUILD", default_value = "lastSuccessfulBuild")]
    build_number: String,

    /// Restrict the run to one trace format (default: both)
    #[arg(long, value_enum)]
    log_type: Option<LogType>,

    /// Search cluster base URL
    #[arg(long, env = "TRACELOAD_SEARCH", default_value = "http://localhost:9200")]
    search_endpoint: String,

    /// Shared working area for downloads and extraction
    #[arg(long, env = "TRACELOAD_WORK_DIR", default_value = "/tmp")]
    work_dir: PathBuf,

    /// Max seconds to wait for each archive or cluster request
    #[arg(long, env = "TRACELOAD_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Number of retries for transient transport errors
    #[arg(long, env = "TRACELOAD_MAX_RETRIES", default_value_t = 3)]
    max_retries: usize,

    /// Documents per bulk submission
    #[arg(long, env = "TRACELOAD_BATCH", default_value_t = 500)]
    batch_size: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = IngestCli::parse();
    let cfg = PipelineConfig {
        server: cli.server,
        results_url: cli.results_url,
        module: cli.module,
        config: cli.config,
        build_number: cli.build_number,
        work_dir: cli.work_dir,
        search_endpoint: cli.search_endpoint,
        request_timeout: Duration::from_secs(cli.timeout_secs.max(1)),
        max_retries: cli.max_retries.max(1),
        batch_size: cli.batch_size.max(1),
    };
    let log_types = match cli.log_type {
        Some(log_type) => vec![log_type],
        None => vec![LogType::Ckcm, LogType::Octopylog],
    };

    let mut failed = false;
    for log_type in log_types {
        match run_ingestion(log_type, &cfg) {
            Ok(report) => {
                info!(
                    index = %report.index,
                    version = %report.version,
                    files = report.files_indexed,
                    records = report.records_indexed,
                    rejected = report.rejected.len(),
                    "run finished"
                );
                if !report.success {
                    failed = true;
                }
            }
            Err(err) => {
                error!(%log_type, %err, "ingestion run failed");
                failed = true;
            }
        }
    }
    anyhow::ensure!(!failed, "one or more ingestion runs did not fully succeed");
    Ok(())
}
