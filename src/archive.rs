//! Build-server archive transport and extraction.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use tar::Archive;
use tracing::{info, warn};
use url::Url;

use crate::record::LogType;

/// One build-server job whose results directory holds the trace archives.
#[derive(Debug, Clone)]
pub struct BuildJob {
    results_url: Url,
}

impl BuildJob {
    /// Computes the job's results URL from the historical layout:
    /// `{server}job/03_OV_{MODULE}/CONFIG_HW={MODULE},CONFIG_SW={config},label={MODULE}/{build}/artifact/results/`.
    pub fn new(server: &Url, module: &str, config: &str, build_number: &str) -> Result<Self> {
        let module = module.to_uppercase();
        let results = format!(
            "{server}job/03_OV_{module}/CONFIG_HW={module},CONFIG_SW={config},label={module}/{build_number}/artifact/results/"
        );
        let results_url = Url::parse(&results)
            .with_context(|| format!("computed results URL is invalid: {results}"))?;
        Ok(Self { results_url })
    }

    /// Uses an explicit results URL instead of the computed layout.
    pub fn with_results(results_url: Url) -> Self {
        Self { results_url }
    }

    /// The job's results directory URL.
    pub fn results_url(&self) -> &Url {
        &self.results_url
    }

    /// URL of the trace archive for the given format.
    pub fn archive_url(&self, log_type: LogType) -> Result<Url> {
        self.results_url
            .join(archive_entry(log_type))
            .context("failed to join archive entry onto results URL")
    }
}

fn archive_entry(log_type: LogType) -> &'static str {
    match log_type {
        LogType::Ckcm => "ckcm.tgz",
        LogType::Octopylog => "pytestemb.tgz",
    }
}

/// Working-file name for a downloaded archive in the shared temp area.
/// The layout is part of the persisted contract.
pub fn working_file_name(log_type: LogType, module: &str, config: &str) -> String {
    format!("{}-{}-{}.tgz", log_type.as_str(), module, config)
}

/// Downloads `url` to `dest`, overwriting any prior copy.
///
/// Non-2xx statuses fail loudly; transient transport errors are retried a
/// bounded number of times before surfacing.
pub fn fetch_archive(url: &Url, dest: &Path, timeout: Duration, max_retries: usize) -> Result<()> {
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build archive HTTP client")?;
    let max_retries = max_retries.max(1);
    let mut attempt = 0usize;
    let mut response = loop {
        match client.get(url.clone()).send() {
            Ok(response) => {
                let status = response.status();
                if should_retry(status) && attempt + 1 < max_retries {
                    attempt += 1;
                    warn!(%url, %status, attempt, "transient archive fetch error, retrying");
                    thread::sleep(retry_backoff(attempt));
                    continue;
                }
                anyhow::ensure!(
                    status.is_success(),
                    "archive fetch {url} failed with status {status}"
                );
                break response;
            }
            Err(err) => {
                if (err.is_connect() || err.is_timeout() || err.is_request())
                    && attempt + 1 < max_retries
                {
                    attempt += 1;
                    warn!(%url, %err, attempt, "archive fetch failed, retrying");
                    thread::sleep(retry_backoff(attempt));
                    continue;
                }
                return Err(err).with_context(|| format!("failed to fetch archive {url}"));
            }
        }
    };

    let mut file = File::create(dest)
        .with_context(|| format!("failed to create working file {}", dest.display()))?;
    response
        .copy_to(&mut file)
        .with_context(|| format!("failed to write archive to {}", dest.display()))?;
    info!(%url, dest = %dest.display(), "archive downloaded");
    Ok(())
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

/// Errors surfaced while extracting a downloaded archive.
#[derive(Debug)]
pub enum ExtractError {
    /// The archive contained no entries.
    Empty,
    /// The archive could not be read or unpacked.
    Archive(std::io::Error),
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "archive contains no entries"),
            Self::Archive(err) => write!(f, "failed to unpack archive: {err}"),
        }
    }
}

impl std::error::Error for ExtractError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Empty => None,
            Self::Archive(err) => Some(err),
        }
    }
}

/// Unpacks a gzip-compressed tar archive into `dest_dir` and returns the
/// archive's top-level directory. An archive with no entries is an error and
/// leaves nothing behind for the caller to ingest.
pub fn extract_archive(path: &Path, dest_dir: &Path) -> Result<PathBuf, ExtractError> {
    let file = File::open(path).map_err(ExtractError::Archive)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let mut top_level: Option<PathBuf> = None;

    let entries = archive.entries().map_err(ExtractError::Archive)?;
    for entry in entries {
        let mut entry = entry.map_err(ExtractError::Archive)?;
        if top_level.is_none() {
            let entry_path = entry.path().map_err(ExtractError::Archive)?;
            top_level = entry_path
                .components()
                .next()
                .map(|component| PathBuf::from(component.as_os_str()));
        }
        entry.unpack_in(dest_dir).map_err(ExtractError::Archive)?;
    }

    let top_level = top_level.ok_or(ExtractError::Empty)?;
    info!(archive = %path.display(), dest = %dest_dir.display(), "archive extracted");
    Ok(dest_dir.join(top_level))
}
