//! Ingestion pipeline: one run per (module, config, log type) triple.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};
use url::Url;

use crate::archive::{self, BuildJob, ExtractError};
use crate::frame::PytestembVersion;
use crate::parser::{self, ParseContext};
use crate::probe;
use crate::record::{IndexIdentity, IndexRecord, LogType};
use crate::search::{IndexReplacer, SearchClient};

/// Working-file name fragments swept from the shared temp area after a run.
const SWEEP_MARKERS: &[&str] = &["pytestemb", "ckcm", "octopylog"];

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Downloading the trace archive from the build server.
    Fetching,
    /// Unpacking the archive into the working area.
    Extracting,
    /// Probing the traces for the governing software version.
    ProbingVersion,
    /// Classifying trace lines and bulk-loading the index.
    Loading,
    /// Removing consumed working files.
    CleaningUp,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Fetching => "fetching",
            Stage::Extracting => "extracting",
            Stage::ProbingVersion => "probing-version",
            Stage::Loading => "classifying-and-loading",
            Stage::CleaningUp => "cleaning-up",
        };
        f.write_str(label)
    }
}

/// Terminal run failures. Everything else degrades per file or per record.
#[derive(Debug)]
pub enum RunError {
    /// The build server or search cluster stayed unreachable after the
    /// bounded retry budget.
    Transport {
        /// Stage the run was in when the transport gave out.
        stage: Stage,
        /// Underlying failure chain.
        source: anyhow::Error,
    },
    /// The downloaded archive was empty or unreadable; no index was touched.
    Extraction(ExtractError),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport { stage, source } => {
                write!(f, "transport failure while {stage}: {source:#}")
            }
            Self::Extraction(err) => write!(f, "archive extraction failed: {err}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport { source, .. } => Some(source.as_ref()),
            Self::Extraction(err) => Some(err),
        }
    }
}

/// Settings for one ingestion run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Build server base URL; required unless `results_url` is given.
    pub server: Option<Url>,
    /// Explicit results URL overriding the computed job layout.
    pub results_url: Option<Url>,
    /// Hardware module under test.
    pub module: String,
    /// Software configuration of the job.
    pub config: String,
    /// Build number, or the server's `lastSuccessfulBuild` alias.
    pub build_number: String,
    /// Shared working area for downloads, extraction, and the sweep.
    pub work_dir: PathBuf,
    /// Search cluster base URL.
    pub search_endpoint: String,
    /// Per-request deadline for archive and cluster calls.
    pub request_timeout: Duration,
    /// Attempt budget for transient transport errors.
    pub max_retries: usize,
    /// Documents per bulk submission.
    pub batch_size: usize,
}

/// Outcome of a completed (non-failed) run.
#[derive(Debug)]
pub struct RunReport {
    /// The index that was replaced.
    pub index: String,
    /// Version resolved by the probe (possibly the literal `unknown`).
    pub version: String,
    /// Trace files parsed and loaded.
    pub files_indexed: usize,
    /// Trace files skipped after a classification failure.
    pub files_failed: usize,
    /// Documents the cluster accepted.
    pub records_indexed: usize,
    /// Documents the cluster rejected.
    pub rejected: Vec<IndexRecord>,
    /// True when every per-file load succeeded with no rejections.
    pub success: bool,
}

/// Runs one ingestion for the configured (module, config) pair and format.
///
/// Runs sharing an index identity must be serialized by the caller; the
/// delete-then-create protocol has no cross-run lock.
pub fn run(log_type: LogType, cfg: &PipelineConfig) -> Result<RunReport, RunError> {
    info!(stage = %Stage::Fetching, %log_type, module = %cfg.module, config = %cfg.config, "starting ingestion run");
    let job = resolve_job(cfg)?;
    let archive_url = job
        .archive_url(log_type)
        .map_err(|source| transport(Stage::Fetching, source))?;
    let working_file = cfg
        .work_dir
        .join(archive::working_file_name(log_type, &cfg.module, &cfg.config));
    archive::fetch_archive(&archive_url, &working_file, cfg.request_timeout, cfg.max_retries)
        .map_err(|source| transport(Stage::Fetching, source))?;

    info!(stage = %Stage::Extracting, archive = %working_file.display(), "unpacking traces");
    let traces_dir =
        archive::extract_archive(&working_file, &cfg.work_dir).map_err(RunError::Extraction)?;

    info!(stage = %Stage::ProbingVersion, dir = %traces_dir.display(), "probing software version");
    let version = probe::package_version(&traces_dir);
    if version == probe::VERSION_UNKNOWN {
        warn!("no version marker found; indexing under the literal \"unknown\"");
    }
    let pytestemb = match log_type {
        LogType::Octopylog => resolve_pytestemb(&traces_dir),
        LogType::Ckcm => PytestembVersion::default(),
    };

    let identity =
        IndexIdentity::new(log_type, &version, &cfg.module, &cfg.config, &cfg.build_number);
    let index_name = identity.index_name();
    info!(index = %index_name, %version, "resolved index identity");

    let client = SearchClient::new(&cfg.search_endpoint, cfg.request_timeout, cfg.max_retries)
        .map_err(|source| transport(Stage::Loading, source))?;
    let replacer = IndexReplacer::new(client, cfg.batch_size);
    replacer
        .prepare(&index_name)
        .map_err(|source| transport(Stage::Loading, source))?;

    let ctx = ParseContext {
        version: version.clone(),
        module: identity.module().to_string(),
        pytestemb,
    };
    let mut files_indexed = 0usize;
    let mut files_failed = 0usize;
    let mut records_indexed = 0usize;
    let mut rejected = Vec::new();
    for path in trace_files(&traces_dir) {
        info!(stage = %Stage::Loading, file = %path.display(), "parsing trace file");
        match parser::parse_file(&path, log_type, &ctx) {
            Ok(records) => {
                let outcome = replacer
                    .load(&index_name, log_type.as_str(), records)
                    .map_err(|source| transport(Stage::Loading, source))?;
                files_indexed += 1;
                records_indexed += outcome.accepted;
                rejected.extend(outcome.rejected);
            }
            Err(err) => {
                files_failed += 1;
                warn!(file = %path.display(), err = %err, "skipping file after classification failure");
            }
        }
        if let Err(err) = fs::remove_file(&path) {
            warn!(file = %path.display(), %err, "failed to remove consumed trace file");
        }
    }

    info!(stage = %Stage::CleaningUp, dir = %cfg.work_dir.display(), "removing working files");
    if let Err(err) = fs::remove_file(&working_file) {
        warn!(file = %working_file.display(), %err, "failed to remove downloaded archive");
    }
    sweep_work_dir(&cfg.work_dir);

    let success = files_failed == 0 && rejected.is_empty();
    info!(
        index = %index_name,
        files_indexed,
        files_failed,
        records_indexed,
        rejected = rejected.len(),
        success,
        "ingestion run complete"
    );
    Ok(RunReport {
        index: index_name,
        version,
        files_indexed,
        files_failed,
        records_indexed,
        rejected,
        success,
    })
}

fn transport(stage: Stage, source: anyhow::Error) -> RunError {
    RunError::Transport { stage, source }
}

fn resolve_job(cfg: &PipelineConfig) -> Result<BuildJob, RunError> {
    if let Some(results_url) = &cfg.results_url {
        return Ok(BuildJob::with_results(results_url.clone()));
    }
    let Some(server) = &cfg.server else {
        return Err(transport(
            Stage::Fetching,
            anyhow::anyhow!("either a build server or an explicit results URL is required"),
        ));
    };
    BuildJob::new(server, &cfg.module, &cfg.config, &cfg.build_number)
        .map_err(|source| transport(Stage::Fetching, source))
}

fn resolve_pytestemb(dir: &Path) -> PytestembVersion {
    let banner = probe::pytestemb_version(dir);
    match banner.as_deref().and_then(PytestembVersion::parse) {
        Some(version) => version,
        None => {
            warn!(
                banner = banner.as_deref().unwrap_or("<missing>"),
                "pytestemb version unavailable, using legacy token layout"
            );
            PytestembVersion::default()
        }
    }
}

/// Files in the extracted traces directory, directory-listing order.
fn trace_files(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect(),
        Err(err) => {
            warn!(dir = %dir.display(), %err, "failed to list traces directory");
            Vec::new()
        }
    }
}

/// Removes leftover working files whose names match the ingestion pattern,
/// bounding disk usage across runs. Directories are left in place.
fn sweep_work_dir(dir: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), %err, "failed to list working area for sweep");
            return 0;
        }
    };

    let mut removed = 0usize;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !SWEEP_MARKERS.iter().any(|marker| name.contains(marker)) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(file = %path.display(), "cleaning: removed deprecated working file");
                removed += 1;
            }
            Err(err) => warn!(file = %path.display(), %err, "failed to sweep working file"),
        }
    }
    removed
}
