//! Version probes scanning a traces directory for command-response markers.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Version reported when no marker is found anywhere in the directory.
pub const VERSION_UNKNOWN: &str = "unknown";

const CGMREX_MARKER: &str = "+CGMREX:";
const CGMR_MARKER: &str = "+CGMR:HW";
const PYTESTEMB_MARKER: &str = "Library version : pytestemb";

const CGMREX_FILE_PREFIXES: &[&str] = &["cmd_CGMREX", "check_module_", "setenv_"];
const CGMR_FILE_PREFIX: &str = "cmd_CGMR";

/// Scans `dir` for the software version governing an ingestion run.
///
/// Candidate files named after the extended version command are scanned for
/// `+CGMREX:`; when no such file exists, plain `cmd_CGMR` files are scanned
/// for `+CGMR:HW` instead. Only the first matching file/line is used; later
/// matches are never compared, so callers must treat the result as
/// best-effort. Returns [`VERSION_UNKNOWN`] when nothing matches.
pub fn package_version(dir: &Path) -> String {
    let primary = candidate_files(dir, |name| {
        CGMREX_FILE_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
    });

    let version = if primary.is_empty() {
        let fallback = candidate_files(dir, |name| name.starts_with(CGMR_FILE_PREFIX));
        scan_files(&fallback, cgmr_version)
    } else {
        scan_files(&primary, cgmrex_version)
    };

    version.unwrap_or_else(|| VERSION_UNKNOWN.to_string())
}

/// Scans `dir` for the pytestemb library version banner.
///
/// The version is the last whitespace-delimited token of the first line
/// containing the banner marker; `None` when no file carries one.
pub fn pytestemb_version(dir: &Path) -> Option<String> {
    let candidates = candidate_files(dir, |_| true);
    scan_files(&candidates, |line| {
        if !line.contains(PYTESTEMB_MARKER) {
            return None;
        }
        line.split_whitespace().last().map(|t| t.to_string())
    })
}

/// Files in `dir` (directory-listing order) whose names pass `pred`.
fn candidate_files(dir: &Path, pred: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), %err, "failed to list traces directory");
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter(|entry| pred(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.path())
        .collect()
}

/// Applies `extract` to every line of every candidate, stopping at the first
/// hit. Unreadable files are logged and skipped.
fn scan_files(paths: &[PathBuf], extract: impl Fn(&str) -> Option<String>) -> Option<String> {
    for path in paths {
        let content = match fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                warn!(file = %path.display(), %err, "failed to read probe candidate");
                continue;
            }
        };
        for line in content.lines() {
            if let Some(found) = extract(line) {
                debug!(file = %path.display(), version = %found, "version marker found");
                return Some(found);
            }
        }
    }
    None
}

/// First single-quoted token on a `+CGMREX:` line, lowercased and truncated
/// at the first embedded whitespace.
fn cgmrex_version(line: &str) -> Option<String> {
    if !line.contains(CGMREX_MARKER) {
        return None;
    }
    let quoted = line.split('\'').nth(1)?;
    let version = quoted.to_lowercase();
    version.split_whitespace().next().map(|t| t.to_string())
}

/// Substring after the first `-SW` on a `+CGMR:HW` line, truncated at the
/// first `<LF>` or `<0x0D><0x0A>` marker.
fn cgmr_version(line: &str) -> Option<String> {
    if !line.contains(CGMR_MARKER) {
        return None;
    }
    let start = line.find("-SW")? + "-SW".len();
    let rest = &line[start..];
    let cut = ["<LF>", "<0x0D><0x0A>"]
        .iter()
        .filter_map(|marker| rest.find(marker))
        .min()
        .unwrap_or(rest.len());
    Some(rest[..cut].to_string())
}
