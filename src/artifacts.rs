//! Per-run output file naming.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

/// Timestamp format embedded in every output file name.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Paths of the files a run may produce. Fixed at run start.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub hostname: String,
    pub timestamp: String,
    pub perf_data: PathBuf,
    pub info: PathBuf,
    pub bundle: PathBuf,
}

impl RunArtifacts {
    pub fn new(dir: &Path, hostname: &str, label: Option<&str>, now: DateTime<Local>) -> Self {
        let hostname = sanitize(hostname);
        let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
        let prefix = match label.map(sanitize).filter(|l| !l.is_empty()) {
            Some(label) => format!("{hostname}_{label}"),
            None => hostname.clone(),
        };

        RunArtifacts {
            perf_data: dir.join(format!("{prefix}_perf_{timestamp}.data")),
            info: dir.join(format!("{prefix}_info_{timestamp}.txt")),
            bundle: dir.join(format!("{prefix}_bundle_{timestamp}.tar.gz")),
            hostname,
            timestamp,
        }
    }

    /// Companion archive written next to the perf data by `perf archive`.
    pub fn symbol_archive(&self) -> PathBuf {
        let mut name = self.perf_data.clone().into_os_string();
        name.push(".tar.bz2");
        PathBuf::from(name)
    }

    /// Per-run files that exist on disk right now, bundle excluded.
    pub fn existing_outputs(&self) -> Vec<PathBuf> {
        [self.perf_data.clone(), self.info.clone(), self.symbol_archive()]
            .into_iter()
            .filter(|p| p.exists())
            .collect()
    }
}

/// Local hostname, or `unknown-host` if it cannot be determined.
pub fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!("Could not determine hostname: {e}");
            "unknown-host".to_string()
        }
    }
}

fn sanitize(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
