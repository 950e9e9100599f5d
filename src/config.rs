//! Run configuration.
//!
//! [`RunConfig`] holds every runtime option a collection run needs, separated
//! from the CLI parsing concerns. It is validated once with
//! [`RunConfig::validate`] before any file or process is touched.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CollectError;

/// Default event list handed to `perf record -e`.
pub const DEFAULT_EVENTS: &str = "cycles,instructions,cache-misses,branch-misses";

/// Default turbostat iteration count (one second each).
pub const DEFAULT_TURBOSTAT_ITERATIONS: u32 = 5;

/// Default upload timeout in seconds.
pub const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 300;

/// How the set of sampled CPU cores is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoreMode {
    /// Use the cores isolated with `isolcpus=` on the kernel command line.
    #[default]
    Auto,
    /// Sample system-wide.
    All,
    /// Use the explicit core list from the command line.
    Manual,
}

impl FromStr for CoreMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(CoreMode::Auto),
            "all" => Ok(CoreMode::All),
            "manual" => Ok(CoreMode::Manual),
            other => Err(format!(
                "invalid core mode '{other}', expected one of: auto, all, manual"
            )),
        }
    }
}

impl fmt::Display for CoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoreMode::Auto => "auto",
            CoreMode::All => "all",
            CoreMode::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Names or paths of the external binaries a run shells out to.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub perf: String,
    pub turbostat: String,
    pub tar: String,
    pub lscpu: String,
}

impl Toolchain {
    /// Tool names from `PERF`, `TURBOSTAT`, `TAR` and `LSCPU`, falling back
    /// to the bare command names.
    pub fn from_env() -> Self {
        Toolchain {
            perf: env::var("PERF").unwrap_or_else(|_| "perf".to_string()),
            turbostat: env::var("TURBOSTAT").unwrap_or_else(|_| "turbostat".to_string()),
            tar: env::var("TAR").unwrap_or_else(|_| "tar".to_string()),
            lscpu: env::var("LSCPU").unwrap_or_else(|_| "lscpu".to_string()),
        }
    }
}

impl Default for Toolchain {
    fn default() -> Self {
        Toolchain {
            perf: "perf".to_string(),
            turbostat: "turbostat".to_string(),
            tar: "tar".to_string(),
            lscpu: "lscpu".to_string(),
        }
    }
}

/// Where and how the final bundle is uploaded.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            endpoint: String::new(),
            token: None,
            timeout: Duration::from_secs(DEFAULT_UPLOAD_TIMEOUT_SECS),
        }
    }
}

/// Configuration for a single collection run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Event specification passed to `perf record -e`
    pub events: String,
    /// Duration in seconds (0 = until interrupted)
    pub duration: u64,
    /// Optional label embedded in the output file names
    pub label: Option<String>,
    /// Directory receiving all output files
    pub output_dir: PathBuf,
    /// Core selection mode
    pub core_mode: CoreMode,
    /// Explicit core list for [`CoreMode::Manual`]
    pub core_list: Option<String>,
    /// Extra flags appended to `perf record`
    pub perf_args: Vec<String>,
    /// Collect turbostat output into the info file
    pub turbostat: bool,
    /// Number of one-second turbostat iterations
    pub turbostat_iterations: u32,
    /// Bundle output files into a single tarball
    pub bundle: bool,
    /// Run `perf archive` on the perf data
    pub symbol_archive: bool,
    /// Upload the bundle when done
    pub upload: bool,
    pub upload_config: UploadConfig,
    pub toolchain: Toolchain,
    /// Require an effective uid of 0 during preflight
    pub require_root: bool,
    /// File holding the kernel boot parameters
    pub cmdline_path: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            events: DEFAULT_EVENTS.to_string(),
            duration: 0,
            label: None,
            output_dir: PathBuf::from("."),
            core_mode: CoreMode::Auto,
            core_list: None,
            perf_args: Vec::new(),
            turbostat: true,
            turbostat_iterations: DEFAULT_TURBOSTAT_ITERATIONS,
            bundle: true,
            symbol_archive: false,
            upload: false,
            upload_config: UploadConfig::default(),
            toolchain: Toolchain::default(),
            require_root: true,
            cmdline_path: PathBuf::from("/proc/cmdline"),
        }
    }
}

impl RunConfig {
    /// Check cross-field invariants. Runs before any resource is touched.
    pub fn validate(&self) -> Result<(), CollectError> {
        if self.events.trim().is_empty() {
            return Err(CollectError::Configuration(
                "event specification must not be empty".to_string(),
            ));
        }
        if self.core_mode == CoreMode::Manual
            && self
                .core_list
                .as_deref()
                .map_or(true, |list| list.trim().is_empty())
        {
            return Err(CollectError::Configuration(
                "core mode 'manual' requires a non-empty core list".to_string(),
            ));
        }
        if self.turbostat && self.turbostat_iterations == 0 {
            return Err(CollectError::Configuration(
                "turbostat iterations must be at least 1".to_string(),
            ));
        }
        if self.upload && self.upload_config.endpoint.trim().is_empty() {
            return Err(CollectError::Configuration(
                "upload enabled but no upload URL given".to_string(),
            ));
        }
        if self.upload && self.upload_config.timeout.is_zero() {
            return Err(CollectError::Configuration(
                "upload timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
