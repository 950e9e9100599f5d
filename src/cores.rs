//! Core selection.
//!
//! Resolves the CPU cores handed to `perf record`: an explicit list, the
//! whole system, or the cores isolated with `isolcpus=` on the kernel command
//! line.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::CoreMode;
use crate::error::CollectError;

/// The cores a run samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreSet {
    All,
    /// Non-empty range expression such as `1-30,33-62`.
    List(String),
}

impl CoreSet {
    /// Core restriction arguments for `perf record`.
    pub fn perf_args(&self) -> Vec<String> {
        match self {
            CoreSet::All => vec!["-a".to_string()],
            CoreSet::List(list) => vec!["-C".to_string(), list.clone()],
        }
    }
}

impl fmt::Display for CoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreSet::All => f.write_str("all"),
            CoreSet::List(list) => f.write_str(list),
        }
    }
}

/// A single CPU or CPU range token, e.g. `3` or `1-30`.
static CPU_RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(-[0-9]+)?$").expect("Invalid CPU range regex pattern"));

/// Extract the CPU list from a kernel command line.
///
/// Handles `isolcpus=1-30,33-62` and the flagged form
/// `isolcpus=domain,managed_irq,1-30`. Qualifier words are dropped, so only
/// digits, commas and hyphens survive. Returns `None` when the parameter is
/// absent or yields no cores.
pub fn parse_isolcpus(cmdline: &str) -> Option<String> {
    let value = cmdline
        .split_whitespace()
        .filter_map(|param| param.strip_prefix("isolcpus="))
        .last()?;

    let ranges: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|token| CPU_RANGE_RE.is_match(token))
        .collect();

    if ranges.is_empty() {
        None
    } else {
        Some(ranges.join(","))
    }
}

/// Resolve the [`CoreSet`] for `mode`.
///
/// `cmdline_path` is only read in [`CoreMode::Auto`]. A missing or
/// unreadable isolation parameter falls back to [`CoreSet::All`].
pub fn select_cores(
    mode: CoreMode,
    core_list: Option<&str>,
    cmdline_path: &Path,
) -> Result<CoreSet, CollectError> {
    match mode {
        CoreMode::Manual => match core_list.map(str::trim) {
            Some(list) if !list.is_empty() => Ok(CoreSet::List(list.to_string())),
            _ => Err(CollectError::Configuration(
                "core mode 'manual' requires a non-empty core list".to_string(),
            )),
        },
        CoreMode::All => Ok(CoreSet::All),
        CoreMode::Auto => {
            let cmdline = match fs::read_to_string(cmdline_path) {
                Ok(cmdline) => cmdline,
                Err(e) => {
                    tracing::warn!(
                        "Could not read {}: {e}, sampling all cores",
                        cmdline_path.display()
                    );
                    return Ok(CoreSet::All);
                }
            };
            match parse_isolcpus(&cmdline) {
                Some(list) => {
                    tracing::info!("Detected isolated cores: {list}");
                    Ok(CoreSet::List(list))
                }
                None => {
                    tracing::warn!("No isolcpus= parameter found, sampling all cores");
                    Ok(CoreSet::All)
                }
            }
        }
    }
}
