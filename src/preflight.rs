//! Pre-flight checks run before any output file is created.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::RunConfig;
use crate::error::CollectError;

/// Outcome of the pre-flight checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preflight {
    pub perf: PathBuf,
    pub tar: Option<PathBuf>,
    pub turbostat: Option<PathBuf>,
    pub lscpu: Option<PathBuf>,
}

/// Resolve a command name to its full path by searching PATH.
///
/// Names containing a slash are checked directly.
pub fn resolve_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = Path::new(name);
        return is_executable(path).then(|| path.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(metadata) => metadata.is_file() && metadata.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Verify privileges and external tools.
///
/// Missing required tools are fatal. A missing turbostat disables that
/// collector in `config` with a warning.
pub fn run_preflight(config: &mut RunConfig) -> Result<Preflight, CollectError> {
    if config.require_root && !nix::unistd::geteuid().is_root() {
        return Err(CollectError::Privileges(
            "perf record needs root, re-run with sudo".to_string(),
        ));
    }

    let perf = resolve_executable(&config.toolchain.perf).ok_or_else(|| {
        CollectError::DependencyMissing {
            tool: config.toolchain.perf.clone(),
            reason: "not found in PATH, install linux-tools or set PERF".to_string(),
        }
    })?;
    tracing::debug!("Using perf at {}", perf.display());

    let tar = if config.bundle {
        let tar = resolve_executable(&config.toolchain.tar).ok_or_else(|| {
            CollectError::DependencyMissing {
                tool: config.toolchain.tar.clone(),
                reason: "needed for bundling, install tar or pass --no-bundle".to_string(),
            }
        })?;
        Some(tar)
    } else {
        None
    };

    let turbostat = if config.turbostat {
        let found = resolve_executable(&config.toolchain.turbostat);
        if found.is_none() {
            tracing::warn!(
                "{} not found, disabling turbostat collection",
                config.toolchain.turbostat
            );
            config.turbostat = false;
        }
        found
    } else {
        None
    };

    let lscpu = resolve_executable(&config.toolchain.lscpu);
    if lscpu.is_none() {
        tracing::debug!("{} not found, CPU topology will be skipped", config.toolchain.lscpu);
    }

    Ok(Preflight {
        perf,
        tar,
        turbostat,
        lscpu,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Toolchain;
    use std::fs;

    fn fake_tool(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config_with(perf: &Path, tar: &Path, turbostat: &str) -> RunConfig {
        RunConfig {
            require_root: false,
            toolchain: Toolchain {
                perf: perf.display().to_string(),
                tar: tar.display().to_string(),
                turbostat: turbostat.to_string(),
                lscpu: "/nonexistent/lscpu".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_direct_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = fake_tool(dir.path(), "tool");
        assert_eq!(resolve_executable(tool.to_str().unwrap()), Some(tool.clone()));

        let plain = dir.path().join("plain");
        fs::write(&plain, "data").unwrap();
        assert_eq!(resolve_executable(plain.to_str().unwrap()), None);
        assert_eq!(resolve_executable("/nonexistent/tool"), None);
    }

    #[test]
    fn test_resolve_from_path() {
        assert!(resolve_executable("sh").is_some());
        assert!(resolve_executable("definitely-not-a-real-tool-xyz").is_none());
    }

    #[test]
    fn test_missing_perf_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let tar = fake_tool(dir.path(), "tar");
        let mut config = config_with(&dir.path().join("perf"), &tar, "/nonexistent/turbostat");
        assert!(matches!(
            run_preflight(&mut config),
            Err(CollectError::DependencyMissing { .. })
        ));
    }

    #[test]
    fn test_missing_tar_only_fatal_when_bundling() {
        let dir = tempfile::TempDir::new().unwrap();
        let perf = fake_tool(dir.path(), "perf");
        let mut config = config_with(&perf, &dir.path().join("tar"), "/nonexistent/turbostat");
        assert!(run_preflight(&mut config).is_err());

        config.bundle = false;
        let preflight = run_preflight(&mut config).unwrap();
        assert_eq!(preflight.tar, None);
    }

    #[test]
    fn test_missing_turbostat_demotes_feature() {
        let dir = tempfile::TempDir::new().unwrap();
        let perf = fake_tool(dir.path(), "perf");
        let tar = fake_tool(dir.path(), "tar");
        let mut config = config_with(&perf, &tar, "/nonexistent/turbostat");
        assert!(config.turbostat);
        let preflight = run_preflight(&mut config).unwrap();
        assert!(!config.turbostat);
        assert_eq!(preflight.turbostat, None);
        assert_eq!(preflight.perf, perf);
    }
}
