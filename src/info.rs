//! Human-readable info file written next to the perf data.
//!
//! The header is written before sampling starts. Each system description
//! section is collected best-effort: a failing collector leaves a
//! `[FAILED: ...]` marker in the file and the run carries on.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use chrono::Local;
use sysinfo::{CpuRefreshKind, RefreshKind, System};

use crate::artifacts::RunArtifacts;
use crate::config::RunConfig;
use crate::cores::CoreSet;

const SEPARATOR: &str = "========================================";

/// Appends sections to the info file.
pub struct InfoWriter {
    path: PathBuf,
}

impl InfoWriter {
    /// Create (truncate) the info file and write the run header.
    pub fn create(
        artifacts: &RunArtifacts,
        config: &RunConfig,
        cores: &CoreSet,
    ) -> io::Result<Self> {
        let mut file = File::create(&artifacts.info)?;
        writeln!(file, "{SEPARATOR}")?;
        writeln!(file, "perfcollect {}", env!("CARGO_PKG_VERSION"))?;
        writeln!(file, "{SEPARATOR}")?;
        writeln!(file, "Hostname:      {}", artifacts.hostname)?;
        writeln!(file, "Label:         {}", config.label.as_deref().unwrap_or("-"))?;
        writeln!(file, "Start time:    {}", Local::now().format("%Y-%m-%d %H:%M:%S %z"))?;
        writeln!(
            file,
            "Duration:      {}",
            match config.duration {
                0 => "until interrupted".to_string(),
                secs => format!("{secs}s"),
            }
        )?;
        writeln!(file, "Events:        {}", config.events)?;
        writeln!(file, "Core mode:     {}", config.core_mode)?;
        writeln!(file, "Cores:         {cores}")?;
        if !config.perf_args.is_empty() {
            writeln!(file, "Extra flags:   {}", config.perf_args.join(" "))?;
        }
        writeln!(file, "Perf data:     {}", file_name(&artifacts.perf_data))?;
        writeln!(file)?;

        Ok(InfoWriter {
            path: artifacts.info.clone(),
        })
    }

    /// Open an existing info file for appending.
    pub fn open(path: &Path) -> Self {
        InfoWriter {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a titled section, or a failure marker if `body` failed.
    pub fn section(&self, title: &str, body: Result<String>) -> io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "--- {title} ---")?;
        match body {
            Ok(text) => {
                file.write_all(text.as_bytes())?;
                if !text.ends_with('\n') {
                    writeln!(file)?;
                }
            }
            Err(e) => {
                tracing::warn!("Collecting {title} failed: {e:#}");
                writeln!(file, "[FAILED: {title}: {e:#}]")?;
            }
        }
        writeln!(file)
    }

    /// Append the end-of-run summary block.
    pub fn summary(&self, lines: &[(&str, String)]) -> io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{SEPARATOR}")?;
        writeln!(file, "Summary")?;
        writeln!(file, "{SEPARATOR}")?;
        writeln!(file, "End time:      {}", Local::now().format("%Y-%m-%d %H:%M:%S %z"))?;
        for (key, value) in lines {
            writeln!(file, "{:<15}{value}", format!("{key}:"))?;
        }
        Ok(())
    }
}

/// Run every system description collector, best-effort.
///
/// `lscpu` and `turbostat` are the resolved tool paths; `None` means the
/// tool was not found.
pub fn collect_system_info(
    writer: &InfoWriter,
    config: &RunConfig,
    cmdline_path: &Path,
    lscpu: Option<&Path>,
    turbostat: Option<&Path>,
) {
    let sections: Vec<(&str, Result<String>)> = vec![
        ("Kernel command line", read_cmdline(cmdline_path)),
        ("Kernel version", kernel_version()),
        ("CPU summary", cpu_summary()),
        (
            "CPU topology",
            match lscpu {
                Some(lscpu) => command_output(lscpu.as_os_str(), &[]),
                None => Err(anyhow::anyhow!("{} not available", config.toolchain.lscpu)),
            },
        ),
        (
            "Sampler version",
            command_output(config.toolchain.perf.as_ref(), &["--version"]),
        ),
    ];

    for (title, body) in sections {
        if let Err(e) = writer.section(title, body) {
            tracing::warn!("Could not write {title} to {}: {e}", writer.path().display());
        }
    }

    if let Some(turbostat) = turbostat.filter(|_| config.turbostat) {
        tracing::info!(
            "Collecting turbostat for {} second(s)...",
            config.turbostat_iterations
        );
        let iterations = config.turbostat_iterations.to_string();
        let body = command_output(
            turbostat.as_os_str(),
            &["--quiet", "--interval", "1", "--num_iterations", &iterations],
        );
        if let Err(e) = writer.section("turbostat", body) {
            tracing::warn!("Could not write turbostat to {}: {e}", writer.path().display());
        }
    }
}

fn read_cmdline(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn kernel_version() -> Result<String> {
    let Some(version) = System::kernel_version() else {
        bail!("kernel version unavailable");
    };
    let os = System::long_os_version().unwrap_or_else(|| "unknown OS".to_string());
    Ok(format!("{version}\n{os}"))
}

fn cpu_summary() -> Result<String> {
    let sys = System::new_with_specifics(
        RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing().with_frequency()),
    );
    let cpus = sys.cpus();
    let Some(first) = cpus.first() else {
        bail!("no CPUs reported");
    };
    Ok(format!(
        "Model:          {}\nLogical CPUs:   {}\nFrequency:      {} MHz",
        first.brand(),
        cpus.len(),
        first.frequency()
    ))
}

fn command_output(program: &std::ffi::OsStr, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("running {}", program.to_string_lossy()))?;
    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            program.to_string_lossy(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    // perf and turbostat print some of their output to stderr
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        text.push_str(&stderr);
    }
    Ok(text)
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
