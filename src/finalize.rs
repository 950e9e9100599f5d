//! Post-collection finalization.
//!
//! Once sampling stops the pipeline runs, in order: stop the sampler, append
//! the summary to the info file, build the symbol archive, bundle the output
//! files, upload the bundle. Each stage fails independently; none of them
//! changes the exit code of the run.
//!
//! [`Finalizer::finalize`] is guarded by a [`CleanupLatch`] so its side
//! effects happen exactly once no matter how many triggers race for it.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::artifacts::RunArtifacts;
use crate::config::UploadConfig;
use crate::error::{StageError, UploadError};
use crate::info::{file_name, InfoWriter};
use crate::supervisor::{ProcessState, SupervisedProcess};
use crate::upload::{UploadReceipt, Uploader};

/// Single-fire guard for the finalization side effects.
#[derive(Debug, Default)]
pub struct CleanupLatch {
    fired: AtomicBool,
}

impl CleanupLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for exactly one caller, ever.
    pub fn try_fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Builds the symbol archive companion for a perf data file.
pub trait Archiver: Send + Sync {
    fn archive(&self, perf_data: &Path) -> Result<PathBuf, StageError>;
}

/// Packs a set of files into one compressed artifact.
pub trait Bundler: Send + Sync {
    fn bundle(&self, files: &[PathBuf], dest: &Path) -> Result<(), StageError>;
}

/// `perf archive`, which writes `<perf data>.tar.bz2`.
pub struct PerfArchiver {
    perf: PathBuf,
}

impl PerfArchiver {
    pub fn new(perf: impl Into<PathBuf>) -> Self {
        PerfArchiver { perf: perf.into() }
    }
}

impl Archiver for PerfArchiver {
    fn archive(&self, perf_data: &Path) -> Result<PathBuf, StageError> {
        let output = Command::new(&self.perf)
            .arg("archive")
            .arg(perf_data)
            .output()
            .map_err(|e| StageError::Archive(format!("running perf archive: {e}")))?;
        if !output.status.success() {
            return Err(StageError::Archive(format!(
                "perf archive exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut archive = perf_data.as_os_str().to_owned();
        archive.push(".tar.bz2");
        let archive = PathBuf::from(archive);
        if !archive.exists() {
            return Err(StageError::Archive(format!(
                "perf archive did not create {}",
                archive.display()
            )));
        }
        Ok(archive)
    }
}

/// `tar -czf`, run from the directory holding the files.
pub struct TarBundler {
    tar: PathBuf,
}

impl TarBundler {
    pub fn new(tar: impl Into<PathBuf>) -> Self {
        TarBundler { tar: tar.into() }
    }
}

impl Bundler for TarBundler {
    fn bundle(&self, files: &[PathBuf], dest: &Path) -> Result<(), StageError> {
        let Some(dir) = files.first().and_then(|f| f.parent()) else {
            return Err(StageError::Bundle("no files to bundle".to_string()));
        };
        let dir = if dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dir
        };

        let mut cmd = Command::new(&self.tar);
        cmd.arg("-czf").arg(dest).arg("-C").arg(dir);
        for file in files {
            cmd.arg(file_name(file));
        }
        let output = cmd
            .output()
            .map_err(|e| StageError::Bundle(format!("running tar: {e}")))?;
        if !output.status.success() {
            return Err(StageError::Bundle(format!(
                "tar exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// What ended the collection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TimerExpired,
    Interrupted,
    Crashed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::TimerExpired => "duration elapsed",
            StopReason::Interrupted => "interrupted",
            StopReason::Crashed => "sampler exited unexpectedly",
        };
        f.write_str(s)
    }
}

/// Which optional stages run.
#[derive(Debug, Clone, Default)]
pub struct Stages {
    pub symbol_archive: bool,
    pub bundle: bool,
    pub upload: Option<UploadConfig>,
}

/// Outcome of a finalization pass.
#[derive(Debug)]
pub struct FinalizeReport {
    pub reason: StopReason,
    pub sampler_status: Option<ExitStatus>,
    pub archive: Option<Result<PathBuf, StageError>>,
    pub bundle: Option<Result<PathBuf, StageError>>,
    pub upload: Option<Result<UploadReceipt, UploadError>>,
    /// Output files left on disk for the operator.
    pub files: Vec<PathBuf>,
}

/// Runs the finalization pipeline at most once.
pub struct Finalizer {
    latch: CleanupLatch,
    artifacts: RunArtifacts,
    stages: Stages,
    archiver: Box<dyn Archiver>,
    bundler: Box<dyn Bundler>,
    uploader: Box<dyn Uploader>,
}

impl Finalizer {
    pub fn new(
        artifacts: RunArtifacts,
        stages: Stages,
        archiver: Box<dyn Archiver>,
        bundler: Box<dyn Bundler>,
        uploader: Box<dyn Uploader>,
    ) -> Self {
        Finalizer {
            latch: CleanupLatch::new(),
            artifacts,
            stages,
            archiver,
            bundler,
            uploader,
        }
    }

    /// Run the pipeline. Returns `None` if it already ran (or is running).
    pub fn finalize(
        &self,
        process: Option<&SupervisedProcess>,
        reason: StopReason,
    ) -> Option<FinalizeReport> {
        if !self.latch.try_fire() {
            tracing::debug!("Finalization already done, ignoring {reason} trigger");
            return None;
        }
        tracing::info!("Finalizing ({reason})...");

        let sampler_status = process.and_then(|p| p.stop());
        self.write_summary(reason, process.map(SupervisedProcess::state));

        let archive = self.run_archive();
        let bundle = self.run_bundle();
        let upload = self.run_upload(bundle.as_ref());

        let files = match &bundle {
            Some(Ok(path)) => vec![path.clone()],
            _ => self.artifacts.existing_outputs(),
        };

        let report = FinalizeReport {
            reason,
            sampler_status,
            archive,
            bundle,
            upload,
            files,
        };
        print_report(&report);
        Some(report)
    }

    fn write_summary(&self, reason: StopReason, state: Option<ProcessState>) {
        let data_size = match fs::metadata(&self.artifacts.perf_data) {
            Ok(m) => format!("{} bytes", m.len()),
            Err(_) => "missing".to_string(),
        };
        let sampler = state.map_or_else(|| "unknown".to_string(), |s| s.to_string());
        let lines = [
            ("Stop reason", reason.to_string()),
            ("Sampler", sampler),
            ("Perf data", data_size),
        ];
        if let Err(e) = InfoWriter::open(&self.artifacts.info).summary(&lines) {
            tracing::warn!(
                "Could not append summary to {}: {e}",
                self.artifacts.info.display()
            );
        }
    }

    fn run_archive(&self) -> Option<Result<PathBuf, StageError>> {
        if !self.stages.symbol_archive {
            return None;
        }
        if !self.artifacts.perf_data.exists() {
            tracing::warn!("No perf data to archive symbols for");
            return None;
        }
        tracing::info!("Archiving symbols...");
        let result = self.archiver.archive(&self.artifacts.perf_data);
        match &result {
            Ok(path) => tracing::info!("Symbol archive: {}", path.display()),
            Err(e) => tracing::warn!("{e}, continuing without symbol archive"),
        }
        Some(result)
    }

    fn run_bundle(&self) -> Option<Result<PathBuf, StageError>> {
        if !self.stages.bundle {
            return None;
        }
        let files = self.artifacts.existing_outputs();
        let dest = &self.artifacts.bundle;
        tracing::info!("Bundling {} file(s) into {}...", files.len(), dest.display());

        let result = if files.is_empty() {
            Err(StageError::Bundle("no output files to bundle".to_string()))
        } else {
            self.bundler.bundle(&files, dest)
        };

        match result {
            Ok(()) => {
                for file in &files {
                    if let Err(e) = fs::remove_file(file) {
                        tracing::warn!("Could not remove {}: {e}", file.display());
                    }
                }
                Some(Ok(dest.clone()))
            }
            Err(e) => {
                tracing::warn!("{e}, keeping individual files");
                if dest.exists() {
                    let _ = fs::remove_file(dest);
                }
                Some(Err(e))
            }
        }
    }

    fn run_upload(
        &self,
        bundle: Option<&Result<PathBuf, StageError>>,
    ) -> Option<Result<UploadReceipt, UploadError>> {
        let config = self.stages.upload.as_ref()?;
        match bundle {
            Some(Ok(path)) => Some(self.uploader.upload(path, config)),
            Some(Err(_)) => {
                tracing::warn!("No bundle was created, skipping upload");
                None
            }
            None => {
                tracing::info!("Upload needs a bundle and bundling is disabled, skipping upload");
                None
            }
        }
    }
}

fn print_report(report: &FinalizeReport) {
    match &report.upload {
        Some(Ok(receipt)) => match &receipt.checksum {
            Some(sum) => tracing::info!("Upload complete (checksum {sum})"),
            None => tracing::info!("Upload complete"),
        },
        Some(Err(e)) => {
            tracing::warn!("Upload failed: {e}");
            for file in &report.files {
                tracing::warn!("Transfer manually: {}", file.display());
            }
        }
        None => {}
    }

    if !matches!(report.upload, Some(Ok(_))) {
        match &report.bundle {
            Some(Ok(path)) => tracing::info!("Bundle ready: {}", path.display()),
            _ => {
                tracing::info!("Output files:");
                for file in &report.files {
                    tracing::info!("  {}", file.display());
                }
            }
        }
    }
}
