//! The collection lifecycle controller.
//!
//! A run moves through `Init → PreflightOk → Collecting → Finalizing → Done`.
//! Anything that fails before `Collecting` exits without side effects to
//! undo. Once the sampler is running, every way out of `Collecting` (timer,
//! interrupt, sampler crash) goes through the [`Finalizer`].
//!
//! Interrupts do not finalize from the signal handler. The handler calls
//! [`StopHandle::request_stop`], which wakes the controller, and the
//! controller finalizes on its own thread. Since the controller is the only
//! finalizer, a sampler that exits while a stop is requested is a clean stop;
//! one that exits without a request has crashed.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Local;

use crate::artifacts::{local_hostname, RunArtifacts};
use crate::config::RunConfig;
use crate::cores::select_cores;
use crate::error::CollectError;
use crate::finalize::{FinalizeReport, Finalizer, PerfArchiver, Stages, StopReason, TarBundler};
use crate::info::{collect_system_info, InfoWriter};
use crate::preflight::run_preflight;
use crate::supervisor::{self, SamplerCommand, StartTiming, SupervisedProcess};
use crate::upload::HttpUploader;

/// Liveness poll interval in timed mode.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Seconds between progress notices in timed mode.
const PROGRESS_INTERVAL_SECS: u64 = 10;

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    PreflightOk,
    Collecting,
    Finalizing,
    Done,
}

enum Wake {
    Interrupted,
    SamplerExited,
}

/// Requests a graceful stop of a running collection. Cheap to clone and safe
/// to call from a signal handler thread.
#[derive(Clone)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
    tx: Sender<Wake>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Wake::Interrupted);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// How a run ended. Fatal errors before collection are returned as `Err`
/// from [`Controller::run`] instead.
#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub reason: Option<StopReason>,
    pub report: Option<FinalizeReport>,
}

/// Drives a single collection run.
pub struct Controller {
    config: RunConfig,
    timing: StartTiming,
    phase: Phase,
    stop: StopHandle,
    rx: Receiver<Wake>,
}

impl Controller {
    pub fn new(config: RunConfig) -> Self {
        let (tx, rx) = channel();
        Controller {
            config,
            timing: StartTiming::default(),
            phase: Phase::Init,
            stop: StopHandle {
                requested: Arc::new(AtomicBool::new(false)),
                tx,
            },
            rx,
        }
    }

    pub fn with_start_timing(mut self, timing: StartTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!("Lifecycle: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Run the whole collection.
    pub fn run(mut self) -> Result<RunOutcome, CollectError> {
        self.config.validate()?;
        let preflight = run_preflight(&mut self.config)?;
        self.enter(Phase::PreflightOk);

        let config = &self.config;
        fs::create_dir_all(&config.output_dir).map_err(|e| {
            CollectError::io(
                format!("creating output directory {}", config.output_dir.display()),
                e,
            )
        })?;
        let hostname = local_hostname();
        let artifacts = RunArtifacts::new(
            &config.output_dir,
            &hostname,
            config.label.as_deref(),
            Local::now(),
        );
        let cores = select_cores(
            config.core_mode,
            config.core_list.as_deref(),
            &config.cmdline_path,
        )?;

        let info = InfoWriter::create(&artifacts, config, &cores).map_err(|e| {
            CollectError::io(format!("writing {}", artifacts.info.display()), e)
        })?;
        collect_system_info(
            &info,
            config,
            &config.cmdline_path,
            preflight.lscpu.as_deref(),
            preflight.turbostat.as_deref(),
        );

        if self.stop.is_requested() {
            tracing::warn!("Interrupted before sampling started, nothing to finalize");
            return Ok(RunOutcome {
                exit_code: 0,
                reason: Some(StopReason::Interrupted),
                report: None,
            });
        }

        let cmd = SamplerCommand::perf_record(
            &preflight.perf,
            &config.events,
            &config.perf_args,
            &cores,
            &artifacts.perf_data,
        );
        tracing::info!("Starting sampler on cores: {cores}");
        let process = Arc::new(supervisor::start(&cmd, self.timing)?);

        let stages = Stages {
            symbol_archive: config.symbol_archive,
            bundle: config.bundle,
            upload: config.upload.then(|| config.upload_config.clone()),
        };
        let tar = preflight.tar.unwrap_or_else(|| config.toolchain.tar.clone().into());
        let finalizer = Finalizer::new(
            artifacts,
            stages,
            Box::new(PerfArchiver::new(preflight.perf.clone())),
            Box::new(TarBundler::new(tar)),
            Box::new(HttpUploader::new(hostname)),
        );

        self.enter(Phase::Collecting);
        let reason = if self.config.duration == 0 {
            self.wait_manual(&process)
        } else {
            self.wait_timed(&process)
        };

        self.enter(Phase::Finalizing);
        if reason == StopReason::Crashed {
            let err = CollectError::Crash {
                status: process.exit_status(),
            };
            tracing::error!("{err}");
        }
        let report = finalizer.finalize(Some(process.as_ref()), reason);
        self.enter(Phase::Done);

        Ok(RunOutcome {
            exit_code: if reason == StopReason::Crashed { 1 } else { 0 },
            reason: Some(reason),
            report,
        })
    }

    /// Block until interrupted or the sampler exits on its own.
    fn wait_manual(&self, process: &Arc<SupervisedProcess>) -> StopReason {
        tracing::info!("Collecting until interrupted, press Ctrl-C to stop");

        let waiter = process.clone();
        let tx = self.stop.tx.clone();
        thread::spawn(move || {
            waiter.wait();
            let _ = tx.send(Wake::SamplerExited);
        });

        match self.rx.recv() {
            Ok(Wake::Interrupted) => StopReason::Interrupted,
            Ok(Wake::SamplerExited) | Err(_) => {
                if self.stop.is_requested() {
                    StopReason::Interrupted
                } else {
                    StopReason::Crashed
                }
            }
        }
    }

    /// Poll liveness once per second for up to `duration` seconds.
    fn wait_timed(&self, process: &SupervisedProcess) -> StopReason {
        let duration = self.config.duration;
        tracing::info!("Collecting for {duration} seconds, press Ctrl-C to stop early");

        for elapsed in 1..=duration {
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(Wake::Interrupted) => return StopReason::Interrupted,
                Ok(Wake::SamplerExited) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {}
            }

            if !process.is_alive() {
                if self.stop.is_requested() {
                    tracing::info!("Sampler stopped after interrupt");
                    return StopReason::Interrupted;
                }
                return StopReason::Crashed;
            }

            if elapsed % PROGRESS_INTERVAL_SECS == 0 && elapsed < duration {
                tracing::info!(
                    "Collecting... {elapsed}s elapsed, {}s remaining",
                    duration - elapsed
                );
            }
        }
        StopReason::TimerExpired
    }
}
