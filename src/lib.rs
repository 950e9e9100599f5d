//! perfcollect library - drives a single `perf record` collection run.
//!
//! # Modules
//!
//! - [`lifecycle`] - the run controller: preflight, start, wait, finalize
//! - [`cores`] - target core selection, including `isolcpus=` detection
//! - [`supervisor`] - starting, watching and stopping the sampler process
//! - [`finalize`] - symbol archive, bundle and upload stages
//! - [`upload`] - multipart upload of the bundle
//! - [`info`] - the human-readable info file
//!
//! # Example
//!
//! ```no_run
//! use perfcollect::{Controller, RunConfig};
//!
//! let config = RunConfig {
//!     duration: 30,
//!     ..Default::default()
//! };
//! let outcome = Controller::new(config).run().expect("collection failed");
//! std::process::exit(outcome.exit_code);
//! ```

pub mod artifacts;
pub mod config;
pub mod cores;
pub mod error;
pub mod finalize;
pub mod info;
pub mod lifecycle;
pub mod preflight;
pub mod supervisor;
pub mod upload;

pub use artifacts::RunArtifacts;
pub use config::{CoreMode, RunConfig, Toolchain, UploadConfig};
pub use cores::CoreSet;
pub use error::{CollectError, StageError, StartError, UploadError};
pub use finalize::{FinalizeReport, StopReason};
pub use lifecycle::{Controller, RunOutcome, StopHandle};
