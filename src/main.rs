use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use perfcollect::config::{
    DEFAULT_EVENTS, DEFAULT_TURBOSTAT_ITERATIONS, DEFAULT_UPLOAD_TIMEOUT_SECS,
};
use perfcollect::{Controller, CoreMode, RunConfig, Toolchain, UploadConfig};

/// Record hardware performance counters with perf and bundle the results.
#[derive(Debug, Parser)]
#[command(name = "perfcollect", version, disable_version_flag = true)]
struct Cli {
    /// Print version
    #[arg(short = 'v', long, action = ArgAction::Version)]
    version: Option<bool>,
    /// Increase log verbosity (repeatable)
    #[arg(long, action = ArgAction::Count)]
    verbose: u8,
    /// perf event list
    #[arg(short, long, default_value = DEFAULT_EVENTS)]
    events: String,
    /// Seconds to collect for, 0 collects until Ctrl-C
    #[arg(short, long, default_value = "0")]
    duration: u64,
    /// Label added to output file names
    #[arg(short, long)]
    label: Option<String>,
    /// Directory for output files
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,
    /// Core selection: auto (isolcpus), all, or manual
    #[arg(short, long)]
    cores: Option<CoreMode>,
    /// Cores for manual mode, e.g. 1-30,33-62 (implies --cores manual)
    #[arg(long)]
    core_list: Option<String>,
    /// Extra flags passed to perf record, e.g. "-F 999 -g"
    #[arg(long, allow_hyphen_values = true)]
    perf_args: Option<String>,
    /// Collect turbostat output (default)
    #[arg(long, overrides_with = "no_turbostat")]
    turbostat: bool,
    /// Skip turbostat collection
    #[arg(long, overrides_with = "turbostat")]
    no_turbostat: bool,
    /// Number of one-second turbostat samples
    #[arg(long, default_value_t = DEFAULT_TURBOSTAT_ITERATIONS)]
    turbostat_iterations: u32,
    /// Keep individual output files instead of a tarball
    #[arg(long)]
    no_bundle: bool,
    /// Run perf archive to capture symbols
    #[arg(long)]
    archive: bool,
    /// Upload the bundle when done
    #[arg(long)]
    upload: bool,
    /// Collector endpoint for --upload
    #[arg(long, env = "PERFCOLLECT_UPLOAD_URL")]
    upload_url: Option<String>,
    /// Bearer token for --upload
    #[arg(long, env = "PERFCOLLECT_UPLOAD_TOKEN", hide_env_values = true)]
    upload_token: Option<String>,
    /// Upload timeout in seconds
    #[arg(long, default_value_t = DEFAULT_UPLOAD_TIMEOUT_SECS)]
    upload_timeout: u64,
}

impl Cli {
    fn into_config(self) -> RunConfig {
        let core_mode = match (self.cores, &self.core_list) {
            (Some(mode), _) => mode,
            (None, Some(_)) => CoreMode::Manual,
            (None, None) => CoreMode::Auto,
        };

        RunConfig {
            events: self.events,
            duration: self.duration,
            label: self.label,
            output_dir: self.output_dir,
            core_mode,
            core_list: self.core_list,
            perf_args: self
                .perf_args
                .map(|args| args.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            turbostat: !self.no_turbostat,
            turbostat_iterations: self.turbostat_iterations,
            bundle: !self.no_bundle,
            symbol_archive: self.archive,
            upload: self.upload,
            upload_config: UploadConfig {
                endpoint: self.upload_url.unwrap_or_default(),
                token: self.upload_token,
                timeout: Duration::from_secs(self.upload_timeout),
            },
            toolchain: Toolchain::from_env(),
            ..Default::default()
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let controller = Controller::new(cli.into_config());
    let stop = controller.stop_handle();
    // Covers SIGINT and SIGTERM (ctrlc "termination" feature).
    if let Err(e) = ctrlc::set_handler(move || {
        if !stop.is_requested() {
            tracing::info!("Stop requested, finishing up...");
        }
        stop.request_stop();
    }) {
        tracing::warn!("Could not install signal handler: {e}");
    }

    let exit_code = match controller.run() {
        Ok(outcome) => outcome.exit_code,
        Err(e) => {
            tracing::error!("{e}");
            e.exit_code()
        }
    };
    process::exit(exit_code);
}
