//! Common test utilities for perfcollect integration tests.
//!
//! [`ToolEnv`] writes fake `perf` and `tar` scripts into a temporary
//! directory so a full run can be driven without root or real counters.
//! [`CollectorStub`] is a one-endpoint HTTP server answering every request
//! with a canned status.

#![allow(dead_code)]

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use perfcollect::supervisor::StartTiming;
use perfcollect::{RunConfig, Toolchain};
use tempfile::TempDir;

/// How the fake sampler behaves once started with `record`.
#[derive(Debug, Clone, Copy)]
pub enum Sampler {
    /// Writes its output file and runs until SIGINT.
    UntilInterrupted,
    /// Writes its output file and exits with status 1 after the given time.
    CrashAfter(Duration),
    /// Runs until SIGINT without ever creating its output file.
    NoOutput,
}

/// Fake tool directory plus a separate output directory.
pub struct ToolEnv {
    pub tools: TempDir,
    pub out: TempDir,
    pub perf: PathBuf,
    pub tar: PathBuf,
    pub cmdline: PathBuf,
}

impl ToolEnv {
    pub fn new(sampler: Sampler) -> Self {
        let tools = TempDir::new().expect("Failed to create tool dir");
        let out = TempDir::new().expect("Failed to create output dir");
        let perf = tools.path().join("perf");
        write_script(&perf, &perf_script(sampler, &tools.path().join("perf.log")));
        let tar = tools.path().join("tar");
        write_script(&tar, "#!/bin/sh\nexec tar \"$@\"\n");
        let cmdline = tools.path().join("cmdline");
        fs::write(&cmdline, "BOOT_IMAGE=/vmlinuz ro quiet isolcpus=domain,2-3\n")
            .expect("Failed to write cmdline");

        ToolEnv {
            tools,
            out,
            perf,
            tar,
            cmdline,
        }
    }

    /// Replace the tar wrapper with one that always fails.
    pub fn break_tar(&self) {
        write_script(&self.tar, "#!/bin/sh\necho 'tar: No space left on device' >&2\nexit 2\n");
    }

    /// A config pointing at the fake tools, without root or turbostat.
    pub fn config(&self, duration: u64) -> RunConfig {
        RunConfig {
            duration,
            output_dir: self.out.path().to_path_buf(),
            toolchain: Toolchain {
                perf: self.perf.display().to_string(),
                tar: self.tar.display().to_string(),
                turbostat: self.tools.path().join("turbostat").display().to_string(),
                lscpu: self.tools.path().join("lscpu").display().to_string(),
            },
            require_root: false,
            cmdline_path: self.cmdline.clone(),
            ..Default::default()
        }
    }

    /// Every invocation of the fake perf, one argv per line.
    pub fn perf_calls(&self) -> Vec<String> {
        fs::read_to_string(self.tools.path().join("perf.log"))
            .map(|s| s.lines().map(String::from).collect())
            .unwrap_or_default()
    }

    /// Names of all files in the output directory, sorted.
    pub fn output_files(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.out.path())
            .expect("Failed to read output dir")
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Wait until a `*.data` file shows up in the output directory.
    pub fn wait_for_perf_data(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.output_files().iter().any(|n| n.ends_with(".data")) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }
}

pub fn fast_start() -> StartTiming {
    StartTiming {
        liveness_delay: Duration::from_millis(300),
        output_delay: Duration::from_millis(300),
    }
}

fn perf_script(sampler: Sampler, log: &Path) -> String {
    let body = match sampler {
        Sampler::UntilInterrupted => {
            "echo PERFDATA > \"$out\"\nwhile true; do sleep 0.05; done\n".to_string()
        }
        Sampler::CrashAfter(after) => format!(
            "echo PERFDATA > \"$out\"\ni=0\nwhile [ $i -lt {} ]; do sleep 0.05; i=$((i+1)); done\nexit 1\n",
            after.as_millis() / 50
        ),
        Sampler::NoOutput => "while true; do sleep 0.05; done\n".to_string(),
    };

    format!(
        r#"#!/bin/sh
echo "$*" >> "{log}"
case "$1" in
    --version) echo "perf version 6.8.fake"; exit 0 ;;
    archive) echo SYMBOLS > "$2.tar.bz2"; exit 0 ;;
    record) ;;
    *) exit 1 ;;
esac
out=""
while [ $# -gt 0 ]; do
    if [ "$1" = "-o" ]; then out="$2"; fi
    shift
done
trap 'echo STOPPED >> "$out"; exit 0' INT
{body}"#,
        log = log.display()
    )
}

fn write_script(path: &Path, contents: &str) {
    fs::write(path, contents).expect("Failed to write script");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("Failed to chmod");
}

/// Minimal HTTP collector that answers every request with `status` and
/// `body`, recording each raw request.
pub struct CollectorStub {
    pub url: String,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl CollectorStub {
    pub fn new(status: u16, body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind collector stub");
        let url = format!("http://{}/upload", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let body = body.to_string();
        let thread_hits = hits.clone();
        let thread_requests = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                thread_hits.fetch_add(1, Ordering::SeqCst);
                if let Ok(request) = serve(stream, status, &body) {
                    thread_requests.lock().unwrap().push(request);
                }
            }
        });

        CollectorStub {
            url,
            hits,
            requests,
        }
    }

    /// A collector that accepts connections and never answers.
    pub fn silent() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind collector stub");
        let url = format!("http://{}/upload", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));

        let thread_hits = hits.clone();
        thread::spawn(move || {
            // keep every connection open so the client only sees silence
            let mut held = Vec::new();
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                thread_hits.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        CollectorStub {
            url,
            hits,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

fn serve(stream: TcpStream, status: u16, body: &str) -> std::io::Result<String> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut head = String::new();
    let mut content_length = None;
    let mut chunked = false;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let lower = line.to_ascii_lowercase();
        if let Some(len) = lower.strip_prefix("content-length:") {
            content_length = len.trim().parse::<usize>().ok();
        }
        if lower.starts_with("transfer-encoding:") && lower.contains("chunked") {
            chunked = true;
        }
        head.push_str(&line);
        if line == "\r\n" {
            break;
        }
    }

    let mut payload = Vec::new();
    if let Some(len) = content_length {
        payload.resize(len, 0);
        reader.read_exact(&mut payload)?;
    } else if chunked {
        let mut byte = [0u8; 1];
        while !payload.ends_with(b"0\r\n\r\n") {
            if reader.read(&mut byte)? == 0 {
                break;
            }
            payload.push(byte[0]);
        }
    }

    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Status",
    };
    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )?;
    stream.flush()?;

    head.push_str(&String::from_utf8_lossy(&payload));
    Ok(head)
}
