//! The capture server as a supervised child process.

use crate::client::{CaptureClient, Connector, UnixConnector};
use crate::error::{Error, ProcessError};
use crate::protocol::{self, Event};
use crate::stats::CaptureStats;
use crate::stderr::{Copier, SyncBuf, pipe};
use config::Mutator;
use flume::{Receiver, Selector, Sender, TrySendError};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use sysconfig::InstallLayout;
use tracing::{debug, info, trace, warn};

/// Capacity of the public error and stats streams.
pub const CHANNEL_CAPACITY: usize = 10;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MTU_LIMIT: u32 = 1500;
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(15);
pub const MIN_STATS_INTERVAL: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const REAP_INTERVAL: Duration = Duration::from_millis(20);
/// Longer stderr lines are cut here; the rest of the line is skipped.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;
/// How long a failed start waits for the rest of the child's stderr.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct Options {
    /// `None` waits for the capture server indefinitely.
    pub start_timeout: Option<Duration>,
    /// Applied to every request. Zero selects [`DEFAULT_REQUEST_TIMEOUT`].
    pub request_timeout: Duration,
    /// Zero selects [`DEFAULT_MTU_LIMIT`].
    pub mtu_limit: u32,
    /// Zero selects [`DEFAULT_STATS_INTERVAL`]; anything shorter than
    /// [`MIN_STATS_INTERVAL`] is raised to it.
    pub stats_interval: Duration,
    pub mutator: Mutator,
    pub connector: Arc<dyn Connector>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            start_timeout: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            mtu_limit: DEFAULT_MTU_LIMIT,
            stats_interval: DEFAULT_STATS_INTERVAL,
            mutator: Mutator::NoOp,
            connector: Arc::new(UnixConnector::default()),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("start_timeout", &self.start_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("mtu_limit", &self.mtu_limit)
            .field("stats_interval", &self.stats_interval)
            .field("mutator", &self.mutator)
            .finish_non_exhaustive()
    }
}

impl Options {
    pub fn from_config(capture: &config::Capture) -> Self {
        Self {
            start_timeout: capture.start_timeout,
            request_timeout: capture.request_timeout,
            mtu_limit: capture.mtu_limit,
            stats_interval: capture.stats_interval,
            mutator: capture.mutator,
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        if self.request_timeout.is_zero() {
            DEFAULT_REQUEST_TIMEOUT
        } else {
            self.request_timeout
        }
    }

    pub fn mtu_limit(&self) -> u32 {
        if self.mtu_limit == 0 {
            DEFAULT_MTU_LIMIT
        } else {
            self.mtu_limit
        }
    }

    pub fn stats_interval(&self) -> Duration {
        if self.stats_interval.is_zero() {
            DEFAULT_STATS_INTERVAL
        } else {
            self.stats_interval.max(MIN_STATS_INTERVAL)
        }
    }

    fn command_line(&self, socket: &Path, capture_bytes: usize, save_bytes: usize) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(16);
        args.push("--socket-file".into());
        args.push(socket.as_os_str().to_owned());
        for (flag, value) in [
            ("--capture-bytes", capture_bytes.to_string()),
            ("--save-bytes", save_bytes.to_string()),
            ("--mtu-limit", self.mtu_limit().to_string()),
            (
                "--stats-interval",
                format!("{}ms", self.stats_interval().as_millis()),
            ),
            ("--error-prefix", protocol::ERROR_PREFIX.to_string()),
            ("--stats-prefix", protocol::STATS_PREFIX.to_string()),
        ] {
            args.push(flag.into());
            args.push(value.into());
        }
        args.push(format!("--strip-app-layer={}", self.mutator.strips_app_layer()).into());
        args
    }
}

struct Outputs {
    closed: bool,
    errors: Option<Sender<ProcessError>>,
    stats: Option<Sender<CaptureStats>>,
}

/// The child is only reaped, and only signalled, with this lock held, so a
/// kill can never reach a recycled pid.
struct Reaper {
    child: Child,
    exited: bool,
}

/// State shared with the helper threads.
struct Shared {
    outputs: Mutex<Outputs>,
    reaper: Mutex<Reaper>,
    cancel_poll: AtomicBool,
}

impl Shared {
    fn send_error(&self, err: ProcessError) {
        let outputs = self.outputs.lock();
        if outputs.closed {
            trace!(%err, "discarding error after close");
            return;
        }
        if let Some(tx) = &outputs.errors {
            if let Err(TrySendError::Full(err)) = tx.try_send(err) {
                debug!(%err, "error queue full; dropping");
            }
        }
    }

    fn send_stats(&self, stats: CaptureStats) {
        let outputs = self.outputs.lock();
        if outputs.closed {
            return;
        }
        if let Some(tx) = &outputs.stats {
            if tx.try_send(stats).is_err() {
                debug!("stats queue full; dropping");
            }
        }
    }

    /// Returns false if already closed.
    fn mark_closed(&self) -> bool {
        let mut outputs = self.outputs.lock();
        if outputs.closed {
            return false;
        }
        outputs.closed = true;
        outputs.errors = None;
        outputs.stats = None;
        true
    }
}

enum StartOutcome {
    Ready,
    Failed(ProcessError),
    TimedOut,
}

/// A running capture server.
///
/// Errors and statistics arrive on bounded streams. Delivery never blocks
/// the process: when a stream is full, new events are dropped. Both streams
/// disconnect once the process is closed.
pub struct CaptureProcess {
    pid: Pid,
    socket: PathBuf,
    client: Arc<dyn CaptureClient>,
    errors: Receiver<ProcessError>,
    stats: Receiver<CaptureStats>,
    shared: Arc<Shared>,
}

impl CaptureProcess {
    /// Start the capture server installed in `install_dir` and wait until it
    /// answers a health check.
    pub fn start(
        capture_bytes: usize,
        save_bytes: usize,
        install_dir: &Path,
        options: &Options,
    ) -> Result<Self, Error> {
        let binary = InstallLayout::new(install_dir).capture_server();
        match std::fs::metadata(&binary) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotInstalled(binary));
            }
            Err(err) => return Err(Error::Stat(err)),
        }

        let socket = reserve_socket_path().map_err(Error::Socket)?;
        let args = options.command_line(&socket, capture_bytes, save_bytes);
        let client = options
            .connector
            .connect(&socket, options.request_timeout())?;

        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Error::Spawn)?;
        let pid = Pid::from_raw(child.id() as i32);
        debug!(%pid, ?binary, ?args, "capture server spawned");
        let stderr = child.stderr.take();
        let reaper = Reaper {
            child,
            exited: false,
        };

        let (errors_tx, errors) = flume::bounded(CHANNEL_CAPACITY);
        let (stats_tx, stats) = flume::bounded(CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            outputs: Mutex::new(Outputs {
                closed: false,
                errors: Some(errors_tx),
                stats: Some(stats_tx),
            }),
            reaper: Mutex::new(reaper),
            cancel_poll: AtomicBool::new(false),
        });
        // From here on, dropping `process` kills the child.
        let process = CaptureProcess {
            pid,
            socket,
            client,
            errors,
            stats,
            shared,
        };

        {
            let shared = Arc::clone(&process.shared);
            spawn("capture-wait", move || wait_for_exit(&shared))?;
        }

        let stderr = stderr.ok_or_else(|| Error::Spawn(io::Error::other("stderr not captured")))?;
        let buffer = SyncBuf::default();
        let copier = {
            let shared = Arc::clone(&process.shared);
            Copier::spawn("capture-stderr", stderr, buffer.clone(), move |err| {
                shared.send_error(err)
            })
            .map_err(Error::Thread)?
        };

        let (ready_tx, ready) = flume::bounded(1);
        {
            let client = Arc::clone(&process.client);
            let shared = Arc::clone(&process.shared);
            spawn("capture-poll", move || {
                poll_until_healthy(client.as_ref(), &shared, ready_tx)
            })?;
        }

        match process.wait_ready(&ready, options.start_timeout) {
            StartOutcome::Ready => {}
            outcome => {
                process.abort(&copier);
                let stderr = buffer.snapshot();
                return Err(match outcome {
                    StartOutcome::Failed(source) => Error::StartFailed { source, stderr },
                    _ => Error::StartTimeout { stderr },
                });
            }
        }

        let (live_tx, live) = pipe();
        copier.switch_to(live_tx);
        {
            let shared = Arc::clone(&process.shared);
            spawn("capture-watch", move || watch(buffer.chain(live), &shared))?;
        }

        info!(%pid, socket = ?process.socket, "capture server ready");
        Ok(process)
    }

    fn wait_ready(&self, ready: &Receiver<()>, timeout: Option<Duration>) -> StartOutcome {
        let selector = Selector::new()
            .recv(&self.errors, |res| match res {
                Ok(err) => StartOutcome::Failed(err),
                Err(_) => StartOutcome::Failed(ProcessError::Stopped("error stream closed")),
            })
            .recv(ready, |res| match res {
                Ok(()) => StartOutcome::Ready,
                Err(_) => StartOutcome::Failed(ProcessError::Stopped("health check stopped")),
            });
        match timeout {
            Some(timeout) => selector
                .wait_timeout(timeout)
                .unwrap_or(StartOutcome::TimedOut),
            None => selector.wait(),
        }
    }

    /// Kill the process, then give the copier a moment to collect whatever
    /// the process wrote before dying.
    fn abort(&self, copier: &Copier) {
        if let Err(err) = self.close() {
            warn!(%err, "failed to kill capture server after failed start");
        }
        if !copier.wait_drained(STDERR_DRAIN) {
            debug!("stderr still open after kill");
        }
        copier.stop();
    }

    /// Asynchronous errors: lines the server reported, undecodable stats,
    /// stderr read failures and the death of the process.
    pub fn errors(&self) -> &Receiver<ProcessError> {
        &self.errors
    }

    pub fn stats(&self) -> &Receiver<CaptureStats> {
        &self.stats
    }

    pub fn client(&self) -> &dyn CaptureClient {
        self.client.as_ref()
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Kill the process and disconnect both streams. Safe to call from
    /// several threads; only the first call does anything.
    pub fn close(&self) -> Result<(), Error> {
        if !self.shared.mark_closed() {
            return Ok(());
        }
        self.shared.cancel_poll.store(true, Ordering::SeqCst);
        match std::fs::remove_file(&self.socket) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => {
                debug!(%err, socket = ?self.socket, "failed to remove socket");
            }
            _ => {}
        }

        let reaper = self.shared.reaper.lock();
        if reaper.exited {
            debug!(pid = %self.pid, "capture server already exited");
            return Ok(());
        }
        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {
                debug!(pid = %self.pid, "capture server killed");
                Ok(())
            }
            Err(err) => Err(Error::Kill(err)),
        }
    }
}

impl Drop for CaptureProcess {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "failed to close capture server");
        }
    }
}

fn spawn<F>(name: &str, f: F) -> Result<(), Error>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .map(|_| ())
        .map_err(Error::Thread)
}

/// A fresh path in the temp directory, not yet existing.
fn reserve_socket_path() -> io::Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("capture-helper-")
        .suffix(".sock")
        .tempfile()?;
    let path = file.path().to_path_buf();
    file.close()?;
    Ok(path)
}

/// Poll rather than block in `wait`, so that `close` can take the lock
/// between polls.
fn try_reap(shared: &Shared) -> Option<io::Result<ExitStatus>> {
    let mut reaper = shared.reaper.lock();
    let status = reaper.child.try_wait().transpose()?;
    reaper.exited = true;
    Some(status)
}

fn wait_for_exit(shared: &Shared) {
    let status = loop {
        if let Some(status) = try_reap(shared) {
            break status;
        }
        thread::sleep(REAP_INTERVAL);
    };
    match status {
        Ok(status) if status.success() => debug!("capture server exited"),
        Ok(status) => {
            debug!(%status, "capture server died");
            shared.send_error(ProcessError::Died(status));
        }
        Err(err) => shared.send_error(ProcessError::Wait(err)),
    }
}

fn poll_until_healthy(client: &dyn CaptureClient, shared: &Shared, ready: Sender<()>) {
    loop {
        thread::sleep(POLL_INTERVAL);
        if shared.cancel_poll.load(Ordering::SeqCst) {
            return;
        }
        match client.check_health() {
            Ok(()) => {
                let _ = ready.send(());
                return;
            }
            Err(err) => trace!(%err, "capture server not ready"),
        }
    }
}

/// Read one line of at most `limit` bytes into `line`. The remainder of an
/// overlong line is discarded. Returns false at EOF.
fn read_line_capped(
    reader: &mut impl BufRead,
    line: &mut Vec<u8>,
    limit: usize,
) -> io::Result<bool> {
    line.clear();
    let n = reader.by_ref().take(limit as u64).read_until(b'\n', line)?;
    if n == 0 {
        return Ok(false);
    }
    if n == limit && line.last() != Some(&b'\n') {
        let skipped = reader.skip_until(b'\n')?;
        trace!(skipped, "truncated overlong stderr line");
    }
    Ok(true)
}

fn watch(stderr: impl Read, shared: &Shared) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        match read_line_capped(&mut reader, &mut line, MAX_LINE_LENGTH) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                shared.send_error(ProcessError::Stderr(err));
                break;
            }
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\n', '\r']);
        match protocol::parse_line(text) {
            Some(Event::Error(err)) => shared.send_error(err),
            Some(Event::Stats(stats)) => shared.send_stats(stats),
            None => trace!(line = text, "capture server said"),
        }
    }
    debug!("capture server stderr closed");
}
