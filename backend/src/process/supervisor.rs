//! Process supervisor owning every live child process

use super::signal;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Number of stderr lines kept for diagnostics
const STDERR_TAIL_LINES: usize = 200;

/// Buffered output lines per process before readers wait on the consumer
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// How long a forced kill may take before the handle is released anyway
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for pipes to drain after the child has been reaped.
/// Grandchildren that inherited the pipes can keep them open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Supervisor-level failures
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be spawned at all
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} was not captured")]
    MissingPipe(&'static str),

    /// The process ignored both the graceful stop and the forced kill
    #[error("process {pid:?} did not confirm exit after being killed")]
    Unconfirmed { pid: Option<u32> },
}

impl ProcessError {
    /// True when spawning failed because the executable does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }

    /// True when spawning failed because the executable is not permitted to run
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Spawn { source, .. } if source.kind() == std::io::ErrorKind::PermissionDenied)
    }
}

/// A fully resolved command line. Arguments are passed to the OS as-is,
/// never through a shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Reference to a supervised process. Holding one grants no control over
/// the OS process; all control goes back through the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    pub id: u64,
    pub pid: Option<u32>,
    /// Id of the download item this process serves
    pub owner: String,
    pub program: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Everything a consumer observes from a supervised process.
/// `Exited` is always the last event.
#[derive(Debug)]
pub enum ProcessEvent {
    Line { stream: OutputStream, text: String },
    Exited(ExitReport),
}

#[derive(Debug, Clone)]
pub struct ExitReport {
    /// `None` if waiting on the child failed
    pub status: Option<ExitStatus>,
    /// Termination was requested through the supervisor
    pub stopped: bool,
    /// Last lines written to stderr, oldest first
    pub stderr_tail: Vec<String>,
    pub runtime: Duration,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        !self.stopped && self.status.is_some_and(|s| s.success())
    }

    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// Output stream of one supervised process
pub struct ProcessOutput {
    rx: mpsc::Receiver<ProcessEvent>,
}

impl ProcessOutput {
    /// Next output line or the exit report. Returns `None` after `Exited`.
    pub async fn next(&mut self) -> Option<ProcessEvent> {
        self.rx.recv().await
    }
}

struct Control {
    stop_requested: AtomicBool,
    kill: Notify,
}

struct LiveProcess {
    handle: ProcessHandle,
    control: Arc<Control>,
    exited: watch::Receiver<bool>,
}

struct SupervisorInner {
    live: Mutex<HashMap<u64, LiveProcess>>,
    next_id: AtomicU64,
}

/// Owner of every child process started by the application
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                live: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Spawn a process and register it in the live set.
    ///
    /// Must be called from within a Tokio runtime. Spawn failures are
    /// returned synchronously and nothing is registered for them.
    pub fn start(
        &self,
        owner: &str,
        spec: &CommandSpec,
    ) -> Result<(ProcessHandle, ProcessOutput), ProcessError> {
        let program = spec.program.display().to_string();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        command.process_group(0);

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = command.spawn().map_err(|source| {
            warn!("Failed to start {}: {}", program, source);
            ProcessError::Spawn {
                program: program.clone(),
                source,
            }
        })?;

        let stdout = child.stdout.take().ok_or(ProcessError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ProcessError::MissingPipe("stderr"))?;

        let handle = ProcessHandle {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            pid: child.id(),
            owner: owner.to_string(),
            program,
            started_at: Utc::now(),
        };

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exited_tx, exited_rx) = watch::channel(false);
        let control = Arc::new(Control {
            stop_requested: AtomicBool::new(false),
            kill: Notify::new(),
        });

        self.inner.live.lock().insert(
            handle.id,
            LiveProcess {
                handle: handle.clone(),
                control: Arc::clone(&control),
                exited: exited_rx,
            },
        );

        let tail = Arc::new(Mutex::new(VecDeque::new()));
        let readers = vec![
            spawn_reader(stdout, OutputStream::Stdout, tx.clone(), None),
            spawn_reader(stderr, OutputStream::Stderr, tx.clone(), Some(Arc::clone(&tail))),
        ];

        info!(
            "Started {} (pid {:?}) for {}",
            handle.program, handle.pid, handle.owner
        );

        tokio::spawn(monitor(Monitor {
            inner: Arc::clone(&self.inner),
            child,
            handle: handle.clone(),
            control,
            exited_tx,
            readers,
            tail,
            tx,
        }));

        Ok((handle, ProcessOutput { rx }))
    }

    /// Stop a process: graceful signal, wait up to `grace`, then kill.
    ///
    /// Returns once the process is confirmed exited and released. Unknown or
    /// already-exited handles are a no-op.
    pub async fn terminate(
        &self,
        handle: &ProcessHandle,
        grace: Duration,
    ) -> Result<(), ProcessError> {
        let (control, mut exited) = match self.inner.live.lock().get(&handle.id) {
            Some(live) => (Arc::clone(&live.control), live.exited.clone()),
            None => return Ok(()),
        };

        if *exited.borrow() {
            return Ok(());
        }

        control.stop_requested.store(true, Ordering::SeqCst);

        if let Some(pid) = handle.pid {
            debug!("Requesting stop of pid {}", pid);
            if let Err(e) = signal::request_stop(pid).await {
                debug!("Graceful stop of pid {} failed: {}", pid, e);
            }
        }

        if wait_exited(&mut exited, grace).await {
            return Ok(());
        }

        warn!(
            "{} (pid {:?}) still running after {:?}, killing",
            handle.program, handle.pid, grace
        );
        control.kill.notify_one();

        if wait_exited(&mut exited, KILL_CONFIRM_TIMEOUT).await {
            return Ok(());
        }

        // Never keep an entry that cannot be reaped.
        self.inner.live.lock().remove(&handle.id);
        error!("{} (pid {:?}) did not die", handle.program, handle.pid);
        Err(ProcessError::Unconfirmed { pid: handle.pid })
    }

    /// Terminate every live process concurrently. Completes within roughly
    /// `grace` plus the kill confirmation timeout regardless of how many
    /// processes hang.
    pub async fn terminate_all(&self, grace: Duration) {
        let handles: Vec<ProcessHandle> = self
            .inner
            .live
            .lock()
            .values()
            .map(|live| live.handle.clone())
            .collect();

        if handles.is_empty() {
            return;
        }

        info!("Terminating {} live processes", handles.len());

        let results = join_all(handles.iter().map(|h| self.terminate(h, grace))).await;
        for err in results.into_iter().filter_map(Result::err) {
            error!("Shutdown termination failed: {}", err);
        }
    }

    /// Number of processes currently alive
    pub fn live_count(&self) -> usize {
        self.inner.live.lock().len()
    }

    /// Snapshot of the live set
    pub fn live(&self) -> Vec<ProcessHandle> {
        let mut handles: Vec<ProcessHandle> = self
            .inner
            .live
            .lock()
            .values()
            .map(|live| live.handle.clone())
            .collect();
        handles.sort_by_key(|h| h.id);
        handles
    }

    pub fn is_live(&self, handle: &ProcessHandle) -> bool {
        self.inner.live.lock().contains_key(&handle.id)
    }
}

async fn wait_exited(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    // A dropped sender also means the monitor is done with the child.
    tokio::time::timeout(limit, exited.wait_for(|done| *done))
        .await
        .is_ok()
}

struct Monitor {
    inner: Arc<SupervisorInner>,
    child: Child,
    handle: ProcessHandle,
    control: Arc<Control>,
    exited_tx: watch::Sender<bool>,
    readers: Vec<JoinHandle<()>>,
    tail: Arc<Mutex<VecDeque<String>>>,
    tx: mpsc::Sender<ProcessEvent>,
}

/// Owns the child until it is reaped, then releases it from the live set
/// and publishes the exit report after the output pipes are drained.
async fn monitor(mut m: Monitor) {
    let started = Instant::now();

    let status = tokio::select! {
        status = m.child.wait() => status,
        _ = m.control.kill.notified() => {
            if let Some(pid) = m.handle.pid {
                if let Err(e) = signal::force_kill(pid).await {
                    debug!("Tree kill of pid {} failed: {}", pid, e);
                }
            }
            if let Err(e) = m.child.start_kill() {
                debug!("Kill of pid {:?} failed: {}", m.handle.pid, e);
            }
            m.child.wait().await
        }
    };

    m.inner.live.lock().remove(&m.handle.id);
    let _ = m.exited_tx.send(true);

    let status = match status {
        Ok(status) => Some(status),
        Err(e) => {
            error!("Error waiting for pid {:?}: {}", m.handle.pid, e);
            None
        }
    };

    for mut reader in m.readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            debug!("Output of pid {:?} still open after exit", m.handle.pid);
            reader.abort();
        }
    }

    let report = ExitReport {
        status,
        stopped: m.control.stop_requested.load(Ordering::SeqCst),
        stderr_tail: m.tail.lock().iter().cloned().collect(),
        runtime: started.elapsed(),
    };

    info!(
        "{} (pid {:?}) exited: status {:?}, stopped {}",
        m.handle.program, m.handle.pid, report.code(), report.stopped
    );

    let _ = m.tx.send(ProcessEvent::Exited(report)).await;
}

/// Read a pipe as lines split on `\n` and `\r`, decoding lossily.
fn spawn_reader<R>(
    pipe: R,
    stream: OutputStream,
    tx: mpsc::Sender<ProcessEvent>,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut segments = BufReader::new(pipe).split(b'\n');
        let mut consumer_gone = false;

        loop {
            let segment = match segments.next_segment().await {
                Ok(Some(segment)) => segment,
                Ok(None) => break,
                Err(e) => {
                    debug!("Reading {:?} failed: {}", stream, e);
                    break;
                }
            };

            for part in segment.split(|b| *b == b'\r') {
                let text = String::from_utf8_lossy(part).trim_end().to_string();
                if text.is_empty() {
                    continue;
                }

                if let Some(tail) = &tail {
                    let mut tail = tail.lock();
                    tail.push_back(text.clone());
                    if tail.len() > STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                }

                // Keep draining after the consumer left so the child never
                // blocks on a full pipe.
                if !consumer_gone && tx.send(ProcessEvent::Line { stream, text }).await.is_err() {
                    consumer_gone = true;
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    async fn collect(mut output: ProcessOutput) -> (Vec<(OutputStream, String)>, ExitReport) {
        let mut lines = Vec::new();
        while let Some(event) = output.next().await {
            match event {
                ProcessEvent::Line { stream, text } => lines.push((stream, text)),
                ProcessEvent::Exited(report) => return (lines, report),
            }
        }
        panic!("output ended without an exit report");
    }

    async fn wait_for_line(output: &mut ProcessOutput, wanted: &str) {
        while let Some(event) = output.next().await {
            if let ProcessEvent::Line { text, .. } = event {
                if text == wanted {
                    return;
                }
            }
        }
        panic!("process exited before printing {wanted}");
    }

    #[tokio::test]
    async fn streams_output_then_exit_report() {
        let supervisor = ProcessSupervisor::new();
        let (handle, output) = supervisor
            .start("item-1", &sh("echo one; echo two >&2; echo three"))
            .unwrap();

        assert_eq!(handle.owner, "item-1");

        let (lines, report) = collect(output).await;
        let stdout: Vec<&str> = lines
            .iter()
            .filter(|(s, _)| *s == OutputStream::Stdout)
            .map(|(_, t)| t.as_str())
            .collect();

        assert_eq!(stdout, vec!["one", "three"]);
        assert_eq!(report.stderr_tail, vec!["two".to_string()]);
        assert!(report.success());
        assert!(!report.stopped);
        assert_eq!(supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn carriage_returns_split_lines() {
        let supervisor = ProcessSupervisor::new();
        let (_, output) = supervisor.start("item", &sh("printf 'a\\rb\\r\\nc\\n'")).unwrap();

        let (lines, _) = collect(output).await;
        let texts: Vec<&str> = lines.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_with_stderr() {
        let supervisor = ProcessSupervisor::new();
        let (_, output) = supervisor
            .start("item", &sh("echo 'ERROR: broken' >&2; exit 3"))
            .unwrap();

        let (_, report) = collect(output).await;
        assert!(!report.success());
        assert_eq!(report.code(), Some(3));
        assert_eq!(report.stderr_tail, vec!["ERROR: broken".to_string()]);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let supervisor = ProcessSupervisor::new();
        let err = supervisor
            .start("item", &CommandSpec::new("/nonexistent/dir/yt-dlp"))
            .err()
            .unwrap();

        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(err.is_not_found());
        assert_eq!(supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn terminate_stops_cooperative_process_within_grace() {
        let supervisor = ProcessSupervisor::new();
        let (handle, output) = supervisor.start("item", &sh("exec sleep 30")).unwrap();
        assert_eq!(supervisor.live_count(), 1);

        let started = Instant::now();
        supervisor
            .terminate(&handle, Duration::from_secs(3))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(supervisor.live_count(), 0);

        let (_, report) = collect(output).await;
        assert!(report.stopped);
        assert!(!report.success());
    }

    #[tokio::test]
    async fn terminate_kills_process_ignoring_stop() {
        let supervisor = ProcessSupervisor::new();
        let (handle, mut output) = supervisor
            .start(
                "item",
                &sh("trap '' TERM; echo ready; while :; do sleep 0.1; done"),
            )
            .unwrap();
        wait_for_line(&mut output, "ready").await;

        let grace = Duration::from_millis(200);
        let started = Instant::now();
        supervisor.terminate(&handle, grace).await.unwrap();

        assert!(started.elapsed() >= grace);
        assert!(started.elapsed() < KILL_CONFIRM_TIMEOUT);
        assert_eq!(supervisor.live_count(), 0);
        assert!(!supervisor.is_live(&handle));
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let supervisor = ProcessSupervisor::new();
        let (handle, _output) = supervisor.start("item", &sh("exec sleep 30")).unwrap();

        let grace = Duration::from_secs(2);
        supervisor.terminate(&handle, grace).await.unwrap();
        supervisor.terminate(&handle, grace).await.unwrap();
        assert_eq!(supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn terminate_after_exit_is_noop() {
        let supervisor = ProcessSupervisor::new();
        let (handle, output) = supervisor.start("item", &sh("exit 0")).unwrap();
        let _ = collect(output).await;

        supervisor
            .terminate(&handle, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn terminate_all_leaves_no_live_processes() {
        let supervisor = ProcessSupervisor::new();
        let mut outputs = Vec::new();

        for i in 0..3 {
            let (_, output) = supervisor
                .start(&format!("cooperative-{i}"), &sh("exec sleep 30"))
                .unwrap();
            outputs.push(output);
        }
        for i in 0..2 {
            let (_, mut output) = supervisor
                .start(
                    &format!("stubborn-{i}"),
                    &sh("trap '' TERM; echo ready; while :; do sleep 0.1; done"),
                )
                .unwrap();
            wait_for_line(&mut output, "ready").await;
            outputs.push(output);
        }
        assert_eq!(supervisor.live_count(), 5);

        let grace = Duration::from_millis(300);
        let started = Instant::now();
        supervisor.terminate_all(grace).await;

        assert_eq!(supervisor.live_count(), 0);
        // Concurrent: bounded by the slowest process, not the sum.
        assert!(started.elapsed() < grace * 5 + Duration::from_secs(2));
    }
}
