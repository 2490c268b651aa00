//! Runs one download attempt as a supervised yt-dlp process

use crate::download::invocation::{InvocationBuilder, InvocationRequest};
use crate::download::item::{FormatSelection, ItemError, ItemId, DEFAULT_FAILURE_MESSAGE};
use crate::download::progress::{parse_line, InfoEvent, OutputEvent, ProgressSample, ProgressTracker};
use crate::process::{ExitReport, ProcessError, ProcessEvent, ProcessHandle, ProcessSupervisor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Everything needed to run one attempt, snapshotted at dispatch time
#[derive(Debug, Clone)]
pub struct Job {
    pub item_id: ItemId,
    pub attempt: u32,
    pub url: String,
    pub format: Option<FormatSelection>,
    pub output_dir: PathBuf,
    pub output_template: String,
    /// Percent the item already shows, so a resumed attempt never regresses
    pub resume_from: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub output_file: Option<PathBuf>,
    pub size_bytes: Option<u64>,
    pub duration: Duration,
}

/// How an attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Completion),
    Failed(ItemError),
    /// Termination was requested; not an error
    Cancelled,
}

/// Changes pushed while an attempt runs
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    /// `percent` is already monotonic and `None` when the bar should not move
    Progress {
        percent: Option<f64>,
        sample: ProgressSample,
    },
    OutputFile(PathBuf),
}

/// Spawns an attempt's process; handed to [`ExecutionObserver::launch`]
pub type Spawn<'a> = &'a mut dyn FnMut() -> Result<ProcessHandle, ProcessError>;

/// Receives the executor's view of an attempt. Calls for a given
/// `(item, attempt)` arrive in order: `launch`, updates, `finished`.
pub trait ExecutionObserver: Send + Sync {
    /// Start the attempt's process by calling `spawn`, or return `None`
    /// without calling it when the attempt was stopped first. `spawn` must
    /// run under the same guard that stop requests take, so a stop either
    /// sees the registered process or prevents it from existing.
    fn launch(
        &self,
        id: &ItemId,
        attempt: u32,
        spawn: Spawn<'_>,
    ) -> Option<Result<ProcessHandle, ProcessError>>;

    fn update(&self, id: &ItemId, attempt: u32, update: JobUpdate);

    fn finished(&self, id: &ItemId, attempt: u32, outcome: Outcome);
}

/// Bridge between the queue and the process supervisor
#[derive(Clone)]
pub struct DownloadExecutor {
    supervisor: ProcessSupervisor,
    builder: Arc<dyn InvocationBuilder>,
}

impl DownloadExecutor {
    pub fn new(supervisor: ProcessSupervisor, builder: Arc<dyn InvocationBuilder>) -> Self {
        Self {
            supervisor,
            builder,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Run one attempt to its end and report the outcome to `observer`
    pub async fn execute(&self, job: Job, observer: &dyn ExecutionObserver) -> Outcome {
        let outcome = self.run(&job, observer).await;

        match &outcome {
            Outcome::Completed(done) => info!(
                "Download {} finished in {:?}: {:?}",
                job.item_id, done.duration, done.output_file
            ),
            Outcome::Failed(err) => warn!("Download {} failed: {}", job.item_id, err),
            Outcome::Cancelled => info!("Download {} stopped", job.item_id),
        }

        observer.finished(&job.item_id, job.attempt, outcome.clone());
        outcome
    }

    /// Stop the process behind an attempt, waiting at most `grace` before killing it
    pub async fn cancel(&self, handle: &ProcessHandle, grace: Duration) -> Result<(), ProcessError> {
        self.supervisor.terminate(handle, grace).await
    }

    async fn run(&self, job: &Job, observer: &dyn ExecutionObserver) -> Outcome {
        let request = InvocationRequest {
            url: &job.url,
            format: job.format.as_ref(),
            output_dir: &job.output_dir,
            output_template: &job.output_template,
        };

        let spec = match self.builder.build(&request) {
            Ok(spec) => spec,
            Err(e) => {
                return Outcome::Failed(ItemError::start(format!("could not build command: {e}")))
            }
        };

        let mut output = None;
        let launched = observer.launch(&job.item_id, job.attempt, &mut || {
            let (handle, stream) = self.supervisor.start(job.item_id.as_str(), &spec)?;
            output = Some(stream);
            Ok(handle)
        });

        let mut output = match (launched, output) {
            (Some(Ok(_)), Some(output)) => output,
            (Some(Err(e)), _) => {
                return Outcome::Failed(ItemError::start(start_failure_message(&e)))
            }
            _ => {
                debug!("Download {} stopped before its process started", job.item_id);
                return Outcome::Cancelled;
            }
        };

        let mut tracker = ProgressTracker::resuming(job.resume_from);
        let mut output_file: Option<PathBuf> = None;
        let mut size_bytes: Option<u64> = None;
        let mut failure: Option<String> = None;

        let report = loop {
            let (stream, text) = match output.next().await {
                Some(ProcessEvent::Line { stream, text }) => (stream, text),
                Some(ProcessEvent::Exited(report)) => break Some(report),
                None => break None,
            };

            let mut set_output = |path: PathBuf| {
                output_file = Some(path.clone());
                observer.update(&job.item_id, job.attempt, JobUpdate::OutputFile(path));
            };

            match parse_line(&text) {
                OutputEvent::Progress(sample) => {
                    if sample.total_bytes.is_some() {
                        size_bytes = sample.total_bytes;
                    }
                    let percent = tracker.observe(sample.percent);
                    observer.update(
                        &job.item_id,
                        job.attempt,
                        JobUpdate::Progress { percent, sample },
                    );
                }
                OutputEvent::Info(InfoEvent::Destination(path)) => {
                    tracker.start_phase();
                    debug!("Download {} phase {}: {:?}", job.item_id, tracker.phase(), path);
                    set_output(path);
                }
                OutputEvent::Info(InfoEvent::Merging(path))
                | OutputEvent::Info(InfoEvent::ExtractingAudio(path)) => set_output(path),
                OutputEvent::Info(InfoEvent::PostProcessing { stage, message }) => {
                    debug!("Download {} [{}] {}", job.item_id, stage, message);
                }
                OutputEvent::Finished(path) => {
                    debug!("Download {} already present", job.item_id);
                    if let Some(path) = path {
                        set_output(path);
                    }
                }
                OutputEvent::Failure(reason) => {
                    // The first error is the cause; later ones are fallout.
                    failure.get_or_insert(reason);
                }
                OutputEvent::Nothing => trace!("{} {:?}: {}", job.item_id, stream, text),
            }
        };

        match report {
            Some(report) => exit_outcome(report, output_file, size_bytes, failure),
            None => Outcome::Failed(ItemError::runtime("process output ended without exit status")),
        }
    }
}

fn start_failure_message(err: &ProcessError) -> String {
    match err {
        ProcessError::Spawn { program, .. } if err.is_not_found() => {
            format!("could not start {program}: executable not found")
        }
        ProcessError::Spawn { program, .. } if err.is_permission_denied() => {
            format!("could not start {program}: permission denied")
        }
        other => other.to_string(),
    }
}

/// Map a process exit to an attempt outcome
fn exit_outcome(
    report: ExitReport,
    output_file: Option<PathBuf>,
    size_bytes: Option<u64>,
    failure: Option<String>,
) -> Outcome {
    if report.stopped {
        return Outcome::Cancelled;
    }

    if report.success() {
        return Outcome::Completed(Completion {
            output_file,
            size_bytes,
            duration: report.runtime,
        });
    }

    let reason = failure
        .filter(|r| !r.trim().is_empty())
        .or_else(|| {
            report
                .stderr_tail
                .iter()
                .rev()
                .find(|line| !line.trim().is_empty())
                .cloned()
        });

    let message = match (reason, report.code()) {
        (Some(reason), _) => reason,
        (None, Some(code)) => format!("{DEFAULT_FAILURE_MESSAGE} (exit code {code})"),
        (None, None) => DEFAULT_FAILURE_MESSAGE.to_string(),
    };

    Outcome::Failed(ItemError::runtime(message))
}
