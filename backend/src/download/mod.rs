//! Download pipeline: items, progress parsing, yt-dlp invocation,
//! per-attempt execution and the scheduling queue

mod executor;
mod invocation;
mod item;
pub mod progress;
mod queue;

#[cfg(test)]
pub(crate) mod testing;

pub use executor::{
    Completion, DownloadExecutor, ExecutionObserver, Job, JobUpdate, Outcome, Spawn,
};
pub use invocation::{
    template_escapes, InvocationBuilder, InvocationError, InvocationRequest, YtDlpInvocation,
};
pub use item::{
    ByteSize, DownloadItem, DownloadState, FailureKind, FormatSelection, ItemError, ItemId,
    MediaKind, TransitionError, DEFAULT_FAILURE_MESSAGE,
};
pub use progress::{parse_line, OutputEvent, ProgressSample, ProgressTracker};
pub use queue::{CompletionEvent, DownloadQueue, QueueError, QueueEvent, QueueStats, SubmitOptions};
