use std::fmt::{self, Display};

use crate::job::{Job, JobError};

/// Opaque identifier of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(pub u64);

impl Display for TaskHandle {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Remote task queue that executes jobs on other machines.
///
/// Errors returned from these methods are queue failures (broker
/// unreachable, task lost) and abort the run. A job that ran and failed
/// is reported through the inner `Result` of [`TaskQueue::poll`].
pub trait TaskQueue<J: Job>: Sync {
    fn submit(&self, job: &J) -> anyhow::Result<TaskHandle>;

    /// `None` while the task is still pending or running
    #[allow(clippy::type_complexity)]
    fn poll(&self, handle: TaskHandle) -> anyhow::Result<Option<Result<J::Output, JobError>>>;

    /// Number of workers currently consuming from the queue
    fn worker_count(&self) -> anyhow::Result<usize>;
}
