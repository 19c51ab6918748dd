use std::time::Duration;

use tokio::sync::watch;

/// Cooperative control signal for running jobs. Jobs only look at it between
/// buffer writes and while sleeping, so a stop is never preemptive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobSignal {
    Run,
    Stop,
}

pub type JobControl = watch::Sender<JobSignal>;
pub type JobListener = watch::Receiver<JobSignal>;

pub fn job_channel() -> (JobControl, JobListener) {
    watch::channel(JobSignal::Run)
}

/// Whether the job should stop at the next opportunity. A dropped controller
/// counts as a stop request.
pub fn is_stop_requested(listener: &JobListener) -> bool {
    *listener.borrow() == JobSignal::Stop || listener.has_changed().is_err()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitResult {
    /// The full duration passed.
    Elapsed,
    /// The controller asked the job to continue early.
    Woken,
    Stopped,
}

/// Sleep for `duration` unless the controller interrupts.
pub async fn wait(listener: &mut JobListener, duration: Duration) -> WaitResult {
    if is_stop_requested(listener) {
        return WaitResult::Stopped;
    }

    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);

    tokio::select! {
        _ = &mut sleep => WaitResult::Elapsed,
        changed = listener.changed() => match changed {
            Ok(_) if *listener.borrow() == JobSignal::Run => WaitResult::Woken,
            _ => WaitResult::Stopped,
        },
    }
}
