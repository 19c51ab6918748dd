//! Sequencing of transfer and verification around the state machine.
//!
//! All public operations lock the same mutex, commit at most a few state
//! transitions and publish the resulting events before releasing it, so events
//! are always delivered in the order the transitions were committed. Long
//! running work happens in jobs spawned onto the tokio runtime. Each job is
//! tied to a work ID; once the work ID changes (cancel, delete, terminal
//! state), any late updates from an old job are ignored.
//!
//! Jobs are chained: a new job waits for the previous one to exit before doing
//! anything. Together with the cooperative stop signal, this guarantees that
//! only one job ever touches the artifact files at a time.

use std::{
    fs,
    future::Future,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::{
    runtime::{Handle, TryCurrentError},
    sync::watch,
    task::JoinHandle,
};

use crate::{
    artifact::{ArtifactMetadata, ArtifactPaths},
    checkpoint::{Checkpoint, CheckpointStore, PreferenceStore},
    control::{job_channel, wait, JobControl, JobListener, JobSignal, WaitResult},
    error::ErrorKind,
    events::{DownloadEvent, EventPublisher},
    file::{delete_if_exists, file_len},
    progress::ProgressEstimator,
    retry::{FailureClass, RetryDecision, RetryPolicy},
    state::{format_history, now_millis, DownloadState, StateMachine},
    storage::{has_room_for, StorageProbe},
    transfer::{HttpOptions, TransferEngine, TransferOutcome},
    verify::IntegrityVerifier,
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Could not initialize HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("Must be created from within a tokio runtime: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Directory where the artifact (and its temporary sibling) is stored
    pub download_dir: PathBuf,
    pub http: HttpOptions,
    pub retry: RetryPolicy,
    pub verifier: IntegrityVerifier,
    /// Reported to collaborators when verification succeeds
    pub launch_install: bool,
}

impl OrchestratorConfig {
    pub fn new(download_dir: PathBuf) -> Self {
        Self {
            download_dir,
            http: HttpOptions::default(),
            retry: RetryPolicy::default(),
            verifier: IntegrityVerifier::default(),
            launch_install: false,
        }
    }
}

/// Point-in-time view of the orchestrator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StatusSnapshot {
    pub state: DownloadState,
    pub progress: u8,
    pub bytes_done: u64,
    pub total_bytes: u64,
}

/// Decrements the running job counter when the job exits, even if it
/// panicked.
struct JobGuard(Arc<watch::Sender<usize>>);

impl JobGuard {
    fn new(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter.clone())
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}

struct Inner {
    machine: StateMachine,
    checkpoints: CheckpointStore,
    artifact: Option<ArtifactMetadata>,
    /// Identifies the checkpoint and the job currently allowed to update it
    work_id: Option<String>,
    bytes_done: u64,
    estimator: ProgressEstimator,
    control: Option<JobControl>,
    job: Option<JoinHandle<()>>,
    next_work_seq: u64,
}

impl Inner {
    fn owns(&self, work_id: &str) -> bool {
        self.work_id.as_deref() == Some(work_id)
    }

    fn total_bytes(&self) -> u64 {
        self.artifact.as_ref().map_or(0, |a| a.expected_size)
    }

    fn percent(&self) -> u8 {
        match self.total_bytes() {
            0 => 0,
            total => (self.bytes_done.min(total) as u128 * 100 / total as u128) as u8,
        }
    }

    fn new_work_id(&mut self) -> String {
        self.next_work_seq += 1;
        format!("transfer-{}-{}", now_millis(), self.next_work_seq)
    }

    fn persist(&mut self) {
        let Some(work_id) = self.work_id.clone() else {
            return;
        };

        let checkpoint = Checkpoint {
            state: self.machine.state(),
            bytes_downloaded: self.bytes_done,
            work_id,
            history: self.machine.history().to_vec(),
            artifact: self.artifact.clone(),
        };

        if let Err(e) = self.checkpoints.save(&checkpoint) {
            warn!("Failed to save checkpoint: {}", e);
        }
    }

    fn save_offset(&mut self) {
        if let Err(e) = self.checkpoints.save_offset(self.bytes_done) {
            warn!("Failed to save download offset: {}", e);
        }
    }

    /// Commit a transition and keep the checkpoint in sync with it. Entering
    /// `Idle` or a terminal state removes the checkpoint.
    fn commit(&mut self, to: DownloadState) -> bool {
        if self.machine.transition(to).is_none() {
            return false;
        }

        if to == DownloadState::Idle || to.is_terminal() {
            if self.work_id.take().is_some() {
                debug!("Transition history: {}", format_history(self.machine.history()));

                if let Err(e) = self.checkpoints.clear() {
                    warn!("Failed to clear checkpoint: {}", e);
                }
            }
            self.machine.clear_history();
        } else {
            self.persist();
        }

        true
    }

    fn signal(&self, signal: JobSignal) {
        if let Some(control) = &self.control {
            // Fails only if the job already exited
            let _ = control.send(signal);
        }
    }

    fn has_live_job(&self) -> bool {
        self.job.as_ref().map_or(false, |h| !h.is_finished())
    }
}

struct Shared {
    config: OrchestratorConfig,
    engine: TransferEngine,
    probe: Box<dyn StorageProbe>,
    events: EventPublisher,
    runtime: Handle,
    running_jobs: Arc<watch::Sender<usize>>,
    started: Instant,
    inner: Mutex<Inner>,
}

/// Drives a single artifact through transfer and verification.
///
/// The public operations never fail and never block on I/O beyond
/// checkpoint writes. Requests that are not legal in the current state are
/// logged and ignored.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Create a new orchestrator. This must be called from within a tokio
    /// runtime, which is where the jobs will run.
    pub fn new(
        config: OrchestratorConfig,
        prefs: Box<dyn PreferenceStore>,
        probe: Box<dyn StorageProbe>,
    ) -> Result<Self, OrchestratorError> {
        let runtime = Handle::try_current()?;
        let engine = TransferEngine::new(config.http)?;

        let inner = Inner {
            machine: StateMachine::default(),
            checkpoints: CheckpointStore::new(prefs),
            artifact: None,
            work_id: None,
            bytes_done: 0,
            estimator: ProgressEstimator::new(),
            control: None,
            job: None,
            next_work_seq: 0,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                engine,
                probe,
                events: EventPublisher::new(),
                runtime,
                running_jobs: Arc::new(watch::channel(0).0),
                started: Instant::now(),
                inner: Mutex::new(inner),
            }),
        })
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<DownloadEvent> {
        self.shared.events.subscribe()
    }

    /// Pick up where a previous process left off. Transfers that were queued
    /// or running are restarted from their checkpointed offset and
    /// verification restarts from the beginning of the file. Paused transfers
    /// stay paused.
    pub fn restore(&self) {
        self.shared.restore()
    }

    pub fn enqueue(&self, artifact: ArtifactMetadata) {
        self.shared.enqueue(artifact)
    }

    pub fn pause(&self) {
        self.shared.pause()
    }

    pub fn resume(&self) {
        self.shared.resume()
    }

    pub fn cancel(&self) {
        self.shared.cancel()
    }

    /// Remove the artifact and any partial download, regardless of state.
    pub fn delete(&self) {
        self.shared.delete()
    }

    pub fn query_status(&self) -> StatusSnapshot {
        self.shared.query_status()
    }

    /// Wait until no jobs are running. Useful before exiting the process so
    /// that the final checkpoint write after a pause is not lost.
    pub async fn wait_for_jobs(&self) {
        let mut rx = self.shared.running_jobs.subscribe();

        loop {
            if *rx.borrow_and_update() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn paths(&self, artifact: &ArtifactMetadata) -> ArtifactPaths {
        artifact.paths(&self.config.download_dir)
    }

    fn publish_status(&self, inner: &Inner) {
        self.events.publish(DownloadEvent::StatusSnapshot {
            state: inner.machine.state(),
            progress: inner.percent(),
        });
    }

    /// Start a job after the previous one (if any) has exited. Any previous
    /// job is told to stop.
    fn spawn_job<F, Fut>(self: &Arc<Self>, inner: &mut Inner, job: F)
    where
        F: FnOnce(Arc<Self>, JobListener) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (control, listener) = job_channel();
        if let Some(old) = inner.control.replace(control) {
            let _ = old.send(JobSignal::Stop);
        }

        let previous = inner.job.take();
        let guard = JobGuard::new(&self.running_jobs);
        let fut = job(self.clone(), listener);

        inner.job = Some(self.runtime.spawn(async move {
            let _guard = guard;

            if let Some(p) = previous {
                if let Err(e) = p.await {
                    warn!("Previous job did not exit cleanly: {}", e);
                }
            }

            fut.await;
        }));
    }

    fn spawn_transfer(self: &Arc<Self>, inner: &mut Inner) {
        let Some(work_id) = inner.work_id.clone() else {
            return;
        };

        self.spawn_job(inner, move |shared, listener| shared.run_transfer(work_id, listener));
    }

    /// Delete the artifact files once the current job has exited.
    fn spawn_cleanup(self: &Arc<Self>, inner: &mut Inner, paths: ArtifactPaths, remove_final: bool) {
        self.spawn_job(inner, move |_, _| async move {
            let mut targets = vec![paths.temp_path];
            if remove_final {
                targets.push(paths.final_path);
            }

            for path in targets {
                match delete_if_exists(&path) {
                    Ok(true) => debug!("Deleted {:?}", path),
                    Ok(false) => {}
                    Err(e) => warn!("Failed to delete {:?}: {}", path, e),
                }
            }
        });
    }

    /// Enter `Failed` and report the reason.
    fn fail(&self, inner: &mut Inner, kind: ErrorKind) {
        if !inner.commit(DownloadState::Failed) {
            return;
        }

        warn!("Download failed: {}", kind);

        if kind == ErrorKind::UnknownInternal {
            // Local I/O is suspect, so don't trust the partial file next time
            if let Some(artifact) = &inner.artifact {
                let paths = self.paths(artifact);
                if let Err(e) = delete_if_exists(&paths.temp_path) {
                    warn!("Failed to delete partial file {:?}: {}", paths.temp_path, e);
                }
            }
            inner.bytes_done = 0;
        }

        if kind.is_verification() {
            // Never leave an unverified file where it looks complete
            if let Some(artifact) = &inner.artifact {
                let paths = self.paths(artifact);
                if let Err(e) = delete_if_exists(&paths.final_path) {
                    warn!("Failed to delete unverified file {:?}: {}", paths.final_path, e);
                }
            }
            self.events.publish(DownloadEvent::VerifyFailed);
        }
        self.events.publish(DownloadEvent::error(kind));
    }

    fn restore(self: &Arc<Self>) {
        let mut inner = self.lock();

        let checkpoint = match inner.checkpoints.load() {
            Ok(Some(c)) => c,
            Ok(None) => {
                debug!("No checkpoint to restore");
                self.publish_status(&inner);
                return;
            }
            Err(e) => {
                warn!("Discarding unreadable checkpoint: {}", e);
                if let Err(e) = inner.checkpoints.clear() {
                    warn!("Failed to clear checkpoint: {}", e);
                }
                self.publish_status(&inner);
                return;
            }
        };

        debug!("Loaded checkpoint: {:?}", checkpoint);

        let resumable = !checkpoint.state.is_terminal() && checkpoint.state != DownloadState::Idle;

        let artifact = match checkpoint.artifact.clone() {
            Some(a) if resumable => a,
            _ => {
                info!("Discarding checkpoint in state {}", checkpoint.state);
                if let Err(e) = inner.checkpoints.clear() {
                    warn!("Failed to clear checkpoint: {}", e);
                }
                self.publish_status(&inner);
                return;
            }
        };

        // A process that died mid-transfer gets its transfer requeued
        let state = match checkpoint.state {
            DownloadState::Downloading => DownloadState::Queued,
            s => s,
        };

        inner.machine = StateMachine::with_history(state, checkpoint.history.clone());
        inner.bytes_done = if state == DownloadState::Verifying {
            artifact.expected_size
        } else {
            checkpoint.resume_offset().min(artifact.expected_size)
        };
        inner.artifact = Some(artifact);
        inner.work_id = Some(checkpoint.work_id.clone());
        inner.persist();

        info!("Restored {} at {} bytes", state, inner.bytes_done);

        match state {
            DownloadState::Queued => self.spawn_transfer(&mut inner),
            DownloadState::Verifying => {
                let work_id = checkpoint.work_id;
                self.spawn_job(&mut inner, move |shared, listener| shared.run_verification(work_id, listener));
            }
            _ => {}
        }

        self.publish_status(&inner);
    }

    fn enqueue(self: &Arc<Self>, artifact: ArtifactMetadata) {
        let mut inner = self.lock();
        let state = inner.machine.state();

        if matches!(state, DownloadState::Paused | DownloadState::PausedAwaitingConnection) {
            if inner.artifact.as_ref() == Some(&artifact) {
                drop(inner);
                return self.resume();
            }
            warn!("Ignoring enqueue of {:?}: another download is paused", artifact.filename);
            return;
        }

        if state == DownloadState::Failed {
            debug!("Retrying after failure");
            inner.commit(DownloadState::Idle);
        }

        if inner.machine.state() != DownloadState::Idle {
            warn!("Ignoring enqueue of {:?} in state {}", artifact.filename, inner.machine.state());
            return;
        }

        inner.artifact = Some(artifact.clone());
        inner.bytes_done = 0;

        if let Err(e) = artifact.validate() {
            warn!("Rejecting artifact: {}", e);
            return self.fail(&mut inner, e.kind());
        }

        let paths = self.paths(&artifact);

        if paths.final_path.is_file() {
            info!("{:?} already exists", paths.final_path);
            inner.bytes_done = artifact.expected_size;
            inner.commit(DownloadState::Completed);
            self.publish_status(&inner);
            return;
        }

        if let Err(e) = fs::create_dir_all(&self.config.download_dir) {
            warn!("Could not create {:?}: {}", self.config.download_dir, e);
            return self.fail(&mut inner, ErrorKind::UnknownInternal);
        }

        match self.probe.available_bytes(&self.config.download_dir) {
            Ok(available) if !has_room_for(available, artifact.expected_size) => {
                warn!("Only {} bytes available for {} byte artifact", available, artifact.expected_size);
                return self.fail(&mut inner, ErrorKind::InsufficientStorage);
            }
            Ok(_) => {}
            Err(e) => warn!("Could not determine free space; skipping check: {}", e),
        }

        // A partial file left behind by a failed attempt is picked up again
        inner.bytes_done = match file_len(&paths.temp_path) {
            Ok(Some(len)) if len <= artifact.expected_size => len,
            _ => 0,
        };
        inner.work_id = Some(inner.new_work_id());

        if inner.commit(DownloadState::Queued) {
            self.spawn_transfer(&mut inner);
        }
    }

    fn pause(&self) {
        let mut inner = self.lock();

        if !matches!(inner.machine.state(), DownloadState::Downloading | DownloadState::Queued) {
            warn!("Ignoring pause in state {}", inner.machine.state());
            return;
        }

        if inner.commit(DownloadState::Paused) {
            inner.signal(JobSignal::Stop);
            self.events.publish(DownloadEvent::Paused { queued: false });
        }
    }

    fn resume(self: &Arc<Self>) {
        let mut inner = self.lock();
        let state = inner.machine.state();

        if !matches!(state, DownloadState::Paused | DownloadState::PausedAwaitingConnection) {
            warn!("Ignoring resume in state {}", state);
            return;
        }

        if !inner.commit(DownloadState::Queued) {
            return;
        }

        if state == DownloadState::PausedAwaitingConnection && inner.has_live_job() {
            // The job is waiting out its retry delay; cut it short
            inner.signal(JobSignal::Run);
        } else {
            self.spawn_transfer(&mut inner);
        }
    }

    fn cancel(self: &Arc<Self>) {
        let mut inner = self.lock();
        let state = inner.machine.state();

        if state.is_terminal() || state == DownloadState::Idle {
            warn!("Ignoring cancel in state {}", state);
            return;
        }

        self.discard(&mut inner, state == DownloadState::Verifying);
        self.events.publish(DownloadEvent::Cancelled);
    }

    fn delete(self: &Arc<Self>) {
        let mut inner = self.lock();
        let state = inner.machine.state();

        self.discard(&mut inner, true);

        if !state.is_terminal() && state != DownloadState::Idle {
            self.events.publish(DownloadEvent::Cancelled);
        }
        self.publish_status(&inner);
    }

    /// Stop everything, return to `Idle` and remove the files.
    fn discard(self: &Arc<Self>, inner: &mut Inner, remove_final: bool) {
        inner.signal(JobSignal::Stop);
        inner.commit(DownloadState::Idle);

        if let Some(artifact) = inner.artifact.take() {
            let paths = self.paths(&artifact);
            self.spawn_cleanup(inner, paths, remove_final);
        }

        inner.bytes_done = 0;
        inner.estimator.reset();
    }

    fn query_status(&self) -> StatusSnapshot {
        let inner = self.lock();
        let mut state = inner.machine.state();
        let mut bytes_done = inner.bytes_done;
        let total_bytes = inner.total_bytes();

        if matches!(state, DownloadState::Completed | DownloadState::Idle) {
            let on_disk = inner.artifact.as_ref()
                .map_or(false, |a| self.paths(a).final_path.is_file());

            if on_disk {
                state = DownloadState::Completed;
                bytes_done = total_bytes;
            } else {
                state = DownloadState::Idle;
            }
        }

        let progress = if state == DownloadState::Completed {
            100
        } else {
            inner.percent()
        };

        StatusSnapshot {
            state,
            progress,
            bytes_done,
            total_bytes,
        }
    }

    fn on_progress(&self, work_id: &str, bytes: u64) {
        let mut inner = self.lock();
        if !inner.owns(work_id) || inner.machine.state() != DownloadState::Downloading {
            return;
        }

        let total = inner.total_bytes();
        inner.bytes_done = bytes.min(total);

        let now = self.started.elapsed().as_millis() as u64;
        let bytes_done = inner.bytes_done;

        if let Some(estimate) = inner.estimator.record(bytes_done, total, now) {
            // Synchronous write under the lock, at most once per second. The
            // offset on disk never runs ahead of the published progress.
            inner.save_offset();

            self.events.publish(DownloadEvent::Progress {
                percent: estimate.percent,
                bytes_done: estimate.bytes_done,
                total_bytes: estimate.total_bytes,
                eta_seconds: estimate.eta_seconds,
            });
        }
    }

    /// Persist the offset reached by a job that stopped or failed.
    fn record_offset(&self, work_id: &str, bytes: u64) {
        let mut inner = self.lock();
        if !inner.owns(work_id) {
            return;
        }

        inner.bytes_done = bytes.min(inner.total_bytes());
        inner.save_offset();
    }

    /// Move from `Queued` to `Downloading` and return what the engine needs.
    fn begin_attempt(&self, work_id: &str) -> Option<(ArtifactMetadata, u64)> {
        let mut inner = self.lock();
        if !inner.owns(work_id) || inner.machine.state() != DownloadState::Queued {
            return None;
        }

        if !inner.commit(DownloadState::Downloading) {
            return None;
        }

        inner.estimator.reset();
        self.events.publish(DownloadEvent::Started);

        Some((inner.artifact.clone()?, inner.bytes_done))
    }

    async fn run_transfer(self: Arc<Self>, work_id: String, mut listener: JobListener) {
        let mut failures = 0;

        loop {
            let Some((artifact, offset)) = self.begin_attempt(&work_id) else {
                debug!("Transfer job {} has nothing to do", work_id);
                return;
            };
            let paths = self.paths(&artifact);

            let outcome = self.engine.download(&artifact, &paths, offset, &listener,
                |bytes| self.on_progress(&work_id, bytes)).await;

            let (failure, bytes_downloaded) = match outcome {
                TransferOutcome::Success { bytes_downloaded } => {
                    if self.finish_transfer(&work_id, bytes_downloaded) {
                        self.run_verification(work_id, listener).await;
                    }
                    return;
                }
                TransferOutcome::Interrupted { bytes_downloaded } => {
                    debug!("Transfer interrupted at {} bytes", bytes_downloaded);
                    self.record_offset(&work_id, bytes_downloaded);
                    return;
                }
                TransferOutcome::FatalFailure(failure) => {
                    warn!("Transfer failed: {}", failure);
                    self.fail_job(&work_id, failure.kind());
                    return;
                }
                TransferOutcome::RetryableFailure { failure, bytes_downloaded } => {
                    (failure, bytes_downloaded)
                }
            };

            warn!("Transfer attempt failed at {} bytes: {}", bytes_downloaded, failure);
            self.record_offset(&work_id, bytes_downloaded);

            failures += 1;

            let delay = match self.config.retry.decide(failures, failure.class()) {
                RetryDecision::RetryAfter(d) => d,
                RetryDecision::NoRetry => {
                    if failure.class() != FailureClass::Server {
                        info!("Giving up after {} attempts", failures);
                    }
                    self.fail_job(&work_id, failure.kind());
                    return;
                }
            };

            if !self.await_connection(&work_id) {
                return;
            }

            info!("Retrying in {:?} (attempt {}/{})", delay, failures, self.config.retry.max_retries);

            if wait(&mut listener, delay).await == WaitResult::Stopped || !self.requeue(&work_id) {
                return;
            }
        }
    }

    fn fail_job(&self, work_id: &str, kind: ErrorKind) {
        let mut inner = self.lock();
        if inner.owns(work_id) {
            self.fail(&mut inner, kind);
        }
    }

    fn await_connection(&self, work_id: &str) -> bool {
        let mut inner = self.lock();
        if !inner.owns(work_id) || !inner.commit(DownloadState::PausedAwaitingConnection) {
            return false;
        }

        self.events.publish(DownloadEvent::Paused { queued: true });
        true
    }

    /// Queue the next attempt after the retry delay. Returns false if the job
    /// is no longer wanted.
    fn requeue(&self, work_id: &str) -> bool {
        let mut inner = self.lock();
        if !inner.owns(work_id) {
            return false;
        }

        match inner.machine.state() {
            // Resumed early
            DownloadState::Queued => true,
            DownloadState::PausedAwaitingConnection => inner.commit(DownloadState::Queued),
            _ => false,
        }
    }

    /// Hand the completed file over to verification.
    fn finish_transfer(&self, work_id: &str, bytes: u64) -> bool {
        let mut inner = self.lock();
        if !inner.owns(work_id) {
            return false;
        }

        let total = inner.total_bytes();
        if bytes != total {
            warn!("Received {} bytes, but expected {}", bytes, total);
        }
        inner.bytes_done = bytes.min(total);

        self.events.publish(DownloadEvent::Progress {
            percent: inner.percent(),
            bytes_done: inner.bytes_done,
            total_bytes: total,
            eta_seconds: Some(0),
        });

        if !inner.commit(DownloadState::Verifying) {
            return false;
        }
        self.events.publish(DownloadEvent::VerifyStarted);

        true
    }

    async fn run_verification(self: Arc<Self>, work_id: String, listener: JobListener) {
        let (path, expected) = {
            let inner = self.lock();
            match &inner.artifact {
                Some(a) if inner.owns(&work_id) && inner.machine.state() == DownloadState::Verifying => {
                    (self.paths(a).final_path, a.expected_checksum.clone())
                }
                _ => return,
            }
        };

        info!("Verifying {:?}", path);

        let result = self.config.verifier.verify(&path, Some(&expected), &listener).await;

        let mut inner = self.lock();
        if !inner.owns(&work_id) {
            return;
        }

        match result {
            Ok(()) => {
                inner.bytes_done = inner.total_bytes();
                if inner.commit(DownloadState::Completed) {
                    info!("Download of {:?} complete", path);
                    self.events.publish(DownloadEvent::VerifyComplete {
                        should_launch_install: self.config.launch_install,
                    });
                }
            }
            Err(e) => match e.kind() {
                Some(kind) => {
                    warn!("Verification failed: {}", e);
                    self.fail(&mut inner, kind);
                }
                None => debug!("Verification stopped"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{checkpoint::MemoryStore, storage::FixedStorageProbe};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn artifact(size: u64) -> ArtifactMetadata {
        ArtifactMetadata {
            download_url: "http://127.0.0.1:9/ota.zip".to_owned(),
            filename: "ota.zip".to_owned(),
            expected_size: size,
            expected_checksum: "d41d8cd98f00b204e9800998ecf8427e".to_owned(),
            version_label: "1".to_owned(),
        }
    }

    fn orchestrator(dir: &std::path::Path, prefs: MemoryStore) -> Orchestrator {
        let mut config = OrchestratorConfig::new(dir.to_owned());
        config.retry.base_delay = Duration::from_secs(3600);

        Orchestrator::new(config, Box::new(prefs), Box::new(FixedStorageProbe(GIB))).unwrap()
    }

    #[test]
    fn test_requires_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::new(dir.path().to_owned());

        let result = Orchestrator::new(config, Box::new(MemoryStore::new()), Box::new(FixedStorageProbe(GIB)));
        assert_matches!(result.err(), Some(OrchestratorError::NoRuntime(_)));
    }

    #[tokio::test]
    async fn test_illegal_requests_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = MemoryStore::new();
        let o = orchestrator(dir.path(), prefs.clone());
        let mut events = o.subscribe();

        o.pause();
        o.resume();
        o.cancel();

        assert_eq!(o.query_status().state, DownloadState::Idle);
        assert!(events.try_recv().is_err());
        assert!(prefs.is_empty());
    }

    #[tokio::test]
    async fn test_already_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = MemoryStore::new();
        let o = orchestrator(dir.path(), prefs.clone());
        let mut events = o.subscribe();

        fs::write(dir.path().join("ota.zip"), b"").unwrap();
        o.enqueue(artifact(10));

        assert_eq!(events.recv().await, Some(DownloadEvent::StatusSnapshot {
            state: DownloadState::Completed,
            progress: 100,
        }));
        assert_eq!(o.query_status().state, DownloadState::Completed);
        assert!(prefs.is_empty());

        // Deleting the file externally is noticed
        fs::remove_file(dir.path().join("ota.zip")).unwrap();
        assert_eq!(o.query_status().state, DownloadState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = MemoryStore::new();
        let o = orchestrator(dir.path(), prefs.clone());
        let mut events = o.subscribe();

        let mut bad = artifact(10);
        bad.download_url = "file:///etc/passwd".to_owned();
        o.enqueue(bad);

        assert_eq!(events.recv().await, Some(DownloadEvent::error(ErrorKind::InvalidUrlScheme)));
        assert_eq!(o.query_status().state, DownloadState::Failed);
        assert!(prefs.is_empty());

        let mut bad = artifact(10);
        bad.filename = "../escape.zip".to_owned();
        o.enqueue(bad);

        assert_eq!(events.recv().await, Some(DownloadEvent::error(ErrorKind::NullOrInvalidMetadata)));
    }

    #[tokio::test]
    async fn test_insufficient_storage() {
        const MIB: u64 = 1024 * 1024;

        let dir = tempfile::tempdir().unwrap();
        let prefs = MemoryStore::new();
        let usable = 500 * MIB;
        let o = Orchestrator::new(
            OrchestratorConfig::new(dir.path().to_owned()),
            Box::new(prefs.clone()),
            Box::new(FixedStorageProbe(usable)),
        ).unwrap();
        let mut events = o.subscribe();

        o.enqueue(artifact(usable - 20 * MIB));

        assert_eq!(events.recv().await, Some(DownloadEvent::Error {
            kind: ErrorKind::InsufficientStorage,
            is_internal: false,
            is_storage: true,
            is_server: false,
        }));
        assert_eq!(o.query_status().state, DownloadState::Failed);
        assert!(prefs.is_empty());
        o.wait_for_jobs().await;
    }

    #[tokio::test]
    async fn test_restore_discards_terminal_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = MemoryStore::new();

        CheckpointStore::new(Box::new(prefs.clone())).save(&Checkpoint {
            state: DownloadState::Completed,
            bytes_downloaded: 10,
            work_id: "old".to_owned(),
            history: vec![],
            artifact: Some(artifact(10)),
        }).unwrap();

        let o = orchestrator(dir.path(), prefs.clone());
        o.restore();

        assert_eq!(o.query_status().state, DownloadState::Idle);
        assert!(prefs.is_empty());
    }

    #[tokio::test]
    async fn test_restore_paused() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = MemoryStore::new();

        fs::write(dir.path().join("ota.zip.otadl_download"), vec![0u8; 4]).unwrap();
        CheckpointStore::new(Box::new(prefs.clone())).save(&Checkpoint {
            state: DownloadState::Paused,
            bytes_downloaded: 4,
            work_id: "old".to_owned(),
            history: vec![],
            artifact: Some(artifact(10)),
        }).unwrap();

        let o = orchestrator(dir.path(), prefs.clone());
        let mut events = o.subscribe();
        o.restore();

        assert_eq!(events.recv().await, Some(DownloadEvent::StatusSnapshot {
            state: DownloadState::Paused,
            progress: 40,
        }));
        assert_eq!(o.query_status(), StatusSnapshot {
            state: DownloadState::Paused,
            progress: 40,
            bytes_done: 4,
            total_bytes: 10,
        });

        // A different artifact cannot be enqueued while one is paused
        let mut other = artifact(10);
        other.filename = "other.zip".to_owned();
        o.enqueue(other);
        assert_eq!(o.query_status().state, DownloadState::Paused);

        o.cancel();
        assert_eq!(events.recv().await, Some(DownloadEvent::Cancelled));
        o.wait_for_jobs().await;

        assert_eq!(o.query_status().state, DownloadState::Idle);
        assert!(prefs.is_empty());
        assert!(!dir.path().join("ota.zip.otadl_download").exists());
    }
}
