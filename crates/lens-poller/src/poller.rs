use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use lens_cache::{repository_prefix, CacheInvalidator};
use lens_core::{current_unix_timestamp_ms, CooperativeCancellationToken, RepositoryId};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::job::{JobState, JobStatus, JobStatusSource};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    NotStarted,
    Polling,
    Completed,
    TimedOut,
    Cancelled,
}

impl PollPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSnapshot {
    pub phase: PollPhase,
    pub job: Option<JobStatus>,
    /// Status checks whose responses were accepted.
    pub checks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed(JobStatus),
    /// Status unknown; the job itself may still finish.
    TimedOut { last: Option<JobStatus> },
    Cancelled { last: Option<JobStatus> },
}

struct ActivePoll {
    generation: u64,
    token: CooperativeCancellationToken,
    job: Option<JobStatus>,
}

struct PollerShared {
    source: Arc<dyn JobStatusSource>,
    invalidator: Arc<dyn CacheInvalidator>,
    generation: AtomicU64,
    active: Mutex<HashMap<RepositoryId, ActivePoll>>,
}

impl PollerShared {
    fn lock_active(&self) -> MutexGuard<'_, HashMap<RepositoryId, ActivePoll>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, repository: &RepositoryId, generation: u64) -> bool {
        self.lock_active()
            .get(repository)
            .is_some_and(|active| active.generation == generation && !active.token.is_cancelled())
    }

    fn record(&self, repository: &RepositoryId, generation: u64, job: &JobStatus) -> bool {
        let mut active = self.lock_active();
        match active.get_mut(repository) {
            Some(entry) if entry.generation == generation && !entry.token.is_cancelled() => {
                entry.job = Some(job.clone());
                true
            }
            _ => false,
        }
    }

    /// Removes the tracking entry if it still belongs to `generation`. Only the
    /// caller that removes it may act on a terminal state.
    fn release(&self, repository: &RepositoryId, generation: u64) -> bool {
        let mut active = self.lock_active();
        if active
            .get(repository)
            .is_some_and(|entry| entry.generation == generation)
        {
            active.remove(repository);
            return true;
        }
        false
    }
}

/// Polls analysis jobs and invalidates repository views when they finish.
#[derive(Clone)]
pub struct AnalysisJobPoller {
    shared: Arc<PollerShared>,
}

impl AnalysisJobPoller {
    pub fn new(source: Arc<dyn JobStatusSource>, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        Self {
            shared: Arc::new(PollerShared {
                source,
                invalidator,
                generation: AtomicU64::new(0),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts polling `repository`, superseding any poll already running for it.
    pub fn start(&self, repository: RepositoryId, settings: PollSettings) -> PollHandle {
        let generation = self
            .shared
            .generation
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        let token = CooperativeCancellationToken::new();
        {
            let mut active = self.shared.lock_active();
            if let Some(previous) = active.insert(
                repository.clone(),
                ActivePoll {
                    generation,
                    token: token.clone(),
                    job: None,
                },
            ) {
                tracing::info!(
                    repository = %repository,
                    superseded_generation = previous.generation,
                    "restarting analysis poll"
                );
                previous.token.cancel();
            }
        }

        let (snapshot_tx, snapshot_rx) = watch::channel(PollSnapshot {
            phase: PollPhase::Polling,
            job: None,
            checks: 0,
        });
        let run = PollRun {
            shared: Arc::clone(&self.shared),
            repository: repository.clone(),
            generation,
            settings,
            token: token.clone(),
            snapshot: snapshot_tx,
        };
        let task = tokio::spawn(run.execute());
        PollHandle {
            repository,
            generation,
            token,
            snapshot: snapshot_rx,
            task: Some(task),
        }
    }

    /// Latest status of a job still being polled.
    pub fn tracked(&self, repository: &RepositoryId) -> Option<JobStatus> {
        self.shared
            .lock_active()
            .get(repository)
            .and_then(|active| active.job.clone())
    }

    pub fn is_polling(&self, repository: &RepositoryId) -> bool {
        self.shared.lock_active().contains_key(repository)
    }

    pub fn cancel(&self, repository: &RepositoryId) -> bool {
        match self.shared.lock_active().get(repository) {
            Some(active) => {
                active.token.cancel();
                true
            }
            None => false,
        }
    }
}

struct PollRun {
    shared: Arc<PollerShared>,
    repository: RepositoryId,
    generation: u64,
    settings: PollSettings,
    token: CooperativeCancellationToken,
    snapshot: watch::Sender<PollSnapshot>,
}

enum CheckResult {
    Observed(Result<JobState, lens_cache::FetchError>),
    Cancelled,
    TimedOut,
}

impl PollRun {
    async fn execute(self) {
        let deadline = Instant::now() + self.settings.timeout;
        let period = self.settings.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            repository = %self.repository,
            generation = self.generation,
            "analysis poll started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return self.finish(PollPhase::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return self.finish(PollPhase::TimedOut),
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => CheckResult::Cancelled,
                _ = tokio::time::sleep_until(deadline) => CheckResult::TimedOut,
                response = self.shared.source.fetch_status(&self.repository) => {
                    CheckResult::Observed(response)
                }
            };

            let response = match result {
                CheckResult::Cancelled => return self.finish(PollPhase::Cancelled),
                CheckResult::TimedOut => return self.finish(PollPhase::TimedOut),
                CheckResult::Observed(response) => response,
            };

            if !self.shared.is_current(&self.repository, self.generation) {
                tracing::debug!(
                    repository = %self.repository,
                    generation = self.generation,
                    "discarding status response from superseded poll"
                );
                return self.finish(PollPhase::Cancelled);
            }

            match response {
                Ok(state) => {
                    if self.observe(state) {
                        return;
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        repository = %self.repository,
                        %error,
                        "analysis status check failed; will retry"
                    );
                }
            }
        }
    }

    /// Returns true once the poll has reached a terminal state.
    fn observe(&self, state: JobState) -> bool {
        let job = JobStatus {
            repository_id: self.repository.clone(),
            state,
            last_observed_unix_ms: current_unix_timestamp_ms(),
        };
        if !self.shared.record(&self.repository, self.generation, &job) {
            tracing::debug!(repository = %self.repository, "discarding status response after cancellation");
            self.finish(PollPhase::Cancelled);
            return true;
        }

        let previous = self.snapshot.borrow().job.as_ref().map(|job| job.state);
        if previous != Some(state) {
            tracing::debug!(
                repository = %self.repository,
                state = state.as_str(),
                "analysis job state observed"
            );
        }
        self.snapshot.send_modify(|snapshot| {
            snapshot.job = Some(job.clone());
            snapshot.checks = snapshot.checks.saturating_add(1);
        });

        if !state.is_terminal() {
            return false;
        }
        if self.shared.release(&self.repository, self.generation) {
            let invalidated = self
                .shared
                .invalidator
                .invalidate_prefix(&repository_prefix(&self.repository));
            tracing::info!(
                repository = %self.repository,
                state = state.as_str(),
                invalidated,
                "analysis job finished; repository views invalidated"
            );
            self.publish_phase(PollPhase::Completed);
        } else {
            self.publish_phase(PollPhase::Cancelled);
        }
        true
    }

    fn finish(&self, phase: PollPhase) {
        self.shared.release(&self.repository, self.generation);
        match phase {
            PollPhase::TimedOut => tracing::info!(
                repository = %self.repository,
                "analysis poll timed out; job status unknown"
            ),
            _ => tracing::debug!(repository = %self.repository, "analysis poll stopped"),
        }
        self.publish_phase(phase);
    }

    fn publish_phase(&self, phase: PollPhase) {
        self.snapshot.send_modify(|snapshot| snapshot.phase = phase);
    }
}

/// Owner of one poll run. Dropping the handle cancels the run.
#[derive(Debug)]
pub struct PollHandle {
    repository: RepositoryId,
    generation: u64,
    token: CooperativeCancellationToken,
    snapshot: watch::Receiver<PollSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn repository(&self) -> &RepositoryId {
        &self.repository
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn snapshot(&self) -> PollSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.snapshot.clone()
    }

    /// Waits until the run stops and reports how it ended.
    pub async fn wait(&mut self) -> PollOutcome {
        let mut receiver = self.snapshot.clone();
        let finished = receiver
            .wait_for(|snapshot| snapshot.phase.is_finished())
            .await
            .map(|snapshot| snapshot.clone());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let snapshot = match finished {
            Ok(snapshot) => snapshot,
            Err(_) => self.snapshot.borrow().clone(),
        };
        match (snapshot.phase, snapshot.job) {
            (PollPhase::Completed, Some(job)) => PollOutcome::Completed(job),
            (PollPhase::TimedOut, last) => PollOutcome::TimedOut { last },
            (_, last) => PollOutcome::Cancelled { last },
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use lens_cache::{repository_prefix, CacheInvalidator, CacheKey, FetchError};
    use lens_core::RepositoryId;

    use super::{AnalysisJobPoller, PollOutcome, PollPhase, PollSettings};
    use crate::job::{JobState, JobStatusSource};

    struct ScriptedSource {
        responses: Mutex<VecDeque<(Duration, Result<JobState, FetchError>)>>,
        fallback: JobState,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(responses: Vec<(Duration, Result<JobState, FetchError>)>, fallback: JobState) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                fallback,
                calls: AtomicUsize::new(0),
            }
        }

        fn immediate(states: &[JobState], fallback: JobState) -> Self {
            Self::new(
                states
                    .iter()
                    .map(|state| (Duration::ZERO, Ok(*state)))
                    .collect(),
                fallback,
            )
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobStatusSource for ScriptedSource {
        async fn fetch_status(&self, _repository: &RepositoryId) -> Result<JobState, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().expect("script lock").pop_front();
            let (delay, response) = next.unwrap_or((Duration::ZERO, Ok(self.fallback)));
            tokio::time::sleep(delay).await;
            response
        }
    }

    #[derive(Default)]
    struct RecordingInvalidator {
        prefixes: Mutex<Vec<CacheKey>>,
    }

    impl RecordingInvalidator {
        fn prefixes(&self) -> Vec<CacheKey> {
            self.prefixes.lock().expect("prefix lock").clone()
        }
    }

    impl CacheInvalidator for RecordingInvalidator {
        fn invalidate_prefix(&self, prefix: &CacheKey) -> usize {
            self.prefixes.lock().expect("prefix lock").push(prefix.clone());
            1
        }
    }

    fn repository() -> RepositoryId {
        RepositoryId::new("42").expect("repository id")
    }

    fn settings(interval_ms: u64, timeout_ms: u64) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn poller(source: &Arc<ScriptedSource>, invalidator: &Arc<RecordingInvalidator>) -> AnalysisJobPoller {
        AnalysisJobPoller::new(source.clone(), invalidator.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn functional_poll_stops_after_terminal_state_with_one_invalidation() {
        let source = Arc::new(ScriptedSource::immediate(
            &[JobState::Queued, JobState::Queued, JobState::Analyzing, JobState::Ready],
            JobState::Ready,
        ));
        let invalidator = Arc::new(RecordingInvalidator::default());
        let poller = poller(&source, &invalidator);

        let mut handle = poller.start(repository(), settings(1_000, 60_000));
        let outcome = handle.wait().await;

        let PollOutcome::Completed(job) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(job.state, JobState::Ready);
        assert_eq!(source.calls(), 4);
        assert_eq!(handle.snapshot().checks, 4);
        assert_eq!(invalidator.prefixes(), vec![repository_prefix(&repository())]);
        assert!(!poller.is_polling(&repository()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls(), 4, "no checks after completion");
    }

    #[tokio::test(start_paused = true)]
    async fn functional_cancel_between_checks_stops_further_checks() {
        let source = Arc::new(ScriptedSource::immediate(&[], JobState::Queued));
        let invalidator = Arc::new(RecordingInvalidator::default());
        let poller = poller(&source, &invalidator);

        let mut handle = poller.start(repository(), settings(1_000, 60_000));
        let mut updates = handle.subscribe();
        updates
            .wait_for(|snapshot| snapshot.checks == 2)
            .await
            .expect("two checks");
        handle.cancel();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls(), 2);
        assert!(matches!(handle.wait().await, PollOutcome::Cancelled { .. }));
        assert!(invalidator.prefixes().is_empty());
        assert_eq!(handle.snapshot().phase, PollPhase::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn regression_late_response_after_cancel_mutates_nothing() {
        let source = Arc::new(ScriptedSource::new(
            vec![
                (Duration::ZERO, Ok(JobState::Queued)),
                (Duration::from_secs(5), Ok(JobState::Ready)),
            ],
            JobState::Ready,
        ));
        let invalidator = Arc::new(RecordingInvalidator::default());
        let poller = poller(&source, &invalidator);

        let mut handle = poller.start(repository(), settings(1_000, 60_000));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(source.calls(), 2, "second check is in flight");
        handle.cancel();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.checks, 1);
        assert_eq!(snapshot.job.map(|job| job.state), Some(JobState::Queued));
        assert!(invalidator.prefixes().is_empty());
        assert!(matches!(handle.wait().await, PollOutcome::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn functional_poll_times_out_as_status_unknown() {
        let source = Arc::new(ScriptedSource::immediate(&[], JobState::Analyzing));
        let invalidator = Arc::new(RecordingInvalidator::default());
        let poller = poller(&source, &invalidator);

        let mut handle = poller.start(repository(), settings(1_000, 3_500));
        let outcome = handle.wait().await;

        let PollOutcome::TimedOut { last } = outcome else {
            panic!("expected timeout, got {outcome:?}");
        };
        assert_eq!(last.map(|job| job.state), Some(JobState::Analyzing));
        assert_eq!(source.calls(), 4);
        assert!(invalidator.prefixes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn regression_duplicate_terminal_response_invalidates_once() {
        let source = Arc::new(ScriptedSource::immediate(
            &[JobState::Failed, JobState::Failed],
            JobState::Failed,
        ));
        let invalidator = Arc::new(RecordingInvalidator::default());
        let poller = poller(&source, &invalidator);

        let mut handle = poller.start(repository(), settings(100, 10_000));
        let outcome = handle.wait().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(matches!(outcome, PollOutcome::Completed(ref job) if job.state == JobState::Failed));
        assert_eq!(source.calls(), 1);
        assert_eq!(invalidator.prefixes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_status_errors_are_absorbed_and_polling_continues() {
        let source = Arc::new(ScriptedSource::new(
            vec![
                (Duration::ZERO, Err(FetchError::Network("connection reset".to_string()))),
                (Duration::ZERO, Ok(JobState::Queued)),
                (Duration::ZERO, Ok(JobState::Ready)),
            ],
            JobState::Ready,
        ));
        let invalidator = Arc::new(RecordingInvalidator::default());
        let poller = poller(&source, &invalidator);

        let mut handle = poller.start(repository(), settings(500, 10_000));
        let outcome = handle.wait().await;

        assert!(matches!(outcome, PollOutcome::Completed(_)));
        assert_eq!(source.calls(), 3);
        assert_eq!(handle.snapshot().checks, 2);
        assert_eq!(invalidator.prefixes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn regression_restart_supersedes_previous_run() {
        let source = Arc::new(ScriptedSource::new(
            vec![
                (Duration::from_secs(5), Ok(JobState::Ready)),
                (Duration::ZERO, Ok(JobState::Ready)),
            ],
            JobState::Ready,
        ));
        let invalidator = Arc::new(RecordingInvalidator::default());
        let poller = poller(&source, &invalidator);

        let mut first = poller.start(repository(), settings(1_000, 60_000));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut second = poller.start(repository(), settings(1_000, 60_000));
        assert!(second.generation() > first.generation());

        assert!(matches!(second.wait().await, PollOutcome::Completed(_)));
        assert!(matches!(first.wait().await, PollOutcome::Cancelled { .. }));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(invalidator.prefixes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unit_dropping_handle_cancels_poll() {
        let source = Arc::new(ScriptedSource::immediate(&[], JobState::Queued));
        let invalidator = Arc::new(RecordingInvalidator::default());
        let poller = poller(&source, &invalidator);

        let handle = poller.start(repository(), settings(1_000, 60_000));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(poller.is_polling(&repository()));
        assert_eq!(
            poller.tracked(&repository()).map(|job| job.state),
            Some(JobState::Queued)
        );
        drop(handle);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls(), 1);
        assert!(!poller.is_polling(&repository()));
    }
}
