//! Scheduler implementation

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, AdmissionDecision};
use crate::config::Config;
use crate::domain::{GovernorError, Metadata, Priority, RequestId, Work, WorkError, work};

use super::adaptive::AdaptiveDelay;
use super::batch::{BatchAccumulator, BatchAdd};
use super::config::SchedulerConfig;
use super::queue::{PriorityQueues, QueueLengths, QueuedRequest, Reply, RequestHandle};
use super::retry::should_retry;
use super::stats::{Counters, SchedulerStats};

/// Shortest pause between admission re-checks
const MIN_ADMISSION_WAIT: Duration = Duration::from_millis(1);

/// Internal state protected by mutex
struct SchedulerState<T> {
    queues: PriorityQueues<T>,
    batches: BatchAccumulator<T>,
    adaptive: AdaptiveDelay,
    counters: Counters,
    since: Instant,
    since_wall: DateTime<Utc>,
    last_dispatch: Option<Instant>,
    retries_pending: usize,
    /// A dispatch loop is active
    running: bool,
    paused: bool,
    stopped: bool,
    loop_task: Option<JoinHandle<()>>,
    /// Replies of requests removed administratively; kept so their handles stay pending
    parked: Vec<Reply<T>>,
}

impl<T> SchedulerState<T> {
    /// Keep replies pending; senders whose handle was dropped are released
    fn park(&mut self, replies: impl IntoIterator<Item = Reply<T>>) {
        self.parked.retain(|reply| !reply.is_closed());
        self.parked.extend(replies.into_iter().filter(|reply| !reply.is_closed()));
    }
}

struct Shared<T> {
    config: SchedulerConfig,
    admission: Arc<AdmissionController>,
    slots: Arc<Semaphore>,
    state: Mutex<SchedulerState<T>>,
}

/// Priority scheduler for outbound API calls
///
/// Cheap to clone; clones share the same queues and dispatch loop. Every
/// execution goes through the shared `AdmissionController`.
pub struct Scheduler<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Scheduler<T> {
    /// Create a new scheduler with the given configuration
    pub fn new(mut config: SchedulerConfig, admission: Arc<AdmissionController>) -> Self {
        debug!(?config, "Scheduler::new: called");
        let smoothing = config.smoothing_factor;
        if !(0.0..=1.0).contains(&smoothing) {
            config.smoothing_factor = if smoothing.is_finite() { smoothing.clamp(0.0, 1.0) } else { 0.0 };
            warn!(
                smoothing,
                clamped = config.smoothing_factor,
                "Scheduler::new: smoothing factor outside 0.0 - 1.0"
            );
        }
        let now = Instant::now();
        let state = SchedulerState {
            queues: PriorityQueues::new(config.max_queue_size_per_priority),
            batches: BatchAccumulator::new(config.max_batch_size),
            adaptive: AdaptiveDelay::new(config.min_request_delay(), config.enable_adaptive_rate_limit),
            counters: Counters::default(),
            since: now,
            since_wall: Utc::now(),
            last_dispatch: None,
            retries_pending: 0,
            running: false,
            paused: false,
            stopped: false,
            loop_task: None,
            parked: Vec::new(),
        };
        Self {
            shared: Arc::new(Shared {
                slots: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
                config,
                admission,
                state: Mutex::new(state),
            }),
        }
    }

    /// Build an admission controller and scheduler from a full config
    pub fn from_config(config: &Config) -> Self {
        let admission = Arc::new(AdmissionController::new(config.admission.clone()));
        Self::new(config.scheduler.clone(), admission)
    }

    /// Enqueue an async closure as a unit of work
    ///
    /// The closure is invoked once per attempt. Must be called from within a
    /// tokio runtime.
    pub fn enqueue<F, Fut>(
        &self,
        request_type: impl Into<String>,
        priority: Priority,
        f: F,
        metadata: Option<Metadata>,
    ) -> Result<RequestHandle<T>, GovernorError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, WorkError>> + Send + 'static,
    {
        self.submit(request_type, priority, work(f), metadata)
    }

    /// Enqueue a prepared `Work`
    ///
    /// Rejections (`QueueFull`, `Paused`, `Stopped`) are returned immediately
    /// and never reach a queue.
    pub fn submit(
        &self,
        request_type: impl Into<String>,
        priority: Priority,
        work: Work<T>,
        metadata: Option<Metadata>,
    ) -> Result<RequestHandle<T>, GovernorError> {
        let request_type = request_type.into();
        debug!(%request_type, %priority, "Scheduler::submit: called");
        let mut state = self.shared.lock();

        let rejection = if state.stopped {
            Some(GovernorError::Stopped)
        } else if state.paused {
            Some(GovernorError::Paused)
        } else if state.queues.is_full(priority) {
            Some(GovernorError::QueueFull {
                priority,
                capacity: state.queues.capacity(),
            })
        } else {
            None
        };
        if let Some(err) = rejection {
            debug!(%request_type, %priority, %err, "Scheduler::submit: rejected");
            state.counters.rejected += 1;
            return Err(err);
        }

        let (tx, rx) = oneshot::channel();
        let id = RequestId::new();
        state.queues.push_back(QueuedRequest {
            id,
            request_type,
            priority,
            original_priority: priority,
            work,
            reply: tx,
            enqueued_at: Instant::now(),
            retry_count: 0,
            metadata,
        });
        state.counters.enqueued += 1;
        self.shared.ensure_running(&mut state);

        Ok(RequestHandle::new(id, rx))
    }

    /// Run an admission check directly, outside the queues
    pub fn check_limit(&self, category: Option<&str>) -> AdmissionDecision {
        self.shared.admission.check(category)
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.shared.admission
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn queue_lengths(&self) -> QueueLengths {
        self.shared.lock().queues.lengths()
    }

    /// Get the scheduler statistics, including the admission snapshot
    pub fn stats(&self) -> SchedulerStats {
        debug!("Scheduler::stats: called");
        let admission = self.shared.admission.stats();
        let in_use = self
            .shared
            .config
            .max_concurrent_requests
            .max(1)
            .saturating_sub(self.shared.slots.available_permits());
        let state = self.shared.lock();
        let c = &state.counters;
        let uptime = state.since.elapsed().as_secs_f64();
        let delay = state.adaptive.current().max(self.shared.config.min_request_delay());

        SchedulerStats {
            total_enqueued: c.enqueued,
            total_rejected: c.rejected,
            total_succeeded: c.succeeded,
            total_failed: c.failed,
            total_retried: c.retried,
            total_attempts: c.attempts,
            total_batches: c.batches,
            total_batched_requests: c.batched_requests,
            average_execution_ms: c.average_execution_ms,
            throughput_per_sec: if uptime > 0.0 { c.succeeded as f64 / uptime } else { 0.0 },
            queued: state.queues.lengths(),
            batched_pending: state.batches.pending_count(),
            retries_pending: state.retries_pending,
            active: in_use,
            current_delay_ms: delay.as_millis() as u64,
            paused: state.paused,
            stopped: state.stopped,
            since: state.since_wall,
            admission,
        }
    }

    /// Zero scheduler and admission counters
    pub fn reset_stats(&self) {
        debug!("Scheduler::reset_stats: called");
        {
            let mut state = self.shared.lock();
            state.counters = Counters::default();
            state.since = Instant::now();
            state.since_wall = Utc::now();
        }
        self.shared.admission.reset_stats();
    }

    /// Drop every queued, undispatched request
    ///
    /// Their handles are left unresolved. Requests already batched, executing
    /// or waiting out a retry backoff are not affected. Returns the number of
    /// requests removed.
    ///
    /// The scheduler holds the reply side of every cleared request until its
    /// handle is dropped; callers that never poll a cleared handle again
    /// should drop it.
    pub fn clear_queues(&self) -> usize {
        let mut state = self.shared.lock();
        let drained = state.queues.drain_all();
        let cleared = drained.len();
        state.park(drained.into_iter().map(|r| r.reply));
        info!(cleared, "Scheduler queues cleared");
        cleared
    }

    /// Reject new submissions; queued work keeps draining
    pub fn pause(&self) {
        info!("Scheduler paused");
        self.shared.lock().paused = true;
    }

    pub fn resume(&self) {
        info!("Scheduler resumed");
        self.shared.lock().paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Halt the dispatch loop and cancel batch timers
    ///
    /// Accumulated batch items are not executed and their handles stay
    /// unresolved. Work already executing runs to completion.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        if state.stopped {
            debug!("Scheduler::stop: already stopped");
            return;
        }
        state.stopped = true;
        state.running = false;
        if let Some(task) = state.loop_task.take() {
            task.abort();
        }
        let batched = state.batches.drain_all();
        let dropped = batched.len();
        state.park(batched.into_iter().map(|r| r.reply));
        info!(
            queued = state.queues.len(),
            batched_dropped = dropped,
            "Scheduler stopped"
        );
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stopped
    }
}

impl<T: Send + 'static> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, SchedulerState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the dispatch loop unless one is already active
    fn ensure_running(self: &Arc<Self>, state: &mut SchedulerState<T>) {
        if state.running || state.stopped {
            return;
        }
        debug!("Scheduler::ensure_running: starting dispatch loop");
        state.running = true;
        state.loop_task = Some(tokio::spawn(run_loop(self.clone())));
    }

    /// Remaining spacing before the next dispatch may happen
    fn pacing_delay(&self) -> Duration {
        let now = Instant::now();
        let mut state = self.lock();
        let adaptive = state.adaptive.update(now);
        let base = self.config.min_request_delay().max(adaptive);
        let jitter = 1.0 + self.config.smoothing_factor * rand::rng().random::<f64>();
        let target = base.mul_f64(jitter);
        match state.last_dispatch {
            Some(at) => target.saturating_sub(now.duration_since(at)),
            None => Duration::ZERO,
        }
    }

    fn dispatch(self: &Arc<Self>, request: QueuedRequest<T>, permit: OwnedSemaphorePermit) {
        debug!(
            id = %request.id,
            request_type = %request.request_type,
            priority = %request.priority,
            retry = request.retry_count,
            queued_ms = request.enqueued_at.elapsed().as_millis() as u64,
            metadata = ?request.metadata,
            "Scheduler::dispatch: called"
        );
        if self.config.is_batchable(&request.request_type) {
            self.add_to_batch(request, permit);
            return;
        }
        let shared = self.clone();
        tokio::spawn(async move {
            shared.execute(request).await;
            drop(permit);
        });
    }

    fn add_to_batch(self: &Arc<Self>, request: QueuedRequest<T>, permit: OwnedSemaphorePermit) {
        let request_type = request.request_type.clone();
        let full = {
            let mut state = self.lock();
            match state.batches.add(request) {
                BatchAdd::Full(items) => Some(items),
                BatchAdd::Opened { batch_id } => {
                    let timer = self.arm_batch_timer(request_type.clone(), batch_id);
                    state.batches.set_timer(&request_type, batch_id, timer);
                    None
                }
                BatchAdd::Joined => None,
            }
        };

        // Batch items take their own slots
        drop(permit);
        if let Some(items) = full {
            debug!(%request_type, size = items.len(), "Scheduler::add_to_batch: batch full, flushing");
            let shared = self.clone();
            tokio::spawn(async move {
                shared.execute_batch(items).await;
            });
        }
    }

    fn arm_batch_timer(self: &Arc<Self>, request_type: String, batch_id: u64) -> JoinHandle<()> {
        let shared = self.clone();
        let window = self.config.batch_window();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let expired = shared.lock().batches.take_expired(&request_type, batch_id);
            let Some(items) = expired else {
                return;
            };
            debug!(%request_type, size = items.len(), "Scheduler: batch window elapsed, flushing");
            shared.execute_batch(items).await;
        })
    }

    fn park(&self, requests: Vec<QueuedRequest<T>>) {
        self.lock().park(requests.into_iter().map(|r| r.reply));
    }

    async fn execute_batch(self: &Arc<Self>, items: Vec<QueuedRequest<T>>) {
        {
            let mut state = self.lock();
            state.counters.batches += 1;
            state.counters.batched_requests += items.len() as u64;
        }
        join_all(items.into_iter().map(|r| self.execute_in_slot(r))).await;
    }

    /// Execute one batch item once a concurrency slot is free
    async fn execute_in_slot(self: &Arc<Self>, request: QueuedRequest<T>) {
        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.park(vec![request]);
                return;
            }
        };
        self.execute(request).await;
        drop(permit);
    }

    /// Wait until admission allows this request type through
    async fn await_admission(&self, request_type: &str) {
        loop {
            let decision = self.admission.check(Some(request_type));
            if decision.allowed {
                return;
            }
            debug!(
                %request_type,
                reason = ?decision.reason,
                wait_ms = decision.wait_time.as_millis() as u64,
                "Scheduler::await_admission: blocked, waiting"
            );
            tokio::time::sleep(decision.wait_time.max(MIN_ADMISSION_WAIT)).await;
        }
    }

    /// Run one attempt and resolve, retry or fail the request
    async fn execute(self: &Arc<Self>, request: QueuedRequest<T>) {
        self.await_admission(&request.request_type).await;

        let started = Instant::now();
        let outcome = AssertUnwindSafe((request.work)())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(WorkError::Other("unit of work panicked".to_string())));
        let now = Instant::now();
        let execution_ms = now.duration_since(started).as_secs_f64() * 1000.0;

        match outcome {
            Ok(value) => {
                self.admission.record_success();
                {
                    let mut state = self.lock();
                    state.adaptive.record(now, true);
                    state.counters.record_attempt(execution_ms);
                    state.counters.succeeded += 1;
                }
                debug!(id = %request.id, execution_ms, "Scheduler::execute: succeeded");
                let _ = request.reply.send(Ok(value));
            }
            Err(error) => {
                self.admission.record_failure();
                let retry = should_retry(
                    request.original_priority,
                    request.retry_count,
                    error.kind(),
                    self.admission.config().max_retries,
                );
                {
                    let mut state = self.lock();
                    state.adaptive.record(now, false);
                    state.counters.record_attempt(execution_ms);
                    if retry {
                        state.counters.retried += 1;
                        state.retries_pending += 1;
                    } else {
                        state.counters.failed += 1;
                    }
                }

                if retry {
                    debug!(id = %request.id, %error, "Scheduler::execute: transient failure, retrying");
                    self.schedule_retry(request);
                } else {
                    let attempts = request.retry_count + 1;
                    warn!(
                        id = %request.id,
                        request_type = %request.request_type,
                        attempts,
                        transient = error.is_transient(),
                        %error,
                        "Request failed"
                    );
                    let _ = request.reply.send(Err(GovernorError::Failed {
                        id: request.id,
                        attempts,
                        source: error,
                    }));
                }
            }
        }
    }

    /// Requeue at one priority lower once the backoff delay has passed
    fn schedule_retry(self: &Arc<Self>, mut request: QueuedRequest<T>) {
        let delay = self.admission.backoff_delay(request.retry_count);
        request.retry_count += 1;
        request.priority = request.priority.demote();
        debug!(
            id = %request.id,
            retry = request.retry_count,
            priority = %request.priority,
            delay_ms = delay.as_millis() as u64,
            "Scheduler::schedule_retry: called"
        );

        let shared = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.requeue(request);
        });
    }

    fn requeue(self: &Arc<Self>, request: QueuedRequest<T>) {
        let mut state = self.lock();
        state.retries_pending = state.retries_pending.saturating_sub(1);
        if state.stopped {
            state.park([request.reply]);
            return;
        }
        state.queues.push_back(request);
        self.ensure_running(&mut state);
    }
}

/// The single dispatch loop: pace, take a slot, pick, dispatch
async fn run_loop<T: Send + 'static>(shared: Arc<Shared<T>>) {
    debug!("Scheduler::run_loop: started");
    loop {
        let delay = shared.pacing_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let permit = match shared.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let request = {
            let mut state = shared.lock();
            if state.stopped {
                return;
            }
            match state.queues.pop_next() {
                Some(request) => {
                    state.last_dispatch = Some(Instant::now());
                    request
                }
                None => {
                    state.running = false;
                    debug!("Scheduler::run_loop: queues empty, going idle");
                    return;
                }
            }
        };

        shared.dispatch(request, permit);
    }
    shared.lock().running = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionConfig;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn quiet_config() -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_requests: 1,
            min_request_delay_ms: 0,
            smoothing_factor: 0.0,
            enable_batching: false,
            ..Default::default()
        }
    }

    fn scheduler_with(config: SchedulerConfig, admission: AdmissionConfig) -> Scheduler<u32> {
        Scheduler::new(config, Arc::new(AdmissionController::new(admission)))
    }

    fn counting_failure(counter: Arc<AtomicU32>, error: WorkError) -> Work<u32> {
        work(move || {
            let counter = counter.clone();
            let error = error.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(error)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_dispatched_before_low() {
        let scheduler = scheduler_with(quiet_config(), AdmissionConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let low = scheduler
            .enqueue(
                "history",
                Priority::Low,
                move || {
                    let o = o.clone();
                    async move {
                        o.lock().unwrap().push("low");
                        Ok(1)
                    }
                },
                None,
            )
            .unwrap();
        let o = order.clone();
        let critical = scheduler
            .enqueue(
                "order",
                Priority::Critical,
                move || {
                    let o = o.clone();
                    async move {
                        o.lock().unwrap().push("critical");
                        Ok(2)
                    }
                },
                None,
            )
            .unwrap();

        assert_eq!(critical.await.unwrap(), 2);
        assert_eq!(low.await.unwrap(), 1);
        assert_eq!(*order.lock().unwrap(), vec!["critical", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_within_priority() {
        let scheduler = scheduler_with(quiet_config(), AdmissionConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..5u32)
            .map(|i| {
                let o = order.clone();
                scheduler
                    .enqueue(
                        "order-query",
                        Priority::Normal,
                        move || {
                            let o = o.clone();
                            async move {
                                o.lock().unwrap().push(i);
                                Ok(i)
                            }
                        },
                        None,
                    )
                    .unwrap()
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_queue_full_rejected_synchronously() {
        let scheduler = scheduler_with(
            SchedulerConfig {
                max_queue_size_per_priority: 2,
                ..quiet_config()
            },
            AdmissionConfig::default(),
        );

        let _a = scheduler.enqueue("history", Priority::Low, || async { Ok(1) }, None).unwrap();
        let _b = scheduler.enqueue("history", Priority::Low, || async { Ok(2) }, None).unwrap();
        let err = scheduler
            .enqueue("history", Priority::Low, || async { Ok(3) }, None)
            .err()
            .expect("third low-priority request should be rejected");
        assert!(matches!(err, GovernorError::QueueFull { priority: Priority::Low, capacity: 2 }));

        // Other priorities have their own capacity
        assert!(scheduler.enqueue("order", Priority::High, || async { Ok(4) }, None).is_ok());
        assert_eq!(scheduler.stats().total_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_retried_three_times() {
        let scheduler = scheduler_with(quiet_config(), AdmissionConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let handle = scheduler
            .submit(
                "order",
                Priority::Normal,
                counting_failure(attempts.clone(), WorkError::RateLimited("429".to_string())),
                None,
            )
            .unwrap();

        match handle.await {
            Err(GovernorError::Failed { attempts: n, source, .. }) => {
                assert_eq!(n, 4);
                assert_eq!(source, WorkError::RateLimited("429".to_string()));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        let stats = scheduler.stats();
        assert_eq!(stats.total_retried, 3);
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.retries_pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_retried_once() {
        let scheduler = scheduler_with(quiet_config(), AdmissionConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let handle = scheduler
            .submit(
                "account",
                Priority::Low,
                counting_failure(attempts.clone(), WorkError::Network("ECONNRESET".to_string())),
                None,
            )
            .unwrap();

        assert!(matches!(handle.await, Err(GovernorError::Failed { attempts: 2, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_not_retried_twice() {
        let scheduler = scheduler_with(quiet_config(), AdmissionConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let handle = scheduler
            .submit(
                "order",
                Priority::Critical,
                counting_failure(attempts.clone(), WorkError::RateLimited("429".to_string())),
                None,
            )
            .unwrap();

        assert!(matches!(handle.await, Err(GovernorError::Failed { attempts: 2, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failure_is_terminal() {
        let scheduler = scheduler_with(quiet_config(), AdmissionConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let handle = scheduler
            .submit(
                "order",
                Priority::High,
                counting_failure(attempts.clone(), WorkError::Other("insufficient margin".to_string())),
                None,
            )
            .unwrap();

        let err = handle.await.unwrap_err();
        assert_eq!(err.work_error(), Some(&WorkError::Other("insufficient margin".to_string())));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_demoted_behind_waiting_work() {
        let scheduler = scheduler_with(quiet_config(), AdmissionConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        let tries = Arc::new(AtomicU32::new(0));

        let (o, t) = (order.clone(), tries.clone());
        let flaky = scheduler
            .enqueue(
                "order",
                Priority::High,
                move || {
                    let (o, t) = (o.clone(), t.clone());
                    async move {
                        let n = t.fetch_add(1, Ordering::SeqCst);
                        o.lock().unwrap().push(format!("flaky-{n}"));
                        if n == 0 { Err(WorkError::Network("reset".to_string())) } else { Ok(0) }
                    }
                },
                None,
            )
            .unwrap();

        // Arrives during the 1s backoff, at the priority the retry is demoted to
        tokio::time::sleep(Duration::from_millis(500)).await;
        let o = order.clone();
        let steady = scheduler
            .enqueue(
                "order",
                Priority::Normal,
                move || {
                    let o = o.clone();
                    async move {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        o.lock().unwrap().push("steady".to_string());
                        Ok(1)
                    }
                },
                None,
            )
            .unwrap();

        assert_eq!(flaky.await.unwrap(), 0);
        assert_eq!(steady.await.unwrap(), 1);
        assert_eq!(*order.lock().unwrap(), vec!["flaky-0", "steady", "flaky-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_immediately() {
        let config = SchedulerConfig {
            enable_batching: true,
            batch_window_ms: 5_000,
            max_batch_size: 3,
            batchable_types: vec!["market-data".to_string()],
            ..quiet_config()
        };
        let scheduler = scheduler_with(config, AdmissionConfig::default());
        let start = Instant::now();

        let handles: Vec<_> = (0..3u32)
            .map(|i| {
                scheduler
                    .enqueue("market-data", Priority::Normal, move || async move { Ok(i * 10) }, None)
                    .unwrap()
            })
            .collect();
        let values: Vec<u32> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(values, vec![0, 10, 20]);
        assert!(start.elapsed() < Duration::from_secs(5));
        let stats = scheduler.stats();
        assert_eq!(stats.total_batches, 1);
        assert_eq!(stats.total_batched_requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_batch_item_flushes_after_window() {
        let config = SchedulerConfig {
            enable_batching: true,
            batch_window_ms: 200,
            max_batch_size: 10,
            batchable_types: vec!["market-data".to_string()],
            ..quiet_config()
        };
        let scheduler = scheduler_with(config, AdmissionConfig::default());
        let start = Instant::now();

        let handle = scheduler
            .enqueue("market-data", Priority::Normal, || async { Ok(5) }, None)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.stats().batched_pending, 1);

        assert_eq!(handle.await.unwrap(), 5);
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(scheduler.stats().batched_pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_queues_leaves_handles_pending() {
        let scheduler = scheduler_with(quiet_config(), AdmissionConfig::default());
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        let blocker = scheduler
            .enqueue(
                "order",
                Priority::Critical,
                move || {
                    let rx = release_rx.clone();
                    async move {
                        if let Some(rx) = rx.lock().await.take() {
                            let _ = rx.await;
                        }
                        Ok(0)
                    }
                },
                None,
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let queued: Vec<_> = (0..3u32)
            .map(|i| {
                scheduler
                    .enqueue("order", Priority::Normal, move || async move { Ok(i) }, None)
                    .unwrap()
            })
            .collect();
        assert_eq!(scheduler.queue_lengths().normal, 3);

        assert_eq!(scheduler.clear_queues(), 3);
        assert_eq!(scheduler.stats().queued.total(), 0);

        release_tx.send(()).unwrap();
        assert_eq!(blocker.await.unwrap(), 0);
        for handle in queued {
            assert!(tokio::time::timeout(Duration::from_secs(5), handle).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_pause_rejects_new_work_only() {
        let scheduler = scheduler_with(quiet_config(), AdmissionConfig::default());
        let queued = scheduler.enqueue("order", Priority::Normal, || async { Ok(1) }, None).unwrap();

        scheduler.pause();
        assert!(scheduler.is_paused());
        let err = scheduler
            .enqueue("order", Priority::Normal, || async { Ok(2) }, None)
            .err()
            .unwrap();
        assert!(matches!(err, GovernorError::Paused));
        assert_eq!(queued.await.unwrap(), 1);

        scheduler.resume();
        let resumed = scheduler.enqueue("order", Priority::Normal, || async { Ok(3) }, None).unwrap();
        assert_eq!(resumed.await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_pending_batch() {
        let config = SchedulerConfig {
            enable_batching: true,
            batch_window_ms: 1_000,
            batchable_types: vec!["market-data".to_string()],
            ..quiet_config()
        };
        let scheduler = scheduler_with(config, AdmissionConfig::default());
        let runs = Arc::new(AtomicU32::new(0));

        let r = runs.clone();
        let handle = scheduler
            .enqueue(
                "market-data",
                Priority::Normal,
                move || {
                    let r = r.clone();
                    async move {
                        r.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    }
                },
                None,
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        scheduler.stop();
        assert!(scheduler.is_stopped());
        assert!(tokio::time::timeout(Duration::from_secs(5), handle).await.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let err = scheduler
            .enqueue("order", Priority::Critical, || async { Ok(2) }, None)
            .err()
            .unwrap();
        assert!(matches!(err, GovernorError::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_wait_is_absorbed() {
        let scheduler = scheduler_with(
            SchedulerConfig {
                max_concurrent_requests: 4,
                ..quiet_config()
            },
            AdmissionConfig {
                max_requests: 2,
                window_ms: 1_000,
                ..Default::default()
            },
        );
        let start = Instant::now();

        let handles: Vec<_> = (0..3u32)
            .map(|i| scheduler.enqueue("ticker", Priority::High, move || async move { Ok(i) }, None).unwrap())
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), i as u32);
        }

        assert!(start.elapsed() >= Duration::from_secs(1));
        let stats = scheduler.stats();
        assert_eq!(stats.total_succeeded, 3);
        assert!(stats.admission.blocked_requests >= 1);
        assert_eq!(stats.admission.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap() {
        let scheduler = scheduler_with(
            SchedulerConfig {
                max_concurrent_requests: 2,
                ..quiet_config()
            },
            AdmissionConfig::default(),
        );
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6u32)
            .map(|i| {
                let (current, peak) = (current.clone(), peak.clone());
                scheduler
                    .enqueue(
                        "order-query",
                        Priority::Normal,
                        move || {
                            let (current, peak) = (current.clone(), peak.clone());
                            async move {
                                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                current.fetch_sub(1, Ordering::SeqCst);
                                Ok(i)
                            }
                        },
                        None,
                    )
                    .unwrap()
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_respects_concurrency_cap() {
        let config = SchedulerConfig {
            max_concurrent_requests: 1,
            enable_batching: true,
            batch_window_ms: 5_000,
            max_batch_size: 4,
            batchable_types: vec!["market-data".to_string()],
            ..quiet_config()
        };
        let scheduler = scheduler_with(config, AdmissionConfig::default());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let handles: Vec<_> = (0..4u32)
            .map(|i| {
                let (current, peak) = (current.clone(), peak.clone());
                scheduler
                    .enqueue(
                        "market-data",
                        Priority::Normal,
                        move || {
                            let (current, peak) = (current.clone(), peak.clone());
                            async move {
                                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                current.fetch_sub(1, Ordering::SeqCst);
                                Ok(i)
                            }
                        },
                        None,
                    )
                    .unwrap()
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_millis(400));
        assert!(start.elapsed() < Duration::from_secs(5));
        let stats = scheduler.stats();
        assert_eq!(stats.total_batches, 1);
        assert_eq!(stats.total_batched_requests, 4);
    }

    #[tokio::test]
    async fn test_cleared_replies_released_with_their_handles() {
        let scheduler = scheduler_with(quiet_config(), AdmissionConfig::default());

        let dropped: Vec<_> = (0..3u32)
            .map(|i| {
                scheduler
                    .enqueue("order", Priority::Low, move || async move { Ok(i) }, None)
                    .unwrap()
            })
            .collect();
        drop(dropped);
        assert_eq!(scheduler.clear_queues(), 3);
        assert_eq!(scheduler.shared.lock().parked.len(), 0);

        let mut kept: Vec<_> = (0..2u32)
            .map(|i| {
                scheduler
                    .enqueue("order", Priority::Low, move || async move { Ok(i) }, None)
                    .unwrap()
            })
            .collect();
        assert_eq!(scheduler.clear_queues(), 2);
        assert_eq!(scheduler.shared.lock().parked.len(), 2);

        drop(kept.pop());
        assert_eq!(scheduler.clear_queues(), 0);
        assert_eq!(scheduler.shared.lock().parked.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_smoothing_is_clamped() {
        for (given, expected) in [(-3.0, 0.0), (f64::NAN, 0.0), (2.5, 1.0), (0.4, 0.4)] {
            let scheduler = scheduler_with(
                SchedulerConfig {
                    smoothing_factor: given,
                    ..quiet_config()
                },
                AdmissionConfig::default(),
            );
            assert_eq!(scheduler.config().smoothing_factor, expected);
        }

        let scheduler = scheduler_with(
            SchedulerConfig {
                min_request_delay_ms: 10,
                smoothing_factor: -5.0,
                ..quiet_config()
            },
            AdmissionConfig::default(),
        );
        let first = scheduler.enqueue("order", Priority::Normal, || async { Ok(1) }, None).unwrap();
        let second = scheduler.enqueue("order", Priority::Normal, || async { Ok(2) }, None).unwrap();
        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_work_fails_terminally() {
        let scheduler = scheduler_with(quiet_config(), AdmissionConfig::default());
        let handle = scheduler
            .enqueue(
                "order",
                Priority::Normal,
                || async {
                    if true {
                        panic!("boom");
                    }
                    Ok(0)
                },
                None,
            )
            .unwrap();

        let err = handle.await.unwrap_err();
        assert!(matches!(err.work_error(), Some(WorkError::Other(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_stats() {
        let scheduler = scheduler_with(quiet_config(), AdmissionConfig::default());
        scheduler
            .enqueue("order", Priority::Normal, || async { Ok(1) }, None)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(scheduler.stats().total_succeeded, 1);

        scheduler.reset_stats();
        let stats = scheduler.stats();
        assert_eq!(stats.total_succeeded, 0);
        assert_eq!(stats.admission.total_requests, 0);
    }
}
