//! Queue worker: claims jobs, runs handlers under a renewed lease, and
//! routes outcomes back into the queue.
//!
//! Each worker owns one logical queue with its own concurrency and an
//! optional global claim rate. Handlers distinguish retryable from
//! terminal failures; the worker never interprets payloads.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{JobQueue, JobRecord};

/// Failure classification returned by a job handler.
#[derive(Debug)]
pub enum JobError {
    /// Transient; the queue re-delivers with backoff.
    Retryable(String),
    /// Terminal; the job dead-letters at once.
    Terminal(String),
}

impl JobError {
    /// The failure detail.
    pub fn message(&self) -> &str {
        match self {
            JobError::Retryable(msg) | JobError::Terminal(msg) => msg,
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::Retryable(msg) => write!(f, "retryable: {msg}"),
            JobError::Terminal(msg) => write!(f, "terminal: {msg}"),
        }
    }
}

/// Processes one job at a time.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    /// Handle a claimed job. The worker holds and renews the lease for
    /// the duration of this call.
    async fn handle(&self, job: &JobRecord) -> Result<(), JobError>;
}

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Concurrent handlers.
    pub concurrency: u32,
    /// Job lease duration; renewed at half-life while the handler runs.
    pub lease: Duration,
    /// Idle poll interval when the queue is empty.
    pub poll_interval: Duration,
    /// Maximum claims per second across the worker, if set.
    pub rate_per_sec: Option<u32>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
            rate_per_sec: None,
        }
    }
}

/// A polling worker bound to one logical queue.
pub struct JobWorker {
    queue_name: &'static str,
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
}

impl JobWorker {
    /// Create a worker.
    pub fn new(
        queue_name: &'static str,
        queue: JobQueue,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            queue_name,
            queue,
            handler,
            options,
        }
    }

    /// Run until cancelled, then wait for in-flight handlers to finish.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            queue = self.queue_name,
            concurrency = self.options.concurrency,
            "Queue worker started"
        );

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency as usize));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut window_start = tokio::time::Instant::now();
        let mut claims_this_window: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Reap finished handler tasks without blocking.
            while tasks.try_join_next().is_some() {}

            // Global claim rate: cap claims per one-second window.
            if let Some(rate) = self.options.rate_per_sec {
                let now = tokio::time::Instant::now();
                if now.duration_since(window_start) >= Duration::from_secs(1) {
                    window_start = now;
                    claims_this_window = 0;
                }
                if claims_this_window >= rate {
                    let wake = window_start + Duration::from_secs(1);
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep_until(wake) => {}
                    }
                    continue;
                }
            }

            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let claimed = match self.queue.claim_due(self.queue_name, self.options.lease).await {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(queue = self.queue_name, error = %e, "Claim failed");
                    None
                }
            };

            let Some(job) = claimed else {
                drop(permit);
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.options.poll_interval) => {}
                }
                continue;
            };

            claims_this_window += 1;

            let queue = self.queue.clone();
            let handler = self.handler.clone();
            let lease = self.options.lease;
            let queue_name = self.queue_name;
            tasks.spawn(async move {
                run_one(queue_name, &queue, handler.as_ref(), &job, lease).await;
                drop(permit);
            });
        }

        // Bounded drain of in-flight handlers.
        tracing::info!(queue = self.queue_name, "Queue worker draining");
        while tasks.join_next().await.is_some() {}
        tracing::info!(queue = self.queue_name, "Queue worker stopped");
    }
}

/// Run one handler under lease renewal and route the outcome.
async fn run_one(
    queue_name: &str,
    queue: &JobQueue,
    handler: &dyn JobHandler,
    job: &JobRecord,
    lease: Duration,
) {
    let half_life = lease / 2;
    let mut renew = tokio::time::interval_at(
        tokio::time::Instant::now() + half_life,
        half_life.max(Duration::from_millis(50)),
    );

    let handler_fut = handler.handle(job);
    tokio::pin!(handler_fut);

    let result = loop {
        tokio::select! {
            result = &mut handler_fut => break result,
            _ = renew.tick() => {
                if let Err(e) = queue.renew_lease(&job.id, lease).await {
                    tracing::warn!(queue = queue_name, job_id = %job.id, error = %e, "Lease renewal failed");
                }
            }
        }
    };

    match result {
        Ok(()) => {
            if let Err(e) = queue.complete(&job.id).await {
                tracing::warn!(queue = queue_name, job_id = %job.id, error = %e, "Completion failed");
            }
        }
        Err(err) => {
            tracing::warn!(queue = queue_name, job_id = %job.id, error = %err, "Handler failed");
            if let Err(e) = queue.fail(&job.id, err.message(), err.retryable()).await {
                tracing::warn!(queue = queue_name, job_id = %job.id, error = %e, "Failure record failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EnqueueOptions;
    use crate::storage::init_test_db;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(serde::Serialize, serde::Deserialize)]
    struct TestPayload {
        n: u32,
    }

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: bool,
    }

    impl CountingHandler {
        fn new(fail_first: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
            }
        }
    }

    #[async_trait::async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &JobRecord) -> Result<(), JobError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                Err(JobError::Retryable("first call fails".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct TerminalHandler;

    #[async_trait::async_trait]
    impl JobHandler for TerminalHandler {
        async fn handle(&self, _job: &JobRecord) -> Result<(), JobError> {
            Err(JobError::Terminal("not retryable".to_string()))
        }
    }

    async fn queue() -> JobQueue {
        JobQueue::new(init_test_db().await.expect("init"))
    }

    fn fast_options() -> WorkerOptions {
        WorkerOptions {
            concurrency: 2,
            lease: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            rate_per_sec: None,
        }
    }

    #[tokio::test]
    async fn worker_processes_and_removes_job() {
        let q = queue().await;
        q.enqueue("post-comment", "j1", &TestPayload { n: 1 }, EnqueueOptions::default())
            .await
            .expect("enqueue");

        let handler = Arc::new(CountingHandler::new(false));
        let cancel = CancellationToken::new();
        let worker = JobWorker::new("post-comment", q.clone(), handler.clone(), fast_options());

        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move { worker.run(cancel_clone).await });

        // Wait until the job disappears.
        for _ in 0..100 {
            if q.get("j1").await.expect("get").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        cancel.cancel();
        handle.await.expect("join");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(q.get("j1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn terminal_failure_dead_letters() {
        let q = queue().await;
        q.enqueue("post-comment", "j1", &TestPayload { n: 1 }, EnqueueOptions::default())
            .await
            .expect("enqueue");

        let cancel = CancellationToken::new();
        let worker = JobWorker::new("post-comment", q.clone(), Arc::new(TerminalHandler), fast_options());

        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move { worker.run(cancel_clone).await });

        for _ in 0..100 {
            if let Some(job) = q.get("j1").await.expect("get") {
                if job.status == crate::queue::JobStatus::Dead {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        cancel.cancel();
        handle.await.expect("join");

        let job = q.get("j1").await.expect("get").expect("exists");
        assert_eq!(job.status, crate::queue::JobStatus::Dead);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn retryable_failure_records_attempt() {
        let q = queue().await;
        q.enqueue("post-comment", "j1", &TestPayload { n: 1 }, EnqueueOptions::default())
            .await
            .expect("enqueue");

        let handler = Arc::new(CountingHandler::new(true));
        let cancel = CancellationToken::new();
        let worker = JobWorker::new("post-comment", q.clone(), handler.clone(), fast_options());

        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move { worker.run(cancel_clone).await });

        // First attempt fails; the job goes pending with backoff.
        for _ in 0..100 {
            if let Some(job) = q.get("j1").await.expect("get") {
                if job.attempts == 1 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        cancel.cancel();
        handle.await.expect("join");

        let job = q.get("j1").await.expect("get").expect("exists");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("first call fails"));
    }

    #[tokio::test]
    async fn worker_drains_in_flight_on_cancel() {
        let q = queue().await;

        struct SlowHandler {
            done: AtomicU32,
        }

        #[async_trait::async_trait]
        impl JobHandler for SlowHandler {
            async fn handle(&self, _job: &JobRecord) -> Result<(), JobError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        q.enqueue("post-comment", "slow", &TestPayload { n: 1 }, EnqueueOptions::default())
            .await
            .expect("enqueue");

        let handler = Arc::new(SlowHandler {
            done: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();
        let worker = JobWorker::new("post-comment", q.clone(), handler.clone(), fast_options());

        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move { worker.run(cancel_clone).await });

        // Give the worker time to claim, then cancel mid-handler.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.expect("join");

        // The in-flight handler completed during the drain.
        assert_eq!(handler.done.load(Ordering::SeqCst), 1);
    }
}
