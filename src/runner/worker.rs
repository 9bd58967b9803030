use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::handoff::{withdraw, Handoff};
use super::recovery::{execute_guarded, notify_recovery};
use super::runner::MetricsSink;
use crate::config::DispatcherConfig;
use crate::job::handler::{HandlerRegistry, RecoveryListener};
use crate::job::job::{QueueKey, QueuePayload};
use crate::queue::queue::{DeadLetterReason, JobQueue};

/// A job moving through the in-memory lanes.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub payload: QueuePayload,
    /// List the job was popped from.
    pub source: QueueKey,
    /// The handler already panicked on this job once.
    pub faulted: bool,
}

impl InFlight {
    pub(crate) fn new(payload: QueuePayload, source: QueueKey) -> Self {
        Self {
            payload,
            source,
            faulted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    Fast,
    Fallback,
}

/// State shared by the pollers, the workers and parked retries.
pub(crate) struct WorkerContext {
    pub queue: JobQueue,
    pub handlers: HandlerRegistry,
    pub config: DispatcherConfig,
    pub metrics: Arc<dyn MetricsSink>,
    pub on_recovery: Option<RecoveryListener>,
    pub fast: Handoff<InFlight>,
    pub fallback: Handoff<InFlight>,
    pub cancel: CancellationToken,
    pub retries: TaskTracker,
}

impl WorkerContext {
    /// Puts a job that could not be delivered before shutdown back at the head
    /// of the list it came from.
    pub(crate) async fn return_to_store(&self, job: &InFlight) {
        restore(&self.queue, job).await;
    }

    async fn dead_letter(&self, job: &InFlight, reason: DeadLetterReason, message: &str) {
        self.metrics.inc_counter("job_dead_lettered", 1);
        if let Err(e) = self
            .queue
            .dead_letter_to(&job.source, &job.payload, reason, message)
            .await
        {
            error!(job_id = %job.payload.id, error = %e, "Failed to dead-letter job");
        }
    }
}

/// Worker loop: takes jobs from either lane until shutdown.
///
/// Lane priority alternates every iteration so a busy fast lane cannot
/// starve retries and the other way round. In-flight jobs are finished after
/// shutdown is requested; jobs received but not started go back to the store.
pub(crate) async fn run_worker(worker_id: usize, ctx: Arc<WorkerContext>) {
    debug!(worker_id, "Starting worker loop");
    let mut carried: VecDeque<(Lane, InFlight)> = VecDeque::new();
    let mut prefer_fast = true;

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let next = match carried.pop_front() {
            Some(next) => next,
            None => match next_job(&ctx, prefer_fast, &mut carried).await {
                Some(next) => next,
                None => break,
            },
        };
        prefer_fast = !prefer_fast;

        let (lane, job) = next;
        process(worker_id, &ctx, lane, job).await;
    }

    return_carried(&ctx, carried).await;
    debug!(worker_id, "Worker loop stopped");
}

/// Waits on both lanes at once. A job that reached the losing lane's slot
/// before it was withdrawn is kept in `carried`. Returns `None` once shutdown
/// starts, leaving `carried` to be returned to the store.
async fn next_job(
    ctx: &WorkerContext,
    prefer_fast: bool,
    carried: &mut VecDeque<(Lane, InFlight)>,
) -> Option<(Lane, InFlight)> {
    let mut fast = ctx.fast.register();
    let mut fallback = ctx.fallback.register();

    let picked = if prefer_fast {
        tokio::select! {
            biased;
            Ok(job) = &mut fast => Some((Lane::Fast, job)),
            Ok(job) = &mut fallback => Some((Lane::Fallback, job)),
            _ = ctx.cancel.cancelled() => None,
        }
    } else {
        tokio::select! {
            biased;
            Ok(job) = &mut fallback => Some((Lane::Fallback, job)),
            Ok(job) = &mut fast => Some((Lane::Fast, job)),
            _ = ctx.cancel.cancelled() => None,
        }
    };

    if let Some(job) = withdraw(fast) {
        carried.push_back((Lane::Fast, job));
    }
    if let Some(job) = withdraw(fallback) {
        carried.push_back((Lane::Fallback, job));
    }

    picked
}

async fn return_carried(ctx: &WorkerContext, carried: VecDeque<(Lane, InFlight)>) {
    for (_, job) in carried {
        ctx.return_to_store(&job).await;
    }
}

async fn process(worker_id: usize, ctx: &WorkerContext, lane: Lane, mut job: InFlight) {
    // only jobs with budget left are parked for the fallback lane
    if lane == Lane::Fallback {
        job.payload.retry += 1;
    }

    let payload = &job.payload;
    debug!(worker_id, job_id = %payload.id, topic = %payload.topic, group = %payload.group, retry = payload.retry, ?lane, "Worker processing job");

    let Some(handler) = ctx.handlers.get(&payload.topic, &payload.group) else {
        ctx.metrics.inc_counter("job_unroutable", 1);
        warn!(worker_id, job_id = %payload.id, topic = %payload.topic, group = %payload.group, "No handler registered for job");
        ctx.dead_letter(&job, DeadLetterReason::Unroutable, "handler_not_found")
            .await;
        return;
    };

    let timeout = ctx.config.job_timeout();
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, execute_guarded(handler.as_ref(), payload)).await;
    ctx.metrics.observe_duration("job_execution", started.elapsed());

    match outcome {
        Ok(Ok(result)) if result.success => {
            ctx.metrics.inc_counter("job_completed", 1);
            info!(worker_id, job_id = %payload.id, retry = payload.retry, message = %result.message, "Job completed successfully");
        }
        Ok(Ok(result)) => {
            ctx.metrics.inc_counter("job_failed", 1);
            warn!(worker_id, job_id = %payload.id, retry = payload.retry, max_retry = payload.max_retry, message = %result.message, "Job failed");
            retry_or_exhaust(ctx, job, &result.message).await;
        }
        Ok(Err(fault)) => {
            ctx.metrics.inc_counter("job_fault", 1);
            error!(worker_id, job_id = %payload.id, panic = %fault.message, trace = %fault.trace, "Handler panicked");
            notify_recovery(ctx.on_recovery.as_ref(), &fault.trace);

            if job.faulted {
                ctx.dead_letter(&job, DeadLetterReason::Fault, &fault.message)
                    .await;
            } else {
                job.faulted = true;
                retry_or_exhaust(ctx, job, &fault.message).await;
            }
        }
        Err(_elapsed) => {
            ctx.metrics.inc_counter("job_timeout", 1);
            error!(worker_id, job_id = %payload.id, ?timeout, "Job timed out");
            retry_or_exhaust(ctx, job, "job execution timed out").await;
        }
    }
}

async fn retry_or_exhaust(ctx: &WorkerContext, job: InFlight, reason: &str) {
    if job.payload.can_retry() {
        ctx.metrics.inc_counter("job_retry", 1);
        park_for_retry(ctx, job);
    } else {
        let payload = &job.payload;
        error!(job_id = %payload.id, retry = payload.retry, max_retry = payload.max_retry, %reason, "Job retries exhausted");
        ctx.dead_letter(&job, DeadLetterReason::RetriesExhausted, reason)
            .await;
    }
}

async fn restore(queue: &JobQueue, job: &InFlight) {
    if let Err(e) = queue.restore_to(&job.source, &job.payload).await {
        error!(job_id = %job.payload.id, error = %e, "Failed to return job to queue, job lost");
    }
}

/// Hands a failed job to the fallback lane from a tracked background task so
/// the worker never waits on a lane that only workers drain.
fn park_for_retry(ctx: &WorkerContext, job: InFlight) {
    let delay = ctx.config.retry_backoff(job.payload.retry);
    let fallback = ctx.fallback.clone();
    let cancel = ctx.cancel.clone();
    let queue = ctx.queue.clone();

    ctx.retries.spawn(async move {
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = cancel.cancelled() => {}
            }
        }
        if let Err(job) = fallback.send(job, &cancel).await {
            restore(&queue, &job).await;
        }
    });
}
