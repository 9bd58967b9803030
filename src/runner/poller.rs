use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::error::QueueError;
use super::worker::{InFlight, WorkerContext};
use crate::job::job::QueueKey;

/// Exponential backoff for idle polls
pub(crate) struct Backoff {
    current: Duration,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            current: base,
            base,
            max,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }

    pub(crate) fn next(&mut self) -> Duration {
        let next = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        next
    }
}

/// What a drain pass achieved.
enum Drained {
    /// Jobs (or poisoned entries) were taken off the list.
    Progress,
    Idle,
    Stopped,
}

/// Moves jobs of one (topic, group) from the durable store to the fast lane.
///
/// Loops straight back after any progress and only sleeps, with exponential
/// backoff, once a pass finds nothing to do.
pub(crate) async fn run_poller(topic: String, group: String, ctx: Arc<WorkerContext>) {
    debug!(%topic, %group, "Starting poller");
    let mut backoff = Backoff::new(ctx.config.poll_interval(), ctx.config.max_poll_interval());

    while !ctx.cancel.is_cancelled() {
        match drain(&topic, &group, &ctx).await {
            Drained::Progress => backoff.reset(),
            Drained::Stopped => break,
            Drained::Idle => {
                tokio::select! {
                    _ = tokio::time::sleep(backoff.next()) => {},
                    _ = ctx.cancel.cancelled() => break,
                }
            }
        }
    }

    debug!(%topic, %group, "Poller stopped");
}

async fn drain(topic: &str, group: &str, ctx: &WorkerContext) -> Drained {
    let depth = match ctx.queue.length(topic, group).await {
        Ok(depth) => depth,
        Err(e) => {
            if e.is_retryable() {
                warn!(%topic, %group, error = %e, "Queue depth unknown");
            } else {
                error!(%topic, %group, error = %e, "Queue depth unknown");
            }
            return Drained::Idle;
        }
    };

    let mut taken = 0u64;
    // The depth may be stale when other dispatchers pop the same list.
    while taken < depth {
        if ctx.cancel.is_cancelled() {
            return Drained::Stopped;
        }

        match ctx.queue.pop(topic, group).await {
            Ok(payload) => {
                taken += 1;
                debug!(job_id = %payload.id, %topic, %group, "Job popped");
                let job = InFlight::new(payload, QueueKey::new(topic, group));
                if let Err(job) = ctx.fast.send(job, &ctx.cancel).await {
                    ctx.return_to_store(&job).await;
                    return Drained::Stopped;
                }
            }
            Err(QueueError::NotFound(_)) => break,
            Err(QueueError::Deserialize { key, entry, source }) => {
                taken += 1;
                ctx.metrics.inc_counter("job_poisoned", 1);
                error!(%key, error = %source, "Failed to deserialize queued job");
                if let Err(e) = ctx
                    .queue
                    .dead_letter_raw(topic, group, entry, source.to_string())
                    .await
                {
                    error!(%key, error = %e, "Failed to dead-letter poisoned entry");
                }
            }
            Err(e) => {
                warn!(%topic, %group, error = %e, "Failed to pop job");
                break;
            }
        }
    }

    if taken > 0 {
        Drained::Progress
    } else {
        Drained::Idle
    }
}
