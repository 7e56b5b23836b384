//! Background leave worker.
//!
//! Polls the deferred job queue and drains each due job through the engine's
//! batched leave path. A job whose counter write keeps losing the optimistic
//! race is requeued with backoff up to the configured attempt bound, then
//! dead-lettered; the root stays `Running` until an operator intervenes.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use super::queue::{DeferredLeaveJob, LeaveQueue};
use crate::config::LeaveConfig;
use crate::engine::{LeaveJobOutcome, MultiInstanceEngine, MultiInstanceError};

pub struct LeaveTask {
    engine: Arc<MultiInstanceEngine>,
    queue: Arc<dyn LeaveQueue>,
    config: LeaveConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl LeaveTask {
    pub fn new(engine: Arc<MultiInstanceEngine>, shutdown_rx: watch::Receiver<bool>) -> Self {
        let queue = engine.leave_queue().clone();
        let config = engine.leave_config().clone();
        Self {
            engine,
            queue,
            config,
            shutdown_rx,
        }
    }

    /// Run the polling loop until shutdown.
    pub async fn run(mut self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            backoff = self.config.backoff.kind_str(),
            "leave task started"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("leave task shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(error = ?err, "leave poll failed");
                    }
                }
            }
        }
    }

    /// Process every due job once. Exposed so tests can drive the worker
    /// deterministically without the polling loop.
    pub async fn tick(&self) -> Result<usize, MultiInstanceError> {
        let now = Utc::now();
        let jobs = self.queue.due(now, self.config.batch_size).await?;
        let count = jobs.len();
        if count > 0 {
            debug!(count, "processing due leave jobs");
        }
        for job in jobs {
            self.process_job(job).await?;
        }
        Ok(count)
    }

    async fn process_job(&self, job: DeferredLeaveJob) -> Result<(), MultiInstanceError> {
        match self.engine.run_leave_job(job.root_id).await {
            Ok(LeaveJobOutcome::Idle) => {
                self.queue.complete(job.id).await?;
            }
            Ok(LeaveJobOutcome::Applied { joined, remaining }) => {
                self.queue.complete(job.id).await?;
                if remaining {
                    // More completions landed while this wave was draining.
                    self.queue.enqueue(job.root_id, Utc::now()).await?;
                }
                debug!(
                    job_id = %job.id,
                    root_id = %job.root_id,
                    joined,
                    remaining,
                    "leave job applied"
                );
            }
            Err(err) => {
                let attempts = job.attempts + 1;
                let failure = err.to_string();
                if attempts >= self.config.max_attempts {
                    metrics::counter!("ramify_leave_dead_letter_total").increment(1);
                    warn!(
                        job_id = %job.id,
                        root_id = %job.root_id,
                        attempts,
                        failure = %failure,
                        "leave job dead-lettered"
                    );
                    let exhausted =
                        MultiInstanceError::LeaveJobExhausted(job.root_id, attempts);
                    self.queue
                        .dead_letter(job.id, &format!("{exhausted}: {failure}"))
                        .await?;
                } else {
                    metrics::counter!("ramify_leave_retries_total").increment(1);
                    let mut delay_ms = self.config.backoff.delay_ms(attempts);
                    if self.config.jitter_ms > 0 {
                        delay_ms += rand::thread_rng().gen_range(0..=self.config.jitter_ms);
                    }
                    let run_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
                    debug!(
                        job_id = %job.id,
                        root_id = %job.root_id,
                        attempts,
                        delay_ms,
                        "leave job requeued"
                    );
                    self.queue.requeue(job.id, run_at, &failure).await?;
                }
            }
        }
        Ok(())
    }
}

/// Convenience function to spawn the leave worker.
pub fn spawn_leave_task(
    engine: Arc<MultiInstanceEngine>,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = LeaveTask::new(engine, shutdown_rx);
    let handle = tokio::spawn(task.run());
    (handle, shutdown_tx)
}
