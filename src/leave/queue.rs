//! Deferred leave job queue.
//!
//! A deferred leave job is the persisted unit of work "re-check whether this
//! root can now join". The queue guarantees at most one pending job per root
//! per wave, at-least-once delivery, and keeps dead-lettered jobs queryable
//! with their retry count and last failure.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StoreResult;
use crate::tree::RootId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    /// Retries exhausted; kept for operator inspection, never dropped.
    DeadLettered,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeferredLeaveJob {
    pub id: JobId,
    pub root_id: RootId,
    pub state: JobState,
    pub attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub last_failure: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait LeaveQueue: Send + Sync {
    /// Enqueue a leave check for a root. When a pending job for the root
    /// already exists its id is returned instead of creating a second one.
    async fn enqueue(&self, root_id: RootId, now: DateTime<Utc>) -> StoreResult<JobId>;

    /// Pending jobs whose scheduled time has passed, oldest first.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DeferredLeaveJob>>;

    async fn complete(&self, id: JobId) -> StoreResult<()>;

    /// Push the job back with a later run time and record the failure.
    /// Returns the attempt count after the increment.
    async fn requeue(&self, id: JobId, run_at: DateTime<Utc>, failure: &str) -> StoreResult<u32>;

    async fn dead_letter(&self, id: JobId, failure: &str) -> StoreResult<()>;

    async fn dead_lettered(&self) -> StoreResult<Vec<DeferredLeaveJob>>;
}

/// Queue that keeps jobs in memory for tests or local runs.
#[derive(Clone, Default)]
pub struct MemoryLeaveQueue {
    jobs: Arc<Mutex<HashMap<JobId, DeferredLeaveJob>>>,
}

impl MemoryLeaveQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        let guard = self.jobs.lock().expect("jobs poisoned");
        guard
            .values()
            .filter(|job| job.state == JobState::Pending)
            .count()
    }
}

#[async_trait]
impl LeaveQueue for MemoryLeaveQueue {
    async fn enqueue(&self, root_id: RootId, now: DateTime<Utc>) -> StoreResult<JobId> {
        let mut guard = self.jobs.lock().expect("jobs poisoned");
        if let Some(existing) = guard
            .values()
            .find(|job| job.root_id == root_id && job.state == JobState::Pending)
        {
            return Ok(existing.id);
        }
        let job = DeferredLeaveJob {
            id: JobId::new(),
            root_id,
            state: JobState::Pending,
            attempts: 0,
            scheduled_at: now,
            last_failure: None,
            created_at: now,
        };
        let id = job.id;
        guard.insert(id, job);
        Ok(id)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DeferredLeaveJob>> {
        let guard = self.jobs.lock().expect("jobs poisoned");
        let mut jobs: Vec<_> = guard
            .values()
            .filter(|job| job.state == JobState::Pending && job.scheduled_at <= now)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.scheduled_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn complete(&self, id: JobId) -> StoreResult<()> {
        self.jobs.lock().expect("jobs poisoned").remove(&id);
        Ok(())
    }

    async fn requeue(&self, id: JobId, run_at: DateTime<Utc>, failure: &str) -> StoreResult<u32> {
        let mut guard = self.jobs.lock().expect("jobs poisoned");
        let Some(job) = guard.get_mut(&id) else {
            return Ok(0);
        };
        job.attempts += 1;
        job.scheduled_at = run_at;
        job.last_failure = Some(failure.to_string());
        Ok(job.attempts)
    }

    async fn dead_letter(&self, id: JobId, failure: &str) -> StoreResult<()> {
        let mut guard = self.jobs.lock().expect("jobs poisoned");
        if let Some(job) = guard.get_mut(&id) {
            job.state = JobState::DeadLettered;
            job.attempts += 1;
            job.last_failure = Some(failure.to_string());
        }
        Ok(())
    }

    async fn dead_lettered(&self) -> StoreResult<Vec<DeferredLeaveJob>> {
        let guard = self.jobs.lock().expect("jobs poisoned");
        Ok(guard
            .values()
            .filter(|job| job.state == JobState::DeadLettered)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_dedupes_per_root() {
        let queue = MemoryLeaveQueue::new();
        let root_id = RootId::new();
        let now = Utc::now();
        let first = queue.enqueue(root_id, now).await.unwrap();
        let second = queue.enqueue(root_id, now).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(queue.pending_count(), 1);

        // A different root gets its own job.
        queue.enqueue(RootId::new(), now).await.unwrap();
        assert_eq!(queue.pending_count(), 2);
    }

    #[tokio::test]
    async fn requeue_tracks_attempts_and_failure() {
        let queue = MemoryLeaveQueue::new();
        let root_id = RootId::new();
        let now = Utc::now();
        let id = queue.enqueue(root_id, now).await.unwrap();

        let attempts = queue
            .requeue(id, now + chrono::Duration::milliseconds(100), "conflict")
            .await
            .unwrap();
        assert_eq!(attempts, 1);

        // Not due until the requeue delay passes.
        assert!(queue.due(now, 10).await.unwrap().is_empty());
        let later = now + chrono::Duration::milliseconds(200);
        let due = queue.due(later, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].last_failure.as_deref(), Some("conflict"));
    }

    #[tokio::test]
    async fn dead_lettered_jobs_leave_the_due_set_but_stay_visible() {
        let queue = MemoryLeaveQueue::new();
        let root_id = RootId::new();
        let now = Utc::now();
        let id = queue.enqueue(root_id, now).await.unwrap();
        queue.dead_letter(id, "exhausted").await.unwrap();

        assert!(queue.due(now, 10).await.unwrap().is_empty());
        let dead = queue.dead_lettered().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_failure.as_deref(), Some("exhausted"));

        // A new wave for the same root may enqueue a fresh job.
        let fresh = queue.enqueue(root_id, now).await.unwrap();
        assert_ne!(fresh, id);
    }
}
