//! Completion evaluation and the join barrier.
//!
//! Both the synchronous per-completion path and the batched async leave path
//! funnel through one delta engine: fold accumulated counter deltas into the
//! root under its optimistic-lock revision, evaluate the join condition once,
//! and either persist the counters or perform the join. A losing writer
//! re-reads and retries up to a configured bound; after a root has joined,
//! every late writer observes `Completing` or a missing root and no-ops.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::aggregation::final_overview;
use crate::engine::MultiInstanceError;
use crate::events::{ActivityEvent, ActivityEventKind, EventSink};
use crate::expression::ExpressionEvaluator;
use crate::store::{StoreError, TreeStore};
use crate::tree::{
    BranchId, BranchState, ExecutionMode, MultiInstanceRoot, RootCounters, RootId, RootState,
};

/// Counter names exposed to completion-condition expressions.
pub const NR_OF_INSTANCES_VAR: &str = "nrOfInstances";
pub const NR_OF_ACTIVE_INSTANCES_VAR: &str = "nrOfActiveInstances";
pub const NR_OF_COMPLETED_INSTANCES_VAR: &str = "nrOfCompletedInstances";

/// One accumulated change to the root counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub instances: i32,
    pub active: i32,
    pub completed: i32,
}

impl CounterDelta {
    /// A normal branch completion.
    pub fn completion() -> Self {
        Self {
            instances: 0,
            active: -1,
            completed: 1,
        }
    }

    /// A branch removed as if it never existed.
    pub fn removal() -> Self {
        Self {
            instances: -1,
            active: -1,
            completed: 0,
        }
    }

    pub fn fold(deltas: &[CounterDelta]) -> Self {
        deltas.iter().fold(Self::default(), |acc, delta| Self {
            instances: acc.instances + delta.instances,
            active: acc.active + delta.active,
            completed: acc.completed + delta.completed,
        })
    }

    fn applied_to(&self, counters: &RootCounters, root_id: RootId) -> RootCounters {
        let apply = |current: i32, delta: i32, name: &str| {
            let next = current + delta;
            if next < 0 {
                warn!(root_id = %root_id, counter = name, current, delta, "counter underflow clamped");
            }
            next.max(0)
        };
        RootCounters {
            nr_of_instances: apply(counters.nr_of_instances, self.instances, "instances"),
            nr_of_active_instances: apply(counters.nr_of_active_instances, self.active, "active"),
            nr_of_completed_instances: apply(
                counters.nr_of_completed_instances,
                self.completed,
                "completed",
            ),
        }
    }
}

/// Whether the explicit completion condition participates in this evaluation.
/// Removals (delete-without-complete, standalone cancellations) only check
/// the structural rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinPolicy {
    WithCondition,
    StructuralOnly,
}

/// Result of applying a delta batch.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// Counters persisted; the root is still running.
    Updated(MultiInstanceRoot),
    /// This writer won the join race and completed the root.
    Joined(JoinReport),
    /// The root is gone or already completing; the write was a no-op.
    Stale,
}

#[derive(Debug)]
pub struct JoinReport {
    pub root_id: RootId,
    pub cancelled_branches: Vec<BranchId>,
    pub overview: Option<Value>,
}

/// The shared apply-deltas-and-maybe-join engine.
#[derive(Clone)]
pub struct JoinBarrier {
    store: Arc<dyn TreeStore>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    events: Arc<dyn EventSink>,
    retry_limit: u32,
}

impl JoinBarrier {
    pub fn new(
        store: Arc<dyn TreeStore>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        events: Arc<dyn EventSink>,
        retry_limit: u32,
    ) -> Self {
        Self {
            store,
            evaluator,
            events,
            retry_limit: retry_limit.max(1),
        }
    }

    /// Apply a batch of counter deltas to a root and evaluate the join
    /// condition once. Batch size is 1 on the synchronous path and N on the
    /// async drain; the semantics are identical.
    pub async fn apply(
        &self,
        root_id: RootId,
        deltas: &[CounterDelta],
        policy: JoinPolicy,
    ) -> Result<ApplyOutcome, MultiInstanceError> {
        let total = CounterDelta::fold(deltas);
        for _ in 0..self.retry_limit {
            let Some(mut root) = self.store.get_root(root_id).await? else {
                return Ok(ApplyOutcome::Stale);
            };
            if root.state != RootState::Running {
                return Ok(ApplyOutcome::Stale);
            }
            let counters = total.applied_to(&root.counters, root_id);

            if self.join_satisfied(&root, &counters, policy).await? {
                // Single-winner gate: the revision check on the transition to
                // `Completing` decides the race.
                root.state = RootState::Completing;
                root.counters = counters;
                match self.store.update_root(&root).await {
                    Ok(revision) => {
                        root.revision = revision;
                        let report = self.finish_join(root).await?;
                        return Ok(ApplyOutcome::Joined(report));
                    }
                    Err(StoreError::Conflict { .. }) => {
                        metrics::counter!("ramify_counter_conflicts_total").increment(1);
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            root.counters = counters;
            match self.store.update_root(&root).await {
                Ok(revision) => {
                    root.revision = revision;
                    return Ok(ApplyOutcome::Updated(root));
                }
                Err(StoreError::Conflict { .. }) => {
                    metrics::counter!("ramify_counter_conflicts_total").increment(1);
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(MultiInstanceError::ConcurrentUpdateConflict(
            root_id,
            self.retry_limit,
        ))
    }

    /// Tear the root down without joining: cancel branches, drop aggregation
    /// state, and emit a cancellation instead of a completion. Idempotent.
    pub async fn cancel(&self, root_id: RootId) -> Result<(), MultiInstanceError> {
        for _ in 0..self.retry_limit {
            let Some(mut root) = self.store.get_root(root_id).await? else {
                return Ok(());
            };
            if root.state != RootState::Running {
                return Ok(());
            }
            root.state = RootState::Completing;
            match self.store.update_root(&root).await {
                Ok(_) => {
                    self.cancel_active_branches(&root).await?;
                    self.store.take_aggregation_records(root.id).await?;
                    self.store.remove_root(root.id).await?;
                    self.events.publish(ActivityEvent::aggregate(
                        ActivityEventKind::ActivityCancelled,
                        &root.activity_ref,
                        Some(root.id),
                        root.counters,
                    ));
                    info!(root_id = %root.id, activity = %root.activity_ref, "multi-instance root cancelled");
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(MultiInstanceError::ConcurrentUpdateConflict(
            root_id,
            self.retry_limit,
        ))
    }

    async fn join_satisfied(
        &self,
        root: &MultiInstanceRoot,
        counters: &RootCounters,
        policy: JoinPolicy,
    ) -> Result<bool, MultiInstanceError> {
        if policy == JoinPolicy::WithCondition {
            if let Some(condition) = &root.completion_condition {
                let mut scope = self.store.read_scope(root.scope_id).await?;
                scope.insert(
                    NR_OF_INSTANCES_VAR.to_string(),
                    json!(counters.nr_of_instances),
                );
                scope.insert(
                    NR_OF_ACTIVE_INSTANCES_VAR.to_string(),
                    json!(counters.nr_of_active_instances),
                );
                scope.insert(
                    NR_OF_COMPLETED_INSTANCES_VAR.to_string(),
                    json!(counters.nr_of_completed_instances),
                );
                if self.evaluator.evaluate_bool(condition, &scope)? {
                    return Ok(true);
                }
            }
        }
        // Structural rule: everything planned has completed. Sequential roots
        // additionally require the seed queue to be drained.
        let all_done = counters.nr_of_completed_instances >= counters.nr_of_instances;
        Ok(match root.mode {
            ExecutionMode::Parallel => all_done,
            ExecutionMode::Sequential => all_done && root.pending_seeds.is_empty(),
        })
    }

    /// The winner's side of the join: cancel in-flight siblings, materialize
    /// the aggregation overview, destroy the root, and propagate exactly one
    /// leave signal.
    async fn finish_join(&self, root: MultiInstanceRoot) -> Result<JoinReport, MultiInstanceError> {
        let cancelled = self.cancel_active_branches(&root).await?;

        let overview = match &root.aggregation {
            Some(spec) => {
                let records = self.store.take_aggregation_records(root.id).await?;
                let value = final_overview(records, spec);
                self.store
                    .write_scope_variable(root.scope_id, &spec.target, value.clone())
                    .await?;
                Some(value)
            }
            None => None,
        };

        self.store.remove_root(root.id).await?;
        self.events.publish(ActivityEvent::aggregate(
            ActivityEventKind::ActivityCompleted,
            &root.activity_ref,
            Some(root.id),
            root.counters,
        ));
        info!(
            root_id = %root.id,
            activity = %root.activity_ref,
            completed = root.counters.nr_of_completed_instances,
            cancelled = cancelled.len(),
            "multi-instance root joined"
        );
        Ok(JoinReport {
            root_id: root.id,
            cancelled_branches: cancelled,
            overview,
        })
    }

    /// Best-effort, idempotent cancellation of every branch still attached.
    /// A branch mid-flight finishes its own work, but its late completion
    /// finds the root gone and becomes a no-op.
    async fn cancel_active_branches(
        &self,
        root: &MultiInstanceRoot,
    ) -> Result<Vec<BranchId>, MultiInstanceError> {
        let mut cancelled = Vec::new();
        for branch in self.store.branches_for_root(root.id).await? {
            self.store.remove_branch(branch.id).await?;
            self.events.publish(ActivityEvent::branch(
                ActivityEventKind::BranchEnded,
                &branch.activity_ref,
                branch.root_id,
                branch.id,
                branch.loop_counter,
                Some(BranchState::Cancelled),
                root.counters,
            ));
            debug!(branch_id = %branch.id, loop_counter = branch.loop_counter, "branch cancelled at join");
            cancelled.push(branch.id);
        }
        Ok(cancelled)
    }
}
