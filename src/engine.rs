//! Engine façade wiring the planner, lifecycle manager, join barrier,
//! aggregator, and leave queue behind the operations the enclosing engine
//! consumes: `plan_and_activate`, `on_branch_terminal`, `add_instance`,
//! `delete_instance` (the mutation pair lives in `mutation.rs`).

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::debug;

use crate::aggregation::{capture_record, eager_overview};
use crate::completion::{ApplyOutcome, CounterDelta, JoinBarrier, JoinPolicy};
use crate::config::EngineConfig;
use crate::events::{ActivityEvent, ActivityEventKind, EventSink};
use crate::expression::{EvaluationError, ExpressionEvaluator};
use crate::leave::LeaveQueue;
use crate::lifecycle::BranchLifecycle;
use crate::planner::{self, PlanInput};
use crate::store::{StoreError, TreeStore};
use crate::tree::{
    Branch, BranchId, BranchOutcome, BranchState, CompletionRecord, ExecutionMode,
    MultiInstanceRoot, RootCounters, RootId, RootState,
};

#[derive(Debug, thiserror::Error)]
pub enum MultiInstanceError {
    #[error("collection variable `{0}` is missing")]
    CollectionVariableMissing(String),
    #[error("collection variable `{0}` is not a collection")]
    CollectionVariableNotACollection(String),
    #[error("illegal loop cardinality: {0}")]
    IllegalCardinality(i64),
    #[error("multiple live multi-instance roots match activity `{0}`")]
    AmbiguousMultiInstanceRoot(String),
    #[error("no live multi-instance root found")]
    NoMultiInstanceRootFound,
    #[error("branch {0} is not active")]
    BranchNotActive(BranchId),
    /// Internal and retryable; surfaces only when the bounded retry loop is
    /// exhausted under sustained contention.
    #[error("concurrent update conflict on root {0} after {1} attempts")]
    ConcurrentUpdateConflict(RootId, u32),
    /// Recorded on the dead-lettered job, never thrown into a live call
    /// path: the originating branch completion already happened.
    #[error("leave job for root {0} exhausted after {1} attempts")]
    LeaveJobExhausted(RootId, u32),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}

/// Outcome of activating a plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanOutcome {
    Activated(RootId),
    /// N = 0: nothing ran, the activity left immediately.
    ImmediateComplete,
}

/// What happened to a reported branch terminal event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalDisposition {
    /// Branch or root already gone; late completion safely ignored.
    Ignored,
    /// Recorded for the async leave scheduler; counters untouched for now.
    Deferred,
    /// Counters applied, root still running.
    Applied,
    /// This completion joined the root.
    Joined,
}

/// Result of draining one deferred leave job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveJobOutcome {
    /// No outstanding completion records.
    Idle,
    Applied { joined: bool, remaining: bool },
}

pub struct MultiInstanceEngine {
    pub(crate) store: Arc<dyn TreeStore>,
    pub(crate) evaluator: Arc<dyn ExpressionEvaluator>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) leave_queue: Arc<dyn LeaveQueue>,
    pub(crate) config: EngineConfig,
    pub(crate) lifecycle: BranchLifecycle,
    pub(crate) barrier: JoinBarrier,
}

impl MultiInstanceEngine {
    pub fn new(
        store: Arc<dyn TreeStore>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        events: Arc<dyn EventSink>,
        leave_queue: Arc<dyn LeaveQueue>,
        config: EngineConfig,
    ) -> Self {
        let lifecycle =
            BranchLifecycle::new(store.clone(), events.clone(), config.counter_retry_limit);
        let barrier = JoinBarrier::new(
            store.clone(),
            evaluator.clone(),
            events.clone(),
            config.counter_retry_limit,
        );
        Self {
            store,
            evaluator,
            events,
            leave_queue,
            config,
            lifecycle,
            barrier,
        }
    }

    pub fn store(&self) -> &Arc<dyn TreeStore> {
        &self.store
    }

    pub fn leave_queue(&self) -> &Arc<dyn LeaveQueue> {
        &self.leave_queue
    }

    pub fn leave_config(&self) -> &crate::config::LeaveConfig {
        &self.config.leave
    }

    /// Plan the activation and fan out the initial branches.
    ///
    /// A plan of size zero never creates a root: the aggregate completion
    /// notification fires immediately (with no loop counter anywhere), and a
    /// declared aggregation target is written as an empty sequence so
    /// downstream readers can tell "ran and joined empty" from "never ran".
    pub async fn plan_and_activate(
        &self,
        input: PlanInput,
    ) -> Result<PlanOutcome, MultiInstanceError> {
        let scope = self.store.read_scope(input.scope_id).await?;
        let seeds = planner::resolve_seeds(&input, &scope, self.evaluator.as_ref())?;

        if seeds.is_empty() {
            if let Some(spec) = &input.aggregation {
                self.store
                    .write_scope_variable(input.scope_id, &spec.target, json!([]))
                    .await?;
            }
            self.events.publish(ActivityEvent::aggregate(
                ActivityEventKind::ActivityCompleted,
                &input.activity_ref,
                None,
                RootCounters::default(),
            ));
            return Ok(PlanOutcome::ImmediateComplete);
        }

        let root = MultiInstanceRoot {
            id: RootId::new(),
            scope_id: input.scope_id,
            activity_ref: input.activity_ref.clone(),
            mode: input.mode,
            state: RootState::Running,
            counters: RootCounters::default(),
            completion_condition: input.completion_condition.clone(),
            element_variable: input.element_variable().map(str::to_string),
            aggregation: input.aggregation.clone(),
            pending_seeds: Default::default(),
            next_loop_counter: 0,
            async_leave: input.async_leave,
            revision: 0,
            created_at: Utc::now(),
        };
        let root = self.lifecycle.create_root(root, seeds).await?;
        Ok(PlanOutcome::Activated(root.id))
    }

    /// Handle a branch terminal event reported by the executing work.
    ///
    /// Idempotent under the join race: a branch finishing "just after" its
    /// siblings joined the root finds its node gone and is ignored.
    pub async fn on_branch_terminal(
        &self,
        branch_id: BranchId,
        outcome: BranchOutcome,
    ) -> Result<TerminalDisposition, MultiInstanceError> {
        let Some(branch) = self.store.get_branch(branch_id).await? else {
            return Ok(TerminalDisposition::Ignored);
        };
        let Some(root) = self.store.get_root(branch.root_id).await? else {
            // Root torn down while the branch was mid-flight.
            self.store.remove_branch(branch_id).await?;
            return Ok(TerminalDisposition::Ignored);
        };
        if root.state != RootState::Running || branch.state != BranchState::Active {
            return Ok(TerminalDisposition::Ignored);
        }
        self.finish_branch(branch, root, outcome).await
    }

    /// Drain outstanding completion records for one root and apply them as a
    /// single batched counter write (the async no-wait-state leave path).
    pub async fn run_leave_job(
        &self,
        root_id: RootId,
    ) -> Result<LeaveJobOutcome, MultiInstanceError> {
        let records = self
            .store
            .read_completion_records(root_id, self.config.leave.batch_size)
            .await?;
        if records.is_empty() {
            return Ok(LeaveJobOutcome::Idle);
        }

        let deltas: Vec<CounterDelta> = records
            .iter()
            .map(|record| match record.outcome {
                BranchOutcome::Completed => CounterDelta::completion(),
                BranchOutcome::Cancelled => CounterDelta::removal(),
            })
            .collect();
        let policy = if records
            .iter()
            .any(|record| record.outcome == BranchOutcome::Completed)
        {
            JoinPolicy::WithCondition
        } else {
            JoinPolicy::StructuralOnly
        };

        debug!(root_id = %root_id, batch = records.len(), "draining completion records");
        let outcome = self.barrier.apply(root_id, &deltas, policy).await?;

        let ids: Vec<_> = records.iter().map(|record| record.id).collect();
        self.store.delete_completion_records(&ids).await?;

        let joined = matches!(outcome, ApplyOutcome::Joined(_));
        if let ApplyOutcome::Updated(root) = outcome {
            self.after_counters_updated(root).await?;
        }
        let remaining = self.store.count_completion_records(root_id).await? > 0;
        Ok(LeaveJobOutcome::Applied { joined, remaining })
    }

    /// Tear down a running root without joining (enclosing scope teardown).
    pub async fn cancel_root(&self, root_id: RootId) -> Result<(), MultiInstanceError> {
        self.barrier.cancel(root_id).await
    }

    pub(crate) async fn finish_branch(
        &self,
        branch: Branch,
        root: MultiInstanceRoot,
        outcome: BranchOutcome,
    ) -> Result<TerminalDisposition, MultiInstanceError> {
        if outcome == BranchOutcome::Completed {
            if let Some(spec) = &root.aggregation {
                self.store
                    .put_aggregation_record(capture_record(&branch, spec))
                    .await?;
            }
        }

        let terminal = match outcome {
            BranchOutcome::Completed => BranchState::Completed,
            BranchOutcome::Cancelled => BranchState::Cancelled,
        };
        let record = CompletionRecord::new(&branch, outcome);
        self.lifecycle
            .destroy_branch(branch, terminal, root.counters)
            .await?;

        if root.async_leave {
            // No root lock taken here: append the record and make sure one
            // deferred job per wave will fold it in.
            self.store.append_completion_record(record).await?;
            self.leave_queue.enqueue(root.id, Utc::now()).await?;
            return Ok(TerminalDisposition::Deferred);
        }

        let (delta, policy) = match outcome {
            BranchOutcome::Completed => (CounterDelta::completion(), JoinPolicy::WithCondition),
            BranchOutcome::Cancelled => (CounterDelta::removal(), JoinPolicy::StructuralOnly),
        };
        match self.barrier.apply(root.id, &[delta], policy).await? {
            ApplyOutcome::Joined(_) => Ok(TerminalDisposition::Joined),
            ApplyOutcome::Updated(root) => {
                self.after_counters_updated(root).await?;
                Ok(TerminalDisposition::Applied)
            }
            ApplyOutcome::Stale => Ok(TerminalDisposition::Ignored),
        }
    }

    /// Post-update bookkeeping while the root stays running: refresh an eager
    /// aggregation overview and keep a sequential root moving.
    pub(crate) async fn after_counters_updated(
        &self,
        root: MultiInstanceRoot,
    ) -> Result<(), MultiInstanceError> {
        if let Some(spec) = root.aggregation.as_ref().filter(|spec| spec.eager) {
            let records = self.store.read_aggregation_records(root.id).await?;
            let overview = eager_overview(&records, root.next_loop_counter, spec);
            self.store
                .write_scope_variable(root.scope_id, &spec.target, overview)
                .await?;
        }
        if root.mode == ExecutionMode::Sequential
            && root.counters.nr_of_active_instances == 0
            && !root.pending_seeds.is_empty()
        {
            self.lifecycle.advance_sequential(root.id).await?;
        }
        Ok(())
    }
}
