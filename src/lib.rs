//! Ramify - multi-instance branch runtime for process orchestration.
//!
//! Executes a repeating activity as a set of branches under a multi-instance
//! root: planning cardinality, fanning branches out (sequential or parallel),
//! joining them exactly once under contention, mutating a running root, and
//! aggregating per-branch results into one ordered overview.

pub mod aggregation;
pub mod backoff;
pub mod completion;
pub mod config;
pub mod engine;
pub mod events;
pub mod expression;
pub mod leave;
pub mod lifecycle;
pub mod mutation;
pub mod planner;
pub mod store;
pub mod tree;

pub use aggregation::AggregationSpec;
pub use backoff::BackoffConfig;
pub use completion::{ApplyOutcome, CounterDelta, JoinBarrier, JoinPolicy};
pub use config::{EngineConfig, LeaveConfig};
pub use engine::{
    LeaveJobOutcome, MultiInstanceEngine, MultiInstanceError, PlanOutcome, TerminalDisposition,
};
pub use events::{ActivityEvent, ActivityEventKind, EventSink, RecordingSink, TracingSink};
pub use expression::{EvaluationError, ExpressionEvaluator, ScopeLookupEvaluator};
pub use leave::{
    DeferredLeaveJob, JobId, JobState, LeaveQueue, LeaveTask, MemoryLeaveQueue, spawn_leave_task,
};
pub use mutation::{AddedInstance, RootRef};
pub use planner::{CardinalitySource, InstanceSeed, PlanInput};
pub use store::{MemoryTreeStore, StoreError, StoreResult, TreeStore};
pub use tree::{
    AggregationRecord, Branch, BranchId, BranchOutcome, BranchState, CompletionRecord,
    ExecutionMode, MultiInstanceRoot, RootCounters, RootId, RootState, ScopeId, VariableScope,
};
