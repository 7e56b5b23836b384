//! Execution-tree data model for multi-instance activations.
//!
//! The tree is an arena of nodes addressed by id: a `MultiInstanceRoot`
//! coordinates one activation of a repeating activity, and each `Branch` is
//! one instantiation of it. Roots own the lifecycle of their branches;
//! branches hold a back-reference by id only.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::aggregation::AggregationSpec;
use crate::planner::InstanceSeed;

/// Raised when a stored state string cannot be interpreted.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StateParseError(pub String);

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(RootId);
id_newtype!(BranchId);
id_newtype!(ScopeId);

/// Per-branch local variables and enclosing-scope variables.
pub type VariableScope = HashMap<String, Value>;

/// Name of the branch-local variable carrying the sequence index.
pub const LOOP_COUNTER_VAR: &str = "loopCounter";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
        }
    }
}

impl TryFrom<&str> for ExecutionMode {
    type Error = StateParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "sequential" => Ok(ExecutionMode::Sequential),
            "parallel" => Ok(ExecutionMode::Parallel),
            _ => Err(StateParseError(format!("unknown execution mode: {value}"))),
        }
    }
}

/// Branch lifecycle: `Created -> Active -> {Completed | Cancelled | Deleted}`.
/// Terminal states are final; a branch never re-enters `Active`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    Created,
    Active,
    Completed,
    Cancelled,
    Deleted,
}

impl BranchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BranchState::Completed | BranchState::Cancelled | BranchState::Deleted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BranchState::Created => "created",
            BranchState::Active => "active",
            BranchState::Completed => "completed",
            BranchState::Cancelled => "cancelled",
            BranchState::Deleted => "deleted",
        }
    }
}

impl TryFrom<&str> for BranchState {
    type Error = StateParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "created" => Ok(BranchState::Created),
            "active" => Ok(BranchState::Active),
            "completed" => Ok(BranchState::Completed),
            "cancelled" => Ok(BranchState::Cancelled),
            "deleted" => Ok(BranchState::Deleted),
            _ => Err(StateParseError(format!("unknown branch state: {value}"))),
        }
    }
}

/// Terminal outcome reported for a branch by the executing work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchOutcome {
    Completed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootState {
    Running,
    Completing,
}

/// Aggregate instance counters tracked on the root.
///
/// Invariant: `nr_of_active_instances + nr_of_completed_instances <=
/// nr_of_instances`; sequential roots keep `nr_of_active_instances` in
/// `{0, 1}`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootCounters {
    pub nr_of_instances: i32,
    pub nr_of_active_instances: i32,
    pub nr_of_completed_instances: i32,
}

/// Coordinating node for one activation of a repeating activity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiInstanceRoot {
    pub id: RootId,
    pub scope_id: ScopeId,
    pub activity_ref: String,
    pub mode: ExecutionMode,
    pub state: RootState,
    pub counters: RootCounters,
    pub completion_condition: Option<String>,
    pub element_variable: Option<String>,
    pub aggregation: Option<AggregationSpec>,
    /// Sequential-only: planned indices not yet materialized as branches.
    pub pending_seeds: VecDeque<InstanceSeed>,
    /// Monotonic loop-counter cursor. Never decremented, so a deleted index
    /// is never reused by a later `add_instance`.
    pub next_loop_counter: i32,
    pub async_leave: bool,
    /// Optimistic-lock revision, checked and incremented on every write.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
}

impl MultiInstanceRoot {
    pub fn is_live(&self) -> bool {
        self.state == RootState::Running
    }
}

/// One instantiation of the repeating activity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub root_id: RootId,
    pub activity_ref: String,
    pub loop_counter: i32,
    pub state: BranchState,
    /// Branch-local variables, owned exclusively by this branch until the
    /// aggregator captures them.
    pub variables: VariableScope,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    /// Materialize a branch for a planned seed. The resolved collection
    /// element (if any) and the loop counter land in the branch locals.
    pub fn from_seed(root: &MultiInstanceRoot, seed: &InstanceSeed) -> Self {
        let mut variables = seed.variables.clone();
        if let Some(name) = &root.element_variable {
            if let Some(element) = &seed.element {
                variables.insert(name.clone(), element.clone());
            }
        }
        variables.insert(LOOP_COUNTER_VAR.to_string(), json!(seed.loop_counter));
        Self {
            id: BranchId::new(),
            root_id: root.id,
            activity_ref: root.activity_ref.clone(),
            loop_counter: seed.loop_counter,
            state: BranchState::Created,
            variables,
            created_at: Utc::now(),
        }
    }

    pub fn activate(&mut self) {
        debug_assert_eq!(self.state, BranchState::Created);
        self.state = BranchState::Active;
    }
}

/// Transient, branch-scoped snapshot of the aggregatable variables, keyed by
/// the branch's loop counter. Consumed and deleted when the root joins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregationRecord {
    pub root_id: RootId,
    pub loop_counter: i32,
    pub values: VariableScope,
}

/// Append-only record of one branch terminal event, used by the async leave
/// path so completions do not contend on the root row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub id: Uuid,
    pub root_id: RootId,
    pub branch_id: BranchId,
    pub loop_counter: i32,
    pub outcome: BranchOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl CompletionRecord {
    pub fn new(branch: &Branch, outcome: BranchOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            root_id: branch.root_id,
            branch_id: branch.id,
            loop_counter: branch.loop_counter,
            outcome,
            recorded_at: Utc::now(),
        }
    }
}
