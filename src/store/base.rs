//! Execution tree store interface.
//!
//! The store persists roots, branches, enclosing-scope variables, and the
//! transient aggregation/completion records. Root writes are guarded by an
//! optimistic-lock revision; a losing writer gets a distinguishable
//! [`StoreError::Conflict`] and is expected to re-read before retrying.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::tree::{
    AggregationRecord, Branch, BranchId, CompletionRecord, MultiInstanceRoot, RootId, ScopeId,
    VariableScope,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic-lock check failed; re-read and retry.
    #[error("optimistic lock conflict on root {root_id} at revision {expected}")]
    Conflict { root_id: RootId, expected: i64 },
    #[error("{0}")]
    Message(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Abstract persistence backend for the execution tree.
#[async_trait]
pub trait TreeStore: Send + Sync {
    async fn insert_root(&self, root: MultiInstanceRoot) -> StoreResult<()>;

    async fn get_root(&self, id: RootId) -> StoreResult<Option<MultiInstanceRoot>>;

    /// All live (`Running`) roots for an activity reference within a scope.
    async fn find_live_roots(
        &self,
        scope_id: ScopeId,
        activity_ref: &str,
    ) -> StoreResult<Vec<MultiInstanceRoot>>;

    /// Write the root back if and only if the stored revision matches
    /// `root.revision`. Returns the new revision on success; a mismatch (or a
    /// root removed by a concurrent join) surfaces as [`StoreError::Conflict`].
    async fn update_root(&self, root: &MultiInstanceRoot) -> StoreResult<i64>;

    async fn remove_root(&self, id: RootId) -> StoreResult<()>;

    async fn insert_branch(&self, branch: Branch) -> StoreResult<()>;

    async fn get_branch(&self, id: BranchId) -> StoreResult<Option<Branch>>;

    async fn branches_for_root(&self, root_id: RootId) -> StoreResult<Vec<Branch>>;

    /// Branch-local variable write, used by the executing work to publish its
    /// results before reporting the branch terminal.
    async fn write_branch_variable(
        &self,
        branch_id: BranchId,
        name: &str,
        value: Value,
    ) -> StoreResult<()>;

    async fn remove_branch(&self, id: BranchId) -> StoreResult<()>;

    async fn create_scope(&self, variables: VariableScope) -> StoreResult<ScopeId>;

    async fn read_scope(&self, scope_id: ScopeId) -> StoreResult<VariableScope>;

    async fn write_scope_variable(
        &self,
        scope_id: ScopeId,
        name: &str,
        value: Value,
    ) -> StoreResult<()>;

    async fn put_aggregation_record(&self, record: AggregationRecord) -> StoreResult<()>;

    async fn read_aggregation_records(&self, root_id: RootId)
    -> StoreResult<Vec<AggregationRecord>>;

    /// Read and delete all aggregation records for a root in one step.
    async fn take_aggregation_records(&self, root_id: RootId)
    -> StoreResult<Vec<AggregationRecord>>;

    async fn append_completion_record(&self, record: CompletionRecord) -> StoreResult<()>;

    /// Outstanding completion records for a root, oldest first, up to `limit`.
    async fn read_completion_records(
        &self,
        root_id: RootId,
        limit: usize,
    ) -> StoreResult<Vec<CompletionRecord>>;

    async fn delete_completion_records(&self, ids: &[Uuid]) -> StoreResult<()>;

    async fn count_completion_records(&self, root_id: RootId) -> StoreResult<usize>;
}
