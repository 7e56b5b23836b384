//! In-memory execution tree store for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::base::{StoreError, StoreResult, TreeStore};
use crate::tree::{
    AggregationRecord, Branch, BranchId, CompletionRecord, MultiInstanceRoot, RootId, RootState,
    ScopeId, VariableScope,
};

/// Store that keeps the whole tree behind mutexes, mirroring the optimistic
/// revision semantics of a database-backed implementation.
#[derive(Clone, Default)]
pub struct MemoryTreeStore {
    roots: Arc<Mutex<HashMap<RootId, MultiInstanceRoot>>>,
    branches: Arc<Mutex<HashMap<BranchId, Branch>>>,
    scopes: Arc<Mutex<HashMap<ScopeId, VariableScope>>>,
    aggregation: Arc<Mutex<HashMap<RootId, Vec<AggregationRecord>>>>,
    completions: Arc<Mutex<HashMap<RootId, Vec<CompletionRecord>>>>,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of roots currently stored, live or completing.
    pub fn root_count(&self) -> usize {
        self.roots.lock().expect("roots poisoned").len()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.lock().expect("branches poisoned").len()
    }
}

#[async_trait]
impl TreeStore for MemoryTreeStore {
    async fn insert_root(&self, root: MultiInstanceRoot) -> StoreResult<()> {
        let mut guard = self.roots.lock().expect("roots poisoned");
        guard.insert(root.id, root);
        Ok(())
    }

    async fn get_root(&self, id: RootId) -> StoreResult<Option<MultiInstanceRoot>> {
        let guard = self.roots.lock().expect("roots poisoned");
        Ok(guard.get(&id).cloned())
    }

    async fn find_live_roots(
        &self,
        scope_id: ScopeId,
        activity_ref: &str,
    ) -> StoreResult<Vec<MultiInstanceRoot>> {
        let guard = self.roots.lock().expect("roots poisoned");
        let mut roots: Vec<_> = guard
            .values()
            .filter(|root| {
                root.scope_id == scope_id
                    && root.activity_ref == activity_ref
                    && root.state == RootState::Running
            })
            .cloned()
            .collect();
        roots.sort_by_key(|root| root.created_at);
        Ok(roots)
    }

    async fn update_root(&self, root: &MultiInstanceRoot) -> StoreResult<i64> {
        let mut guard = self.roots.lock().expect("roots poisoned");
        let stored = guard.get_mut(&root.id).ok_or(StoreError::Conflict {
            root_id: root.id,
            expected: root.revision,
        })?;
        if stored.revision != root.revision {
            return Err(StoreError::Conflict {
                root_id: root.id,
                expected: root.revision,
            });
        }
        let mut next = root.clone();
        next.revision += 1;
        let revision = next.revision;
        *stored = next;
        Ok(revision)
    }

    async fn remove_root(&self, id: RootId) -> StoreResult<()> {
        self.roots.lock().expect("roots poisoned").remove(&id);
        Ok(())
    }

    async fn insert_branch(&self, branch: Branch) -> StoreResult<()> {
        let mut guard = self.branches.lock().expect("branches poisoned");
        guard.insert(branch.id, branch);
        Ok(())
    }

    async fn get_branch(&self, id: BranchId) -> StoreResult<Option<Branch>> {
        let guard = self.branches.lock().expect("branches poisoned");
        Ok(guard.get(&id).cloned())
    }

    async fn branches_for_root(&self, root_id: RootId) -> StoreResult<Vec<Branch>> {
        let guard = self.branches.lock().expect("branches poisoned");
        let mut branches: Vec<_> = guard
            .values()
            .filter(|branch| branch.root_id == root_id)
            .cloned()
            .collect();
        branches.sort_by_key(|branch| branch.loop_counter);
        Ok(branches)
    }

    async fn write_branch_variable(
        &self,
        branch_id: BranchId,
        name: &str,
        value: Value,
    ) -> StoreResult<()> {
        let mut guard = self.branches.lock().expect("branches poisoned");
        let branch = guard
            .get_mut(&branch_id)
            .ok_or_else(|| StoreError::Message(format!("branch not found: {branch_id}")))?;
        branch.variables.insert(name.to_string(), value);
        Ok(())
    }

    async fn remove_branch(&self, id: BranchId) -> StoreResult<()> {
        self.branches.lock().expect("branches poisoned").remove(&id);
        Ok(())
    }

    async fn create_scope(&self, variables: VariableScope) -> StoreResult<ScopeId> {
        let scope_id = ScopeId::new();
        let mut guard = self.scopes.lock().expect("scopes poisoned");
        guard.insert(scope_id, variables);
        Ok(scope_id)
    }

    async fn read_scope(&self, scope_id: ScopeId) -> StoreResult<VariableScope> {
        let guard = self.scopes.lock().expect("scopes poisoned");
        Ok(guard.get(&scope_id).cloned().unwrap_or_default())
    }

    async fn write_scope_variable(
        &self,
        scope_id: ScopeId,
        name: &str,
        value: Value,
    ) -> StoreResult<()> {
        let mut guard = self.scopes.lock().expect("scopes poisoned");
        guard
            .entry(scope_id)
            .or_default()
            .insert(name.to_string(), value);
        Ok(())
    }

    async fn put_aggregation_record(&self, record: AggregationRecord) -> StoreResult<()> {
        let mut guard = self.aggregation.lock().expect("aggregation poisoned");
        guard.entry(record.root_id).or_default().push(record);
        Ok(())
    }

    async fn read_aggregation_records(
        &self,
        root_id: RootId,
    ) -> StoreResult<Vec<AggregationRecord>> {
        let guard = self.aggregation.lock().expect("aggregation poisoned");
        Ok(guard.get(&root_id).cloned().unwrap_or_default())
    }

    async fn take_aggregation_records(
        &self,
        root_id: RootId,
    ) -> StoreResult<Vec<AggregationRecord>> {
        let mut guard = self.aggregation.lock().expect("aggregation poisoned");
        Ok(guard.remove(&root_id).unwrap_or_default())
    }

    async fn append_completion_record(&self, record: CompletionRecord) -> StoreResult<()> {
        let mut guard = self.completions.lock().expect("completions poisoned");
        guard.entry(record.root_id).or_default().push(record);
        Ok(())
    }

    async fn read_completion_records(
        &self,
        root_id: RootId,
        limit: usize,
    ) -> StoreResult<Vec<CompletionRecord>> {
        let guard = self.completions.lock().expect("completions poisoned");
        Ok(guard
            .get(&root_id)
            .map(|records| records.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_completion_records(&self, ids: &[Uuid]) -> StoreResult<()> {
        let mut guard = self.completions.lock().expect("completions poisoned");
        for records in guard.values_mut() {
            records.retain(|record| !ids.contains(&record.id));
        }
        guard.retain(|_, records| !records.is_empty());
        Ok(())
    }

    async fn count_completion_records(&self, root_id: RootId) -> StoreResult<usize> {
        let guard = self.completions.lock().expect("completions poisoned");
        Ok(guard.get(&root_id).map(Vec::len).unwrap_or(0))
    }
}
