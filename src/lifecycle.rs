//! Branch lifecycle management: materializing and destroying branches under a
//! multi-instance root.
//!
//! The root exclusively owns its branches' lifecycle. Parallel roots fan out
//! every planned branch eagerly; sequential roots materialize one branch at a
//! time and keep the remaining planned indices as seeds on the root until
//! they are reached.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info};

use crate::engine::MultiInstanceError;
use crate::events::{ActivityEvent, ActivityEventKind, EventSink};
use crate::planner::InstanceSeed;
use crate::store::{StoreError, TreeStore};
use crate::tree::{
    Branch, BranchState, ExecutionMode, MultiInstanceRoot, RootCounters, RootId, RootState,
};

#[derive(Clone)]
pub struct BranchLifecycle {
    store: Arc<dyn TreeStore>,
    events: Arc<dyn EventSink>,
    retry_limit: u32,
}

impl BranchLifecycle {
    pub fn new(store: Arc<dyn TreeStore>, events: Arc<dyn EventSink>, retry_limit: u32) -> Self {
        Self {
            store,
            events,
            retry_limit: retry_limit.max(1),
        }
    }

    /// Allocate the root and fan out its initial branches.
    ///
    /// The caller guarantees a non-empty seed list; empty plans complete
    /// immediately and never reach the lifecycle manager.
    pub async fn create_root(
        &self,
        mut root: MultiInstanceRoot,
        seeds: Vec<InstanceSeed>,
    ) -> Result<MultiInstanceRoot, MultiInstanceError> {
        debug_assert!(!seeds.is_empty());
        let total = seeds.len() as i32;
        root.counters = RootCounters {
            nr_of_instances: total,
            nr_of_active_instances: match root.mode {
                ExecutionMode::Parallel => total,
                ExecutionMode::Sequential => 1,
            },
            nr_of_completed_instances: 0,
        };
        root.next_loop_counter = total;

        let mut seeds = VecDeque::from(seeds);
        let eager: Vec<InstanceSeed> = match root.mode {
            ExecutionMode::Parallel => seeds.drain(..).collect(),
            ExecutionMode::Sequential => {
                vec![seeds.pop_front().expect("seed list checked non-empty")]
            }
        };
        root.pending_seeds = seeds;

        self.store.insert_root(root.clone()).await?;
        self.events.publish(ActivityEvent::aggregate(
            ActivityEventKind::ActivityStarted,
            &root.activity_ref,
            Some(root.id),
            root.counters,
        ));
        info!(
            root_id = %root.id,
            activity = %root.activity_ref,
            mode = root.mode.as_str(),
            instances = total,
            "multi-instance root activated"
        );
        for seed in &eager {
            self.materialize_branch(&root, seed).await?;
        }
        Ok(root)
    }

    /// Materialize the next planned branch of a sequential root, if the root
    /// is still running, idle, and has seeds left.
    pub async fn advance_sequential(
        &self,
        root_id: RootId,
    ) -> Result<Option<Branch>, MultiInstanceError> {
        for _ in 0..self.retry_limit {
            let Some(mut root) = self.store.get_root(root_id).await? else {
                return Ok(None);
            };
            if root.state != RootState::Running || root.counters.nr_of_active_instances > 0 {
                return Ok(None);
            }
            let Some(seed) = root.pending_seeds.pop_front() else {
                return Ok(None);
            };
            root.counters.nr_of_active_instances += 1;
            match self.store.update_root(&root).await {
                Ok(revision) => {
                    root.revision = revision;
                    let branch = self.materialize_branch(&root, &seed).await?;
                    return Ok(Some(branch));
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

    /// Detach a branch from the tree with its terminal state and notify.
    /// Branch locals die with the branch; the aggregator captures what it
    /// needs before this point.
    pub async fn destroy_branch(
        &self,
        mut branch: Branch,
        terminal: BranchState,
        counters: RootCounters,
    ) -> Result<(), MultiInstanceError> {
        debug_assert!(terminal.is_terminal());
        branch.state = terminal;
        self.store.remove_branch(branch.id).await?;
        self.events.publish(ActivityEvent::branch(
            ActivityEventKind::BranchEnded,
            &branch.activity_ref,
            branch.root_id,
            branch.id,
            branch.loop_counter,
            Some(terminal),
            counters,
        ));
        debug!(
            branch_id = %branch.id,
            loop_counter = branch.loop_counter,
            state = terminal.as_str(),
            "branch destroyed"
        );
        Ok(())
    }

    pub(crate) async fn materialize_branch(
        &self,
        root: &MultiInstanceRoot,
        seed: &InstanceSeed,
    ) -> Result<Branch, MultiInstanceError> {
        let mut branch = Branch::from_seed(root, seed);
        branch.activate();
        self.store.insert_branch(branch.clone()).await?;
        self.events.publish(ActivityEvent::branch(
            ActivityEventKind::BranchStarted,
            &root.activity_ref,
            root.id,
            branch.id,
            branch.loop_counter,
            None,
            root.counters,
        ));
        Ok(branch)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::events::RecordingSink;
    use crate::store::MemoryTreeStore;
    use crate::tree::ScopeId;

    fn root(mode: ExecutionMode) -> MultiInstanceRoot {
        MultiInstanceRoot {
            id: RootId::new(),
            scope_id: ScopeId::new(),
            activity_ref: "review".to_string(),
            mode,
            state: RootState::Running,
            counters: RootCounters::default(),
            completion_condition: None,
            element_variable: Some("assignee".to_string()),
            aggregation: None,
            pending_seeds: VecDeque::new(),
            next_loop_counter: 0,
            async_leave: false,
            revision: 0,
            created_at: Utc::now(),
        }
    }

    fn seeds(elements: &[&str]) -> Vec<InstanceSeed> {
        elements
            .iter()
            .enumerate()
            .map(|(index, element)| InstanceSeed::new(index as i32, Some(json!(element))))
            .collect()
    }

    #[tokio::test]
    async fn parallel_roots_fan_out_eagerly() {
        let store = Arc::new(MemoryTreeStore::new());
        let sink = RecordingSink::new();
        let lifecycle = BranchLifecycle::new(store.clone(), Arc::new(sink.clone()), 4);

        let root = lifecycle
            .create_root(root(ExecutionMode::Parallel), seeds(&["ann", "bo", "cy"]))
            .await
            .unwrap();

        assert_eq!(root.counters.nr_of_active_instances, 3);
        assert_eq!(root.counters.nr_of_instances, 3);
        let branches = store.branches_for_root(root.id).await.unwrap();
        assert_eq!(branches.len(), 3);
        assert!(branches.iter().all(|b| b.state == BranchState::Active));
        assert_eq!(branches[1].variables["assignee"], json!("bo"));

        let started = sink.of_kind(ActivityEventKind::BranchStarted);
        assert_eq!(started.len(), 3);
        // The aggregate activation carries no loop counter.
        let aggregate = sink.of_kind(ActivityEventKind::ActivityStarted);
        assert_eq!(aggregate.len(), 1);
        assert!(aggregate[0].loop_counter.is_none());
    }

    #[tokio::test]
    async fn sequential_roots_materialize_one_branch() {
        let store = Arc::new(MemoryTreeStore::new());
        let sink = RecordingSink::new();
        let lifecycle = BranchLifecycle::new(store.clone(), Arc::new(sink.clone()), 4);

        let root = lifecycle
            .create_root(root(ExecutionMode::Sequential), seeds(&["ann", "bo", "cy"]))
            .await
            .unwrap();

        assert_eq!(root.counters.nr_of_active_instances, 1);
        assert_eq!(root.pending_seeds.len(), 2);
        let branches = store.branches_for_root(root.id).await.unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].loop_counter, 0);
    }

    #[tokio::test]
    async fn advance_materializes_the_next_seed() {
        let store = Arc::new(MemoryTreeStore::new());
        let sink = RecordingSink::new();
        let lifecycle = BranchLifecycle::new(store.clone(), Arc::new(sink.clone()), 4);

        let created = lifecycle
            .create_root(root(ExecutionMode::Sequential), seeds(&["ann", "bo"]))
            .await
            .unwrap();
        let first = store.branches_for_root(created.id).await.unwrap();
        store.remove_branch(first[0].id).await.unwrap();

        // Active count still reads 1; advance refuses until it drops.
        assert!(
            lifecycle
                .advance_sequential(created.id)
                .await
                .unwrap()
                .is_none()
        );

        let mut stored = store.get_root(created.id).await.unwrap().unwrap();
        stored.counters.nr_of_active_instances = 0;
        store.update_root(&stored).await.unwrap();

        let next = lifecycle
            .advance_sequential(created.id)
            .await
            .unwrap()
            .expect("second branch");
        assert_eq!(next.loop_counter, 1);
        assert_eq!(next.variables["assignee"], json!("bo"));
    }
}
