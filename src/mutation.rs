//! Dynamic mutation of a running multi-instance root: appending one branch or
//! removing one in-flight branch.
//!
//! Preconditions are checked synchronously and a rejected call mutates
//! nothing. Lookups by activity reference require a unique live root.

use tracing::info;

use crate::completion::{ApplyOutcome, CounterDelta, JoinPolicy};
use crate::engine::{MultiInstanceEngine, MultiInstanceError};
use crate::planner::InstanceSeed;
use crate::store::StoreError;
use crate::tree::{
    BranchId, BranchOutcome, BranchState, ExecutionMode, MultiInstanceRoot, RootId, ScopeId,
    VariableScope,
};

/// Target of an `add_instance` call: an explicit root, or an activity
/// reference resolved within a scope.
#[derive(Clone, Debug)]
pub enum RootRef {
    Id(RootId),
    Activity {
        scope_id: ScopeId,
        activity_ref: String,
    },
}

/// Result of a successful `add_instance`.
#[derive(Clone, Copy, Debug)]
pub struct AddedInstance {
    pub root_id: RootId,
    pub loop_counter: i32,
    /// Set for parallel roots, where the branch activates immediately.
    /// Sequential roots only queue a seed.
    pub branch_id: Option<BranchId>,
}

impl MultiInstanceEngine {
    /// Append one branch to a running root.
    ///
    /// Parallel roots activate the new branch immediately at the next loop
    /// counter; sequential roots queue it behind every currently-planned
    /// index. Either way `nr_of_instances` grows by one under the root's
    /// optimistic lock.
    pub async fn add_instance(
        &self,
        target: RootRef,
        variables: VariableScope,
    ) -> Result<AddedInstance, MultiInstanceError> {
        let mut root = self.resolve_root(&target).await?;
        let root_id = root.id;

        for attempt in 0..self.config.counter_retry_limit.max(1) {
            if attempt > 0 {
                root = self
                    .store
                    .get_root(root_id)
                    .await?
                    .filter(MultiInstanceRoot::is_live)
                    .ok_or(MultiInstanceError::NoMultiInstanceRootFound)?;
            }
            let loop_counter = root.next_loop_counter;
            root.next_loop_counter += 1;
            root.counters.nr_of_instances += 1;
            let mut seed = InstanceSeed::new(loop_counter, None);
            seed.variables = variables.clone();

            match root.mode {
                ExecutionMode::Parallel => {
                    root.counters.nr_of_active_instances += 1;
                    match self.store.update_root(&root).await {
                        Ok(revision) => {
                            root.revision = revision;
                            let branch = self.lifecycle.materialize_branch(&root, &seed).await?;
                            info!(
                                root_id = %root_id,
                                loop_counter,
                                branch_id = %branch.id,
                                "instance added to parallel root"
                            );
                            return Ok(AddedInstance {
                                root_id,
                                loop_counter,
                                branch_id: Some(branch.id),
                            });
                        }
                        Err(StoreError::Conflict { .. }) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                ExecutionMode::Sequential => {
                    root.pending_seeds.push_back(seed);
                    match self.store.update_root(&root).await {
                        Ok(revision) => {
                            root.revision = revision;
                            if root.counters.nr_of_active_instances == 0 {
                                self.lifecycle.advance_sequential(root_id).await?;
                            }
                            info!(
                                root_id = %root_id,
                                loop_counter,
                                "instance appended to sequential root"
                            );
                            return Ok(AddedInstance {
                                root_id,
                                loop_counter,
                                branch_id: None,
                            });
                        }
                        Err(StoreError::Conflict { .. }) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        Err(MultiInstanceError::ConcurrentUpdateConflict(
            root_id,
            self.config.counter_retry_limit,
        ))
    }

    /// Remove one active branch from its root.
    ///
    /// With `mark_completed` the branch counts as a normal completion
    /// (condition evaluation and a possible join included); without it the
    /// branch is erased as if it had never been planned.
    pub async fn delete_instance(
        &self,
        branch_id: BranchId,
        mark_completed: bool,
    ) -> Result<(), MultiInstanceError> {
        let branch = self
            .store
            .get_branch(branch_id)
            .await?
            .ok_or(MultiInstanceError::BranchNotActive(branch_id))?;
        if branch.state != BranchState::Active {
            return Err(MultiInstanceError::BranchNotActive(branch_id));
        }
        let root = self
            .store
            .get_root(branch.root_id)
            .await?
            .filter(MultiInstanceRoot::is_live)
            .ok_or(MultiInstanceError::NoMultiInstanceRootFound)?;

        if mark_completed {
            self.finish_branch(branch, root, BranchOutcome::Completed)
                .await?;
            return Ok(());
        }

        let root_id = root.id;
        self.lifecycle
            .destroy_branch(branch, BranchState::Deleted, root.counters)
            .await?;
        info!(root_id = %root_id, branch_id = %branch_id, "instance deleted without completion");
        // The explicit completion condition is not consulted here, but the
        // structural join rule still is: deleting the last outstanding branch
        // must not strand the root.
        match self
            .barrier
            .apply(root_id, &[CounterDelta::removal()], JoinPolicy::StructuralOnly)
            .await?
        {
            ApplyOutcome::Updated(root) => self.after_counters_updated(root).await?,
            ApplyOutcome::Joined(_) | ApplyOutcome::Stale => {}
        }
        Ok(())
    }

    async fn resolve_root(
        &self,
        target: &RootRef,
    ) -> Result<MultiInstanceRoot, MultiInstanceError> {
        match target {
            RootRef::Id(id) => self
                .store
                .get_root(*id)
                .await?
                .filter(MultiInstanceRoot::is_live)
                .ok_or(MultiInstanceError::NoMultiInstanceRootFound),
            RootRef::Activity {
                scope_id,
                activity_ref,
            } => {
                let mut roots = self.store.find_live_roots(*scope_id, activity_ref).await?;
                match roots.len() {
                    0 => Err(MultiInstanceError::NoMultiInstanceRootFound),
                    1 => Ok(roots.pop().expect("length checked")),
                    _ => Err(MultiInstanceError::AmbiguousMultiInstanceRoot(
                        activity_ref.clone(),
                    )),
                }
            }
        }
    }
}
