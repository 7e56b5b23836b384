//! Integration tests for the synchronous multi-instance lifecycle:
//! planning, fan-out, join evaluation, dynamic mutation, and aggregation.

use serde_json::json;

use ramify::{
    ActivityEventKind, BranchOutcome, BranchState, CardinalitySource, ExecutionMode,
    MultiInstanceError, PlanOutcome, RootRef, TerminalDisposition, TreeStore, VariableScope,
};

use harness::{HALF_DONE_CONDITION, TestRig, collection_source, plan, result_aggregation};

#[tokio::test]
async fn zero_cardinality_completes_immediately_without_a_root() {
    let rig = TestRig::new();
    let scope_id = rig.scope(VariableScope::new()).await;

    let mut input = plan(scope_id, ExecutionMode::Parallel, CardinalitySource::Fixed(0));
    input.aggregation = Some(result_aggregation());
    let outcome = rig.engine.plan_and_activate(input).await.unwrap();

    assert_eq!(outcome, PlanOutcome::ImmediateComplete);
    assert_eq!(rig.store.root_count(), 0);
    assert_eq!(rig.store.branch_count(), 0);

    // No listener ever observes a loop counter; "ran and joined empty" still
    // materializes an empty overview.
    let events = rig.sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ActivityEventKind::ActivityCompleted);
    assert!(events[0].loop_counter.is_none());
    let scope = rig.store.read_scope(scope_id).await.unwrap();
    assert_eq!(scope["reviews"], json!([]));
}

#[tokio::test]
async fn empty_collection_completes_immediately() {
    let rig = TestRig::new();
    let mut variables = VariableScope::new();
    variables.insert("assignees".to_string(), json!([]));
    let scope_id = rig.scope(variables).await;

    let outcome = rig
        .engine
        .plan_and_activate(plan(
            scope_id,
            ExecutionMode::Sequential,
            collection_source("assignees", "assignee"),
        ))
        .await
        .unwrap();

    assert_eq!(outcome, PlanOutcome::ImmediateComplete);
    assert_eq!(rig.store.root_count(), 0);
}

#[tokio::test]
async fn planning_errors_create_nothing() {
    let rig = TestRig::new();
    let scope_id = rig.scope(VariableScope::new()).await;

    let err = rig
        .engine
        .plan_and_activate(plan(
            scope_id,
            ExecutionMode::Parallel,
            collection_source("assignees", "assignee"),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, MultiInstanceError::CollectionVariableMissing(_)));

    let err = rig
        .engine
        .plan_and_activate(plan(
            scope_id,
            ExecutionMode::Parallel,
            CardinalitySource::Fixed(-2),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, MultiInstanceError::IllegalCardinality(-2)));

    assert_eq!(rig.store.root_count(), 0);
    assert!(rig.sink.events().is_empty());
}

#[tokio::test]
async fn parallel_plan_activates_every_branch_eagerly() {
    let rig = TestRig::new();
    let mut variables = VariableScope::new();
    variables.insert("assignees".to_string(), json!(["ann", "bo", "cy", "dee"]));
    let scope_id = rig.scope(variables).await;

    let root_id = rig
        .activate(plan(
            scope_id,
            ExecutionMode::Parallel,
            collection_source("assignees", "assignee"),
        ))
        .await;

    let root = rig.store.get_root(root_id).await.unwrap().unwrap();
    assert_eq!(root.counters.nr_of_instances, 4);
    assert_eq!(root.counters.nr_of_active_instances, 4);
    assert_eq!(root.counters.nr_of_completed_instances, 0);

    let branches = rig.branches(root_id).await;
    assert_eq!(branches.len(), 4);
    assert!(branches.iter().all(|b| b.state == BranchState::Active));
    assert_eq!(branches[2].variables["assignee"], json!("cy"));
    assert_eq!(branches[2].variables["loopCounter"], json!(2));
}

#[tokio::test]
async fn sequential_plan_runs_one_branch_at_a_time_in_order() {
    let rig = TestRig::new();
    let scope_id = rig.scope(VariableScope::new()).await;

    let root_id = rig
        .activate(plan(
            scope_id,
            ExecutionMode::Sequential,
            CardinalitySource::Fixed(3),
        ))
        .await;

    for expected in 0..3 {
        let branches = rig.branches(root_id).await;
        assert_eq!(branches.len(), 1, "one active branch at a time");
        assert_eq!(branches[0].loop_counter, expected);
        let disposition = rig.complete(&branches[0]).await;
        if expected < 2 {
            assert_eq!(disposition, TerminalDisposition::Applied);
        } else {
            assert_eq!(disposition, TerminalDisposition::Joined);
        }
    }

    // Strictly increasing activation order, and every start event saw at
    // most one active instance.
    let started: Vec<i32> = rig
        .sink
        .of_kind(ActivityEventKind::BranchStarted)
        .into_iter()
        .filter_map(|event| event.loop_counter)
        .collect();
    assert_eq!(started, vec![0, 1, 2]);
    assert!(
        rig.sink
            .of_kind(ActivityEventKind::BranchStarted)
            .iter()
            .all(|event| event.counters.nr_of_active_instances <= 1)
    );

    assert_eq!(rig.store.root_count(), 0);
    assert_eq!(
        rig.sink.of_kind(ActivityEventKind::ActivityCompleted).len(),
        1
    );
}

#[tokio::test]
async fn parallel_root_joins_when_all_branches_complete() {
    let rig = TestRig::new();
    let scope_id = rig.scope(VariableScope::new()).await;
    let root_id = rig
        .activate(plan(
            scope_id,
            ExecutionMode::Parallel,
            CardinalitySource::Fixed(2),
        ))
        .await;

    let branches = rig.branches(root_id).await;
    assert_eq!(rig.complete(&branches[0]).await, TerminalDisposition::Applied);
    assert_eq!(rig.complete(&branches[1]).await, TerminalDisposition::Joined);

    assert_eq!(rig.store.root_count(), 0);
    assert_eq!(rig.store.branch_count(), 0);
    assert_eq!(rig.ended_with(BranchState::Completed), vec![0, 1]);
}

#[tokio::test]
async fn completion_condition_joins_early_and_cancels_the_rest() {
    let _ = tracing_subscriber::fmt::try_init();
    let rig = TestRig::new();
    let scope_id = rig.scope(VariableScope::new()).await;
    let mut input = plan(
        scope_id,
        ExecutionMode::Parallel,
        CardinalitySource::Fixed(5),
    );
    input.completion_condition = Some(HALF_DONE_CONDITION.to_string());
    let root_id = rig.activate(input).await;

    // Complete 1, 0, 2: the third completion satisfies completed*2 >= 5.
    for (loop_counter, expected) in [
        (1, TerminalDisposition::Applied),
        (0, TerminalDisposition::Applied),
        (2, TerminalDisposition::Joined),
    ] {
        let branch = rig.branch_at(root_id, loop_counter).await;
        assert_eq!(rig.complete(&branch).await, expected);
    }

    assert_eq!(rig.store.root_count(), 0);
    assert_eq!(rig.store.branch_count(), 0);

    let mut completed = rig.ended_with(BranchState::Completed);
    completed.sort();
    assert_eq!(completed, vec![0, 1, 2]);
    let mut cancelled = rig.ended_with(BranchState::Cancelled);
    cancelled.sort();
    assert_eq!(cancelled, vec![3, 4], "branches 3 and 4 never complete");
    assert_eq!(
        rig.sink.of_kind(ActivityEventKind::ActivityCompleted).len(),
        1,
        "exactly one join"
    );
}

#[tokio::test]
async fn late_completion_after_join_is_a_no_op() {
    let rig = TestRig::new();
    let scope_id = rig.scope(VariableScope::new()).await;
    let mut input = plan(
        scope_id,
        ExecutionMode::Parallel,
        CardinalitySource::Fixed(2),
    );
    input.completion_condition = Some(HALF_DONE_CONDITION.to_string());
    let root_id = rig.activate(input).await;

    let straggler = rig.branch_at(root_id, 1).await;
    let first = rig.branch_at(root_id, 0).await;
    assert_eq!(rig.complete(&first).await, TerminalDisposition::Joined);

    // The straggler was cancelled by the join; its own completion arrives
    // afterwards and must change nothing.
    assert_eq!(rig.complete(&straggler).await, TerminalDisposition::Ignored);
    assert_eq!(rig.store.root_count(), 0);
    assert_eq!(
        rig.sink.of_kind(ActivityEventKind::ActivityCompleted).len(),
        1
    );
}

#[tokio::test]
async fn delete_instance_without_completion_erases_the_branch() {
    let rig = TestRig::new();
    let scope_id = rig.scope(VariableScope::new()).await;
    let root_id = rig
        .activate(plan(
            scope_id,
            ExecutionMode::Parallel,
            CardinalitySource::Fixed(3),
        ))
        .await;

    let victim = rig.branch_at(root_id, 1).await;
    rig.engine.delete_instance(victim.id, false).await.unwrap();

    let root = rig.store.get_root(root_id).await.unwrap().unwrap();
    assert_eq!(root.counters.nr_of_instances, 2);
    assert_eq!(root.counters.nr_of_active_instances, 2);
    assert_eq!(root.counters.nr_of_completed_instances, 0);
    assert_eq!(rig.ended_with(BranchState::Deleted), vec![1]);

    // Deleting it again is a precondition failure and mutates nothing.
    let err = rig.engine.delete_instance(victim.id, false).await.unwrap_err();
    assert!(matches!(err, MultiInstanceError::BranchNotActive(_)));
}

#[tokio::test]
async fn delete_instance_marked_completed_can_join_the_root() {
    let rig = TestRig::new();
    let scope_id = rig.scope(VariableScope::new()).await;
    let root_id = rig
        .activate(plan(
            scope_id,
            ExecutionMode::Parallel,
            CardinalitySource::Fixed(2),
        ))
        .await;

    let first = rig.branch_at(root_id, 0).await;
    rig.complete(&first).await;
    let second = rig.branch_at(root_id, 1).await;
    rig.engine.delete_instance(second.id, true).await.unwrap();

    assert_eq!(rig.store.root_count(), 0);
    let mut completed = rig.ended_with(BranchState::Completed);
    completed.sort();
    assert_eq!(completed, vec![0, 1]);
}

#[tokio::test]
async fn add_instance_to_parallel_root_activates_immediately() {
    let rig = TestRig::new();
    let scope_id = rig.scope(VariableScope::new()).await;
    let root_id = rig
        .activate(plan(
            scope_id,
            ExecutionMode::Parallel,
            CardinalitySource::Fixed(3),
        ))
        .await;

    let mut extra = VariableScope::new();
    extra.insert("assignee".to_string(), json!("late-joiner"));
    let added = rig
        .engine
        .add_instance(RootRef::Id(root_id), extra)
        .await
        .unwrap();

    assert_eq!(added.loop_counter, 3);
    let branch = rig.branch_at(root_id, 3).await;
    assert_eq!(Some(branch.id), added.branch_id);
    assert_eq!(branch.state, BranchState::Active);
    assert_eq!(branch.variables["assignee"], json!("late-joiner"));

    let root = rig.store.get_root(root_id).await.unwrap().unwrap();
    assert_eq!(root.counters.nr_of_instances, 4);
    assert_eq!(root.counters.nr_of_active_instances, 4);
}

#[tokio::test]
async fn add_instance_to_sequential_root_appends_at_the_end() {
    let rig = TestRig::new();
    let scope_id = rig.scope(VariableScope::new()).await;
    let root_id = rig
        .activate(plan(
            scope_id,
            ExecutionMode::Sequential,
            CardinalitySource::Fixed(3),
        ))
        .await;

    let added = rig
        .engine
        .add_instance(RootRef::Id(root_id), VariableScope::new())
        .await
        .unwrap();
    assert_eq!(added.loop_counter, 3);
    assert!(added.branch_id.is_none(), "sequential adds only queue a seed");

    // Completing 0, 1, 2 activates 1, 2, 3 in turn; the appended index runs
    // last.
    for _ in 0..3 {
        let branches = rig.branches(root_id).await;
        assert_eq!(branches.len(), 1);
        rig.complete(&branches[0]).await;
    }
    let last = rig.branches(root_id).await;
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].loop_counter, 3);

    assert_eq!(rig.complete(&last[0]).await, TerminalDisposition::Joined);
    let started: Vec<i32> = rig
        .sink
        .of_kind(ActivityEventKind::BranchStarted)
        .into_iter()
        .filter_map(|event| event.loop_counter)
        .collect();
    assert_eq!(started, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn ambiguous_activity_lookup_rejects_the_mutation() {
    let rig = TestRig::new();
    let scope_id = rig.scope(VariableScope::new()).await;
    let first = rig
        .activate(plan(
            scope_id,
            ExecutionMode::Parallel,
            CardinalitySource::Fixed(2),
        ))
        .await;
    rig.activate(plan(
        scope_id,
        ExecutionMode::Parallel,
        CardinalitySource::Fixed(2),
    ))
    .await;

    let err = rig
        .engine
        .add_instance(
            RootRef::Activity {
                scope_id,
                activity_ref: "review-item".to_string(),
            },
            VariableScope::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MultiInstanceError::AmbiguousMultiInstanceRoot(_)
    ));

    // Nothing moved.
    let root = rig.store.get_root(first).await.unwrap().unwrap();
    assert_eq!(root.counters.nr_of_instances, 2);
    assert_eq!(rig.store.branch_count(), 4);
}

#[tokio::test]
async fn missing_root_lookup_is_rejected() {
    let rig = TestRig::new();
    let err = rig
        .engine
        .add_instance(RootRef::Id(ramify::RootId::new()), VariableScope::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MultiInstanceError::NoMultiInstanceRootFound));
}

#[tokio::test]
async fn aggregation_orders_results_by_loop_counter() {
    let rig = TestRig::new();
    let mut variables = VariableScope::new();
    variables.insert("assignees".to_string(), json!(["ann", "bo", "cy"]));
    let scope_id = rig.scope(variables).await;

    let mut input = plan(
        scope_id,
        ExecutionMode::Parallel,
        collection_source("assignees", "assignee"),
    );
    input.aggregation = Some(result_aggregation());
    let root_id = rig.activate(input).await;

    // Finish in the order cy, ann, bo; the overview still reads in creation
    // order.
    for (loop_counter, result) in [(2, "cy-result"), (0, "ann-result"), (1, "bo-result")] {
        let branch = rig.branch_at(root_id, loop_counter).await;
        rig.store
            .write_branch_variable(branch.id, "result", json!(result))
            .await
            .unwrap();
        rig.complete(&branch).await;
    }

    let scope = rig.store.read_scope(scope_id).await.unwrap();
    assert_eq!(
        scope["reviews"],
        json!(["ann-result", "bo-result", "cy-result"])
    );
    // No aggregation state outlives the joined root.
    assert!(
        rig.store
            .read_aggregation_records(root_id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn eager_aggregation_exposes_a_padded_overview_while_running() {
    let rig = TestRig::new();
    let scope_id = rig.scope(VariableScope::new()).await;
    let mut input = plan(
        scope_id,
        ExecutionMode::Parallel,
        CardinalitySource::Fixed(3),
    );
    input.aggregation = Some(result_aggregation().eager());
    let root_id = rig.activate(input).await;

    let branch = rig.branch_at(root_id, 1).await;
    rig.store
        .write_branch_variable(branch.id, "result", json!("bo-result"))
        .await
        .unwrap();
    rig.complete(&branch).await;

    let scope = rig.store.read_scope(scope_id).await.unwrap();
    assert_eq!(scope["reviews"], json!([null, "bo-result", null]));
}

#[tokio::test]
async fn cancelling_a_root_tears_it_down_without_joining() {
    let rig = TestRig::new();
    let scope_id = rig.scope(VariableScope::new()).await;
    let mut input = plan(
        scope_id,
        ExecutionMode::Parallel,
        CardinalitySource::Fixed(2),
    );
    input.aggregation = Some(result_aggregation());
    let root_id = rig.activate(input).await;

    rig.engine.cancel_root(root_id).await.unwrap();
    // Idempotent.
    rig.engine.cancel_root(root_id).await.unwrap();

    assert_eq!(rig.store.root_count(), 0);
    assert_eq!(rig.store.branch_count(), 0);
    assert_eq!(
        rig.sink.of_kind(ActivityEventKind::ActivityCancelled).len(),
        1
    );
    assert!(rig.sink.of_kind(ActivityEventKind::ActivityCompleted).is_empty());
    // A cancelled root never publishes an overview.
    let scope = rig.store.read_scope(scope_id).await.unwrap();
    assert!(!scope.contains_key("reviews"));
}

#[tokio::test]
async fn branch_outcome_cancelled_shrinks_the_plan() {
    let rig = TestRig::new();
    let scope_id = rig.scope(VariableScope::new()).await;
    let root_id = rig
        .activate(plan(
            scope_id,
            ExecutionMode::Parallel,
            CardinalitySource::Fixed(3),
        ))
        .await;

    let branches = rig.branches(root_id).await;
    rig.complete(&branches[0]).await;
    rig.complete(&branches[1]).await;

    // The last branch is cancelled by its work rather than completed; the
    // remaining plan is done.
    let disposition = rig
        .engine
        .on_branch_terminal(branches[2].id, BranchOutcome::Cancelled)
        .await
        .unwrap();
    assert_eq!(disposition, TerminalDisposition::Joined);
    assert_eq!(rig.store.root_count(), 0);
}
