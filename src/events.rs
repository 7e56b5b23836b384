//! Lifecycle notification model and sinks.
//!
//! Every branch creation/destruction and every aggregate transition (root
//! activation, join, cancellation) publishes one event carrying the current
//! counters. Aggregate events omit `loop_counter`; that absence is the signal
//! listeners use to tell aggregate notifications from per-branch ones.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::tree::{BranchId, BranchState, RootCounters, RootId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityEventKind {
    /// Aggregate: a multi-instance root was activated.
    ActivityStarted,
    /// Aggregate: the root joined (or an N=0 plan completed immediately).
    ActivityCompleted,
    /// Aggregate: the root was torn down without joining.
    ActivityCancelled,
    BranchStarted,
    BranchEnded,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub kind: ActivityEventKind,
    pub activity_ref: String,
    pub root_id: Option<RootId>,
    pub branch_id: Option<BranchId>,
    /// Present only on per-branch notifications.
    pub loop_counter: Option<i32>,
    /// Terminal state on `BranchEnded` notifications.
    pub terminal_state: Option<BranchState>,
    pub counters: RootCounters,
    pub occurred_at: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn aggregate(
        kind: ActivityEventKind,
        activity_ref: &str,
        root_id: Option<RootId>,
        counters: RootCounters,
    ) -> Self {
        Self {
            kind,
            activity_ref: activity_ref.to_string(),
            root_id,
            branch_id: None,
            loop_counter: None,
            terminal_state: None,
            counters,
            occurred_at: Utc::now(),
        }
    }

    pub fn branch(
        kind: ActivityEventKind,
        activity_ref: &str,
        root_id: RootId,
        branch_id: BranchId,
        loop_counter: i32,
        terminal_state: Option<BranchState>,
        counters: RootCounters,
    ) -> Self {
        Self {
            kind,
            activity_ref: activity_ref.to_string(),
            root_id: Some(root_id),
            branch_id: Some(branch_id),
            loop_counter: Some(loop_counter),
            terminal_state,
            counters,
            occurred_at: Utc::now(),
        }
    }
}

/// Ordered receiver for lifecycle notifications.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: ActivityEvent);
}

/// Sink that logs every notification through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: ActivityEvent) {
        info!(
            kind = ?event.kind,
            activity = %event.activity_ref,
            loop_counter = ?event.loop_counter,
            instances = event.counters.nr_of_instances,
            active = event.counters.nr_of_active_instances,
            completed = event.counters.nr_of_completed_instances,
            "activity event"
        );
    }
}

/// Sink that records notifications in order, for tests.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<ActivityEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events.lock().expect("events poisoned").clone()
    }

    pub fn of_kind(&self, kind: ActivityEventKind) -> Vec<ActivityEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.kind == kind)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: ActivityEvent) {
        self.events.lock().expect("events poisoned").push(event);
    }
}
