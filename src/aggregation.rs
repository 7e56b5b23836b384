//! Variable aggregation: capture per-branch results and materialize them into
//! one ordered overview value.
//!
//! Records are keyed by loop counter, never by completion order; the overview
//! is re-ordered on the way out so a branch finishing late cannot shift its
//! slot.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::tree::{AggregationRecord, Branch};

/// Declared aggregation for a multi-instance activation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregationSpec {
    /// Scope variable the overview is written to.
    pub target: String,
    /// Branch-local variables captured per completion.
    pub sources: Vec<String>,
    /// Expose a padded overview while the root is still running.
    pub eager: bool,
}

impl AggregationSpec {
    pub fn new(target: impl Into<String>, sources: Vec<String>) -> Self {
        Self {
            target: target.into(),
            sources,
            eager: false,
        }
    }

    pub fn eager(mut self) -> Self {
        self.eager = true;
        self
    }
}

/// Snapshot the declared source variables of a completing branch.
pub fn capture_record(branch: &Branch, spec: &AggregationSpec) -> AggregationRecord {
    let values = spec
        .sources
        .iter()
        .map(|name| {
            let value = branch.variables.get(name).cloned().unwrap_or(Value::Null);
            (name.clone(), value)
        })
        .collect();
    AggregationRecord {
        root_id: branch.root_id,
        loop_counter: branch.loop_counter,
        values,
    }
}

/// The overview slot for one captured branch: the bare value for a
/// single-source spec, an object keyed by source name otherwise.
fn slot_value(record: &AggregationRecord, spec: &AggregationSpec) -> Value {
    if let [only] = spec.sources.as_slice() {
        return record.values.get(only).cloned().unwrap_or(Value::Null);
    }
    Value::Object(
        spec.sources
            .iter()
            .map(|name| {
                let value = record.values.get(name).cloned().unwrap_or(Value::Null);
                (name.clone(), value)
            })
            .collect(),
    )
}

/// Final overview at join: every captured record, in loop-counter order.
pub fn final_overview(mut records: Vec<AggregationRecord>, spec: &AggregationSpec) -> Value {
    records.sort_by_key(|record| record.loop_counter);
    Value::Array(
        records
            .iter()
            .map(|record| slot_value(record, spec))
            .collect(),
    )
}

/// Running overview for eager materialization: one slot per planned index,
/// `null` where the branch has not completed yet.
pub fn eager_overview(
    records: &[AggregationRecord],
    planned_slots: i32,
    spec: &AggregationSpec,
) -> Value {
    let mut slots = vec![Value::Null; planned_slots.max(0) as usize];
    for record in records {
        let index = record.loop_counter as usize;
        if index < slots.len() {
            slots[index] = slot_value(record, spec);
        }
    }
    json!(slots)
}
