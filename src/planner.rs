//! Instance planning: resolve a loop cardinality or a source collection into
//! an ordered list of instance seeds.

use serde_json::Value;

use crate::engine::MultiInstanceError;
use crate::expression::ExpressionEvaluator;
use crate::tree::{ExecutionMode, ScopeId, VariableScope};

use serde::{Deserialize, Serialize};

/// How many branches to create, and from what.
#[derive(Clone, Debug)]
pub enum CardinalitySource {
    /// Fixed loop cardinality.
    Fixed(i64),
    /// Collection-valued expression, optionally bound to a per-branch
    /// element variable.
    Collection {
        expression: String,
        element_variable: Option<String>,
    },
}

/// Input for one multi-instance activation.
#[derive(Clone, Debug)]
pub struct PlanInput {
    pub scope_id: ScopeId,
    pub activity_ref: String,
    pub mode: ExecutionMode,
    pub source: CardinalitySource,
    pub completion_condition: Option<String>,
    pub aggregation: Option<crate::aggregation::AggregationSpec>,
    /// Route branch completions through the batched leave scheduler instead
    /// of the synchronous join barrier.
    pub async_leave: bool,
}

impl PlanInput {
    pub fn element_variable(&self) -> Option<&str> {
        match &self.source {
            CardinalitySource::Collection {
                element_variable, ..
            } => element_variable.as_deref(),
            CardinalitySource::Fixed(_) => None,
        }
    }
}

/// One planned branch: its sequence index, the resolved collection element
/// (if any), and extra variables carried in by dynamic mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceSeed {
    pub loop_counter: i32,
    pub element: Option<Value>,
    #[serde(default)]
    pub variables: VariableScope,
}

impl InstanceSeed {
    pub fn new(loop_counter: i32, element: Option<Value>) -> Self {
        Self {
            loop_counter,
            element,
            variables: VariableScope::new(),
        }
    }
}

/// Resolve the plan into ordered seeds. An empty result is the valid
/// degenerate case: the activity completes immediately and no root is created.
pub fn resolve_seeds(
    input: &PlanInput,
    scope: &VariableScope,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<Vec<InstanceSeed>, MultiInstanceError> {
    match &input.source {
        CardinalitySource::Fixed(cardinality) => {
            if *cardinality < 0 {
                return Err(MultiInstanceError::IllegalCardinality(*cardinality));
            }
            Ok((0..*cardinality as i32)
                .map(|index| InstanceSeed::new(index, None))
                .collect())
        }
        CardinalitySource::Collection { expression, .. } => {
            let resolved = evaluator.resolve(expression, scope)?;
            let Some(value) = resolved else {
                return Err(MultiInstanceError::CollectionVariableMissing(
                    expression.clone(),
                ));
            };
            let Value::Array(elements) = value else {
                return Err(MultiInstanceError::CollectionVariableNotACollection(
                    expression.clone(),
                ));
            };
            Ok(elements
                .into_iter()
                .enumerate()
                .map(|(index, element)| InstanceSeed::new(index as i32, Some(element)))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::expression::ScopeLookupEvaluator;

    fn plan(source: CardinalitySource) -> PlanInput {
        PlanInput {
            scope_id: ScopeId::new(),
            activity_ref: "review".to_string(),
            mode: ExecutionMode::Parallel,
            source,
            completion_condition: None,
            aggregation: None,
            async_leave: false,
        }
    }

    #[test]
    fn fixed_cardinality_produces_indexed_seeds() {
        let seeds = resolve_seeds(
            &plan(CardinalitySource::Fixed(3)),
            &VariableScope::new(),
            &ScopeLookupEvaluator,
        )
        .unwrap();
        assert_eq!(
            seeds.iter().map(|s| s.loop_counter).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(seeds.iter().all(|s| s.element.is_none()));
    }

    #[test]
    fn zero_cardinality_is_a_valid_empty_plan() {
        let seeds = resolve_seeds(
            &plan(CardinalitySource::Fixed(0)),
            &VariableScope::new(),
            &ScopeLookupEvaluator,
        )
        .unwrap();
        assert!(seeds.is_empty());
    }

    #[test]
    fn negative_cardinality_is_rejected() {
        let err = resolve_seeds(
            &plan(CardinalitySource::Fixed(-1)),
            &VariableScope::new(),
            &ScopeLookupEvaluator,
        )
        .unwrap_err();
        assert!(matches!(err, MultiInstanceError::IllegalCardinality(-1)));
    }

    #[test]
    fn collection_seeds_carry_elements_in_order() {
        let mut scope = VariableScope::new();
        scope.insert("assignees".to_string(), json!(["ann", "bo", "cy"]));
        let seeds = resolve_seeds(
            &plan(CardinalitySource::Collection {
                expression: "assignees".to_string(),
                element_variable: Some("assignee".to_string()),
            }),
            &scope,
            &ScopeLookupEvaluator,
        )
        .unwrap();
        assert_eq!(seeds.len(), 3);
        assert_eq!(seeds[1].element, Some(json!("bo")));
        assert_eq!(seeds[2].loop_counter, 2);
    }

    #[test]
    fn missing_collection_is_rejected() {
        let err = resolve_seeds(
            &plan(CardinalitySource::Collection {
                expression: "assignees".to_string(),
                element_variable: None,
            }),
            &VariableScope::new(),
            &ScopeLookupEvaluator,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MultiInstanceError::CollectionVariableMissing(_)
        ));
    }

    #[test]
    fn scalar_collection_is_rejected() {
        let mut scope = VariableScope::new();
        scope.insert("assignees".to_string(), json!("ann"));
        let err = resolve_seeds(
            &plan(CardinalitySource::Collection {
                expression: "assignees".to_string(),
                element_variable: None,
            }),
            &scope,
            &ScopeLookupEvaluator,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MultiInstanceError::CollectionVariableNotACollection(_)
        ));
    }
}
