// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Immutable pipeline definitions.
//!
//! A [`Pipeline`] is an ordered list of weight buckets, each holding steps
//! with an optional condition. It is built once at startup through
//! [`PipelineBuilder`] and handed to the step manager by value.
//!
//! ```text
//! weight 0   init steps (always first)
//! weight 1   step a, step b (registration order)
//! weight 5   step c [only if plan == "trial"]
//! weight 10  finish
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::operation::Operation;
use crate::step::Step;

/// Predicate deciding whether a step runs for an operation.
pub type Condition = Arc<dyn Fn(&Operation) -> bool + Send + Sync>;

/// Weight reserved for initialization steps.
pub const INIT_WEIGHT: u32 = 0;

/// One registered step.
#[derive(Clone)]
pub struct PipelineEntry {
    weight: u32,
    step: Arc<dyn Step>,
    condition: Option<Condition>,
}

impl PipelineEntry {
    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn step(&self) -> &Arc<dyn Step> {
        &self.step
    }

    pub fn name(&self) -> &str {
        self.step.name()
    }

    /// Whether the step should run for `operation`.
    pub fn applies_to(&self, operation: &Operation) -> bool {
        self.condition
            .as_ref()
            .is_none_or(|condition| condition(operation))
    }
}

impl fmt::Debug for PipelineEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineEntry")
            .field("weight", &self.weight)
            .field("step", &self.step.name())
            .field("conditional", &self.condition.is_some())
            .finish()
    }
}

/// Steps in execution order: ascending weight, then registration order.
#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    entries: Vec<PipelineEntry>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn entries(&self) -> &[PipelineEntry] {
        &self.entries
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.entries.iter().map(PipelineEntry::name).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collects steps into weight buckets.
#[derive(Default)]
pub struct PipelineBuilder {
    buckets: BTreeMap<u32, Vec<PipelineEntry>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an initialization step. These run before every weighted step.
    pub fn init_step(self, step: impl Step + 'static) -> Self {
        self.push(INIT_WEIGHT, Arc::new(step), None)
    }

    /// Register a step at `weight`. Weights below 1 are treated as 1.
    pub fn step(self, weight: i32, step: impl Step + 'static) -> Self {
        self.push(normalize(weight), Arc::new(step), None)
    }

    /// Register a step that only runs when `condition` holds.
    pub fn step_if<F>(self, weight: i32, step: impl Step + 'static, condition: F) -> Self
    where
        F: Fn(&Operation) -> bool + Send + Sync + 'static,
    {
        self.push(normalize(weight), Arc::new(step), Some(Arc::new(condition)))
    }

    /// Register an already shared step.
    pub fn shared_step(self, weight: i32, step: Arc<dyn Step>) -> Self {
        self.push(normalize(weight), step, None)
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            entries: self.buckets.into_values().flatten().collect(),
        }
    }

    fn push(mut self, weight: u32, step: Arc<dyn Step>, condition: Option<Condition>) -> Self {
        self.buckets.entry(weight).or_default().push(PipelineEntry {
            weight,
            step,
            condition,
        });
        self
    }
}

fn normalize(weight: i32) -> u32 {
    if weight < 1 { 1 } else { weight as u32 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationType;
    use crate::step::{StepOutput, StepResult};
    use async_trait::async_trait;
    use serde_json::json;

    struct Named(&'static str);

    #[async_trait]
    impl Step for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(&self, operation: Operation) -> StepResult {
            Ok(StepOutput::done(operation))
        }
    }

    #[test]
    fn test_buckets_run_in_weight_then_registration_order() {
        let pipeline = Pipeline::builder()
            .step(10, Named("w10"))
            .step(5, Named("w5a"))
            .init_step(Named("w0"))
            .step(5, Named("w5b"))
            .build();

        assert_eq!(pipeline.step_names(), vec!["w0", "w5a", "w5b", "w10"]);
        assert_eq!(pipeline.len(), 4);
    }

    #[test]
    fn test_non_positive_weights_normalize_to_one() {
        let pipeline = Pipeline::builder()
            .step(2, Named("two"))
            .step(-3, Named("negative"))
            .step(0, Named("zero"))
            .init_step(Named("init"))
            .build();

        let weights: Vec<_> = pipeline.entries().iter().map(|e| e.weight()).collect();
        assert_eq!(weights, vec![0, 1, 1, 2]);
        assert_eq!(pipeline.step_names(), vec!["init", "negative", "zero", "two"]);
    }

    #[test]
    fn test_conditions() {
        let pipeline = Pipeline::builder()
            .step(1, Named("always"))
            .step_if(1, Named("trial-only"), |op: &Operation| {
                op.parameter("plan") == Some("trial")
            })
            .build();

        let trial = Operation::with_id("a", "i", OperationType::Provision, json!({"plan": "trial"}));
        let paid = Operation::with_id("b", "i", OperationType::Provision, json!({"plan": "aws"}));

        let entries = pipeline.entries();
        assert!(entries[0].applies_to(&paid));
        assert!(entries[1].applies_to(&trial));
        assert!(!entries[1].applies_to(&paid));
    }

    #[test]
    fn test_empty_pipeline() {
        let pipeline = PipelineBuilder::new().build();
        assert!(pipeline.is_empty());
    }
}
