//! Describing a job as a linear pipeline of steps.
//!
//! A [`Pipeline`] is only a description; nothing runs until it is
//! submitted to a [`crate::run::Cluster`], which compiles it into an
//! execution graph and deploys tasks for it.
//!
//! ```
//! use faultline::pipeline::Pipeline;
//! use faultline::testing::{CollectOutput, TestingInput};
//! use serde_json::json;
//!
//! let out = CollectOutput::new();
//! let mut pipeline = Pipeline::new("double");
//! pipeline
//!     .input("inp", TestingInput::new(vec![json!(1), json!(2)]))
//!     .map("double", |x| json!(x.as_i64().unwrap_or(0) * 2))
//!     .output("out", out.clone());
//! assert!(pipeline.is_stateful());
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;

use crate::errors::tracked_err;
use crate::errors::HarnessError;
use crate::errors::HarnessResult;
use crate::inputs::InputBuilder;
use crate::outputs::OutputBuilder;
use crate::recovery::model::StepId;
use crate::Item;

pub(crate) type MapFn = Arc<dyn Fn(Item) -> Item + Send + Sync>;
pub(crate) type FilterFn = Arc<dyn Fn(&Item) -> bool + Send + Sync>;
pub(crate) type FlatMapFn = Arc<dyn Fn(Item) -> Vec<Item> + Send + Sync>;
pub(crate) type InspectFn = Arc<dyn Fn(&Item) + Send + Sync>;
pub(crate) type KeyFn = Arc<dyn Fn(&Item) -> String + Send + Sync>;
pub(crate) type StateBuilderFn = Arc<dyn Fn() -> Item + Send + Sync>;
pub(crate) type StatefulMapFn = Arc<dyn Fn(&mut Item, Item) -> Option<Item> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Step {
    Input {
        step_id: StepId,
        builder: Arc<dyn InputBuilder>,
    },
    Map {
        step_id: StepId,
        mapper: MapFn,
    },
    Filter {
        step_id: StepId,
        predicate: FilterFn,
    },
    FlatMap {
        step_id: StepId,
        mapper: FlatMapFn,
    },
    Inspect {
        step_id: StepId,
        inspector: InspectFn,
    },
    StatefulMap {
        step_id: StepId,
        key_fn: KeyFn,
        builder: StateBuilderFn,
        mapper: StatefulMapFn,
    },
    Output {
        step_id: StepId,
        builder: Arc<dyn OutputBuilder>,
    },
}

impl Step {
    pub(crate) fn step_id(&self) -> &StepId {
        match self {
            Step::Input { step_id, .. }
            | Step::Map { step_id, .. }
            | Step::Filter { step_id, .. }
            | Step::FlatMap { step_id, .. }
            | Step::Inspect { step_id, .. }
            | Step::StatefulMap { step_id, .. }
            | Step::Output { step_id, .. } => step_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Step::Input { .. } => "input",
            Step::Map { .. } => "map",
            Step::Filter { .. } => "filter",
            Step::FlatMap { .. } => "flat_map",
            Step::Inspect { .. } => "inspect",
            Step::StatefulMap { .. } => "stateful_map",
            Step::Output { .. } => "output",
        }
    }
}

/// A linear chain of steps from one input.
///
/// Output steps pass their items on unchanged, so they can appear
/// anywhere after the input.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Read items from an input. Must be the first step.
    pub fn input(&mut self, step_id: &str, builder: impl InputBuilder) -> &mut Self {
        self.steps.push(Step::Input {
            step_id: StepId::from(step_id),
            builder: Arc::new(builder),
        });
        self
    }

    pub fn map(
        &mut self,
        step_id: &str,
        mapper: impl Fn(Item) -> Item + Send + Sync + 'static,
    ) -> &mut Self {
        self.steps.push(Step::Map {
            step_id: StepId::from(step_id),
            mapper: Arc::new(mapper),
        });
        self
    }

    /// Keep only items for which `predicate` is true.
    pub fn filter(
        &mut self,
        step_id: &str,
        predicate: impl Fn(&Item) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        self.steps.push(Step::Filter {
            step_id: StepId::from(step_id),
            predicate: Arc::new(predicate),
        });
        self
    }

    pub fn flat_map(
        &mut self,
        step_id: &str,
        mapper: impl Fn(Item) -> Vec<Item> + Send + Sync + 'static,
    ) -> &mut Self {
        self.steps.push(Step::FlatMap {
            step_id: StepId::from(step_id),
            mapper: Arc::new(mapper),
        });
        self
    }

    /// Observe items without changing them.
    pub fn inspect(
        &mut self,
        step_id: &str,
        inspector: impl Fn(&Item) + Send + Sync + 'static,
    ) -> &mut Self {
        self.steps.push(Step::Inspect {
            step_id: StepId::from(step_id),
            inspector: Arc::new(inspector),
        });
        self
    }

    /// Map items while keeping state per key.
    ///
    /// Items are routed so that all items with the same key are
    /// processed by the same task. `builder` creates the state for a
    /// key the first time it is seen; `mapper` updates it and returns
    /// an item to emit, if any. State is part of every checkpoint.
    pub fn stateful_map(
        &mut self,
        step_id: &str,
        key_fn: impl Fn(&Item) -> String + Send + Sync + 'static,
        builder: impl Fn() -> Item + Send + Sync + 'static,
        mapper: impl Fn(&mut Item, Item) -> Option<Item> + Send + Sync + 'static,
    ) -> &mut Self {
        self.steps.push(Step::StatefulMap {
            step_id: StepId::from(step_id),
            key_fn: Arc::new(key_fn),
            builder: Arc::new(builder),
            mapper: Arc::new(mapper),
        });
        self
    }

    /// Write items to an output and pass them on.
    pub fn output(&mut self, step_id: &str, builder: impl OutputBuilder) -> &mut Self {
        self.steps.push(Step::Output {
            step_id: StepId::from(step_id),
            builder: Arc::new(builder),
        });
        self
    }

    /// If any step has state that must be restored on recovery.
    ///
    /// Inputs count unless their builder says reader positions don't
    /// matter.
    pub fn is_stateful(&self) -> bool {
        self.steps.iter().any(|step| match step {
            Step::Input { builder, .. } => builder.is_stateful(),
            Step::StatefulMap { .. } => true,
            _ => false,
        })
    }

    pub(crate) fn validate(&self) -> HarnessResult<()> {
        match self.steps.first() {
            Some(Step::Input { .. }) => {}
            Some(other) => {
                return Err(tracked_err(
                    HarnessError::Pipeline,
                    &format!(
                        "pipeline {:?} must start with an input step; found {} step {:?}",
                        self.name,
                        other.kind(),
                        other.step_id().0
                    ),
                ))
            }
            None => {
                return Err(tracked_err(
                    HarnessError::Pipeline,
                    &format!("pipeline {:?} has no steps", self.name),
                ))
            }
        }

        let mut seen = BTreeSet::new();
        for (pos, step) in self.steps.iter().enumerate() {
            let step_id = step.step_id();
            if step_id.0.is_empty() {
                return Err(tracked_err(
                    HarnessError::Pipeline,
                    &format!("step {pos} has an empty step ID"),
                ));
            }
            if !seen.insert(step_id.clone()) {
                return Err(tracked_err(
                    HarnessError::Pipeline,
                    &format!("step ID {:?} is used more than once", step_id.0),
                ));
            }
            if pos > 0 && matches!(step, Step::Input { .. }) {
                return Err(tracked_err(
                    HarnessError::Pipeline,
                    &format!(
                        "input step {:?} must be the first step; pipelines have a single input",
                        step_id.0
                    ),
                ));
            }
        }

        if !self
            .steps
            .iter()
            .any(|step| matches!(step, Step::Output { .. }))
        {
            return Err(tracked_err(
                HarnessError::Pipeline,
                &format!("pipeline {:?} has no output step", self.name),
            ));
        }
        Ok(())
    }

    /// A JSON description of the steps, served by the status
    /// webserver.
    pub fn describe(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "steps": self
                .steps
                .iter()
                .map(|step| json!({"step_id": step.step_id().0, "kind": step.kind()}))
                .collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
fn noop_output() -> impl OutputBuilder {
    crate::outputs::StdOutput
}

#[cfg(test)]
fn empty_input() -> impl InputBuilder {
    crate::testing::TestingInput::new(Vec::new())
}

#[test]
fn validate_accepts_linear_pipeline() {
    let mut pipeline = Pipeline::new("ok");
    pipeline
        .input("inp", empty_input())
        .map("m", |x| x)
        .stateful_map("count", |x| x.to_string(), || json!(0), |_, x| Some(x))
        .output("out", noop_output());
    pipeline.validate().unwrap();
    assert!(pipeline.is_stateful());
    assert_eq!(
        pipeline.describe()["steps"][2],
        json!({"step_id": "count", "kind": "stateful_map"})
    );
}

#[test]
fn validate_requires_leading_input() {
    let mut pipeline = Pipeline::new("bad");
    pipeline
        .map("m", |x| x)
        .input("inp", empty_input())
        .output("out", noop_output());
    assert!(matches!(
        pipeline.validate(),
        Err(HarnessError::Pipeline(_))
    ));

    assert!(matches!(
        Pipeline::new("empty").validate(),
        Err(HarnessError::Pipeline(_))
    ));
}

#[test]
fn validate_rejects_duplicate_step_ids() {
    let mut pipeline = Pipeline::new("dup");
    pipeline
        .input("inp", empty_input())
        .map("same", |x| x)
        .filter("same", |_| true)
        .output("out", noop_output());
    let err = pipeline.validate().unwrap_err();
    assert!(err.to_string().contains("\"same\""), "{err}");
}

#[test]
fn validate_requires_output() {
    let mut pipeline = Pipeline::new("no-out");
    pipeline.input("inp", empty_input()).map("m", |x| x);
    assert!(matches!(
        pipeline.validate(),
        Err(HarnessError::Pipeline(_))
    ));
}
