//! The operators a task runs for each step of its stage.
//!
//! All the steps of a stage run fused in one task as an
//! [`OperatorChain`]: an item goes through every operator in order
//! before the next item is looked at, so there is no queueing between
//! steps and a barrier can be handled between any two items.

use std::collections::BTreeMap;

use opentelemetry::KeyValue;
use tracing::debug;

use crate::errors::HarnessResult;
use crate::errors::Reraise;
use crate::metrics::StepMetrics;
use crate::outputs::OutputWriter;
use crate::pipeline::*;
use crate::recovery::model::*;
use crate::with_timer;
use crate::Item;

pub(crate) trait Operator: Send {
    fn step_id(&self) -> &StepId;

    /// Process one item, appending anything to emit to `out`.
    fn on_item(&mut self, item: Item, out: &mut Vec<Item>) -> HarnessResult<()>;

    /// Called once upstream ended, after the last item.
    fn on_end(&mut self) -> HarnessResult<()> {
        Ok(())
    }

    /// Stateless operators have nothing to snapshot.
    fn snapshot(&self) -> HarnessResult<Option<StateBytes>> {
        Ok(None)
    }
}

struct MapOp {
    step_id: StepId,
    mapper: MapFn,
}

impl Operator for MapOp {
    fn step_id(&self) -> &StepId {
        &self.step_id
    }

    fn on_item(&mut self, item: Item, out: &mut Vec<Item>) -> HarnessResult<()> {
        out.push((self.mapper)(item));
        Ok(())
    }
}

struct FilterOp {
    step_id: StepId,
    predicate: FilterFn,
}

impl Operator for FilterOp {
    fn step_id(&self) -> &StepId {
        &self.step_id
    }

    fn on_item(&mut self, item: Item, out: &mut Vec<Item>) -> HarnessResult<()> {
        if (self.predicate)(&item) {
            out.push(item);
        }
        Ok(())
    }
}

struct FlatMapOp {
    step_id: StepId,
    mapper: FlatMapFn,
}

impl Operator for FlatMapOp {
    fn step_id(&self) -> &StepId {
        &self.step_id
    }

    fn on_item(&mut self, item: Item, out: &mut Vec<Item>) -> HarnessResult<()> {
        out.extend((self.mapper)(item));
        Ok(())
    }
}

struct InspectOp {
    step_id: StepId,
    inspector: InspectFn,
}

impl Operator for InspectOp {
    fn step_id(&self) -> &StepId {
        &self.step_id
    }

    fn on_item(&mut self, item: Item, out: &mut Vec<Item>) -> HarnessResult<()> {
        (self.inspector)(&item);
        out.push(item);
        Ok(())
    }
}

/// Map incoming values, having access to a persistent state for each
/// key.
///
/// If the mapper leaves the state as `null`, the key is forgotten and
/// the builder is called again the next time it's seen.
pub(crate) struct StatefulMapOp {
    step_id: StepId,
    key_fn: KeyFn,
    builder: StateBuilderFn,
    mapper: StatefulMapFn,
    state: BTreeMap<String, Item>,
}

impl StatefulMapOp {
    pub(crate) fn new(
        step_id: StepId,
        key_fn: KeyFn,
        builder: StateBuilderFn,
        mapper: StatefulMapFn,
        resume: Option<StateBytes>,
    ) -> HarnessResult<Self> {
        let state = match resume {
            Some(bytes) => bytes
                .de()
                .reraise_with(|| format!("error resuming state for step {step_id}"))?,
            None => BTreeMap::new(),
        };
        Ok(Self {
            step_id,
            key_fn,
            builder,
            mapper,
            state,
        })
    }
}

impl Operator for StatefulMapOp {
    fn step_id(&self) -> &StepId {
        &self.step_id
    }

    fn on_item(&mut self, item: Item, out: &mut Vec<Item>) -> HarnessResult<()> {
        let key = (self.key_fn)(&item);
        let state = self
            .state
            .entry(key.clone())
            .or_insert_with(|| (self.builder)());
        if let Some(emit) = (self.mapper)(state, item) {
            out.push(emit);
        }
        if state.is_null() {
            debug!("stateful_map {}: discarding state for key {key:?}", self.step_id);
            self.state.remove(&key);
        }
        Ok(())
    }

    fn snapshot(&self) -> HarnessResult<Option<StateBytes>> {
        StateBytes::ser(&self.state).map(Some)
    }
}

/// Writes each item to a sink, then passes it on.
struct OutputOp {
    step_id: StepId,
    writer: Box<dyn OutputWriter>,
}

impl Operator for OutputOp {
    fn step_id(&self) -> &StepId {
        &self.step_id
    }

    fn on_item(&mut self, item: Item, out: &mut Vec<Item>) -> HarnessResult<()> {
        self.writer
            .write(item.clone())
            .reraise_with(|| format!("error writing to output {}", self.step_id))?;
        out.push(item);
        Ok(())
    }

    fn on_end(&mut self) -> HarnessResult<()> {
        self.writer
            .close()
            .reraise_with(|| format!("error closing output {}", self.step_id))
    }
}

/// The fused operators of one task.
pub(crate) struct OperatorChain {
    ops: Vec<(Box<dyn Operator>, Vec<KeyValue>)>,
    metrics: StepMetrics,
}

impl OperatorChain {
    /// Build an operator for every non-input step, taking any state
    /// to resume from out of `resume`.
    pub(crate) fn build(
        steps: &[Step],
        task: TaskId,
        count: usize,
        resume: &mut TaskSnapshot,
    ) -> HarnessResult<Self> {
        let mut ops: Vec<(Box<dyn Operator>, Vec<KeyValue>)> = Vec::new();
        for step in steps {
            let op: Box<dyn Operator> = match step.clone() {
                Step::Input { .. } => continue,
                Step::Map { step_id, mapper } => Box::new(MapOp { step_id, mapper }),
                Step::Filter { step_id, predicate } => Box::new(FilterOp { step_id, predicate }),
                Step::FlatMap { step_id, mapper } => Box::new(FlatMapOp { step_id, mapper }),
                Step::Inspect { step_id, inspector } => Box::new(InspectOp { step_id, inspector }),
                Step::StatefulMap {
                    step_id,
                    key_fn,
                    builder,
                    mapper,
                } => {
                    let state = resume.remove(&step_id);
                    Box::new(StatefulMapOp::new(
                        step_id, key_fn, builder, mapper, state,
                    )?)
                }
                Step::Output { step_id, builder } => {
                    let writer = builder
                        .build(task.instance, count)
                        .reraise_with(|| format!("error building output {step_id}"))?;
                    Box::new(OutputOp { step_id, writer })
                }
            };
            let labels = StepMetrics::labels(op.step_id(), &task);
            ops.push((op, labels));
        }
        Ok(Self {
            ops,
            metrics: StepMetrics::new(),
        })
    }

    /// Run one item through every operator.
    pub(crate) fn process(&mut self, item: Item) -> HarnessResult<Vec<Item>> {
        let mut batch = vec![item];
        for (op, labels) in self.ops.iter_mut() {
            let mut next = Vec::with_capacity(batch.len());
            for item in batch.drain(..) {
                with_timer!(self.metrics.duration, labels, op.on_item(item, &mut next))?;
            }
            batch = next;
            if batch.is_empty() {
                break;
            }
        }
        Ok(batch)
    }

    pub(crate) fn end(&mut self) -> HarnessResult<()> {
        for (op, _labels) in self.ops.iter_mut() {
            op.on_end()?;
        }
        Ok(())
    }

    pub(crate) fn snapshot_into(&self, snapshot: &mut TaskSnapshot) -> HarnessResult<()> {
        for (op, _labels) in self.ops.iter() {
            if let Some(state) = op.snapshot()? {
                snapshot.insert(op.step_id().clone(), state);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
fn counting_step() -> Step {
    Step::StatefulMap {
        step_id: StepId::from("count"),
        key_fn: std::sync::Arc::new(|item: &Item| item.as_str().unwrap_or_default().to_string()),
        builder: std::sync::Arc::new(|| serde_json::json!(0)),
        mapper: std::sync::Arc::new(|count: &mut Item, item: Item| {
            let next = count.as_u64().unwrap_or(0) + 1;
            *count = serde_json::json!(next);
            Some(serde_json::json!([item, next]))
        }),
    }
}

#[test]
fn chain_runs_steps_in_order() {
    use std::sync::Arc;

    let steps = vec![
        Step::FlatMap {
            step_id: StepId::from("split"),
            mapper: Arc::new(|item: Item| {
                item.as_str()
                    .unwrap_or_default()
                    .split(' ')
                    .map(|word| serde_json::json!(word))
                    .collect()
            }),
        },
        Step::Filter {
            step_id: StepId::from("no_empty"),
            predicate: Arc::new(|item: &Item| item.as_str() != Some("")),
        },
        counting_step(),
    ];
    let mut chain =
        OperatorChain::build(&steps, TaskId::new(0, 0), 1, &mut TaskSnapshot::default()).unwrap();

    let out = chain.process(serde_json::json!("a b  a")).unwrap();
    assert_eq!(
        out,
        vec![
            serde_json::json!(["a", 1]),
            serde_json::json!(["b", 1]),
            serde_json::json!(["a", 2]),
        ]
    );
}

#[test]
fn stateful_map_restore_then_snapshot_is_identical() {
    let steps = vec![counting_step()];
    let mut chain =
        OperatorChain::build(&steps, TaskId::new(1, 0), 1, &mut TaskSnapshot::default()).unwrap();
    for word in ["x", "y", "x"] {
        chain.process(serde_json::json!(word)).unwrap();
    }
    let mut snapshot = TaskSnapshot::default();
    chain.snapshot_into(&mut snapshot).unwrap();
    let blob = snapshot.encode().unwrap();

    let mut resume = TaskSnapshot::decode(&blob).unwrap();
    let mut restored = OperatorChain::build(&steps, TaskId::new(1, 0), 1, &mut resume).unwrap();
    let mut again = TaskSnapshot::default();
    restored.snapshot_into(&mut again).unwrap();
    assert_eq!(again.encode().unwrap(), blob);

    assert_eq!(
        restored.process(serde_json::json!("x")).unwrap(),
        vec![serde_json::json!(["x", 3])]
    );
}

#[test]
fn stateful_map_discards_null_state() {
    let mut op = StatefulMapOp::new(
        StepId::from("once"),
        std::sync::Arc::new(|_: &Item| "k".to_string()),
        std::sync::Arc::new(|| serde_json::json!(1)),
        std::sync::Arc::new(|state: &mut Item, item: Item| {
            *state = Item::Null;
            Some(item)
        }),
        None,
    )
    .unwrap();
    let mut out = Vec::new();
    op.on_item(serde_json::json!("a"), &mut out).unwrap();
    assert_eq!(out, vec![serde_json::json!("a")]);
    assert!(op.state.is_empty());
}
