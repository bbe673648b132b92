//! Compiling a pipeline into stages and tasks.
//!
//! Steps are fused into stages; a new stage starts at every
//! `stateful_map` because its items must be re-partitioned by key.
//! Every stage runs with the same parallelism, `processes *
//! workers_per_process`, and consecutive stages are connected
//! all-to-all.

use std::collections::BTreeSet;
use std::hash::Hash;
use std::hash::Hasher;

use seahash::SeaHasher;

use crate::config::ClusterConfig;
use crate::errors::HarnessResult;
use crate::pipeline::KeyFn;
use crate::pipeline::Pipeline;
use crate::pipeline::Step;
use crate::recovery::model::*;

pub(crate) struct Stage {
    pub(crate) index: StageIndex,
    pub(crate) steps: Vec<Step>,
    /// How items coming into this stage are partitioned. `None` for
    /// the source stage.
    pub(crate) route: Option<KeyFn>,
}

pub struct ExecutionGraph {
    stages: Vec<Stage>,
    processes: usize,
    workers_per_process: usize,
    stateful: bool,
}

impl ExecutionGraph {
    pub(crate) fn compile(pipeline: &Pipeline, cluster: &ClusterConfig) -> HarnessResult<Self> {
        pipeline.validate()?;

        let mut stages = vec![Stage {
            index: StageIndex(0),
            steps: Vec::new(),
            route: None,
        }];
        for step in pipeline.steps() {
            if let Step::StatefulMap { key_fn, .. } = step {
                stages.push(Stage {
                    index: StageIndex(stages.len()),
                    steps: Vec::new(),
                    route: Some(key_fn.clone()),
                });
            }
            // There is always at least the source stage.
            if let Some(stage) = stages.last_mut() {
                stage.steps.push(step.clone());
            }
        }

        Ok(Self {
            stages,
            processes: cluster.processes,
            workers_per_process: cluster.workers_per_process,
            stateful: pipeline.is_stateful(),
        })
    }

    pub(crate) fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn parallelism(&self) -> usize {
        self.processes * self.workers_per_process
    }

    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    /// Every task of the job, in order.
    pub fn task_ids(&self) -> BTreeSet<TaskId> {
        (0..self.stages.len())
            .flat_map(|stage| (0..self.parallelism()).map(move |instance| TaskId::new(stage, instance)))
            .collect()
    }

    /// The tasks barriers are injected at.
    pub fn sources(&self) -> BTreeSet<TaskId> {
        (0..self.parallelism())
            .map(|instance| TaskId::new(0, instance))
            .collect()
    }

    pub fn upstream(&self, task: TaskId) -> Vec<TaskId> {
        match task.stage.0 {
            0 => Vec::new(),
            stage => (0..self.parallelism())
                .map(|instance| TaskId::new(stage - 1, instance))
                .collect(),
        }
    }

    pub fn downstream(&self, task: TaskId) -> Vec<TaskId> {
        let next = task.stage.0 + 1;
        if next >= self.stages.len() {
            return Vec::new();
        }
        (0..self.parallelism())
            .map(|instance| TaskId::new(next, instance))
            .collect()
    }

    /// Which simulated process runs a task.
    ///
    /// Instances are packed onto processes in order, the same for
    /// every stage.
    pub fn process_of(&self, task: TaskId) -> usize {
        task.instance.0 / self.workers_per_process
    }
}

/// Pick the downstream instance for a key.
pub(crate) fn route(key: &str, count: usize) -> usize {
    let mut hasher = SeaHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % count as u64) as usize
}

#[cfg(test)]
fn word_count_pipeline() -> Pipeline {
    use serde_json::json;

    let mut pipeline = Pipeline::new("wc");
    pipeline
        .input("inp", crate::testing::TestingInput::new(Vec::new()))
        .map("lower", |x| x)
        .stateful_map("count", |x| x.to_string(), || json!(0), |_, x| Some(x))
        .output("out", crate::outputs::StdOutput);
    pipeline
}

#[test]
fn splits_stages_at_stateful_map() {
    let graph = ExecutionGraph::compile(&word_count_pipeline(), &ClusterConfig::new(2, 3)).unwrap();
    assert_eq!(graph.stage_count(), 2);
    assert_eq!(graph.parallelism(), 6);

    let stage_steps: Vec<Vec<String>> = graph
        .stages()
        .iter()
        .map(|stage| stage.steps.iter().map(|step| step.step_id().0.clone()).collect())
        .collect();
    assert_eq!(
        stage_steps,
        vec![
            vec!["inp".to_string(), "lower".to_string()],
            vec!["count".to_string(), "out".to_string()]
        ]
    );
    assert!(graph.stages()[0].route.is_none());
    assert!(graph.stages()[1].route.is_some());
    assert!(graph.is_stateful());
}

#[test]
fn tasks_and_edges() {
    let graph = ExecutionGraph::compile(&word_count_pipeline(), &ClusterConfig::new(2, 3)).unwrap();
    assert_eq!(graph.task_ids().len(), 12);
    assert_eq!(graph.sources().len(), 6);
    assert!(graph.upstream(TaskId::new(0, 4)).is_empty());
    assert_eq!(graph.upstream(TaskId::new(1, 0)).len(), 6);
    assert_eq!(graph.downstream(TaskId::new(0, 0)).len(), 6);
    assert!(graph.downstream(TaskId::new(1, 5)).is_empty());
    assert_eq!(graph.process_of(TaskId::new(1, 2)), 0);
    assert_eq!(graph.process_of(TaskId::new(1, 3)), 1);
}

#[test]
fn route_is_stable_and_in_range() {
    for key in ["a", "b", "hello", ""] {
        let first = route(key, 6);
        assert!(first < 6);
        assert_eq!(route(key, 6), first);
    }
}
