//! Data model representing operator state in the task runtime and
//! the checkpoint store.
//!
//! Every stateful step snapshots into [`StateBytes`]. Everything a
//! single task snapshots at a barrier is one [`TaskSnapshot`] keyed
//! by [`StepId`], which is itself encoded as bytes before it is
//! acknowledged to the coordinator.

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::HarnessResult;
use crate::errors::Reraise;

/// Unique ID for a step in a pipeline.
///
/// Snapshot data is keyed off of this to ensure state is not mixed
/// between steps.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl Display for StepId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(step_id: &str) -> Self {
        Self(step_id.to_string())
    }
}

/// An opaque snapshot of state for a single step or task.
///
/// The checkpoint system only deals in bytes so each step can store
/// custom types without going through Rust generic gymnastics. Once
/// produced, a blob is never mutated.
///
/// Encoding goes through `serde_json`; state types should use ordered
/// containers (`BTreeMap`, not `HashMap`) so that restoring a blob and
/// snapshotting again yields identical bytes.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBytes(pub Vec<u8>);

impl StateBytes {
    /// Serialize this state object from a step into bytes the
    /// checkpoint system can store.
    pub fn ser<T: Serialize>(obj: &T) -> HarnessResult<Self> {
        let bytes = serde_json::to_vec(obj).reraise_with(|| {
            format!(
                "error serializing state type {}",
                std::any::type_name::<T>()
            )
        })?;
        Ok(Self(bytes))
    }

    /// Deserialize these bytes from the checkpoint system into a state
    /// object that a step can use.
    pub fn de<T: DeserializeOwned>(&self) -> HarnessResult<T> {
        serde_json::from_slice(&self.0).reraise_with(|| {
            format!(
                "error deserializing state type {}",
                std::any::type_name::<T>()
            )
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Everything a single task needs to resume: one blob per stateful
/// step it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot(BTreeMap<StepId, StateBytes>);

impl TaskSnapshot {
    pub(crate) fn insert(&mut self, step_id: StepId, state: StateBytes) {
        self.0.insert(step_id, state);
    }

    /// Take the state for a step out of this snapshot.
    pub(crate) fn remove(&mut self, step_id: &StepId) -> Option<StateBytes> {
        self.0.remove(step_id)
    }

    pub fn get(&self, step_id: &StepId) -> Option<&StateBytes> {
        self.0.get(step_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn encode(&self) -> HarnessResult<StateBytes> {
        StateBytes::ser(self)
    }

    pub(crate) fn decode(blob: &StateBytes) -> HarnessResult<Self> {
        blob.de()
    }
}

#[test]
fn state_bytes_round_trip_is_deterministic() {
    let state = BTreeMap::from([("b".to_string(), 2_u64), ("a".to_string(), 1_u64)]);
    let bytes = StateBytes::ser(&state).unwrap();
    let restored: BTreeMap<String, u64> = bytes.de().unwrap();
    assert_eq!(restored, state);
    assert_eq!(StateBytes::ser(&restored).unwrap(), bytes);
}

#[test]
fn state_bytes_de_reports_type() {
    let bytes = StateBytes(b"not json".to_vec());
    let err = bytes.de::<u64>().unwrap_err();
    assert!(err.to_string().contains("error deserializing state type u64"));
}

#[test]
fn task_snapshot_encode_decode() {
    let mut snapshot = TaskSnapshot::default();
    snapshot.insert(StepId::from("count"), StateBytes(b"{}".to_vec()));
    snapshot.insert(StepId::from("inp"), StateBytes(b"12".to_vec()));

    let blob = snapshot.encode().unwrap();
    let mut found = TaskSnapshot::decode(&blob).unwrap();
    assert_eq!(found, snapshot);
    assert_eq!(found.encode().unwrap(), blob);

    assert_eq!(
        found.remove(&StepId::from("inp")),
        Some(StateBytes(b"12".to_vec()))
    );
    assert_eq!(found.remove(&StepId::from("inp")), None);
}
