//! Core type definitions for the simulation runtime

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier types
pub type ParticipantId = String;
pub type SessionId = String;

/// Training round counter
pub type Round = u64;

/// 0-based position of a worker within a run
pub type WorkerSlot = usize;

/// Per-round, per-key contribution scores
pub type AttributionTable<K> = BTreeMap<Round, BTreeMap<K, f64>>;

/// Attribution table as produced by a server, keyed by worker slot
pub type SlotAttribution = AttributionTable<WorkerSlot>;

/// Attribution table as returned to callers, keyed by participant id
pub type ParticipantAttribution = AttributionTable<ParticipantId>;

/// Metric key under which the server performance statistic is stored
pub const PERFORMANCE_KEY: &str = "performance";

/// Identifier of one asynchronous training run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u128);

impl TaskId {
    /// Mint a new task id from a random uuid and the current process id
    pub fn mint() -> Self {
        let random = Uuid::new_v4().as_u128();
        Self(random.wrapping_add(u128::from(std::process::id())))
    }

    pub fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u128>().map(Self)
    }
}

/// One federated party taking part in a run
///
/// Equality, ordering and hashing look at `id` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Practitioner {
    /// Stable participant identifier
    pub id: ParticipantId,

    /// Optional display name
    pub name: Option<String>,
}

impl Practitioner {
    pub fn new(id: impl Into<ParticipantId>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl PartialEq for Practitioner {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Practitioner {}

impl PartialOrd for Practitioner {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Practitioner {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Practitioner {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Output of one completed server run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultFragment {
    /// Named metrics
    pub metrics: BTreeMap<String, Value>,

    /// Attribution table keyed by worker slot, if the algorithm computes one
    pub shapley_values: Option<SlotAttribution>,
}

impl ResultFragment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a metric
    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(key.into(), value.into());
        self
    }

    pub fn with_shapley_values(mut self, table: SlotAttribution) -> Self {
        self.shapley_values = Some(table);
        self
    }

    /// Fold a later fragment into this one, later values win per key
    pub fn merge(&mut self, other: ResultFragment) {
        self.metrics.extend(other.metrics);
        if other.shapley_values.is_some() {
            self.shapley_values = other.shapley_values;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.shapley_values.is_none()
    }
}

/// Final statistics of a completed run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    /// Metrics copied through from the server
    #[serde(flatten)]
    pub metrics: BTreeMap<String, Value>,

    /// Attribution table keyed by participant id
    #[serde(rename = "sv", default, skip_serializing_if = "Option::is_none")]
    pub shapley_values: Option<ParticipantAttribution>,
}

impl TrainingStats {
    /// Get the server performance statistic
    pub fn performance(&self) -> Option<&Value> {
        self.metrics.get(PERFORMANCE_KEY)
    }
}
