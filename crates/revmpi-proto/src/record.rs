use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

const CHECKPOINT_ID_LEN: usize = 10;
const CHECKPOINT_ID_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Identifier assigned to a worker by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

/// Opaque identifier of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointId(String);

/// A message operation intercepted on a worker, as reported to the
/// coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Checkpoint taken when the operation was intercepted.
    pub checkpoint_id: CheckpointId,

    /// Name of the operation.
    pub op_name: String,

    /// Captured arguments, formatted as decimal strings.
    pub parameters: BTreeMap<String, String>,

    /// Reporting worker.
    pub worker_id: WorkerId,
}

impl CheckpointId {
    /// Generates a random ID (10 characters over `[0-9a-z]`).
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();

        let id = (0..CHECKPOINT_ID_LEN)
            .map(|_| CHECKPOINT_ID_CHARSET[rng.gen_range(0..CHECKPOINT_ID_CHARSET.len())] as char)
            .collect();

        Self(id)
    }

    /// The ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CheckpointId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for CheckpointId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl OperationRecord {
    /// Returns a parameter parsed as an integer.
    pub fn integer_param(&self, name: &str) -> Option<i64> {
        self.parameters.get(name)?.parse().ok()
    }
}
