//! Conflict detection and resolution for replayed offline writes.
//!
//! After a replay succeeds, the server's response is compared with what the client sent:
//!
//! - `deleted: true` on a create/update means the entity is gone ([`ConflictKind::Deleted`]).
//! - A `version` newer than the operation's `client_version` means someone else wrote first
//!   ([`ConflictKind::VersionMismatch`]).
//! - The same version but a different value for a field the client sent means the two sides
//!   drifted without a version bump ([`ConflictKind::DataDivergence`]).
//!
//! Creates are never checked for version conflicts: the server assigns their version.

use crate::queue::{OperationKind, QueuedOperation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    VersionMismatch,
    Deleted,
    DataDivergence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    ClientWins,
    ServerWins,
    Merged,
    ManualRequired,
}

/// Deployment-wide resolution policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    ClientWins,
    ServerWins,
    /// Structural merge; falls back to manual when payloads are not compatible.
    #[default]
    Merge,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub operation_id: String,
    pub entity_type: String,
    pub kind: ConflictKind,
    pub client_payload: Value,
    pub server_payload: Value,
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConflictConfigError {
    #[error("merge_overlap_threshold must be within 0.0..=1.0 (got {0})")]
    InvalidOverlapThreshold(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
    merge_overlap_threshold: f64,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self { strategy: ConflictStrategy::default(), merge_overlap_threshold: 0.5 }
    }
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy, ..Self::default() }
    }

    /// Minimum share of fields two records must have in common before they are merged.
    ///
    /// Shared keys over the union of keys. The 0.5 default is a heuristic pending product review.
    pub fn with_merge_overlap_threshold(
        mut self,
        threshold: f64,
    ) -> Result<Self, ConflictConfigError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConflictConfigError::InvalidOverlapThreshold(threshold));
        }
        self.merge_overlap_threshold = threshold;
        Ok(self)
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    pub fn merge_overlap_threshold(&self) -> f64 {
        self.merge_overlap_threshold
    }

    /// Compare a successful replay's response with the queued operation.
    pub fn detect(&self, op: &QueuedOperation, response: &Value) -> Option<ConflictKind> {
        if op.kind != OperationKind::Delete && response.get("deleted") == Some(&Value::Bool(true)) {
            return Some(ConflictKind::Deleted);
        }
        if op.kind == OperationKind::Create {
            return None;
        }
        let server_version = response.get("version").and_then(Value::as_u64)?;
        if server_version > op.client_version {
            return Some(ConflictKind::VersionMismatch);
        }
        if server_version == op.client_version && diverges(&op.payload, response) {
            return Some(ConflictKind::DataDivergence);
        }
        None
    }

    /// Apply the configured strategy to a detected conflict.
    pub fn resolve(
        &self,
        op: &QueuedOperation,
        kind: ConflictKind,
        server: &Value,
    ) -> ConflictRecord {
        let mut record = ConflictRecord {
            operation_id: op.id.clone(),
            entity_type: op.entity_type.clone(),
            kind,
            client_payload: op.payload.clone(),
            server_payload: server.clone(),
            resolution: Resolution::ManualRequired,
            merged_payload: None,
        };
        record.resolution = match self.strategy {
            ConflictStrategy::ClientWins => Resolution::ClientWins,
            ConflictStrategy::ServerWins => Resolution::ServerWins,
            ConflictStrategy::Manual => Resolution::ManualRequired,
            ConflictStrategy::Merge => match self.try_merge(op, kind, server) {
                Some(merged) => {
                    record.merged_payload = Some(merged);
                    Resolution::Merged
                }
                None => {
                    tracing::debug!(
                        target: "lifeline::conflict",
                        operation_id = %op.id,
                        ?kind,
                        "payloads not mergeable; manual resolution required"
                    );
                    Resolution::ManualRequired
                }
            },
        };
        record
    }

    fn try_merge(&self, op: &QueuedOperation, kind: ConflictKind, server: &Value) -> Option<Value> {
        if kind == ConflictKind::Deleted || op.kind == OperationKind::Delete {
            return None;
        }
        let (client, server_fields) = (op.payload.as_object()?, server.as_object()?);
        if overlap_ratio(client, server_fields) < self.merge_overlap_threshold {
            return None;
        }
        merge_records(client, server_fields, op.client_version, server_version(server))
    }
}

/// Client fields overlaid on the server record; version is the higher of the two plus one.
///
/// Returns `None` when the next version would not fit in a `u64`.
pub fn merge_records(
    client: &Map<String, Value>,
    server: &Map<String, Value>,
    client_version: u64,
    server_version: u64,
) -> Option<Value> {
    let version = client_version.max(server_version).checked_add(1)?;
    let mut merged = server.clone();
    for (key, value) in client {
        merged.insert(key.clone(), value.clone());
    }
    merged.remove("force");
    merged.insert("version".into(), Value::from(version));
    Some(Value::Object(merged))
}

/// Share of fields the two records have in common (over the union of their fields).
pub fn overlap_ratio(a: &Map<String, Value>, b: &Map<String, Value>) -> f64 {
    let shared = a.keys().filter(|k| b.contains_key(*k)).count();
    let union = a.len() + b.len() - shared;
    if union == 0 {
        return 1.0;
    }
    shared as f64 / union as f64
}

/// Payload to resend when the client's write should be forced through.
///
/// Merged records already carry their new version; client-wins payloads take the server's.
pub fn forced_payload(record: &ConflictRecord) -> Value {
    let mut payload = match (&record.merged_payload, &record.client_payload) {
        (Some(merged), _) => merged.clone(),
        (None, client) => client.clone(),
    };
    if let Value::Object(fields) = &mut payload {
        if record.merged_payload.is_none() {
            if let Some(version) = record.server_payload.get("version") {
                fields.insert("version".into(), version.clone());
            }
        }
        fields.insert("force".into(), Value::Bool(true));
    }
    payload
}

pub(crate) fn server_version(server: &Value) -> u64 {
    server.get("version").and_then(Value::as_u64).unwrap_or(0)
}

fn diverges(client: &Value, server: &Value) -> bool {
    let (Some(client), Some(server)) = (client.as_object(), server.as_object()) else {
        return false;
    };
    client
        .iter()
        .filter(|(k, _)| k.as_str() != "version" && k.as_str() != "force")
        .any(|(k, v)| server.get(k).is_some_and(|s| s != v))
}
