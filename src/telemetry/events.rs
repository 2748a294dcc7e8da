use crate::circuit_breaker::CircuitState;
use crate::conflict::{ConflictKind, Resolution};
use crate::degradation::Mode;
use serde_json::json;
use std::fmt;

/// Events published by the synchronization core.
///
/// Every state machine publishes into the same stream so a single sink can reconstruct what
/// the client went through during an outage.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Circuit breaker events
    Breaker(BreakerEvent),
    /// Degradation mode changes
    Degradation(DegradationEvent),
    /// Offline queue activity
    Queue(QueueEvent),
    /// Request optimizer activity
    Optimizer(OptimizerEvent),
}

/// A breaker for `key` moved between states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerEvent {
    pub key: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub consecutive_failures: usize,
}

/// The degradation manager changed mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradationEvent {
    pub from: Mode,
    pub to: Mode,
    pub reason: String,
}

/// Events emitted by the offline queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A write was deferred.
    Enqueued { operation_id: String, entity_type: String, depth: usize },
    /// A write exhausted its retry budget or can never succeed.
    DeadLettered { operation_id: String, reason: String },
    /// A replay disagreed with server state.
    ConflictRaised { operation_id: String, kind: ConflictKind, resolution: Resolution },
    /// A sync pass finished.
    SyncCompleted { processed: usize, failed: usize, conflicts: usize, remaining: usize },
}

/// Events emitted by the request optimizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizerEvent {
    /// A caller joined an identical in-flight request.
    Deduplicated { operation: String },
    /// A batch was sent.
    BatchFlushed { operation: String, size: usize, reason: FlushReason },
}

/// Why a batch left its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Window,
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::Breaker(e) => {
                write!(
                    f,
                    "Breaker::{}({:?} -> {:?}, failures={})",
                    e.key, e.from, e.to, e.consecutive_failures
                )
            }
            SyncEvent::Degradation(e) => {
                write!(f, "Degradation({:?} -> {:?}: {})", e.from, e.to, e.reason)
            }
            SyncEvent::Queue(e) => write!(f, "Queue::{}", e),
            SyncEvent::Optimizer(e) => write!(f, "Optimizer::{}", e),
        }
    }
}

impl fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueEvent::Enqueued { operation_id, entity_type, depth } => {
                write!(f, "Enqueued({entity_type}/{operation_id}, depth={depth})")
            }
            QueueEvent::DeadLettered { operation_id, reason } => {
                write!(f, "DeadLettered({operation_id}: {reason})")
            }
            QueueEvent::ConflictRaised { operation_id, kind, resolution } => {
                write!(f, "Conflict({operation_id}, {kind:?} -> {resolution:?})")
            }
            QueueEvent::SyncCompleted { processed, failed, conflicts, remaining } => write!(
                f,
                "SyncCompleted(processed={processed}, failed={failed}, \
                 conflicts={conflicts}, remaining={remaining})"
            ),
        }
    }
}

impl fmt::Display for OptimizerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerEvent::Deduplicated { operation } => write!(f, "Deduplicated({operation})"),
            OptimizerEvent::BatchFlushed { operation, size, reason } => {
                write!(f, "BatchFlushed({operation}, size={size}, reason={reason:?})")
            }
        }
    }
}

/// Convert an event into a JSON value for sinks.
pub fn event_to_json(event: &SyncEvent) -> serde_json::Value {
    match event {
        SyncEvent::Breaker(e) => json!({
            "kind": "breaker_transition",
            "key": e.key,
            "from": format!("{:?}", e.from),
            "to": format!("{:?}", e.to),
            "failures": e.consecutive_failures,
        }),
        SyncEvent::Degradation(e) => json!({
            "kind": "mode_changed",
            "from": e.from.as_str(),
            "to": e.to.as_str(),
            "reason": e.reason,
        }),
        SyncEvent::Queue(q) => match q {
            QueueEvent::Enqueued { operation_id, entity_type, depth } => json!({
                "kind": "operation_queued",
                "operation_id": operation_id,
                "entity_type": entity_type,
                "depth": depth,
            }),
            QueueEvent::DeadLettered { operation_id, reason } => json!({
                "kind": "operation_dead_lettered",
                "operation_id": operation_id,
                "reason": reason,
            }),
            QueueEvent::ConflictRaised { operation_id, kind, resolution } => json!({
                "kind": "conflict_raised",
                "operation_id": operation_id,
                "conflict": format!("{kind:?}"),
                "resolution": format!("{resolution:?}"),
            }),
            QueueEvent::SyncCompleted { processed, failed, conflicts, remaining } => json!({
                "kind": "sync_completed",
                "processed": processed,
                "failed": failed,
                "conflicts": conflicts,
                "remaining": remaining,
            }),
        },
        SyncEvent::Optimizer(o) => match o {
            OptimizerEvent::Deduplicated { operation } => {
                json!({ "kind": "request_deduplicated", "operation": operation })
            }
            OptimizerEvent::BatchFlushed { operation, size, reason } => json!({
                "kind": "batch_flushed",
                "operation": operation,
                "size": size,
                "reason": format!("{reason:?}").to_lowercase(),
            }),
        },
    }
}
