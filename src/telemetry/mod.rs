//! Telemetry and observability for the synchronization core.
//!
//! State machines publish [`SyncEvent`]s into an [`EventBus`]. Sinks are `tower::Service`s, so
//! anything that can consume an event (a log, a file, a metrics exporter) plugs in via
//! [`EventBus::forward_to`].

pub mod events;
pub mod sinks;

pub use events::{
    event_to_json, BreakerEvent, DegradationEvent, FlushReason, OptimizerEvent, QueueEvent,
    SyncEvent,
};
pub use sinks::{emit_best_effort, EventBus, LogSink, MemorySink, NullSink, TelemetrySink};
