//! goperfetto library - converting Go execution trace event streams into
//! Perfetto traces.
//!
//! # Modules
//!
//! - [`events`] - typed event model and the JSON-lines event source
//! - [`timeline`] - the reconstruction engine: rows, counters and the
//!   scheduler state tracker
//! - [`perfetto`] - trace packet construction and output writers

pub mod events;
pub mod perfetto;
pub mod timeline;

// Re-export for convenience
pub use events::{Event, EventPayload, EventSource, GoState, JsonEventSource, ResourceKind};
pub use perfetto::{StreamingTraceWriter, TraceSink, TraceWriter, VecTraceWriter};
pub use timeline::{Config, Stats, Timeline};
