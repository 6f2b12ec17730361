//! Event model for the execution trace stream.
//!
//! The converter consumes a pre-digested export of a Go execution trace:
//! one JSON object per line, already in chronological order. This module
//! owns the typed view of that stream and the decoder that produces it;
//! the reconstruction logic lives in [`crate::timeline`].

use std::fmt;
use std::io::BufRead;

use anyhow::{Context, Result};
use serde::Deserialize;

/// A single frame of a captured call stack.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StackFrame {
    pub func: String,
    #[serde(default)]
    pub line: u64,
}

impl StackFrame {
    /// "<function>:<line>", the annotation format used on syscall slices.
    pub fn location(&self) -> String {
        format!("{}:{}", self.func, self.line)
    }
}

/// Scheduler state of a goroutine, as reported by a state transition.
///
/// Any state string we don't recognize decodes to `Undetermined`, which the
/// tracker treats the same as any other not-running state.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoState {
    NotExist,
    Runnable,
    Running,
    Syscall,
    Waiting,
    #[serde(other)]
    Undetermined,
}

/// The resource a transition or range scope is attached to.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    None,
    Goroutine,
    Proc,
    Thread,
    #[serde(other)]
    Other,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::None => "none",
            ResourceKind::Goroutine => "goroutine",
            ResourceKind::Proc => "proc",
            ResourceKind::Thread => "thread",
            ResourceKind::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Scope of a range event: `none` means process-wide, otherwise the range
/// is attached to the resource identified by `(kind, id)`.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct RangeScope {
    pub kind: ResourceKind,
    #[serde(default)]
    pub id: i64,
}

/// A scheduler state transition for one resource.
///
/// The transition carries its own stack (the stack of the resource being
/// transitioned, which can differ from the stack of the thread that
/// recorded the event).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StateTransition {
    pub resource: ResourceKind,
    pub id: i64,
    pub from: GoState,
    pub to: GoState,
    #[serde(default)]
    pub stack: Vec<StackFrame>,
}

/// The kind-specific payload of an event.
///
/// `Sync` and `Label` are recognized but carry nothing we reconstruct.
/// Every kind we don't know decodes to `Other` and is counted as skipped
/// downstream instead of failing the run.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Metric { name: String, value: u64 },
    RangeBegin { name: String, scope: RangeScope },
    RangeEnd { name: String, scope: RangeScope },
    StateTransition { transition: StateTransition },
    Sync,
    Label { label: String },
    #[serde(other)]
    Other,
}

/// One decoded event from the stream.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Event {
    /// Monotonic timestamp in nanoseconds.
    pub ts: u64,
    /// The OS thread that physically recorded this event.
    pub thread: i64,
    /// Call stack attached to the event itself, possibly empty.
    #[serde(default)]
    pub stack: Vec<StackFrame>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// The entity (goroutine/proc) this event refers to, if any. Used by
    /// the verbose print filters, not by the reconstruction.
    pub fn entity_id(&self) -> Option<i64> {
        match &self.payload {
            EventPayload::StateTransition { transition } => Some(transition.id),
            EventPayload::RangeBegin { scope, .. } | EventPayload::RangeEnd { scope, .. } => {
                (scope.kind != ResourceKind::None).then_some(scope.id)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts={} thread={} ", self.ts, self.thread)?;
        match &self.payload {
            EventPayload::Metric { name, value } => {
                write!(f, "metric {}={}", name, value)
            }
            EventPayload::RangeBegin { name, scope } => {
                write!(f, "range-begin {:?} scope={}/{}", name, scope.kind, scope.id)
            }
            EventPayload::RangeEnd { name, scope } => {
                write!(f, "range-end {:?} scope={}/{}", name, scope.kind, scope.id)
            }
            EventPayload::StateTransition { transition } => {
                write!(
                    f,
                    "transition {} {} {:?}->{:?}",
                    transition.resource, transition.id, transition.from, transition.to
                )
            }
            EventPayload::Sync => write!(f, "sync"),
            EventPayload::Label { label } => write!(f, "label {:?}", label),
            EventPayload::Other => write!(f, "unrecognized"),
        }
    }
}

/// Sequential source of decoded events. `Ok(None)` signals exhaustion;
/// an error terminates the read loop.
pub trait EventSource {
    fn next_event(&mut self) -> Result<Option<Event>>;
}

/// Event source reading one JSON object per line.
pub struct JsonEventSource<R: BufRead> {
    reader: R,
    line: String,
    lineno: usize,
}

impl<R: BufRead> JsonEventSource<R> {
    pub fn new(reader: R) -> Self {
        JsonEventSource {
            reader,
            line: String::new(),
            lineno: 0,
        }
    }
}

impl<R: BufRead> EventSource for JsonEventSource<R> {
    fn next_event(&mut self) -> Result<Option<Event>> {
        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .context("Failed to read from event stream")?;
            if n == 0 {
                return Ok(None);
            }
            self.lineno += 1;
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            let event = serde_json::from_str(line)
                .with_context(|| format!("Malformed event on line {}", self.lineno))?;
            return Ok(Some(event));
        }
    }
}
