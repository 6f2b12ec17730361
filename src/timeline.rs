//! Timeline reconstruction.
//!
//! Consumes the chronological event stream and rebuilds a nested slice
//! timeline: one row per OS thread, one distinguished process row, one
//! counter track per metric name. The interesting part is the scheduler
//! tracker: events describe logical entities (goroutines) but are recorded
//! on whatever thread happened to emit them, entities migrate between
//! threads across preemptions, and syscalls interleave with it all. The
//! tracker keeps per-entity state so the emitted begin/end calls still obey
//! each row's LIFO stack discipline.

use std::collections::HashMap;

use anyhow::Result;

use crate::events::{
    Event, EventPayload, GoState, RangeScope, ResourceKind, StackFrame, StateTransition,
};
use crate::perfetto::{TraceSink, TraceWriter};

/// Reconstruction configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Resource kind whose transitions and scoped ranges are tracked.
    /// Transitions and entity scopes of any other kind are counted as
    /// skipped.
    pub tracked: ResourceKind,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tracked: ResourceKind::Goroutine,
        }
    }
}

/// Anomaly and progress counters for one conversion run.
///
/// Everything in here is observable-but-not-fatal: malformed or unsupported
/// stream content degrades the reconstruction, it never aborts it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Events read and classified.
    pub events: u64,
    /// Events with a kind we don't recognize.
    pub skipped_kinds: u64,
    /// State transitions for a resource kind we're not tracking.
    pub skipped_transitions: u64,
    /// Range events with an entity scope we're not tracking.
    pub skipped_scopes: u64,
    /// Close calls that found no open slice on the row.
    pub stack_underflows: u64,
    /// Slices still open when the stream ended.
    pub unclosed_slices: u64,
}

/// Explicit LIFO stack of the slices currently open on one row.
#[derive(Default)]
struct SliceStack {
    open: Vec<String>,
}

impl SliceStack {
    fn push(&mut self, name: &str) {
        self.open.push(name.to_string());
    }

    fn pop(&mut self) -> Option<String> {
        self.open.pop()
    }

    fn depth(&self) -> usize {
        self.open.len()
    }
}

/// One timeline row: its output track and its open-slice stack.
struct RowState {
    track: u64,
    stack: SliceStack,
}

/// Auxiliary per-entity state. Entries are created on first reference and
/// never removed.
#[derive(Default)]
struct EntityState {
    /// A running slice for this entity is currently open on some row.
    running: bool,
    /// Starting-function name captured at the latest transition to
    /// Runnable, consumed to label the next running slice.
    pending_label: Option<String>,
    /// Name of an entity-scoped range considered logically open, so it can
    /// be re-opened around a new running slice after a preemption.
    active_range: Option<String>,
}

/// The reconstruction engine: classifier, row/counter registries and the
/// scheduler tracker, feeding a [`TraceSink`].
pub struct Timeline {
    config: Config,
    sink: TraceSink,
    process_row: RowState,
    rows: HashMap<i64, RowState>,
    counters: HashMap<String, u64>,
    entities: HashMap<i64, EntityState>,
    stats: Stats,
}

/// The transition's own stack when present, the event's otherwise.
fn effective_stack<'a>(transition: &'a StateTransition, event: &'a Event) -> &'a [StackFrame] {
    if !transition.stack.is_empty() {
        &transition.stack
    } else {
        &event.stack
    }
}

fn open_slice(
    sink: &mut TraceSink,
    row: &mut RowState,
    ts: u64,
    name: &str,
    annotations: &[(String, String)],
) {
    row.stack.push(name);
    sink.slice_begin(row.track, ts, name, annotations);
}

// Closing with nothing open is a malformed-stream anomaly, not ours to
// crash on: count it and move on.
fn close_slice(sink: &mut TraceSink, row: &mut RowState, ts: u64, stats: &mut Stats) {
    if row.stack.pop().is_some() {
        sink.slice_end(row.track, ts);
    } else {
        stats.stack_underflows += 1;
    }
}

impl Timeline {
    pub fn new(config: Config) -> Self {
        let mut sink = TraceSink::new();
        let track = sink.root_track("Process");
        Timeline {
            config,
            sink,
            process_row: RowState {
                track,
                stack: SliceStack::default(),
            },
            rows: HashMap::new(),
            counters: HashMap::new(),
            entities: HashMap::new(),
            stats: Stats::default(),
        }
    }

    /// Classify and process one event.
    pub fn handle_event(&mut self, event: &Event) {
        self.stats.events += 1;
        self.ensure_row(event.thread);

        match &event.payload {
            EventPayload::Metric { name, value } => {
                self.record_metric(name, event.ts, *value as i64);
            }
            EventPayload::RangeBegin { name, scope } => {
                self.handle_range(true, name, *scope, event.thread, event.ts);
            }
            EventPayload::RangeEnd { name, scope } => {
                self.handle_range(false, name, *scope, event.thread, event.ts);
            }
            EventPayload::StateTransition { transition } => {
                self.handle_transition(transition, event);
            }
            // Recognized, but there is no interval content to reconstruct.
            EventPayload::Sync | EventPayload::Label { .. } => {}
            EventPayload::Other => self.stats.skipped_kinds += 1,
        }
    }

    fn ensure_row(&mut self, thread: i64) {
        if !self.rows.contains_key(&thread) {
            let track = self
                .sink
                .child_track(self.process_row.track, &format!("Thread {}", thread));
            self.rows.insert(
                thread,
                RowState {
                    track,
                    stack: SliceStack::default(),
                },
            );
        }
    }

    fn record_metric(&mut self, name: &str, ts: u64, value: i64) {
        let track = match self.counters.get(name) {
            Some(&track) => track,
            None => {
                let track = self.sink.counter_track(name, "");
                self.counters.insert(name.to_string(), track);
                track
            }
        };
        self.sink.counter_sample(track, ts, value);
    }

    fn handle_range(&mut self, begin: bool, name: &str, scope: RangeScope, thread: i64, ts: u64) {
        // Process-wide ranges live on the distinguished process row.
        if scope.kind == ResourceKind::None {
            if begin {
                open_slice(&mut self.sink, &mut self.process_row, ts, name, &[]);
            } else {
                close_slice(&mut self.sink, &mut self.process_row, ts, &mut self.stats);
            }
            return;
        }

        if scope.kind != self.config.tracked {
            self.stats.skipped_scopes += 1;
            return;
        }

        let Some(row) = self.rows.get_mut(&thread) else {
            return;
        };
        let entity = self.entities.entry(scope.id).or_default();
        if begin {
            // The slice goes on the recording row, nested inside whatever
            // is already open there. The name is also remembered on the
            // entity so the range survives a preemption (see
            // handle_transition).
            entity.active_range = Some(name.to_string());
            open_slice(&mut self.sink, row, ts, name, &[]);
        } else {
            entity.active_range = None;
            close_slice(&mut self.sink, row, ts, &mut self.stats);
        }
    }

    fn handle_transition(&mut self, transition: &StateTransition, event: &Event) {
        if transition.resource != self.config.tracked {
            self.stats.skipped_transitions += 1;
            return;
        }
        let Some(row) = self.rows.get_mut(&event.thread) else {
            return;
        };
        let entity = self.entities.entry(transition.id).or_default();
        let ts = event.ts;

        // Leaving the syscall state closes the syscall slice, whatever the
        // destination state is.
        if transition.from == GoState::Syscall {
            close_slice(&mut self.sink, row, ts, &mut self.stats);
        }

        // A syscall transition is self-contained: syscall is a sub-state
        // of running from the scheduler's point of view, so no running
        // slice is opened or closed here.
        if transition.to == GoState::Syscall {
            let annotations: Vec<(String, String)> = effective_stack(transition, event)
                .iter()
                .enumerate()
                .map(|(i, frame)| (i.to_string(), frame.location()))
                .collect();
            open_slice(&mut self.sink, row, ts, "syscall", &annotations);
            return;
        }

        // Remember the starting function when the entity becomes runnable.
        // It is consumed, possibly much later, to label the running slice.
        if transition.to == GoState::Runnable {
            if let Some(frame) = effective_stack(transition, event).last() {
                if !frame.func.is_empty() {
                    entity.pending_label = Some(frame.func.clone());
                }
            }
        }

        if transition.to == GoState::Running {
            // Idempotent against duplicate to-Running events.
            if !entity.running {
                let id = format!("{}{}", self.config.tracked.entity_prefix(), transition.id);
                let name = match &entity.pending_label {
                    Some(label) => format!("{} ({})", id, label),
                    None => id,
                };
                open_slice(&mut self.sink, row, ts, &name, &[]);
                if let Some(range) = entity.active_range.clone() {
                    // Re-synthesize the logically-open range inside the new
                    // running slice.
                    open_slice(&mut self.sink, row, ts, &range, &[]);
                }
                entity.running = true;
            }
        } else if entity.running {
            // The range slice is the inner of the pair and has to close
            // before the running slice.
            if entity.active_range.is_some() {
                close_slice(&mut self.sink, row, ts, &mut self.stats);
            }
            close_slice(&mut self.sink, row, ts, &mut self.stats);
            entity.running = false;
        }
    }

    /// Hand accumulated packets to `writer`. Row and counter identity is
    /// preserved across flushes.
    pub fn flush_into(&mut self, writer: &mut dyn TraceWriter) -> Result<()> {
        self.sink.flush_into(writer)
    }

    /// Flush whatever remains and return the run's counters. Slices still
    /// open at this point stay open in the output and are counted.
    pub fn finish(mut self, writer: &mut dyn TraceWriter) -> Result<Stats> {
        self.stats.unclosed_slices = self.process_row.stack.depth() as u64
            + self
                .rows
                .values()
                .map(|row| row.stack.depth() as u64)
                .sum::<u64>();
        self.sink.flush_into(writer)?;
        Ok(self.stats)
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }
}

impl ResourceKind {
    /// Prefix for running-slice names: "G7" for goroutine 7, "P2" for
    /// proc 2.
    fn entity_prefix(&self) -> &'static str {
        match self {
            ResourceKind::Goroutine => "G",
            ResourceKind::Proc => "P",
            ResourceKind::Thread => "M",
            ResourceKind::None | ResourceKind::Other => "R",
        }
    }
}
