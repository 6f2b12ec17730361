use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use goperfetto::events::{Event, EventSource, JsonEventSource, ResourceKind};
use goperfetto::perfetto::StreamingTraceWriter;
use goperfetto::timeline::{Config, Timeline};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TrackedKind {
    Goroutine,
    Proc,
    Thread,
}

impl From<TrackedKind> for ResourceKind {
    fn from(kind: TrackedKind) -> Self {
        match kind {
            TrackedKind::Goroutine => ResourceKind::Goroutine,
            TrackedKind::Proc => ResourceKind::Proc,
            TrackedKind::Thread => ResourceKind::Thread,
        }
    }
}

#[derive(Debug, Parser)]
struct Command {
    /// Input event stream, one JSON event per line.
    input: PathBuf,
    /// Output Perfetto trace file.
    #[arg(short, long, default_value = "trace.pb")]
    output: PathBuf,
    /// Resource kind to reconstruct scheduling rows for.
    #[arg(short, long, value_enum, default_value_t = TrackedKind::Goroutine)]
    kind: TrackedKind,
    /// Print events while converting.
    #[arg(short, long)]
    verbose: bool,
    /// Start timestamp for verbose prints.
    #[arg(short, long, default_value_t = 0)]
    start_ts: u64,
    /// End timestamp for verbose prints.
    #[arg(short, long, default_value_t = u64::MAX)]
    end_ts: u64,
    /// Only verbose-print events referring to this entity.
    #[arg(short, long)]
    goroutine: Option<i64>,
    /// Only verbose-print events recorded on this thread.
    #[arg(short, long)]
    thread: Option<i64>,
    /// Serialize accumulated packets every N events (0 = only at the end).
    #[arg(long, default_value_t = 0)]
    flush_interval: u64,
}

fn wants_print(opts: &Command, event: &Event) -> bool {
    if event.ts < opts.start_ts || event.ts > opts.end_ts {
        return false;
    }
    if let Some(goroutine) = opts.goroutine {
        if event.entity_id() != Some(goroutine) {
            return false;
        }
    }
    if let Some(thread) = opts.thread {
        if event.thread != thread {
            return false;
        }
    }
    true
}

fn main() -> Result<()> {
    let opts = Command::parse();

    let input = File::open(&opts.input)
        .with_context(|| format!("Failed to open {}", opts.input.display()))?;
    let mut source = JsonEventSource::new(BufReader::new(input));

    let output = File::create(&opts.output)
        .with_context(|| format!("Failed to create {}", opts.output.display()))?;
    let mut writer = StreamingTraceWriter::new(BufWriter::new(output));

    let mut timeline = Timeline::new(Config {
        tracked: opts.kind.into(),
    });

    let mut processed: u64 = 0;
    let result = loop {
        match source.next_event() {
            Ok(Some(event)) => {
                if opts.verbose && wants_print(&opts, &event) {
                    println!("| {}", event);
                }
                timeline.handle_event(&event);
                processed += 1;
                if opts.flush_interval > 0 && processed % opts.flush_interval == 0 {
                    timeline.flush_into(&mut writer)?;
                }
            }
            Ok(None) => break Ok(()),
            // A dead event source still gets whatever was reconstructed so
            // far written out below.
            Err(err) => break Err(err),
        }
    };

    let stats = timeline.finish(&mut writer)?;
    writer.flush()?;

    println!(
        "Wrote {} trace packets to {}",
        writer.packet_count(),
        opts.output.display()
    );
    println!("Processed events: {}", stats.events);
    if stats.skipped_kinds > 0 {
        println!("Skipped unrecognized events: {}", stats.skipped_kinds);
    }
    if stats.skipped_transitions > 0 {
        println!(
            "Skipped foreign-resource transitions: {}",
            stats.skipped_transitions
        );
    }
    if stats.skipped_scopes > 0 {
        println!("Skipped foreign-scope ranges: {}", stats.skipped_scopes);
    }
    if stats.stack_underflows > 0 {
        eprintln!(
            "Warning: {} close events without a matching open",
            stats.stack_underflows
        );
    }
    if stats.unclosed_slices > 0 {
        eprintln!(
            "Warning: {} slices still open at end of trace",
            stats.unclosed_slices
        );
    }

    result
}
