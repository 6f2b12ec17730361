//! End-to-end pipeline tests: JSON event stream in, Perfetto packets out.
//!
//! These drive the public library surface the way the binary does and then
//! replay the emitted packet stream against a stack-discipline checker, so
//! every scenario doubles as a check of the per-row LIFO invariant.

use std::collections::HashMap;
use std::io::Cursor;

use protobuf::Message;
use tempfile::tempdir;

use perfetto_protos::trace::Trace;
use perfetto_protos::trace_packet::TracePacket;
use perfetto_protos::track_event::track_event::Type;

use goperfetto::events::{EventSource, JsonEventSource, ResourceKind};
use goperfetto::perfetto::{StreamingTraceWriter, VecTraceWriter};
use goperfetto::timeline::{Config, Stats, Timeline};

/// Run a JSONL stream through the converter and collect the packets.
fn convert(input: &str) -> (Vec<TracePacket>, Stats) {
    let mut source = JsonEventSource::new(Cursor::new(input.as_bytes().to_vec()));
    let mut timeline = Timeline::new(Config::default());
    while let Some(event) = source.next_event().unwrap() {
        timeline.handle_event(&event);
    }
    let mut writer = VecTraceWriter::default();
    let stats = timeline.finish(&mut writer).unwrap();
    (writer.packets, stats)
}

/// Replay every track event against a per-track stack. Panics on a close
/// with nothing open; returns the names closed per track, in close order,
/// and the number of slices still open at the end.
fn replay_stacks(packets: &[TracePacket]) -> (HashMap<u64, Vec<String>>, usize) {
    let mut stacks: HashMap<u64, Vec<String>> = HashMap::new();
    let mut closed: HashMap<u64, Vec<String>> = HashMap::new();
    let mut last_ts: HashMap<u64, u64> = HashMap::new();

    for packet in packets {
        if !packet.has_track_event() {
            continue;
        }
        let event = packet.track_event();
        let track = event.track_uuid();

        // Per-track timestamps never go backwards in the emitted stream.
        let ts = packet.timestamp();
        if let Some(&prev) = last_ts.get(&track) {
            assert!(ts >= prev, "timestamps regressed on track {track}");
        }
        last_ts.insert(track, ts);

        match event.type_() {
            Type::TYPE_SLICE_BEGIN => {
                stacks.entry(track).or_default().push(event.name().to_string());
            }
            Type::TYPE_SLICE_END => {
                let name = stacks
                    .entry(track)
                    .or_default()
                    .pop()
                    .expect("slice end with empty stack");
                closed.entry(track).or_default().push(name);
            }
            _ => {}
        }
    }

    let open = stacks.values().map(Vec::len).sum();
    (closed, open)
}

fn track_uuid(packets: &[TracePacket], name: &str) -> u64 {
    packets
        .iter()
        .find(|p| p.has_track_descriptor() && p.track_descriptor().name() == name)
        .map(|p| p.track_descriptor().uuid())
        .unwrap()
}

const SCENARIO: &str = r#"
{"ts":100,"thread":1,"kind":"metric","name":"/sched/goroutines","value":2}
{"ts":110,"thread":1,"kind":"range_begin","name":"GC concurrent mark phase","scope":{"kind":"none"}}
{"ts":120,"thread":1,"kind":"state_transition","transition":{"resource":"goroutine","id":7,"from":"waiting","to":"runnable","stack":[{"func":"main.worker","line":42}]}}
{"ts":130,"thread":1,"kind":"state_transition","transition":{"resource":"goroutine","id":7,"from":"runnable","to":"running"}}
{"ts":140,"thread":1,"kind":"range_begin","name":"mark assist","scope":{"kind":"goroutine","id":7}}
{"ts":150,"thread":1,"kind":"frobnicate","payload":"ignored"}
{"ts":160,"thread":1,"kind":"state_transition","transition":{"resource":"goroutine","id":7,"from":"running","to":"runnable"}}
{"ts":170,"thread":2,"kind":"state_transition","transition":{"resource":"goroutine","id":7,"from":"runnable","to":"running"}}
{"ts":180,"thread":2,"kind":"range_end","name":"mark assist","scope":{"kind":"goroutine","id":7}}
{"ts":190,"thread":2,"kind":"state_transition","transition":{"resource":"goroutine","id":7,"from":"running","to":"syscall"},"stack":[{"func":"syscall.Read","line":12}]}
{"ts":200,"thread":1,"kind":"metric","name":"/sched/goroutines","value":3}
{"ts":210,"thread":2,"kind":"state_transition","transition":{"resource":"goroutine","id":7,"from":"syscall","to":"running"}}
{"ts":220,"thread":2,"kind":"state_transition","transition":{"resource":"goroutine","id":7,"from":"running","to":"waiting"}}
{"ts":230,"thread":1,"kind":"range_end","name":"GC concurrent mark phase","scope":{"kind":"none"}}
{"ts":240,"thread":1,"kind":"range_begin","name":"proc range","scope":{"kind":"proc","id":0}}
{"ts":250,"thread":1,"kind":"sync"}
"#;

#[test]
fn test_scenario_reconstruction() {
    let (packets, stats) = convert(SCENARIO);

    let (closed, open) = replay_stacks(&packets);
    assert_eq!(open, 0, "all opened slices were closed");

    // Thread 1: the goroutine ran with the mark assist range nested inside,
    // and the preemption closed the range before the running slice.
    let row1 = track_uuid(&packets, "Thread 1");
    assert_eq!(
        closed[&row1],
        vec!["mark assist".to_string(), "G7 (main.worker)".to_string()]
    );

    // Thread 2: the resumed goroutine re-opened the range, finished it,
    // did a syscall and went to sleep.
    let row2 = track_uuid(&packets, "Thread 2");
    assert_eq!(
        closed[&row2],
        vec![
            "mark assist".to_string(),
            "syscall".to_string(),
            "G7 (main.worker)".to_string(),
        ]
    );

    // Process row: one GC range.
    let process = track_uuid(&packets, "Process");
    assert_eq!(closed[&process], vec!["GC concurrent mark phase".to_string()]);

    // Two metric samples on one counter track.
    let counter = track_uuid(&packets, "/sched/goroutines");
    let samples: Vec<i64> = packets
        .iter()
        .filter(|p| p.has_track_event())
        .filter(|p| p.track_event().track_uuid() == counter)
        .map(|p| p.track_event().counter_value())
        .collect();
    assert_eq!(samples, vec![2, 3]);

    assert_eq!(stats.events, 16);
    assert_eq!(stats.skipped_kinds, 1);
    assert_eq!(stats.skipped_scopes, 1);
    assert_eq!(stats.stack_underflows, 0);
    assert_eq!(stats.unclosed_slices, 0);
}

#[test]
fn test_unknown_kind_removal_equivalence() {
    let with_unknown = SCENARIO;
    let without_unknown: String = SCENARIO
        .lines()
        .filter(|line| !line.contains("frobnicate"))
        .collect::<Vec<_>>()
        .join("\n");

    let (packets_a, stats_a) = convert(with_unknown);
    let (packets_b, stats_b) = convert(&without_unknown);

    assert_eq!(packets_a, packets_b);
    assert_eq!(stats_a.skipped_kinds, stats_b.skipped_kinds + 1);
}

#[test]
fn test_streamed_file_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.pb");

    // Stream with an aggressive flush interval to force many batches.
    let mut source = JsonEventSource::new(Cursor::new(SCENARIO.as_bytes().to_vec()));
    let mut timeline = Timeline::new(Config::default());
    let file = std::fs::File::create(&path).unwrap();
    let mut writer = StreamingTraceWriter::new(std::io::BufWriter::new(file));
    let mut processed = 0u64;
    while let Some(event) = source.next_event().unwrap() {
        timeline.handle_event(&event);
        processed += 1;
        if processed % 3 == 0 {
            timeline.flush_into(&mut writer).unwrap();
        }
    }
    timeline.finish(&mut writer).unwrap();
    writer.flush().unwrap();

    // The concatenated batches parse back into one merged trace identical
    // to an unflushed conversion.
    let bytes = std::fs::read(&path).unwrap();
    let trace = Trace::parse_from_bytes(&bytes).unwrap();
    let (reference, _) = convert(SCENARIO);
    assert_eq!(trace.packet, reference);

    // Flushing must not have re-declared known tracks.
    let thread1_descriptors = trace
        .packet
        .iter()
        .filter(|p| p.has_track_descriptor() && p.track_descriptor().name() == "Thread 1")
        .count();
    assert_eq!(thread1_descriptors, 1);
}

#[test]
fn test_decode_error_still_flushes_accumulated_output() {
    let input = "{\"ts\":10,\"thread\":1,\"kind\":\"state_transition\",\"transition\":{\"resource\":\"goroutine\",\"id\":1,\"from\":\"runnable\",\"to\":\"running\"}}\nGARBAGE\n";
    let mut source = JsonEventSource::new(Cursor::new(input.as_bytes().to_vec()));
    let mut timeline = Timeline::new(Config::default());

    let mut failed = false;
    loop {
        match source.next_event() {
            Ok(Some(event)) => timeline.handle_event(&event),
            Ok(None) => break,
            Err(_) => {
                failed = true;
                break;
            }
        }
    }
    assert!(failed);

    let mut writer = VecTraceWriter::default();
    let stats = timeline.finish(&mut writer).unwrap();
    assert_eq!(stats.events, 1);

    // The slice opened before the failure is present in the output.
    let row = track_uuid(&writer.packets, "Thread 1");
    let begins = writer
        .packets
        .iter()
        .filter(|p| p.has_track_event())
        .filter(|p| p.track_event().track_uuid() == row)
        .filter(|p| p.track_event().type_() == Type::TYPE_SLICE_BEGIN)
        .count();
    assert_eq!(begins, 1);
}

#[test]
fn test_proc_kind_selection() {
    let input = r#"
{"ts":10,"thread":1,"kind":"state_transition","transition":{"resource":"proc","id":0,"from":"runnable","to":"running"}}
{"ts":20,"thread":1,"kind":"state_transition","transition":{"resource":"goroutine","id":7,"from":"runnable","to":"running"}}
{"ts":30,"thread":1,"kind":"state_transition","transition":{"resource":"proc","id":0,"from":"running","to":"waiting"}}
"#;
    let mut source = JsonEventSource::new(Cursor::new(input.as_bytes().to_vec()));
    let mut timeline = Timeline::new(Config {
        tracked: ResourceKind::Proc,
    });
    while let Some(event) = source.next_event().unwrap() {
        timeline.handle_event(&event);
    }
    let mut writer = VecTraceWriter::default();
    let stats = timeline.finish(&mut writer).unwrap();

    let (closed, open) = replay_stacks(&writer.packets);
    let row = track_uuid(&writer.packets, "Thread 1");
    assert_eq!(closed[&row], vec!["P0".to_string()]);
    assert_eq!(open, 0);
    assert_eq!(stats.skipped_transitions, 1);
}
