//! Perfetto output sink.
//!
//! [`TraceSink`] turns row/counter/slice operations into `TracePacket`s and
//! accumulates them until flushed. Track identity is a uuid allocated once
//! per track and never reused, and each descriptor packet is emitted
//! exactly once, so the sink can be flushed periodically to bound memory
//! without re-declaring tracks a later batch refers back to.
//!
//! [`StreamingTraceWriter`] appends every packet as its own serialized
//! [`Trace`] message. Concatenated `Trace` messages merge by protobuf
//! repeated-field semantics, so the resulting file parses back into a
//! single trace.

use std::io::Write;

use anyhow::Result;
use protobuf::Message;

use perfetto_protos::counter_descriptor::counter_descriptor::Unit;
use perfetto_protos::counter_descriptor::CounterDescriptor;
use perfetto_protos::debug_annotation::DebugAnnotation;
use perfetto_protos::trace::Trace;
use perfetto_protos::trace_packet::TracePacket;
use perfetto_protos::track_descriptor::TrackDescriptor;
use perfetto_protos::track_event::track_event::Type;
use perfetto_protos::track_event::TrackEvent;

/// Destination for finalized trace packets.
pub trait TraceWriter {
    fn write_packet(&mut self, packet: &TracePacket) -> Result<()>;
}

/// Writer that serializes each packet straight to the underlying stream.
pub struct StreamingTraceWriter<W: Write> {
    out: W,
    packet_count: u64,
}

impl<W: Write> StreamingTraceWriter<W> {
    pub fn new(out: W) -> Self {
        StreamingTraceWriter {
            out,
            packet_count: 0,
        }
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write> TraceWriter for StreamingTraceWriter<W> {
    fn write_packet(&mut self, packet: &TracePacket) -> Result<()> {
        let mut trace = Trace::default();
        trace.packet.push(packet.clone());
        trace.write_to_writer(&mut self.out)?;
        self.packet_count += 1;
        Ok(())
    }
}

/// Writer that keeps packets in memory, for tests.
#[derive(Default)]
pub struct VecTraceWriter {
    pub packets: Vec<TracePacket>,
}

impl TraceWriter for VecTraceWriter {
    fn write_packet(&mut self, packet: &TracePacket) -> Result<()> {
        self.packets.push(packet.clone());
        Ok(())
    }
}

/// Builds and accumulates trace packets for rows, counters and slices.
pub struct TraceSink {
    next_uuid: u64,
    seq_id: u32,
    pending: Vec<TracePacket>,
    total_packets: u64,
}

impl Default for TraceSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceSink {
    pub fn new() -> Self {
        TraceSink {
            next_uuid: 1,
            seq_id: 1,
            pending: Vec::new(),
            total_packets: 0,
        }
    }

    fn alloc_uuid(&mut self) -> u64 {
        let uuid = self.next_uuid;
        self.next_uuid += 1;
        uuid
    }

    fn push(&mut self, packet: TracePacket) {
        self.pending.push(packet);
        self.total_packets += 1;
    }

    /// Declare a top-level track. Returns its uuid.
    pub fn root_track(&mut self, name: &str) -> u64 {
        let uuid = self.alloc_uuid();
        let mut desc = TrackDescriptor::default();
        desc.set_uuid(uuid);
        desc.set_name(name.to_string());

        let mut packet = TracePacket::default();
        packet.set_track_descriptor(desc);
        self.push(packet);
        uuid
    }

    /// Declare a track nested under `parent`. Returns its uuid.
    pub fn child_track(&mut self, parent: u64, name: &str) -> u64 {
        let uuid = self.alloc_uuid();
        let mut desc = TrackDescriptor::default();
        desc.set_uuid(uuid);
        desc.set_name(name.to_string());
        desc.set_parent_uuid(parent);

        let mut packet = TracePacket::default();
        packet.set_track_descriptor(desc);
        self.push(packet);
        uuid
    }

    /// Declare a counter track. Returns its uuid.
    pub fn counter_track(&mut self, name: &str, unit: &str) -> u64 {
        let uuid = self.alloc_uuid();
        let mut desc = TrackDescriptor::default();
        desc.set_uuid(uuid);
        desc.set_name(name.to_string());

        let mut counter_desc = CounterDescriptor::default();
        match unit {
            "" | "unspecified" => {}
            "count" => counter_desc.set_unit(Unit::UNIT_COUNT),
            "ns" => counter_desc.set_unit(Unit::UNIT_TIME_NS),
            "bytes" => counter_desc.set_unit(Unit::UNIT_SIZE_BYTES),
            other => counter_desc.set_unit_name(other.to_string()),
        }
        desc.counter = Some(counter_desc).into();

        let mut packet = TracePacket::default();
        packet.set_track_descriptor(desc);
        self.push(packet);
        uuid
    }

    pub fn counter_sample(&mut self, track: u64, ts: u64, value: i64) {
        let mut event = TrackEvent::default();
        event.set_type(Type::TYPE_COUNTER);
        event.set_track_uuid(track);
        event.set_counter_value(value);

        let mut packet = TracePacket::default();
        packet.set_timestamp(ts);
        packet.set_track_event(event);
        packet.set_trusted_packet_sequence_id(self.seq_id);
        self.push(packet);
    }

    pub fn slice_begin(&mut self, track: u64, ts: u64, name: &str, annotations: &[(String, String)]) {
        let mut event = TrackEvent::default();
        event.set_type(Type::TYPE_SLICE_BEGIN);
        event.set_track_uuid(track);
        event.set_name(name.to_string());
        for (key, value) in annotations {
            let mut ann = DebugAnnotation::default();
            ann.set_name(key.clone());
            ann.set_string_value(value.clone());
            event.debug_annotations.push(ann);
        }

        let mut packet = TracePacket::default();
        packet.set_timestamp(ts);
        packet.set_track_event(event);
        packet.set_trusted_packet_sequence_id(self.seq_id);
        self.push(packet);
    }

    pub fn slice_end(&mut self, track: u64, ts: u64) {
        let mut event = TrackEvent::default();
        event.set_type(Type::TYPE_SLICE_END);
        event.set_track_uuid(track);

        let mut packet = TracePacket::default();
        packet.set_timestamp(ts);
        packet.set_track_event(event);
        packet.set_trusted_packet_sequence_id(self.seq_id);
        self.push(packet);
    }

    /// Packets accumulated since the last flush.
    pub fn pending_packets(&self) -> usize {
        self.pending.len()
    }

    /// Packets produced over the sink's lifetime, flushed or not.
    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    /// Hand all accumulated packets to `writer` and reset the accumulation.
    /// Track uuids live on, so later batches keep referring to tracks
    /// declared in earlier ones.
    pub fn flush_into(&mut self, writer: &mut dyn TraceWriter) -> Result<()> {
        for packet in self.pending.drain(..) {
            writer.write_packet(&packet)?;
        }
        Ok(())
    }
}
