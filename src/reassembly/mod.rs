use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use tracing::debug;

use crate::protocol::{NetFlow, ParsedTcp, TransportFlow};

/// One in-order chunk of stream bytes with the capture timestamp of the
/// packet that completed it.
pub struct Reassembly<'a> {
    pub bytes: &'a [u8],
    pub seen: SystemTime,
}

/// Receives the ordered byte stream of one flow direction.
///
/// `reassembled` is called zero or more times with in-order bytes and
/// non-decreasing timestamps, then `reassembly_complete` exactly once.
pub trait Stream: Send {
    fn reassembled(&mut self, batch: &[Reassembly<'_>]);
    fn reassembly_complete(&mut self);
}

/// Creates a [`Stream`] sink when a new flow direction is first seen.
/// Returning `None` drops the flow; its bytes are discarded.
pub trait StreamFactory {
    fn new_stream(&mut self, net: NetFlow, transport: TransportFlow) -> Option<Box<dyn Stream>>;
}

/// Maximum out-of-order segments buffered per flow direction.
const MAX_REORDER_SEGMENTS: usize = 32;
/// Maximum bytes held in one direction's reorder buffer.
const MAX_REORDER_BYTES: usize = 262_144;
/// Maximum tracked flow directions before the least-recently-active is evicted.
const MAX_FLOWS: usize = 10_000;
/// Ticks of inactivity after which a flow is swept.
const STALE_THRESHOLD: u64 = 100_000;

type DirKey = (NetFlow, TransportFlow);

struct FlowState {
    sink: Option<Box<dyn Stream>>,
    /// Next expected sequence number; None until the first segment or SYN.
    next_seq: Option<u32>,
    /// Out-of-order segments keyed by sequence number.
    reorder: BTreeMap<u32, Vec<u8>>,
    reorder_bytes: usize,
    /// Latched once `reassembly_complete` has been delivered.
    complete: bool,
    last_active: u64,
}

impl FlowState {
    fn new(sink: Option<Box<dyn Stream>>, tick: u64) -> Self {
        FlowState {
            sink,
            next_seq: None,
            reorder: BTreeMap::new(),
            reorder_bytes: 0,
            complete: false,
            last_active: tick,
        }
    }

    fn finish(&mut self) {
        if !self.complete {
            self.complete = true;
            self.reorder.clear();
            self.reorder_bytes = 0;
            if let Some(sink) = self.sink.as_mut() {
                sink.reassembly_complete();
            }
        }
    }
}

/// Per-direction TCP reassembler. Tracks sequence numbers, reorders
/// out-of-order segments, dedups retransmits and pushes ordered bytes into
/// the sinks produced by the factory.
pub struct Assembler<F: StreamFactory> {
    factory: F,
    flows: HashMap<DirKey, FlowState>,
    /// Monotonic counter incremented on each process() call.
    tick: u64,
}

impl<F: StreamFactory> Assembler<F> {
    pub fn new(factory: F) -> Self {
        Assembler {
            factory,
            flows: HashMap::new(),
            tick: 0,
        }
    }

    /// Feed one captured TCP packet. Ordered payload bytes are delivered to
    /// the owning sink before any completion triggered by the same packet.
    pub fn process(&mut self, pkt: &ParsedTcp, seen: SystemTime) {
        self.tick += 1;
        if self.tick % 10_000 == 0 {
            self.sweep_stale();
        }

        let key = (pkt.net, pkt.transport);

        // RST tears down both directions of the connection.
        if pkt.rst {
            self.finish_flow(key);
            self.finish_flow((pkt.net.reverse(), pkt.transport.reverse()));
            return;
        }

        if pkt.syn {
            // A fresh SYN on a tuple with stale state ends the old stream
            // before the new one is tracked. SYN and SYN-ACK both pin the
            // initial sequence number; the SYN consumes one sequence slot.
            if !pkt.ack && self.flows.contains_key(&key) {
                self.finish_flow(key);
                self.flows.remove(&key);
            }
            self.evict_if_full();
            let tick = self.tick;
            let state = Self::state_entry(&mut self.factory, &mut self.flows, key, tick);
            state.last_active = tick;
            state.next_seq = Some(pkt.seq.wrapping_add(1));
            return;
        }

        if !self.flows.contains_key(&key) {
            self.evict_if_full();
        }
        let tick = self.tick;
        let state = Self::state_entry(&mut self.factory, &mut self.flows, key, tick);
        state.last_active = tick;
        if state.complete {
            // Trailing data after FIN/RST is ignored.
            return;
        }

        let mut chunks: Vec<Vec<u8>> = Vec::new();
        if !pkt.payload.is_empty() {
            append(state, pkt.seq, &pkt.payload, &mut chunks);
        }
        if !chunks.is_empty() {
            if let Some(sink) = state.sink.as_mut() {
                let batch: Vec<Reassembly<'_>> = chunks
                    .iter()
                    .map(|c| Reassembly { bytes: c, seen })
                    .collect();
                sink.reassembled(&batch);
            }
        }

        // FIN ends this direction's byte stream.
        if pkt.fin {
            state.finish();
        }
    }

    /// Deliver `reassembly_complete` once and drop any pending reorder data.
    fn finish_flow(&mut self, key: DirKey) {
        if let Some(state) = self.flows.get_mut(&key) {
            state.finish();
        }
    }

    fn state_entry<'a>(
        factory: &mut F,
        flows: &'a mut HashMap<DirKey, FlowState>,
        key: DirKey,
        tick: u64,
    ) -> &'a mut FlowState {
        flows
            .entry(key)
            .or_insert_with(|| FlowState::new(factory.new_stream(key.0, key.1), tick))
    }

    /// Remove flows that have been idle for a long time, completing any
    /// that never closed cleanly.
    fn sweep_stale(&mut self) {
        let tick = self.tick;
        self.flows.retain(|_, state| {
            if tick.saturating_sub(state.last_active) < STALE_THRESHOLD {
                true
            } else {
                state.finish();
                false
            }
        });
    }

    /// Evict the least-recently-active flow when at capacity. O(n), but only
    /// runs when the table is full.
    fn evict_if_full(&mut self) {
        if self.flows.len() < MAX_FLOWS {
            return;
        }
        let oldest = self
            .flows
            .iter()
            .min_by_key(|(_, state)| state.last_active)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            self.finish_flow(key);
            self.flows.remove(&key);
        }
    }
}

/// Append new data for one direction, using the reorder buffer for
/// out-of-order segments. In-order chunks are pushed onto `out`.
fn append(state: &mut FlowState, seq: u32, data: &[u8], out: &mut Vec<Vec<u8>>) {
    match state.next_seq {
        None => {
            // Mid-stream join: accept from the first byte seen.
            state.next_seq = Some(seq.wrapping_add(data.len() as u32));
            out.push(data.to_vec());
        }
        Some(expected) => {
            let diff = seq.wrapping_sub(expected) as i32;
            if diff == 0 {
                state.next_seq = Some(seq.wrapping_add(data.len() as u32));
                out.push(data.to_vec());
                flush_reorder(state, out);
            } else if diff > 0 {
                // Gap — buffer for reordering (bounded in count and bytes).
                if state.reorder.len() < MAX_REORDER_SEGMENTS
                    && state.reorder_bytes + data.len() <= MAX_REORDER_BYTES
                {
                    state.reorder_bytes += data.len();
                    state.reorder.insert(seq, data.to_vec());
                } else {
                    debug!("reorder buffer full, dropping segment");
                }
            } else {
                // Overlap or retransmission: keep only the unseen tail.
                let overlap = (-diff) as usize;
                if overlap < data.len() {
                    let fresh = &data[overlap..];
                    state.next_seq = Some(expected.wrapping_add(fresh.len() as u32));
                    out.push(fresh.to_vec());
                    flush_reorder(state, out);
                }
            }
        }
    }
}

/// Drain reorder-buffer segments that are now in order.
fn flush_reorder(state: &mut FlowState, out: &mut Vec<Vec<u8>>) {
    while let Some(expected) = state.next_seq {
        // Exact-match lookup first: BTreeMap ordering breaks at the u32
        // wrap point, but key lookup always works.
        if let Some(seg) = state.reorder.remove(&expected) {
            state.reorder_bytes -= seg.len();
            state.next_seq = Some(expected.wrapping_add(seg.len() as u32));
            out.push(seg);
            continue;
        }

        let Some((&seq, _)) = state.reorder.iter().next() else {
            break;
        };
        let diff = seq.wrapping_sub(expected) as i32;
        if diff > 0 {
            break; // still a gap
        }
        let Some(seg) = state.reorder.remove(&seq) else {
            break;
        };
        state.reorder_bytes -= seg.len();
        let overlap = (-diff) as usize;
        if overlap < seg.len() {
            let fresh = seg[overlap..].to_vec();
            state.next_seq = Some(expected.wrapping_add(fresh.len() as u32));
            out.push(fresh);
        }
        // Full retransmission — discard and keep flushing.
    }
}
