use std::sync::Arc;
use std::time::SystemTime;

use crossbeam_channel::{Receiver, never, select};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::cipher::XorTable;
use crate::codec::{self, CommandTable};
use crate::flow::{Direction, FlowRegistry, PacketHandler, Segment};
use crate::protocol::{FlowKey, NetFlow, TransportFlow};

/// Operation code of the server→client message announcing the XOR
/// keystream position for the paired client→server flow.
const XOR_SEED_OPCODE: u16 = 2055;

/// Consumed bytes are compacted away once the frame offset passes this mark.
const COMPACT_THRESHOLD: usize = 16 * 1024;

/// Per-direction message decoder. Owns its buffer and frame offset
/// exclusively; fed by the reassembly sink through the segment queue and
/// torn down through the cancel channel.
pub(crate) struct FlowDecoder {
    pub(crate) flow_id: Uuid,
    pub(crate) flow_name: String,
    pub(crate) net: NetFlow,
    pub(crate) transport: TransportFlow,
    pub(crate) direction: Direction,
    /// Reassembled bytes not yet consumed by framing.
    pub(crate) buffer: Vec<u8>,
    /// Index of the next unframed byte; never moves backwards.
    pub(crate) offset: usize,
    /// Client→server keystream position. None until the paired
    /// server→client decoder has delivered the seed; no byte is consumed
    /// before then.
    pub(crate) xor_offset: Option<u16>,
    /// Server→client: latched once the seed-carrying message was handled.
    pub(crate) key_found: bool,
    pub(crate) last_seen: SystemTime,
    pub(crate) segments: Receiver<Segment>,
    pub(crate) xor_key: Option<Receiver<u16>>,
    pub(crate) cancel: Receiver<()>,
    pub(crate) registry: Arc<FlowRegistry>,
    pub(crate) cipher: Arc<XorTable>,
    pub(crate) commands: Arc<CommandTable>,
    pub(crate) handler: Arc<dyn PacketHandler>,
    pub(crate) log_frames: bool,
}

enum Event {
    Cancel,
    Key(u16),
    Segment(Segment),
    Closed,
}

impl FlowDecoder {
    pub(crate) fn run(mut self) {
        let cancel = self.cancel.clone();
        let segments = self.segments.clone();
        // Server→client decoders select on a channel that never fires.
        let key_rx = match &self.xor_key {
            Some(rx) => rx.clone(),
            None => never(),
        };

        loop {
            let event = select! {
                recv(cancel) -> _ => Event::Cancel,
                recv(key_rx) -> seed => match seed {
                    Ok(seed) => Event::Key(seed),
                    // The sender lives in our own registry entry; losing it
                    // means the flow is being torn down.
                    Err(_) => Event::Cancel,
                },
                recv(segments) -> segment => match segment {
                    Ok(segment) => Event::Segment(segment),
                    Err(_) => Event::Closed,
                },
            };

            match event {
                Event::Cancel => {
                    warn!(flow = %self.flow_name, id = %self.flow_id, "decoder canceled");
                    break;
                }
                Event::Closed => {
                    debug!(flow = %self.flow_name, "segment source closed");
                    break;
                }
                Event::Key(seed) => {
                    info!(flow = %self.flow_name, seed, "xor keystream position received");
                    self.xor_offset = Some(seed);
                    // Bytes buffered while the key was unknown decode now.
                    self.drain();
                }
                Event::Segment(segment) => {
                    self.buffer.extend_from_slice(&segment.data);
                    self.last_seen = segment.seen;
                    self.drain();
                }
            }
        }

        self.registry
            .remove(self.direction, &FlowKey::source(self.net, self.transport));
    }

    /// Frame and dispatch every complete message currently in the buffer.
    fn drain(&mut self) {
        loop {
            if self.offset > self.buffer.len() {
                warn!(flow = %self.flow_name, offset = self.offset, "not enough data");
                break;
            }
            if self.offset == self.buffer.len() {
                break;
            }
            if self.direction == Direction::ClientToServer && self.xor_offset.is_none() {
                // Accumulate until the paired server flow announces the seed.
                trace!(flow = %self.flow_name, buffered = self.buffer.len(), "waiting for xor key");
                break;
            }

            let Some((length, class)) = codec::packet_boundary(self.offset, &self.buffer) else {
                debug!(flow = %self.flow_name, "not enough data for frame header");
                break;
            };
            let header = class.header_size();
            let next_offset = self.offset + header + length;
            if next_offset > self.buffer.len() {
                debug!(flow = %self.flow_name, next_offset, "not enough data");
                break;
            }
            if length == 0 {
                warn!(flow = %self.flow_name, "zero-length frame, skipping header");
                self.offset += header;
                continue;
            }

            let mut rs = self.buffer[self.offset + header..next_offset].to_vec();
            if self.direction == Direction::ClientToServer {
                if let Some(mut position) = self.xor_offset {
                    // Each byte is XORed exactly once; a partial message is
                    // never touched because only complete frames reach here.
                    self.cipher.apply(&mut rs, &mut position);
                    self.xor_offset = Some(position);
                }
            }

            match codec::decode_packet(class, length, &rs) {
                Ok(packet) => {
                    if self.direction == Direction::ServerToClient
                        && !self.key_found
                        && packet.operation_code == XOR_SEED_OPCODE
                    {
                        self.key_found = true;
                        self.deliver_seed(&packet.data);
                    }
                    if self.log_frames {
                        info!(flow = %self.flow_name, seen = ?self.last_seen, "{}", self.commands.describe(&packet));
                    }
                    self.handler.handle(&self.flow_name, self.last_seen, &packet);
                }
                // A bad message costs only itself; the offset still advances
                // past it so the stream stays framed.
                Err(err) => error!(flow = %self.flow_name, %err, "decode failed"),
            }

            self.offset = next_offset;
        }
        self.compact();
    }

    /// Hand the keystream seed to the paired client→server decoder. The
    /// destination endpoint of this flow is the paired flow's source
    /// endpoint, which is its registry key.
    fn deliver_seed(&self, data: &[u8]) {
        if data.len() < 2 {
            error!(flow = %self.flow_name, "seed announcement too short");
            return;
        }
        let seed = u16::from_le_bytes([data[0], data[1]]);
        let pair = FlowKey::destination(self.net, self.transport);
        if self.registry.deliver_xor_seed(&pair, seed) {
            warn!(flow = %self.flow_name, seed, client = %pair, "xor keystream position found for client");
        } else {
            error!(flow = %self.flow_name, client = %pair, "no paired client flow for xor seed");
        }
    }

    /// Reclaim consumed bytes, rebasing the offset.
    fn compact(&mut self) {
        if self.offset == self.buffer.len() {
            self.buffer.clear();
            self.offset = 0;
        } else if self.offset >= COMPACT_THRESHOLD {
            self.buffer.drain(..self.offset);
            self.offset = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowEntry;
    use crate::codec::ShinePacket;
    use crossbeam_channel::{Sender, bounded, unbounded};
    use std::net::{IpAddr, Ipv4Addr};

    struct ChannelHandler(Sender<ShinePacket>);

    impl PacketHandler for ChannelHandler {
        fn handle(&self, _flow_name: &str, _seen: SystemTime, packet: &ShinePacket) {
            let _ = self.0.send(packet.clone());
        }
    }

    struct TestChans {
        handled: crossbeam_channel::Receiver<ShinePacket>,
        segment_tx: Sender<Segment>,
        cancel_tx: Sender<()>,
        key_tx: Option<Sender<u16>>,
    }

    fn harness(direction: Direction, cipher: XorTable) -> (FlowDecoder, TestChans) {
        let (segment_tx, segment_rx) = bounded(512);
        let (cancel_tx, cancel_rx) = bounded(1);
        let (handled_tx, handled) = unbounded();
        let (key_tx, key_rx) = if direction == Direction::ClientToServer {
            let (tx, rx) = bounded(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let net = NetFlow {
            src: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            dst: IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)),
        };
        let transport = match direction {
            Direction::ServerToClient => TransportFlow {
                src: 9000,
                dst: 54321,
            },
            Direction::ClientToServer => TransportFlow {
                src: 54321,
                dst: 9000,
            },
        };
        let decoder = FlowDecoder {
            flow_id: Uuid::new_v4(),
            flow_name: "test-flow".to_string(),
            net,
            transport,
            direction,
            buffer: Vec::new(),
            offset: 0,
            xor_offset: None,
            key_found: false,
            last_seen: SystemTime::UNIX_EPOCH,
            segments: segment_rx,
            xor_key: key_rx,
            cancel: cancel_rx,
            registry: Arc::new(FlowRegistry::new()),
            cipher: Arc::new(cipher),
            commands: Arc::new(CommandTable::default()),
            handler: Arc::new(ChannelHandler(handled_tx)),
            log_frames: false,
        };
        (
            decoder,
            TestChans {
                handled,
                segment_tx,
                cancel_tx,
                key_tx,
            },
        )
    }

    fn zero_cipher() -> XorTable {
        XorTable::new(vec![0u8; 16], 16).unwrap()
    }

    fn segment(bytes: &[u8]) -> Segment {
        Segment {
            data: bytes.to_vec(),
            seen: SystemTime::UNIX_EPOCH,
        }
    }

    fn feed(decoder: &mut FlowDecoder, bytes: &[u8]) {
        decoder.buffer.extend_from_slice(bytes);
        decoder.drain();
    }

    #[test]
    fn small_frame_single_segment() {
        let (mut decoder, chans) = harness(Direction::ServerToClient, zero_cipher());
        feed(&mut decoder, &[0x05, 0x07, 0xE7, 0x01, 0x02, 0x03, 0x04, 0x05]);
        let pkt = chans.handled.try_recv().unwrap();
        assert_eq!(pkt.operation_code, 0xE707);
        assert_eq!(pkt.data, vec![0x01, 0x02, 0x03]);
        // Only one complete message; two bytes remain unframed.
        assert!(chans.handled.try_recv().is_err());
        assert_eq!(decoder.offset, 6);
    }

    #[test]
    fn frame_split_across_segments() {
        let (mut decoder, chans) = harness(Direction::ServerToClient, zero_cipher());
        feed(&mut decoder, &[0x05, 0x07]);
        assert!(chans.handled.try_recv().is_err());
        feed(&mut decoder, &[0xE7, 0x01, 0x02, 0x03, 0x04, 0x05]);
        let pkt = chans.handled.try_recv().unwrap();
        assert_eq!(pkt.operation_code, 0xE707);
        assert_eq!(decoder.offset, 6);
    }

    #[test]
    fn large_frame_consumes_three_byte_header() {
        let (mut decoder, chans) = harness(Direction::ServerToClient, zero_cipher());
        // length 300 == 0x012C LE; payload = opcode + 298 data bytes
        let mut bytes = vec![0x00, 0x2C, 0x01, 0x07, 0xE7];
        bytes.extend(std::iter::repeat_n(0xAB, 298));
        feed(&mut decoder, &bytes);
        let pkt = chans.handled.try_recv().unwrap();
        assert_eq!(pkt.operation_code, 0xE707);
        assert_eq!(pkt.data.len(), 298);
        assert_eq!(decoder.offset, 0); // fully consumed, compacted
        assert!(decoder.buffer.is_empty());
    }

    #[test]
    fn incomplete_large_header_waits() {
        let (mut decoder, chans) = harness(Direction::ServerToClient, zero_cipher());
        feed(&mut decoder, &[0x00, 0x2C]);
        assert!(chans.handled.try_recv().is_err());
        assert_eq!(decoder.offset, 0);
    }

    #[test]
    fn multiple_messages_in_one_segment_all_dispatch() {
        let (mut decoder, chans) = harness(Direction::ServerToClient, zero_cipher());
        feed(
            &mut decoder,
            &[0x02, 0x01, 0x10, 0x03, 0x02, 0x10, 0xFF, 0x02, 0x03, 0x10],
        );
        let ops: Vec<u16> = std::iter::from_fn(|| chans.handled.try_recv().ok())
            .map(|p| p.operation_code)
            .collect();
        assert_eq!(ops, vec![0x1001, 0x1002, 0x1003]);
    }

    #[test]
    fn zero_length_frame_advances_header_only() {
        let (mut decoder, chans) = harness(Direction::ServerToClient, zero_cipher());
        // 0x00 0x00 0x00 is a large frame of length 0, then a valid message
        feed(&mut decoder, &[0x00, 0x00, 0x00, 0x02, 0x01, 0x10]);
        let pkt = chans.handled.try_recv().unwrap();
        assert_eq!(pkt.operation_code, 0x1001);
    }

    #[test]
    fn decode_failure_still_advances_offset() {
        let (mut decoder, chans) = harness(Direction::ServerToClient, zero_cipher());
        // One-byte message cannot carry an opcode, then a valid message.
        feed(&mut decoder, &[0x01, 0xFF, 0x02, 0x01, 0x10]);
        let pkt = chans.handled.try_recv().unwrap();
        assert_eq!(pkt.operation_code, 0x1001);
        assert!(chans.handled.try_recv().is_err());
    }

    #[test]
    fn client_bytes_wait_for_key_then_decrypt() {
        let table: Vec<u8> = (0u8..=255).collect();
        let cipher = XorTable::new(table.clone(), 256).unwrap();
        let (mut decoder, chans) = harness(Direction::ClientToServer, cipher);

        // Plaintext message: op 0x1001, data [0xAA, 0xBB]
        let plain = [0x01, 0x10, 0xAA, 0xBB];
        let seed: u16 = 0x34;
        let mut body = plain.to_vec();
        let enc_cipher = XorTable::new(table, 256).unwrap();
        let mut position = seed;
        enc_cipher.apply(&mut body, &mut position);
        let mut wire = vec![0x04];
        wire.extend_from_slice(&body);

        feed(&mut decoder, &wire);
        // No dispatch before the key arrives; bytes accumulate unconsumed.
        assert!(chans.handled.try_recv().is_err());
        assert_eq!(decoder.offset, 0);
        assert_eq!(decoder.buffer.len(), wire.len());

        decoder.xor_offset = Some(seed);
        decoder.drain();
        let pkt = chans.handled.try_recv().unwrap();
        assert_eq!(pkt.operation_code, 0x1001);
        assert_eq!(pkt.data, vec![0xAA, 0xBB]);
        // Keystream advanced by exactly the decrypted byte count.
        assert_eq!(decoder.xor_offset, Some(seed + plain.len() as u16));
    }

    #[test]
    fn server_seed_message_sets_key_found_and_dispatches() {
        let (mut decoder, chans) = harness(Direction::ServerToClient, zero_cipher());
        // op 2055 == 0x0807 LE; data = seed 0x1234 LE
        feed(&mut decoder, &[0x04, 0x07, 0x08, 0x34, 0x12]);
        assert!(decoder.key_found);
        // The seed message itself is still dispatched downstream.
        let pkt = chans.handled.try_recv().unwrap();
        assert_eq!(pkt.operation_code, 2055);
    }

    #[test]
    fn seed_is_delivered_to_paired_flow_once() {
        let (mut decoder, chans) = harness(Direction::ServerToClient, zero_cipher());
        let (key_tx, key_rx) = bounded(1);
        // Register a fake client decoder under this flow's destination.
        decoder.registry.insert(
            Direction::ClientToServer,
            FlowKey {
                ip: IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)),
                port: 54321,
            },
            FlowEntry {
                flow_name: "client-account".to_string(),
                xor_key: Some(key_tx),
                cancel: bounded(1).0,
            },
        );

        feed(&mut decoder, &[0x04, 0x07, 0x08, 0x34, 0x12]);
        assert_eq!(key_rx.try_recv(), Ok(0x1234));

        // A later 2055 is an ordinary message: dispatched, not delivered.
        feed(&mut decoder, &[0x04, 0x07, 0x08, 0xEE, 0xFF]);
        assert!(key_rx.try_recv().is_err());
        let ops: Vec<u16> = std::iter::from_fn(|| chans.handled.try_recv().ok())
            .map(|p| p.operation_code)
            .collect();
        assert_eq!(ops, vec![2055, 2055]);
    }

    #[test]
    fn missing_pair_latches_key_found_and_drops_seed() {
        let (mut decoder, _chans) = harness(Direction::ServerToClient, zero_cipher());
        feed(&mut decoder, &[0x04, 0x07, 0x08, 0x34, 0x12]);
        assert!(decoder.key_found);
        assert!(decoder.registry.is_empty());
    }

    #[test]
    fn cancellation_terminates_without_draining() {
        let (decoder, chans) = harness(Direction::ServerToClient, zero_cipher());
        let registry = decoder.registry.clone();
        registry.insert(
            Direction::ServerToClient,
            FlowKey::source(decoder.net, decoder.transport),
            FlowEntry {
                flow_name: "test-flow".to_string(),
                xor_key: None,
                cancel: chans.cancel_tx.clone(),
            },
        );
        // Incomplete message: 10 bytes buffered, frame needs 12.
        chans
            .segment_tx
            .send(segment(&[
                0x0B, 0x07, 0xE7, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
            ]))
            .unwrap();
        chans.cancel_tx.send(()).unwrap();

        let thread = std::thread::spawn(move || decoder.run());
        thread.join().unwrap();
        // No dispatch, no error, and the decoder removed itself.
        assert!(chans.handled.try_recv().is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn key_event_drains_buffered_client_bytes() {
        let table = vec![0u8; 512];
        let (decoder, mut chans) =
            harness(Direction::ClientToServer, XorTable::new(table, 500).unwrap());
        let key_tx = chans.key_tx.take().unwrap();
        chans.segment_tx.send(segment(&[0x02, 0x01, 0x10])).unwrap();
        key_tx.send(0x0010).unwrap();

        let thread = std::thread::spawn(move || decoder.run());
        let pkt = chans
            .handled
            .recv_timeout(std::time::Duration::from_secs(2))
            .unwrap();
        assert_eq!(pkt.operation_code, 0x1001);
        chans.cancel_tx.send(()).unwrap();
        thread.join().unwrap();
    }
}
