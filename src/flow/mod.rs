pub mod decoder;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::SystemTime;

use crossbeam_channel::{Sender, bounded};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cipher::XorTable;
use crate::codec::{CommandTable, ShinePacket};
use crate::flow::decoder::FlowDecoder;
use crate::protocol::{FlowKey, NetFlow, TransportFlow};
use crate::reassembly::{Reassembly, Stream, StreamFactory};
use crate::services::ServiceRegistry;

/// Which way the bytes of this flow travel. Server→client when the source
/// port is a known service port, client→server otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ServerToClient,
    ClientToServer,
}

/// Capacity of each decoder's inbound segment queue. A full queue blocks
/// the reassembler, applying backpressure all the way to the capture loop.
const SEGMENT_QUEUE_CAPACITY: usize = 512;

/// One reassembled chunk queued for a decoder.
#[derive(Debug)]
pub struct Segment {
    pub data: Vec<u8>,
    pub seen: SystemTime,
}

/// Downstream consumer of decoded messages. Called synchronously, in wire
/// order, from the decoder's thread; implementations must not assume
/// concurrency.
pub trait PacketHandler: Send + Sync {
    fn handle(&self, flow_name: &str, seen: SystemTime, packet: &ShinePacket);
}

/// Default handler: trace-logs every message and otherwise drops it.
pub struct LogHandler;

impl PacketHandler for LogHandler {
    fn handle(&self, flow_name: &str, _seen: SystemTime, packet: &ShinePacket) {
        debug!(flow = flow_name, "{packet}");
    }
}

/// Registry entry for one live decoder: enough to cancel it and, for
/// client→server flows, to hand it the discovered keystream position.
pub(crate) struct FlowEntry {
    pub(crate) flow_name: String,
    /// Single-slot key channel; present only on client→server flows.
    pub(crate) xor_key: Option<Sender<u16>>,
    pub(crate) cancel: Sender<()>,
}

#[derive(Default)]
struct Maps {
    to_client: HashMap<FlowKey, FlowEntry>,
    from_client: HashMap<FlowKey, FlowEntry>,
}

/// Process-wide table of live decoders, keyed by their source endpoint.
/// One mutex guards both directions; nothing blocking runs under it.
#[derive(Default)]
pub struct FlowRegistry {
    inner: Mutex<Maps>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn maps(&self) -> MutexGuard<'_, Maps> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn insert(&self, direction: Direction, key: FlowKey, entry: FlowEntry) {
        let mut maps = self.maps();
        match direction {
            Direction::ServerToClient => maps.to_client.insert(key, entry),
            Direction::ClientToServer => maps.from_client.insert(key, entry),
        };
    }

    /// Drop a decoder's entry; called by the decoder itself on exit so the
    /// table tracks only live flows.
    pub(crate) fn remove(&self, direction: Direction, key: &FlowKey) {
        let mut maps = self.maps();
        match direction {
            Direction::ServerToClient => maps.to_client.remove(key),
            Direction::ClientToServer => maps.from_client.remove(key),
        };
    }

    /// Deliver the XOR keystream seed to the client→server decoder
    /// registered under `key`. The send is non-blocking: the key channel
    /// holds one slot and only the first delivery matters. Returns false
    /// when no paired decoder is registered.
    pub(crate) fn deliver_xor_seed(&self, key: &FlowKey, seed: u16) -> bool {
        let maps = self.maps();
        match maps.from_client.get(key) {
            Some(entry) => match &entry.xor_key {
                Some(tx) => {
                    let _ = tx.try_send(seed);
                    true
                }
                None => {
                    error!(flow = %entry.flow_name, "paired flow has no key channel");
                    false
                }
            },
            None => false,
        }
    }

    /// Fire every live flow's cancellation. Used at shutdown; the root
    /// capture context owns no flows directly, it walks this table.
    pub fn cancel_all(&self) {
        let maps = self.maps();
        for entry in maps.to_client.values().chain(maps.from_client.values()) {
            let _ = entry.cancel.try_send(());
        }
    }

    pub fn len(&self) -> usize {
        let maps = self.maps();
        maps.to_client.len() + maps.from_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds, registers and spawns a decoder for every new flow direction the
/// reassembler reports.
pub struct FlowFactory {
    registry: Arc<FlowRegistry>,
    services: Arc<ServiceRegistry>,
    cipher: Arc<XorTable>,
    commands: Arc<CommandTable>,
    handler: Arc<dyn PacketHandler>,
    log_client: bool,
    log_server: bool,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FlowFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<FlowRegistry>,
        services: Arc<ServiceRegistry>,
        cipher: Arc<XorTable>,
        commands: Arc<CommandTable>,
        handler: Arc<dyn PacketHandler>,
        log_client: bool,
        log_server: bool,
    ) -> Self {
        FlowFactory {
            registry,
            services,
            cipher,
            commands,
            handler,
            log_client,
            log_server,
            threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle list for the decoder threads spawned so far; the
    /// capture driver joins these after cancelling all flows.
    pub fn thread_handles(&self) -> Arc<Mutex<Vec<JoinHandle<()>>>> {
        self.threads.clone()
    }

    fn classify(&self, transport: TransportFlow) -> Option<(Direction, String)> {
        if ServiceRegistry::is_service_port(transport.src) {
            let name = self.services.name(transport.src)?;
            Some((
                Direction::ServerToClient,
                format!("{}-client", name.to_lowercase()),
            ))
        } else {
            let name = self.services.name(transport.dst)?;
            Some((
                Direction::ClientToServer,
                format!("client-{}", name.to_lowercase()),
            ))
        }
    }
}

impl StreamFactory for FlowFactory {
    fn new_stream(&mut self, net: NetFlow, transport: TransportFlow) -> Option<Box<dyn Stream>> {
        // The BPF filter is built from the same service configuration, so a
        // port without a service entry means filter/config desync; drop the
        // flow rather than take the process down.
        let Some((direction, flow_name)) = self.classify(transport) else {
            error!(%net, %transport, "no service registered for flow, dropping");
            return None;
        };

        let flow_id = Uuid::new_v4();
        let source = FlowKey::source(net, transport);
        let (segment_tx, segment_rx) = bounded(SEGMENT_QUEUE_CAPACITY);
        let (cancel_tx, cancel_rx) = bounded(1);
        let (key_tx, key_rx) = if direction == Direction::ClientToServer {
            let (tx, rx) = bounded(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.registry.insert(
            direction,
            source.clone(),
            FlowEntry {
                flow_name: flow_name.clone(),
                xor_key: key_tx,
                cancel: cancel_tx.clone(),
            },
        );
        info!(flow = %flow_name, id = %flow_id, "new stream from [ {source} ]");

        let decoder = FlowDecoder {
            flow_id,
            flow_name: flow_name.clone(),
            net,
            transport,
            direction,
            buffer: Vec::new(),
            offset: 0,
            xor_offset: None,
            key_found: false,
            last_seen: SystemTime::now(),
            segments: segment_rx,
            xor_key: key_rx,
            cancel: cancel_rx,
            registry: self.registry.clone(),
            cipher: self.cipher.clone(),
            commands: self.commands.clone(),
            handler: self.handler.clone(),
            log_frames: match direction {
                Direction::ServerToClient => self.log_server,
                Direction::ClientToServer => self.log_client,
            },
        };

        let spawned = std::thread::Builder::new()
            .name(format!("decode-{flow_name}"))
            .spawn(move || decoder.run());
        match spawned {
            Ok(handle) => {
                match self.threads.lock() {
                    Ok(mut threads) => threads.push(handle),
                    Err(poisoned) => poisoned.into_inner().push(handle),
                }
                Some(Box::new(DecoderSink {
                    flow_name,
                    segments: segment_tx,
                    cancel: cancel_tx,
                }))
            }
            Err(err) => {
                error!(flow = %flow_name, %err, "failed to spawn decoder thread");
                self.registry.remove(direction, &source);
                None
            }
        }
    }
}

/// The reassembly sink handed back to the assembler: forwards ordered
/// segments to the decoder and fires its cancellation on completion.
struct DecoderSink {
    flow_name: String,
    segments: Sender<Segment>,
    cancel: Sender<()>,
}

impl Stream for DecoderSink {
    fn reassembled(&mut self, batch: &[Reassembly<'_>]) {
        for r in batch {
            if r.bytes.is_empty() {
                continue;
            }
            let segment = Segment {
                data: r.bytes.to_vec(),
                seen: r.seen,
            };
            // Blocking send applies backpressure while the decoder is alive;
            // once it has exited the channel is disconnected and the rest of
            // the batch is dropped.
            if self.segments.send(segment).is_err() {
                debug!(flow = %self.flow_name, "decoder gone, dropping segment");
                return;
            }
        }
    }

    fn reassembly_complete(&mut self) {
        warn!(flow = %self.flow_name, "reassembly complete");
        let _ = self.cancel.try_send(());
    }
}
