pub mod dump;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use pcap::{Capture, Device};
use tracing::{info, warn};

use crate::codec::CommandTable;
use crate::config::Config;
use crate::flow::{FlowFactory, FlowRegistry, LogHandler, PacketHandler};
use crate::protocol::{self, LinkType};
use crate::reassembly::Assembler;
use dump::FlowDump;

/// Directory handed to collaborators for per-flow artifacts; cleared at boot.
const OUTPUT_DIR: &str = "output";

pub struct PacketData<'a> {
    pub data: &'a [u8],
    pub timestamp: SystemTime,
}

pub enum PacketSource {
    Live(Capture<pcap::Active>, LinkType),
    File(Capture<pcap::Offline>, LinkType),
}

impl PacketSource {
    pub fn link_type(&self) -> LinkType {
        match self {
            PacketSource::Live(_, lt) | PacketSource::File(_, lt) => *lt,
        }
    }

    pub fn live(interface: &str, snaplen: i32, filter: &str) -> Result<Self> {
        let device = Device::list()?
            .into_iter()
            .find(|d| d.name == interface)
            .with_context(|| format!("interface '{interface}' not found"))?;

        let mut cap = Capture::from_device(device)?
            .snaplen(snaplen)
            .promisc(true)
            .timeout(1000)
            .open()
            .context("failed to open capture device")?;

        cap.filter(filter, true)
            .with_context(|| format!("invalid BPF filter: {filter}"))?;

        let lt = protocol::link_type_from_pcap(cap.get_datalink());
        Ok(PacketSource::Live(cap, lt))
    }

    pub fn from_file(path: &Path, filter: &str) -> Result<Self> {
        let mut cap = Capture::from_file(path)
            .with_context(|| format!("failed to open pcap file: {}", path.display()))?;

        cap.filter(filter, true)
            .with_context(|| format!("invalid BPF filter: {filter}"))?;

        let lt = protocol::link_type_from_pcap(cap.get_datalink());
        Ok(PacketSource::File(cap, lt))
    }

    fn next_raw(&mut self) -> Result<pcap::Packet<'_>, pcap::Error> {
        match self {
            PacketSource::Live(cap, _) => cap.next_packet(),
            PacketSource::File(cap, _) => cap.next_packet(),
        }
    }

    /// Iterate over packets, calling `f` for each one. Returns when `f`
    /// yields false, the stop flag is raised, or the source runs dry.
    pub fn for_each_packet<F>(&mut self, stop: &AtomicBool, mut f: F) -> Result<()>
    where
        F: FnMut(PacketData) -> bool,
    {
        while !stop.load(Ordering::Relaxed) {
            let packet = match self.next_raw() {
                Ok(packet) => packet,
                // A read timeout only means no traffic this interval; it
                // doubles as the cadence for re-checking the stop flag.
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            let timestamp = capture_time(
                packet.header.ts.tv_sec as i64,
                packet.header.ts.tv_usec as i64,
            );
            let keep_going = f(PacketData {
                data: packet.data,
                timestamp,
            });
            if !keep_going {
                break;
            }
        }

        Ok(())
    }
}

/// Turn a libpcap timeval into a [`SystemTime`]. Hand-crafted capture files
/// can carry negative or oversized fields, so both are clamped instead of
/// trusted.
fn capture_time(secs: i64, micros: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH
        + Duration::from_secs(secs.max(0) as u64)
        + Duration::from_micros(micros.clamp(0, 999_999) as u64)
}

/// BPF expression restricting capture to the game servers and their ports.
pub fn build_filter(server_ip: &str, start: u16, end: u16) -> String {
    format!(
        "(dst net {server_ip} or src net {server_ip}) and (dst portrange {start}-{end} or src portrange {start}-{end})"
    )
}

/// Open the capture source, wire the decode pipeline and pump packets until
/// the stop flag is raised or the source runs dry. Blocks the caller.
pub fn run_capture(config: &Config, input: Option<&Path>, stop: &AtomicBool) -> Result<()> {
    let services = Arc::new(config.service_registry());
    let cipher = Arc::new(config.xor_table()?);
    let commands = match config.protocol.commands.as_deref() {
        Some(path) => match CommandTable::load(path) {
            Ok(table) => Arc::new(table),
            Err(err) => {
                warn!(%err, "command table unavailable, opcodes will be unlabeled");
                Arc::new(CommandTable::default())
            }
        },
        None => Arc::new(CommandTable::default()),
    };

    let registry = Arc::new(FlowRegistry::new());
    let handler: Arc<dyn PacketHandler> = Arc::new(LogHandler);
    let factory = FlowFactory::new(
        registry.clone(),
        services,
        cipher,
        commands,
        handler,
        config.protocol.log.client,
        config.protocol.log.server,
    );
    let decoder_threads = factory.thread_handles();
    let mut assembler = Assembler::new(factory);

    let filter = build_filter(
        &config.network.server_ip,
        config.network.port_range.start,
        config.network.port_range.end,
    );
    let mut source = match input {
        Some(path) => PacketSource::from_file(path, &filter)?,
        None => PacketSource::live(&config.network.interface, config.network.snaplen, &filter)?,
    };
    let link_type = source.link_type();

    let mut flow_dump = FlowDump::new(
        Path::new(OUTPUT_DIR),
        config.network.snaplen.max(0) as u32,
        link_type.dlt(),
    )?;

    info!(%filter, ?link_type, "capture starting");

    source.for_each_packet(stop, |pkt| {
        let Some(tcp) = protocol::parse_tcp(pkt.data, link_type) else {
            return true;
        };
        if let Err(err) = flow_dump.record(&tcp, pkt.data, pkt.timestamp) {
            warn!(%err, "failed to dump packet");
        }
        assembler.process(&tcp, pkt.timestamp);
        true
    })?;

    info!("capture loop ended, canceling flows");
    registry.cancel_all();
    let handles: Vec<_> = {
        let mut guard = match decoder_threads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.drain(..).collect()
    };
    for handle in handles {
        if handle.join().is_err() {
            warn!("decoder thread panicked");
        }
    }
    info!("capture shut down cleanly");
    Ok(())
}
