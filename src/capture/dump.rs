use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};

use crate::protocol::ParsedTcp;

/// Minimal pcap file writer (classic libpcap format, little-endian).
pub(crate) struct PcapWriter<W: Write> {
    writer: W,
}

impl<W: Write> PcapWriter<W> {
    pub(crate) fn new(mut writer: W, snaplen: u32, link_type: u32) -> Result<Self> {
        writer.write_all(&0xa1b2_c3d4u32.to_le_bytes())?; // magic
        writer.write_all(&2u16.to_le_bytes())?; // version major
        writer.write_all(&4u16.to_le_bytes())?; // version minor
        writer.write_all(&0i32.to_le_bytes())?; // thiszone
        writer.write_all(&0u32.to_le_bytes())?; // sigfigs
        writer.write_all(&snaplen.to_le_bytes())?;
        writer.write_all(&link_type.to_le_bytes())?;
        Ok(PcapWriter { writer })
    }

    pub(crate) fn write_packet(&mut self, data: &[u8], timestamp: SystemTime) -> Result<()> {
        let duration = timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        self.writer
            .write_all(&(duration.as_secs() as u32).to_le_bytes())?;
        self.writer
            .write_all(&duration.subsec_micros().to_le_bytes())?;
        self.writer.write_all(&(data.len() as u32).to_le_bytes())?;
        self.writer.write_all(&(data.len() as u32).to_le_bytes())?;
        self.writer.write_all(data)?;
        Ok(())
    }
}

/// Collects the raw packets of every observed connection into one pcap file
/// per flow under the dump directory. The directory is cleared at boot.
pub struct FlowDump {
    dir: PathBuf,
    snaplen: u32,
    link_type: u32,
    writers: HashMap<String, PcapWriter<BufWriter<File>>>,
}

impl FlowDump {
    pub fn new(dir: &Path, snaplen: u32, link_type: u32) -> Result<Self> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)
                .with_context(|| format!("failed to clear dump directory: {}", dir.display()))?;
        }
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create dump directory: {}", dir.display()))?;
        Ok(FlowDump {
            dir: dir.to_path_buf(),
            snaplen,
            link_type,
            writers: HashMap::new(),
        })
    }

    /// Append one raw packet to its connection's dump file.
    pub fn record(&mut self, pkt: &ParsedTcp, raw: &[u8], timestamp: SystemTime) -> Result<()> {
        let name = flow_file_name(pkt);
        if !self.writers.contains_key(&name) {
            let path = self.dir.join(format!("{name}.pcap"));
            let file = File::create(&path)
                .with_context(|| format!("failed to create dump file: {}", path.display()))?;
            let writer = PcapWriter::new(BufWriter::new(file), self.snaplen, self.link_type)?;
            self.writers.insert(name.clone(), writer);
        }
        // Entry exists now; a miss above inserted it.
        if let Some(writer) = self.writers.get_mut(&name) {
            writer.write_packet(raw, timestamp)?;
        }
        Ok(())
    }
}

/// Both directions of a connection share one file: endpoints are ordered so
/// that (A→B) and (B→A) produce the same name. Colons are not filename-safe
/// on every platform, so endpoints are joined with underscores.
fn flow_file_name(pkt: &ParsedTcp) -> String {
    let a = (pkt.net.src, pkt.transport.src);
    let b = (pkt.net.dst, pkt.transport.dst);
    let ((ip1, port1), (ip2, port2)) = if a <= b { (a, b) } else { (b, a) };
    format!("{ip1}_{port1}-{ip2}_{port2}").replace(':', ".")
}
