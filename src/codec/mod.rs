use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

/// Header width class of one wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Large,
}

impl SizeClass {
    /// Bytes consumed by the length header for this class.
    pub fn header_size(self) -> usize {
        match self {
            SizeClass::Small => 1,
            SizeClass::Large => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is {got} bytes but the frame announced {expected}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("small frame cannot carry {0} bytes")]
    OversizedSmall(usize),
    #[error("message too short for an operation code ({0} bytes)")]
    TooShort(usize),
}

/// Locate the boundary of the next message starting at `offset`.
///
/// A non-zero lead byte is a small message and is itself the payload length.
/// A zero lead byte announces a large message whose payload length follows
/// as a little-endian u16. Returns `None` when the header itself is not
/// fully buffered yet; the caller treats that as "not enough data".
pub fn packet_boundary(offset: usize, buf: &[u8]) -> Option<(usize, SizeClass)> {
    let first = *buf.get(offset)?;
    if first != 0 {
        return Some((first as usize, SizeClass::Small));
    }
    let lo = *buf.get(offset + 1)?;
    let hi = *buf.get(offset + 2)?;
    Some((u16::from_le_bytes([lo, hi]) as usize, SizeClass::Large))
}

/// One decoded application message: a little-endian operation code followed
/// by the raw command data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShinePacket {
    pub operation_code: u16,
    pub data: Vec<u8>,
}

impl fmt::Display for ShinePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "op {:#06x} ({} data bytes)",
            self.operation_code,
            self.data.len()
        )
    }
}

/// Decode one framed payload into a [`ShinePacket`].
pub fn decode_packet(
    class: SizeClass,
    length: usize,
    payload: &[u8],
) -> Result<ShinePacket, CodecError> {
    if class == SizeClass::Small && length > u8::MAX as usize {
        return Err(CodecError::OversizedSmall(length));
    }
    if payload.len() != length {
        return Err(CodecError::LengthMismatch {
            expected: length,
            got: payload.len(),
        });
    }
    if payload.len() < 2 {
        return Err(CodecError::TooShort(payload.len()));
    }
    let operation_code = u16::from_le_bytes([payload[0], payload[1]]);
    Ok(ShinePacket {
        operation_code,
        data: payload[2..].to_vec(),
    })
}

/// Operation-code → command-name table loaded from the message schema file.
/// Purely cosmetic: used to label decoded messages in the logs.
#[derive(Debug, Default)]
pub struct CommandTable {
    names: HashMap<u16, String>,
}

#[derive(Debug, Deserialize)]
struct CommandFile {
    #[serde(default)]
    commands: HashMap<String, String>,
}

impl CommandTable {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read command table: {}", path.display()))?;
        let file: CommandFile = toml::from_str(&content)
            .with_context(|| format!("failed to parse command table: {}", path.display()))?;
        let mut names = HashMap::with_capacity(file.commands.len());
        for (code, name) in file.commands {
            let code: u16 = code
                .parse()
                .with_context(|| format!("invalid operation code in command table: {code:?}"))?;
            names.insert(code, name);
        }
        Ok(CommandTable { names })
    }

    pub fn name(&self, operation_code: u16) -> Option<&str> {
        self.names.get(&operation_code).map(String::as_str)
    }

    /// Human-readable one-liner for a decoded message.
    pub fn describe(&self, packet: &ShinePacket) -> String {
        match self.name(packet.operation_code) {
            Some(name) => format!("{name} {packet}"),
            None => packet.to_string(),
        }
    }
}
