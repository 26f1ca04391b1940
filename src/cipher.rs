use thiserror::Error;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("XOR key table must not be empty")]
    EmptyKey,
    #[error("XOR limit must be greater than zero")]
    ZeroLimit,
    #[error("XOR limit {limit} exceeds key table length {len}")]
    LimitOutOfRange { limit: u16, len: usize },
}

/// Process-wide XOR keystream table shared by every client→server decoder.
///
/// The keystream position is held by each flow, not by the table, so the
/// table itself stays immutable and lock-free after startup.
#[derive(Debug)]
pub struct XorTable {
    table: Vec<u8>,
    limit: u16,
}

impl XorTable {
    pub fn new(table: Vec<u8>, limit: u16) -> Result<Self, CipherError> {
        if table.is_empty() {
            return Err(CipherError::EmptyKey);
        }
        if limit == 0 {
            return Err(CipherError::ZeroLimit);
        }
        if limit as usize > table.len() {
            return Err(CipherError::LimitOutOfRange {
                limit,
                len: table.len(),
            });
        }
        Ok(XorTable { table, limit })
    }

    /// Keystream period; positions wrap back to zero at this value.
    pub fn limit(&self) -> u16 {
        self.limit
    }

    /// XOR `data` in place against the keystream starting at `*offset`,
    /// advancing the offset by one per byte. Positions at or past the
    /// period are wrapped before use, so a seed straight off the wire is
    /// always safe to pass.
    pub fn apply(&self, data: &mut [u8], offset: &mut u16) {
        *offset %= self.limit;
        for b in data.iter_mut() {
            *b ^= self.table[*offset as usize];
            *offset = (*offset + 1) % self.limit;
        }
    }
}
