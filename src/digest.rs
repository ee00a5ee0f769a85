//! Running checksum over the bytes of one transfer unit.

use std::fmt;

/// BLAKE3 digest accumulated chunk by chunk.
///
/// The receiver computes the same digest over what it received, so any
/// split of the same byte sequence into chunks yields the same value.
#[derive(Clone, Default)]
pub struct ChecksumDigest {
    hasher: blake3::Hasher,
    bytes: u64,
}

impl ChecksumDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes digested so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Lowercase hex of the digest so far (does not consume the state).
    pub fn to_hex(&self) -> String {
        hex::encode(self.hasher.finalize().as_bytes())
    }

    /// Digest of a complete buffer
    pub fn of(data: &[u8]) -> String {
        hex::encode(blake3::hash(data).as_bytes())
    }
}

impl fmt::Debug for ChecksumDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(
            f,
            "ChecksumDigest({}, {} bytes)",
            hex.get(..16).unwrap_or(&hex),
            self.bytes
        )
    }
}
