use std::hash::Hasher;

use crate::snapshot::WorldSnapshot;

/// A deterministic FNV-1a 64-bit hasher.
///
/// Snapshot digests have to agree across processes, so `DefaultHasher`
/// (randomly seeded) is not usable here.
#[derive(Debug)]
pub struct FnvHasher {
    state: u64,
}

impl FnvHasher {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self {
            state: Self::OFFSET_BASIS,
        }
    }
}

impl Default for FnvHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= byte as u64;
            self.state = self.state.wrapping_mul(Self::PRIME);
        }
    }
}

/// Digest of a snapshot's canonical bincode encoding.
pub fn snapshot_digest(snapshot: &WorldSnapshot) -> bincode::Result<u64> {
    let encoded = bincode::serialize(snapshot)?;
    let mut hasher = FnvHasher::new();
    hasher.write(&encoded);
    Ok(hasher.finish())
}
