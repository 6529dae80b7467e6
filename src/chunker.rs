//! Splits file payloads into fixed-size fragments for the data channel
//! and reassembles incoming fragments, tolerating any arrival order.

/// Default fragment size for file payloads (16 KiB).
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Number of chunks a payload of `len` bytes splits into.
pub fn total_chunks(len: usize, chunk_size: usize) -> u32 {
    ((len + chunk_size - 1) / chunk_size) as u32
}

/// What an inserted chunk did to the transfer.
#[derive(Debug)]
pub enum AssembleStatus {
    /// Still missing chunks; carries the new progress percentage.
    Progress(u8),
    /// Every slot filled; carries the reassembled payload.
    Complete(Vec<u8>),
}

/// Slot-array reassembler for one transfer. Allocated on the first chunk
/// seen for a transfer id, sized to the declared total-chunk count.
#[derive(Debug)]
pub struct ChunkAssembler {
    slots: Vec<Option<Vec<u8>>>,
    filled: u32,
}

impl ChunkAssembler {
    pub fn new(total_chunks: u32) -> Self {
        Self {
            slots: (0..total_chunks).map(|_| None).collect(),
            filled: 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn progress(&self) -> u8 {
        if self.slots.is_empty() {
            return 100;
        }
        (self.filled as f64 / self.slots.len() as f64 * 100.0).round() as u8
    }

    /// Store a chunk at its declared index. Duplicate indices overwrite
    /// without double-counting; out-of-range indices are rejected.
    pub fn insert(&mut self, index: u32, payload: Vec<u8>) -> Result<AssembleStatus, String> {
        let total = self.slots.len();
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or_else(|| format!("chunk index {} out of range (total {})", index, total))?;

        if slot.is_none() {
            self.filled += 1;
        }
        *slot = Some(payload);

        if self.filled as usize == self.slots.len() {
            let mut out = Vec::with_capacity(self.slots.iter().map(|s| s.as_ref().map_or(0, Vec::len)).sum());
            for slot in self.slots.drain(..) {
                out.extend_from_slice(&slot.unwrap_or_default());
            }
            Ok(AssembleStatus::Complete(out))
        } else {
            Ok(AssembleStatus::Progress(self.progress()))
        }
    }
}
