//! Presence set over chunk indices `0..count`.
//!
//! Owned by a single session actor and never shared, so it carries no
//! synchronisation of its own.

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Clone, Debug)]
pub struct ChunkBitmap {
    words: Vec<u64>,
    count: usize,
}

impl ChunkBitmap {
    /// Allocate a bitmap addressing exactly `count` chunks.
    pub fn new(count: usize) -> Self {
        Self {
            words: vec![0; count.div_ceil(WORD_BITS)],
            count,
        }
    }

    /// Mark chunk `index` as present. Callers validate the index.
    pub fn mark(&mut self, index: usize) {
        debug_assert!(index < self.count, "chunk index {index} out of range");
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
    }

    pub fn has(&self, index: usize) -> bool {
        debug_assert!(index < self.count, "chunk index {index} out of range");
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// True iff every index in `0..len()` is marked.
    pub fn is_complete(&self) -> bool {
        let full_words = self.count / WORD_BITS;
        if self.words[..full_words].iter().any(|&w| w != u64::MAX) {
            return false;
        }

        let tail_bits = self.count % WORD_BITS;
        if tail_bits == 0 {
            return true;
        }
        let mask = (1u64 << tail_bits) - 1;
        self.words[full_words] & mask == mask
    }

    /// Marked indices in ascending order.
    pub fn to_indices(&self) -> Vec<u32> {
        let mut indices = Vec::new();
        for (word_idx, &word) in self.words.iter().enumerate() {
            let mut bits = word;
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                indices.push((word_idx * WORD_BITS + bit) as u32);
                bits &= bits - 1;
            }
        }
        indices
    }
}
