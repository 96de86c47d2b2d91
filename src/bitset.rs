//! Word-backed bit set for bounded, dense integer domains.
//! Backs the counting sort: insert reports duplicates, `ones` yields ascending order.

#[derive(Debug, Clone, Default)]
pub struct BitSet {
    words: Vec<u64>,
    capacity: usize,
}

impl BitSet {
    /// Create a set able to hold bits `0..capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
        }
    }

    /// Number of addressable bits.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Set the bit at `index`; returns false when it was already set.
    ///
    /// # Panics
    /// Panics if `index >= capacity`.
    pub fn insert(&mut self, index: usize) -> bool {
        assert!(index < self.capacity, "bit {index} outside capacity {}", self.capacity);
        let (word_idx, bit) = (index / 64, 1u64 << (index % 64));
        let word = &mut self.words[word_idx];
        let fresh = *word & bit == 0;
        *word |= bit;
        fresh
    }

    /// Check if the bit at `index` is set.
    pub fn contains(&self, index: usize) -> bool {
        let (word_idx, bit_idx) = (index / 64, index % 64);
        match self.words.get(word_idx) {
            Some(word) => word & (1 << bit_idx) != 0,
            None => false,
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Reset every bit, keeping the allocation.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Iterator over set bits in ascending order.
    pub fn ones(&self) -> OnesIter<'_> {
        OnesIter {
            bitset: self,
            word_idx: 0,
            current_word: self.words.first().copied().unwrap_or(0),
        }
    }
}

pub struct OnesIter<'a> {
    bitset: &'a BitSet,
    word_idx: usize,
    current_word: u64,
}

impl<'a> Iterator for OnesIter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current_word != 0 {
                let trailing = self.current_word.trailing_zeros();
                self.current_word &= self.current_word - 1;
                return Some(self.word_idx * 64 + trailing as usize);
            }

            self.word_idx += 1;
            if self.word_idx >= self.bitset.words.len() {
                return None;
            }
            self.current_word = self.bitset.words[self.word_idx];
        }
    }
}
