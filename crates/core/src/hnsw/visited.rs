//! Epoch-stamped visited set for HNSW graph traversal.
//!
//! Each slot remembers the epoch in which it was last seen; starting a new
//! traversal bumps the epoch instead of zeroing the array.

#[derive(Debug, Default)]
pub struct VisitedSet {
    marks: Vec<u32>,
    epoch: u32,
}

impl VisitedSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            marks: vec![0; capacity],
            epoch: 1,
        }
    }

    /// Start a new traversal over `len` slots, growing the mark array if needed.
    pub fn reset(&mut self, len: usize) {
        if len > self.marks.len() {
            self.marks.resize(len, 0);
        }
        if self.epoch == u32::MAX {
            self.marks.fill(0);
            self.epoch = 1;
        } else {
            self.epoch += 1;
        }
    }

    /// Returns `true` the first time `slot` is seen in the current epoch.
    #[inline]
    pub fn insert(&mut self, slot: u32) -> bool {
        let mark = &mut self.marks[slot as usize];
        if *mark == self.epoch {
            false
        } else {
            *mark = self.epoch;
            true
        }
    }
}
