use super::MemoryEntry;
use std::collections::VecDeque;

/// Bounded in-memory tier. At capacity the lowest-priority entry among the
/// oldest quarter is evicted, oldest first on ties.
pub struct ShortTermBuffer {
    capacity: usize,
    entries: VecDeque<MemoryEntry>,
}

impl ShortTermBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Append, returning the evicted entry if the buffer was full
    pub fn push(&mut self, entry: MemoryEntry) -> Option<MemoryEntry> {
        let evicted = if self.entries.len() >= self.capacity {
            let index = self.eviction_index();
            self.entries.remove(index)
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    fn eviction_index(&self) -> usize {
        let window = ((self.entries.len() + 3) / 4).max(1);
        let mut chosen = 0;
        for (i, entry) in self.entries.iter().take(window).enumerate() {
            if entry.priority < self.entries[chosen].priority {
                chosen = i;
            }
        }
        chosen
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
