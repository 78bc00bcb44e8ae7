use std::collections::HashMap;

/// Bijection between external 64-bit entity ids and dense 0-based indices.
///
/// Indices are allocated by interning in first-appearance order, are
/// contiguous from 0, and are never removed or reused. An `IdIndex` is built
/// single-threaded while a model is assembled and is read-only afterwards,
/// so shared references to it are safe across threads.
#[derive(Clone, Debug, Default)]
pub struct IdIndex {
    index_by_id: HashMap<i64, usize>,
    ids: Vec<i64>,
}

impl IdIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the dense index for `id`, allocating the next sequential
    /// index if the id has not been seen before.
    pub fn intern(&mut self, id: i64) -> usize {
        match self.index_by_id.get(&id) {
            Some(&index) => index,
            None => {
                let index = self.ids.len();
                self.index_by_id.insert(id, index);
                self.ids.push(id);
                index
            }
        }
    }

    /// Looks up the dense index for `id`, if it was interned.
    pub fn index_of(&self, id: i64) -> Option<usize> {
        self.index_by_id.get(&id).copied()
    }

    /// Returns the external id stored at `index`.
    ///
    /// # Panics
    /// Panics if `index >= self.len()`.
    pub fn id_of(&self, index: usize) -> i64 {
        self.ids[index]
    }

    /// Number of interned ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
