//! Fixed-capacity slot table.
//!
//! Both the outbound fragment table and the reassembly table are arenas of
//! indexed slots. A free list makes claiming a slot O(1); when the list is
//! empty the insert fails and hands the record back to the caller, so the
//! caller can release whatever the record owns.

/// Arena of `capacity` slots, each empty or holding one record.
#[derive(Debug)]
pub struct SlotTable<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> SlotTable<T> {
    /// Create a table with `capacity` empty slots.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            free: (0..capacity).rev().collect(),
        }
    }

    /// Store `record` in a free slot and return its index.
    ///
    /// Returns the record back if the table is full.
    pub fn insert(&mut self, record: T) -> Result<usize, T> {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(record);
                Ok(idx)
            }
            None => Err(record),
        }
    }

    /// Clear a slot and return its record.
    pub fn remove(&mut self, idx: usize) -> Option<T> {
        let record = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        Some(record)
    }

    /// Borrow the record in a slot.
    pub fn get(&self, idx: usize) -> Option<&T> {
        self.slots.get(idx)?.as_ref()
    }

    /// Mutably borrow the record in a slot.
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.slots.get_mut(idx)?.as_mut()
    }

    /// Index of the first occupied slot matching `pred`.
    pub fn position<F>(&self, mut pred: F) -> Option<usize>
    where
        F: FnMut(&T) -> bool,
    {
        self.iter().find(|(_, r)| pred(r)).map(|(idx, _)| idx)
    }

    /// Whether any occupied slot matches `pred`.
    pub fn any<F>(&self, pred: F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        self.position(pred).is_some()
    }

    /// Iterate over occupied slots as `(index, record)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|r| (idx, r)))
    }

    /// Mutably iterate over occupied records.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    /// Remove every record matching `pred`, passing each to `release`.
    ///
    /// Returns the number of records removed.
    pub fn remove_where<P, R>(&mut self, mut pred: P, mut release: R) -> usize
    where
        P: FnMut(&T) -> bool,
        R: FnMut(T),
    {
        let mut removed = 0;
        for idx in 0..self.slots.len() {
            if self.slots[idx].as_ref().is_some_and(&mut pred) {
                if let Some(record) = self.remove(idx) {
                    release(record);
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every slot is occupied.
    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_until_full() {
        let mut table = SlotTable::new(2);
        assert_eq!(table.insert('a'), Ok(0));
        assert_eq!(table.insert('b'), Ok(1));
        assert!(table.is_full());
        assert_eq!(table.insert('c'), Err('c'));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_frees_slot() {
        let mut table = SlotTable::new(2);
        let a = table.insert('a').unwrap();
        table.insert('b').unwrap();
        assert_eq!(table.remove(a), Some('a'));
        assert_eq!(table.remove(a), None);
        assert_eq!(table.insert('c'), Ok(a));
    }

    #[test]
    fn test_position_and_any() {
        let mut table = SlotTable::new(4);
        table.insert(10).unwrap();
        let idx = table.insert(20).unwrap();
        assert_eq!(table.position(|v| *v == 20), Some(idx));
        assert!(table.any(|v| *v > 15));
        assert!(!table.any(|v| *v > 25));
    }

    #[test]
    fn test_remove_where() {
        let mut table = SlotTable::new(5);
        for v in [1, 2, 3, 4, 5] {
            table.insert(v).unwrap();
        }
        let mut released = Vec::new();
        let removed = table.remove_where(|v| v % 2 == 1, |v| released.push(v));
        assert_eq!(removed, 3);
        released.sort();
        assert_eq!(released, vec![1, 3, 5]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.free.len(), 3);
    }

    #[test]
    fn test_iter_skips_empty_slots() {
        let mut table = SlotTable::new(3);
        table.insert('x').unwrap();
        let y = table.insert('y').unwrap();
        table.insert('z').unwrap();
        table.remove(y);
        let seen: Vec<char> = table.iter().map(|(_, v)| *v).collect();
        assert_eq!(seen, vec!['x', 'z']);
    }

    #[test]
    fn test_zero_capacity_always_full() {
        let mut table: SlotTable<u8> = SlotTable::new(0);
        assert!(table.is_full());
        assert!(table.is_empty());
        assert_eq!(table.insert(1), Err(1));
    }
}
