//! A growable arena addressed by stable `u32` indices.
//!
//! Block and page nodes live in these arenas and refer to their list
//! neighbors by index instead of by pointer. An index stays valid until
//! its node is removed, so live allocation handles can carry indices
//! across arbitrary intervening operations.

pub(crate) type SlotIndex = u32;

#[derive(Debug)]
pub(crate) struct Slab<T> {
    entries: Vec<Option<T>>,
    vacant: Vec<SlotIndex>,
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            vacant: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> SlotIndex {
        match self.vacant.pop() {
            Some(index) => {
                self.entries[index as usize] = Some(value);
                index
            }
            None => {
                self.entries.push(Some(value));
                (self.entries.len() - 1) as SlotIndex
            }
        }
    }

    pub fn remove(&mut self, index: SlotIndex) -> T {
        let value = self.entries[index as usize]
            .take()
            .expect("removed an already-vacant arena slot");
        self.vacant.push(index);
        value
    }

    pub fn get(&self, index: SlotIndex) -> &T {
        self.entries[index as usize]
            .as_ref()
            .expect("read a vacant arena slot")
    }

    pub fn get_mut(&mut self, index: SlotIndex) -> &mut T {
        self.entries[index as usize]
            .as_mut()
            .expect("read a vacant arena slot")
    }

    pub fn occupied(&self) -> usize {
        self.entries.len() - self.vacant.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotIndex, &T)> {
        self.entries.iter().enumerate().filter_map(|(index, entry)| {
            entry.as_ref().map(|value| (index as SlotIndex, value))
        })
    }
}
