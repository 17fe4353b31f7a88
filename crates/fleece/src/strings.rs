//! Open-addressed intern table mapping string payload bytes to their
//! output offsets.
//!
//! Key bytes are copied out of the stream, so the table stays valid while
//! the output buffer grows. `find` probes once and hands back a slot that
//! `add_at` can fill without re-hashing.

use crate::xxh32::xxh32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StringInfo {
    /// Absolute position of the encoded string value.
    pub offset: u32,
    /// Whether the string has been written as a dictionary key.
    pub used_as_key: bool,
}

#[derive(Debug)]
struct Entry {
    key: Box<[u8]>,
    info: StringInfo,
}

/// Result of a single probe: either the matching slot or the slot an
/// insertion should land in.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Probe {
    Found(usize),
    Vacant(usize),
}

#[derive(Debug)]
pub(crate) struct StringTable {
    slots: Vec<Option<Entry>>,
    count: usize,
}

impl StringTable {
    /// A table ready to hold about `n` entries before growing.
    pub fn with_capacity(n: usize) -> Self {
        let slots = (n * 3 / 2).next_power_of_two().max(8);
        StringTable {
            slots: (0..slots).map(|_| None).collect(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Linear-probe for `key`. The returned slot is valid until the next
    /// insertion.
    pub fn find(&self, key: &[u8]) -> Probe {
        let mut i = xxh32(key, 0) as usize & self.mask();
        loop {
            match &self.slots[i] {
                Some(entry) if &*entry.key == key => return Probe::Found(i),
                Some(_) => i = (i + 1) & self.mask(),
                None => return Probe::Vacant(i),
            }
        }
    }

    /// Insert into a slot returned by [`find`](Self::find), copying the key
    /// bytes. Growing happens after the insert, so the slot index from the
    /// preceding probe stays usable.
    pub fn add_at(&mut self, slot: usize, key: &[u8], info: StringInfo) {
        debug_assert!(self.slots[slot].is_none());
        self.slots[slot] = Some(Entry {
            key: key.into(),
            info,
        });
        self.count += 1;
        if self.count * 3 >= self.slots.len() * 2 {
            self.grow();
        }
    }

    /// The info stored at a found slot.
    pub fn info(&self, slot: usize) -> StringInfo {
        self.slots[slot].as_ref().expect("occupied slot").info
    }

    /// Record that the string at `slot` has served as a dictionary key.
    pub fn mark_key(&mut self, slot: usize) {
        if let Some(entry) = self.slots[slot].as_mut() {
            entry.info.used_as_key = true;
        }
    }

    /// All occupied entries, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], StringInfo)> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|e| (&*e.key, e.info)))
    }

    /// Every slot in order, occupied or not. The layout is what
    /// hash-probing readers of a key table expect to see.
    pub fn raw_slots(&self) -> impl Iterator<Item = Option<(&[u8], StringInfo)>> {
        self.slots
            .iter()
            .map(|s| s.as_ref().map(|e| (&*e.key, e.info)))
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.count = 0;
    }

    fn grow(&mut self) {
        let doubled = self.slots.len() * 2;
        let old = std::mem::replace(
            &mut self.slots,
            (0..doubled).map(|_| None).collect(),
        );
        for entry in old.into_iter().flatten() {
            let mut i = xxh32(&entry.key, 0) as usize & self.mask();
            while self.slots[i].is_some() {
                i = (i + 1) & self.mask();
            }
            self.slots[i] = Some(entry);
        }
    }
}
