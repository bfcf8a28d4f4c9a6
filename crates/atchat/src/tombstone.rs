//! A list whose entries can be retired while it is being walked.
//!
//! Callbacks dispatched from a list may ask for entries of that same list to
//! be removed. Removal during a dispatch pass only marks the entry; the pass
//! skips marked entries and [`TombstoneList::sweep`] drops them afterwards.

#[derive(Debug)]
struct Slot<T> {
    value: T,
    dead: bool,
}

/// Ordered list supporting deferred removal.
#[derive(Debug)]
pub struct TombstoneList<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Default for TombstoneList<T> {
    fn default() -> Self {
        TombstoneList { slots: Vec::new() }
    }
}

impl<T> TombstoneList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: T) {
        self.slots.push(Slot { value, dead: false });
    }

    /// Number of live entries.
    pub fn live_len(&self) -> usize {
        self.slots.iter().filter(|s| !s.dead).count()
    }

    /// Number of entries, live or dead.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.live_len() == 0
    }

    /// Iterate over live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter(|s| !s.dead).map(|s| &s.value)
    }

    /// Whether any live entry matches `pred`.
    pub fn any_live(&self, mut pred: impl FnMut(&T) -> bool) -> bool {
        self.iter().any(|v| pred(v))
    }

    /// Mark every live entry matching `pred` as dead. Returns how many were
    /// marked.
    pub fn mark_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> usize {
        let mut marked = 0;
        for slot in self.slots.iter_mut().filter(|s| !s.dead) {
            if pred(&slot.value) {
                slot.dead = true;
                marked += 1;
            }
        }
        marked
    }

    /// Remove every entry matching `pred` (live or dead) and return them.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.slots.len());

        for slot in self.slots.drain(..) {
            if pred(&slot.value) {
                removed.push(slot.value);
            } else {
                kept.push(slot);
            }
        }

        self.slots = kept;
        removed
    }

    /// Remove dead entries and hand them back so the caller decides when
    /// they are dropped.
    pub fn sweep(&mut self) -> Vec<T> {
        let mut swept = Vec::new();
        let mut kept = Vec::with_capacity(self.slots.len());

        for slot in self.slots.drain(..) {
            if slot.dead {
                swept.push(slot.value);
            } else {
                kept.push(slot);
            }
        }

        self.slots = kept;
        swept
    }

    /// Remove everything.
    pub fn take_all(&mut self) -> Vec<T> {
        self.slots.drain(..).map(|s| s.value).collect()
    }
}
