//! Generation-checked storage for in-flight messages with deferred deletion.

/// Stable reference to a slab entry.
///
/// A handle outlives its entry safely: once the slot is reused the
/// generation no longer matches and lookups return `None`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MessageHandle {
    index: u32,
    generation: u32,
}

impl MessageHandle {
    /// Slot index, useful in logs.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied {
        generation: u32,
        value: T,
        deleted: bool,
    },
    Vacant {
        generation: u32,
        next_free: Option<u32>,
    },
}

#[derive(Debug)]
pub(crate) struct Slab<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    live: usize,
    deferred: Vec<MessageHandle>,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            live: 0,
            deferred: Vec::new(),
        }
    }
}

impl<T> Slab<T> {
    pub(crate) fn insert(&mut self, value: T) -> MessageHandle {
        self.live += 1;
        if let Some(index) = self.free_head
            && let Some(&Slot::Vacant {
                generation,
                next_free,
            }) = self.slots.get(index as usize)
        {
            let generation = generation.wrapping_add(1);
            self.slots[index as usize] = Slot::Occupied {
                generation,
                value,
                deleted: false,
            };
            self.free_head = next_free;
            return MessageHandle { index, generation };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
            deleted: false,
        });
        MessageHandle {
            index,
            generation: 0,
        }
    }

    /// Returns the entry unless it was deleted.
    pub(crate) fn get(&self, handle: MessageHandle) -> Option<&T> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied {
                generation,
                value,
                deleted: false,
            } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    /// Returns the entry unless it was deleted.
    pub(crate) fn get_mut(&mut self, handle: MessageHandle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied {
                generation,
                value,
                deleted: false,
            } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, handle: MessageHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Marks the entry for removal at the next [`Slab::drain_deleted`].
    ///
    /// Returns `false` when the entry is already marked or gone, which makes
    /// repeated resets harmless.
    pub(crate) fn mark_deleted(&mut self, handle: MessageHandle) -> bool {
        match self.slots.get_mut(handle.index as usize) {
            Some(Slot::Occupied {
                generation,
                deleted,
                ..
            }) if *generation == handle.generation && !*deleted => {
                *deleted = true;
                self.deferred.push(handle);
                true
            }
            _ => false,
        }
    }

    /// Frees every marked entry and returns the values.
    pub(crate) fn drain_deleted(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.deferred.len());
        for handle in std::mem::take(&mut self.deferred) {
            let index = handle.index as usize;
            let vacant = Slot::Vacant {
                generation: handle.generation,
                next_free: self.free_head,
            };
            let Some(slot) = self.slots.get_mut(index) else {
                continue;
            };
            if let Slot::Occupied { value, .. } = std::mem::replace(slot, vacant) {
                drained.push(value);
                self.free_head = Some(handle.index);
                self.live -= 1;
            }
        }
        drained
    }

    /// Handles of entries that are not marked deleted, oldest slot first.
    pub(crate) fn handles(&self) -> Vec<MessageHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied {
                    generation,
                    deleted: false,
                    ..
                } => Some(MessageHandle {
                    index: index as u32,
                    generation: *generation,
                }),
                _ => None,
            })
            .collect()
    }

    /// Entries including those awaiting deletion.
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub(crate) fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleted_entries_stay_until_drained() {
        let mut slab = Slab::default();
        let a = slab.insert("a");
        let b = slab.insert("b");

        assert!(slab.mark_deleted(a));
        assert!(!slab.mark_deleted(a));
        assert!(slab.get(a).is_none());
        assert_eq!(slab.len(), 2);
        assert_eq!(slab.handles(), vec![b]);

        assert_eq!(slab.drain_deleted(), vec!["a"]);
        assert_eq!(slab.len(), 1);
        assert!(!slab.has_deferred());
    }

    #[test]
    fn reused_slot_rejects_stale_handle() {
        let mut slab = Slab::default();
        let old = slab.insert(1);
        slab.mark_deleted(old);
        slab.drain_deleted();

        let new = slab.insert(2);
        assert_eq!(new.index(), old.index());
        assert!(slab.get(old).is_none());
        assert!(!slab.mark_deleted(old));
        assert_eq!(slab.get(new), Some(&2));
    }

    #[test]
    fn drain_without_marks_is_empty() {
        let mut slab = Slab::default();
        slab.insert(());
        assert!(slab.drain_deleted().is_empty());
        assert!(!slab.is_empty());
    }
}
