//! Descriptor table
//!
//! Allocation is a linear scan from the reserved threshold for the first
//! free bit, so the lowest free descriptor is always handed out first.

use crate::error::{Result, VfsError};

use super::{Bitmap, Fd};

enum Slot<T> {
    /// Allocated, entry not installed yet
    Reserved,
    Occupied(T),
}

/// Fixed-capacity map from descriptor to entry
pub struct DescriptorTable<T> {
    slots: Vec<Option<Slot<T>>>,
    in_use: Bitmap,
    reserved: usize,
}

impl<T> DescriptorTable<T> {
    /// Create a table of `capacity` descriptors, the first `reserved` never issued
    pub fn new(capacity: usize, reserved: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            in_use: Bitmap::new(capacity),
            reserved,
        }
    }

    /// Claim the lowest free descriptor at or above the reserved threshold
    pub fn allocate(&mut self) -> Result<Fd> {
        let index = self
            .in_use
            .first_clear_from(self.reserved)
            .ok_or(VfsError::TooManyOpenFiles {
                capacity: self.capacity(),
            })?;

        self.in_use.set(index);
        self.slots[index] = Some(Slot::Reserved);
        Ok(index as Fd)
    }

    /// Attach an entry to a descriptor returned by [`allocate`](Self::allocate)
    pub fn install(&mut self, fd: Fd, entry: T) -> Result<()> {
        let slot = self
            .index(fd)
            .and_then(|i| self.slots[i].as_mut())
            .ok_or(VfsError::BadDescriptor(fd))?;

        match slot {
            Slot::Reserved => {
                *slot = Slot::Occupied(entry);
                Ok(())
            }
            Slot::Occupied(_) => Err(VfsError::BadDescriptor(fd)),
        }
    }

    pub fn get(&self, fd: Fd) -> Option<&T> {
        match self.index(fd).and_then(|i| self.slots[i].as_ref()) {
            Some(Slot::Occupied(entry)) => Some(entry),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, fd: Fd) -> Option<&mut T> {
        let index = self.index(fd)?;
        match self.slots[index].as_mut() {
            Some(Slot::Occupied(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Free a descriptor, returning its entry if one was installed.
    ///
    /// Out-of-range or free descriptors are a no-op.
    pub fn release(&mut self, fd: Fd) -> Option<T> {
        let index = self.index(fd)?;
        let slot = self.slots[index].take();
        self.in_use.clear(index);

        match slot {
            Some(Slot::Occupied(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Whether `fd` is allocated (reserved or installed)
    pub fn is_in_use(&self, fd: Fd) -> bool {
        self.index(fd).is_some_and(|i| self.in_use.get(i))
    }

    /// Descriptors with an installed entry, ascending
    pub fn descriptors(&self) -> Vec<Fd> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Some(Slot::Occupied(_))))
            .map(|(i, _)| i as Fd)
            .collect()
    }

    /// Allocated descriptors
    pub fn len(&self) -> usize {
        self.in_use.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Slot index for `fd`, if it names a slot at all
    fn index(&self, fd: Fd) -> Option<usize> {
        usize::try_from(fd).ok().filter(|&i| i < self.slots.len())
    }
}
