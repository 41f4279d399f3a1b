//! Arena Allocator (`ARAL`) — slab pools for fixed-size records.
//!
//! Pages, page descriptors, and command envelopes are all short-lived,
//! fixed-size records allocated and freed at a high rate. Rather than
//! going through the global allocator for each one, they come from a
//! slab: a growable `Vec<Slot<T>>` plus a free list of indices. Handles
//! are stable indices, not pointers, so the arena can be resized without
//! invalidating anything a caller is holding.

use parking_lot::Mutex;

/// A stable handle into an [`Arena`]. Cheap to copy and to hold across
/// `await` points or thread boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaHandle(u32);

impl ArenaHandle {
    pub fn index(&self) -> u32 {
        self.0
    }
}

enum Slot<T> {
    Occupied(T),
    Free { next_free: u32 },
    Sentinel,
}

struct ArenaInner<T> {
    slots: Vec<Slot<T>>,
    free_head: u32,
    len: usize,
}

const NIL: u32 = u32::MAX;

/// A slab pool of fixed-size records of type `T`.
///
/// Safe for concurrent `alloc`/`free` from multiple threads; internally
/// protected by a single lock, mirroring the teacher's per-core frame
/// pools but generalized to arbitrary record types instead of just
/// buffer frames.
pub struct Arena<T> {
    inner: Mutex<ArenaInner<T>>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ArenaInner {
                slots: Vec::new(),
                free_head: NIL,
                len: 0,
            }),
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Mutex::new(ArenaInner {
                slots: Vec::with_capacity(cap),
                free_head: NIL,
                len: 0,
            }),
        }
    }

    /// Allocate a record, returning a stable handle.
    pub fn alloc(&self, value: T) -> ArenaHandle {
        let mut inner = self.inner.lock();
        inner.len += 1;
        if inner.free_head != NIL {
            let idx = inner.free_head;
            let next_free = match inner.slots[idx as usize] {
                Slot::Free { next_free } => next_free,
                _ => unreachable!("free list pointed at an occupied slot"),
            };
            inner.free_head = next_free;
            inner.slots[idx as usize] = Slot::Occupied(value);
            ArenaHandle(idx)
        } else {
            let idx = inner.slots.len() as u32;
            inner.slots.push(Slot::Occupied(value));
            ArenaHandle(idx)
        }
    }

    /// Free a record, returning its value to the caller.
    ///
    /// Panics (invariant violation) if the handle is stale — a double
    /// free indicates a refcounting bug upstream and is not recoverable
    /// at this layer.
    pub fn free(&self, handle: ArenaHandle) -> T {
        let mut inner = self.inner.lock();
        let idx = handle.0 as usize;
        let old = std::mem::replace(&mut inner.slots[idx], Slot::Sentinel);
        let value = match old {
            Slot::Occupied(v) => v,
            _ => panic!("arena: double free or invalid handle {}", handle.0),
        };
        inner.slots[idx] = Slot::Free {
            next_free: inner.free_head,
        };
        inner.free_head = handle.0;
        inner.len -= 1;
        value
    }

    pub fn with<R>(&self, handle: ArenaHandle, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.inner.lock();
        match inner.slots.get(handle.0 as usize) {
            Some(Slot::Occupied(v)) => Some(f(v)),
            _ => None,
        }
    }

    pub fn with_mut<R>(&self, handle: ArenaHandle, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(handle.0 as usize) {
            Some(Slot::Occupied(v)) => Some(f(v)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_reuses_slots() {
        let arena: Arena<u64> = Arena::new();
        let h1 = arena.alloc(10);
        let h2 = arena.alloc(20);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.free(h1), 10);
        assert_eq!(arena.len(), 1);
        let h3 = arena.alloc(30);
        // the freed slot should have been reused
        assert_eq!(h3.index(), h1.index());
        assert_eq!(arena.with(h2, |v| *v), Some(20));
        assert_eq!(arena.with(h3, |v| *v), Some(30));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let arena: Arena<u64> = Arena::new();
        let h = arena.alloc(1);
        arena.free(h);
        arena.free(h);
    }
}
