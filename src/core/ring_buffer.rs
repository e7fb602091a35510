//! Fixed-capacity overwrite-oldest ring
//!
//! Backs the profiler's sliding window. Storage is allocated once at
//! construction; pushes past capacity overwrite the oldest entry.
//! Not synchronized: owners wrap it in their own lock.

/// Ring of the most recent `capacity` values.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Box<[T]>,
    // Index of the next write
    head: usize,
    len: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be non-zero");
        Self {
            slots: vec![T::default(); capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    /// Push a value, evicting the oldest one when full.
    #[inline]
    pub fn push(&mut self, value: T) -> Option<T> {
        let cap = self.slots.len();
        let evicted = if self.len == cap {
            Some(self.slots[self.head])
        } else {
            self.len += 1;
            None
        };
        self.slots[self.head] = value;
        self.head = (self.head + 1) % cap;
        evicted
    }

    /// Oldest retained value.
    #[inline]
    pub fn oldest(&self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let cap = self.slots.len();
        Some(self.slots[(self.head + cap - self.len) % cap])
    }

    /// Most recently pushed value.
    #[inline]
    pub fn newest(&self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let cap = self.slots.len();
        Some(self.slots[(self.head + cap - 1) % cap])
    }

    /// Values from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        let cap = self.slots.len();
        let start = (self.head + cap - self.len) % cap;
        (0..self.len).map(move |i| self.slots[(start + i) % cap])
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
