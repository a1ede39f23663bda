//! Fixed-population ring with an explicit rotation offset.
//!
//! The engine schedules drivers round-robin: each stride the front driver
//! runs its critical section, hands its terminal state to the next slot, and
//! the ring rotates. Rather than physically moving elements (and invalidating
//! any notion of "driver 0"), a [`RingBuffer`] keeps its elements in place
//! and tracks a zero pointer; every positional access counts from that
//! pointer and wraps.

/// A vector with a rotating zero pointer.
///
/// Position `0` is wherever the zero pointer currently is; positions wrap
/// modulo the population, so `get(len())` is the front again. [`rotate`]
/// moves the zero pointer forward by one without touching the elements.
///
/// [`rotate`]: Self::rotate
#[derive(Debug, Clone, Default)]
pub struct RingBuffer<T> {
    items: Vec<T>,
    zero: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            zero: 0,
        }
    }

    /// Builds a ring from a vector; element `0` starts at the front.
    #[must_use]
    pub fn from_vec(items: Vec<T>) -> Self {
        Self { items, zero: 0 }
    }

    /// Number of elements in the ring.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the ring has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Current rotation offset into the backing store.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.zero
    }

    /// Appends an element at the back of the current rotated order.
    pub fn push(&mut self, value: T) {
        self.items.insert(self.zero, value);
        self.zero += 1;
    }

    /// Rotates forward: the element at position 1 becomes the front.
    pub fn rotate(&mut self) {
        if !self.items.is_empty() {
            self.zero = (self.zero + 1) % self.items.len();
        }
    }

    /// Rotates backward: the back element becomes the front.
    pub fn rotate_back(&mut self) {
        if !self.items.is_empty() {
            self.zero = (self.zero + self.items.len() - 1) % self.items.len();
        }
    }

    /// Element at `position` counted from the zero pointer, wrapping.
    #[must_use]
    pub fn get(&self, position: usize) -> Option<&T> {
        if self.items.is_empty() {
            return None;
        }
        let i = (self.zero + position) % self.items.len();
        self.items.get(i)
    }

    /// Mutable element at `position` counted from the zero pointer, wrapping.
    pub fn get_mut(&mut self, position: usize) -> Option<&mut T> {
        if self.items.is_empty() {
            return None;
        }
        let i = (self.zero + position) % self.items.len();
        self.items.get_mut(i)
    }

    /// The element at the zero pointer.
    #[must_use]
    pub fn front(&self) -> Option<&T> {
        self.get(0)
    }

    /// Mutable reference to the element at the zero pointer.
    pub fn front_mut(&mut self) -> Option<&mut T> {
        self.get_mut(0)
    }

    /// The last element in rotated order.
    #[must_use]
    pub fn back(&self) -> Option<&T> {
        if self.items.is_empty() {
            None
        } else {
            self.get(self.items.len() - 1)
        }
    }

    /// Iterates the elements in rotated order, front first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let (tail, head) = self.items.split_at(self.zero);
        head.iter().chain(tail.iter())
    }

    /// Iterates the elements mutably in rotated order, front first.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        let (tail, head) = self.items.split_at_mut(self.zero);
        head.iter_mut().chain(tail.iter_mut())
    }
}

impl<'a, T> IntoIterator for &'a RingBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::iter::Chain<std::slice::Iter<'a, T>, std::slice::Iter<'a, T>>;

    fn into_iter(self) -> Self::IntoIter {
        let (tail, head) = self.items.split_at(self.zero);
        head.iter().chain(tail.iter())
    }
}

impl<T> FromIterator<T> for RingBuffer<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}
