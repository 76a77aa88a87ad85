//! Bounded id sets.
//!
//! `out_flag`, `core_flag` and hardware maps are small sets of enumerated ids.
//! [`IdSet`] stores them in a single `u64` word but only ever exposes the ids
//! themselves, so every insert/remove goes through a typed id and iteration
//! yields typed ids back.

use std::fmt;
use std::marker::PhantomData;

/// An enumerated id that can live in an [`IdSet`].
///
/// `CAPACITY` must not exceed 64 and `index()` must be below `CAPACITY`.
pub trait SetIndex: Copy + Eq {
    /// Number of distinct ids.
    const CAPACITY: usize;

    /// Dense index of this id, `0..CAPACITY`.
    fn index(self) -> usize;

    /// Inverse of [`SetIndex::index`].
    fn from_index(index: usize) -> Option<Self>;
}

/// Fixed-capacity set of ids backed by one machine word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdSet<I: SetIndex> {
    bits: u64,
    _marker: PhantomData<I>,
}

impl<I: SetIndex> IdSet<I> {
    /// The empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bits: 0,
            _marker: PhantomData,
        }
    }

    /// Set containing every id.
    #[must_use]
    pub fn full() -> Self {
        (0..I::CAPACITY).filter_map(I::from_index).collect()
    }

    fn bit(id: I) -> u64 {
        let index = id.index();
        debug_assert!(index < I::CAPACITY && index < 64, "id index {index} out of range");
        1u64 << index
    }

    /// Insert `id`; returns `true` if it was not already present.
    pub fn insert(&mut self, id: I) -> bool {
        let bit = Self::bit(id);
        let fresh = self.bits & bit == 0;
        self.bits |= bit;
        fresh
    }

    /// Remove `id`; returns `true` if it was present.
    pub fn remove(&mut self, id: I) -> bool {
        let bit = Self::bit(id);
        let present = self.bits & bit != 0;
        self.bits &= !bit;
        present
    }

    /// Whether `id` is a member.
    #[must_use]
    pub fn contains(&self, id: I) -> bool {
        self.bits & Self::bit(id) != 0
    }

    /// Whether the set has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Remove every member.
    pub fn clear(&mut self) {
        self.bits = 0;
    }

    /// Copy of this set without `id`.
    #[must_use]
    pub fn without(mut self, id: I) -> Self {
        self.remove(id);
        self
    }

    /// Members present in both sets.
    #[must_use]
    pub fn intersection(self, other: Self) -> Self {
        Self {
            bits: self.bits & other.bits,
            _marker: PhantomData,
        }
    }

    /// Whether every member of `self` is also in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.bits & !other.bits == 0
    }

    /// Members in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = I> + '_ {
        let bits = self.bits;
        (0..I::CAPACITY)
            .filter(move |i| bits & (1u64 << i) != 0)
            .filter_map(I::from_index)
    }
}

impl<I: SetIndex> Default for IdSet<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: SetIndex> FromIterator<I> for IdSet<I> {
    fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
        let mut set = Self::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl<I: SetIndex> Extend<I> for IdSet<I> {
    fn extend<T: IntoIterator<Item = I>>(&mut self, iter: T) {
        for id in iter {
            self.insert(id);
        }
    }
}

impl<I: SetIndex + fmt::Debug> fmt::Debug for IdSet<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
