// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Component signatures as fixed-width bitsets.
//!
//! One bit per component type; the component ceiling is 64 so a single
//! word suffices. Signatures key the archetype map, so the derived `Ord`
//! (raw bit pattern) is part of the contract.

use std::fmt;

use crate::component::ComponentTypeId;

/// Set of component types, bit `k` set iff type `k` is present
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature(u64);

impl Signature {
    /// Signature with no component types
    pub const EMPTY: Signature = Signature(0);

    /// Construct from a raw bit pattern
    pub const fn from_bits(bits: u64) -> Self {
        Signature(bits)
    }

    /// Raw bit pattern
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Copy with the given type's bit set
    #[inline]
    pub const fn with(self, id: ComponentTypeId) -> Self {
        Signature(self.0 | 1 << id.index())
    }

    /// Copy with the given type's bit cleared
    #[inline]
    pub const fn without(self, id: ComponentTypeId) -> Self {
        Signature(self.0 & !(1 << id.index()))
    }

    /// Check whether the given type's bit is set
    #[inline]
    pub const fn contains(self, id: ComponentTypeId) -> bool {
        self.0 & (1 << id.index()) != 0
    }

    #[inline]
    pub const fn union(self, other: Signature) -> Signature {
        Signature(self.0 | other.0)
    }

    #[inline]
    pub const fn intersection(self, other: Signature) -> Signature {
        Signature(self.0 & other.0)
    }

    /// Bits set in `self` but not in `other`
    #[inline]
    pub const fn difference(self, other: Signature) -> Signature {
        Signature(self.0 & !other.0)
    }

    /// True if every bit of `self` is also set in `other`
    #[inline]
    pub const fn is_subset_of(self, other: Signature) -> bool {
        self.0 & other.0 == self.0
    }

    /// True if the two signatures share any set bit
    #[inline]
    pub const fn intersects(self, other: Signature) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of set bits
    #[inline]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate over set bits in ascending type-id order
    pub fn ones(self) -> Ones {
        Ones(self.0)
    }
}

/// Iterator over the set bits of a [`Signature`]
pub struct Ones(u64);

impl Iterator for Ones {
    type Item = ComponentTypeId;

    fn next(&mut self) -> Option<Self::Item> {
        if self.0 == 0 {
            return None;
        }
        let trailing = self.0.trailing_zeros();
        self.0 &= !(1 << trailing); // Clear the bit we just found
        Some(ComponentTypeId::from_index(trailing as usize))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({:#018x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(index: usize) -> ComponentTypeId {
        ComponentTypeId::from_index(index)
    }

    #[test]
    fn test_set_and_test() {
        let sig = Signature::EMPTY.with(id(0)).with(id(5)).with(id(63));
        assert!(sig.contains(id(0)));
        assert!(sig.contains(id(5)));
        assert!(sig.contains(id(63)));
        assert!(!sig.contains(id(1)));
        assert_eq!(sig.len(), 3);
    }

    #[test]
    fn test_without_clears() {
        let sig = Signature::EMPTY.with(id(2)).with(id(3));
        let cleared = sig.without(id(2));
        assert!(!cleared.contains(id(2)));
        assert!(cleared.contains(id(3)));
    }

    #[test]
    fn test_subset_and_intersect() {
        let small = Signature::EMPTY.with(id(1)).with(id(4));
        let large = small.with(id(9));
        assert!(small.is_subset_of(large));
        assert!(!large.is_subset_of(small));
        assert!(small.intersects(large));
        assert!(!small.intersects(Signature::EMPTY.with(id(2))));
    }

    #[test]
    fn test_set_ops() {
        let a = Signature::EMPTY.with(id(0)).with(id(1));
        let b = Signature::EMPTY.with(id(1)).with(id(2));
        assert_eq!(a.union(b).len(), 3);
        assert_eq!(a.intersection(b), Signature::EMPTY.with(id(1)));
        assert_eq!(a.difference(b), Signature::EMPTY.with(id(0)));
    }

    #[test]
    fn test_ones_iteration_ascending() {
        let sig = Signature::EMPTY.with(id(7)).with(id(0)).with(id(41));
        let indices: Vec<usize> = sig.ones().map(|id| id.index()).collect();
        assert_eq!(indices, vec![0, 7, 41]);
    }

    #[test]
    fn test_ordering_by_raw_bits() {
        let a = Signature::from_bits(0b01);
        let b = Signature::from_bits(0b10);
        assert!(a < b);
    }
}
