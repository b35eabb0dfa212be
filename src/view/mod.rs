//! Membership views and the partial order over them.
//!
//! A view is the set of processes installed as the system membership at some
//! point in time. Views are ordered by set inclusion; two views are
//! comparable only when one contains the other. Incomparable views can exist
//! in flight but are never both installed.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::Display;

use bytes::{BufMut, Bytes, BytesMut};

use crate::utilities::crypto::ProcessId;

pub(crate) mod sequence;

pub use sequence::Sequence;

/// Raw membership set, before being wrapped into a [`View`].
pub type ViewData = BTreeSet<ProcessId>;

/// Position-significant membership used by the tree overlay: index 0 is the
/// broadcaster, the rest is the BFS order of the balanced tree.
pub type TreeView = Vec<ProcessId>;

/// An installed (or in-flight) membership of the system.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct View {
    data: ViewData,
}

impl View {
    pub fn new(data: ViewData) -> Self {
        Self { data }
    }

    pub fn members(&self) -> &ViewData {
        &self.data
    }

    pub fn into_members(self) -> ViewData {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_member(&self, id: &ProcessId) -> bool {
        self.data.contains(id)
    }

    pub(crate) fn insert(&mut self, id: ProcessId) {
        self.data.insert(id);
    }

    pub(crate) fn remove(&mut self, id: &ProcessId) {
        self.data.remove(id);
    }

    /// Byzantine quorum of this view.
    pub fn quorum_size(&self) -> usize {
        Self::quorum_of(self.data.len())
    }

    /// Byzantine quorum of a view of `n` processes: `n - ⌊(n-1)/3⌋`.
    pub fn quorum_of(n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        n - (n - 1) / 3
    }

    /// Number of faulty processes tolerated in a view of `n` processes.
    pub fn max_invalid_processes(n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        (n - 1) / 3
    }

    /// Merge other view into this view.
    pub fn merge(&mut self, other: &View) {
        self.data.extend(other.data.iter().copied());
    }

    /// Merge two views into one.
    pub fn merged(a: &View, b: &View) -> View {
        let mut merged = a.clone();
        merged.merge(b);
        merged
    }

    /// Remove from this view all members that appear in the other view.
    pub fn difference(&mut self, other: &View) {
        self.data.retain(|id| !other.data.contains(id));
    }

    pub fn is_subset_of(&self, other: &View) -> bool {
        self.data.is_subset(&other.data)
    }

    pub fn is_strict_subset_of(&self, other: &View) -> bool {
        self.data.len() < other.data.len() && self.is_subset_of(other)
    }

    /// Inclusion order. `Less` means this view is less recent than `other`.
    /// `None` means the views are incomparable.
    pub fn compare(&self, other: &View) -> Option<Ordering> {
        if self.data == other.data {
            Some(Ordering::Equal)
        } else if self.is_subset_of(other) {
            Some(Ordering::Less)
        } else if other.is_subset_of(self) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }

    /// Check if two views are comparable.
    pub fn are_comparable(a: &View, b: &View) -> bool {
        a.compare(b).is_some()
    }

    /// Canonical serialised form: `u32 count ‖ count × ProcessId`, ascending.
    pub(crate) fn pack_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.data.len() as u32);
        for id in &self.data {
            buf.put_slice(id.as_bytes());
        }
    }

    pub(crate) fn packed(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.packed_size());
        self.pack_into(&mut buf);
        buf.freeze()
    }

    pub(crate) fn packed_size(&self) -> usize {
        4 + self.data.len() * 32
    }

    /// Total order used only for canonical keying and deterministic
    /// iteration; the protocol order is [`View::compare`].
    pub(crate) fn canonical_cmp(&self, other: &View) -> Ordering {
        self.data
            .len()
            .cmp(&other.data.len())
            .then_with(|| self.data.iter().cmp(other.data.iter()))
    }
}

impl From<ViewData> for View {
    fn from(data: ViewData) -> Self {
        Self::new(data)
    }
}

impl FromIterator<ProcessId> for View {
    fn from_iter<I: IntoIterator<Item = ProcessId>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        let mut leading_space = false;
        for id in &self.data {
            if leading_space {
                write!(f, " ")?;
            }
            write!(f, "{id}")?;
            leading_space = true;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) fn process_id(tag: u8) -> ProcessId {
        let mut bytes = [0u8; 32];
        bytes[0] = tag;
        ProcessId::new(bytes)
    }

    pub(crate) fn view_of(tags: &[u8]) -> View {
        tags.iter().map(|tag| process_id(*tag)).collect()
    }

    #[test]
    fn test_quorum_sizes() {
        for (n, quorum) in [(1, 1), (4, 3), (7, 5), (10, 7), (100, 67)] {
            assert_eq!(quorum, View::quorum_of(n));
        }
    }

    #[test]
    fn test_max_invalid_processes() {
        for k in [0usize, 1, 2, 7, 33] {
            assert_eq!(k, View::max_invalid_processes(3 * k + 1));
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let view = view_of(&[1, 2, 3]);
        assert_eq!(view, View::merged(&view, &view));
    }

    #[test]
    fn test_difference_with_self_is_empty() {
        let mut view = view_of(&[1, 2, 3]);
        view.difference(&view.clone());
        assert!(view.is_empty());
    }

    #[test]
    fn test_merge_then_difference_subtracts() {
        let a = view_of(&[1, 2]);
        let b = view_of(&[2, 3]);

        let mut merged = View::merged(&a, &b);
        merged.difference(&b);

        // (A ∪ B) \ B == A \ B
        assert_eq!(view_of(&[1]), merged);
    }

    #[test]
    fn test_inclusion_order() {
        let small = view_of(&[1, 2]);
        let large = view_of(&[1, 2, 3]);
        let other = view_of(&[1, 4]);

        assert_eq!(Some(Ordering::Less), small.compare(&large));
        assert_eq!(Some(Ordering::Greater), large.compare(&small));
        assert_eq!(Some(Ordering::Equal), small.compare(&small.clone()));
        assert_eq!(None, small.compare(&other));
        assert!(!View::are_comparable(&small, &other));
    }

    #[test]
    fn test_packed_form_is_ascending() {
        let view = view_of(&[3, 1, 2]);
        let packed = view.packed();

        assert_eq!(view.packed_size(), packed.len());
        assert_eq!(&[3, 0, 0, 0], &packed[..4]);
        // Count is followed by member ids in ascending order.
        assert_eq!(1, packed[4]);
        assert_eq!(2, packed[4 + 32]);
        assert_eq!(3, packed[4 + 64]);
    }
}
