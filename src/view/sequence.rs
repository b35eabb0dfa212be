//! Sequences of views in strictly ascending inclusion order.

use std::cmp::Ordering;
use std::fmt::Display;

use crate::view::View;

/// An ordered list of mutually comparable views. Greater index means more
/// recent view.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Sequence {
    data: Vec<View>,
}

impl Sequence {
    /// Create a `Sequence` from `data`, if `data` is strictly ascending.
    pub fn from_views(data: Vec<View>) -> Option<Sequence> {
        if Self::is_valid_sequence(&data) {
            Some(Sequence { data })
        } else {
            None
        }
    }

    /// Check whether all views in `data` are mutually comparable and sorted
    /// in strictly ascending order.
    pub fn is_valid_sequence(data: &[View]) -> bool {
        data.windows(2)
            .all(|pair| pair[0].is_strict_subset_of(&pair[1]))
    }

    /// Underlying sequence of views.
    pub fn data(&self) -> &[View] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn maybe_least_recent(&self) -> Option<&View> {
        self.data.first()
    }

    pub fn maybe_most_recent(&self) -> Option<&View> {
        self.data.last()
    }

    /// Position `tested` would occupy on insertion, if it is comparable with
    /// every view already present and not a duplicate.
    ///
    /// The sequence is a chain, so comparability with the insertion
    /// neighbours implies comparability with every element.
    pub fn can_insert(&self, tested: &View) -> Option<usize> {
        let pos = self
            .data
            .iter()
            .position(|view| tested.len() <= view.len())
            .unwrap_or(self.data.len());

        if pos > 0 && !self.data[pos - 1].is_strict_subset_of(tested) {
            return None;
        }
        if pos < self.data.len() && !tested.is_strict_subset_of(&self.data[pos]) {
            return None;
        }

        Some(pos)
    }

    /// Try to insert `view` at its unique position.
    pub fn try_insert(&mut self, view: &View) -> bool {
        match self.can_insert(view) {
            Some(pos) => {
                self.data.insert(pos, view.clone());
                true
            }
            None => false,
        }
    }

    /// Check whether `tested` is more recent than every view present, and
    /// therefore can be appended.
    pub fn can_append(&self, tested: &View) -> bool {
        match self.maybe_most_recent() {
            Some(most_recent) => most_recent.is_strict_subset_of(tested),
            None => true,
        }
    }

    /// Try to append `view`.
    pub fn try_append(&mut self, view: &View) -> bool {
        let appendable = self.can_append(view);
        if appendable {
            self.data.push(view.clone());
        }
        appendable
    }

    /// Check whether every view of `tested` is more recent than every view
    /// present, and therefore the whole sequence can be appended.
    pub fn can_append_sequence(&self, tested: &Sequence) -> bool {
        match (self.maybe_most_recent(), tested.maybe_least_recent()) {
            (Some(most_recent), Some(least_recent)) => {
                most_recent.is_strict_subset_of(least_recent)
            }
            _ => true,
        }
    }

    /// Try to append all views of `sequence`.
    pub fn try_append_sequence(&mut self, sequence: &Sequence) -> bool {
        let appendable = self.can_append_sequence(sequence);
        if appendable {
            self.data.extend(sequence.data.iter().cloned());
        }
        appendable
    }

    /// Check whether `other` can be merged in: every view of `other` must
    /// be either already present or insertable.
    pub fn can_merge(&self, other: &Sequence) -> bool {
        let mut merged = self.clone();
        other.data.iter().all(|view| {
            merged.data.contains(view) || merged.try_insert(view)
        })
    }

    /// Merge all views of `other` into this sequence. On failure the
    /// sequence is left unchanged.
    pub fn try_merge(&mut self, other: &Sequence) -> bool {
        let mut merged = self.clone();
        for view in &other.data {
            if merged.data.contains(view) {
                continue;
            }
            if !merged.try_insert(view) {
                return false;
            }
        }
        *self = merged;
        true
    }

    /// Try to erase `view`. Returns whether the view was found and erased.
    pub fn try_erase(&mut self, view: &View) -> bool {
        match self.data.iter().position(|v| v == view) {
            Some(pos) => {
                self.data.remove(pos);
                true
            }
            None => false,
        }
    }
}

// Sequences are totally ordered by length; ties break on the canonical view
// order so the ordering stays antisymmetric.
impl PartialOrd for Sequence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sequence {
    fn cmp(&self, other: &Self) -> Ordering {
        self.data.len().cmp(&other.data.len()).then_with(|| {
            self.data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| a.canonical_cmp(b))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        })
    }
}

impl Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut leading_comma = false;
        for view in &self.data {
            if leading_comma {
                write!(f, ", ")?;
            }
            write!(f, "{view}")?;
            leading_comma = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::view::test::view_of;

    use super::*;

    #[test]
    fn test_from_views_requires_strict_ascent() {
        let ascending = vec![view_of(&[1]), view_of(&[1, 2]), view_of(&[1, 2, 3])];
        assert!(Sequence::from_views(ascending).is_some());

        let duplicate = vec![view_of(&[1]), view_of(&[1])];
        assert!(Sequence::from_views(duplicate).is_none());

        let incomparable = vec![view_of(&[1]), view_of(&[2, 3])];
        assert!(Sequence::from_views(incomparable).is_none());
    }

    #[test]
    fn test_consecutive_views_are_strict_subsets() {
        let mut sequence = Sequence::default();
        assert!(sequence.try_insert(&view_of(&[1, 2, 3])));
        assert!(sequence.try_insert(&view_of(&[1])));
        assert!(sequence.try_insert(&view_of(&[1, 2])));

        for pair in sequence.data().windows(2) {
            assert!(pair[0].is_strict_subset_of(&pair[1]));
        }
    }

    #[test]
    fn test_try_insert_rejects_incomparable_view() {
        let mut sequence =
            Sequence::from_views(vec![view_of(&[1]), view_of(&[1, 2, 3])]).unwrap();

        assert!(!sequence.try_insert(&view_of(&[4, 5])));
        assert!(!sequence.try_insert(&view_of(&[1, 4])));
        assert_eq!(2, sequence.len());
    }

    #[test]
    fn test_try_insert_rejects_duplicate_length() {
        let mut sequence = Sequence::from_views(vec![view_of(&[1, 2])]).unwrap();
        assert!(!sequence.try_insert(&view_of(&[1, 2])));
        assert!(!sequence.try_insert(&view_of(&[1, 3])));
    }

    #[test]
    fn test_insertion_in_any_order_rebuilds_sequence() {
        let original = Sequence::from_views(vec![
            view_of(&[1]),
            view_of(&[1, 2]),
            view_of(&[1, 2, 3]),
            view_of(&[1, 2, 3, 4]),
        ])
        .unwrap();

        let orders: Vec<Vec<usize>> = vec![
            vec![3, 1, 0, 2],
            vec![0, 1, 2, 3],
            vec![3, 2, 1, 0],
            vec![1, 3, 0, 2],
        ];
        for order in orders {
            let mut rebuilt = Sequence::default();
            for index in order {
                assert!(rebuilt.try_insert(&original.data()[index]));
            }
            assert_eq!(original, rebuilt);
        }
    }

    #[test]
    fn test_append_requires_more_recent_view() {
        let mut sequence = Sequence::from_views(vec![view_of(&[1, 2])]).unwrap();

        assert!(!sequence.try_append(&view_of(&[1])));
        assert!(!sequence.try_append(&view_of(&[1, 3])));
        assert!(sequence.try_append(&view_of(&[1, 2, 3])));
    }

    #[test]
    fn test_append_sequence() {
        let mut head = Sequence::from_views(vec![view_of(&[1])]).unwrap();
        let tail =
            Sequence::from_views(vec![view_of(&[1, 2]), view_of(&[1, 2, 3])]).unwrap();

        assert!(head.try_append_sequence(&tail));
        assert_eq!(3, head.len());

        // The tail is now stale relative to head.
        assert!(!head.try_append_sequence(&tail));
    }

    #[test]
    fn test_merge_overlapping_sequences() {
        let mut a =
            Sequence::from_views(vec![view_of(&[1]), view_of(&[1, 2, 3])]).unwrap();
        let b =
            Sequence::from_views(vec![view_of(&[1, 2]), view_of(&[1, 2, 3])]).unwrap();

        assert!(a.can_merge(&b));
        assert!(a.try_merge(&b));
        assert_eq!(3, a.len());
    }

    #[test]
    fn test_merge_conflicting_sequences_fails_without_change() {
        let mut a = Sequence::from_views(vec![view_of(&[1, 2])]).unwrap();
        let b = Sequence::from_views(vec![view_of(&[1, 3])]).unwrap();

        assert!(!a.can_merge(&b));
        assert!(!a.try_merge(&b));
        assert_eq!(Sequence::from_views(vec![view_of(&[1, 2])]).unwrap(), a);
    }

    #[test]
    fn test_try_erase() {
        let mut sequence =
            Sequence::from_views(vec![view_of(&[1]), view_of(&[1, 2])]).unwrap();

        assert!(sequence.try_erase(&view_of(&[1])));
        assert!(!sequence.try_erase(&view_of(&[1])));
        assert_eq!(1, sequence.len());
    }

    #[test]
    fn test_order_by_length() {
        let short = Sequence::from_views(vec![view_of(&[1])]).unwrap();
        let long =
            Sequence::from_views(vec![view_of(&[1]), view_of(&[1, 2])]).unwrap();

        assert!(short < long);
        assert!(long > short);
    }
}
