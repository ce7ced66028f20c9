//! Inclusive byte ranges and sets of them.
use std::{collections::BTreeMap, fmt};

use speedy::{Readable, Writable};

/// An inclusive range of byte offsets, `low..=high`.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Readable, Writable,
)]
pub struct Interval {
    low: u64,
    high: u64,
}

impl Interval {
    /// # Panics
    ///
    /// Panics if `low > high`.
    pub fn new(low: u64, high: u64) -> Self {
        assert!(low <= high, "interval low {low} is above high {high}");
        Self { low, high }
    }

    /// Same as [`Interval::new`] but returns `None` on inverted bounds,
    /// for values coming from the network.
    pub fn checked(low: u64, high: u64) -> Option<Self> {
        (low <= high).then_some(Self { low, high })
    }

    pub fn single(at: u64) -> Self {
        Self { low: at, high: at }
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.high - self.low + 1
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.low <= offset && offset <= self.high
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.low <= other.high && other.low <= self.high
    }

    pub fn intersection(&self, other: &Interval) -> Option<Interval> {
        Interval::checked(self.low.max(other.low), self.high.min(other.high))
    }
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.low, self.high)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

/// A set of disjoint, non adjacent intervals.
///
/// Adding a range that touches or overlaps existing ones merges them, so
/// iteration always yields maximal runs in ascending order.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    // low -> high
    runs: BTreeMap<u64, u64>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set holding every offset of a file of `size` bytes.
    pub fn full(size: u64) -> Self {
        let mut set = Self::new();
        if size > 0 {
            set.add(Interval::new(0, size - 1));
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Number of runs in the set.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Number of bytes covered by the set.
    pub fn size(&self) -> u64 {
        self.runs.iter().map(|(l, h)| h - l + 1).sum()
    }

    pub fn clear(&mut self) {
        self.runs.clear();
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Interval> + '_ {
        self.runs.iter().map(|(&low, &high)| Interval { low, high })
    }

    pub fn first(&self) -> Option<Interval> {
        self.iter().next()
    }

    pub fn last(&self) -> Option<Interval> {
        self.iter().next_back()
    }

    pub fn add(&mut self, interval: Interval) {
        let mut low = interval.low;
        let mut high = interval.high;

        if let Some((&l, &h)) = self.runs.range(..=low).next_back() {
            if h.saturating_add(1) >= low {
                low = l;
                high = high.max(h);
                self.runs.remove(&l);
            }
        }

        let absorbed: Vec<(u64, u64)> = self
            .runs
            .range(low..=high.saturating_add(1))
            .map(|(&l, &h)| (l, h))
            .collect();

        for (l, h) in absorbed {
            high = high.max(h);
            self.runs.remove(&l);
        }

        self.runs.insert(low, high);
    }

    pub fn add_all(&mut self, other: &IntervalSet) {
        for i in other.iter() {
            self.add(i);
        }
    }

    pub fn delete(&mut self, interval: Interval) {
        let mut hit: Vec<(u64, u64)> = Vec::new();

        if let Some((&l, &h)) = self.runs.range(..interval.low).next_back() {
            if h >= interval.low {
                hit.push((l, h));
            }
        }
        hit.extend(
            self.runs
                .range(interval.low..=interval.high)
                .map(|(&l, &h)| (l, h)),
        );

        for (l, h) in hit {
            self.runs.remove(&l);
            if l < interval.low {
                self.runs.insert(l, interval.low - 1);
            }
            if h > interval.high {
                self.runs.insert(interval.high + 1, h);
            }
        }
    }

    pub fn delete_all(&mut self, other: &IntervalSet) {
        for i in other.iter() {
            self.delete(i);
        }
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.interval_at(offset).is_some()
    }

    /// True when every byte of `interval` is in the set.
    pub fn covers(&self, interval: &Interval) -> bool {
        self.interval_at(interval.low)
            .is_some_and(|run| run.high >= interval.high)
    }

    /// True when at least one byte of `interval` is in the set.
    pub fn overlaps(&self, interval: &Interval) -> bool {
        !self.clip(*interval).is_empty()
    }

    /// The run holding `offset`.
    pub fn interval_at(&self, offset: u64) -> Option<Interval> {
        self.runs
            .range(..=offset)
            .next_back()
            .filter(|(_, h)| **h >= offset)
            .map(|(&low, &high)| Interval { low, high })
    }

    /// The run holding `offset`, or the first run starting after it.
    pub fn interval_at_or_after(&self, offset: u64) -> Option<Interval> {
        self.interval_at(offset).or_else(|| {
            self.runs
                .range(offset..)
                .next()
                .map(|(&low, &high)| Interval { low, high })
        })
    }

    /// The part of the set that falls within `bounds`.
    pub fn clip(&self, bounds: Interval) -> IntervalSet {
        let mut out = IntervalSet::new();
        let start = self
            .interval_at(bounds.low)
            .map(|run| run.low)
            .unwrap_or(bounds.low);

        for (&l, &h) in self.runs.range(start..=bounds.high) {
            if let Some(i) = Interval::new(l, h).intersection(&bounds) {
                out.runs.insert(i.low, i.high);
            }
        }
        out
    }

    pub fn intersect(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = IntervalSet::new();
        for i in other.iter() {
            for piece in self.clip(i).iter() {
                out.add(piece);
            }
        }
        out
    }

    /// Every offset within `bounds` that is not in the set.
    pub fn invert(&self, bounds: Interval) -> IntervalSet {
        let mut out = IntervalSet::new();
        out.add(bounds);
        out.delete_all(self);
        out
    }
}

impl From<Interval> for IntervalSet {
    fn from(value: Interval) -> Self {
        let mut set = Self::new();
        set.add(value);
        set
    }
}

impl FromIterator<Interval> for IntervalSet {
    fn from_iter<T: IntoIterator<Item = Interval>>(iter: T) -> Self {
        let mut set = Self::new();
        for i in iter {
            set.add(i);
        }
        set
    }
}

impl fmt::Debug for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(runs: &[(u64, u64)]) -> IntervalSet {
        runs.iter().map(|&(l, h)| Interval::new(l, h)).collect()
    }

    #[test]
    fn add_merges_adjacent_and_overlapping() {
        let mut s = set(&[(0, 9), (20, 29)]);
        s.add(Interval::new(10, 12));
        assert_eq!(s, set(&[(0, 12), (20, 29)]));

        s.add(Interval::new(13, 19));
        assert_eq!(s, set(&[(0, 29)]));

        s.add(Interval::new(40, 50));
        s.add(Interval::new(35, 45));
        assert_eq!(s, set(&[(0, 29), (35, 50)]));
        assert_eq!(s.size(), 30 + 16);
    }

    #[test]
    fn delete_splits_runs() {
        let mut s = set(&[(0, 99)]);
        s.delete(Interval::new(10, 19));
        assert_eq!(s, set(&[(0, 9), (20, 99)]));

        s.delete(Interval::new(0, 0));
        s.delete(Interval::new(90, 200));
        assert_eq!(s, set(&[(1, 9), (20, 89)]));

        s.delete(Interval::new(5, 30));
        assert_eq!(s, set(&[(1, 4), (31, 89)]));
    }

    #[test]
    fn lookups() {
        let s = set(&[(10, 19), (30, 39)]);
        assert_eq!(s.interval_at(15), Some(Interval::new(10, 19)));
        assert_eq!(s.interval_at(25), None);
        assert_eq!(s.interval_at_or_after(25), Some(Interval::new(30, 39)));
        assert_eq!(s.interval_at_or_after(40), None);
        assert!(s.covers(&Interval::new(31, 39)));
        assert!(!s.covers(&Interval::new(15, 31)));
        assert!(s.overlaps(&Interval::new(15, 31)));
        assert_eq!(s.first(), Some(Interval::new(10, 19)));
        assert_eq!(s.last(), Some(Interval::new(30, 39)));
    }

    #[test]
    fn clip_and_intersect() {
        let s = set(&[(0, 9), (20, 29), (40, 49)]);
        assert_eq!(s.clip(Interval::new(5, 25)), set(&[(5, 9), (20, 25)]));
        assert_eq!(
            s.intersect(&set(&[(8, 41)])),
            set(&[(8, 9), (20, 29), (40, 41)])
        );
        assert_eq!(s.invert(Interval::new(0, 29)), set(&[(10, 19)]));
    }

    #[test]
    fn full_file() {
        assert!(IntervalSet::full(0).is_empty());
        assert_eq!(IntervalSet::full(10), set(&[(0, 9)]));
    }

    #[test]
    fn handles_the_end_of_the_address_space() {
        let mut s = IntervalSet::new();
        s.add(Interval::new(u64::MAX - 1, u64::MAX));
        s.add(Interval::new(u64::MAX - 5, u64::MAX - 2));
        assert_eq!(s, set(&[(u64::MAX - 5, u64::MAX)]));
        s.delete(Interval::single(u64::MAX));
        assert_eq!(s.last(), Some(Interval::new(u64::MAX - 5, u64::MAX - 1)));
    }
}
