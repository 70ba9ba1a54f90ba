//! Summaries of observed latencies.

use std::collections::*;
use itertools::*;

/// A list of observed latencies, in cycles.
#[derive(Clone, Debug, Default)]
pub struct RawResults(pub Vec<u64>);
impl RawResults {
    pub fn new() -> Self { Self(Vec::new()) }
    pub fn push(&mut self, value: u64) { self.0.push(value); }
}

/// Implemented on types which contain a list of observed values.
pub trait ResultList<D: Copy + Ord> {
    /// Return a reference to the list of values.
    fn data(&self) -> &Vec<D>;

    /// Return the number of observed values.
    fn len(&self) -> usize { self.data().len() }
    fn is_empty(&self) -> bool { self.data().is_empty() }

    /// Return the minimum value in the list.
    fn get_min(&self) -> Option<D> { self.data().iter().min().copied() }

    /// Return the maximum value in the list.
    fn get_max(&self) -> Option<D> { self.data().iter().max().copied() }

    /// Return the median value in the list. For an even number of values,
    /// this is the lower of the two middle values.
    fn get_median(&self) -> Option<D> {
        let sorted = self.data().iter().copied().sorted().collect_vec();
        if sorted.is_empty() {
            return None;
        }
        Some(sorted[(sorted.len() - 1) / 2])
    }

    /// Return a histogram counting the distribution of all values in the list.
    fn histogram(&self) -> BTreeMap<D, usize> {
        let mut dist = BTreeMap::new();
        for r in self.data().iter() {
            *dist.entry(*r).or_insert(0) += 1;
        }
        dist
    }
}

impl ResultList<u64> for RawResults {
    fn data(&self) -> &Vec<u64> { &self.0 }
}
