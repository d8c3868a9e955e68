//! Single-pass statistical summaries.
//!
//! A [`Sketch`] is built by folding one [`SketchPartial`] per partition and
//! merging the partials, so the data is traversed exactly once regardless of
//! partitioning. Mean and variance use Welford's online recurrence with the
//! parallel combination rule; distinct counts use a k-minimum-values
//! estimator; item frequencies use a bounded space-saving table. The
//! frequency table and the distinct count are approximate on high-cardinality
//! data, exact while cardinality stays under the respective capacities.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};

use xa_engine::{EngineError, Handle};
use xa_types::Value;

/// Distinct-value hashes retained by the k-minimum-values estimator.
pub const DISTINCT_CAPACITY: usize = 256;
/// Entries retained by the heavy-hitter frequency table.
pub const FREQUENT_ITEMS_CAPACITY: usize = 64;

fn value_hash(v: &Value) -> u64 {
    let mut h = DefaultHasher::new();
    v.hash(&mut h);
    h.finish()
}

/// Mergeable per-partition accumulator.
#[derive(Debug, Clone, Default)]
pub struct SketchPartial {
    size: u64,
    num_undefined: u64,
    min: Option<Value>,
    max: Option<Value>,
    // Welford state over the numeric view of present elements.
    numeric_count: u64,
    mean: f64,
    m2: f64,
    sum: f64,
    min_hashes: BTreeSet<u64>,
    frequencies: HashMap<Value, u64>,
}

impl SketchPartial {
    /// Fold one element into the accumulator.
    pub fn update(&mut self, v: &Value) {
        self.size += 1;
        if v.is_missing() {
            self.num_undefined += 1;
            return;
        }
        self.observe_extrema(v);
        self.observe_hash(value_hash(v));
        self.observe_frequency(v);
        if let Ok(x) = v.to_f64() {
            self.numeric_count += 1;
            self.sum += x;
            let delta = x - self.mean;
            self.mean += delta / self.numeric_count as f64;
            self.m2 += delta * (x - self.mean);
        }
    }

    fn observe_extrema(&mut self, v: &Value) {
        if self
            .min
            .as_ref()
            .is_none_or(|m| v.total_cmp(m) == std::cmp::Ordering::Less)
        {
            self.min = Some(v.clone());
        }
        if self
            .max
            .as_ref()
            .is_none_or(|m| v.total_cmp(m) == std::cmp::Ordering::Greater)
        {
            self.max = Some(v.clone());
        }
    }

    fn observe_hash(&mut self, h: u64) {
        self.min_hashes.insert(h);
        while self.min_hashes.len() > DISTINCT_CAPACITY {
            self.min_hashes.pop_last();
        }
    }

    fn observe_frequency(&mut self, v: &Value) {
        if let Some(n) = self.frequencies.get_mut(v) {
            *n += 1;
            return;
        }
        if self.frequencies.len() < FREQUENT_ITEMS_CAPACITY {
            self.frequencies.insert(v.clone(), 1);
            return;
        }
        // Space-saving eviction: the newcomer inherits the evicted floor.
        if let Some((victim, floor)) = self
            .frequencies
            .iter()
            .min_by_key(|(_, n)| **n)
            .map(|(k, n)| (k.clone(), *n))
        {
            self.frequencies.remove(&victim);
            self.frequencies.insert(v.clone(), floor + 1);
        }
    }

    /// Combine two accumulators; order-insensitive up to the approximate
    /// structures' tie handling.
    #[must_use]
    pub fn merge(mut self, other: SketchPartial) -> SketchPartial {
        self.size += other.size;
        self.num_undefined += other.num_undefined;
        for v in [other.min, other.max].into_iter().flatten() {
            self.observe_extrema(&v);
        }
        // Parallel Welford combination.
        let (na, nb) = (self.numeric_count as f64, other.numeric_count as f64);
        if other.numeric_count > 0 {
            if self.numeric_count == 0 {
                self.mean = other.mean;
                self.m2 = other.m2;
            } else {
                let delta = other.mean - self.mean;
                self.mean = (na * self.mean + nb * other.mean) / (na + nb);
                self.m2 += other.m2 + delta * delta * na * nb / (na + nb);
            }
            self.numeric_count += other.numeric_count;
            self.sum += other.sum;
        }
        for h in other.min_hashes {
            self.observe_hash(h);
        }
        let mut merged = self.frequencies;
        for (v, n) in other.frequencies {
            *merged.entry(v).or_insert(0) += n;
        }
        if merged.len() > FREQUENT_ITEMS_CAPACITY {
            let mut entries: Vec<(Value, u64)> = merged.into_iter().collect();
            entries.sort_by(|a, b| b.1.cmp(&a.1));
            entries.truncate(FREQUENT_ITEMS_CAPACITY);
            merged = entries.into_iter().collect();
        }
        self.frequencies = merged;
        self
    }
}

/// Materialized summary of one dataset.
#[derive(Debug, Clone)]
pub struct Sketch {
    partial: SketchPartial,
}

impl Sketch {
    /// Traverse the dataset once, folding a partial per partition.
    pub fn from_handle(handle: &Handle<Value>) -> Result<Sketch, EngineError> {
        let partial = handle.aggregate(
            SketchPartial::default(),
            |mut acc, v| {
                acc.update(v);
                acc
            },
            SketchPartial::merge,
        )?;
        Ok(Sketch { partial })
    }

    /// Total element count, missing included.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.partial.size
    }

    /// Count of missing elements.
    #[must_use]
    pub fn num_undefined(&self) -> u64 {
        self.partial.num_undefined
    }

    /// Smallest present element, `None` when all elements are missing.
    #[must_use]
    pub fn min(&self) -> Option<&Value> {
        self.partial.min.as_ref()
    }

    #[must_use]
    pub fn max(&self) -> Option<&Value> {
        self.partial.max.as_ref()
    }

    /// Sum of the numeric view; `None` when no element was numeric.
    #[must_use]
    pub fn sum(&self) -> Option<f64> {
        (self.partial.numeric_count > 0).then_some(self.partial.sum)
    }

    #[must_use]
    pub fn mean(&self) -> Option<f64> {
        (self.partial.numeric_count > 0).then_some(self.partial.mean)
    }

    /// Population variance of the numeric view.
    #[must_use]
    pub fn var(&self) -> Option<f64> {
        (self.partial.numeric_count > 0)
            .then(|| self.partial.m2 / self.partial.numeric_count as f64)
    }

    #[must_use]
    pub fn std(&self) -> Option<f64> {
        self.var().map(f64::sqrt)
    }

    /// Estimated distinct count of present elements. Exact below
    /// [`DISTINCT_CAPACITY`] distinct values.
    #[must_use]
    pub fn num_unique(&self) -> u64 {
        let k = self.partial.min_hashes.len();
        if k < DISTINCT_CAPACITY {
            return k as u64;
        }
        // kth smallest hash as a fraction of the hash space.
        match self.partial.min_hashes.last() {
            Some(&kth) if kth > 0 => {
                let fraction = kth as f64 / u64::MAX as f64;
                (((k - 1) as f64) / fraction).round() as u64
            }
            _ => k as u64,
        }
    }

    /// Heavy-hitter table; counts are exact while the observed cardinality
    /// stays under [`FREQUENT_ITEMS_CAPACITY`].
    #[must_use]
    pub fn frequent_items(&self) -> &HashMap<Value, u64> {
        &self.partial.frequencies
    }

    /// Tracked occurrence count for one value, zero if untracked.
    #[must_use]
    pub fn frequency_count(&self, v: &Value) -> u64 {
        self.partial.frequencies.get(v).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sketch_of(values: Vec<Value>) -> Sketch {
        Sketch::from_handle(&Handle::from_vec_partitioned(values, 3)).unwrap()
    }

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().copied().map(Value::Int).collect()
    }

    #[test]
    fn basic_numeric_summary() {
        let s = sketch_of(ints(&[1, 2, 3, 4, 5]));
        assert_eq!(s.size(), 5);
        assert_eq!(s.num_undefined(), 0);
        assert_eq!(s.min(), Some(&Value::Int(1)));
        assert_eq!(s.max(), Some(&Value::Int(5)));
        assert_eq!(s.sum(), Some(15.0));
        assert_eq!(s.mean(), Some(3.0));
        assert_eq!(s.var(), Some(2.0));
        assert_eq!(s.num_unique(), 5);
    }

    #[test]
    fn missing_elements_are_counted_but_excluded() {
        let mut values = ints(&[1, 3]);
        values.push(Value::Undefined);
        values.push(Value::Float(f64::NAN));
        let s = sketch_of(values);
        assert_eq!(s.size(), 4);
        assert_eq!(s.num_undefined(), 2);
        assert_eq!(s.mean(), Some(2.0));
    }

    #[test]
    fn all_missing_has_no_stats() {
        let s = sketch_of(vec![Value::Undefined, Value::Undefined]);
        assert_eq!(s.min(), None);
        assert_eq!(s.sum(), None);
        assert_eq!(s.mean(), None);
        assert_eq!(s.var(), None);
        assert_eq!(s.num_unique(), 0);
    }

    #[test]
    fn string_summary_skips_numeric_stats() {
        let s = sketch_of(vec![Value::from("b"), Value::from("a"), Value::from("b")]);
        assert_eq!(s.mean(), None);
        assert_eq!(s.min(), Some(&Value::from("a")));
        assert_eq!(s.max(), Some(&Value::from("b")));
        assert_eq!(s.num_unique(), 2);
        assert_eq!(s.frequency_count(&Value::from("b")), 2);
    }

    #[test]
    fn frequency_table_is_exact_under_capacity() {
        let s = sketch_of(ints(&[1, 3, 3, 3, 5]));
        assert_eq!(s.frequency_count(&Value::Int(3)), 3);
        assert_eq!(s.frequency_count(&Value::Int(1)), 1);
        assert_eq!(s.frequency_count(&Value::Int(9)), 0);
        assert_eq!(s.frequent_items().len(), 3);
    }

    #[test]
    fn frequency_table_stays_bounded() {
        let values = ints(&(0..1000).collect::<Vec<_>>());
        let s = sketch_of(values);
        assert!(s.frequent_items().len() <= FREQUENT_ITEMS_CAPACITY);
    }

    #[test]
    fn welford_merge_matches_single_pass() {
        let values: Vec<f64> = (0..50).map(|i| (i as f64) * 0.7 - 3.0).collect();
        let one = Sketch::from_handle(&Handle::from_vec_partitioned(
            values.iter().copied().map(Value::Float).collect(),
            1,
        ))
        .unwrap();
        let many = Sketch::from_handle(&Handle::from_vec_partitioned(
            values.iter().copied().map(Value::Float).collect(),
            7,
        ))
        .unwrap();
        assert!((one.mean().unwrap() - many.mean().unwrap()).abs() < 1e-9);
        assert!((one.var().unwrap() - many.var().unwrap()).abs() < 1e-9);
    }

    #[test]
    fn distinct_estimate_is_close_at_high_cardinality() {
        let n = 20_000;
        let s = sketch_of(ints(&(0..n).collect::<Vec<_>>()));
        let est = s.num_unique() as f64;
        let err = (est - n as f64).abs() / n as f64;
        assert!(err < 0.2, "estimate {est} too far from {n}");
    }
}
