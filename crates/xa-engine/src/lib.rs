//! A lazy, partitioned, in-process dataset engine.
//!
//! A [`Handle`] names a partitioned collection without holding its data:
//! transformations (`map`, `filter`, `zip`, ...) compose producer closures
//! and nothing runs until an action (`collect`, `count`, `reduce`, ...)
//! materializes the chain. Each handle carries a [`StructureTag`] recording
//! its partition lineage; two handles with equal tags are guaranteed to have
//! identical partition shapes, which lets `zip` pair elements positionally
//! instead of going through an indexed join.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use xa_types::{CastError, TypeError};

/// Default partition count for locally constructed datasets.
pub const DEFAULT_PARTITIONS: usize = 4;

/// An evaluation failed while materializing a handle.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Cast(#[from] CastError),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error("undefined element where a concrete value is required")]
    UndefinedElement,
    #[error("positional zip requires identically shaped inputs")]
    ShapeMismatch,
}

/// Partition-structure lineage marker.
///
/// Minted from a process-wide counter. Operations that keep a one-to-one
/// correspondence with their input (map-like transformations) propagate the
/// parent's tag; anything that can resize or reshuffle partitions mints a
/// fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StructureTag(u64);

static NEXT_TAG: AtomicU64 = AtomicU64::new(0);
static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(0);

impl StructureTag {
    #[must_use]
    pub fn fresh() -> Self {
        Self(NEXT_TAG.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

type Partitions<T> = Arc<Vec<Vec<T>>>;
type Producer<T> = Arc<dyn Fn() -> Result<Partitions<T>, EngineError> + Send + Sync>;

/// A lazy reference to a partitioned collection of `T`.
///
/// Cloning a handle is cheap and shares the persistence cache; dropping the
/// last clone releases any cached partitions.
pub struct Handle<T> {
    id: u64,
    tag: StructureTag,
    producer: Producer<T>,
    cache: Arc<Mutex<Option<Partitions<T>>>>,
    persisted: Arc<AtomicBool>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tag: self.tag,
            producer: Arc::clone(&self.producer),
            cache: Arc::clone(&self.cache),
            persisted: Arc::clone(&self.persisted),
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

fn chunk<T>(values: Vec<T>, num_partitions: usize) -> Vec<Vec<T>> {
    let parts = num_partitions.max(1);
    if values.is_empty() {
        return (0..parts).map(|_| Vec::new()).collect();
    }
    let size = values.len().div_ceil(parts);
    let mut out: Vec<Vec<T>> = Vec::with_capacity(parts);
    let mut iter = values.into_iter().peekable();
    while iter.peek().is_some() {
        out.push(iter.by_ref().take(size).collect());
    }
    while out.len() < parts {
        out.push(Vec::new());
    }
    out
}

impl<T: Clone + Send + Sync + 'static> Handle<T> {
    fn new(tag: StructureTag, producer: Producer<T>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, AtomicOrdering::Relaxed),
            tag,
            producer,
            cache: Arc::new(Mutex::new(None)),
            persisted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wrap local data, split into [`DEFAULT_PARTITIONS`] chunks.
    #[must_use]
    pub fn from_vec(values: Vec<T>) -> Self {
        Self::from_vec_partitioned(values, DEFAULT_PARTITIONS)
    }

    /// Wrap local data with an explicit partition count.
    #[must_use]
    pub fn from_vec_partitioned(values: Vec<T>, num_partitions: usize) -> Self {
        Self::from_partitions(chunk(values, num_partitions))
    }

    /// Wrap data that is already partitioned, preserving its shape.
    #[must_use]
    pub fn from_partitions(partitions: Vec<Vec<T>>) -> Self {
        let data: Partitions<T> = Arc::new(partitions);
        Self::new(StructureTag::fresh(), Arc::new(move || Ok(Arc::clone(&data))))
    }

    /// Lineage marker for zip planning.
    #[must_use]
    pub fn tag(&self) -> StructureTag {
        self.tag
    }

    /// Evaluate the producer chain, consulting the persistence cache.
    pub fn partitions(&self) -> Result<Partitions<T>, EngineError> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(parts) = cache.as_ref() {
                return Ok(Arc::clone(parts));
            }
        }
        trace!("handle {}: materializing", self.id);
        let parts = (self.producer)()?;
        if self.persisted.load(AtomicOrdering::Relaxed) {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            *cache = Some(Arc::clone(&parts));
        }
        Ok(parts)
    }

    /// Mark this handle for caching: the next materialization is retained
    /// and reused by later actions.
    pub fn persist(&self) -> &Self {
        self.persisted.store(true, AtomicOrdering::Relaxed);
        self
    }

    /// Drop the cache and stop retaining future materializations.
    pub fn unpersist(&self) {
        self.persisted.store(false, AtomicOrdering::Relaxed);
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = None;
    }

    /// One-to-one transformation; propagates the structure tag.
    pub fn map<U, F>(&self, f: F) -> Handle<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        trace!("handle {}: map", self.id);
        let parent = self.clone();
        Handle::new(
            self.tag,
            Arc::new(move || {
                let parts = parent.partitions()?;
                Ok(Arc::new(
                    parts.iter().map(|p| p.iter().map(&f).collect()).collect(),
                ))
            }),
        )
    }

    /// One-to-one transformation whose closure may fail; the first failure
    /// aborts materialization. Propagates the structure tag.
    pub fn try_map<U, F>(&self, f: F) -> Handle<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> Result<U, EngineError> + Send + Sync + 'static,
    {
        trace!("handle {}: try_map", self.id);
        let parent = self.clone();
        Handle::new(
            self.tag,
            Arc::new(move || {
                let parts = parent.partitions()?;
                let mut out = Vec::with_capacity(parts.len());
                for p in parts.iter() {
                    out.push(p.iter().map(&f).collect::<Result<Vec<U>, _>>()?);
                }
                Ok(Arc::new(out))
            }),
        )
    }

    /// Keep elements matching the predicate. Mints a fresh tag: partitions
    /// shrink unpredictably.
    pub fn filter<F>(&self, pred: F) -> Handle<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        trace!("handle {}: filter", self.id);
        let parent = self.clone();
        Handle::new(
            StructureTag::fresh(),
            Arc::new(move || {
                let parts = parent.partitions()?;
                Ok(Arc::new(
                    parts
                        .iter()
                        .map(|p| p.iter().filter(|v| pred(*v)).cloned().collect())
                        .collect(),
                ))
            }),
        )
    }

    /// Expand each element into zero or more outputs. Mints a fresh tag.
    pub fn flat_map<U, F>(&self, f: F) -> Handle<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> Vec<U> + Send + Sync + 'static,
    {
        let parent = self.clone();
        Handle::new(
            StructureTag::fresh(),
            Arc::new(move || {
                let parts = parent.partitions()?;
                Ok(Arc::new(
                    parts
                        .iter()
                        .map(|p| p.iter().flat_map(&f).collect())
                        .collect(),
                ))
            }),
        )
    }

    /// Fallible [`Handle::flat_map`].
    pub fn try_flat_map<U, F>(&self, f: F) -> Handle<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> Result<Vec<U>, EngineError> + Send + Sync + 'static,
    {
        let parent = self.clone();
        Handle::new(
            StructureTag::fresh(),
            Arc::new(move || {
                let parts = parent.partitions()?;
                let mut out = Vec::with_capacity(parts.len());
                for p in parts.iter() {
                    let mut flat = Vec::new();
                    for v in p {
                        flat.extend(f(v)?);
                    }
                    out.push(flat);
                }
                Ok(Arc::new(out))
            }),
        )
    }

    /// Pair each element with its global position. One-to-one, so the
    /// structure tag is propagated.
    pub fn zip_with_index(&self) -> Handle<(T, usize)> {
        let parent = self.clone();
        Handle::new(
            self.tag,
            Arc::new(move || {
                let parts = parent.partitions()?;
                let mut next = 0usize;
                let mut out = Vec::with_capacity(parts.len());
                for p in parts.iter() {
                    out.push(
                        p.iter()
                            .map(|v| {
                                let i = next;
                                next += 1;
                                (v.clone(), i)
                            })
                            .collect(),
                    );
                }
                Ok(Arc::new(out))
            }),
        )
    }

    /// Pair this dataset with another of the same length.
    ///
    /// Equal structure tags guarantee identical partition shapes, so the
    /// pairing is a cheap positional walk. Differing tags fall back to an
    /// indexed join followed by a sort on position; that alignment is
    /// expensive, so its result is persisted.
    pub fn zip<U>(&self, other: &Handle<U>) -> Handle<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        if self.tag == other.tag {
            trace!("handles {}, {}: positional zip", self.id, other.id);
            let left = self.clone();
            let right = other.clone();
            return Handle::new(
                self.tag,
                Arc::new(move || {
                    let (pa, pb) = (left.partitions()?, right.partitions()?);
                    if pa.len() != pb.len()
                        || pa.iter().zip(pb.iter()).any(|(a, b)| a.len() != b.len())
                    {
                        return Err(EngineError::ShapeMismatch);
                    }
                    Ok(Arc::new(
                        pa.iter()
                            .zip(pb.iter())
                            .map(|(a, b)| a.iter().cloned().zip(b.iter().cloned()).collect())
                            .collect(),
                    ))
                }),
            );
        }
        debug!(
            "handles {}, {}: structure tags differ, aligning through indexed join",
            self.id, other.id
        );
        let left = self.zip_with_index().map(|p| (p.1, p.0.clone()));
        let right = other.zip_with_index().map(|p| (p.1, p.0.clone()));
        let aligned = left
            .join(&right)
            .sort_by(|a, b| a.0.cmp(&b.0))
            .map(|p| p.1.clone());
        aligned.persist();
        aligned
    }

    /// Totally ordered sort. Mints a fresh tag.
    pub fn sort_by<F>(&self, cmp: F) -> Handle<T>
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        let parent = self.clone();
        Handle::new(
            StructureTag::fresh(),
            Arc::new(move || {
                let parts = parent.partitions()?;
                let mut all: Vec<T> = parts.iter().flatten().cloned().collect();
                all.sort_by(&cmp);
                Ok(Arc::new(chunk(all, parts.len())))
            }),
        )
    }

    /// Deduplicate, keeping first occurrences in encounter order. Mints a
    /// fresh tag and collapses to a single partition.
    pub fn distinct(&self) -> Handle<T>
    where
        T: Eq + Hash,
    {
        let parent = self.clone();
        Handle::new(
            StructureTag::fresh(),
            Arc::new(move || {
                let parts = parent.partitions()?;
                let mut seen = HashSet::new();
                let mut out = Vec::new();
                for v in parts.iter().flatten() {
                    if seen.insert(v.clone()) {
                        out.push(v.clone());
                    }
                }
                Ok(Arc::new(vec![out]))
            }),
        )
    }

    /// Bernoulli sample. The seed is fixed when the handle is built so
    /// repeated materializations agree.
    pub fn sample(&self, fraction: f64, seed: Option<u64>) -> Handle<T> {
        let seed = seed.unwrap_or_else(rand::random);
        let parent = self.clone();
        Handle::new(
            StructureTag::fresh(),
            Arc::new(move || {
                let parts = parent.partitions()?;
                let mut rng = StdRng::seed_from_u64(seed);
                Ok(Arc::new(
                    parts
                        .iter()
                        .map(|p| {
                            p.iter()
                                .filter(|_| rng.gen_bool(fraction.clamp(0.0, 1.0)))
                                .cloned()
                                .collect()
                        })
                        .collect(),
                ))
            }),
        )
    }

    /// Concatenate two datasets. Mints a fresh tag.
    pub fn union(&self, other: &Handle<T>) -> Handle<T> {
        let left = self.clone();
        let right = other.clone();
        Handle::new(
            StructureTag::fresh(),
            Arc::new(move || {
                let (pa, pb) = (left.partitions()?, right.partitions()?);
                let mut out: Vec<Vec<T>> = pa.iter().cloned().collect();
                out.extend(pb.iter().cloned());
                Ok(Arc::new(out))
            }),
        )
    }

    /// Rebalance into `num_partitions` chunks. Mints a fresh tag.
    pub fn repartition(&self, num_partitions: usize) -> Handle<T> {
        let parent = self.clone();
        Handle::new(
            StructureTag::fresh(),
            Arc::new(move || {
                let parts = parent.partitions()?;
                let all: Vec<T> = parts.iter().flatten().cloned().collect();
                Ok(Arc::new(chunk(all, num_partitions)))
            }),
        )
    }

    // Actions: these materialize the chain.

    pub fn count(&self) -> Result<usize, EngineError> {
        Ok(self.partitions()?.iter().map(Vec::len).sum())
    }

    pub fn num_partitions(&self) -> Result<usize, EngineError> {
        Ok(self.partitions()?.len())
    }

    pub fn collect(&self) -> Result<Vec<T>, EngineError> {
        Ok(self.partitions()?.iter().flatten().cloned().collect())
    }

    pub fn take(&self, n: usize) -> Result<Vec<T>, EngineError> {
        Ok(self
            .partitions()?
            .iter()
            .flatten()
            .take(n)
            .cloned()
            .collect())
    }

    pub fn first(&self) -> Result<Option<T>, EngineError> {
        Ok(self.partitions()?.iter().flatten().next().cloned())
    }

    /// Left-to-right pairwise reduction; `None` on empty input.
    pub fn reduce<F>(&self, f: F) -> Result<Option<T>, EngineError>
    where
        F: Fn(&T, &T) -> T,
    {
        let parts = self.partitions()?;
        let mut acc: Option<T> = None;
        for v in parts.iter().flatten() {
            acc = Some(match acc {
                Some(a) => f(&a, v),
                None => v.clone(),
            });
        }
        Ok(acc)
    }

    /// Fold each partition from a copy of `zero`, then combine the partial
    /// results. `combine` must be associative for the answer to be
    /// partitioning-independent.
    pub fn aggregate<A, S, C>(&self, zero: A, seq: S, combine: C) -> Result<A, EngineError>
    where
        A: Clone,
        S: Fn(A, &T) -> A,
        C: Fn(A, A) -> A,
    {
        let parts = self.partitions()?;
        let mut acc = zero.clone();
        for p in parts.iter() {
            let partial = p.iter().fold(zero.clone(), &seq);
            acc = combine(acc, partial);
        }
        Ok(acc)
    }
}

impl<K, V> Handle<(K, V)>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Inner join on the first tuple component. Mints a fresh tag and
    /// collapses to a single partition; output order follows the left side.
    pub fn join<W>(&self, other: &Handle<(K, W)>) -> Handle<(K, (V, W))>
    where
        W: Clone + Send + Sync + 'static,
    {
        let left = self.clone();
        let right = other.clone();
        Handle::new(
            StructureTag::fresh(),
            Arc::new(move || {
                let (pl, pr) = (left.partitions()?, right.partitions()?);
                let mut table: HashMap<K, Vec<W>> = HashMap::new();
                for (k, w) in pr.iter().flatten() {
                    table.entry(k.clone()).or_default().push(w.clone());
                }
                let mut out = Vec::new();
                for (k, v) in pl.iter().flatten() {
                    if let Some(ws) = table.get(k) {
                        for w in ws {
                            out.push((k.clone(), (v.clone(), w.clone())));
                        }
                    }
                }
                Ok(Arc::new(vec![out]))
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ints(n: i64) -> Handle<i64> {
        Handle::from_vec((0..n).collect())
    }

    #[test]
    fn collect_preserves_order_across_partitions() {
        let h = Handle::from_vec_partitioned(vec![1, 2, 3, 4, 5], 3);
        assert_eq!(h.collect().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(h.count().unwrap(), 5);
        assert_eq!(h.num_partitions().unwrap(), 3);
    }

    #[test]
    fn transformations_are_lazy_until_an_action() {
        let evals = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&evals);
        let h = ints(10).map(move |v| {
            seen.fetch_add(1, AtomicOrdering::Relaxed);
            v * 2
        });
        assert_eq!(evals.load(AtomicOrdering::Relaxed), 0);
        assert_eq!(h.take(3).unwrap(), vec![0, 2, 4]);
        assert_eq!(evals.load(AtomicOrdering::Relaxed), 10);
    }

    #[test]
    fn persist_caches_a_single_materialization() {
        let evals = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&evals);
        let h = ints(4).map(move |v| {
            seen.fetch_add(1, AtomicOrdering::Relaxed);
            *v
        });
        h.persist();
        h.collect().unwrap();
        h.collect().unwrap();
        assert_eq!(evals.load(AtomicOrdering::Relaxed), 4);
        h.unpersist();
        h.collect().unwrap();
        assert_eq!(evals.load(AtomicOrdering::Relaxed), 8);
    }

    #[test]
    fn map_propagates_tag_filter_mints_fresh() {
        let h = ints(5);
        assert_eq!(h.map(|v| v + 1).tag(), h.tag());
        assert_eq!(h.try_map(|v| Ok(v + 1)).tag(), h.tag());
        assert_eq!(h.zip_with_index().tag(), h.tag());
        assert_ne!(h.filter(|_| true).tag(), h.tag());
        assert_ne!(h.sort_by(|a, b| a.cmp(b)).tag(), h.tag());
    }

    #[test]
    fn zip_with_equal_tags_pairs_positionally() {
        let a = ints(5);
        let b = a.map(|v| v * 10);
        let zipped = a.zip(&b);
        assert_eq!(zipped.tag(), a.tag());
        assert_eq!(
            zipped.collect().unwrap(),
            vec![(0, 0), (1, 10), (2, 20), (3, 30), (4, 40)]
        );
    }

    #[test]
    fn zip_with_differing_tags_aligns_by_index() {
        let a = Handle::from_vec_partitioned(vec![1, 2, 3, 4], 2);
        let b = Handle::from_vec_partitioned(vec![10, 20, 30, 40], 4);
        let zipped = a.zip(&b);
        assert_ne!(zipped.tag(), a.tag());
        assert_eq!(
            zipped.collect().unwrap(),
            vec![(1, 10), (2, 20), (3, 30), (4, 40)]
        );
    }

    #[test]
    fn zip_with_index_is_global() {
        let h = Handle::from_vec_partitioned(vec!['a', 'b', 'c', 'd'], 3);
        let idx: Vec<usize> = h.zip_with_index().collect().unwrap().into_iter().map(|p| p.1).collect();
        assert_eq!(idx, vec![0, 1, 2, 3]);
    }

    #[test]
    fn try_map_surfaces_the_first_failure() {
        let h = ints(5).try_map(|v| {
            if *v == 3 {
                Err(EngineError::UndefinedElement)
            } else {
                Ok(*v)
            }
        });
        assert_eq!(h.collect(), Err(EngineError::UndefinedElement));
    }

    #[test]
    fn distinct_keeps_first_occurrence_order() {
        let h = Handle::from_vec(vec![3, 1, 3, 2, 1]);
        assert_eq!(h.distinct().collect().unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn sample_is_deterministic_under_a_seed() {
        let h = ints(100);
        let a = h.sample(0.3, Some(7)).collect().unwrap();
        let b = h.sample(0.3, Some(7)).collect().unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty() && a.len() < 100);
    }

    #[test]
    fn union_concatenates() {
        let a = Handle::from_vec(vec![1, 2]);
        let b = Handle::from_vec(vec![3]);
        assert_eq!(a.union(&b).collect().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn aggregate_folds_partitions_then_combines() {
        let h = Handle::from_vec_partitioned((1..=10).collect(), 3);
        let sum = h.aggregate(0i64, |a, v| a + v, |a, b| a + b).unwrap();
        assert_eq!(sum, 55);
    }

    #[test]
    fn reduce_on_empty_is_none() {
        let h: Handle<i64> = Handle::from_vec(vec![]);
        assert_eq!(h.reduce(|a, b| a + b).unwrap(), None);
    }

    #[test]
    fn join_matches_keys() {
        let l = Handle::from_vec(vec![(1, 'a'), (2, 'b'), (3, 'c')]);
        let r = Handle::from_vec(vec![(2, "x"), (3, "y")]);
        let got = l.join(&r).collect().unwrap();
        assert_eq!(got, vec![(2, ('b', "x")), (3, ('c', "y"))]);
    }

    #[test]
    fn repartition_preserves_contents() {
        let h = ints(7).repartition(2);
        assert_eq!(h.num_partitions().unwrap(), 2);
        assert_eq!(h.collect().unwrap(), (0..7).collect::<Vec<_>>());
    }
}
