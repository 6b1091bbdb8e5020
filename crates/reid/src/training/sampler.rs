//! Identity-balanced batch sampling (P identities × K instances).
//!
//! The catalog groups sample indices by identity. Each epoch the sampler
//! shuffles every identity's samples into disjoint K-sized draws, then
//! repeatedly picks P identities uniformly from the pool of identities that
//! still have draws left. All randomness flows from one `StdRng` seeded in
//! [`IdentityBatchSampler::reset`], so a seed and a catalog fully determine
//! the batch sequence.

use std::collections::{BTreeMap, VecDeque};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::ExperimentConfig;
use crate::error::TrainError;

/// Dense identity index over a dataset.
///
/// Identity keys are mapped to class ids `0..num_identities` in ascending key
/// order, so the mapping does not depend on the order samples are listed in.
#[derive(Debug, Clone)]
pub struct IdentityCatalog {
    /// Class id of every sample, indexed by sample position.
    labels: Vec<usize>,
    /// Sample positions per class id.
    members: Vec<Vec<usize>>,
}

impl IdentityCatalog {
    /// Build a catalog from per-sample identity keys (sample `i` has key `keys[i]`).
    pub fn from_identities<K, I>(keys: I) -> Self
    where
        K: Ord + Clone,
        I: IntoIterator<Item = K>,
    {
        let keys: Vec<K> = keys.into_iter().collect();
        let mut class_ids: BTreeMap<K, usize> = BTreeMap::new();
        for key in &keys {
            class_ids.entry(key.clone()).or_insert(0);
        }
        for (dense, id) in class_ids.values_mut().enumerate() {
            *id = dense;
        }

        let mut members = vec![Vec::new(); class_ids.len()];
        let labels: Vec<usize> = keys
            .iter()
            .enumerate()
            .map(|(sample, key)| {
                let class = class_ids[key];
                members[class].push(sample);
                class
            })
            .collect();

        IdentityCatalog { labels, members }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True when the catalog holds no samples.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of distinct identities.
    pub fn num_identities(&self) -> usize {
        self.members.len()
    }

    /// Class id of a sample.
    pub fn label(&self, sample: usize) -> Option<usize> {
        self.labels.get(sample).copied()
    }

    /// Class ids for a batch of sample indices.
    pub fn labels_for(&self, batch: &[usize]) -> Result<Vec<usize>, TrainError> {
        batch
            .iter()
            .map(|&i| {
                self.label(i).ok_or_else(|| {
                    TrainError::InvalidBatch(format!(
                        "sample index {i} outside catalog of {} samples",
                        self.len()
                    ))
                })
            })
            .collect()
    }

    /// Sample positions belonging to a class id.
    pub fn members(&self, class: usize) -> &[usize] {
        &self.members[class]
    }
}

/// Random identity sampler: every batch holds `P = B / K` distinct identities
/// with exactly `K` samples each.
///
/// Identities with fewer than `K` samples are drawn with replacement.
/// An epoch is exactly [`batches_per_epoch`](Self::batches_per_epoch)
/// batches. Once fewer than `P` identities still have draws left, each
/// remaining batch is topped up with fresh draws from already-exhausted
/// identities, so every batch has size exactly `B`. Draws left over after the
/// last batch are dropped.
pub struct IdentityBatchSampler {
    catalog: IdentityCatalog,
    batch_size: usize,
    num_instances: usize,
    pending: VecDeque<Vec<usize>>,
}

impl IdentityBatchSampler {
    /// Create a sampler for batches of `batch_size` with `num_instances` per identity.
    ///
    /// # Errors
    /// `Config` if `num_instances == 0` or `batch_size` is not a positive
    /// multiple of it; `InsufficientIdentities` if the catalog has fewer than
    /// `batch_size / num_instances` identities.
    pub fn new(
        catalog: IdentityCatalog,
        batch_size: usize,
        num_instances: usize,
    ) -> Result<Self, TrainError> {
        if num_instances == 0 {
            return Err(TrainError::config("num_instances must be > 0"));
        }
        if batch_size == 0 || batch_size % num_instances != 0 {
            return Err(TrainError::config(format!(
                "batch_size ({batch_size}) must be a positive multiple of num_instances ({num_instances})"
            )));
        }
        check_identities(&catalog, batch_size / num_instances)?;
        tracing::debug!(
            samples = catalog.len(),
            identities = catalog.num_identities(),
            batch_size,
            num_instances,
            "IdentityBatchSampler initialized"
        );
        Ok(IdentityBatchSampler {
            catalog,
            batch_size,
            num_instances,
            pending: VecDeque::new(),
        })
    }

    /// Build from the `sampler.*` and `train.batch_size` config fields.
    pub fn from_config(
        config: &ExperimentConfig,
        catalog: IdentityCatalog,
    ) -> Result<Self, TrainError> {
        Self::new(catalog, config.train.batch_size, config.sampler.num_instances)
    }

    /// Identities per batch (P).
    pub fn identities_per_batch(&self) -> usize {
        self.batch_size / self.num_instances
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_instances(&self) -> usize {
        self.num_instances
    }

    pub fn catalog(&self) -> &IdentityCatalog {
        &self.catalog
    }

    /// Swap in a rebuilt catalog. Pending batches of the old catalog are dropped.
    pub fn set_catalog(&mut self, catalog: IdentityCatalog) -> Result<(), TrainError> {
        check_identities(&catalog, self.identities_per_batch())?;
        self.catalog = catalog;
        self.pending.clear();
        Ok(())
    }

    /// Number of batches in an epoch: `max(1, total_draws / P)`.
    pub fn batches_per_epoch(&self) -> usize {
        let k = self.num_instances;
        let draws: usize = self
            .catalog
            .members
            .iter()
            .map(|m| m.len().max(k) / k)
            .sum();
        (draws / self.identities_per_batch()).max(1)
    }

    /// Plan the batches of a new epoch from `epoch_seed`.
    pub fn reset(&mut self, epoch_seed: u64) {
        let mut rng = StdRng::seed_from_u64(epoch_seed);
        let k = self.num_instances;
        let p = self.identities_per_batch();

        let mut draws: Vec<VecDeque<Vec<usize>>> = self
            .catalog
            .members
            .iter()
            .map(|samples| {
                let mut idxs: Vec<usize> = if samples.len() < k {
                    (0..k)
                        .map(|_| samples[rng.gen_range(0..samples.len())])
                        .collect()
                } else {
                    samples.clone()
                };
                idxs.shuffle(&mut rng);
                idxs.chunks_exact(k).map(|c| c.to_vec()).collect()
            })
            .collect();

        let mut pool: Vec<usize> = (0..draws.len()).filter(|&c| !draws[c].is_empty()).collect();
        let num_batches = self.batches_per_epoch();
        let mut pending = VecDeque::with_capacity(num_batches);
        let mut topped_up = 0usize;

        // A batch takes at most P draws and num_batches * P <= total draws,
        // so the pool cannot run dry before the last batch.
        while pending.len() < num_batches && !pool.is_empty() {
            let mut batch = Vec::with_capacity(self.batch_size);
            let picked: Vec<usize> = if pool.len() >= p {
                pool.choose_multiple(&mut rng, p).copied().collect()
            } else {
                pool.clone()
            };
            for &class in &picked {
                if let Some(draw) = draws[class].pop_front() {
                    batch.extend(draw);
                }
            }

            if picked.len() < p {
                topped_up += 1;
                let exhausted: Vec<usize> = (0..draws.len())
                    .filter(|c| !picked.contains(c))
                    .collect();
                for &class in exhausted.choose_multiple(&mut rng, p - picked.len()) {
                    batch.extend(self.fresh_draw(class, &mut rng));
                }
            }

            pool.retain(|&c| !draws[c].is_empty());
            pending.push_back(batch);
        }

        let dropped_draws: usize = draws.iter().map(VecDeque::len).sum();
        tracing::debug!(
            epoch_seed,
            batches = pending.len(),
            topped_up,
            dropped_draws,
            "Planned sampler epoch"
        );
        self.pending = pending;
    }

    /// Next batch of sample indices, or `None` once the epoch is exhausted.
    pub fn next_batch(&mut self) -> Option<Vec<usize>> {
        self.pending.pop_front()
    }

    /// Batches left in the current epoch.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// K samples of one identity: without replacement when it has at least K.
    fn fresh_draw(&self, class: usize, rng: &mut StdRng) -> Vec<usize> {
        let samples = &self.catalog.members[class];
        if samples.len() >= self.num_instances {
            samples
                .choose_multiple(rng, self.num_instances)
                .copied()
                .collect()
        } else {
            (0..self.num_instances)
                .map(|_| samples[rng.gen_range(0..samples.len())])
                .collect()
        }
    }
}

impl Iterator for IdentityBatchSampler {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}

fn check_identities(catalog: &IdentityCatalog, required: usize) -> Result<(), TrainError> {
    let available = catalog.num_identities();
    if available < required {
        return Err(TrainError::InsufficientIdentities { available, required });
    }
    Ok(())
}

/// Per-epoch sampler seed derived from the run seed.
///
/// Depends only on `(run_seed, epoch)`, so a run resumed at any epoch
/// replays the same batches as an uninterrupted one.
pub fn derive_epoch_seed(run_seed: u64, epoch: usize) -> u64 {
    // splitmix64 finalizer
    let mut z = run_seed ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    /// Identity `i` gets `counts[i]` consecutive samples.
    fn catalog(counts: &[usize]) -> IdentityCatalog {
        let keys: Vec<u32> = counts
            .iter()
            .enumerate()
            .flat_map(|(id, &n)| std::iter::repeat(id as u32).take(n))
            .collect();
        IdentityCatalog::from_identities(keys)
    }

    fn per_identity(batch: &[usize], cat: &IdentityCatalog) -> HashMap<usize, usize> {
        let mut counts = HashMap::new();
        for &i in batch {
            *counts.entry(cat.label(i).unwrap()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_catalog_dense_ids_follow_key_order() {
        let cat = IdentityCatalog::from_identities(vec!["zed", "amy", "zed", "bob"]);
        assert_eq!(cat.num_identities(), 3);
        assert_eq!(cat.label(0), Some(2)); // zed
        assert_eq!(cat.label(1), Some(0)); // amy
        assert_eq!(cat.label(3), Some(1)); // bob
        assert_eq!(cat.members(2), &[0, 2]);
        assert_eq!(cat.label(4), None);
    }

    #[test]
    fn test_labels_for_out_of_range() {
        let cat = catalog(&[2, 2]);
        assert_eq!(cat.labels_for(&[0, 3]).unwrap(), vec![0, 1]);
        assert!(matches!(
            cat.labels_for(&[4]),
            Err(TrainError::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_batch_size_not_multiple_of_instances() {
        let err = IdentityBatchSampler::new(catalog(&[4; 8]), 10, 4).err().unwrap();
        assert!(matches!(err, TrainError::Config(_)));
        let err = IdentityBatchSampler::new(catalog(&[4; 8]), 8, 0).err().unwrap();
        assert!(matches!(err, TrainError::Config(_)));
    }

    #[test]
    fn test_insufficient_identities() {
        // 3 identities, K=4, B=16 → P=4 > 3.
        let err = IdentityBatchSampler::new(catalog(&[2, 2, 2]), 16, 4).err().unwrap();
        match err {
            TrainError::InsufficientIdentities { available, required } => {
                assert_eq!(available, 3);
                assert_eq!(required, 4);
            }
            other => panic!("expected InsufficientIdentities, got {other:?}"),
        }
    }

    #[test]
    fn test_small_identities_sampled_with_replacement() {
        // 3 identities with 2 samples each, K=4, B=8 (P=2): each identity
        // yields one draw of 4 (duplicates); 3 draws make one batch.
        let cat = catalog(&[2, 2, 2]);
        let mut sampler = IdentityBatchSampler::new(cat.clone(), 8, 4).unwrap();
        sampler.reset(7);
        let batches: Vec<Vec<usize>> = sampler.by_ref().collect();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.len(), 8);
        let counts = per_identity(batch, &cat);
        assert_eq!(counts.len(), 2);
        assert!(counts.values().all(|&n| n == 4));
        // Only 2 distinct samples exist per identity, so duplicates must appear.
        let distinct: HashSet<usize> = batch.iter().copied().collect();
        assert!(distinct.len() <= 4);
    }

    #[test]
    fn test_skewed_catalog_tops_up_every_short_batch() {
        // Identity 0 has 10 draws, identities 1 and 2 one each: 12 draws,
        // P=2 → 6 batches. After 1 and 2 are spent, identity 0 is paired
        // with a fresh draw of an exhausted identity.
        let cat = catalog(&[40, 4, 4]);
        let mut sampler = IdentityBatchSampler::new(cat.clone(), 8, 4).unwrap();
        assert_eq!(sampler.batches_per_epoch(), 6);
        for epoch in 0..5 {
            sampler.reset(derive_epoch_seed(5, epoch));
            assert_eq!(sampler.remaining(), 6);
            let batches: Vec<Vec<usize>> = sampler.by_ref().collect();
            assert_eq!(batches.len(), 6);

            let mut dominant = Vec::new();
            for batch in &batches {
                let counts = per_identity(batch, &cat);
                assert_eq!(counts.len(), 2);
                assert!(counts.values().all(|&n| n == 4));
                dominant.extend(batch.iter().copied().filter(|&s| cat.label(s) == Some(0)));
            }
            // Identity 0 is never topped up, so its draws stay disjoint.
            let distinct: HashSet<usize> = dominant.iter().copied().collect();
            assert_eq!(distinct.len(), dominant.len());
            assert!(dominant.len() >= 5 * 4);
        }
    }

    #[test]
    fn test_every_batch_is_p_by_k() {
        let cat = catalog(&[5, 9, 4, 12, 3, 7, 8, 6, 10, 4]);
        let mut sampler = IdentityBatchSampler::new(cat.clone(), 16, 4).unwrap();
        for epoch in 0..5 {
            sampler.reset(derive_epoch_seed(42, epoch));
            let mut n = 0;
            while let Some(batch) = sampler.next_batch() {
                n += 1;
                assert_eq!(batch.len(), 16);
                let counts = per_identity(&batch, &cat);
                assert_eq!(counts.len(), 4, "P distinct identities");
                assert!(counts.values().all(|&c| c == 4), "K per identity: {counts:?}");
            }
            assert_eq!(n, sampler.batches_per_epoch());
        }
    }

    #[test]
    fn test_large_identities_without_replacement_within_epoch() {
        // Every identity has >= K samples and P = 1 (no top-up), so no sample
        // index repeats in an epoch.
        let cat = catalog(&[8, 8, 8, 8, 8, 8]);
        let mut sampler = IdentityBatchSampler::new(cat, 4, 4).unwrap();
        sampler.reset(3);
        let all: Vec<usize> = sampler.by_ref().flatten().collect();
        let distinct: HashSet<usize> = all.iter().copied().collect();
        assert_eq!(all.len(), 48);
        assert_eq!(distinct.len(), 48);
    }

    #[test]
    fn test_reset_is_deterministic() {
        let cat = catalog(&[5, 9, 4, 12, 3, 7, 8, 6]);
        let mut a = IdentityBatchSampler::new(cat.clone(), 8, 4).unwrap();
        let mut b = IdentityBatchSampler::new(cat, 8, 4).unwrap();
        a.reset(123);
        b.reset(123);
        let seq_a: Vec<Vec<usize>> = a.by_ref().collect();
        let seq_b: Vec<Vec<usize>> = b.by_ref().collect();
        assert_eq!(seq_a, seq_b);

        // Re-resetting the same sampler replays the same sequence.
        a.reset(123);
        let replay: Vec<Vec<usize>> = a.by_ref().collect();
        assert_eq!(replay, seq_a);

        a.reset(124);
        let other: Vec<Vec<usize>> = a.by_ref().collect();
        assert_ne!(other, seq_a);
    }

    #[test]
    fn test_set_catalog_revalidates() {
        let mut sampler = IdentityBatchSampler::new(catalog(&[4, 4, 4, 4]), 16, 4).unwrap();
        sampler.reset(1);
        assert!(sampler.remaining() > 0);
        let err = sampler.set_catalog(catalog(&[4, 4])).unwrap_err();
        assert!(matches!(err, TrainError::InsufficientIdentities { .. }));
        sampler.set_catalog(catalog(&[4, 4, 4, 4, 4])).unwrap();
        assert_eq!(sampler.remaining(), 0);
    }

    #[test]
    fn test_batches_per_epoch() {
        // draws: 2 + 1 + 1 + 3 = 7, P = 2 → 3
        let sampler = IdentityBatchSampler::new(catalog(&[8, 2, 5, 12]), 8, 4).unwrap();
        assert_eq!(sampler.batches_per_epoch(), 3);
    }

    #[test]
    fn test_derive_epoch_seed_distinct() {
        let seeds: HashSet<u64> = (0..100).map(|e| derive_epoch_seed(1, e)).collect();
        assert_eq!(seeds.len(), 100);
        assert_eq!(derive_epoch_seed(9, 3), derive_epoch_seed(9, 3));
    }
}
