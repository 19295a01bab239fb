//! Constrained sampling of foreground-like branch sets.
//!
//! Samples preserve the observed clade-bin composition, keep each mark type
//! free of ancestor/descendant pairs, and (when trait loss is on) prefer
//! loss branches strictly below a sampled gain branch, falling back to
//! independent sampling when the dependent candidate pool runs dry.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{PhylopermError, Result};
use crate::mask::BranchMask;
use crate::tree::{CanonicalTree, NUM_CLADE_BINS};

/// Restart budget per sample before giving up.
pub const MAX_SAMPLE_ATTEMPTS: u64 = 200;
/// Shuffle budget per set build within one attempt.
pub const MAX_SET_SHUFFLES: u64 = 200;

/// Aggregated sampling effort counters, reported in run metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleCounters {
    pub attempts: u64,
    pub restarts: u64,
    pub fallback_independent: u64,
}

impl SampleCounters {
    pub fn merge(&mut self, other: &SampleCounters) {
        self.attempts += other.attempts;
        self.restarts += other.restarts;
        self.fallback_independent += other.fallback_independent;
    }
}

/// Sampler for one observed foreground configuration.
pub struct PermutationSampler<'t> {
    tree: &'t CanonicalTree,
    include_trait_loss: bool,
    obs_mask_10: BranchMask,
    bin_counts_01: [usize; NUM_CLADE_BINS],
    bin_counts_10: [usize; NUM_CLADE_BINS],
    candidates_by_bin: Vec<Vec<usize>>,
}

impl<'t> PermutationSampler<'t> {
    /// # Arguments
    /// * `tree` - canonical tree providing bins and topology masks
    /// * `obs_mask_01` / `obs_mask_10` - observed foreground branch sets
    /// * `include_trait_loss` - whether 1->0 branches participate at all
    pub fn new(
        tree: &'t CanonicalTree,
        obs_mask_01: &BranchMask,
        obs_mask_10: &BranchMask,
        include_trait_loss: bool,
    ) -> Result<Self> {
        let obs_mask_10 = if include_trait_loss {
            obs_mask_10.clone()
        } else {
            BranchMask::zeros(tree.n_branches())
        };

        let bin_counts_01 = bin_counts(obs_mask_01, &tree.clade_bin_by_branch_index);
        let bin_counts_10 = bin_counts(&obs_mask_10, &tree.clade_bin_by_branch_index);

        let mut candidates_by_bin = vec![Vec::new(); NUM_CLADE_BINS];
        for (idx, &b) in tree.clade_bin_by_branch_index.iter().enumerate() {
            candidates_by_bin[b as usize].push(idx);
        }

        // Demand can never exceed capacity for sets derived from the tree
        // itself; a violation means the inputs are inconsistent.
        for b in 0..NUM_CLADE_BINS {
            let demand = bin_counts_01[b] + bin_counts_10[b];
            if demand > candidates_by_bin[b].len() {
                return Err(PhylopermError::InvalidArgument(format!(
                    "clade bin {b} demands {demand} branches but only {} exist",
                    candidates_by_bin[b].len()
                )));
            }
        }

        Ok(Self {
            tree,
            include_trait_loss,
            obs_mask_10,
            bin_counts_01,
            bin_counts_10,
            candidates_by_bin,
        })
    }

    /// Generate one constrained sample from the given seed.
    ///
    /// Returns the `(S01, S10)` pair plus the effort counters for this
    /// sample. Exhausting the restart budget is fatal.
    pub fn generate_one(&self, seed: u64) -> Result<(BranchMask, BranchMask, SampleCounters)> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut counters = SampleCounters::default();

        for _ in 0..MAX_SAMPLE_ATTEMPTS {
            counters.attempts += 1;
            if let Some((m01, m10)) = self.try_sample(&mut rng, &mut counters) {
                return Ok((m01, m10, counters));
            }
            counters.restarts += 1;
        }

        Err(PhylopermError::SamplingExhausted {
            attempts: counters.attempts,
        })
    }

    fn try_sample(
        &self,
        rng: &mut StdRng,
        counters: &mut SampleCounters,
    ) -> Option<(BranchMask, BranchMask)> {
        let m01 = self.sample_set(&self.bin_counts_01, &self.tree.all_mask, rng)?;

        if !self.include_trait_loss || self.obs_mask_10.is_empty() {
            return Some((m01, BranchMask::zeros(self.tree.n_branches())));
        }

        let allowed_10 = if m01.is_empty() {
            // No gain branches to descend from; sample losses freely.
            self.tree.all_mask.clone()
        } else {
            let dependent = self.descendants_of(&m01).difference(&m01);
            if self.has_bin_capacity(&dependent, &self.bin_counts_10) {
                dependent
            } else {
                counters.fallback_independent += 1;
                self.tree.all_mask.clone()
            }
        };

        let m10 = self.sample_set(&self.bin_counts_10, &allowed_10, rng)?;
        Some((m01, m10))
    }

    /// Draw a set matching `bin_counts` from `allowed`, rejecting
    /// ancestor/descendant pairs within the set.
    fn sample_set(
        &self,
        bin_counts: &[usize; NUM_CLADE_BINS],
        allowed: &BranchMask,
        rng: &mut StdRng,
    ) -> Option<BranchMask> {
        let target_total: usize = bin_counts.iter().sum();
        if target_total == 0 {
            return Some(BranchMask::zeros(self.tree.n_branches()));
        }
        if !self.has_bin_capacity(allowed, bin_counts) {
            return None;
        }

        // Hardest bins first: fewest allowed candidates, then largest
        // demand.
        let mut order: Vec<usize> = (0..NUM_CLADE_BINS).filter(|&b| bin_counts[b] > 0).collect();
        order.sort_by_key(|&b| {
            (
                self.allowed_count(b, allowed),
                usize::MAX - bin_counts[b],
            )
        });

        let anc = &self.tree.anc_mask_by_branch_index;
        let desc = &self.tree.desc_mask_by_branch_index;

        for _ in 0..MAX_SET_SHUFFLES {
            let mut selected = BranchMask::zeros(self.tree.n_branches());
            let mut ok = true;

            for &b in &order {
                let need = bin_counts[b];
                let mut pool: Vec<usize> = self.candidates_by_bin[b]
                    .iter()
                    .copied()
                    .filter(|&idx| allowed.contains(idx))
                    .collect();
                pool.shuffle(rng);

                let mut picked = 0;
                for idx in pool {
                    if picked >= need {
                        break;
                    }
                    let conflict =
                        anc[idx].intersects(&selected) || desc[idx].intersects(&selected);
                    if conflict {
                        continue;
                    }
                    selected.set(idx);
                    picked += 1;
                }

                if picked < need {
                    ok = false;
                    break;
                }
            }

            if ok && selected.count_ones() == target_total {
                return Some(selected);
            }
        }
        None
    }

    /// Strict descendant closure of a branch set.
    fn descendants_of(&self, mask: &BranchMask) -> BranchMask {
        let mut out = BranchMask::zeros(self.tree.n_branches());
        for idx in mask.iter_ones() {
            out.union_with(&self.tree.desc_mask_by_branch_index[idx]);
        }
        out
    }

    fn allowed_count(&self, bin: usize, allowed: &BranchMask) -> usize {
        self.candidates_by_bin[bin]
            .iter()
            .filter(|&&idx| allowed.contains(idx))
            .count()
    }

    fn has_bin_capacity(&self, allowed: &BranchMask, bin_counts: &[usize; NUM_CLADE_BINS]) -> bool {
        (0..NUM_CLADE_BINS)
            .all(|b| bin_counts[b] == 0 || self.allowed_count(b, allowed) >= bin_counts[b])
    }
}

/// Count of set bits per clade bin.
pub fn bin_counts(mask: &BranchMask, bin_by_index: &[u8]) -> [usize; NUM_CLADE_BINS] {
    let mut out = [0usize; NUM_CLADE_BINS];
    for idx in mask.iter_ones() {
        out[bin_by_index[idx] as usize] += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::canonical_tree_from_newick;

    const NEWICK: &str =
        "((A<0>_0:1.0,B<1>_1:1.0)<2>_0:1.0,(C<3>_1:1.0,D<4>_0:1.0)<5>_1:1.0)<6>_0;";

    fn mask_of(tree: &CanonicalTree, keys: &[&str]) -> BranchMask {
        let indices: Vec<usize> = keys.iter().map(|k| tree.branch_index_by_key[*k]).collect();
        BranchMask::from_indices(tree.n_branches(), &indices)
    }

    #[test]
    fn test_no_ancestor_pairs_within_set() {
        let tree = canonical_tree_from_newick(NEWICK).unwrap();
        // Observed set deliberately contains an ancestor/descendant pair, so
        // every valid sample must find alternatives with the same bin counts.
        let obs_01 = mask_of(&tree, &["<2>", "A<0>"]);
        let obs_10 = BranchMask::zeros(tree.n_branches());
        let sampler = PermutationSampler::new(&tree, &obs_01, &obs_10, false).unwrap();

        for seed in 0..50u64 {
            let (m01, _, _) = sampler.generate_one(seed).unwrap();
            let indices: Vec<usize> = m01.iter_ones().collect();
            for &i in &indices {
                for &j in &indices {
                    if i != j {
                        assert!(!tree.anc_mask_by_branch_index[i].contains(j));
                        assert!(!tree.desc_mask_by_branch_index[i].contains(j));
                    }
                }
            }
        }
    }

    #[test]
    fn test_bin_counts_preserved() {
        let tree = canonical_tree_from_newick(NEWICK).unwrap();
        let obs_01 = mask_of(&tree, &["<2>", "<5>"]);
        let obs_10 = mask_of(&tree, &["A<0>"]);
        let sampler = PermutationSampler::new(&tree, &obs_01, &obs_10, true).unwrap();

        let expected_01 = bin_counts(&obs_01, &tree.clade_bin_by_branch_index);
        let expected_10 = bin_counts(&obs_10, &tree.clade_bin_by_branch_index);

        for seed in 0..60u64 {
            let (m01, m10, _) = sampler.generate_one(seed).unwrap();
            assert_eq!(bin_counts(&m01, &tree.clade_bin_by_branch_index), expected_01);
            assert_eq!(bin_counts(&m10, &tree.clade_bin_by_branch_index), expected_10);
        }
    }

    #[test]
    fn test_loss_branches_descend_from_gain() {
        let tree = canonical_tree_from_newick(NEWICK).unwrap();
        let obs_01 = mask_of(&tree, &["<2>"]);
        let obs_10 = mask_of(&tree, &["A<0>"]);
        let sampler = PermutationSampler::new(&tree, &obs_01, &obs_10, true).unwrap();

        for seed in 0..80u64 {
            let (m01, m10, counters) = sampler.generate_one(seed).unwrap();
            if counters.fallback_independent > 0 {
                continue;
            }
            for idx10 in m10.iter_ones() {
                let below_some_gain = m01
                    .iter_ones()
                    .any(|idx01| tree.desc_mask_by_branch_index[idx01].contains(idx10));
                assert!(below_some_gain);
            }
        }
    }

    #[test]
    fn test_zero_gain_nonzero_loss_edge_case() {
        let tree = canonical_tree_from_newick(NEWICK).unwrap();
        let obs_01 = BranchMask::zeros(tree.n_branches());
        let obs_10 = mask_of(&tree, &["A<0>", "C<3>"]);
        let sampler = PermutationSampler::new(&tree, &obs_01, &obs_10, true).unwrap();

        let expected_10 = bin_counts(&obs_10, &tree.clade_bin_by_branch_index);
        for seed in 0..40u64 {
            let (m01, m10, _) = sampler.generate_one(seed).unwrap();
            assert!(m01.is_empty());
            assert_eq!(bin_counts(&m10, &tree.clade_bin_by_branch_index), expected_10);
        }
    }

    #[test]
    fn test_loss_excluded_when_flag_off() {
        let tree = canonical_tree_from_newick(NEWICK).unwrap();
        let obs_01 = mask_of(&tree, &["<2>"]);
        let obs_10 = mask_of(&tree, &["A<0>"]);
        let sampler = PermutationSampler::new(&tree, &obs_01, &obs_10, false).unwrap();

        let (_, m10, _) = sampler.generate_one(3).unwrap();
        assert!(m10.is_empty());
    }

    #[test]
    fn test_same_seed_same_sample() {
        let tree = canonical_tree_from_newick(NEWICK).unwrap();
        let obs_01 = mask_of(&tree, &["<2>", "<5>"]);
        let obs_10 = mask_of(&tree, &["A<0>"]);
        let sampler = PermutationSampler::new(&tree, &obs_01, &obs_10, true).unwrap();

        let (a01, a10, _) = sampler.generate_one(99).unwrap();
        let (b01, b10, _) = sampler.generate_one(99).unwrap();
        assert_eq!(a01, b01);
        assert_eq!(a10, b10);
    }
}
