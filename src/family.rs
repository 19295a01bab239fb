//! Per-family branch-change data model.
//!
//! Materializes sign masks once per family, plus per-branch rates in rate
//! mode and CAFE significance masks when branch-probability filtering is on.

use crate::error::{PhylopermError, Result};
use crate::io::FamilyMatrix;
use crate::mask::BranchMask;

/// One gene family's branch deltas with precomputed sign masks.
#[derive(Debug, Clone)]
pub struct FamilyData {
    pub id: String,
    pub deltas: Vec<i64>,
    pub pos_mask: BranchMask,
    pub neg_mask: BranchMask,
}

/// All families in change-table order.
#[derive(Debug, Clone)]
pub struct FamilyTable {
    pub families: Vec<FamilyData>,
    pub n_branches: usize,
}

impl FamilyTable {
    /// Build sign masks for every family of a loaded change matrix.
    pub fn from_matrix(matrix: FamilyMatrix, n_branches: usize) -> Self {
        let families = matrix
            .family_ids
            .into_iter()
            .zip(matrix.values)
            .map(|(id, deltas)| {
                let (pos_mask, neg_mask) = sign_masks(&deltas, n_branches);
                FamilyData {
                    id,
                    deltas,
                    pos_mask,
                    neg_mask,
                }
            })
            .collect();
        Self {
            families,
            n_branches,
        }
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}

/// Bitmasks over branches with positive and negative deltas.
pub fn sign_masks(deltas: &[i64], n_branches: usize) -> (BranchMask, BranchMask) {
    let mut pos = BranchMask::zeros(n_branches);
    let mut neg = BranchMask::zeros(n_branches);
    for (i, &d) in deltas.iter().enumerate() {
        if d > 0 {
            pos.set(i);
        } else if d < 0 {
            neg.set(i);
        }
    }
    (pos, neg)
}

/// Per-branch rates `delta / length`; every non-root length must be > 0.
pub fn build_rates(deltas: &[i64], branch_lengths: &[f64]) -> Result<Vec<f64>> {
    debug_assert_eq!(deltas.len(), branch_lengths.len());
    let mut out = Vec::with_capacity(deltas.len());
    for (i, (&d, &l)) in deltas.iter().zip(branch_lengths).enumerate() {
        if l <= 0.0 {
            return Err(PhylopermError::ZeroLengthBranch {
                preview: format!("branch index {i} has length {l}"),
            });
        }
        out.push(d as f64 / l);
    }
    Ok(out)
}

/// Bitmask of branches whose CAFE branch probability is at or below `alpha`.
///
/// `None` (family absent from the probability table) and NaN cells never set
/// a bit.
pub fn significance_mask(prob_vec: Option<&[f64]>, alpha: f64, n_branches: usize) -> BranchMask {
    let mut mask = BranchMask::zeros(n_branches);
    if let Some(probs) = prob_vec {
        for (i, &p) in probs.iter().enumerate() {
            if !p.is_nan() && p <= alpha {
                mask.set(i);
            }
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_masks() {
        let (pos, neg) = sign_masks(&[1, -2, 0, 3], 4);
        assert_eq!(pos.iter_ones().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(neg.iter_ones().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_build_rates() {
        let rates = build_rates(&[2, -1], &[1.0, 0.5]).unwrap();
        assert_eq!(rates, vec![2.0, -2.0]);
    }

    #[test]
    fn test_build_rates_rejects_zero_length() {
        let res = build_rates(&[2, -1], &[1.0, 0.0]);
        assert!(matches!(res, Err(PhylopermError::ZeroLengthBranch { .. })));
    }

    #[test]
    fn test_significance_mask() {
        let probs = vec![0.01, 0.05, 0.2, f64::NAN];
        let mask = significance_mask(Some(&probs), 0.05, 4);
        assert_eq!(mask.iter_ones().collect::<Vec<_>>(), vec![0, 1]);
        assert!(significance_mask(None, 0.05, 4).is_empty());
    }
}
