//! Binary-mode association statistics.
//!
//! Concordance is coincidence of a trait-transition branch with a
//! copy-number change in the direction under test. All counting is
//! mask-intersection popcounts over the canonical branch indexing.

use crate::mask::{and_count, BranchMask};
use crate::stats::DirectionSign;

/// Effective sign masks for one family under the direction convention and
/// optional CAFE-significance restriction.
///
/// `gain_mask` is intersected with gain-type transition branches,
/// `loss_mask` with loss-type ones; building them once per family keeps the
/// permutation loop to two AND-popcounts.
#[derive(Debug, Clone)]
pub struct BinaryStatContext {
    pub gain_mask: BranchMask,
    pub loss_mask: BranchMask,
}

impl BinaryStatContext {
    pub fn new(
        pos_mask: &BranchMask,
        neg_mask: &BranchMask,
        direction: DirectionSign,
        sig_mask: Option<&BranchMask>,
    ) -> Self {
        let use_pos = match sig_mask {
            Some(sig) => pos_mask.intersect(sig),
            None => pos_mask.clone(),
        };
        let use_neg = match sig_mask {
            Some(sig) => neg_mask.intersect(sig),
            None => neg_mask.clone(),
        };
        match direction {
            DirectionSign::Gain => Self {
                gain_mask: use_pos,
                loss_mask: use_neg,
            },
            DirectionSign::Loss => Self {
                gain_mask: use_neg,
                loss_mask: use_pos,
            },
        }
    }

    /// Concordant-branch count for a `(S01, S10)` branch-set pair.
    #[inline]
    pub fn stat(&self, mask_01: &[u64], mask_10: &[u64]) -> usize {
        and_count(mask_01, self.gain_mask.words()) + and_count(mask_10, self.loss_mask.words())
    }
}

/// Foreground/background 2×2 summary for one family.
#[derive(Debug, Clone, PartialEq)]
pub struct BinarySummary {
    pub fg_concordant_count: usize,
    pub fg_total: usize,
    pub bg_concordant_count: usize,
    pub bg_total: usize,
    pub fg_concordance_rate: Option<f64>,
    pub bg_concordance_rate: Option<f64>,
}

/// Build the 2×2 summary of concordance inside and outside the foreground.
pub fn binary_summary(
    ctx: &BinaryStatContext,
    fg_01_mask: &BranchMask,
    fg_10_mask: &BranchMask,
    all_mask: &BranchMask,
) -> BinarySummary {
    let fg_mask = fg_01_mask.union(fg_10_mask);
    let bg_mask = all_mask.difference(&fg_mask);

    let fg_conc = ctx.stat(fg_01_mask.words(), fg_10_mask.words());
    // Background branches carry no transition; count them against the
    // gain-type mask only.
    let bg_conc = and_count(bg_mask.words(), ctx.gain_mask.words());

    let fg_total = fg_mask.count_ones();
    let bg_total = bg_mask.count_ones();

    BinarySummary {
        fg_concordant_count: fg_conc,
        fg_total,
        bg_concordant_count: bg_conc,
        bg_total,
        fg_concordance_rate: if fg_total > 0 {
            Some(fg_conc as f64 / fg_total as f64)
        } else {
            None
        },
        bg_concordance_rate: if bg_total > 0 {
            Some(bg_conc as f64 / bg_total as f64)
        } else {
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(n: usize, bits: &[usize]) -> BranchMask {
        BranchMask::from_indices(n, bits)
    }

    #[test]
    fn test_gain_direction_stat() {
        let pos = mask(6, &[0, 2, 4]);
        let neg = mask(6, &[1]);
        let ctx = BinaryStatContext::new(&pos, &neg, DirectionSign::Gain, None);

        let fg01 = mask(6, &[0, 1]);
        let fg10 = mask(6, &[5]);
        // fg01 ∩ pos = {0}; fg10 ∩ neg = {} → 1.
        assert_eq!(ctx.stat(fg01.words(), fg10.words()), 1);
    }

    #[test]
    fn test_loss_direction_flips_signs() {
        let pos = mask(6, &[0, 2]);
        let neg = mask(6, &[1, 3]);
        let ctx = BinaryStatContext::new(&pos, &neg, DirectionSign::Loss, None);

        let fg01 = mask(6, &[1, 2]);
        let fg10 = mask(6, &[0]);
        // Loss: fg01 ∩ neg = {1}; fg10 ∩ pos = {0} → 2.
        assert_eq!(ctx.stat(fg01.words(), fg10.words()), 2);
    }

    #[test]
    fn test_significance_mask_restricts_counting() {
        let pos = mask(4, &[0, 1, 2]);
        let neg = mask(4, &[]);
        let sig = mask(4, &[0]);
        let ctx = BinaryStatContext::new(&pos, &neg, DirectionSign::Gain, Some(&sig));

        let fg01 = mask(4, &[0, 1]);
        let fg10 = mask(4, &[]);
        assert_eq!(ctx.stat(fg01.words(), fg10.words()), 1);
    }

    #[test]
    fn test_binary_summary() {
        let n = 5;
        let pos = mask(n, &[0, 1, 3]);
        let neg = mask(n, &[]);
        let ctx = BinaryStatContext::new(&pos, &neg, DirectionSign::Gain, None);

        let fg01 = mask(n, &[0, 2]);
        let fg10 = mask(n, &[]);
        let all = BranchMask::ones(n);
        let summary = binary_summary(&ctx, &fg01, &fg10, &all);

        assert_eq!(summary.fg_concordant_count, 1);
        assert_eq!(summary.fg_total, 2);
        assert_eq!(summary.bg_concordant_count, 2);
        assert_eq!(summary.bg_total, 3);
        assert_eq!(summary.fg_concordance_rate, Some(0.5));
    }
}
