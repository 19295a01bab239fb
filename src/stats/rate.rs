//! Rate-mode association statistics.
//!
//! Per-branch rates are `delta / length`; the statistic is the mean of
//! direction-signed rates over a branch-set split, with loss-type branches
//! contributing with flipped sign.

use crate::mask::{count_ones, sum_over, BranchMask};
use crate::stats::DirectionSign;

/// Signed mean rate over a `(S01, S10)` branch-set pair.
///
/// NaN for an empty set; callers treat NaN permutation statistics as never
/// reaching the observed value.
#[inline]
pub fn rate_stat(rates: &[f64], mask_01: &[u64], mask_10: &[u64], direction: DirectionSign) -> f64 {
    let n = count_ones(mask_01) + count_ones(mask_10);
    if n == 0 {
        return f64::NAN;
    }
    let s01 = sum_over(mask_01, rates);
    let s10 = sum_over(mask_10, rates);
    direction.as_f64() * (s01 - s10) / n as f64
}

/// Foreground/background signed-rate location summary.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSummary {
    pub fg_mean_signed_rate: Option<f64>,
    pub bg_mean_signed_rate: Option<f64>,
    pub fg_median_signed_rate: Option<f64>,
    pub bg_median_signed_rate: Option<f64>,
}

/// Mean and median signed rates inside and outside the foreground.
pub fn rate_summary(
    rates: &[f64],
    fg_01_mask: &BranchMask,
    fg_10_mask: &BranchMask,
    all_mask: &BranchMask,
    direction: DirectionSign,
) -> RateSummary {
    let sign = direction.as_f64();

    let mut fg_vals: Vec<f64> = Vec::new();
    for idx in fg_01_mask.iter_ones() {
        fg_vals.push(sign * rates[idx]);
    }
    for idx in fg_10_mask.iter_ones() {
        fg_vals.push(-sign * rates[idx]);
    }

    let fg_mask = fg_01_mask.union(fg_10_mask);
    let bg_mask = all_mask.difference(&fg_mask);
    let bg_vals: Vec<f64> = bg_mask.iter_ones().map(|idx| sign * rates[idx]).collect();

    RateSummary {
        fg_mean_signed_rate: mean(&fg_vals),
        bg_mean_signed_rate: mean(&bg_vals),
        fg_median_signed_rate: median(&fg_vals),
        bg_median_signed_rate: median(&bg_vals),
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_stat_gain() {
        let rates = vec![2.0, -1.0, 0.5, 0.0];
        let m01 = BranchMask::from_indices(4, &[0, 2]);
        let m10 = BranchMask::from_indices(4, &[1]);
        // (2.0 + 0.5 - (-1.0)) / 3 = 3.5 / 3
        let s = rate_stat(&rates, m01.words(), m10.words(), DirectionSign::Gain);
        assert!((s - 3.5 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_rate_stat_loss_flips() {
        let rates = vec![2.0, -1.0];
        let m01 = BranchMask::from_indices(2, &[0]);
        let m10 = BranchMask::zeros(2);
        let gain = rate_stat(&rates, m01.words(), m10.words(), DirectionSign::Gain);
        let loss = rate_stat(&rates, m01.words(), m10.words(), DirectionSign::Loss);
        assert_eq!(gain, -loss);
    }

    #[test]
    fn test_rate_stat_empty_is_nan() {
        let rates = vec![1.0];
        let empty = BranchMask::zeros(1);
        assert!(rate_stat(&rates, empty.words(), empty.words(), DirectionSign::Gain).is_nan());
    }

    #[test]
    fn test_rate_summary() {
        let rates = vec![2.0, 0.0, 0.0, 0.0];
        let fg01 = BranchMask::from_indices(4, &[0]);
        let fg10 = BranchMask::zeros(4);
        let all = BranchMask::ones(4);
        let summary = rate_summary(&rates, &fg01, &fg10, &all, DirectionSign::Gain);
        assert_eq!(summary.fg_mean_signed_rate, Some(2.0));
        assert_eq!(summary.bg_mean_signed_rate, Some(0.0));
        assert_eq!(summary.fg_median_signed_rate, Some(2.0));
        assert_eq!(summary.bg_median_signed_rate, Some(0.0));
    }
}
