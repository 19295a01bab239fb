//! One-sided Fisher exact test over concordance 2×2 tables.
//!
//! The tested table is (foreground vs background) × (concordant vs not);
//! the one-sided tail is foreground enrichment. All mass is accumulated in
//! log-space with log-sum-exp.

use crate::error::{PhylopermError, Result};

/// One-sided Fisher exact p-value for foreground enrichment.
pub fn fisher_exact_one_sided(
    fg_concordant_count: usize,
    fg_total: usize,
    bg_concordant_count: usize,
    bg_total: usize,
) -> Result<f64> {
    if fg_concordant_count > fg_total {
        return Err(PhylopermError::InvalidArgument(
            "fg_concordant_count cannot exceed fg_total".to_string(),
        ));
    }
    if bg_concordant_count > bg_total {
        return Err(PhylopermError::InvalidArgument(
            "bg_concordant_count cannot exceed bg_total".to_string(),
        ));
    }

    let n_concordant = fg_concordant_count + bg_concordant_count;
    let (lower, upper) = support_bounds(fg_total, bg_total, n_concordant);
    let obs = fg_concordant_count;
    debug_assert!(obs >= lower && obs <= upper);

    let tail: Vec<f64> = (obs..=upper)
        .map(|x| hypergeom_log_pmf(x, fg_total, bg_total, n_concordant))
        .collect();
    Ok(logsumexp(&tail).exp().min(1.0))
}

/// Minimal attainable one-sided p-value for fixed margins: the PMF at the
/// upper support bound.
pub fn min_attainable_pvalue(fg_total: usize, bg_total: usize, total_concordant: usize) -> Result<f64> {
    if total_concordant > fg_total + bg_total {
        return Err(PhylopermError::InvalidArgument(
            "total_concordant cannot exceed fg_total + bg_total".to_string(),
        ));
    }
    let (_, upper) = support_bounds(fg_total, bg_total, total_concordant);
    Ok(hypergeom_log_pmf(upper, fg_total, bg_total, total_concordant)
        .exp()
        .min(1.0))
}

fn support_bounds(n_fg: usize, n_bg: usize, n_concordant: usize) -> (usize, usize) {
    let lower = n_concordant.saturating_sub(n_bg);
    let upper = n_fg.min(n_concordant);
    (lower, upper)
}

fn hypergeom_log_pmf(x: usize, n_fg: usize, n_bg: usize, n_concordant: usize) -> f64 {
    let total = n_fg + n_bg;
    if x > n_fg || n_concordant < x || n_concordant - x > n_bg {
        return f64::NEG_INFINITY;
    }
    log_choose(n_concordant, x) + log_choose(total - n_concordant, n_fg - x)
        - log_choose(total, n_fg)
}

fn log_choose(n: usize, k: usize) -> f64 {
    if k > n {
        return f64::NEG_INFINITY;
    }
    ln_gamma(n as f64 + 1.0) - ln_gamma(k as f64 + 1.0) - ln_gamma((n - k) as f64 + 1.0)
}

fn logsumexp(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NEG_INFINITY;
    }
    let vmax = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if vmax.is_infinite() {
        return vmax;
    }
    vmax + values.iter().map(|&v| (v - vmax).exp()).sum::<f64>().ln()
}

// Lanczos approximation (g = 7, 9 terms); accurate to ~15 significant
// digits for the positive arguments used here.
const LANCZOS_COEFFS: [f64; 9] = [
    0.999_999_999_999_809_93,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_13,
    -176.615_029_162_140_59,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_571_6e-6,
    1.505_632_735_149_311_6e-7,
];

/// Natural log of the gamma function for positive arguments.
fn ln_gamma(x: f64) -> f64 {
    debug_assert!(x > 0.0);
    if x < 0.5 {
        // Reflection formula.
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }

    let x = x - 1.0;
    let mut a = LANCZOS_COEFFS[0];
    for (i, &c) in LANCZOS_COEFFS.iter().enumerate().skip(1) {
        a += c / (x + i as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + a.ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ln_gamma_factorials() {
        // ln Γ(n+1) = ln n!
        let cases = [(1usize, 1.0f64), (2, 2.0), (3, 6.0), (5, 120.0), (10, 3628800.0)];
        for (n, fact) in cases {
            let got = ln_gamma(n as f64 + 1.0);
            assert!(
                (got - fact.ln()).abs() < 1e-10,
                "ln_gamma({}) = {got}",
                n + 1
            );
        }
    }

    #[test]
    fn test_log_choose_known_values() {
        assert!((log_choose(5, 2) - 10f64.ln()).abs() < 1e-10);
        assert!((log_choose(10, 3) - 120f64.ln()).abs() < 1e-10);
        assert_eq!(log_choose(3, 5), f64::NEG_INFINITY);
    }

    #[test]
    fn test_fisher_fully_concentrated_table() {
        // fg: 3/3 concordant, bg: 0/7 → p = 1 / C(10,3) = 1/120.
        let p = fisher_exact_one_sided(3, 3, 0, 7).unwrap();
        assert!((p - 1.0 / 120.0).abs() < 1e-12);
    }

    #[test]
    fn test_fisher_at_lower_support_is_one() {
        // Observed at the lower bound of the support: tail covers everything.
        let p = fisher_exact_one_sided(0, 3, 3, 7).unwrap();
        assert!((p - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fisher_known_2x2() {
        // Table [[1,2],[2,1]]: fg 1/3 concordant, bg 2/3 concordant.
        // One-sided p = P(X >= 1) with N=6, K=3, n=3
        //             = 1 - C(3,0)C(3,3)/C(6,3) = 1 - 1/20 = 0.95.
        let p = fisher_exact_one_sided(1, 3, 2, 3).unwrap();
        assert!((p - 0.95).abs() < 1e-10);
    }

    #[test]
    fn test_min_attainable() {
        // Margins (3, 7, 3): best table puts all 3 concordant in fg.
        let p = min_attainable_pvalue(3, 7, 3).unwrap();
        assert!((p - 1.0 / 120.0).abs() < 1e-12);

        // All branches concordant: the only table is certain, p_min = 1.
        let p = min_attainable_pvalue(3, 7, 10).unwrap();
        assert!((p - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_counts_rejected() {
        assert!(fisher_exact_one_sided(4, 3, 0, 7).is_err());
        assert!(min_attainable_pvalue(3, 7, 11).is_err());
    }
}
