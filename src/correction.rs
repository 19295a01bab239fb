//! Multiple-testing correction utilities.

use crate::error::{PhylopermError, Result};

/// Benjamini-Hochberg adjustment preserving absent entries.
///
/// q-values are non-decreasing in sorted p order and clipped at 1; entries
/// with no p-value stay `None`.
pub fn bh_adjust(pvalues: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut indexed: Vec<(usize, f64)> = pvalues
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.map(|p| (i, p)))
        .collect();
    let m = indexed.len();
    let mut out: Vec<Option<f64>> = vec![None; pvalues.len()];
    if m == 0 {
        return out;
    }

    indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut prev = 1.0f64;
    for rank in (1..=m).rev() {
        let (orig_idx, p) = indexed[rank - 1];
        let mut q = (p * m as f64) / rank as f64;
        if q > 1.0 {
            q = 1.0;
        }
        if q > prev {
            q = prev;
        }
        prev = q;
        out[orig_idx] = Some(q);
    }
    out
}

/// Result of Tarone's discrete Bonferroni screening.
#[derive(Debug, Clone)]
pub struct TaroneScreen {
    pub m_total: usize,
    /// Screening constant: the smallest `k` with `m(k) <= k`.
    pub bonferroni_denom: usize,
    /// Testability threshold alpha / k; `None` when nothing was screened.
    pub threshold: Option<f64>,
    pub testable: Vec<bool>,
    pub m_testable: usize,
}

/// Screen families by minimum attainable p-value.
///
/// Finds the smallest `k` such that `m(k) <= k`, where
/// `m(k) = #{i : p_min_i <= alpha / k}`; families above the resulting
/// threshold are untestable and drop out of the correction denominator.
pub fn tarone_screen(min_pvalues: &[Option<f64>], alpha: f64) -> Result<TaroneScreen> {
    if alpha <= 0.0 || alpha >= 1.0 {
        return Err(PhylopermError::InvalidArgument(
            "fwer alpha must be in (0, 1)".to_string(),
        ));
    }

    let valid: Vec<usize> = (0..min_pvalues.len())
        .filter(|&i| min_pvalues[i].is_some())
        .collect();
    let m_total = valid.len();
    let mut testable = vec![false; min_pvalues.len()];
    if m_total == 0 {
        return Ok(TaroneScreen {
            m_total: 0,
            bonferroni_denom: 0,
            threshold: None,
            testable,
            m_testable: 0,
        });
    }

    const EPS: f64 = 1e-15;
    let mut denom = m_total;
    for k in 1..=m_total {
        let cutoff = alpha / k as f64;
        let m_k = valid
            .iter()
            .filter(|&&i| min_pvalues[i].unwrap_or(1.0) <= cutoff + EPS)
            .count();
        if m_k <= k {
            denom = k;
            break;
        }
    }

    let threshold = alpha / denom as f64;
    for &i in &valid {
        if min_pvalues[i].unwrap_or(1.0) <= threshold + EPS {
            testable[i] = true;
        }
    }
    let m_testable = testable.iter().filter(|&&t| t).count();

    Ok(TaroneScreen {
        m_total,
        bonferroni_denom: denom,
        threshold: Some(threshold),
        testable,
        m_testable,
    })
}

/// Bonferroni-adjust selected hypotheses; unselected entries stay `None`.
pub fn bonferroni_adjust_selected(
    pvalues: &[Option<f64>],
    selected: &[bool],
    denom: usize,
) -> Vec<Option<f64>> {
    debug_assert_eq!(pvalues.len(), selected.len());
    let mut out: Vec<Option<f64>> = vec![None; pvalues.len()];
    if denom == 0 {
        return out;
    }
    for (i, (p, &sel)) in pvalues.iter().zip(selected).enumerate() {
        if let (Some(p), true) = (p, sel) {
            out[i] = Some((p * denom as f64).min(1.0));
        }
    }
    out
}
