//! Maximum-likelihood ancestral reconstruction for binary traits.
//!
//! Fits a two-state continuous-time Markov model (Mk2) by grid search in
//! log-space, runs Felsenstein pruning with per-node rescaling, and derives
//! hard ancestral states plus foreground transition branches from marginal
//! posteriors.

use std::collections::HashMap;

use crate::error::{PhylopermError, Result};
use crate::mask::BranchMask;
use crate::tree::CanonicalTree;

/// Result of an Mk2 ancestral-state reconstruction.
#[derive(Debug, Clone)]
pub struct AsrResult {
    pub q01: f64,
    pub q10: f64,
    pub log_likelihood: f64,
    /// Per-node marginal posterior `[P(state=0), P(state=1)]`.
    pub posterior_by_node: Vec<[f64; 2]>,
    /// Per-node hard state under the posterior thresholds; `None` = ambiguous.
    pub hard_state_by_node: Vec<Option<u8>>,
    pub fg_01_mask: BranchMask,
    pub fg_10_mask: BranchMask,
    pub n_fg_01: usize,
    pub n_fg_10: usize,
    /// Branches whose MAP states transition but whose hard states are
    /// ambiguous under the thresholds.
    pub skipped_transitions: SkippedTransitions,
}

/// Diagnostic for transitions lost to posterior thresholding.
#[derive(Debug, Clone, Default)]
pub struct SkippedTransitions {
    pub branch_keys: Vec<String>,
    pub n_01: usize,
    pub n_10: usize,
}

/// Infer ancestral states and foreground transition branches under an ML
/// Mk2 model.
///
/// # Arguments
/// * `tree` - Canonical tree with validated branch lengths
/// * `species_to_state` - Binary trait per species; must match tree tips
/// * `posterior_hi` - `P(state=1) >= hi` assigns hard state 1 (inclusive)
/// * `posterior_lo` - `P(state=1) <= lo` assigns hard state 0 (inclusive)
pub fn run_trait_asr_ml(
    tree: &CanonicalTree,
    species_to_state: &HashMap<String, u8>,
    posterior_hi: f64,
    posterior_lo: f64,
) -> Result<AsrResult> {
    validate_species_match(tree, species_to_state)?;

    let n = tree.labels.len();
    let mut tip_state_by_node: Vec<Option<u8>> = vec![None; n];
    for (node_id, species) in tree.tip_species_by_node.iter().enumerate() {
        if let Some(sp) = species {
            tip_state_by_node[node_id] = species_to_state.get(sp).copied();
        }
    }

    let (q01, q10, best_ll) = fit_rates_ml(tree, &tip_state_by_node);
    let (ll, posterior) = evaluate_model(tree, &tip_state_by_node, q01, q10);

    let mut hard: Vec<Option<u8>> = vec![None; n];
    for (node_id, p) in posterior.iter().enumerate() {
        if p[1] >= posterior_hi {
            hard[node_id] = Some(1);
        } else if p[1] <= posterior_lo {
            hard[node_id] = Some(0);
        }
    }

    let m = tree.n_branches();
    let mut fg_01_mask = BranchMask::zeros(m);
    let mut fg_10_mask = BranchMask::zeros(m);
    for (bidx, &child) in tree.node_by_branch_index.iter().enumerate() {
        let parent = match tree.parent_by_node[child] {
            Some(p) => p,
            None => continue,
        };
        match (hard[parent], hard[child]) {
            (Some(0), Some(1)) => fg_01_mask.set(bidx),
            (Some(1), Some(0)) => fg_10_mask.set(bidx),
            _ => {}
        }
    }

    let skipped_transitions = collect_skipped_transitions(tree, &posterior, &hard);

    let n_fg_01 = fg_01_mask.count_ones();
    let n_fg_10 = fg_10_mask.count_ones();
    Ok(AsrResult {
        q01,
        q10,
        log_likelihood: ll.max(best_ll),
        posterior_by_node: posterior,
        hard_state_by_node: hard,
        fg_01_mask,
        fg_10_mask,
        n_fg_01,
        n_fg_10,
        skipped_transitions,
    })
}

fn validate_species_match(
    tree: &CanonicalTree,
    species_to_state: &HashMap<String, u8>,
) -> Result<()> {
    let tree_species: Vec<&str> = tree.tip_species();

    let mut missing: Vec<String> = tree_species
        .iter()
        .filter(|sp| !species_to_state.contains_key(**sp))
        .map(|sp| sp.to_string())
        .collect();
    let mut extra: Vec<String> = species_to_state
        .keys()
        .filter(|sp| !tree_species.contains(&sp.as_str()))
        .cloned()
        .collect();
    missing.sort();
    extra.sort();

    if missing.is_empty() && extra.is_empty() {
        return Ok(());
    }

    let mut parts = Vec::new();
    if !missing.is_empty() {
        let preview = missing.iter().take(8).cloned().collect::<Vec<_>>().join(", ");
        parts.push(format!(
            "Missing in trait table ({}): {preview}",
            missing.len()
        ));
    }
    if !extra.is_empty() {
        let preview = extra.iter().take(8).cloned().collect::<Vec<_>>().join(", ");
        parts.push(format!("Extra in trait table ({}): {preview}", extra.len()));
    }
    Err(PhylopermError::SpeciesMismatch {
        detail: parts.join(" "),
    })
}

/// Transition probabilities for the Mk2 chain over branch length `t`.
///
/// Closed form for Q = [[-q01, q01], [q10, -q10]]; degenerate rate sums
/// collapse to the identity.
///
/// # Returns
/// `[p00, p01, p10, p11]`
fn trans_probs(t: f64, q01: f64, q10: f64) -> [f64; 4] {
    let qsum = q01 + q10;
    if qsum <= 0.0 {
        return [1.0, 0.0, 0.0, 1.0];
    }

    let pi0 = q10 / qsum;
    let pi1 = q01 / qsum;
    let e = (-qsum * t).exp();

    [pi0 + pi1 * e, pi1 - pi1 * e, pi0 - pi0 * e, pi1 + pi0 * e]
}

/// Two-phase grid-search ML fit for `(q01, q10)` in log10-space.
///
/// Coarse: 21 points per axis over [1e-4, 1e1]. Refine: 21 points per axis
/// within one decade of the coarse optimum. Ascending iteration with strict
/// improvement, so ties resolve to the smaller rates.
fn fit_rates_ml(tree: &CanonicalTree, tip_state_by_node: &[Option<u8>]) -> (f64, f64, f64) {
    let coarse: Vec<f64> = (0..21).map(|i| 10f64.powf(-4.0 + 0.25 * i as f64)).collect();

    let mut best = (f64::NEG_INFINITY, 1.0, 1.0);
    for &q01 in &coarse {
        for &q10 in &coarse {
            let (ll, _) = evaluate_model(tree, tip_state_by_node, q01, q10);
            if ll > best.0 {
                best = (ll, q01, q10);
            }
        }
    }

    let center01 = best.1.log10();
    let center10 = best.2.log10();
    let refine01: Vec<f64> = (0..21)
        .map(|i| 10f64.powf(center01 - 1.0 + 0.1 * i as f64))
        .collect();
    let refine10: Vec<f64> = (0..21)
        .map(|i| 10f64.powf(center10 - 1.0 + 0.1 * i as f64))
        .collect();

    for &q01 in &refine01 {
        for &q10 in &refine10 {
            let (ll, _) = evaluate_model(tree, tip_state_by_node, q01, q10);
            if ll > best.0 {
                best = (ll, q01, q10);
            }
        }
    }

    (best.1, best.2, best.0)
}

/// Pruning pass plus downward pass under fixed rates.
///
/// Returns the log-likelihood and per-node marginal posteriors. Upward
/// conditionals are rescaled by their maximum at each node with the log
/// norm accumulated, so deep trees stay in range.
fn evaluate_model(
    tree: &CanonicalTree,
    tip_state_by_node: &[Option<u8>],
    q01: f64,
    q10: f64,
) -> (f64, Vec<[f64; 2]>) {
    let n = tree.labels.len();
    let root = tree.root;
    let uniform = vec![[0.5, 0.5]; n];

    let postorder = tree.postorder();

    let mut upward = vec![[1.0f64, 1.0f64]; n];
    let mut subtree_scale = vec![0.0f64; n];
    // Message passed from each non-root node to its parent.
    let mut edge_msg = vec![[1.0f64, 1.0f64]; n];

    for &node in &postorder {
        let children = &tree.children_by_node[node];
        if children.is_empty() {
            upward[node] = match tip_state_by_node[node] {
                Some(0) => [1.0, 0.0],
                Some(1) => [0.0, 1.0],
                _ => [1.0, 1.0],
            };
        } else {
            let mut l = [1.0f64, 1.0f64];
            let mut scale = 0.0f64;
            for &child in children {
                let t = tree.branch_length_by_node[child];
                let p = trans_probs(t, q01, q10);
                let c = upward[child];
                let m0 = p[0] * c[0] + p[1] * c[1];
                let m1 = p[2] * c[0] + p[3] * c[1];
                edge_msg[child] = [m0, m1];
                l[0] *= m0;
                l[1] *= m1;
                scale += subtree_scale[child];
            }

            let norm = l[0].max(l[1]);
            if norm <= 0.0 {
                return (f64::NEG_INFINITY, uniform);
            }
            upward[node] = [l[0] / norm, l[1] / norm];
            subtree_scale[node] = scale + norm.ln();
        }
    }

    let qsum = q01 + q10;
    let (pi0, pi1) = if qsum > 0.0 {
        (q10 / qsum, q01 / qsum)
    } else {
        (0.5, 0.5)
    };
    let root_lik = pi0 * upward[root][0] + pi1 * upward[root][1];
    if root_lik <= 0.0 {
        return (f64::NEG_INFINITY, uniform);
    }
    let loglik = root_lik.ln() + subtree_scale[root];

    // Downward pass for marginals.
    let preorder = tree.preorder();
    let mut down = vec![[0.5f64, 0.5f64]; n];
    down[root] = normalize([pi0, pi1]);

    for &parent in &preorder {
        let children = &tree.children_by_node[parent];
        if children.is_empty() {
            continue;
        }

        let mut all = [1.0f64, 1.0f64];
        for &child in children {
            all[0] *= edge_msg[child][0];
            all[1] *= edge_msg[child][1];
        }

        for &child in children {
            let msg = edge_msg[child];
            // Strip this child's contribution so only the outside of its
            // subtree remains.
            let excl0 = if msg[0] != 0.0 {
                all[0] / msg[0]
            } else {
                product_excluding(tree, parent, child, &edge_msg, 0)
            };
            let excl1 = if msg[1] != 0.0 {
                all[1] / msg[1]
            } else {
                product_excluding(tree, parent, child, &edge_msg, 1)
            };

            let base0 = down[parent][0] * excl0;
            let base1 = down[parent][1] * excl1;

            let t = tree.branch_length_by_node[child];
            let p = trans_probs(t, q01, q10);
            let c0 = base0 * p[0] + base1 * p[2];
            let c1 = base0 * p[1] + base1 * p[3];
            down[child] = normalize([c0, c1]);
        }
    }

    let mut posterior = vec![[0.5f64, 0.5f64]; n];
    for node in 0..n {
        posterior[node] = normalize([
            down[node][0] * upward[node][0],
            down[node][1] * upward[node][1],
        ]);
    }

    (loglik, posterior)
}

fn product_excluding(
    tree: &CanonicalTree,
    parent: usize,
    excluded_child: usize,
    edge_msg: &[[f64; 2]],
    state: usize,
) -> f64 {
    let mut out = 1.0;
    for &child in &tree.children_by_node[parent] {
        if child == excluded_child {
            continue;
        }
        out *= edge_msg[child][state];
    }
    out
}

fn normalize(v: [f64; 2]) -> [f64; 2] {
    let s = v[0] + v[1];
    if s <= 0.0 {
        [0.5, 0.5]
    } else {
        [v[0] / s, v[1] / s]
    }
}

fn collect_skipped_transitions(
    tree: &CanonicalTree,
    posterior: &[[f64; 2]],
    hard: &[Option<u8>],
) -> SkippedTransitions {
    let map_state: Vec<u8> = posterior
        .iter()
        .map(|p| if p[1] >= 0.5 { 1 } else { 0 })
        .collect();

    let mut out = SkippedTransitions::default();
    for (bidx, &child) in tree.node_by_branch_index.iter().enumerate() {
        let parent = match tree.parent_by_node[child] {
            Some(p) => p,
            None => continue,
        };
        if hard[parent].is_some() && hard[child].is_some() {
            continue;
        }
        if map_state[parent] == map_state[child] {
            continue;
        }
        out.branch_keys
            .push(tree.branch_key_by_index[bidx].clone());
        if map_state[parent] == 0 {
            out.n_01 += 1;
        } else {
            out.n_10 += 1;
        }
    }
    out
}
