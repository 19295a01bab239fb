//! Structured run-metadata document for auditing.

use std::collections::BTreeMap;

use serde::Serialize;

/// Top-level metadata document written next to the result tables.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub tool: String,
    pub version: String,
    pub inputs: InputFacts,
    pub parameters: ParameterFacts,
    pub trait_columns: TraitColumnFacts,
    pub tree: TreeFacts,
    pub asr: AsrFacts,
    pub permutation: Option<PermutationFacts>,
    pub tarone: Option<TaroneFacts>,
    pub results: ResultFacts,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputFacts {
    pub cafe_dir: String,
    pub trait_tsv: String,
    pub change_table: String,
    pub change_table_sha256: Option<String>,
    pub branch_prob_table: Option<String>,
    pub branch_prob_table_sha256: Option<String>,
    pub asr_tree: String,
    pub asr_tree_sha256: Option<String>,
    pub trait_tsv_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterFacts {
    pub mode: String,
    pub direction: String,
    pub binary_test: Option<String>,
    pub fwer_alpha: f64,
    pub include_trait_loss: bool,
    pub asr_method: String,
    pub asr_posterior_hi: f64,
    pub asr_posterior_lo: f64,
    /// Hard-state comparisons are inclusive at both thresholds.
    pub asr_threshold_policy: String,
    pub cafe_significant_only: bool,
    pub cafe_alpha: f64,
    pub n_perm_initial: usize,
    pub n_perm_refine: usize,
    pub refine_p_threshold: f64,
    pub qvalue_threshold: f64,
    pub pvalue_top_n: usize,
    pub hist_bins: usize,
    pub clade_bin_scheme: String,
    pub seed: u64,
    pub seed_source: String,
    pub jobs_requested: usize,
    pub jobs_effective: usize,
    pub make_plots: bool,
    pub out_prefix: String,
    pub perm_cache: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraitColumnFacts {
    pub species_column: String,
    pub trait_column_used: String,
    pub trait_column_source: String,
    pub row_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeFacts {
    pub n_nodes: usize,
    pub n_tips: usize,
    pub n_non_root_branches: usize,
    pub root_branch_key: String,
    pub fingerprint: String,
    pub clade_bins: BTreeMap<String, u8>,
}

impl TreeFacts {
    /// Legend mapping clade-size ranges to log2 bins.
    pub fn bin_legend() -> BTreeMap<String, u8> {
        BTreeMap::from([
            ("1".to_string(), 0),
            ("2".to_string(), 1),
            ("3-4".to_string(), 2),
            ("5-8".to_string(), 3),
            ("9-16".to_string(), 4),
            ("17-32".to_string(), 5),
            ("33-64".to_string(), 6),
            ("65+".to_string(), 7),
        ])
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AsrFacts {
    pub q01: f64,
    pub q10: f64,
    pub log_likelihood: f64,
    pub n_fg_01: usize,
    pub n_fg_10: usize,
    pub n_skipped_potential_transitions: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct StageFacts {
    pub n_perm: usize,
    pub source: String,
    pub total_attempts: u64,
    pub total_restarts: u64,
    pub n_fallback_independent: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermutationFacts {
    pub cache_path: Option<String>,
    pub cache_loaded: bool,
    pub cache_ignored_reason: Option<String>,
    pub initial: StageFacts,
    pub refine: StageFacts,
    pub n_refined_families: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaroneFacts {
    pub m_total: usize,
    pub m_testable: usize,
    pub bonferroni_denom: usize,
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultFacts {
    pub n_families: usize,
    pub n_tested: usize,
    pub n_refined: usize,
    pub n_top_hits: usize,
    pub output_files: BTreeMap<String, String>,
}
