//! End-to-end pipeline: inputs → tree → ASR → family tests → correction →
//! outputs.
//!
//! Tree, ASR result, family table, and significance masks are built once
//! and shared read-only across the rayon pool; only this module mutates the
//! result rows, and all reductions happen in family-index order so outputs
//! are byte-identical for any `jobs` setting.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::asr::{run_trait_asr_ml, AsrResult};
use crate::config::{Config, Direction, Mode};
use crate::correction::{bh_adjust, bonferroni_adjust_selected, tarone_screen};
use crate::error::{PhylopermError, Result};
use crate::family::{build_rates, significance_mask, FamilyTable};
use crate::io::{
    file_digest, load_change_matrix, load_probability_map, load_trait_table, write_json,
    TraitTable,
};
use crate::mask::BranchMask;
use crate::metadata::{
    AsrFacts, InputFacts, ParameterFacts, PermutationFacts, ResultFacts, RunMetadata, StageFacts,
    TaroneFacts, TraitColumnFacts, TreeFacts,
};
use crate::perm::cache::{
    block_to_stage, load_cache, save_cache, stage_to_block, CacheBundle, CacheLoad, CacheSpec,
};
use crate::perm::engine::{
    generate_samples, generate_samples_range, FamilyStatistic, SampleBlock, Stage,
};
use crate::perm::sampler::PermutationSampler;
use crate::report::{
    family_fieldnames, histogram_rows, qq_rows, write_family_results, write_histogram, write_qq,
    write_top_hits, write_top_pvalues, FamilyRow, FamilyStatus, FisherFields, StatValue,
};
use crate::stats::binary::{binary_summary, BinaryStatContext};
use crate::stats::fisher::{fisher_exact_one_sided, min_attainable_pvalue};
use crate::stats::rate::{rate_stat, rate_summary};
use crate::stats::{empirical_pvalue_one_sided, DirectionSign};

/// Condensed outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub n_families: usize,
    pub n_tested: usize,
    pub n_refined: usize,
    pub n_top_hits: usize,
    pub family_results_tsv: PathBuf,
    pub metadata_json: PathBuf,
}

struct RequiredPaths {
    change: PathBuf,
    prob: PathBuf,
    asr_tree: PathBuf,
}

fn required_paths(cafe_dir: &Path) -> RequiredPaths {
    RequiredPaths {
        change: cafe_dir.join("Gamma_change.tab"),
        prob: cafe_dir.join("Gamma_branch_probabilities.tab"),
        asr_tree: cafe_dir.join("Gamma_asr.tre"),
    }
}

/// Execute the full analysis described by `config`.
pub fn run(config: &Config) -> Result<RunSummary> {
    info!("[1/8] validating arguments and inputs");
    config.validate()?;

    let jobs_effective = if config.jobs == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        config.jobs
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs_effective)
        .build()?;
    pool.install(|| run_inner(config, jobs_effective))
}

/// Per-family precomputation for the statistic loop.
enum ModeData {
    /// `None` entries are families whose significance mask removed every
    /// foreground branch.
    Binary(Vec<Option<BinaryStatContext>>),
    Rate(Vec<Vec<f64>>),
}

struct EvalOut {
    stat_obs: StatValue,
    p_empirical: f64,
}

fn run_inner(config: &Config, jobs_effective: usize) -> Result<RunSummary> {
    let mut warnings: Vec<String> = Vec::new();

    let paths = required_paths(&config.cafe_dir);
    for (label, path) in [("change table", &paths.change), ("ASR tree", &paths.asr_tree)] {
        if !path.exists() {
            return Err(PhylopermError::InvalidArgument(format!(
                "required input file missing ({label}): {}",
                path.display()
            )));
        }
    }

    info!("[2/8] loading tree/trait data and running trait ASR");
    let tree = crate::tree::load_canonical_tree(&paths.asr_tree)?;
    let root_key = tree.root_branch_key().to_string();
    let trait_table = load_trait_table(&config.trait_tsv, config.trait_column.as_deref())?;

    let asr = run_trait_asr_ml(
        &tree,
        &trait_table.species_to_state,
        config.asr_posterior_hi,
        config.asr_posterior_lo,
    )?;

    if !asr.skipped_transitions.branch_keys.is_empty() {
        let skipped = &asr.skipped_transitions;
        let preview = skipped
            .branch_keys
            .iter()
            .take(8)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        let message = format!(
            "ASR posterior thresholding skipped {} potential transition branch(es) \
             (0->1={}, 1->0={}; branch keys: {preview})",
            skipped.branch_keys.len(),
            skipped.n_01,
            skipped.n_10
        );
        warn!("{message}");
        warnings.push(message);
    }

    let n_branches = tree.n_branches();
    let fg_01 = asr.fg_01_mask.clone();
    let fg_10 = if config.include_trait_loss {
        asr.fg_10_mask.clone()
    } else {
        BranchMask::zeros(n_branches)
    };
    let n_fg_01 = fg_01.count_ones();
    let n_fg_10 = fg_10.count_ones();
    let fg_total = n_fg_01 + n_fg_10;
    info!("[2/8] foreground branches detected: 0->1={n_fg_01}, 1->0={n_fg_10}, total={fg_total}");

    let (seed, seed_source) = match config.seed {
        Some(seed) => (seed, "cli"),
        None => (rand::random::<u64>(), "entropy"),
    };

    info!("[3/8] loading family change matrix");
    let matrix = load_change_matrix(&paths.change, &tree.branch_index_by_key, &[&root_key])?;
    let families = FamilyTable::from_matrix(matrix, n_branches);

    let prob_map: HashMap<String, Vec<f64>> = if config.cafe_significant_only {
        if !paths.prob.exists() {
            return Err(PhylopermError::InvalidArgument(format!(
                "--cafe-significant-only requires the branch probability table, \
                 but the file is missing: {}",
                paths.prob.display()
            )));
        }
        info!(
            "[3/8] loading branch probabilities for significance masking (alpha={})",
            config.cafe_alpha
        );
        load_probability_map(&paths.prob, &tree.branch_index_by_key, &[&root_key])?
    } else {
        HashMap::new()
    };

    if config.mode == Mode::Rate {
        let mut bad: Vec<String> = Vec::new();
        for (idx, &len) in tree.branch_length_by_index.iter().enumerate() {
            if len <= 0.0 {
                bad.push(format!("{}={}", tree.branch_key_by_index[idx], len));
            }
        }
        if !bad.is_empty() {
            let extra = if bad.len() > 8 { " ..." } else { "" };
            bad.truncate(8);
            return Err(PhylopermError::ZeroLengthBranch {
                preview: format!("{}{}", bad.join(", "), extra),
            });
        }
    }

    let direction = match config.direction {
        Direction::Gain => DirectionSign::Gain,
        Direction::Loss => DirectionSign::Loss,
    };

    let fg_mask = fg_01.union(&fg_10);
    let mode_data = match config.mode {
        Mode::Binary => {
            let sig_masks: Option<Vec<BranchMask>> = if config.cafe_significant_only {
                Some(
                    families
                        .families
                        .iter()
                        .map(|fam| {
                            significance_mask(
                                prob_map.get(&fam.id).map(|v| v.as_slice()),
                                config.cafe_alpha,
                                n_branches,
                            )
                        })
                        .collect(),
                )
            } else {
                None
            };
            let ctxs = families
                .families
                .iter()
                .enumerate()
                .map(|(i, fam)| {
                    let sig = sig_masks.as_ref().map(|masks| &masks[i]);
                    if let Some(sig) = sig {
                        if fg_total > 0 && !sig.intersects(&fg_mask) {
                            return None;
                        }
                    }
                    Some(BinaryStatContext::new(
                        &fam.pos_mask,
                        &fam.neg_mask,
                        direction,
                        sig,
                    ))
                })
                .collect();
            ModeData::Binary(ctxs)
        }
        Mode::Rate => {
            let rates = families
                .families
                .iter()
                .map(|fam| build_rates(&fam.deltas, &tree.branch_length_by_index))
                .collect::<Result<Vec<_>>>()?;
            ModeData::Rate(rates)
        }
    };

    let mut rows: Vec<FamilyRow> = families
        .families
        .iter()
        .map(|fam| {
            FamilyRow::new(
                fam.id.clone(),
                config.mode.as_str(),
                config.direction.as_str(),
                config.include_trait_loss,
                n_fg_01,
                n_fg_10,
            )
        })
        .collect();

    let mut perm_facts: Option<PermutationFacts> = None;
    let mut tarone_facts: Option<TaroneFacts> = None;
    let mut n_refined = 0usize;

    if fg_total == 0 {
        info!("[4/8] skipping family tests because no valid foreground branches were found");
        if !config.fisher_path() {
            perm_facts = Some(PermutationFacts {
                cache_path: config.perm_cache.as_ref().map(|p| p.display().to_string()),
                cache_loaded: false,
                cache_ignored_reason: None,
                initial: StageFacts {
                    source: "skipped_no_foreground".to_string(),
                    ..StageFacts::default()
                },
                refine: StageFacts {
                    source: "skipped_no_foreground".to_string(),
                    ..StageFacts::default()
                },
                n_refined_families: 0,
            });
        }
    } else if config.fisher_path() {
        info!("[4/8] running Fisher exact tests with Tarone screening");
        tarone_facts = Some(run_fisher_path(
            config, &families, &mode_data, &fg_01, &fg_10, &tree.all_mask, &mut rows,
        )?);
    } else {
        let (facts, refined) = run_permutation_path(
            config,
            &tree,
            &families,
            &mode_data,
            &fg_01,
            &fg_10,
            &tree.all_mask,
            seed,
            &mut rows,
            &mut warnings,
        )?;
        perm_facts = Some(facts);
        n_refined = refined;
    }

    if !config.fisher_path() {
        info!("[7/8] applying Benjamini-Hochberg correction");
        let pvalues: Vec<Option<f64>> = rows.iter().map(|r| r.p_empirical).collect();
        for (row, q) in rows.iter_mut().zip(bh_adjust(&pvalues)) {
            row.q_bh = q;
        }
    }

    info!("[8/8] writing result files");
    let prefix = config.out_prefix.display().to_string();
    let out_family = PathBuf::from(format!("{prefix}.family_results.tsv"));
    let out_top_hits = PathBuf::from(format!("{prefix}.top_hits.tsv"));
    let out_metadata = PathBuf::from(format!("{prefix}.run_metadata.json"));

    let fields = family_fieldnames(config.mode.as_str(), config.fisher_path());
    write_family_results(&out_family, &rows, &fields)?;

    let mut output_files: BTreeMap<String, String> = BTreeMap::new();
    output_files.insert(
        "family_results_tsv".to_string(),
        out_family.display().to_string(),
    );

    let n_top_hits = write_top_hits(
        &out_top_hits,
        &rows,
        config.qvalue_threshold,
        config.fisher_path(),
    )?;
    output_files.insert("top_hits_tsv".to_string(), out_top_hits.display().to_string());

    if config.pvalue_top_n > 0 {
        let out_top_p = PathBuf::from(format!("{prefix}.top_pvalues.tsv"));
        write_top_pvalues(&out_top_p, &rows, config.pvalue_top_n, config.fisher_path())?;
        output_files.insert("top_pvalues_tsv".to_string(), out_top_p.display().to_string());
    }

    let pvals: Vec<f64> = rows.iter().filter_map(|r| r.p_primary()).collect();
    if !pvals.is_empty() {
        let out_hist = PathBuf::from(format!("{prefix}.pvalue_hist.tsv"));
        let hist = histogram_rows(&pvals, config.hist_bins);
        write_histogram(&out_hist, &hist)?;
        output_files.insert("pvalue_hist_tsv".to_string(), out_hist.display().to_string());

        let out_qq = PathBuf::from(format!("{prefix}.qq.tsv"));
        let qq = qq_rows(&pvals);
        write_qq(&out_qq, &qq)?;
        output_files.insert("qq_tsv".to_string(), out_qq.display().to_string());

        if config.make_plots {
            write_plot_outputs(&prefix, &hist, &qq, &mut output_files, &mut warnings);
        }
    } else if config.make_plots {
        warnings.push("no defined p-values; skipped plot outputs".to_string());
    }

    let n_tested = rows
        .iter()
        .filter(|r| r.status == FamilyStatus::Ok)
        .count();

    let metadata = RunMetadata {
        tool: "phyloperm".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        inputs: InputFacts {
            cafe_dir: config.cafe_dir.display().to_string(),
            trait_tsv: config.trait_tsv.display().to_string(),
            change_table: paths.change.display().to_string(),
            change_table_sha256: file_digest(&paths.change).ok(),
            branch_prob_table: paths
                .prob
                .exists()
                .then(|| paths.prob.display().to_string()),
            branch_prob_table_sha256: if paths.prob.exists() {
                file_digest(&paths.prob).ok()
            } else {
                None
            },
            asr_tree: paths.asr_tree.display().to_string(),
            asr_tree_sha256: file_digest(&paths.asr_tree).ok(),
            trait_tsv_sha256: file_digest(&config.trait_tsv).ok(),
        },
        parameters: parameter_facts(config, seed, seed_source, jobs_effective),
        trait_columns: trait_column_facts(&trait_table),
        tree: TreeFacts {
            n_nodes: tree.labels.len(),
            n_tips: tree.n_tips,
            n_non_root_branches: n_branches,
            root_branch_key: root_key,
            fingerprint: tree.fingerprint.clone(),
            clade_bins: TreeFacts::bin_legend(),
        },
        asr: asr_facts(&asr),
        permutation: perm_facts,
        tarone: tarone_facts,
        results: ResultFacts {
            n_families: rows.len(),
            n_tested,
            n_refined,
            n_top_hits,
            output_files,
        },
        warnings,
    };
    write_json(&out_metadata, &metadata)?;
    info!("[8/8] run complete; outputs were written successfully");

    Ok(RunSummary {
        n_families: rows.len(),
        n_tested,
        n_refined,
        n_top_hits,
        family_results_tsv: out_family,
        metadata_json: out_metadata,
    })
}

fn parameter_facts(
    config: &Config,
    seed: u64,
    seed_source: &str,
    jobs_effective: usize,
) -> ParameterFacts {
    ParameterFacts {
        mode: config.mode.as_str().to_string(),
        direction: config.direction.as_str().to_string(),
        binary_test: (config.mode == Mode::Binary).then(|| config.binary_test.as_str().to_string()),
        fwer_alpha: config.fwer_alpha,
        include_trait_loss: config.include_trait_loss,
        asr_method: config.asr_method.as_str().to_string(),
        asr_posterior_hi: config.asr_posterior_hi,
        asr_posterior_lo: config.asr_posterior_lo,
        asr_threshold_policy: "inclusive".to_string(),
        cafe_significant_only: config.cafe_significant_only,
        cafe_alpha: config.cafe_alpha,
        n_perm_initial: config.n_perm_initial,
        n_perm_refine: config.n_perm_refine,
        refine_p_threshold: config.refine_p_threshold,
        qvalue_threshold: config.qvalue_threshold,
        pvalue_top_n: config.pvalue_top_n,
        hist_bins: config.hist_bins,
        clade_bin_scheme: config.clade_bin_scheme.as_str().to_string(),
        seed,
        seed_source: seed_source.to_string(),
        jobs_requested: config.jobs,
        jobs_effective,
        make_plots: config.make_plots,
        out_prefix: config.out_prefix.display().to_string(),
        perm_cache: config.perm_cache.as_ref().map(|p| p.display().to_string()),
    }
}

fn trait_column_facts(table: &TraitTable) -> TraitColumnFacts {
    TraitColumnFacts {
        species_column: table.species_column.clone(),
        trait_column_used: table.trait_column.clone(),
        trait_column_source: table.trait_column_source.clone(),
        row_count: table.row_count,
    }
}

fn asr_facts(asr: &AsrResult) -> AsrFacts {
    AsrFacts {
        q01: asr.q01,
        q10: asr.q10,
        log_likelihood: asr.log_likelihood,
        n_fg_01: asr.n_fg_01,
        n_fg_10: asr.n_fg_10,
        n_skipped_potential_transitions: asr.skipped_transitions.branch_keys.len(),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_fisher_path(
    config: &Config,
    families: &FamilyTable,
    mode_data: &ModeData,
    fg_01: &BranchMask,
    fg_10: &BranchMask,
    all_mask: &BranchMask,
    rows: &mut [FamilyRow],
) -> Result<TaroneFacts> {
    let ModeData::Binary(ctxs) = mode_data else {
        return Err(PhylopermError::InvalidArgument(
            "fisher-tarone requires binary mode".to_string(),
        ));
    };

    let mut p_fisher: Vec<Option<f64>> = vec![None; families.len()];
    let mut p_min: Vec<Option<f64>> = vec![None; families.len()];

    for (i, row) in rows.iter_mut().enumerate() {
        let Some(ctx) = &ctxs[i] else {
            row.status = FamilyStatus::NoValidForeground;
            continue;
        };

        let summary = binary_summary(ctx, fg_01, fg_10, all_mask);
        let fisher = fisher_exact_one_sided(
            summary.fg_concordant_count,
            summary.fg_total,
            summary.bg_concordant_count,
            summary.bg_total,
        )?;
        let minimal = min_attainable_pvalue(
            summary.fg_total,
            summary.bg_total,
            summary.fg_concordant_count + summary.bg_concordant_count,
        )?;

        row.stat_obs = Some(StatValue::Count(summary.fg_concordant_count));
        row.status = FamilyStatus::Ok;
        row.binary = Some(summary);
        p_fisher[i] = Some(fisher);
        p_min[i] = Some(minimal);
    }

    let screen = tarone_screen(&p_min, config.fwer_alpha)?;
    let adjusted = bonferroni_adjust_selected(&p_fisher, &screen.testable, screen.m_testable);

    for (i, row) in rows.iter_mut().enumerate() {
        if row.status == FamilyStatus::NoValidForeground {
            continue;
        }
        let testable = screen.testable[i];
        if !testable {
            row.status = FamilyStatus::UntestableTarone;
        }
        let p_bonf = adjusted[i];
        row.fisher = Some(FisherFields {
            p_fisher: p_fisher[i],
            p_min_attainable: p_min[i],
            tarone_testable: testable,
            p_bonf_tarone: p_bonf,
            reject_tarone: p_bonf.map(|p| p <= config.fwer_alpha).unwrap_or(false),
        });
    }

    Ok(TaroneFacts {
        m_total: screen.m_total,
        m_testable: screen.m_testable,
        bonferroni_denom: screen.bonferroni_denom,
        threshold: screen.threshold,
    })
}

/// Acquired stage samples plus where they came from.
struct StageAcquisition {
    block: SampleBlock,
    source: String,
}

fn acquire_stage(
    sampler: &PermutationSampler<'_>,
    n_bits: usize,
    n_required: usize,
    seed: u64,
    stage: Stage,
    bundle: &mut Option<CacheBundle>,
) -> Result<StageAcquisition> {
    if let Some(bundle) = bundle.as_mut() {
        if let Some(entry) = bundle.stage(stage.name()).cloned() {
            if entry.seed == seed {
                if entry.n_samples >= n_required {
                    let block = stage_to_block(&entry, n_bits, n_required)?;
                    return Ok(StageAcquisition {
                        block,
                        source: "cache".to_string(),
                    });
                }
                // Extend the cached prefix from the same seed-derived stream.
                let mut block = stage_to_block(&entry, n_bits, entry.n_samples)?;
                let ext = generate_samples_range(
                    sampler,
                    n_bits,
                    entry.n_samples,
                    n_required,
                    seed,
                    stage,
                )?;
                block.append(&ext);
                bundle.put_stage(block_to_stage(&block, stage.name(), seed));
                return Ok(StageAcquisition {
                    block,
                    source: "cache_extended".to_string(),
                });
            }
            let block = generate_samples(sampler, n_bits, n_required, seed, stage)?;
            bundle.put_stage(block_to_stage(&block, stage.name(), seed));
            return Ok(StageAcquisition {
                block,
                source: "regenerated_seed_mismatch".to_string(),
            });
        }
        let block = generate_samples(sampler, n_bits, n_required, seed, stage)?;
        bundle.put_stage(block_to_stage(&block, stage.name(), seed));
        return Ok(StageAcquisition {
            block,
            source: "generated".to_string(),
        });
    }

    let block = generate_samples(sampler, n_bits, n_required, seed, stage)?;
    Ok(StageAcquisition {
        block,
        source: "generated".to_string(),
    })
}

#[allow(clippy::too_many_arguments)]
fn run_permutation_path(
    config: &Config,
    tree: &crate::tree::CanonicalTree,
    families: &FamilyTable,
    mode_data: &ModeData,
    fg_01: &BranchMask,
    fg_10: &BranchMask,
    all_mask: &BranchMask,
    seed: u64,
    rows: &mut [FamilyRow],
    warnings: &mut Vec<String>,
) -> Result<(PermutationFacts, usize)> {
    let n_bits = tree.n_branches();
    let sampler = PermutationSampler::new(tree, fg_01, fg_10, config.include_trait_loss)?;

    // Cache bookkeeping.
    let spec = CacheSpec::new(tree, config.include_trait_loss, fg_01, fg_10);
    let mut cache_loaded = false;
    let mut cache_ignored_reason: Option<String> = None;
    let mut bundle: Option<CacheBundle> = match &config.perm_cache {
        Some(path) => match load_cache(path, &spec) {
            CacheLoad::Loaded(bundle) => {
                cache_loaded = true;
                Some(bundle)
            }
            CacheLoad::Incompatible(reason) => {
                let message = format!("cache ignored: {reason}");
                warn!("{message}");
                warnings.push(message.clone());
                cache_ignored_reason = Some(reason.to_string());
                Some(CacheBundle::empty(&spec))
            }
            CacheLoad::Missing => Some(CacheBundle::empty(&spec)),
        },
        None => None,
    };

    info!(
        "[4/8] preparing initial permutations (n={})",
        config.n_perm_initial
    );
    let initial = acquire_stage(
        &sampler,
        n_bits,
        config.n_perm_initial,
        seed,
        Stage::Initial,
        &mut bundle,
    )?;

    info!(
        "[5/8] running initial family tests for {} families",
        families.len()
    );
    let all_indices: Vec<usize> = (0..families.len()).collect();
    let direction = match config.direction {
        Direction::Gain => DirectionSign::Gain,
        Direction::Loss => DirectionSign::Loss,
    };

    apply_stage(
        rows,
        &all_indices,
        mode_data,
        fg_01,
        fg_10,
        all_mask,
        &initial.block,
        config.n_perm_initial,
        false,
        direction,
    );

    // Refinement: families whose initial p clears the threshold.
    let refine_indices: Vec<usize> = if config.n_perm_refine > config.n_perm_initial {
        rows.iter()
            .enumerate()
            .filter(|(_, r)| {
                r.status == FamilyStatus::Ok
                    && r.p_empirical
                        .map(|p| p <= config.refine_p_threshold)
                        .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect()
    } else {
        Vec::new()
    };

    let mut refine_facts = StageFacts {
        source: "not_used".to_string(),
        ..StageFacts::default()
    };

    if !refine_indices.is_empty() {
        info!(
            "[6/8] refining {} families (n={})",
            refine_indices.len(),
            config.n_perm_refine
        );
        let refine = acquire_stage(
            &sampler,
            n_bits,
            config.n_perm_refine,
            seed,
            Stage::Refine,
            &mut bundle,
        )?;
        apply_stage(
            rows,
            &refine_indices,
            mode_data,
            fg_01,
            fg_10,
            all_mask,
            &refine.block,
            config.n_perm_refine,
            true,
            direction,
        );
        refine_facts = StageFacts {
            n_perm: refine.block.n_samples,
            source: refine.source,
            total_attempts: refine.block.counters.attempts,
            total_restarts: refine.block.counters.restarts,
            n_fallback_independent: refine.block.counters.fallback_independent,
        };
    } else {
        info!("[6/8] refinement skipped (no families passed refine criteria)");
    }

    if let (Some(path), Some(bundle)) = (&config.perm_cache, &bundle) {
        save_cache(path, bundle)?;
        info!("[6/8] updated permutation cache: {}", path.display());
    }

    let facts = PermutationFacts {
        cache_path: config.perm_cache.as_ref().map(|p| p.display().to_string()),
        cache_loaded,
        cache_ignored_reason,
        initial: StageFacts {
            n_perm: initial.block.n_samples,
            source: initial.source,
            total_attempts: initial.block.counters.attempts,
            total_restarts: initial.block.counters.restarts,
            n_fallback_independent: initial.block.counters.fallback_independent,
        },
        refine: refine_facts,
        n_refined_families: refine_indices.len(),
    };
    Ok((facts, refine_indices.len()))
}

#[cfg(feature = "plots")]
fn write_plot_outputs(
    prefix: &str,
    hist: &[(f64, f64, usize)],
    qq: &[crate::report::QqRow],
    output_files: &mut BTreeMap<String, String>,
    warnings: &mut Vec<String>,
) {
    let hist_path = PathBuf::from(format!("{prefix}.pvalue_hist.svg"));
    match crate::plots::write_pvalue_hist_svg(&hist_path, hist) {
        Ok(()) => {
            output_files.insert(
                "pvalue_hist_svg".to_string(),
                hist_path.display().to_string(),
            );
        }
        Err(e) => warnings.push(format!("failed to write histogram plot: {e}")),
    }

    let qq_path = PathBuf::from(format!("{prefix}.qq.svg"));
    match crate::plots::write_qq_svg(&qq_path, qq) {
        Ok(()) => {
            output_files.insert("qq_svg".to_string(), qq_path.display().to_string());
        }
        Err(e) => warnings.push(format!("failed to write QQ plot: {e}")),
    }
}

#[cfg(not(feature = "plots"))]
fn write_plot_outputs(
    _prefix: &str,
    _hist: &[(f64, f64, usize)],
    _qq: &[crate::report::QqRow],
    _output_files: &mut BTreeMap<String, String>,
    warnings: &mut Vec<String>,
) {
    warnings.push(
        "plot support is not compiled in (enable the 'plots' feature); skipped plot outputs"
            .to_string(),
    );
}

/// Score the given families against a sample block and write the outcome
/// into their rows. Results are reduced in family-index order.
#[allow(clippy::too_many_arguments)]
fn apply_stage(
    rows: &mut [FamilyRow],
    indices: &[usize],
    mode_data: &ModeData,
    fg_01: &BranchMask,
    fg_10: &BranchMask,
    all_mask: &BranchMask,
    block: &SampleBlock,
    n_perm: usize,
    refined: bool,
    direction: DirectionSign,
) {
    let results: Vec<(usize, Option<EvalOut>)> = indices
        .par_iter()
        .map(|&i| {
            let out = match mode_data {
                ModeData::Binary(ctxs) => ctxs[i].as_ref().map(|ctx| {
                    let statistic = FamilyStatistic::Binary(ctx);
                    let obs = statistic.observed(fg_01, fg_10);
                    let tail = statistic.count_at_or_above(block, obs);
                    EvalOut {
                        stat_obs: StatValue::Count(obs as usize),
                        p_empirical: empirical_pvalue_one_sided(obs, tail, block.n_samples),
                    }
                }),
                ModeData::Rate(rates) => {
                    let obs = rate_stat(&rates[i], fg_01.words(), fg_10.words(), direction);
                    let statistic = FamilyStatistic::Rate {
                        rates: &rates[i],
                        direction,
                    };
                    let tail = statistic.count_at_or_above(block, obs);
                    Some(EvalOut {
                        stat_obs: StatValue::Value(obs),
                        p_empirical: empirical_pvalue_one_sided(obs, tail, block.n_samples),
                    })
                }
            };
            (i, out)
        })
        .collect();

    for (i, out) in results {
        let row = &mut rows[i];
        match out {
            Some(out) => {
                row.stat_obs = Some(out.stat_obs);
                row.p_empirical = Some(out.p_empirical);
                row.n_perm_used = n_perm;
                row.refined = refined;
                row.status = FamilyStatus::Ok;
                if !refined {
                    match mode_data {
                        ModeData::Binary(ctxs) => {
                            if let Some(ctx) = &ctxs[i] {
                                row.binary = Some(binary_summary(ctx, fg_01, fg_10, all_mask));
                            }
                        }
                        ModeData::Rate(rates) => {
                            row.rate =
                                Some(rate_summary(&rates[i], fg_01, fg_10, all_mask, direction));
                        }
                    }
                }
            }
            None => {
                row.status = FamilyStatus::NoValidForeground;
            }
        }
    }
}
