//! End-to-end pipeline scenarios driving the library `run()` with
//! tempdir-staged CAFE inputs.

use std::fs;
use std::path::{Path, PathBuf};

use phyloperm::config::{BinaryTest, Config, Direction, Mode};
use phyloperm::report::FamilyStatus;
use phyloperm::run;

const NEXUS4: &str = "#nexus\nBEGIN TREES;\n  TREE t1 = ((A<0>_0:1.0,B<1>_1:1.0)<2>_0:1.0,(C<3>_1:1.0,D<4>_0:1.0)<5>_1:1.0)<6>_0;\nEND;\n";

const CHANGE_HEADER: &str = "FamilyID\tA<0>\tB<1>\t<2>\tC<3>\tD<4>\t<5>\t<6>\n";

const TRAIT_D_GAIN: &str = "species\ttrait\nA\t0\nB\t0\nC\t0\nD\t1\n";

fn stage_inputs(dir: &Path, change_rows: &str, trait_tsv: &str) -> (PathBuf, PathBuf) {
    let cafe_dir = dir.join("cafe");
    fs::create_dir_all(&cafe_dir).unwrap();
    fs::write(cafe_dir.join("Gamma_asr.tre"), NEXUS4).unwrap();
    fs::write(
        cafe_dir.join("Gamma_change.tab"),
        format!("{CHANGE_HEADER}{change_rows}"),
    )
    .unwrap();
    let trait_path = dir.join("traits.tsv");
    fs::write(&trait_path, trait_tsv).unwrap();
    (cafe_dir, trait_path)
}

fn base_config(dir: &Path, change_rows: &str, trait_tsv: &str, tag: &str) -> Config {
    let (cafe_dir, trait_path) = stage_inputs(dir, change_rows, trait_tsv);
    let mut config = Config::new(cafe_dir, trait_path);
    config.out_prefix = dir.join(tag);
    config.seed = Some(7);
    config.n_perm_initial = 20;
    config.n_perm_refine = 50;
    config
}

/// Parse a TSV into (header, rows-of-cells).
fn read_tsv(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let text = fs::read_to_string(path).unwrap();
    let mut lines = text.lines();
    let header: Vec<String> = lines
        .next()
        .unwrap()
        .split('\t')
        .map(|s| s.to_string())
        .collect();
    let rows = lines
        .map(|l| l.split('\t').map(|s| s.to_string()).collect())
        .collect();
    (header, rows)
}

fn cell<'a>(header: &[String], row: &'a [String], name: &str) -> &'a str {
    let idx = header.iter().position(|h| h == name).unwrap();
    &row[idx]
}

fn read_metadata(prefix: &Path) -> serde_json::Value {
    let path = PathBuf::from(format!("{}.run_metadata.json", prefix.display()));
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn deterministic_toy_single_family() {
    let dir = tempfile::tempdir().unwrap();
    // One family with a gain exactly on the trait-gain branch D.
    let mut config = base_config(
        dir.path(),
        "fam1\t0\t0\t0\t0\t1\t0\t0\n",
        TRAIT_D_GAIN,
        "s1",
    );
    config.include_trait_loss = false;

    let summary = run(&config).unwrap();
    assert_eq!(summary.n_families, 1);
    assert_eq!(summary.n_tested, 1);
    assert_eq!(summary.n_refined, 0);

    let (header, rows) = read_tsv(&summary.family_results_tsv);
    assert_eq!(rows.len(), 1);
    let row = &rows[0];

    assert_eq!(cell(&header, row, "family_id"), "fam1");
    assert_eq!(cell(&header, row, "status"), "ok");
    assert_eq!(cell(&header, row, "n_fg_01"), "1");
    assert_eq!(cell(&header, row, "refined"), "false");
    assert_eq!(cell(&header, row, "n_perm_used"), "20");

    let stat: f64 = cell(&header, row, "stat_obs").parse().unwrap();
    assert!(stat >= 1.0);

    // Exact Monte Carlo form: p = (k + 1) / 21 for integer k.
    let p: f64 = cell(&header, row, "p_empirical").parse().unwrap();
    let scaled = p * 21.0;
    assert!((scaled - scaled.round()).abs() < 1e-9, "p = {p}");
    assert!(p >= 1.0 / 21.0 && p <= 1.0);

    // With one family, BH leaves the p-value untouched.
    let q: f64 = cell(&header, row, "q_bh").parse().unwrap();
    assert!((q - p).abs() < 1e-12);

    // Diagnostics exist because a p-value is defined.
    let prefix = config.out_prefix.display().to_string();
    assert!(PathBuf::from(format!("{prefix}.pvalue_hist.tsv")).exists());
    assert!(PathBuf::from(format!("{prefix}.qq.tsv")).exists());

    // Top hits has only the header when the threshold is below q.
    if q > config.qvalue_threshold {
        let text = fs::read_to_string(format!("{prefix}.top_hits.tsv")).unwrap();
        assert_eq!(text.lines().count(), 1);
    }
}

#[test]
fn no_foreground_guard() {
    let dir = tempfile::tempdir().unwrap();
    // All trait values equal: no transitions anywhere.
    let config = base_config(
        dir.path(),
        "fam1\t1\t0\t0\t0\t1\t0\t0\nfam2\t0\t0\t2\t0\t0\t0\t0\n",
        "species\ttrait\nA\t0\nB\t0\nC\t0\nD\t0\n",
        "s2",
    );

    let summary = run(&config).unwrap();
    assert_eq!(summary.n_families, 2);
    assert_eq!(summary.n_tested, 0);

    let (header, rows) = read_tsv(&summary.family_results_tsv);
    for row in &rows {
        assert_eq!(cell(&header, row, "status"), "no_valid_foreground");
        assert_eq!(cell(&header, row, "p_empirical"), "");
        assert_eq!(cell(&header, row, "stat_obs"), "");
    }

    let prefix = config.out_prefix.display().to_string();
    assert!(!PathBuf::from(format!("{prefix}.pvalue_hist.tsv")).exists());
    assert!(!PathBuf::from(format!("{prefix}.qq.tsv")).exists());
}

#[test]
fn tarone_untestable_family() {
    let dir = tempfile::tempdir().unwrap();
    // famA is concordant on every branch (fixed margins push its minimum
    // attainable p to 1); famB concentrates its gain on the foreground.
    let mut config = base_config(
        dir.path(),
        "famA\t1\t1\t1\t1\t1\t1\t0\nfamB\t0\t0\t0\t0\t1\t0\t0\n",
        TRAIT_D_GAIN,
        "s3",
    );
    config.binary_test = BinaryTest::FisherTarone;
    config.fwer_alpha = 0.2;
    config.include_trait_loss = false;

    let summary = run(&config).unwrap();
    assert_eq!(summary.n_tested, 1);

    let (header, rows) = read_tsv(&summary.family_results_tsv);
    let find = |id: &str| {
        rows.iter()
            .find(|&r| cell(&header, r, "family_id") == id)
            .unwrap()
    };

    let fam_a = find("famA");
    assert_eq!(cell(&header, fam_a, "status"), "untestable_tarone");
    assert_eq!(cell(&header, fam_a, "tarone_testable"), "false");
    assert_eq!(cell(&header, fam_a, "p_bonf_tarone"), "");
    let p_min_a: f64 = cell(&header, fam_a, "p_min_attainable").parse().unwrap();
    assert!((p_min_a - 1.0).abs() < 1e-9);

    let fam_b = find("famB");
    assert_eq!(cell(&header, fam_b, "status"), "ok");
    assert_eq!(cell(&header, fam_b, "tarone_testable"), "true");
    let p_fisher: f64 = cell(&header, fam_b, "p_fisher").parse().unwrap();
    let p_bonf: f64 = cell(&header, fam_b, "p_bonf_tarone").parse().unwrap();
    // m_testable = 1, so the Tarone-Bonferroni denominator is 1.
    assert!((p_bonf - p_fisher).abs() < 1e-12);
    assert!((p_fisher - 1.0 / 6.0).abs() < 1e-9);
    assert_eq!(cell(&header, fam_b, "reject_tarone"), "true");

    // Permutation fields stay absent on this path.
    assert_eq!(cell(&header, fam_b, "p_empirical"), "");
    assert_eq!(cell(&header, fam_b, "q_bh"), "");

    let metadata = read_metadata(&config.out_prefix);
    assert_eq!(metadata["tarone"]["m_total"], 2);
    assert_eq!(metadata["tarone"]["m_testable"], 1);
    assert!(metadata["permutation"].is_null());
}

#[test]
fn cache_reuse_and_invalidation() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("perm_cache.json.gz");
    let change = "fam1\t0\t0\t0\t0\t1\t0\t0\nfam2\t-1\t0\t0\t0\t2\t0\t0\n";

    let mut config_a = base_config(dir.path(), change, TRAIT_D_GAIN, "s4a");
    config_a.seed = Some(42);
    config_a.perm_cache = Some(cache_path.clone());
    let summary_a = run(&config_a).unwrap();
    assert!(cache_path.exists());
    let bytes_a = fs::read(&summary_a.family_results_tsv).unwrap();

    let metadata_a = read_metadata(&config_a.out_prefix);
    assert_eq!(metadata_a["permutation"]["cache_loaded"], false);
    assert_eq!(metadata_a["permutation"]["initial"]["source"], "generated");

    // Run B: identical flags, fresh prefix; must reuse the cache and
    // reproduce outputs byte for byte.
    let mut config_b = config_a.clone();
    config_b.out_prefix = dir.path().join("s4b");
    let summary_b = run(&config_b).unwrap();
    let bytes_b = fs::read(&summary_b.family_results_tsv).unwrap();
    assert_eq!(bytes_a, bytes_b);

    let metadata_b = read_metadata(&config_b.out_prefix);
    assert_eq!(metadata_b["permutation"]["cache_loaded"], true);
    assert_eq!(metadata_b["permutation"]["initial"]["source"], "cache");

    // Run C: flipping include_trait_loss changes the fingerprint; the
    // cache must be discarded and the run still succeed.
    let mut config_c = config_a.clone();
    config_c.out_prefix = dir.path().join("s4c");
    config_c.include_trait_loss = false;
    let summary_c = run(&config_c).unwrap();
    assert_eq!(summary_c.n_tested, 2);

    let metadata_c = read_metadata(&config_c.out_prefix);
    assert_eq!(metadata_c["permutation"]["cache_loaded"], false);
    assert!(metadata_c["permutation"]["cache_ignored_reason"]
        .as_str()
        .unwrap()
        .contains("include_trait_loss"));
}

#[test]
fn cache_extension_from_same_stream() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("perm_cache.json");
    let change = "fam1\t0\t0\t0\t0\t1\t0\t0\n";

    let mut config_small = base_config(dir.path(), change, TRAIT_D_GAIN, "s4e1");
    config_small.seed = Some(11);
    config_small.n_perm_initial = 10;
    config_small.perm_cache = Some(cache_path.clone());
    run(&config_small).unwrap();

    // Same seed, larger stage: the cached prefix is extended, and the
    // result equals a from-scratch run at the larger size.
    let mut config_big = config_small.clone();
    config_big.out_prefix = dir.path().join("s4e2");
    config_big.n_perm_initial = 20;
    let summary_big = run(&config_big).unwrap();

    let metadata = read_metadata(&config_big.out_prefix);
    assert_eq!(
        metadata["permutation"]["initial"]["source"],
        "cache_extended"
    );
    assert_eq!(metadata["permutation"]["initial"]["n_perm"], 20);

    let mut config_fresh = config_small.clone();
    config_fresh.out_prefix = dir.path().join("s4e3");
    config_fresh.n_perm_initial = 20;
    config_fresh.perm_cache = None;
    let summary_fresh = run(&config_fresh).unwrap();

    assert_eq!(
        fs::read(&summary_big.family_results_tsv).unwrap(),
        fs::read(&summary_fresh.family_results_tsv).unwrap()
    );
}

#[test]
fn parallel_determinism_across_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let change = "fam1\t0\t1\t0\t0\t1\t0\t0\nfam2\t-1\t0\t1\t0\t2\t0\t0\nfam3\t0\t0\t0\t0\t0\t-1\t0\n";

    let mut baseline: Option<Vec<u8>> = None;
    for (tag, jobs) in [("j1", 1usize), ("j2", 2), ("j4", 4), ("j0", 0)] {
        let mut config = base_config(dir.path(), change, TRAIT_D_GAIN, tag);
        config.seed = Some(97);
        config.jobs = jobs;
        let summary = run(&config).unwrap();
        let bytes = fs::read(&summary.family_results_tsv).unwrap();
        match &baseline {
            None => baseline = Some(bytes),
            Some(expected) => assert_eq!(expected, &bytes, "jobs={jobs} diverged"),
        }
    }
}

#[test]
fn rate_mode_sanity() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(
        dir.path(),
        "famR\t0\t0\t0\t0\t2\t0\t0\n",
        TRAIT_D_GAIN,
        "s6",
    );
    config.mode = Mode::Rate;
    config.seed = Some(5);
    config.n_perm_initial = 40;
    config.n_perm_refine = 40;

    let summary = run(&config).unwrap();
    assert_eq!(summary.n_tested, 1);

    let (header, rows) = read_tsv(&summary.family_results_tsv);
    let row = &rows[0];
    let stat: f64 = cell(&header, row, "stat_obs").parse().unwrap();
    assert!((stat - 2.0).abs() < 1e-12);
    let fg_mean: f64 = cell(&header, row, "fg_mean_signed_rate").parse().unwrap();
    assert!((fg_mean - 2.0).abs() < 1e-12);
    let bg_mean: f64 = cell(&header, row, "bg_mean_signed_rate").parse().unwrap();
    assert!(bg_mean.abs() < 1e-12);

    // The observed statistic is the maximum attainable, so only samples
    // that re-draw the same branch reach it.
    let p: f64 = cell(&header, row, "p_empirical").parse().unwrap();
    assert!(p < 0.5, "p = {p}");
}

#[test]
fn rate_mode_rejects_zero_length_branch() {
    let dir = tempfile::tempdir().unwrap();
    let cafe_dir = dir.path().join("cafe");
    fs::create_dir_all(&cafe_dir).unwrap();
    fs::write(
        cafe_dir.join("Gamma_asr.tre"),
        "#nexus\nBEGIN TREES;\n  TREE t1 = ((A<0>_0:1.0,B<1>_1:0.0)<2>_0:1.0,(C<3>_1:1.0,D<4>_0:1.0)<5>_1:1.0)<6>_0;\nEND;\n",
    )
    .unwrap();
    fs::write(
        cafe_dir.join("Gamma_change.tab"),
        format!("{CHANGE_HEADER}fam1\t0\t0\t0\t0\t1\t0\t0\n"),
    )
    .unwrap();
    let trait_path = dir.path().join("traits.tsv");
    fs::write(&trait_path, TRAIT_D_GAIN).unwrap();

    let mut config = Config::new(cafe_dir, trait_path);
    config.out_prefix = dir.path().join("rate_err");
    config.mode = Mode::Rate;
    config.seed = Some(1);

    let err = run(&config).unwrap_err();
    assert!(err.to_string().contains("rate mode"));
}

#[test]
fn refinement_marks_families() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(
        dir.path(),
        "fam1\t0\t0\t0\t0\t1\t0\t0\n",
        TRAIT_D_GAIN,
        "refine",
    );
    config.seed = Some(13);
    config.n_perm_initial = 20;
    config.n_perm_refine = 60;
    // Force every tested family through refinement.
    config.refine_p_threshold = 0.99;

    let summary = run(&config).unwrap();
    assert_eq!(summary.n_refined, 1);

    let (header, rows) = read_tsv(&summary.family_results_tsv);
    assert_eq!(cell(&header, &rows[0], "refined"), "true");
    assert_eq!(cell(&header, &rows[0], "n_perm_used"), "60");

    // With refine <= initial the stage is a no-op.
    let mut config_noop = config.clone();
    config_noop.out_prefix = dir.path().join("refine_noop");
    config_noop.n_perm_refine = 20;
    let summary_noop = run(&config_noop).unwrap();
    assert_eq!(summary_noop.n_refined, 0);
    let (header, rows) = read_tsv(&summary_noop.family_results_tsv);
    assert_eq!(cell(&header, &rows[0], "refined"), "false");
}

#[test]
fn direction_flip_with_relabeled_trait_matches() {
    let dir = tempfile::tempdir().unwrap();
    let change = "fam1\t0\t0\t0\t0\t1\t0\t0\nfam2\t1\t0\t-1\t0\t0\t0\t0\n";

    let mut config_gain = base_config(dir.path(), change, TRAIT_D_GAIN, "flip_gain");
    config_gain.seed = Some(23);
    let summary_gain = run(&config_gain).unwrap();

    let (cafe_dir, _) = stage_inputs(&dir.path().join("flipped"), change, TRAIT_D_GAIN);
    let trait_flipped = dir.path().join("traits_flipped.tsv");
    fs::write(&trait_flipped, "species\ttrait\nA\t1\nB\t1\nC\t1\nD\t0\n").unwrap();

    let mut config_loss = Config::new(cafe_dir, trait_flipped);
    config_loss.out_prefix = dir.path().join("flip_loss");
    config_loss.seed = Some(23);
    config_loss.n_perm_initial = 20;
    config_loss.n_perm_refine = 50;
    config_loss.direction = Direction::Loss;
    let summary_loss = run(&config_loss).unwrap();

    let (header_g, rows_g) = read_tsv(&summary_gain.family_results_tsv);
    let (header_l, rows_l) = read_tsv(&summary_loss.family_results_tsv);
    for (row_g, row_l) in rows_g.iter().zip(rows_l.iter()) {
        assert_eq!(
            cell(&header_g, row_g, "p_empirical"),
            cell(&header_l, row_l, "p_empirical")
        );
        assert_eq!(
            cell(&header_g, row_g, "stat_obs"),
            cell(&header_l, row_l, "stat_obs")
        );
    }
}

#[test]
fn status_display_is_stable() {
    assert_eq!(FamilyStatus::Ok.to_string(), "ok");
    assert_eq!(
        FamilyStatus::UntestableTarone.to_string(),
        "untestable_tarone"
    );
    assert_eq!(
        FamilyStatus::NoValidForeground.to_string(),
        "no_valid_foreground"
    );
}
