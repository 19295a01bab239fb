//! Result rows, ranked subsets, and diagnostic tables.

use std::fmt;
use std::path::Path;

use crate::error::Result;
use crate::stats::binary::BinarySummary;
use crate::stats::rate::RateSummary;

/// Observed statistic: an integer concordance count in binary mode, a
/// signed mean rate in rate mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatValue {
    Count(usize),
    Value(f64),
}

impl StatValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            StatValue::Count(c) => *c as f64,
            StatValue::Value(v) => *v,
        }
    }
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatValue::Count(c) => write!(f, "{c}"),
            StatValue::Value(v) => write!(f, "{v}"),
        }
    }
}

/// Per-family outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyStatus {
    Ok,
    UntestableTarone,
    NoValidForeground,
}

impl fmt::Display for FamilyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FamilyStatus::Ok => "ok",
            FamilyStatus::UntestableTarone => "untestable_tarone",
            FamilyStatus::NoValidForeground => "no_valid_foreground",
        };
        f.write_str(s)
    }
}

/// Fisher/Tarone fields for one family.
#[derive(Debug, Clone, Default)]
pub struct FisherFields {
    pub p_fisher: Option<f64>,
    pub p_min_attainable: Option<f64>,
    pub tarone_testable: bool,
    pub p_bonf_tarone: Option<f64>,
    pub reject_tarone: bool,
}

/// One family's full result row; extras are populated per mode and path.
#[derive(Debug, Clone)]
pub struct FamilyRow {
    pub family_id: String,
    pub mode: &'static str,
    pub direction: &'static str,
    pub include_trait_loss: bool,
    pub n_fg_01: usize,
    pub n_fg_10: usize,
    pub stat_obs: Option<StatValue>,
    pub p_empirical: Option<f64>,
    pub q_bh: Option<f64>,
    pub n_perm_used: usize,
    pub refined: bool,
    pub status: FamilyStatus,
    pub binary: Option<BinarySummary>,
    pub fisher: Option<FisherFields>,
    pub rate: Option<RateSummary>,
}

impl FamilyRow {
    pub fn new(
        family_id: String,
        mode: &'static str,
        direction: &'static str,
        include_trait_loss: bool,
        n_fg_01: usize,
        n_fg_10: usize,
    ) -> Self {
        Self {
            family_id,
            mode,
            direction,
            include_trait_loss,
            n_fg_01,
            n_fg_10,
            stat_obs: None,
            p_empirical: None,
            q_bh: None,
            n_perm_used: 0,
            refined: false,
            status: FamilyStatus::NoValidForeground,
            binary: None,
            fisher: None,
            rate: None,
        }
    }

    /// Primary p-value for ranking and diagnostics: empirical on the
    /// permutation path, Fisher on the Fisher-Tarone path.
    pub fn p_primary(&self) -> Option<f64> {
        if self.status != FamilyStatus::Ok {
            return None;
        }
        match &self.fisher {
            Some(fisher) => fisher.p_fisher,
            None => self.p_empirical,
        }
    }

    /// Adjusted p matching [`FamilyRow::p_primary`].
    pub fn p_adjusted(&self) -> Option<f64> {
        match &self.fisher {
            Some(fisher) => fisher.p_bonf_tarone,
            None => self.q_bh,
        }
    }

    fn field_value(&self, field: &str) -> String {
        match field {
            "family_id" => self.family_id.clone(),
            "mode" => self.mode.to_string(),
            "direction" => self.direction.to_string(),
            "include_trait_loss" => self.include_trait_loss.to_string(),
            "n_fg_01" => self.n_fg_01.to_string(),
            "n_fg_10" => self.n_fg_10.to_string(),
            "stat_obs" => opt_str(self.stat_obs.as_ref()),
            "p_empirical" => opt_str(self.p_empirical.as_ref()),
            "q_bh" => opt_str(self.q_bh.as_ref()),
            "n_perm_used" => self.n_perm_used.to_string(),
            "refined" => self.refined.to_string(),
            "status" => self.status.to_string(),
            "fg_concordant_count" => {
                opt_str(self.binary.as_ref().map(|b| b.fg_concordant_count).as_ref())
            }
            "fg_total" => opt_str(self.binary.as_ref().map(|b| b.fg_total).as_ref()),
            "bg_concordant_count" => {
                opt_str(self.binary.as_ref().map(|b| b.bg_concordant_count).as_ref())
            }
            "bg_total" => opt_str(self.binary.as_ref().map(|b| b.bg_total).as_ref()),
            "fg_concordance_rate" => {
                opt_str(self.binary.as_ref().and_then(|b| b.fg_concordance_rate).as_ref())
            }
            "bg_concordance_rate" => {
                opt_str(self.binary.as_ref().and_then(|b| b.bg_concordance_rate).as_ref())
            }
            "p_fisher" => opt_str(self.fisher.as_ref().and_then(|f| f.p_fisher).as_ref()),
            "p_min_attainable" => {
                opt_str(self.fisher.as_ref().and_then(|f| f.p_min_attainable).as_ref())
            }
            "tarone_testable" => self
                .fisher
                .as_ref()
                .map(|f| f.tarone_testable.to_string())
                .unwrap_or_default(),
            "p_bonf_tarone" => {
                opt_str(self.fisher.as_ref().and_then(|f| f.p_bonf_tarone).as_ref())
            }
            "reject_tarone" => self
                .fisher
                .as_ref()
                .map(|f| f.reject_tarone.to_string())
                .unwrap_or_default(),
            "fg_mean_signed_rate" => {
                opt_str(self.rate.as_ref().and_then(|r| r.fg_mean_signed_rate).as_ref())
            }
            "bg_mean_signed_rate" => {
                opt_str(self.rate.as_ref().and_then(|r| r.bg_mean_signed_rate).as_ref())
            }
            "fg_median_signed_rate" => {
                opt_str(self.rate.as_ref().and_then(|r| r.fg_median_signed_rate).as_ref())
            }
            "bg_median_signed_rate" => {
                opt_str(self.rate.as_ref().and_then(|r| r.bg_median_signed_rate).as_ref())
            }
            _ => String::new(),
        }
    }
}

fn opt_str<T: fmt::Display>(value: Option<&T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Column list for the family results table under the active mode/path.
pub fn family_fieldnames(mode: &str, fisher_path: bool) -> Vec<&'static str> {
    let mut base = vec![
        "family_id",
        "mode",
        "direction",
        "include_trait_loss",
        "n_fg_01",
        "n_fg_10",
        "stat_obs",
        "p_empirical",
        "q_bh",
        "n_perm_used",
        "refined",
        "status",
    ];
    if mode == "binary" {
        base.extend([
            "fg_concordant_count",
            "fg_total",
            "bg_concordant_count",
            "bg_total",
            "fg_concordance_rate",
            "bg_concordance_rate",
        ]);
        if fisher_path {
            base.extend([
                "p_fisher",
                "p_min_attainable",
                "tarone_testable",
                "p_bonf_tarone",
                "reject_tarone",
            ]);
        }
    } else {
        base.extend([
            "fg_mean_signed_rate",
            "bg_mean_signed_rate",
            "fg_median_signed_rate",
            "bg_median_signed_rate",
        ]);
    }
    base
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<std::fs::File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::PhylopermError::io(path, e))?;
        }
    }
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?)
}

/// Write the full per-family result table.
pub fn write_family_results(path: &Path, rows: &[FamilyRow], fields: &[&str]) -> Result<()> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(fields)?;
    for row in rows {
        let record: Vec<String> = fields.iter().map(|&f| row.field_value(f)).collect();
        writer.write_record(&record)?;
    }
    writer.flush().map_err(|e| crate::error::PhylopermError::io(path, e))?;
    Ok(())
}

fn none_last(v: Option<f64>) -> f64 {
    v.unwrap_or(f64::INFINITY)
}

fn stat_desc(row: &FamilyRow) -> f64 {
    -row.stat_obs.map(|s| s.as_f64()).unwrap_or(0.0)
}

fn rank_cmp(a: (f64, f64, f64), b: (f64, f64, f64)) -> std::cmp::Ordering {
    a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
}

/// Write top hits: families passing the adjusted-p threshold, ranked.
///
/// Permutation path: `q_bh <= threshold`, ranked by (q, p, -stat).
/// Fisher-Tarone path: `reject_tarone`, ranked by (p_bonf, p_fisher, -stat).
pub fn write_top_hits(
    path: &Path,
    rows: &[FamilyRow],
    qvalue_threshold: f64,
    fisher_path: bool,
) -> Result<usize> {
    let mut keep: Vec<&FamilyRow> = if fisher_path {
        rows.iter()
            .filter(|r| r.fisher.as_ref().map(|f| f.reject_tarone).unwrap_or(false))
            .collect()
    } else {
        rows.iter()
            .filter(|r| r.q_bh.map(|q| q <= qvalue_threshold).unwrap_or(false))
            .collect()
    };
    keep.sort_by(|&a, &b| {
        rank_cmp(
            (none_last(a.p_adjusted()), none_last(a.p_primary()), stat_desc(a)),
            (none_last(b.p_adjusted()), none_last(b.p_primary()), stat_desc(b)),
        )
    });

    let (p_adj_col, p_col) = if fisher_path {
        ("p_bonf_tarone", "p_fisher")
    } else {
        ("q_bh", "p_empirical")
    };
    let mut writer = tsv_writer(path)?;
    writer.write_record([
        "rank",
        "family_id",
        p_adj_col,
        p_col,
        "stat_obs",
        "mode",
        "direction",
        "status",
    ])?;
    for (i, row) in keep.iter().enumerate() {
        writer.write_record([
            (i + 1).to_string(),
            row.family_id.clone(),
            opt_str(row.p_adjusted().as_ref()),
            opt_str(row.p_primary().as_ref()),
            opt_str(row.stat_obs.as_ref()),
            row.mode.to_string(),
            row.direction.to_string(),
            row.status.to_string(),
        ])?;
    }
    writer.flush().map_err(|e| crate::error::PhylopermError::io(path, e))?;
    Ok(keep.len())
}

/// Write the top-N families by primary p-value.
pub fn write_top_pvalues(
    path: &Path,
    rows: &[FamilyRow],
    top_n: usize,
    fisher_path: bool,
) -> Result<()> {
    let mut ranked: Vec<&FamilyRow> = rows.iter().filter(|r| r.p_primary().is_some()).collect();
    ranked.sort_by(|&a, &b| {
        rank_cmp(
            (none_last(a.p_primary()), none_last(a.p_adjusted()), stat_desc(a)),
            (none_last(b.p_primary()), none_last(b.p_adjusted()), stat_desc(b)),
        )
    });
    ranked.truncate(top_n);

    let (p_col, p_adj_col) = if fisher_path {
        ("p_fisher", "p_bonf_tarone")
    } else {
        ("p_empirical", "q_bh")
    };
    let mut writer = tsv_writer(path)?;
    writer.write_record([
        "rank",
        "family_id",
        p_col,
        p_adj_col,
        "stat_obs",
        "mode",
        "direction",
        "status",
    ])?;
    for (i, row) in ranked.iter().enumerate() {
        writer.write_record([
            (i + 1).to_string(),
            row.family_id.clone(),
            opt_str(row.p_primary().as_ref()),
            opt_str(row.p_adjusted().as_ref()),
            opt_str(row.stat_obs.as_ref()),
            row.mode.to_string(),
            row.direction.to_string(),
            row.status.to_string(),
        ])?;
    }
    writer.flush().map_err(|e| crate::error::PhylopermError::io(path, e))?;
    Ok(())
}

/// Equal-width p-value histogram over [0, 1].
pub fn histogram_rows(pvalues: &[f64], bins: usize) -> Vec<(f64, f64, usize)> {
    let bins = bins.max(1);
    let mut counts = vec![0usize; bins];
    for &p in pvalues {
        let p = p.clamp(0.0, 1.0);
        let idx = ((p * bins as f64) as usize).min(bins - 1);
        counts[idx] += 1;
    }

    let width = 1.0 / bins as f64;
    counts
        .into_iter()
        .enumerate()
        .map(|(i, c)| (i as f64 * width, (i + 1) as f64 * width, c))
        .collect()
}

/// Write the histogram table.
pub fn write_histogram(path: &Path, rows: &[(f64, f64, usize)]) -> Result<()> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(["bin_start", "bin_end", "count"])?;
    for (start, end, count) in rows {
        writer.write_record([start.to_string(), end.to_string(), count.to_string()])?;
    }
    writer.flush().map_err(|e| crate::error::PhylopermError::io(path, e))?;
    Ok(())
}

/// One QQ table row.
#[derive(Debug, Clone, PartialEq)]
pub struct QqRow {
    pub rank: usize,
    pub observed_p: f64,
    pub expected_p: f64,
    pub minus_log10_observed: f64,
    pub minus_log10_expected: f64,
}

/// Expected-vs-observed p-value table for QQ diagnostics.
pub fn qq_rows(pvalues: &[f64]) -> Vec<QqRow> {
    let n = pvalues.len();
    let mut obs: Vec<f64> = pvalues.iter().map(|&p| p.clamp(1e-300, 1.0)).collect();
    obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    obs.into_iter()
        .enumerate()
        .map(|(i, p)| {
            let rank = i + 1;
            let expected = rank as f64 / (n as f64 + 1.0);
            QqRow {
                rank,
                observed_p: p,
                expected_p: expected,
                minus_log10_observed: -p.log10(),
                minus_log10_expected: -expected.log10(),
            }
        })
        .collect()
}

/// Write the QQ table.
pub fn write_qq(path: &Path, rows: &[QqRow]) -> Result<()> {
    let mut writer = tsv_writer(path)?;
    writer.write_record([
        "rank",
        "observed_p",
        "expected_p",
        "minus_log10_observed",
        "minus_log10_expected",
    ])?;
    for row in rows {
        writer.write_record([
            row.rank.to_string(),
            row.observed_p.to_string(),
            row.expected_p.to_string(),
            row.minus_log10_observed.to_string(),
            row.minus_log10_expected.to_string(),
        ])?;
    }
    writer.flush().map_err(|e| crate::error::PhylopermError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_row(id: &str, p: Option<f64>, q: Option<f64>, stat: usize) -> FamilyRow {
        let mut row = FamilyRow::new(id.to_string(), "binary", "gain", true, 1, 0);
        row.p_empirical = p;
        row.q_bh = q;
        row.stat_obs = Some(StatValue::Count(stat));
        row.status = FamilyStatus::Ok;
        row
    }

    #[test]
    fn test_histogram_rows() {
        let rows = histogram_rows(&[0.0, 0.05, 0.5, 0.999, 1.0], 20);
        assert_eq!(rows.len(), 20);
        assert_eq!(rows[0].2, 2);
        assert_eq!(rows[10].2, 1);
        assert_eq!(rows[19].2, 2);
        let total: usize = rows.iter().map(|r| r.2).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_qq_rows() {
        let rows = qq_rows(&[0.5, 0.1]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].observed_p, 0.1);
        assert!((rows[0].expected_p - 1.0 / 3.0).abs() < 1e-12);
        assert!((rows[1].expected_p - 2.0 / 3.0).abs() < 1e-12);
        assert!(rows[0].minus_log10_observed > rows[1].minus_log10_observed);
    }

    #[test]
    fn test_top_hits_filter_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("top.tsv");
        let rows = vec![
            toy_row("f1", Some(0.2), Some(0.3), 1),
            toy_row("f2", Some(0.001), Some(0.01), 3),
            toy_row("f3", Some(0.002), Some(0.01), 5),
        ];
        let n = write_top_hits(&path, &rows, 0.05, false).unwrap();
        assert_eq!(n, 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        // Tie on q resolves by smaller p.
        assert!(lines[1].contains("f2"));
        assert!(lines[2].contains("f3"));
    }

    #[test]
    fn test_top_hits_header_only_when_none_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("top.tsv");
        let rows = vec![toy_row("f1", Some(0.5), Some(0.9), 1)];
        let n = write_top_hits(&path, &rows, 0.05, false).unwrap();
        assert_eq!(n, 0);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn test_family_fieldnames_by_mode() {
        let perm = family_fieldnames("binary", false);
        assert!(perm.contains(&"fg_concordant_count"));
        assert!(!perm.contains(&"p_fisher"));

        let fisher = family_fieldnames("binary", true);
        assert!(fisher.contains(&"p_fisher"));
        assert!(fisher.contains(&"reject_tarone"));

        let rate = family_fieldnames("rate", false);
        assert!(rate.contains(&"fg_mean_signed_rate"));
        assert!(!rate.contains(&"fg_total"));
    }

    #[test]
    fn test_family_row_record_blank_cells() {
        let row = FamilyRow::new("f".to_string(), "binary", "gain", false, 0, 0);
        assert_eq!(row.field_value("p_empirical"), "");
        assert_eq!(row.field_value("status"), "no_valid_foreground");
        assert_eq!(row.field_value("stat_obs"), "");
    }
}
