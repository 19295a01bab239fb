//! Run configuration and validation.

use std::path::PathBuf;

use clap::ValueEnum;

use crate::error::{PhylopermError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Binary,
    Rate,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Binary => "binary",
            Mode::Rate => "rate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Direction {
    Gain,
    Loss,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Gain => "gain",
            Direction::Loss => "loss",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BinaryTest {
    Permutation,
    FisherTarone,
}

impl BinaryTest {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryTest::Permutation => "permutation",
            BinaryTest::FisherTarone => "fisher-tarone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AsrMethod {
    Ml,
}

impl AsrMethod {
    pub fn as_str(self) -> &'static str {
        "ml"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CladeBinScheme {
    Log2,
}

impl CladeBinScheme {
    pub fn as_str(self) -> &'static str {
        "log2"
    }
}

/// Fully resolved run configuration, mirroring the CLI surface.
#[derive(Debug, Clone)]
pub struct Config {
    pub cafe_dir: PathBuf,
    pub trait_tsv: PathBuf,
    pub trait_column: Option<String>,
    pub mode: Mode,
    pub direction: Direction,
    pub binary_test: BinaryTest,
    pub fwer_alpha: f64,
    pub include_trait_loss: bool,
    pub asr_method: AsrMethod,
    pub asr_posterior_hi: f64,
    pub asr_posterior_lo: f64,
    pub cafe_significant_only: bool,
    pub cafe_alpha: f64,
    pub n_perm_initial: usize,
    pub n_perm_refine: usize,
    pub refine_p_threshold: f64,
    pub clade_bin_scheme: CladeBinScheme,
    pub seed: Option<u64>,
    pub jobs: usize,
    pub out_prefix: PathBuf,
    pub perm_cache: Option<PathBuf>,
    pub qvalue_threshold: f64,
    pub pvalue_top_n: usize,
    pub hist_bins: usize,
    pub make_plots: bool,
}

impl Config {
    /// Configuration with CLI defaults for the given inputs.
    pub fn new(cafe_dir: impl Into<PathBuf>, trait_tsv: impl Into<PathBuf>) -> Self {
        Self {
            cafe_dir: cafe_dir.into(),
            trait_tsv: trait_tsv.into(),
            trait_column: None,
            mode: Mode::Binary,
            direction: Direction::Gain,
            binary_test: BinaryTest::Permutation,
            fwer_alpha: 0.05,
            include_trait_loss: true,
            asr_method: AsrMethod::Ml,
            asr_posterior_hi: 0.6,
            asr_posterior_lo: 0.4,
            cafe_significant_only: false,
            cafe_alpha: 0.05,
            n_perm_initial: 1000,
            n_perm_refine: 1_000_000,
            refine_p_threshold: 0.01,
            clade_bin_scheme: CladeBinScheme::Log2,
            seed: None,
            jobs: 1,
            out_prefix: PathBuf::from("phyloperm_results"),
            perm_cache: None,
            qvalue_threshold: 0.05,
            pvalue_top_n: 0,
            hist_bins: 20,
            make_plots: false,
        }
    }

    /// Check value ranges and flag compatibility.
    pub fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(PhylopermError::InvalidArgument(msg));

        if self.asr_posterior_lo < 0.0
            || self.asr_posterior_hi > 1.0
            || self.asr_posterior_lo >= self.asr_posterior_hi
        {
            return err("invalid ASR posterior thresholds: require 0 <= lo < hi <= 1".to_string());
        }
        if self.n_perm_initial == 0 {
            return err("--n-perm-initial must be > 0".to_string());
        }
        if self.n_perm_refine == 0 {
            return err("--n-perm-refine must be > 0".to_string());
        }
        if self.refine_p_threshold <= 0.0 || self.refine_p_threshold >= 1.0 {
            return err("--refine-p-threshold must be in (0, 1)".to_string());
        }
        if self.cafe_alpha <= 0.0 || self.cafe_alpha >= 1.0 {
            return err("--cafe-alpha must be in (0, 1)".to_string());
        }
        if self.fwer_alpha <= 0.0 || self.fwer_alpha >= 1.0 {
            return err("--fwer-alpha must be in (0, 1)".to_string());
        }
        if !(0.0..=1.0).contains(&self.qvalue_threshold) {
            return err("--qvalue-threshold must be in [0, 1]".to_string());
        }
        if self.hist_bins == 0 {
            return err("--hist-bins must be > 0".to_string());
        }

        if self.mode == Mode::Rate && self.cafe_significant_only {
            return err("--cafe-significant-only is valid only in binary mode".to_string());
        }
        if self.mode == Mode::Rate && self.binary_test == BinaryTest::FisherTarone {
            return err("--binary-test fisher-tarone is valid only in binary mode".to_string());
        }
        Ok(())
    }

    /// Whether the Fisher-Tarone path replaces the permutation test.
    pub fn fisher_path(&self) -> bool {
        self.mode == Mode::Binary && self.binary_test == BinaryTest::FisherTarone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::new("cafe", "traits.tsv");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_posterior_threshold_ordering() {
        let mut config = Config::new("cafe", "traits.tsv");
        config.asr_posterior_hi = 0.4;
        config.asr_posterior_lo = 0.6;
        assert!(config.validate().is_err());

        config.asr_posterior_hi = 0.5;
        config.asr_posterior_lo = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rate_mode_incompatibilities() {
        let mut config = Config::new("cafe", "traits.tsv");
        config.mode = Mode::Rate;
        config.cafe_significant_only = true;
        assert!(config.validate().is_err());

        config.cafe_significant_only = false;
        config.binary_test = BinaryTest::FisherTarone;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_range_checks() {
        let mut config = Config::new("cafe", "traits.tsv");
        config.n_perm_initial = 0;
        assert!(config.validate().is_err());

        let mut config = Config::new("cafe", "traits.tsv");
        config.refine_p_threshold = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::new("cafe", "traits.tsv");
        config.qvalue_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
