use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use phyloperm::config::{AsrMethod, BinaryTest, CladeBinScheme, Config, Direction, Mode};

#[derive(Parser)]
#[command(name = "phyloperm")]
#[command(about = "Permutation-based copy number / trait association testing")]
#[command(version)]
struct Cli {
    /// Directory containing CAFE output files
    #[arg(long)]
    cafe_dir: PathBuf,

    /// Trait TSV path
    #[arg(long)]
    trait_tsv: PathBuf,

    /// Trait column name in the trait TSV (auto-detected if omitted)
    #[arg(long)]
    trait_column: Option<String>,

    /// Statistic selection
    #[arg(long, value_enum, default_value = "binary")]
    mode: Mode,

    /// Sign convention for concordance
    #[arg(long, value_enum, default_value = "gain")]
    direction: Direction,

    /// Test path in binary mode
    #[arg(long, value_enum, default_value = "permutation")]
    binary_test: BinaryTest,

    /// Family-wise error rate for Tarone screening
    #[arg(long, default_value_t = 0.05)]
    fwer_alpha: f64,

    /// Include 1->0 trait-loss branches in the foreground
    #[arg(long, default_value_t = true, overrides_with = "no_include_trait_loss")]
    include_trait_loss: bool,

    /// Exclude 1->0 trait-loss branches from the foreground
    #[arg(long)]
    no_include_trait_loss: bool,

    /// Ancestral-state reconstruction method
    #[arg(long, value_enum, default_value = "ml")]
    asr_method: AsrMethod,

    /// Posterior at or above which a node is called state 1
    #[arg(long, default_value_t = 0.6)]
    asr_posterior_hi: f64,

    /// Posterior at or below which a node is called state 0
    #[arg(long, default_value_t = 0.4)]
    asr_posterior_lo: f64,

    /// Restrict binary counting to CAFE-significant branches
    #[arg(long)]
    cafe_significant_only: bool,

    /// Branch-probability cutoff for the significance filter
    #[arg(long, default_value_t = 0.05)]
    cafe_alpha: f64,

    /// Permutations for the initial stage
    #[arg(long, default_value_t = 1000)]
    n_perm_initial: usize,

    /// Permutations for the refinement stage
    #[arg(long, default_value_t = 1_000_000)]
    n_perm_refine: usize,

    /// Initial p-value at or below which a family is refined
    #[arg(long, default_value_t = 0.01)]
    refine_p_threshold: f64,

    /// Clade-size binning scheme
    #[arg(long, value_enum, default_value = "log2")]
    clade_bin_scheme: CladeBinScheme,

    /// RNG seed (random if omitted)
    #[arg(long)]
    seed: Option<u64>,

    /// Worker count (1 = sequential, 0 = auto to CPU count)
    #[arg(long, default_value_t = 1)]
    jobs: usize,

    /// Prefix for output files
    #[arg(long, default_value = "phyloperm_results")]
    out_prefix: PathBuf,

    /// Optional JSON/JSON.GZ permutation cache file
    #[arg(long)]
    perm_cache: Option<PathBuf>,

    /// Write families with q <= threshold to <out-prefix>.top_hits.tsv
    #[arg(long, default_value_t = 0.05)]
    qvalue_threshold: f64,

    /// Write the top N families by p-value (0 disables)
    #[arg(long, default_value_t = 0)]
    pvalue_top_n: usize,

    /// Bins for the p-value histogram output
    #[arg(long, default_value_t = 20)]
    hist_bins: usize,

    /// Generate histogram/QQ plot outputs
    #[arg(long)]
    make_plots: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        let mut config = Config::new(self.cafe_dir, self.trait_tsv);
        config.trait_column = self.trait_column;
        config.mode = self.mode;
        config.direction = self.direction;
        config.binary_test = self.binary_test;
        config.fwer_alpha = self.fwer_alpha;
        config.include_trait_loss = self.include_trait_loss && !self.no_include_trait_loss;
        config.asr_method = self.asr_method;
        config.asr_posterior_hi = self.asr_posterior_hi;
        config.asr_posterior_lo = self.asr_posterior_lo;
        config.cafe_significant_only = self.cafe_significant_only;
        config.cafe_alpha = self.cafe_alpha;
        config.n_perm_initial = self.n_perm_initial;
        config.n_perm_refine = self.n_perm_refine;
        config.refine_p_threshold = self.refine_p_threshold;
        config.clade_bin_scheme = self.clade_bin_scheme;
        config.seed = self.seed;
        config.jobs = self.jobs;
        config.out_prefix = self.out_prefix;
        config.perm_cache = self.perm_cache;
        config.qvalue_threshold = self.qvalue_threshold;
        config.pvalue_top_n = self.pvalue_top_n;
        config.hist_bins = self.hist_bins;
        config.make_plots = self.make_plots;
        config
    }
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.into_config();

    match phyloperm::run(&config) {
        Ok(summary) => {
            println!(
                "Wrote family results: {}",
                summary.family_results_tsv.display()
            );
            println!("Wrote metadata: {}", summary.metadata_json.display());
            println!("Families analyzed: {}", summary.n_families);
            println!("Families tested: {}", summary.n_tested);
            if summary.n_refined > 0 {
                println!("Families refined: {}", summary.n_refined);
            }
            std::process::ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("ERROR: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}
