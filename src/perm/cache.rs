//! Permutation cache persistence.
//!
//! The cache is a UTF-8 JSON container (gzipped when the path ends in
//! `.gz`) keyed by a compatibility fingerprint. A mismatch on any
//! fingerprint field discards the bundle and regenerates; a compatible
//! stage with matching seed and too few samples is extended from the same
//! seed-derived stream.

use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{PhylopermError, Result};
use crate::mask::BranchMask;
use crate::perm::engine::SampleBlock;
use crate::perm::sampler::SampleCounters;
use crate::tree::CanonicalTree;

pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Fields that must match exactly for a cached bundle to be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSpec {
    pub tree_fingerprint: String,
    pub include_trait_loss: bool,
    pub fg_01_bits: String,
    pub fg_10_bits: String,
}

impl CacheSpec {
    pub fn new(
        tree: &CanonicalTree,
        include_trait_loss: bool,
        fg_01_mask: &BranchMask,
        fg_10_mask: &BranchMask,
    ) -> Self {
        Self {
            tree_fingerprint: tree.fingerprint.clone(),
            include_trait_loss,
            fg_01_bits: fg_01_mask.to_hex(),
            fg_10_bits: fg_10_mask.to_hex(),
        }
    }
}

/// One stage's worth of packed samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStageEntry {
    pub stage: String,
    pub seed: u64,
    pub n_samples: usize,
    pub samples_01: Vec<String>,
    pub samples_10: Vec<String>,
    #[serde(default)]
    pub total_attempts: u64,
    #[serde(default)]
    pub total_restarts: u64,
    #[serde(default)]
    pub n_fallback_independent: u64,
}

/// On-disk cache document. Unknown keys in older or newer minor revisions
/// are ignored on read; missing required keys fail the parse and trigger
/// regeneration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheBundle {
    pub schema_version: u32,
    pub tree_fingerprint: String,
    pub include_trait_loss: bool,
    pub fg_01_bits: String,
    pub fg_10_bits: String,
    pub stages: Vec<CacheStageEntry>,
}

impl CacheBundle {
    pub fn empty(spec: &CacheSpec) -> Self {
        Self {
            schema_version: CACHE_SCHEMA_VERSION,
            tree_fingerprint: spec.tree_fingerprint.clone(),
            include_trait_loss: spec.include_trait_loss,
            fg_01_bits: spec.fg_01_bits.clone(),
            fg_10_bits: spec.fg_10_bits.clone(),
            stages: Vec::new(),
        }
    }

    pub fn stage(&self, name: &str) -> Option<&CacheStageEntry> {
        self.stages.iter().find(|s| s.stage == name)
    }

    /// Insert or replace a stage entry.
    pub fn put_stage(&mut self, entry: CacheStageEntry) {
        if let Some(existing) = self.stages.iter_mut().find(|s| s.stage == entry.stage) {
            *existing = entry;
        } else {
            self.stages.push(entry);
        }
    }
}

/// Why a cache file on disk was not reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheIncompatibility {
    Unreadable(String),
    SchemaMismatch { found: u32 },
    FingerprintMismatch,
    FlagMismatch,
    ForegroundMismatch,
}

impl fmt::Display for CacheIncompatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreadable(detail) => write!(f, "cache unreadable: {detail}"),
            Self::SchemaMismatch { found } => {
                write!(
                    f,
                    "cache schema version {found} does not match {CACHE_SCHEMA_VERSION}"
                )
            }
            Self::FingerprintMismatch => write!(f, "tree fingerprint mismatch"),
            Self::FlagMismatch => write!(f, "include_trait_loss mismatch"),
            Self::ForegroundMismatch => write!(f, "foreground branch sets mismatch"),
        }
    }
}

/// Result of attempting to reuse a cache file.
#[derive(Debug, Clone)]
pub enum CacheLoad {
    /// No file at the path.
    Missing,
    /// File exists but cannot be reused; regenerate.
    Incompatible(CacheIncompatibility),
    /// Compatible bundle ready for stage lookup.
    Loaded(CacheBundle),
}

/// Load and fingerprint-check a cache file.
///
/// All failure modes short of filesystem errors on write are recoverable:
/// they yield [`CacheLoad::Incompatible`] and the caller regenerates.
pub fn load_cache(path: &Path, spec: &CacheSpec) -> CacheLoad {
    if !path.exists() {
        return CacheLoad::Missing;
    }

    let text = match read_container(path) {
        Ok(text) => text,
        Err(e) => return CacheLoad::Incompatible(CacheIncompatibility::Unreadable(e.to_string())),
    };

    let bundle: CacheBundle = match serde_json::from_str(&text) {
        Ok(bundle) => bundle,
        Err(e) => return CacheLoad::Incompatible(CacheIncompatibility::Unreadable(e.to_string())),
    };

    if bundle.schema_version != CACHE_SCHEMA_VERSION {
        return CacheLoad::Incompatible(CacheIncompatibility::SchemaMismatch {
            found: bundle.schema_version,
        });
    }
    for entry in &bundle.stages {
        if entry.samples_01.len() < entry.n_samples || entry.samples_10.len() < entry.n_samples {
            return CacheLoad::Incompatible(CacheIncompatibility::Unreadable(format!(
                "stage '{}' declares {} samples but stores fewer",
                entry.stage, entry.n_samples
            )));
        }
    }
    if bundle.tree_fingerprint != spec.tree_fingerprint {
        return CacheLoad::Incompatible(CacheIncompatibility::FingerprintMismatch);
    }
    if bundle.include_trait_loss != spec.include_trait_loss {
        return CacheLoad::Incompatible(CacheIncompatibility::FlagMismatch);
    }
    if bundle.fg_01_bits != spec.fg_01_bits || bundle.fg_10_bits != spec.fg_10_bits {
        return CacheLoad::Incompatible(CacheIncompatibility::ForegroundMismatch);
    }

    CacheLoad::Loaded(bundle)
}

/// Write a cache bundle, gzipped when the path ends in `.gz`.
pub fn save_cache(path: &Path, bundle: &CacheBundle) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| PhylopermError::io(path, e))?;
        }
    }

    let mut text = serde_json::to_string(bundle)?;
    text.push('\n');

    if is_gzip_path(path) {
        let file = fs::File::create(path).map_err(|e| PhylopermError::io(path, e))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder
            .write_all(text.as_bytes())
            .and_then(|_| encoder.finish().map(|_| ()))
            .map_err(|e| PhylopermError::io(path, e))?;
    } else {
        fs::write(path, text).map_err(|e| PhylopermError::io(path, e))?;
    }
    Ok(())
}

/// Decode a cached stage into a sample block, verifying mask widths.
pub fn stage_to_block(entry: &CacheStageEntry, n_bits: usize, n_required: usize) -> Result<SampleBlock> {
    let mut block = SampleBlock::new(n_bits);
    for i in 0..n_required.min(entry.n_samples) {
        let m01 = BranchMask::from_hex(n_bits, &entry.samples_01[i])?;
        let m10 = BranchMask::from_hex(n_bits, &entry.samples_10[i])?;
        block.push(&m01, &m10);
    }
    block.counters = SampleCounters {
        attempts: entry.total_attempts,
        restarts: entry.total_restarts,
        fallback_independent: entry.n_fallback_independent,
    };
    Ok(block)
}

/// Encode a sample block as a cache stage entry.
pub fn block_to_stage(block: &SampleBlock, stage: &str, seed: u64) -> CacheStageEntry {
    let mut samples_01 = Vec::with_capacity(block.n_samples);
    let mut samples_10 = Vec::with_capacity(block.n_samples);
    for i in 0..block.n_samples {
        samples_01.push(block.mask_01_hex(i));
        samples_10.push(block.mask_10_hex(i));
    }
    CacheStageEntry {
        stage: stage.to_string(),
        seed,
        n_samples: block.n_samples,
        samples_01,
        samples_10,
        total_attempts: block.counters.attempts,
        total_restarts: block.counters.restarts,
        n_fallback_independent: block.counters.fallback_independent,
    }
}

fn is_gzip_path(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

fn read_container(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| PhylopermError::io(path, e))?;
    if is_gzip_path(path) {
        let mut decoder = GzDecoder::new(&bytes[..]);
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|e| PhylopermError::io(path, e))?;
        Ok(text)
    } else {
        String::from_utf8(bytes).map_err(|e| {
            PhylopermError::InvalidArgument(format!("cache is not UTF-8: {e}"))
        })
    }
}
