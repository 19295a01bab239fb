//! Error types for the phyloperm crate.

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Input-validation and semantic errors are fatal and surface before any
/// computation; recoverable conditions (cache incompatibility, per-family
/// absence of foreground) are modeled as data, not errors.
#[derive(Debug, Error)]
pub enum PhylopermError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no TREE entry found in NEXUS file: {path}")]
    NoTreeEntry { path: PathBuf },

    #[error("malformed Newick at position {pos}: {detail}")]
    NewickParse { pos: usize, detail: String },

    #[error("duplicate branch key in tree: {key}")]
    DuplicateBranchKey { key: String },

    #[error("empty branch key on non-root node {node_id}")]
    EmptyBranchKey { node_id: usize },

    #[error("invalid branch lengths (require finite and >= 0): {preview}")]
    InvalidBranchLength { preview: String },

    #[error("non-positive branch lengths are not allowed in rate mode: {preview}")]
    ZeroLengthBranch { preview: String },

    #[error("species mismatch between trait table and tree tips. {detail}")]
    SpeciesMismatch { detail: String },

    #[error("branch keys from {table} table not found in canonical tree: {preview}")]
    UnknownBranchKeys { table: String, preview: String },

    #[error("trait table error: {0}")]
    TraitTable(String),

    #[error("malformed {table} table at {path}:{line}: {detail}")]
    MalformedTable {
        table: String,
        path: PathBuf,
        line: usize,
        detail: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(
        "failed to generate a valid permutation under constraints after {attempts} attempts; \
         try reducing the permutation count or relaxing constraints"
    )]
    SamplingExhausted { attempts: u64 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl PhylopermError {
    /// Wrap an I/O error with the offending path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PhylopermError>;
