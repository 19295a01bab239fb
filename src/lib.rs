//! Permutation-based copy number / trait association testing on phylogenies.
//!
//! Tests, for each gene family in a CAFE-style copy-number analysis, whether
//! per-branch copy-number changes concentrate on branches where a binary
//! species trait is inferred to have transitioned. Provides:
//! - canonical tree indexing with bitmask topology artifacts,
//! - ML ancestral-state reconstruction under a two-state Markov model,
//! - topology-constrained permutation testing with a two-stage scheduler
//!   and an on-disk sample cache,
//! - a one-sided Fisher exact alternative with Tarone screening,
//! - Benjamini-Hochberg correction, ranked reports, and run metadata.

pub mod asr;
pub mod config;
pub mod correction;
pub mod error;
pub mod family;
pub mod io;
pub mod mask;
pub mod metadata;
pub mod perm;
#[cfg(feature = "plots")]
pub mod plots;
pub mod report;
pub mod run;
pub mod stats;
pub mod tree;

pub use config::{BinaryTest, Config, Direction, Mode};
pub use error::{PhylopermError, Result};
pub use run::{run, RunSummary};
pub use tree::CanonicalTree;
