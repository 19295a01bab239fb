//! Topology-constrained permutation generation, scheduling, and caching.

pub mod cache;
pub mod engine;
pub mod sampler;

pub use cache::{CacheBundle, CacheIncompatibility, CacheLoad, CacheSpec, CacheStageEntry};
pub use engine::{sample_seed, SampleBlock, Stage};
pub use sampler::{PermutationSampler, SampleCounters};
