//! Shared types, error model, and configuration for reposcrape.
//!
//! This crate is the foundation depended on by all other reposcrape crates.
//! It provides:
//! - [`ReposcrapeError`] - the unified error type
//! - Domain types ([`RepositoryDescriptor`], [`CacheKey`], [`Artifact`], [`RunId`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheBackendKind, CacheConfig, FeedConfig, GeneratorConfig, IndexConfig,
    PipelineConfig, PipelineSection, StoreBackendKind, StoreConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from, read_secret,
};
pub use error::{ReposcrapeError, Result};
pub use types::{
    Artifact, CacheKey, ObjectMetadata, RepositoryDescriptor, RunId, content_hash,
    parse_change_marker,
};
