//! Shared types, error model, and configuration for Newsdesk.
//!
//! This crate is the foundation depended on by all other Newsdesk crates.
//! It provides:
//! - [`NewsdeskError`], the unified error type
//! - Domain types ([`Article`], [`ScrapeSession`], [`GraderQuery`], ...)
//! - Configuration ([`AppConfig`], [`ConductorSettings`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ChokerLimit, ConductorConfig, ConductorSettings, DEFAULT_DB_POOL_LIMIT,
    DEFAULT_EXTRACTOR_LIMIT, DatabaseConfig, DelegateConfig, MAX_LOOP_INTERVAL, MIN_LOOP_INTERVAL, OutletConfig,
    STANDARD_TAGS_WEIGHT, SelectorConfig, SyncMode, config_dir, config_file_path, init_config,
    load_config, load_config_from, validate_outlets,
};
pub use error::{NewsdeskError, Result};
pub use types::{
    Article, Comment, FrontPageKind, FrontPageQuery, GradeTarget, GraderQuery, LogKind,
    ScrapeSession,
};
