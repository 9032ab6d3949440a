//! News outlet scraping.
//!
//! This crate provides:
//! - [`Outlet`]: object-safe contract for one news source
//! - [`SelectorOutlet`]: outlet driven by CSS selectors from configuration
//! - [`Harvester`]: fans out front-page and article fetches across outlets

pub mod engine;
pub mod outlet;
pub mod selector;

pub use engine::Harvester;
pub use outlet::{BoxFuture, Outlet};
pub use selector::SelectorOutlet;
