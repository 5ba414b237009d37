//! Database module: record models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed rows and aggregates returned by repositories.
//! - `repo`: SQL-only functions, one transaction per upserted row.
//!
//! External modules should import from `watchlog::db`; the repository API
//! and commonly used models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{StoreStats, VideoRecord};
