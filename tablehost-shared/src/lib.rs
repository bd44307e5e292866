//! # Tablehost Shared Library
//!
//! Domain types, persistence and the provisioning engine shared by the
//! Tablehost API server and the reconciliation worker.
//!
//! ## Module Organization
//!
//! - `models`: Database models and their queries
//! - `db`: Connection pool and migrations
//! - `store`: Storage traits with Postgres and in-memory implementations
//! - `identity`: Identity provider adapters and the administrator classifier
//! - `provisioning`: Provisioning saga, credential manager, lifecycle
//! - `auth`: Administrator JWTs and password utilities
//! - `error`: Error taxonomy and wire error body

pub mod auth;
pub mod db;
pub mod error;
pub mod identity;
pub mod models;
pub mod provisioning;
pub mod store;

/// Current version of the Tablehost shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
