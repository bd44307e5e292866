//! # Tablehost API Server Library
//!
//! HTTP surface of the tenant provisioning engine: provisioning, owner
//! credential changes, tenant lifecycle and the operator lookups.
//!
//! ## Modules
//!
//! - `app`: Application state and router builder
//! - `config`: Configuration management
//! - `error`: Error handling and HTTP response mapping
//! - `middleware`: Request ids, administrator authentication, security headers
//! - `routes`: API route handlers

pub mod app;
pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
