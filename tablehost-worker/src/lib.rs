//! # Tablehost Worker Library
//!
//! Background reconciliation of provisioning attempts that stopped
//! mid-flight.
//!
//! ## Modules
//!
//! - `config`: Worker configuration from `TABLEHOST_*` variables
//! - `reconciler`: Sweep loop over stalled provisioning requests

pub mod config;
pub mod reconciler;
