/// API route handlers
///
/// This module contains all route handlers organized by resource:
///
/// - `health`: Health check endpoint
/// - `tenants`: Provisioning, owner credentials and tenant lifecycle
/// - `availability`: Slug and email pre-flight checks
/// - `provisioning_requests`: Ledger and audit lookups by idempotency key

pub mod availability;
pub mod health;
pub mod provisioning_requests;
pub mod tenants;
