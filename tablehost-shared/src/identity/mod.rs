//! Identity provider access and administrator classification
//!
//! - [`provider`]: the adapter contract
//! - [`http`]: GoTrue-style admin REST client
//! - [`mock`]: in-memory provider with fault injection
//! - [`classifier`]: the one administrator check every credential path uses

pub mod classifier;
pub mod http;
pub mod mock;
pub mod provider;

pub use classifier::{DirectoryClassifier, IdentityClass, IdentityClassifier, OwnerCredentialTarget};
pub use http::{HttpIdentityConfig, HttpIdentityProvider};
pub use mock::{CallCounts, MockIdentityProvider};
pub use provider::{
    CreateUser, CreatedIdentity, CredentialChange, IdentityError, IdentityProvider, IdentityUser,
};
