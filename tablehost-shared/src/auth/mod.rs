//! Authentication primitives
//!
//! - [`password`]: Argon2id hashing, strength policy, initial passwords
//! - [`jwt`]: HS256 administrator bearer tokens

pub mod jwt;
pub mod password;
