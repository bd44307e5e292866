//! Password utilities
//!
//! - Argon2id hashing (64 MB memory, 3 passes, 4 lanes) used by the in-memory
//!   identity provider to store owner passwords.
//! - The strength policy applied to every owner password change.
//! - Random initial passwords for freshly provisioned owners, who set their
//!   own password later through a credential update.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2, ParamsBuilder, Version,
};
use rand::Rng;

/// Length of generated initial passwords
pub const INITIAL_PASSWORD_LENGTH: usize = 24;

const LOWERCASE: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const UPPERCASE: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const DIGITS: &[u8] = b"23456789";
const SYMBOLS: &[u8] = b"!@#$%^&*-_=+";

/// Error type for password hashing operations
#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("Failed to hash password: {0}")]
    HashError(String),

    #[error("Failed to verify password: {0}")]
    VerifyError(String),

    #[error("Invalid password hash format: {0}")]
    InvalidHash(String),
}

/// Hashes a password with Argon2id, returning a PHC string
///
/// ```text
/// $argon2id$v=19$m=65536,t=3,p=4$<salt>$<hash>
/// ```
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);

    let params = ParamsBuilder::new()
        .m_cost(65536)
        .t_cost(3)
        .p_cost(4)
        .output_len(32)
        .build()
        .map_err(|e| PasswordError::HashError(format!("Invalid parameters: {}", e)))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PasswordError::HashError(format!("Hash generation failed: {}", e)))?;

    Ok(password_hash.to_string())
}

/// Verifies a password against a PHC hash in constant time
///
/// Returns `Ok(false)` for a wrong password and an error only for a
/// malformed hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, PasswordError> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| PasswordError::InvalidHash(format!("Failed to parse hash: {}", e)))?;

    // Parameters are embedded in the hash.
    match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(_) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(PasswordError::VerifyError(format!("Verification failed: {}", e))),
    }
}

/// Checks an owner password against the strength policy
///
/// At least 8 characters (at most 128) with an uppercase letter, a lowercase
/// letter, a digit and a special character.
pub fn validate_password_strength(password: &str) -> Result<(), String> {
    if password.chars().count() < 8 {
        return Err("Password must be at least 8 characters long".to_string());
    }

    if password.chars().count() > 128 {
        return Err("Password must be at most 128 characters long".to_string());
    }

    if !password.chars().any(|c| c.is_uppercase()) {
        return Err("Password must contain at least one uppercase letter".to_string());
    }

    if !password.chars().any(|c| c.is_lowercase()) {
        return Err("Password must contain at least one lowercase letter".to_string());
    }

    if !password.chars().any(|c| c.is_numeric()) {
        return Err("Password must contain at least one digit".to_string());
    }

    if !password.chars().any(|c| !c.is_alphanumeric()) {
        return Err("Password must contain at least one special character".to_string());
    }

    Ok(())
}

/// Generates a random initial owner password that satisfies the policy
pub fn generate_initial_password() -> String {
    let mut rng = rand::thread_rng();
    let classes = [LOWERCASE, UPPERCASE, DIGITS, SYMBOLS];

    let mut chars: Vec<u8> = classes
        .iter()
        .map(|class| class[rng.gen_range(0..class.len())])
        .collect();

    while chars.len() < INITIAL_PASSWORD_LENGTH {
        let class = classes[rng.gen_range(0..classes.len())];
        chars.push(class[rng.gen_range(0..class.len())]);
    }

    // Fisher-Yates so the guaranteed characters are not always first.
    for i in (1..chars.len()).rev() {
        let j = rng.gen_range(0..=i);
        chars.swap(i, j);
    }

    chars.into_iter().map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("Owner-Pass1").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("Owner-Pass1", &hash).unwrap());
        assert!(!verify_password("owner-pass1", &hash).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        let a = hash_password("Owner-Pass1").unwrap();
        let b = hash_password("Owner-Pass1").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_hash_is_an_error() {
        assert!(matches!(
            verify_password("x", "not-a-hash"),
            Err(PasswordError::InvalidHash(_))
        ));
    }

    #[test]
    fn test_strength_policy() {
        assert!(validate_password_strength("MyP@ssw0rd!").is_ok());
        assert!(validate_password_strength("Sh0rt!").is_err());
        assert!(validate_password_strength("password123!").is_err());
        assert!(validate_password_strength("PASSWORD123!").is_err());
        assert!(validate_password_strength("Password!!!").is_err());
        assert!(validate_password_strength("Password123").is_err());
        assert!(validate_password_strength(&format!("Aa1!{}", "x".repeat(130))).is_err());
    }

    #[test]
    fn test_initial_password_satisfies_policy() {
        for _ in 0..50 {
            let password = generate_initial_password();
            assert_eq!(password.len(), INITIAL_PASSWORD_LENGTH);
            assert!(validate_password_strength(&password).is_ok(), "{}", password);
        }
    }

    #[test]
    fn test_initial_passwords_are_random() {
        assert_ne!(generate_initial_password(), generate_initial_password());
    }
}
