//! Password hashing.
//!
//! Argon2id is the default, with parameters calibrated for small hardware
//! (16 MiB memory, 2 iterations, 4 lanes). Bcrypt is available for
//! installations migrating existing hashes. The encoded hash is
//! self-describing, so verification dispatches on the stored format
//! regardless of the store's configured algorithm.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2, Params,
};
use serde::{Deserialize, Serialize};

use hub_core::HubError;

/// Minimum accepted plaintext password length.
pub const MIN_PASSWORD_LEN: usize = 5;

/// Hash algorithm an installation uses for new passwords.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Argon2id,
    Bcrypt,
}

fn argon2_instance() -> Result<Argon2<'static>, HubError> {
    let params = Params::new(16 * 1024, 2, 4, None)
        .map_err(|e| HubError::InternalError(format!("argon2 params: {e}")))?;
    Ok(Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        params,
    ))
}

/// Hash a plaintext password with the given algorithm.
pub fn hash_password(plain: &str, algorithm: HashAlgorithm) -> Result<String, HubError> {
    if plain.len() < MIN_PASSWORD_LEN {
        return Err(HubError::InvalidArgument(format!(
            "password shorter than {MIN_PASSWORD_LEN} characters"
        )));
    }
    match algorithm {
        HashAlgorithm::Argon2id => {
            let salt = SaltString::generate(&mut OsRng);
            let hash = argon2_instance()?
                .hash_password(plain.as_bytes(), &salt)
                .map_err(|e| HubError::InternalError(format!("argon2 hash: {e}")))?;
            Ok(hash.to_string())
        }
        HashAlgorithm::Bcrypt => bcrypt::hash(plain, bcrypt::DEFAULT_COST)
            .map_err(|e| HubError::InternalError(format!("bcrypt hash: {e}"))),
    }
}

/// Verify a plaintext password against a stored encoded hash.
pub fn verify_password_hash(plain: &str, encoded: &str) -> Result<(), HubError> {
    if encoded.is_empty() {
        return Err(HubError::InvalidCredentials(
            "password not set".to_string(),
        ));
    }
    if encoded.starts_with("$argon2") {
        let parsed = PasswordHash::new(encoded)
            .map_err(|e| HubError::InternalError(format!("stored hash malformed: {e}")))?;
        return argon2_instance()?
            .verify_password(plain.as_bytes(), &parsed)
            .map_err(|_| HubError::InvalidCredentials("password mismatch".to_string()));
    }
    if encoded.starts_with("$2") {
        return match bcrypt::verify(plain, encoded) {
            Ok(true) => Ok(()),
            Ok(false) => Err(HubError::InvalidCredentials(
                "password mismatch".to_string(),
            )),
            Err(e) => Err(HubError::InternalError(format!("stored hash malformed: {e}"))),
        };
    }
    Err(HubError::InternalError(
        "stored hash has unknown format".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argon2_hash_and_verify() {
        let hash = hash_password("hunter2hunter", HashAlgorithm::Argon2id).expect("hash");
        assert!(hash.starts_with("$argon2id"));
        assert!(verify_password_hash("hunter2hunter", &hash).is_ok());
        assert!(verify_password_hash("wrong-password", &hash).is_err());
    }

    #[test]
    fn bcrypt_hash_and_verify() {
        let hash = hash_password("hunter2hunter", HashAlgorithm::Bcrypt).expect("hash");
        assert!(hash.starts_with("$2"));
        assert!(verify_password_hash("hunter2hunter", &hash).is_ok());
        assert!(verify_password_hash("wrong-password", &hash).is_err());
    }

    #[test]
    fn short_passwords_are_rejected() {
        assert!(hash_password("abcd", HashAlgorithm::Argon2id).is_err());
        assert!(hash_password("abcde", HashAlgorithm::Argon2id).is_ok());
    }

    #[test]
    fn same_password_hashes_differently() {
        let h1 = hash_password("hunter2hunter", HashAlgorithm::Argon2id).expect("hash");
        let h2 = hash_password("hunter2hunter", HashAlgorithm::Argon2id).expect("hash");
        assert_ne!(h1, h2);
    }

    #[test]
    fn empty_stored_hash_is_invalid_credentials() {
        let err = verify_password_hash("whatever", "").expect_err("must fail");
        assert_eq!(err.kind(), "InvalidCredentials");
    }
}
