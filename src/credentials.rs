//! Credential hashing
//!
//! The registry never sees plaintext credentials after CreateUser/LoginUser
//! hand them to a `CredentialHasher`.

use argon2::Argon2;
use rand::Rng;

use crate::error::ChatError;

const SALT_LEN: usize = 16;
const DIGEST_LEN: usize = 32;

/// Salted digest stored on a user record
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub salt: Vec<u8>,
    pub digest: Vec<u8>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(..)")
    }
}

/// Hashes and verifies account credentials
pub trait CredentialHasher: Send + Sync + 'static {
    fn hash(&self, secret: &str) -> Result<Credential, ChatError>;

    fn verify(&self, secret: &str, credential: &Credential) -> Result<bool, ChatError>;
}

/// Argon2id with a random per-user salt
#[derive(Debug, Default, Clone, Copy)]
pub struct Argon2Hasher;

impl Argon2Hasher {
    fn digest(secret: &str, salt: &[u8]) -> Result<Vec<u8>, ChatError> {
        let mut out = vec![0u8; DIGEST_LEN];
        Argon2::default()
            .hash_password_into(secret.as_bytes(), salt, &mut out)
            .map_err(|e| ChatError::Internal(format!("failed to hash password: {}", e)))?;
        Ok(out)
    }
}

impl CredentialHasher for Argon2Hasher {
    fn hash(&self, secret: &str) -> Result<Credential, ChatError> {
        let salt: [u8; SALT_LEN] = rand::thread_rng().gen();
        let digest = Self::digest(secret, &salt)?;
        Ok(Credential {
            salt: salt.to_vec(),
            digest,
        })
    }

    fn verify(&self, secret: &str, credential: &Credential) -> Result<bool, ChatError> {
        let digest = Self::digest(secret, &credential.salt)?;
        Ok(digest == credential.digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_verify() {
        let hasher = Argon2Hasher;
        let credential = hasher.hash("hunter2").unwrap();

        assert!(hasher.verify("hunter2", &credential).unwrap());
        assert!(!hasher.verify("hunter3", &credential).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        let hasher = Argon2Hasher;
        let a = hasher.hash("same").unwrap();
        let b = hasher.hash("same").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn test_debug_hides_digest() {
        let credential = Argon2Hasher.hash("secret").unwrap();
        assert_eq!(format!("{:?}", credential), "Credential(..)");
    }
}
