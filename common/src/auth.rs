//! Server credentials: plaintext or salted-hash form.
//!
//! The hashed form is a single self-describing string,
//! `sha256:<base64 salt>:<base64 digest>` with `digest = SHA-256(salt ||
//! password)`, so one config value carries both salt and hash.
//! Verification is constant-time for both forms.

use base64::Engine;
use sha2::{Digest, Sha256};

const HASH_PREFIX: &str = "sha256:";
const SALT_LEN: usize = 16;

/// A server password as stored in configuration.
#[derive(Clone)]
pub enum Credentials {
    Plain(String),
    Hashed { salt: Vec<u8>, digest: [u8; 32] },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log secret material
        match self {
            Credentials::Plain(_) => write!(f, "Credentials::Plain(..)"),
            Credentials::Hashed { .. } => write!(f, "Credentials::Hashed(..)"),
        }
    }
}

impl Credentials {
    /// Parses a config `password` value, detecting the hashed form by its
    /// prefix. Anything that does not parse as a hash is a plaintext
    /// password.
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let Some(rest) = value.strip_prefix(HASH_PREFIX) else {
            return Ok(Credentials::Plain(value.to_string()));
        };
        let (salt_b64, digest_b64) = rest
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("malformed password hash: missing digest part"))?;
        let engine = base64::engine::general_purpose::STANDARD;
        let salt = engine
            .decode(salt_b64)
            .map_err(|error| anyhow::anyhow!("malformed password hash salt: {error}"))?;
        let digest_bytes = engine
            .decode(digest_b64)
            .map_err(|error| anyhow::anyhow!("malformed password hash digest: {error}"))?;
        if digest_bytes.len() != 32 {
            anyhow::bail!(
                "password hash digest must be 32 bytes, got {}",
                digest_bytes.len()
            );
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&digest_bytes);
        Ok(Credentials::Hashed { salt, digest })
    }

    /// Produces the storable hashed form of a password with a fresh salt.
    pub fn hash(password: &str) -> String {
        let salt: [u8; SALT_LEN] = rand::random();
        let digest = salted_digest(&salt, password);
        let engine = base64::engine::general_purpose::STANDARD;
        format!(
            "{}{}:{}",
            HASH_PREFIX,
            engine.encode(salt),
            engine.encode(digest)
        )
    }

    /// Constant-time password check.
    pub fn verify(&self, password: &str) -> bool {
        match self {
            Credentials::Plain(expected) => {
                constant_time_eq(expected.as_bytes(), password.as_bytes())
            }
            Credentials::Hashed { salt, digest } => {
                let actual = salted_digest(salt, password);
                constant_time_eq(digest, &actual)
            }
        }
    }
}

fn salted_digest(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
