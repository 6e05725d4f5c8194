use std::fmt;

use sha2::{Digest, Sha256};

/// The single shared secret every request must carry.
///
/// Comparison hashes both sides and folds the digests together so the time
/// taken depends on neither the content nor the length of the candidate.
#[derive(Clone)]
pub struct SharedSecret {
    value: String,
    digest: [u8; 32],
}

impl SharedSecret {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let digest = digest_of(&value);
        Self { value, digest }
    }

    pub fn expose(&self) -> &str {
        &self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn matches(&self, candidate: &str) -> bool {
        let other = digest_of(candidate);
        let diff = self
            .digest
            .iter()
            .zip(other.iter())
            .fold(0u8, |acc, (lhs, rhs)| acc | (lhs ^ rhs));
        diff == 0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

fn digest_of(value: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(value.as_bytes()));
    out
}
