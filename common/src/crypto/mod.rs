use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Hashes chain links and balance checksums. Plain SHA-256 by default,
/// HMAC-SHA-256 when a secret is configured (recommended: a verifier without
/// the secret cannot forge a consistent chain).
#[derive(Clone)]
pub struct ChainHasher {
    secret: Option<Vec<u8>>,
}

impl ChainHasher {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret: secret.map(|s| s.as_bytes().to_vec()),
        }
    }

    pub fn keyed(&self) -> bool {
        self.secret.is_some()
    }

    /// Lowercase hex digest of raw bytes.
    pub fn digest(&self, data: &[u8]) -> String {
        match &self.secret {
            Some(key) => {
                let mut mac =
                    HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
                mac.update(data);
                hex::encode(mac.finalize().into_bytes())
            }
            None => hex::encode(Sha256::digest(data)),
        }
    }

    /// Chain link: `H(prev_hash || canonical_data)`. An absent previous hash
    /// and an empty-string previous hash are the same input.
    pub fn chain_hash(&self, prev: Option<&str>, canonical_data: &str) -> String {
        let prev = prev.unwrap_or("");
        let mut input = Vec::with_capacity(prev.len() + canonical_data.len());
        input.extend_from_slice(prev.as_bytes());
        input.extend_from_slice(canonical_data.as_bytes());
        self.digest(&input)
    }

    /// Checksum over the balance columns in fixed order. Stored with the
    /// account row and re-derived on read when verification is enabled.
    pub fn balance_checksum(
        &self,
        balance: i64,
        credit_balance: i64,
        debit_balance: i64,
        pending_debit: i64,
        pending_credit: i64,
        version: u64,
    ) -> String {
        let input = format!(
            "{balance}|{credit_balance}|{debit_balance}|{pending_debit}|{pending_credit}|{version}"
        );
        self.digest(input.as_bytes())
    }
}

/// 64-bit advisory lock key for a named resource (worker leases). First 8
/// bytes of the SHA-256 of the name, big-endian.
pub fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
