//! ShamirEngine: splits and reconstructs secrets over GF(p), p = 2^256 -
//! 189 (spec §4.2). Grounded on
//! `examples/original_source/src/vault/shamir_secret_sharing.py`: the
//! prime, the Horner-form polynomial evaluation, and the
//! Lagrange-at-zero combine are carried over verbatim in meaning; the
//! Redis-backed persistence there becomes an in-process map here.

use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum ShamirError {
    #[error("threshold out of range: k={k} n={n}")]
    ThresholdOutOfRange { k: u8, n: u8 },

    #[error("secret exceeds the 32-byte single-chunk limit ({0} bytes)")]
    SecretTooWide(usize),

    #[error("secret value is not a valid field element")]
    SecretNotInField,

    #[error("duplicate share index: {0}")]
    DuplicateShareIndex(u8),

    #[error("insufficient shares: need at least {required}, got {actual}")]
    InsufficientShares { required: usize, actual: usize },

    #[error("secret set not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, ShamirError>;

fn prime() -> &'static BigUint {
    static PRIME: OnceLock<BigUint> = OnceLock::new();
    PRIME.get_or_init(|| {
        // 2^256 - 189
        (BigUint::one() << 256usize) - BigUint::from(189u32)
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareSetStatus {
    Active,
    Revoked,
    Rotated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareSetMeta {
    pub secret_id: String,
    pub threshold: u8,
    pub total: u8,
    pub holder_ids: Vec<String>,
    pub status: ShareSetStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// One of the `n` shares produced by a split. `value` is serialized as
/// big-endian bytes rather than a native integer type since GF(p)
/// elements do not fit a machine word.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    pub secret_id: String,
    pub index: u8,
    #[serde(with = "biguint_bytes")]
    pub value: BigUint,
    pub holder_id: String,
}

mod biguint_bytes {
    use num_bigint::BigUint;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &BigUint, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v.to_bytes_be()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<BigUint, D::Error> {
        use serde::de::Error;
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(D::Error::custom)?;
        Ok(BigUint::from_bytes_be(&bytes))
    }
}

fn random_field_element() -> BigUint {
    loop {
        let mut buf = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut buf);
        let candidate = BigUint::from_bytes_be(&buf);
        if &candidate < prime() {
            return candidate;
        }
    }
}

fn poly_eval(coeffs: &[BigUint], x: u64) -> BigUint {
    let p = prime();
    let x = BigUint::from(x);
    let mut acc = BigUint::zero();
    for c in coeffs.iter().rev() {
        acc = (acc * &x + c) % p;
    }
    acc
}

fn mod_inverse(a: &BigUint, m: &BigUint) -> BigUint {
    // Fermat's little theorem: m is prime, so a^(m-2) mod m is the inverse.
    a.modpow(&(m - BigUint::from(2u32)), m)
}

fn lagrange_interpolate_at_zero(points: &[(u8, BigUint)]) -> BigUint {
    let p = prime();
    let mut result = BigUint::zero();
    for (i, (xi, yi)) in points.iter().enumerate() {
        let mut numerator = BigUint::one();
        let mut denominator = BigUint::one();
        for (j, (xj, _)) in points.iter().enumerate() {
            if i == j {
                continue;
            }
            let xi_b = BigUint::from(*xi as u64);
            let xj_b = BigUint::from(*xj as u64);
            // numerator *= (0 - xj) = -xj  (mod p, as p - xj)
            let neg_xj = (p - &xj_b) % p;
            numerator = (numerator * neg_xj) % p;
            // denominator *= (xi - xj) mod p
            let diff = if xi_b >= xj_b {
                (&xi_b - &xj_b) % p
            } else {
                (p - (&xj_b - &xi_b) % p) % p
            };
            denominator = (denominator * diff) % p;
        }
        let inv_denominator = mod_inverse(&denominator, p);
        let term = (numerator * inv_denominator) % p;
        result = (result + (yi * term) % p) % p;
    }
    result
}

pub struct ShamirEngine {
    sets: RwLock<HashMap<String, ShareSetMeta>>,
    shares: RwLock<HashMap<(String, u8), Share>>,
}

impl ShamirEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sets: RwLock::new(HashMap::new()),
            shares: RwLock::new(HashMap::new()),
        })
    }

    fn validate_threshold(k: u8, n: u8) -> Result<()> {
        if k == 0 || k > n || n == 0 || (n as usize) > 255 {
            return Err(ShamirError::ThresholdOutOfRange { k, n });
        }
        Ok(())
    }

    /// Splits `secret` (at most 32 bytes) into `n` shares, `k` of which
    /// reconstruct it. Coefficients are drawn from a CSPRNG; no share is
    /// evaluated at x = 0 (spec §4.2).
    pub async fn split(
        &self,
        secret_id: impl Into<String>,
        secret: &[u8],
        k: u8,
        holder_ids: Vec<String>,
    ) -> Result<(ShareSetMeta, Vec<Share>)> {
        let secret_id = secret_id.into();
        let n = holder_ids.len() as u8;
        Self::validate_threshold(k, n)?;
        if secret.len() > 32 {
            return Err(ShamirError::SecretTooWide(secret.len()));
        }
        let secret_int = BigUint::from_bytes_be(secret);
        if &secret_int >= prime() {
            return Err(ShamirError::SecretNotInField);
        }

        let mut coeffs = Vec::with_capacity(k as usize);
        coeffs.push(secret_int);
        for _ in 1..k {
            coeffs.push(random_field_element());
        }

        let mut shares = Vec::with_capacity(n as usize);
        for (i, holder_id) in holder_ids.iter().enumerate() {
            let index = (i + 1) as u8;
            let value = poly_eval(&coeffs, index as u64);
            shares.push(Share {
                secret_id: secret_id.clone(),
                index,
                value,
                holder_id: holder_id.clone(),
            });
        }

        let meta = ShareSetMeta {
            secret_id: secret_id.clone(),
            threshold: k,
            total: n,
            holder_ids,
            status: ShareSetStatus::Active,
            created_at: chrono::Utc::now(),
        };

        self.sets.write().await.insert(secret_id.clone(), meta.clone());
        let mut store = self.shares.write().await;
        for share in &shares {
            store.insert((secret_id.clone(), share.index), share.clone());
        }

        Ok((meta, shares))
    }

    /// Lagrange-interpolates at x = 0 to recover the secret. Rejects
    /// duplicate x-coordinates; does not itself verify share authenticity
    /// (spec §4.2: "verification is an operational concern").
    pub fn combine(&self, shares: &[Share]) -> Result<Vec<u8>> {
        let mut seen = std::collections::HashSet::new();
        for s in shares {
            if !seen.insert(s.index) {
                return Err(ShamirError::DuplicateShareIndex(s.index));
            }
        }
        if shares.is_empty() {
            return Err(ShamirError::InsufficientShares { required: 1, actual: 0 });
        }
        let points: Vec<(u8, BigUint)> = shares.iter().map(|s| (s.index, s.value.clone())).collect();
        let secret_int = lagrange_interpolate_at_zero(&points);
        let mut bytes = secret_int.to_bytes_be();
        if bytes.len() < 32 {
            let mut padded = vec![0u8; 32 - bytes.len()];
            padded.append(&mut bytes);
            bytes = padded;
        }
        // Strip the leading-zero padding added above for secrets shorter
        // than 32 bytes, matching the original implementation's behavior.
        let first_nonzero = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
        Ok(bytes[first_nonzero..].to_vec())
    }

    pub async fn holder_shares(&self, secret_id: &str, holder_id: &str) -> Vec<Share> {
        self.shares
            .read()
            .await
            .values()
            .filter(|s| s.secret_id == secret_id && s.holder_id == holder_id)
            .cloned()
            .collect()
    }

    pub async fn status(&self, secret_id: &str) -> Result<ShareSetMeta> {
        self.sets
            .read()
            .await
            .get(secret_id)
            .cloned()
            .ok_or_else(|| ShamirError::NotFound(secret_id.to_string()))
    }

    pub async fn revoke(&self, secret_id: &str) -> Result<()> {
        let mut sets = self.sets.write().await;
        let meta = sets
            .get_mut(secret_id)
            .ok_or_else(|| ShamirError::NotFound(secret_id.to_string()))?;
        meta.status = ShareSetStatus::Revoked;
        Ok(())
    }

    /// Revokes all prior shares and re-splits a (possibly new) secret
    /// value under a fresh polynomial, preserving `secret_id`. The
    /// decision of whether the underlying secret itself also changes is
    /// the caller's — `ShamirEngine` only ever reasons about shares, per
    /// the Open Question resolution recorded in DESIGN.md.
    pub async fn rotate(
        &self,
        secret_id: &str,
        new_secret: &[u8],
    ) -> Result<(ShareSetMeta, Vec<Share>)> {
        let prior = self.status(secret_id).await?;
        {
            let mut sets = self.sets.write().await;
            if let Some(meta) = sets.get_mut(secret_id) {
                meta.status = ShareSetStatus::Rotated;
            }
        }
        self.shares.write().await.retain(|(sid, _), _| sid != secret_id);
        self.split(secret_id.to_string(), new_secret, prior.threshold, prior.holder_ids)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holders(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("holder-{i}")).collect()
    }

    #[tokio::test]
    async fn split_then_combine_with_k_of_n_recovers_secret() {
        let engine = ShamirEngine::new();
        let secret = b"0123456789abcdef0123456789abcdef"[..32].to_vec();
        let (_meta, shares) = engine.split("secret-1", &secret, 3, holders(5)).await.unwrap();
        let subset = vec![shares[0].clone(), shares[2].clone(), shares[4].clone()];
        let recovered = engine.combine(&subset).unwrap();
        assert_eq!(recovered, secret);
    }

    #[tokio::test]
    async fn k_equals_n_equals_one_is_identity() {
        let engine = ShamirEngine::new();
        let secret = b"hello".to_vec();
        let (_meta, shares) = engine.split("secret-identity", &secret, 1, holders(1)).await.unwrap();
        let recovered = engine.combine(&shares).unwrap();
        assert_eq!(recovered, secret);
    }

    #[tokio::test]
    async fn rejects_threshold_out_of_range() {
        let engine = ShamirEngine::new();
        let secret = b"s".to_vec();
        let err = engine.split("bad", &secret, 6, holders(3)).await.unwrap_err();
        assert!(matches!(err, ShamirError::ThresholdOutOfRange { .. }));
    }

    #[tokio::test]
    async fn rejects_wide_secret() {
        let engine = ShamirEngine::new();
        let secret = vec![1u8; 33];
        let err = engine.split("wide", &secret, 2, holders(3)).await.unwrap_err();
        assert!(matches!(err, ShamirError::SecretTooWide(33)));
    }

    #[tokio::test]
    async fn combine_rejects_duplicate_indices() {
        let engine = ShamirEngine::new();
        let secret = b"dup".to_vec();
        let (_meta, shares) = engine.split("dup-secret", &secret, 2, holders(3)).await.unwrap();
        let dup = vec![shares[0].clone(), shares[0].clone()];
        let err = engine.combine(&dup).unwrap_err();
        assert!(matches!(err, ShamirError::DuplicateShareIndex(_)));
    }

    #[tokio::test]
    async fn rotate_preserves_secret_id_and_revokes_prior_shares() {
        let engine = ShamirEngine::new();
        let secret = b"original".to_vec();
        let (_meta, _shares) = engine.split("rotating", &secret, 2, holders(3)).await.unwrap();
        let new_secret = b"rotated!".to_vec();
        let (new_meta, new_shares) = engine.rotate("rotating", &new_secret).await.unwrap();
        assert_eq!(new_meta.secret_id, "rotating");
        assert_eq!(new_meta.status, ShareSetStatus::Active);
        let recovered = engine.combine(&new_shares[..2]).unwrap();
        assert_eq!(recovered, new_secret);
    }

    #[tokio::test]
    async fn insufficient_shares_do_not_recover_original_secret() {
        let engine = ShamirEngine::new();
        let secret = b"0123456789abcdef0123456789abcdef"[..32].to_vec();
        let (_meta, shares) = engine.split("secret-2", &secret, 3, holders(5)).await.unwrap();
        let too_few = vec![shares[0].clone(), shares[1].clone()];
        let recovered = engine.combine(&too_few).unwrap();
        assert_ne!(recovered, secret);
    }
}
