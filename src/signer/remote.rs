//! Remote key service signer
//!
//! A key service returns a bare ECDSA `(r, s)` pair. Turning that into an
//! Ethereum signature takes three steps:
//!
//! 1. normalise `s` into the low half of the curve order,
//! 2. left-pad `r` and `s` to 32 bytes each,
//! 3. find the recovery id by trial: recover with parity 0, compare against
//!    the known public key, otherwise try parity 1, otherwise fail.
//!
//! A signature is never returned unless it recovers to the signer's key.

use super::{KeyService, TransactionSigner};
use crate::constants::{SCALAR_BYTES, SECP256K1_HALF_N, SECP256K1_N};
use alloy::primitives::{Address, Signature, B256, U256};
use eyre::{bail, eyre, Context, Result};
use k256::ecdsa::{RecoveryId, VerifyingKey};
use k256::pkcs8::DecodePublicKey;

/// Signer backed by a [`KeyService`]
pub struct RemoteSigner<K> {
    service: K,
    /// Uncompressed SEC1 public key, fetched once at construction
    public_key: Vec<u8>,
    address: Address,
}

impl<K: KeyService> RemoteSigner<K> {
    /// Fetch the public key from the service and derive the account address
    pub async fn new(service: K) -> Result<Self> {
        let der = service
            .public_key()
            .await
            .context("Failed to get public key from key service")?;

        let key = VerifyingKey::from_public_key_der(&der)
            .map_err(|e| eyre!("Key service returned an invalid secp256k1 public key: {}", e))?;
        let public_key = key.to_encoded_point(false).as_bytes().to_vec();
        let address = Address::from_raw_public_key(&public_key[1..]);

        tracing::info!(%address, "Remote signer ready");
        Ok(Self {
            service,
            public_key,
            address,
        })
    }
}

impl<K: KeyService> TransactionSigner for RemoteSigner<K> {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_hash(&self, digest: B256) -> Result<Signature> {
        let der = self
            .service
            .sign_digest(digest)
            .await
            .context("Key service failed to sign")?;

        let (r, s) = parse_der_signature(&der)?;
        let (s, flipped) = normalize_s(U256::from_be_bytes(s));
        if flipped {
            tracing::debug!(%digest, "Normalised high-S signature from key service");
        }

        resolve_recovery(&digest, U256::from_be_bytes(r), s, &self.public_key)
    }
}

/// Decode a DER `SEQUENCE { r INTEGER, s INTEGER }` into padded scalars
pub fn parse_der_signature(der: &[u8]) -> Result<([u8; SCALAR_BYTES], [u8; SCALAR_BYTES])> {
    let signature = k256::ecdsa::Signature::from_der(der)
        .map_err(|e| eyre!("Malformed signature from key service: {}", e))?;
    let (r, s) = signature.split_bytes();

    Ok((left_pad_scalar(&r)?, left_pad_scalar(&s)?))
}

/// Left-pad a big-endian integer to the curve's scalar width
pub fn left_pad_scalar(bytes: &[u8]) -> Result<[u8; SCALAR_BYTES]> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let significant = &bytes[start..];
    if significant.len() > SCALAR_BYTES {
        bail!(
            "Scalar is {} bytes, wider than {} bytes",
            significant.len(),
            SCALAR_BYTES
        );
    }

    let mut out = [0u8; SCALAR_BYTES];
    out[SCALAR_BYTES - significant.len()..].copy_from_slice(significant);
    Ok(out)
}

/// Replace `s` by `N - s` when it is in the high half of the order
///
/// Returns the canonical value and whether it was flipped.
pub fn normalize_s(s: U256) -> (U256, bool) {
    if s > SECP256K1_HALF_N {
        (SECP256K1_N - s, true)
    } else {
        (s, false)
    }
}

/// Pick the recovery id that makes `(digest, r, s)` recover to `expected`
///
/// `expected` is the uncompressed SEC1 encoding of the public key. Fails when
/// neither parity recovers to it, which means a key mismatch or a corrupted
/// signature.
pub fn resolve_recovery(digest: &B256, r: U256, s: U256, expected: &[u8]) -> Result<Signature> {
    let ecdsa = k256::ecdsa::Signature::from_scalars(
        r.to_be_bytes::<SCALAR_BYTES>(),
        s.to_be_bytes::<SCALAR_BYTES>(),
    )
    .map_err(|e| eyre!("Signature scalars out of range: {}", e))?;

    for parity in [false, true] {
        let recovered =
            match VerifyingKey::recover_from_prehash(digest.as_slice(), &ecdsa, RecoveryId::new(parity, false)) {
                Ok(key) => key,
                Err(_) => continue,
            };

        if recovered.to_encoded_point(false).as_bytes() == expected {
            return Ok(Signature::new(r, s, parity));
        }
    }

    bail!("Signature does not recover to the signer's public key with either recovery id")
}
