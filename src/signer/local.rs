//! Local private key signer implementation

use super::TransactionSigner;
use alloy::primitives::{Address, Signature, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use eyre::{Context, Result};

/// Local signer using a private key
///
/// Signing is pure and in-memory. The underlying primitive already returns a
/// low-S signature with the correct recovery id, so nothing is post-processed.
pub struct LocalSigner {
    signer: PrivateKeySigner,
}

impl LocalSigner {
    /// Create a new LocalSigner from a private key hex string
    ///
    /// # Arguments
    ///
    /// * `private_key` - Hex-encoded private key (with or without 0x prefix)
    pub fn from_private_key(private_key: impl AsRef<str>) -> Result<Self> {
        let key = private_key.as_ref().trim();
        let key = key.strip_prefix("0x").unwrap_or(key);

        let signer: PrivateKeySigner = key.parse().context("Failed to parse private key")?;

        tracing::debug!(address = %signer.address(), "Local signer loaded");
        Ok(Self { signer })
    }
}

impl TransactionSigner for LocalSigner {
    fn address(&self) -> Address {
        self.signer.address()
    }

    async fn sign_hash(&self, digest: B256) -> Result<Signature> {
        self.signer
            .sign_hash_sync(&digest)
            .context("Failed to sign digest with local key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SECP256K1_HALF_N;
    use alloy::primitives::{address, keccak256};

    // First default anvil account
    const ANVIL_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_address_from_key() {
        let signer = LocalSigner::from_private_key(ANVIL_KEY).unwrap();
        assert_eq!(
            signer.address(),
            address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
        );

        // prefix is optional
        let bare = LocalSigner::from_private_key(&ANVIL_KEY[2..]).unwrap();
        assert_eq!(bare.address(), signer.address());
    }

    #[test]
    fn test_invalid_key() {
        assert!(LocalSigner::from_private_key("0x1234").is_err());
        assert!(LocalSigner::from_private_key("not a key").is_err());
    }

    #[tokio::test]
    async fn test_signature_recovers() {
        let signer = LocalSigner::from_private_key(ANVIL_KEY).unwrap();
        let digest = keccak256(b"settleAll");

        let signature = signer.sign_hash(digest).await.unwrap();

        assert!(signature.s() <= SECP256K1_HALF_N);
        assert_eq!(
            signature.recover_address_from_prehash(&digest).unwrap(),
            signer.address()
        );
    }
}
