//! Transaction signer abstraction for the settler
//!
//! This module provides a trait-based abstraction for signing transaction
//! digests, allowing the settler to work with both a local private key and a
//! key held by a remote key-management service. The variant is chosen once,
//! from configuration, at startup.

mod kms;
mod local;
mod remote;

pub use kms::{HttpKeyService, KeyService};
pub use local::LocalSigner;
pub use remote::{left_pad_scalar, normalize_s, parse_der_signature, resolve_recovery, RemoteSigner};

use crate::config::SignMode;
use alloy::primitives::{Address, Signature, B256};
use eyre::Result;

/// Trait for producing chain-compatible signatures
///
/// This abstraction allows the settler to work with different signing mechanisms:
/// - `LocalSigner`: Uses a local private key
/// - `RemoteSigner`: Uses a remote key service and reconstructs the recovery id
///
/// Every signature returned is low-S and recovers to [`address`](Self::address).
pub trait TransactionSigner: Send + Sync {
    /// Returns the signer's EVM address
    fn address(&self) -> Address;

    /// Signs a 32-byte digest
    fn sign_hash(&self, digest: B256) -> impl std::future::Future<Output = Result<Signature>> + Send;
}

/// Signer selected by configuration
pub enum SettlerSigner {
    /// In-process key
    Local(LocalSigner),
    /// Remote key service over HTTP
    Remote(RemoteSigner<HttpKeyService>),
}

impl SettlerSigner {
    /// Build the signer described by `mode`
    ///
    /// The remote variant fetches its public key here, so an unreachable key
    /// service fails startup rather than the first settlement.
    pub async fn from_config(mode: &SignMode) -> Result<Self> {
        match mode {
            SignMode::Local { private_key } => {
                Ok(Self::Local(LocalSigner::from_private_key(private_key)?))
            }
            SignMode::Remote {
                endpoint,
                key_id,
                access_token,
            } => {
                let service = HttpKeyService::new(endpoint, key_id, access_token.clone())?;
                Ok(Self::Remote(RemoteSigner::new(service).await?))
            }
        }
    }

    /// Short name of the signing mode, for logs
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Remote(_) => "remote",
        }
    }
}

impl TransactionSigner for SettlerSigner {
    fn address(&self) -> Address {
        match self {
            Self::Local(signer) => signer.address(),
            Self::Remote(signer) => signer.address(),
        }
    }

    async fn sign_hash(&self, digest: B256) -> Result<Signature> {
        match self {
            Self::Local(signer) => signer.sign_hash(digest).await,
            Self::Remote(signer) => signer.sign_hash(digest).await,
        }
    }
}
