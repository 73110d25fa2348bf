#![allow(dead_code)]

use anyhow::Result;
use k256::schnorr;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;
use tss_party::{PublicKey, Signature};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn digest(message: &[u8]) -> [u8; 32] {
    Sha256::digest(message).into()
}

/// Check a signature with both the engine's verifier and k256's BIP-340
/// implementation
pub fn verify_bip340(public_key: &PublicKey, message: &[u8], signature: &Signature) -> Result<()> {
    public_key.verify(message, signature)?;

    let key = schnorr::VerifyingKey::from_bytes(&public_key.x_only()?)?;
    let signature = schnorr::Signature::try_from(signature.as_bytes())?;
    key.verify_raw(message, &signature)?;
    Ok(())
}
