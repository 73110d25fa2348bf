//! Distributed Key Generation (DKG) module
//!
//! Implements FROST key generation over secp256k1 (BIP-340 flavour) as a
//! [`RoundProcessor`](crate::session::RoundProcessor).

mod dkg;
mod messages;

pub use dkg::DkgProcessor;
pub(crate) use dkg::identifier;
#[cfg(test)]
pub(crate) use dkg::tests as dkg_tests;
pub use messages::*;

use crate::types::{PartyId, PublicKey, ShareData};
use crate::{Error, Result};
use frost_secp256k1_tr as frost;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Current layout of [`KeyShareRecord`]
pub const SHARE_RECORD_VERSION: u8 = 1;

/// Result of a completed key generation
#[derive(Debug, Clone)]
pub struct KeygenOutput {
    /// This party's serialized share
    pub share: ShareData,
    /// Group public key, identical on every party
    pub public_key: PublicKey,
}

/// Contents of a [`ShareData`] blob
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyShareRecord {
    /// Record layout version
    pub version: u8,
    /// Routing id of the share holder
    pub party_id: PartyId,
    /// Signers required to produce a signature (t + 1)
    pub min_signers: u16,
    /// Parties that took part in key generation
    pub max_signers: u16,
    /// Serialized FROST key package (secret)
    pub key_package: Vec<u8>,
    /// Serialized FROST public key package
    pub public_key_package: Vec<u8>,
}

impl KeyShareRecord {
    /// Build a record from the packages produced by DKG
    pub fn new(
        party_id: PartyId,
        max_signers: u16,
        key_package: &frost::keys::KeyPackage,
        public_key_package: &frost::keys::PublicKeyPackage,
    ) -> Result<Self> {
        Ok(Self {
            version: SHARE_RECORD_VERSION,
            party_id,
            min_signers: *key_package.min_signers(),
            max_signers,
            key_package: key_package
                .serialize()
                .map_err(|e| Error::Serialization(e.to_string()))?,
            public_key_package: public_key_package
                .serialize()
                .map_err(|e| Error::Serialization(e.to_string()))?,
        })
    }

    pub fn encode(&self) -> Result<ShareData> {
        Ok(ShareData::from_bytes(serde_json::to_vec(self)?))
    }

    pub fn decode(share: &ShareData) -> Result<Self> {
        let record: Self = serde_json::from_slice(share.as_bytes())
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        if record.version != SHARE_RECORD_VERSION {
            return Err(Error::Deserialization(format!(
                "Unsupported share record version {}",
                record.version
            )));
        }
        Ok(record)
    }

    pub fn key_package(&self) -> Result<frost::keys::KeyPackage> {
        frost::keys::KeyPackage::deserialize(&self.key_package)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }

    pub fn public_key_package(&self) -> Result<frost::keys::PublicKeyPackage> {
        frost::keys::PublicKeyPackage::deserialize(&self.public_key_package)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Group public key recorded in the share
    pub fn public_key(&self) -> Result<PublicKey> {
        let bytes = self
            .public_key_package()?
            .verifying_key()
            .serialize()
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(PublicKey::from_bytes(bytes))
    }
}
