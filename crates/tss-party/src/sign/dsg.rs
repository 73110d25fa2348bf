//! FROST signing round processor

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use frost_secp256k1_tr as frost;
use frost::round1::{SigningCommitments, SigningNonces};
use frost::round2::SignatureShare;
use frost::Identifier;
use rand::rngs::OsRng;
use tracing::{debug, info, warn};

use super::{SIGN_ROUND_COMMITMENTS, SIGN_ROUND_SHARES};
use crate::identity::PartySet;
use crate::keygen::{identifier, KeyShareRecord};
use crate::session::{Progress, RoundProcessor};
use crate::types::{
    Envelope, InboundMessage, OutboundMessage, PartyId, SessionId, SessionKind, ShareData,
    Signature,
};
use crate::{Error, Result};

enum SignState {
    Pending,
    AwaitingCommitments(SigningNonces),
    AwaitingShares(frost::SigningPackage),
    Finished,
}

/// Runs one party's side of a FROST signing session.
///
/// Every configured member signs. Shares that arrive before the local
/// signing package exists are buffered and checked at aggregation.
pub struct SignProcessor {
    session: SessionId,
    parties: Arc<PartySet>,
    local: PartyId,
    message: Vec<u8>,
    key_package: frost::keys::KeyPackage,
    public_key_package: frost::keys::PublicKeyPackage,
    state: SignState,
    commitments: BTreeMap<Identifier, SigningCommitments>,
    shares: BTreeMap<Identifier, SignatureShare>,
}

impl SignProcessor {
    /// Create a signing processor for `message` using the local `share`.
    ///
    /// `attempt` must be the same on every signer and differ between retries.
    pub fn new(
        parties: Arc<PartySet>,
        share: &ShareData,
        message: Vec<u8>,
        attempt: &[u8],
    ) -> Result<Self> {
        let record = KeyShareRecord::decode(share)?;

        Ok(Self {
            session: parties.fingerprint(SessionKind::Signing, attempt, &message),
            local: parties.local_id(),
            parties,
            message,
            key_package: record.key_package()?,
            public_key_package: record.public_key_package()?,
            state: SignState::Pending,
            commitments: BTreeMap::new(),
            shares: BTreeMap::new(),
        })
    }

    fn seal(&self, round: u32, data: Vec<u8>) -> Result<Vec<u8>> {
        Envelope::seal(self.session, SessionKind::Signing, round, self.local, data)
    }

    fn advance(&mut self) -> Result<Progress<Signature>> {
        let signers = self.parties.len();

        match mem::replace(&mut self.state, SignState::Finished) {
            SignState::AwaitingCommitments(nonces) if self.commitments.len() == signers => {
                debug!("All commitments received, signing");
                let package = frost::SigningPackage::new(self.commitments.clone(), &self.message);
                let share = frost::round2::sign(&package, &nonces, &self.key_package)?;

                let outbound =
                    OutboundMessage::broadcast(self.seal(SIGN_ROUND_SHARES, share.serialize())?);
                self.shares.insert(*self.key_package.identifier(), share);
                self.state = SignState::AwaitingShares(package);

                let next = self.advance()?;
                Ok(Progress::send(vec![outbound]).merge(next))
            }
            SignState::AwaitingShares(package) if self.shares.len() == signers => {
                let signature =
                    frost::aggregate(&package, &self.shares, &self.public_key_package)?;
                let bytes = signature
                    .serialize()
                    .map_err(|e| Error::Serialization(e.to_string()))?;

                let signature = Signature::from_bytes(bytes);
                info!(
                    party_id = self.local,
                    signature = %signature.to_hex(),
                    "Signing completed"
                );
                Ok(Progress::done(Vec::new(), signature))
            }
            state => {
                self.state = state;
                Ok(Progress::idle())
            }
        }
    }
}

impl RoundProcessor for SignProcessor {
    type Output = Signature;

    fn fingerprint(&self) -> SessionId {
        self.session
    }

    fn start(&mut self) -> Result<Progress<Signature>> {
        if !matches!(self.state, SignState::Pending) {
            return Err(Error::Internal("Signing already started".into()));
        }

        let min_signers = *self.key_package.min_signers();
        if self.parties.len() < usize::from(min_signers) {
            return Err(Error::Protocol(format!(
                "Not enough signers: {} configured, share requires {}",
                self.parties.len(),
                min_signers
            )));
        }
        let local = identifier(self.local)?;
        if *self.key_package.identifier() != local {
            return Err(Error::Protocol(format!(
                "Share does not belong to party {}",
                self.local
            )));
        }

        info!(
            party_id = self.local,
            signers = self.parties.len(),
            min_signers,
            "Starting signing"
        );

        let (nonces, commitments) =
            frost::round1::commit(self.key_package.signing_share(), &mut OsRng);
        let data = commitments
            .serialize()
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.commitments.insert(local, commitments);
        self.state = SignState::AwaitingCommitments(nonces);

        Ok(Progress::send(vec![OutboundMessage::broadcast(
            self.seal(SIGN_ROUND_COMMITMENTS, data)?,
        )]))
    }

    fn handle(&mut self, message: InboundMessage) -> Result<Progress<Signature>> {
        let envelope = match Envelope::open(&message, &self.session, SessionKind::Signing) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(from = message.from, error = %e, "Dropping signing message");
                return Ok(Progress::idle());
            }
        };

        if envelope.from == self.local || !self.parties.contains(envelope.from) {
            warn!(from = envelope.from, "Signing message from a non-peer");
            return Ok(Progress::idle());
        }
        if !message.broadcast {
            warn!(from = envelope.from, "Signing messages must be broadcast");
            return Ok(Progress::idle());
        }
        let sender = identifier(envelope.from)?;

        match envelope.round {
            SIGN_ROUND_COMMITMENTS => {
                let Ok(commitments) = SigningCommitments::deserialize(&envelope.data) else {
                    warn!(from = envelope.from, "Malformed signing commitment");
                    return Ok(Progress::idle());
                };
                if self.commitments.contains_key(&sender) {
                    debug!(from = envelope.from, "Duplicate signing commitment");
                    return Ok(Progress::idle());
                }
                self.commitments.insert(sender, commitments);
            }
            SIGN_ROUND_SHARES => {
                let Ok(share) = SignatureShare::deserialize(&envelope.data) else {
                    warn!(from = envelope.from, "Malformed signature share");
                    return Ok(Progress::idle());
                };
                if self.shares.contains_key(&sender) {
                    debug!(from = envelope.from, "Duplicate signature share");
                    return Ok(Progress::idle());
                }
                self.shares.insert(sender, share);
            }
            round => {
                warn!(from = envelope.from, round, "Unexpected signing round");
                return Ok(Progress::idle());
            }
        }

        self.advance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::dkg_tests::{exchange, party_sets, run_dkg};
    use crate::keygen::KeygenOutput;

    fn signers(
        outputs: &BTreeMap<PartyId, KeygenOutput>,
        ids: &[PartyId],
        threshold: u16,
        message: &[u8],
    ) -> BTreeMap<PartyId, SignProcessor> {
        party_sets(ids, threshold)
            .into_iter()
            .map(|set| {
                let id = set.local_id();
                let processor =
                    SignProcessor::new(set, &outputs[&id].share, message.to_vec(), b"").unwrap();
                (id, processor)
            })
            .collect()
    }

    #[test]
    fn test_sign_all_parties() {
        let outputs = run_dkg(&[1, 2, 3], 2);
        let message = b"threshold message";

        let mut processors = signers(&outputs, &[1, 2, 3], 2, message);
        let signatures = exchange(&mut processors, false);

        assert_eq!(signatures.len(), 3);
        let signature = &signatures[&1];
        assert_eq!(signature.as_bytes().len(), 64);
        assert!(signatures.values().all(|s| s == signature));
        outputs[&1].public_key.verify(message, signature).unwrap();
        assert!(outputs[&1].public_key.verify(b"other", signature).is_err());
    }

    #[test]
    fn test_sign_subset_out_of_order() {
        let outputs = run_dkg(&[1, 2, 3, 4, 5], 2);
        let message = b"subset";

        let mut processors = signers(&outputs, &[2, 4, 5], 2, message);
        let signatures = exchange(&mut processors, true);

        assert_eq!(signatures.len(), 3);
        outputs[&2].public_key.verify(message, &signatures[&4]).unwrap();
    }

    #[test]
    fn test_sign_too_few_signers() {
        let outputs = run_dkg(&[1, 2, 3], 2);
        let set = party_sets(&[1, 2], 1).remove(0);

        let mut processor = SignProcessor::new(set, &outputs[&1].share, b"m".to_vec(), b"").unwrap();
        assert!(matches!(processor.start(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_sign_rejects_foreign_share() {
        let outputs = run_dkg(&[1, 2, 3], 1);
        let set = party_sets(&[1, 2, 3], 1).remove(0);

        let mut processor = SignProcessor::new(set, &outputs[&2].share, b"m".to_vec(), b"").unwrap();
        assert!(matches!(processor.start(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_sign_rejects_garbage_share_data() {
        let set = party_sets(&[1, 2], 1).remove(0);
        let result = SignProcessor::new(set, &ShareData::from_bytes(b"junk".to_vec()), vec![], b"");
        assert!(matches!(result, Err(Error::Deserialization(_))));
    }

    #[test]
    fn test_sign_ignores_direct_messages() {
        let outputs = run_dkg(&[1, 2], 1);
        let sets = party_sets(&[1, 2], 1);
        let session = sets[0].fingerprint(SessionKind::Signing, b"", b"m");

        let mut processor =
            SignProcessor::new(sets[0].clone(), &outputs[&1].share, b"m".to_vec(), b"").unwrap();
        processor.start().unwrap();

        let payload = Envelope::seal(session, SessionKind::Signing, 1, 2, vec![0; 8]).unwrap();
        let progress = processor
            .handle(InboundMessage {
                payload,
                from: 2,
                broadcast: false,
            })
            .unwrap();
        assert!(progress.outbound.is_empty());
        assert_eq!(processor.commitments.len(), 1);
    }

    #[test]
    fn test_resign_after_abandoned_attempt() {
        let outputs = run_dkg(&[1, 2, 3], 1);
        let message = b"same message twice";

        // Party 1 committed in a run the others never joined
        let set = party_sets(&[1, 2, 3], 1).remove(0);
        let mut abandoned =
            SignProcessor::new(set, &outputs[&1].share, message.to_vec(), b"first").unwrap();
        let stale = abandoned.start().unwrap().outbound.remove(0);

        let mut processors: BTreeMap<_, _> = party_sets(&[1, 2, 3], 1)
            .into_iter()
            .map(|set| {
                let id = set.local_id();
                let processor =
                    SignProcessor::new(set, &outputs[&id].share, message.to_vec(), b"second")
                        .unwrap();
                (id, processor)
            })
            .collect();
        for id in [2, 3] {
            processors
                .get_mut(&id)
                .unwrap()
                .handle(InboundMessage {
                    payload: stale.payload.clone(),
                    from: 1,
                    broadcast: true,
                })
                .unwrap();
            assert!(processors[&id].commitments.is_empty());
        }

        let signatures = exchange(&mut processors, false);
        assert_eq!(signatures.len(), 3);
        outputs[&1]
            .public_key
            .verify(message, &signatures[&3])
            .unwrap();
    }
}
