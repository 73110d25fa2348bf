//! FROST DKG round processor

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use frost_secp256k1_tr as frost;
use frost::keys::dkg::{round1, round2};
use frost::Identifier;
use rand::rngs::OsRng;
use tracing::{debug, info, warn};

use super::{KeyShareRecord, KeygenOutput, DKG_ROUND_COMMITMENTS, DKG_ROUND_SHARES};
use crate::identity::PartySet;
use crate::session::{Progress, RoundProcessor};
use crate::types::{Envelope, InboundMessage, OutboundMessage, PartyId, SessionId, SessionKind};
use crate::{Error, Result};

enum DkgState {
    Pending,
    AwaitingCommitments(round1::SecretPackage),
    AwaitingShares(round2::SecretPackage),
    Finished,
}

/// Runs one party's side of a FROST key generation.
///
/// Every member contributes; the signing threshold of the resulting share is
/// `threshold + 1`. Round-2 shares that arrive before all commitments are in
/// are buffered.
pub struct DkgProcessor {
    session: SessionId,
    parties: Arc<PartySet>,
    identifiers: BTreeMap<Identifier, PartyId>,
    local: PartyId,
    state: DkgState,
    commitments: BTreeMap<Identifier, round1::Package>,
    shares: BTreeMap<Identifier, round2::Package>,
}

pub(crate) fn identifier(id: PartyId) -> Result<Identifier> {
    Identifier::try_from(id)
        .map_err(|e| Error::Configuration(format!("Party id {} has no identifier: {}", id, e)))
}

impl DkgProcessor {
    /// Create a new DKG processor for the local member of `parties`.
    ///
    /// `attempt` must be the same on every member and differ between retries.
    pub fn new(parties: Arc<PartySet>, attempt: &[u8]) -> Result<Self> {
        let identifiers = parties
            .ids()
            .map(|id| Ok((identifier(id)?, id)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            session: parties.fingerprint(SessionKind::Keygen, attempt, &[]),
            local: parties.local_id(),
            parties,
            identifiers,
            state: DkgState::Pending,
            commitments: BTreeMap::new(),
            shares: BTreeMap::new(),
        })
    }

    fn expected(&self) -> usize {
        self.parties.peers().count()
    }

    fn party_of(&self, identifier: &Identifier) -> Result<PartyId> {
        self.identifiers
            .get(identifier)
            .copied()
            .ok_or_else(|| Error::Internal("DKG produced a share for a non-member".into()))
    }

    fn seal(&self, round: u32, data: Vec<u8>) -> Result<Vec<u8>> {
        Envelope::seal(self.session, SessionKind::Keygen, round, self.local, data)
    }

    fn advance(&mut self) -> Result<Progress<KeygenOutput>> {
        match mem::replace(&mut self.state, DkgState::Finished) {
            DkgState::AwaitingCommitments(secret) if self.commitments.len() == self.expected() => {
                debug!("All commitments received, sending shares");
                let (secret, packages) = frost::keys::dkg::part2(secret, &self.commitments)?;

                let mut outbound = Vec::with_capacity(packages.len());
                for (to, package) in &packages {
                    let data = package
                        .serialize()
                        .map_err(|e| Error::Serialization(e.to_string()))?;
                    outbound.push(OutboundMessage::direct(
                        self.party_of(to)?,
                        self.seal(DKG_ROUND_SHARES, data)?,
                    ));
                }
                self.state = DkgState::AwaitingShares(secret);

                let next = self.advance()?;
                Ok(Progress::send(outbound).merge(next))
            }
            DkgState::AwaitingShares(secret) if self.shares.len() == self.expected() => {
                let (key_package, public_key_package) =
                    frost::keys::dkg::part3(&secret, &self.commitments, &self.shares)?;

                let record = KeyShareRecord::new(
                    self.local,
                    self.parties.len() as u16,
                    &key_package,
                    &public_key_package,
                )?;
                let output = KeygenOutput {
                    share: record.encode()?,
                    public_key: record.public_key()?,
                };

                info!(
                    party_id = self.local,
                    public_key = %output.public_key.to_hex(),
                    "DKG completed"
                );
                Ok(Progress::done(Vec::new(), output))
            }
            state => {
                self.state = state;
                Ok(Progress::idle())
            }
        }
    }
}

impl RoundProcessor for DkgProcessor {
    type Output = KeygenOutput;

    fn fingerprint(&self) -> SessionId {
        self.session
    }

    fn start(&mut self) -> Result<Progress<KeygenOutput>> {
        if !matches!(self.state, DkgState::Pending) {
            return Err(Error::Internal("DKG already started".into()));
        }

        let max_signers = self.parties.len() as u16;
        let min_signers = self.parties.threshold() + 1;
        info!(
            party_id = self.local,
            max_signers, min_signers, "Starting DKG"
        );

        let (secret, package) =
            frost::keys::dkg::part1(identifier(self.local)?, max_signers, min_signers, &mut OsRng)?;
        let data = package
            .serialize()
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.state = DkgState::AwaitingCommitments(secret);

        Ok(Progress::send(vec![OutboundMessage::broadcast(
            self.seal(DKG_ROUND_COMMITMENTS, data)?,
        )]))
    }

    fn handle(&mut self, message: InboundMessage) -> Result<Progress<KeygenOutput>> {
        let envelope = match Envelope::open(&message, &self.session, SessionKind::Keygen) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(from = message.from, error = %e, "Dropping keygen message");
                return Ok(Progress::idle());
            }
        };

        if envelope.from == self.local || !self.parties.contains(envelope.from) {
            warn!(from = envelope.from, "Keygen message from a non-peer");
            return Ok(Progress::idle());
        }
        let sender = identifier(envelope.from)?;

        match envelope.round {
            DKG_ROUND_COMMITMENTS if message.broadcast => {
                let Ok(package) = round1::Package::deserialize(&envelope.data) else {
                    warn!(from = envelope.from, "Malformed DKG commitment");
                    return Ok(Progress::idle());
                };
                if self.commitments.contains_key(&sender) {
                    debug!(from = envelope.from, "Duplicate DKG commitment");
                    return Ok(Progress::idle());
                }
                self.commitments.insert(sender, package);
            }
            DKG_ROUND_SHARES if !message.broadcast => {
                let Ok(package) = round2::Package::deserialize(&envelope.data) else {
                    warn!(from = envelope.from, "Malformed DKG share");
                    return Ok(Progress::idle());
                };
                if self.shares.contains_key(&sender) {
                    debug!(from = envelope.from, "Duplicate DKG share");
                    return Ok(Progress::idle());
                }
                self.shares.insert(sender, package);
            }
            round => {
                warn!(
                    from = envelope.from,
                    round,
                    broadcast = message.broadcast,
                    "Unexpected DKG round"
                );
                return Ok(Progress::idle());
            }
        }

        self.advance()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::identity::PartyIdentity;
    use crate::types::Recipient;
    use std::collections::VecDeque;

    pub(crate) fn party_sets(ids: &[PartyId], threshold: u16) -> Vec<Arc<PartySet>> {
        let members: Vec<_> = ids.iter().copied().map(PartyIdentity::new).collect();
        ids.iter()
            .map(|id| {
                Arc::new(PartySet::new(members.clone(), threshold, &PartyIdentity::new(*id)).unwrap())
            })
            .collect()
    }

    /// Deliver every message until all processors finish. `lifo` delivers
    /// the most recent message first to shuffle round order.
    pub(crate) fn exchange<P: RoundProcessor>(
        processors: &mut BTreeMap<PartyId, P>,
        lifo: bool,
    ) -> BTreeMap<PartyId, P::Output> {
        let mut queue = VecDeque::new();
        let mut outputs = BTreeMap::new();

        for (id, processor) in processors.iter_mut() {
            let progress = processor.start().unwrap();
            queue.extend(progress.outbound.into_iter().map(|m| (*id, m)));
        }

        while let Some((from, message)) = if lifo {
            queue.pop_back()
        } else {
            queue.pop_front()
        } {
            let targets: Vec<PartyId> = match message.to {
                Recipient::All => processors.keys().copied().filter(|id| *id != from).collect(),
                Recipient::Party(id) => vec![id],
            };
            for to in targets {
                if outputs.contains_key(&to) {
                    continue;
                }
                let processor = processors.get_mut(&to).unwrap();
                let progress = processor
                    .handle(InboundMessage {
                        payload: message.payload.clone(),
                        from,
                        broadcast: message.is_broadcast(),
                    })
                    .unwrap();
                queue.extend(progress.outbound.into_iter().map(|m| (to, m)));
                if let Some(output) = progress.output {
                    outputs.insert(to, output);
                }
            }
        }

        outputs
    }

    pub(crate) fn run_dkg(ids: &[PartyId], threshold: u16) -> BTreeMap<PartyId, KeygenOutput> {
        let mut processors: BTreeMap<_, _> = party_sets(ids, threshold)
            .into_iter()
            .map(|set| (set.local_id(), DkgProcessor::new(set, b"").unwrap()))
            .collect();
        exchange(&mut processors, false)
    }

    #[test]
    fn test_dkg_three_parties() {
        let outputs = run_dkg(&[1, 2, 3], 1);
        assert_eq!(outputs.len(), 3);

        let key = &outputs[&1].public_key;
        assert!(key.x_only().is_ok());
        for (id, output) in &outputs {
            assert_eq!(&output.public_key, key);
            let record = KeyShareRecord::decode(&output.share).unwrap();
            assert_eq!(record.party_id, *id);
            assert_eq!(record.min_signers, 2);
            assert_eq!(record.max_signers, 3);
            assert_eq!(&record.public_key().unwrap(), key);
        }
    }

    #[test]
    fn test_dkg_out_of_order_delivery() {
        let mut processors: BTreeMap<_, _> = party_sets(&[1, 2, 3, 4], 2)
            .into_iter()
            .map(|set| (set.local_id(), DkgProcessor::new(set, b"").unwrap()))
            .collect();
        let outputs = exchange(&mut processors, true);

        assert_eq!(outputs.len(), 4);
        let key = &outputs[&1].public_key;
        assert!(outputs.values().all(|o| &o.public_key == key));
    }

    #[test]
    fn test_dkg_ignores_foreign_traffic() {
        let sets = party_sets(&[1, 2, 3], 1);
        let mut processor = DkgProcessor::new(sets[0].clone(), b"").unwrap();
        processor.start().unwrap();

        let garbage = InboundMessage {
            payload: b"garbage".to_vec(),
            from: 2,
            broadcast: true,
        };
        assert!(processor.handle(garbage).unwrap().outbound.is_empty());

        let stale = Envelope::seal([9u8; 32], SessionKind::Keygen, 1, 2, vec![1]).unwrap();
        let progress = processor
            .handle(InboundMessage {
                payload: stale,
                from: 2,
                broadcast: true,
            })
            .unwrap();
        assert!(progress.outbound.is_empty() && progress.output.is_none());

        // Commitments must be broadcast
        let session = sets[0].fingerprint(SessionKind::Keygen, b"", &[]);
        let direct = Envelope::seal(session, SessionKind::Keygen, DKG_ROUND_COMMITMENTS, 2, vec![1])
            .unwrap();
        let progress = processor
            .handle(InboundMessage {
                payload: direct,
                from: 2,
                broadcast: false,
            })
            .unwrap();
        assert!(progress.outbound.is_empty());
        assert!(processor.commitments.is_empty());
    }

    #[test]
    fn test_dkg_ignores_commitment_from_abandoned_attempt() {
        let sets = party_sets(&[1, 2, 3], 1);

        // Party 1 opened a run that was later abandoned
        let mut abandoned = DkgProcessor::new(sets[0].clone(), b"first").unwrap();
        let stale = abandoned.start().unwrap().outbound.remove(0);

        let mut processors: BTreeMap<_, _> = sets
            .iter()
            .map(|set| {
                let processor = DkgProcessor::new(set.clone(), b"second").unwrap();
                (set.local_id(), processor)
            })
            .collect();
        let second = processors.get_mut(&2).unwrap();
        let progress = second
            .handle(InboundMessage {
                payload: stale.payload,
                from: 1,
                broadcast: true,
            })
            .unwrap();
        assert!(progress.outbound.is_empty());
        assert!(second.commitments.is_empty());

        let outputs = exchange(&mut processors, false);
        assert_eq!(outputs.len(), 3);
        let key = &outputs[&1].public_key;
        assert!(outputs.values().all(|o| &o.public_key == key));
    }

    #[test]
    fn test_dkg_start_twice_fails() {
        let sets = party_sets(&[1, 2], 1);
        let mut processor = DkgProcessor::new(sets[0].clone(), b"").unwrap();
        let progress = processor.start().unwrap();
        assert_eq!(progress.outbound.len(), 1);
        assert!(progress.outbound[0].is_broadcast());
        assert!(matches!(processor.start(), Err(Error::Internal(_))));
    }
}
