//! Party identities and the configured party set
//!
//! A party is addressed on the transport by a 16-bit numeric id derived from
//! its routing key: the key is read as a big-endian integer and truncated to
//! its low 16 bits. Distinct keys can truncate to the same id, so a party set
//! refuses to form when two members collide; within a set the mapping between
//! ids and identities is total and one-to-one.

use std::collections::BTreeMap;

use crate::types::{PartyId, SessionId, SessionKind};
use crate::{Error, Result};

/// Domain separator for session fingerprints
const FINGERPRINT_DOMAIN: &[u8] = b"tss-party/session/v1";

/// Truncate a routing key (big-endian integer) to its numeric routing id
pub fn truncate_routing_key(key: &[u8]) -> PartyId {
    key.iter()
        .rev()
        .take(2)
        .enumerate()
        .fold(0, |acc, (i, byte)| acc | (PartyId::from(*byte) << (8 * i)))
}

/// Immutable identity of one participant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartyIdentity {
    id: PartyId,
    routing_key: Vec<u8>,
}

impl PartyIdentity {
    /// Identity whose routing key is the minimal big-endian encoding of `id`
    pub fn new(id: PartyId) -> Self {
        let bytes = id.to_be_bytes();
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        Self {
            id,
            routing_key: bytes[start..].to_vec(),
        }
    }

    /// Identity derived from a public-key routing key
    pub fn from_routing_key(routing_key: impl Into<Vec<u8>>) -> Self {
        let routing_key = routing_key.into();
        Self {
            id: truncate_routing_key(&routing_key),
            routing_key,
        }
    }

    pub fn id(&self) -> PartyId {
        self.id
    }

    pub fn routing_key(&self) -> &[u8] {
        &self.routing_key
    }
}

/// Members, threshold and local party of one protocol run
#[derive(Debug, Clone)]
pub struct PartySet {
    members: BTreeMap<PartyId, PartyIdentity>,
    threshold: u16,
    local: PartyId,
}

impl PartySet {
    /// Validate and build a party set
    pub fn new(
        members: impl IntoIterator<Item = PartyIdentity>,
        threshold: u16,
        local: &PartyIdentity,
    ) -> Result<Self> {
        let mut by_id: BTreeMap<PartyId, PartyIdentity> = BTreeMap::new();

        for member in members {
            if member.id == 0 {
                return Err(Error::Configuration(
                    "Party id 0 is reserved for broadcasts".into(),
                ));
            }
            if let Some(existing) = by_id.get(&member.id) {
                return Err(if existing.routing_key == member.routing_key {
                    Error::Configuration(format!("Party {} listed twice", member.id))
                } else {
                    Error::Configuration(format!(
                        "Routing keys {} and {} both map to id {}",
                        hex::encode(&existing.routing_key),
                        hex::encode(&member.routing_key),
                        member.id
                    ))
                });
            }
            by_id.insert(member.id, member);
        }

        let n = by_id.len();
        if threshold == 0 || usize::from(threshold) >= n {
            return Err(Error::Configuration(format!(
                "Threshold must satisfy 0 < t < n, got t={} n={}",
                threshold, n
            )));
        }

        let set = Self {
            members: by_id,
            threshold,
            local: local.id,
        };
        if set.lookup(&local.routing_key) != Some(local.id) {
            return Err(Error::Configuration(format!(
                "Local party {} is not a member of the party set",
                local.id
            )));
        }
        Ok(set)
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn local_id(&self) -> PartyId {
        self.local
    }

    /// All member ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = PartyId> + '_ {
        self.members.keys().copied()
    }

    /// Member ids other than the local party
    pub fn peers(&self) -> impl Iterator<Item = PartyId> + '_ {
        let local = self.local;
        self.ids().filter(move |id| *id != local)
    }

    pub fn contains(&self, id: PartyId) -> bool {
        self.members.contains_key(&id)
    }

    /// Map a wire id back to a member identity
    pub fn resolve(&self, id: PartyId) -> Result<&PartyIdentity> {
        self.members.get(&id).ok_or(Error::Routing(id))
    }

    /// Map a routing key to the id of the member holding it
    pub fn lookup(&self, routing_key: &[u8]) -> Option<PartyId> {
        let id = truncate_routing_key(routing_key);
        self.members
            .get(&id)
            .filter(|member| member.routing_key == routing_key)
            .map(|member| member.id)
    }

    /// Fingerprint that every member computes identically for a run.
    ///
    /// `attempt` tells apart retries of the same run; `context` is the
    /// protocol input (the message, for signing).
    pub fn fingerprint(&self, kind: SessionKind, attempt: &[u8], context: &[u8]) -> SessionId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(&[match kind {
            SessionKind::Keygen => 1,
            SessionKind::Signing => 2,
        }]);
        hasher.update(&self.threshold.to_be_bytes());
        for member in self.members.values() {
            hasher.update(&member.id.to_be_bytes());
            hasher.update(&(member.routing_key.len() as u64).to_be_bytes());
            hasher.update(&member.routing_key);
        }
        hasher.update(&(attempt.len() as u64).to_be_bytes());
        hasher.update(attempt);
        hasher.update(&(context.len() as u64).to_be_bytes());
        hasher.update(context);
        *hasher.finalize().as_bytes()
    }
}
