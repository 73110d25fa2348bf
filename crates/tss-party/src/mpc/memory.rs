//! In-process delivery directory
//!
//! Maps numeric party ids to delivery endpoints. Each party gets its own
//! [`DirectoryTransport`] bound to its id and to the members it was
//! configured with, so the sender and the broadcast audience are fixed by
//! construction rather than captured from a shared party list.

use super::{Endpoint, Transport};
use crate::types::{OutboundMessage, PartyId, Recipient};
use dashmap::{DashMap, DashSet};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

/// Registry of reachable endpoints keyed by routing id
#[derive(Clone, Default)]
pub struct Directory {
    /// Registered endpoints; weak so the directory never keeps a party alive
    endpoints: Arc<DashMap<PartyId, Weak<dyn Endpoint>>>,
    /// Parties whose traffic is dropped in both directions
    isolated: Arc<DashSet<PartyId>>,
}

impl Directory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the endpoint reachable at `id`
    pub fn register<E>(&self, id: PartyId, endpoint: &Arc<E>)
    where
        E: Endpoint + 'static,
    {
        let endpoint: Arc<dyn Endpoint> = endpoint.clone();
        self.endpoints.insert(id, Arc::downgrade(&endpoint));
    }

    /// Drop all traffic from and to `id` until restored
    pub fn isolate(&self, id: PartyId) {
        self.isolated.insert(id);
    }

    /// Undo [`isolate`](Self::isolate)
    pub fn restore(&self, id: PartyId) {
        self.isolated.remove(&id);
    }

    /// Transport that sends on behalf of `source` to `members`.
    ///
    /// Broadcasts reach every member but the sender; messages addressed to
    /// anyone outside `members` are dropped.
    pub fn transport_for(
        &self,
        source: PartyId,
        members: impl IntoIterator<Item = PartyId>,
    ) -> DirectoryTransport {
        DirectoryTransport {
            directory: self.clone(),
            source,
            members: Arc::new(members.into_iter().collect()),
        }
    }

    fn endpoint(&self, id: PartyId) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.get(&id).and_then(|entry| entry.value().upgrade())
    }

    fn route(&self, source: PartyId, members: &BTreeSet<PartyId>, message: OutboundMessage) {
        if self.isolated.contains(&source) {
            trace!(source, "Sender isolated, dropping message");
            return;
        }

        match message.to {
            Recipient::All => {
                // Snapshot first so no map guard is held while delivering
                let targets: Vec<_> = members
                    .iter()
                    .copied()
                    .filter(|id| *id != source && !self.isolated.contains(id))
                    .filter_map(|id| self.endpoint(id).map(|endpoint| (id, endpoint)))
                    .collect();

                for (id, endpoint) in targets {
                    trace!(source, to = id, "Delivering broadcast");
                    endpoint.deliver(message.payload.clone(), source, true);
                }
            }
            Recipient::Party(to) => {
                if !members.contains(&to) {
                    warn!(source, to, "Recipient is not a member, dropping message");
                    return;
                }
                if self.isolated.contains(&to) {
                    trace!(source, to, "Recipient isolated, dropping message");
                    return;
                }
                match self.endpoint(to) {
                    Some(endpoint) => endpoint.deliver(message.payload, source, false),
                    None => warn!(source, to, "No endpoint registered for recipient"),
                }
            }
        }
    }
}

/// [`Transport`] that routes through a [`Directory`] as a fixed sender
#[derive(Clone)]
pub struct DirectoryTransport {
    directory: Directory,
    source: PartyId,
    members: Arc<BTreeSet<PartyId>>,
}

impl Transport for DirectoryTransport {
    fn send(&self, message: OutboundMessage) {
        self.directory.route(self.source, &self.members, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<(Vec<u8>, PartyId, bool)>>,
    }

    impl Endpoint for Recorder {
        fn deliver(&self, payload: Vec<u8>, from: PartyId, broadcast: bool) {
            self.received.lock().push((payload, from, broadcast));
        }
    }

    fn setup(ids: &[PartyId]) -> (Directory, Vec<Arc<Recorder>>) {
        let directory = Directory::new();
        let recorders: Vec<_> = ids
            .iter()
            .map(|id| {
                let recorder = Arc::new(Recorder::default());
                directory.register(*id, &recorder);
                recorder
            })
            .collect();
        (directory, recorders)
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let (directory, recorders) = setup(&[1, 2, 3]);

        directory
            .transport_for(2, [1, 2, 3])
            .send(OutboundMessage::broadcast(vec![42]));

        assert!(recorders[1].received.lock().is_empty());
        assert_eq!(recorders[0].received.lock().as_slice(), &[(vec![42], 2, true)]);
        assert_eq!(recorders[2].received.lock().as_slice(), &[(vec![42], 2, true)]);
    }

    #[test]
    fn test_broadcast_stays_within_members() {
        let (directory, recorders) = setup(&[1, 2, 3, 4, 5]);
        let transport = directory.transport_for(1, [1, 2, 3]);

        transport.send(OutboundMessage::broadcast(vec![1]));
        transport.send(OutboundMessage::direct(5, vec![2]));

        assert_eq!(recorders[1].received.lock().len(), 1);
        assert_eq!(recorders[2].received.lock().len(), 1);
        assert!(recorders[3].received.lock().is_empty());
        assert!(recorders[4].received.lock().is_empty());
    }

    #[test]
    fn test_direct_reaches_only_recipient() {
        let (directory, recorders) = setup(&[1, 2, 3]);

        directory
            .transport_for(1, [1, 2, 3])
            .send(OutboundMessage::direct(3, vec![7]));

        assert!(recorders[0].received.lock().is_empty());
        assert!(recorders[1].received.lock().is_empty());
        assert_eq!(recorders[2].received.lock().as_slice(), &[(vec![7], 1, false)]);
    }

    #[test]
    fn test_isolated_party_is_cut_off() {
        let (directory, recorders) = setup(&[1, 2, 3]);
        directory.isolate(3);

        directory
            .transport_for(1, [1, 2, 3])
            .send(OutboundMessage::broadcast(vec![1]));
        directory
            .transport_for(3, [1, 2, 3])
            .send(OutboundMessage::direct(1, vec![2]));

        assert_eq!(recorders[1].received.lock().len(), 1);
        assert!(recorders[2].received.lock().is_empty());
        assert!(recorders[0].received.lock().is_empty());

        directory.restore(3);
        directory
            .transport_for(3, [1, 2, 3])
            .send(OutboundMessage::direct(1, vec![2]));
        assert_eq!(recorders[0].received.lock().as_slice(), &[(vec![2], 3, false)]);
    }

    #[test]
    fn test_dropped_endpoint_is_skipped() {
        let (directory, mut recorders) = setup(&[1, 2, 3]);
        recorders.remove(1);

        directory
            .transport_for(1, [1, 2, 3])
            .send(OutboundMessage::broadcast(vec![9]));
        assert_eq!(recorders[1].received.lock().as_slice(), &[(vec![9], 1, true)]);
    }
}
