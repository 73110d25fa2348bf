//! # TSS Cluster
//!
//! In-process harness that runs several [`PartyEngine`]s against each other
//! over a shared [`Directory`]. Used by the end-to-end tests and handy for
//! local experiments.

pub mod error;
pub mod scatter;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};
use uuid::Uuid;
use tss_party::{
    Directory, DirectoryTransport, EngineConfig, PartyEngine, PartyId, PartyIdentity, ShareData,
    Signature, Transport,
};

pub use error::{ClusterError, Result};
pub use scatter::scatter_gather;

/// A set of engines wired to one directory
pub struct Cluster {
    directory: Directory,
    parties: BTreeMap<PartyId, Arc<PartyEngine>>,
    deadline: Option<Duration>,
}

impl Cluster {
    /// Create engines for `ids` with the default configuration
    pub fn new(ids: impl IntoIterator<Item = PartyId>) -> Self {
        Self::with_config(ids, EngineConfig::default())
    }

    pub fn with_config(ids: impl IntoIterator<Item = PartyId>, config: EngineConfig) -> Self {
        let directory = Directory::new();
        let parties = ids
            .into_iter()
            .map(|id| {
                let engine = Arc::new(PartyEngine::with_config(
                    PartyIdentity::new(id),
                    config.clone(),
                ));
                directory.register(id, &engine);
                (id, engine)
            })
            .collect();

        Self {
            directory,
            parties,
            deadline: None,
        }
    }

    /// Bound every fan-out operation by `deadline`
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn ids(&self) -> Vec<PartyId> {
        self.parties.keys().copied().collect()
    }

    pub fn party(&self, id: PartyId) -> Result<&Arc<PartyEngine>> {
        self.parties.get(&id).ok_or(ClusterError::UnknownParty(id))
    }

    /// Configure every party with the full member set
    pub fn init(&self, threshold: u16) -> Result<()> {
        self.init_subset(&self.ids(), threshold)
    }

    /// Configure the parties in `ids` with `ids` as the member set
    pub fn init_subset(&self, ids: &[PartyId], threshold: u16) -> Result<()> {
        self.init_with(ids, threshold, |transport| transport)
    }

    /// Like [`init_subset`](Self::init_subset), wrapping each party's
    /// directory transport with `wrap`. Broadcasts reach `ids` only.
    pub fn init_with<T, F>(&self, ids: &[PartyId], threshold: u16, wrap: F) -> Result<()>
    where
        T: Transport + 'static,
        F: Fn(DirectoryTransport) -> T,
    {
        let members: Vec<_> = ids.iter().copied().map(PartyIdentity::new).collect();
        for id in ids {
            let transport = wrap(self.directory.transport_for(*id, ids.iter().copied()));
            self.party(*id)?
                .init(members.clone(), threshold, transport)
                .map_err(|source| ClusterError::Party { party: *id, source })?;
        }
        info!(members = ids.len(), threshold, "Cluster configured");
        Ok(())
    }

    /// Run key generation on every party
    #[instrument(skip(self))]
    pub async fn keygen(&self) -> Result<BTreeMap<PartyId, ShareData>> {
        self.keygen_on(&self.ids()).await
    }

    /// Run key generation on the parties in `ids`
    pub async fn keygen_on(&self, ids: &[PartyId]) -> Result<BTreeMap<PartyId, ShareData>> {
        let attempt = Self::attempt();
        scatter_gather(self.select(ids)?, self.deadline, move |engine, cancel| async move {
            engine.keygen_attempt(&cancel, attempt.as_bytes()).await
        })
        .await
    }

    /// Hand each party its share
    pub fn set_share_data(&self, shares: &BTreeMap<PartyId, ShareData>) -> Result<()> {
        for (id, share) in shares {
            self.party(*id)?
                .set_share_data(share.clone())
                .map_err(|source| ClusterError::Party { party: *id, source })?;
        }
        Ok(())
    }

    /// Sign `message` on the parties in `ids`
    #[instrument(skip(self, message))]
    pub async fn sign(&self, ids: &[PartyId], message: &[u8]) -> Result<BTreeMap<PartyId, Signature>> {
        let message: Arc<[u8]> = Arc::from(message);
        let attempt = Self::attempt();
        scatter_gather(self.select(ids)?, self.deadline, move |engine, cancel| {
            let message = message.clone();
            async move {
                engine
                    .sign_attempt(&cancel, &message, attempt.as_bytes())
                    .await
            }
        })
        .await
    }

    /// Fresh id shared by every party of one fan-out
    fn attempt() -> Uuid {
        let attempt = Uuid::new_v4();
        debug!(%attempt, "Starting fan-out");
        attempt
    }

    fn select(&self, ids: &[PartyId]) -> Result<Vec<(PartyId, Arc<PartyEngine>)>> {
        ids.iter()
            .map(|id| Ok((*id, self.party(*id)?.clone())))
            .collect()
    }
}
