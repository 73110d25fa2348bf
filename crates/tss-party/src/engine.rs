//! Party engine
//!
//! One [`PartyEngine`] per participant. It holds the party set, the
//! transport, the key share and at most one running session, and exposes the
//! blocking-style `keygen`/`sign` calls on top of the message-driven round
//! processors.

use std::collections::VecDeque;
use std::future;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::identity::{PartyIdentity, PartySet};
use crate::keygen::{DkgProcessor, KeyShareRecord, KeygenOutput};
use crate::mpc::{Endpoint, Transport};
use crate::session::{RoundProcessor, Session, SessionHandle};
use crate::sign::SignProcessor;
use crate::types::{
    Envelope, InboundMessage, PartyId, PublicKey, SessionKind, ShareData, Signature,
};
use crate::{Error, Result};

/// Externally visible lifecycle state of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    /// No party set configured yet
    Idle,
    /// Party set and transport bound, no session running
    Configured,
    /// A session of the given kind is in flight
    Running(SessionKind),
}

struct Binding {
    parties: Arc<PartySet>,
    transport: Arc<dyn Transport>,
}

#[derive(Default)]
struct EngineState {
    binding: Option<Binding>,
    share: Option<ShareData>,
    public_key: Option<PublicKey>,
    session: Option<SessionHandle>,
    /// Messages received while configured but not running
    early: VecDeque<InboundMessage>,
}

/// Threshold signature participant
pub struct PartyEngine {
    identity: PartyIdentity,
    config: EngineConfig,
    state: Mutex<EngineState>,
}

impl PartyEngine {
    /// Create a new engine with the default configuration
    pub fn new(identity: PartyIdentity) -> Self {
        Self::with_config(identity, EngineConfig::default())
    }

    pub fn with_config(identity: PartyIdentity, config: EngineConfig) -> Self {
        Self {
            identity,
            config,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn identity(&self) -> &PartyIdentity {
        &self.identity
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn phase(&self) -> EnginePhase {
        let state = self.state.lock();
        match (&state.session, &state.binding) {
            (Some(session), _) => EnginePhase::Running(session.kind()),
            (None, Some(_)) => EnginePhase::Configured,
            (None, None) => EnginePhase::Idle,
        }
    }

    /// Bind the party set, threshold and outbound transport.
    ///
    /// May be called again between sessions, for example to sign with a
    /// subset of the parties that ran key generation.
    #[instrument(skip(self, members, transport), fields(party = self.identity.id()))]
    pub fn init<T>(
        &self,
        members: impl IntoIterator<Item = PartyIdentity>,
        threshold: u16,
        transport: T,
    ) -> Result<()>
    where
        T: Transport + 'static,
    {
        let parties = PartySet::new(members, threshold, &self.identity)?;

        let mut state = self.state.lock();
        if let Some(session) = &state.session {
            return Err(Error::SessionConflict(session.kind()));
        }

        // Keep early traffic from peers that are still members
        let before = state.early.len();
        state.early.retain(|message| parties.contains(message.from));
        if state.early.len() != before {
            debug!(
                dropped = before - state.early.len(),
                "Discarded early messages from former members"
            );
        }

        info!(
            members = parties.len(),
            threshold = parties.threshold(),
            "Engine configured"
        );
        state.binding = Some(Binding {
            parties: Arc::new(parties),
            transport: Arc::new(transport),
        });
        Ok(())
    }

    /// Run distributed key generation with every configured member.
    ///
    /// Returns this party's share. The group public key is kept and served
    /// by [`t_pub_key`](Self::t_pub_key); the share is not retained.
    pub async fn keygen(&self, cancel: &CancellationToken) -> Result<ShareData> {
        self.keygen_attempt(cancel, &[]).await
    }

    /// [`keygen`](Self::keygen) bound to `attempt`.
    ///
    /// Every member must pass the same `attempt`, and a retry after a
    /// cancelled or failed run must use a new one. Traffic left over from
    /// the earlier run then cannot be mistaken for the retry's.
    #[instrument(skip(self, cancel, attempt), fields(party = self.identity.id(), attempt = %hex::encode(attempt)))]
    pub async fn keygen_attempt(
        &self,
        cancel: &CancellationToken,
        attempt: &[u8],
    ) -> Result<ShareData> {
        let KeygenOutput { share, public_key } = self
            .run_session(SessionKind::Keygen, cancel, |_, parties| {
                DkgProcessor::new(parties, attempt)
            })
            .await?;

        info!(public_key = %public_key.to_hex(), "Key generation finished");
        self.state.lock().public_key = Some(public_key);
        Ok(share)
    }

    /// Store the share used by subsequent [`sign`](Self::sign) calls
    pub fn set_share_data(&self, share: ShareData) -> Result<()> {
        let mut state = self.state.lock();
        if state.binding.is_none() {
            return Err(Error::Configuration("Engine is not initialized".into()));
        }

        let record = KeyShareRecord::decode(&share)
            .map_err(|e| Error::Configuration(format!("Share data does not decode: {}", e)))?;
        if record.party_id != self.identity.id() {
            return Err(Error::Configuration(format!(
                "Share belongs to party {}, not {}",
                record.party_id,
                self.identity.id()
            )));
        }

        debug!(party = self.identity.id(), bytes = share.len(), "Share data set");
        state.share = Some(share);
        Ok(())
    }

    /// Sign an already digested message with every configured member
    pub async fn sign(&self, cancel: &CancellationToken, message: &[u8]) -> Result<Signature> {
        self.sign_attempt(cancel, message, &[]).await
    }

    /// [`sign`](Self::sign) bound to `attempt`, with the same rules as
    /// [`keygen_attempt`](Self::keygen_attempt)
    #[instrument(skip(self, cancel, message, attempt), fields(party = self.identity.id(), len = message.len(), attempt = %hex::encode(attempt)))]
    pub async fn sign_attempt(
        &self,
        cancel: &CancellationToken,
        message: &[u8],
        attempt: &[u8],
    ) -> Result<Signature> {
        self.run_session(SessionKind::Signing, cancel, |state, parties| {
            let share = state
                .share
                .as_ref()
                .ok_or_else(|| Error::Configuration("No share data set".into()))?;
            SignProcessor::new(parties, share, message.to_vec(), attempt)
        })
        .await
    }

    /// Feed one inbound message. Never blocks on protocol work.
    ///
    /// Messages for the running session go to it. Anything else from a
    /// configured member, including traffic that arrives after the session
    /// terminated, is held for the next session.
    pub fn on_msg(&self, payload: Vec<u8>, from: PartyId, broadcast: bool) {
        let mut state = self.state.lock();
        let EngineState {
            binding,
            session,
            early,
            ..
        } = &mut *state;

        let Some(binding) = binding else {
            warn!(party = self.identity.id(), from, "Message before init, dropping");
            return;
        };
        if let Err(e) = binding.parties.resolve(from) {
            warn!(party = self.identity.id(), error = %e, "Dropping message");
            return;
        }

        let message = InboundMessage {
            payload,
            from,
            broadcast,
        };
        let message = match session.as_ref() {
            Some(session) if belongs_to(&message, session) => match session.deliver(message) {
                Ok(()) => return,
                Err(message) => message,
            },
            _ => message,
        };

        if early.len() >= self.config.early_message_limit {
            warn!(
                party = self.identity.id(),
                from,
                limit = self.config.early_message_limit,
                "Early message buffer full, dropping"
            );
            return;
        }
        early.push_back(message);
    }

    /// Group public key from the last key generation run on this engine
    pub fn t_pub_key(&self) -> Result<PublicKey> {
        self.state.lock().public_key.clone().ok_or_else(|| {
            Error::Configuration("No key generation has completed on this engine".into())
        })
    }

    async fn run_session<P, F>(
        &self,
        kind: SessionKind,
        cancel: &CancellationToken,
        build: F,
    ) -> Result<P::Output>
    where
        P: RoundProcessor,
        F: FnOnce(&EngineState, Arc<PartySet>) -> Result<P>,
    {
        let completion = {
            let mut state = self.state.lock();
            if let Some(session) = &state.session {
                return Err(Error::SessionConflict(session.kind()));
            }
            let (parties, transport) = match &state.binding {
                Some(binding) => (binding.parties.clone(), binding.transport.clone()),
                None => return Err(Error::Configuration("Engine is not initialized".into())),
            };

            let processor = build(&*state, parties)?;
            let backlog = mem::take(&mut state.early);
            let (handle, completion) =
                Session::spawn(kind, self.identity.id(), processor, transport, backlog);
            state.session = Some(handle);
            completion
        };
        let guard = SessionGuard {
            state: &self.state,
            armed: true,
        };

        let timeout = self.config.session_timeout;
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            outcome = completion.wait() => outcome,
            _ = cancel.cancelled() => {
                Err(Error::Cancelled(format!("{} cancelled by caller", kind)))
            }
            _ = deadline => {
                Err(Error::Cancelled(format!("{} timed out", kind)))
            }
        };

        guard.release().await;
        outcome
    }
}

impl Endpoint for PartyEngine {
    fn deliver(&self, payload: Vec<u8>, from: PartyId, broadcast: bool) {
        self.on_msg(payload, from, broadcast)
    }
}

/// Whether `message` is addressed to `session`. Undecodable payloads are
/// left to the processor to reject.
fn belongs_to(message: &InboundMessage, session: &SessionHandle) -> bool {
    Envelope::session_of(&message.payload).map_or(true, |id| id == session.fingerprint())
}

/// Take the session out of the engine and drop traffic held for it
fn retire(state: &mut EngineState) -> Option<SessionHandle> {
    let session = state.session.take()?;
    let fingerprint = session.fingerprint();
    let before = state.early.len();
    state
        .early
        .retain(|message| Envelope::session_of(&message.payload) != Some(fingerprint));
    if state.early.len() != before {
        debug!(
            session = %session.id(),
            dropped = before - state.early.len(),
            "Discarded late messages of a finished session"
        );
    }
    Some(session)
}

/// Clears the running session when `keygen`/`sign` returns or is dropped
struct SessionGuard<'a> {
    state: &'a Mutex<EngineState>,
    armed: bool,
}

impl SessionGuard<'_> {
    async fn release(mut self) {
        self.armed = false;
        let session = retire(&mut self.state.lock());
        if let Some(session) = session {
            // The driver has already resolved or is being cancelled
            let _ = session.abort().await;
        }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(session) = retire(&mut self.state.lock()) {
                debug!(session = %session.id(), "Session abandoned, aborting");
                session.abort();
            }
        }
    }
}
