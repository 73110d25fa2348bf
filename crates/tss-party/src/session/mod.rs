//! Protocol sessions
//!
//! A session is one run of key generation or signing for one party. It owns
//! the round processor and a FIFO inbox; a single driver task feeds inbound
//! messages to the processor in arrival order, forwards every outbound
//! message to the transport exactly once, and resolves the completion signal
//! on the first terminal event.
//!
//! The processor is only ever touched by its driver task, which is what keeps
//! processor calls mutually exclusive no matter how many threads call
//! `on_msg` concurrently.

pub mod completion;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::mpc::Transport;
use crate::types::{InboundMessage, OutboundMessage, PartyId, SessionId, SessionKind};
use crate::{Error, Result};

pub use completion::{completion_signal, Completion, CompletionSignal};

/// Result of feeding one event to a round processor
#[derive(Debug)]
pub struct Progress<T> {
    /// Messages to hand to the transport, in order
    pub outbound: Vec<OutboundMessage>,
    /// Terminal output, once the protocol has finished
    pub output: Option<T>,
}

impl<T> Progress<T> {
    /// Nothing to send, not finished
    pub fn idle() -> Self {
        Self {
            outbound: Vec::new(),
            output: None,
        }
    }

    /// Messages to send, not finished
    pub fn send(outbound: Vec<OutboundMessage>) -> Self {
        Self {
            outbound,
            output: None,
        }
    }

    /// Protocol finished with `output`
    pub fn done(outbound: Vec<OutboundMessage>, output: T) -> Self {
        Self {
            outbound,
            output: Some(output),
        }
    }

    /// Append the progress of a later step
    pub fn merge(mut self, next: Progress<T>) -> Self {
        self.outbound.extend(next.outbound);
        if next.output.is_some() {
            self.output = next.output;
        }
        self
    }
}

/// Cryptographic round engine driven by a session.
///
/// The processor decides whether a message belongs to the current round, a
/// later round (and buffers it) or is invalid. Returning an error is fatal to
/// the session; invalid traffic from peers should be ignored instead.
pub trait RoundProcessor: Send + 'static {
    type Output: Send + 'static;

    /// Fingerprint carried by every envelope of this run
    fn fingerprint(&self) -> SessionId;

    /// Produce the opening messages of the protocol
    fn start(&mut self) -> Result<Progress<Self::Output>>;

    /// Consume one inbound message
    fn handle(&mut self, message: InboundMessage) -> Result<Progress<Self::Output>>;
}

/// Engine-side handle on a running session
#[derive(Debug)]
pub struct SessionHandle {
    id: Uuid,
    kind: SessionKind,
    fingerprint: SessionId,
    inbox: mpsc::UnboundedSender<InboundMessage>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn fingerprint(&self) -> SessionId {
        self.fingerprint
    }

    /// Enqueue a message. Once the session has terminated the message is
    /// handed back.
    pub fn deliver(&self, message: InboundMessage) -> std::result::Result<(), InboundMessage> {
        self.inbox.send(message).map_err(|e| e.0)
    }

    /// Stop the driver and hand back its task for joining
    pub fn abort(self) -> JoinHandle<()> {
        self.task.abort();
        self.task
    }
}

/// Session driver state, moved into its task
pub struct Session<P: RoundProcessor> {
    processor: P,
    inbox: mpsc::UnboundedReceiver<InboundMessage>,
    transport: Arc<dyn Transport>,
    signal: CompletionSignal<P::Output>,
}

impl<P: RoundProcessor> Session<P> {
    /// Spawn the driver for `processor`.
    ///
    /// `backlog` is replayed, in order, ahead of any live traffic.
    pub fn spawn(
        kind: SessionKind,
        party: PartyId,
        processor: P,
        transport: Arc<dyn Transport>,
        backlog: impl IntoIterator<Item = InboundMessage>,
    ) -> (SessionHandle, Completion<P::Output>) {
        let id = Uuid::new_v4();
        let fingerprint = processor.fingerprint();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut replayed = 0usize;
        for message in backlog {
            // The receiver is alive, so this cannot fail
            let _ = tx.send(message);
            replayed += 1;
        }

        let (signal, completion) = completion_signal();
        let session = Session {
            processor,
            inbox: rx,
            transport,
            signal,
        };

        let span = info_span!("session", %id, %kind, party);
        let task = tokio::spawn(
            async move {
                debug!(replayed, "Session driver started");
                session.drive().await;
            }
            .instrument(span),
        );

        (
            SessionHandle {
                id,
                kind,
                fingerprint,
                inbox: tx,
                task,
            },
            completion,
        )
    }

    async fn drive(mut self) {
        let outcome = self.run().await;
        match &outcome {
            Ok(_) => info!("Session completed"),
            Err(e) => warn!(error = %e, "Session failed"),
        }
        // Stop accepting traffic before anyone observes the outcome
        self.inbox.close();
        self.signal.resolve(outcome);
    }

    async fn run(&mut self) -> Result<P::Output> {
        let progress = self.processor.start()?;
        if let Some(output) = self.dispatch(progress) {
            return Ok(output);
        }

        while let Some(message) = self.inbox.recv().await {
            debug!(from = message.from, broadcast = message.broadcast, "Feeding message");
            let progress = self.processor.handle(message)?;
            if let Some(output) = self.dispatch(progress) {
                return Ok(output);
            }
        }

        Err(Error::Internal("Session inbox closed".into()))
    }

    fn dispatch(&self, progress: Progress<P::Output>) -> Option<P::Output> {
        for message in progress.outbound {
            debug!(
                broadcast = message.is_broadcast(),
                to = message.destination(),
                bytes = message.payload.len(),
                "Sending round message"
            );
            self.transport.send(message);
        }
        progress.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Echoes each message back to its sender and finishes after `target`
    /// messages, summing the first payload byte of each.
    struct Counter {
        target: usize,
        seen: Vec<u8>,
    }

    impl RoundProcessor for Counter {
        type Output = Vec<u8>;

        fn fingerprint(&self) -> SessionId {
            [self.target as u8; 32]
        }

        fn start(&mut self) -> Result<Progress<Vec<u8>>> {
            Ok(Progress::send(vec![OutboundMessage::broadcast(vec![0])]))
        }

        fn handle(&mut self, message: InboundMessage) -> Result<Progress<Vec<u8>>> {
            if message.payload.is_empty() {
                return Err(Error::Protocol("empty payload".into()));
            }
            self.seen.push(message.payload[0]);
            let reply = OutboundMessage::direct(message.from, message.payload.clone());
            if self.seen.len() == self.target {
                Ok(Progress::done(vec![reply], self.seen.clone()))
            } else {
                Ok(Progress::send(vec![reply]))
            }
        }
    }

    fn recording_transport() -> (Arc<dyn Transport>, Arc<Mutex<Vec<OutboundMessage>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let transport: Arc<dyn Transport> =
            Arc::new(move |message: OutboundMessage| sink.lock().push(message));
        (transport, sent)
    }

    fn inbound(from: PartyId, byte: u8) -> InboundMessage {
        InboundMessage {
            payload: vec![byte],
            from,
            broadcast: false,
        }
    }

    #[tokio::test]
    async fn test_backlog_then_live_in_order() {
        let (transport, sent) = recording_transport();
        let processor = Counter {
            target: 4,
            seen: Vec::new(),
        };

        let (handle, completion) = Session::spawn(
            SessionKind::Keygen,
            1,
            processor,
            transport,
            vec![inbound(2, 1), inbound(3, 2)],
        );
        assert_eq!(handle.fingerprint(), [4u8; 32]);
        handle.deliver(inbound(2, 3)).unwrap();
        handle.deliver(inbound(3, 4)).unwrap();

        assert_eq!(completion.wait().await, Ok(vec![1, 2, 3, 4]));

        let sent = sent.lock();
        assert_eq!(sent.len(), 5);
        assert!(sent[0].is_broadcast());
        assert_eq!(sent[1], OutboundMessage::direct(2, vec![1]));
        assert_eq!(sent[4], OutboundMessage::direct(3, vec![4]));
    }

    #[tokio::test]
    async fn test_processor_error_fails_session() {
        let (transport, _) = recording_transport();
        let processor = Counter {
            target: 2,
            seen: Vec::new(),
        };

        let (handle, completion) =
            Session::spawn(SessionKind::Signing, 1, processor, transport, Vec::new());
        handle
            .deliver(InboundMessage {
                payload: Vec::new(),
                from: 2,
                broadcast: true,
            })
            .unwrap();

        assert_eq!(
            completion.wait().await,
            Err(Error::Protocol("empty payload".into()))
        );
    }

    #[tokio::test]
    async fn test_terminated_session_rejects_messages() {
        let (transport, _) = recording_transport();
        let processor = Counter {
            target: 1,
            seen: Vec::new(),
        };

        let (handle, completion) =
            Session::spawn(SessionKind::Keygen, 1, processor, transport, vec![inbound(2, 9)]);
        assert_eq!(completion.wait().await, Ok(vec![9]));

        assert_eq!(handle.deliver(inbound(2, 1)), Err(inbound(2, 1)));
        let _ = handle.abort().await;
    }

    #[tokio::test]
    async fn test_abort_stops_driver() {
        let (transport, _) = recording_transport();
        let processor = Counter {
            target: 10,
            seen: Vec::new(),
        };

        let (handle, completion) =
            Session::spawn(SessionKind::Keygen, 1, processor, transport, Vec::new());
        let joined = handle.abort().await;
        assert!(joined.map_err(|e| e.is_cancelled()).err().unwrap_or(true));
        assert!(matches!(completion.wait().await, Err(Error::Internal(_))));
    }
}
