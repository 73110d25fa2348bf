//! Message transport seams
//!
//! The engine never owns a network. Outbound round messages go through an
//! injected [`Transport`]; inbound traffic arrives through
//! [`PartyEngine::on_msg`](crate::engine::PartyEngine::on_msg), which is also
//! exposed as an [`Endpoint`] so a directory can deliver to it.

use crate::types::{OutboundMessage, PartyId};

/// Outbound half of the transport, bound to one sending party
pub trait Transport: Send + Sync {
    /// Hand one round message to the network. Must not block on delivery.
    fn send(&self, message: OutboundMessage);
}

impl<F> Transport for F
where
    F: Fn(OutboundMessage) + Send + Sync,
{
    fn send(&self, message: OutboundMessage) {
        self(message)
    }
}

/// Inbound half of the transport: something that accepts delivered messages
pub trait Endpoint: Send + Sync {
    fn deliver(&self, payload: Vec<u8>, from: PartyId, broadcast: bool);
}

/// In-process delivery directory
pub mod memory;

pub use memory::{Directory, DirectoryTransport};
