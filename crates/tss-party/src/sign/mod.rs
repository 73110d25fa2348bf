//! Threshold signing module
//!
//! Two-round FROST signing producing BIP-340 Schnorr signatures under the
//! group key created by [`keygen`](crate::keygen).

mod dsg;
mod messages;

pub use dsg::SignProcessor;
pub use messages::*;
