//! # TSS Party
//!
//! Message-driven engine for one participant of a threshold Schnorr
//! signature scheme over secp256k1.
//!
//! This crate provides:
//! - Distributed Key Generation (FROST DKG, `t + 1` of `n`)
//! - Threshold signing producing BIP-340 signatures
//! - A session driver that serializes all protocol work per party
//! - An in-process directory for wiring engines together
//!
//! ## Example
//!
//! ```rust,ignore
//! use tss_party::{PartyEngine, PartyIdentity};
//! use tokio_util::sync::CancellationToken;
//!
//! let engine = Arc::new(PartyEngine::new(PartyIdentity::new(1)));
//! directory.register(1, &engine);
//! engine.init(members, 2, directory.transport_for(1, [1, 2, 3]))?;
//!
//! let share = engine.keygen(&CancellationToken::new()).await?;
//! engine.set_share_data(share)?;
//! let signature = engine.sign(&CancellationToken::new(), &digest).await?;
//! engine.t_pub_key()?.verify(&digest, &signature)?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod keygen;
pub mod mpc;
pub mod session;
pub mod sign;
pub mod types;

pub use config::EngineConfig;
pub use engine::{EnginePhase, PartyEngine};
pub use error::{Error, Result};
pub use identity::{PartyIdentity, PartySet};
pub use mpc::{Directory, DirectoryTransport, Endpoint, Transport};
pub use types::{
    InboundMessage, OutboundMessage, PartyId, PublicKey, Recipient, SessionId, SessionKind,
    ShareData, Signature,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
