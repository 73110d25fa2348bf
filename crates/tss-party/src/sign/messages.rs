//! Signing rounds
//!
//! Both rounds are broadcast to every signer inside an
//! [`Envelope`](crate::types::Envelope).

/// Round 1: nonce commitments
pub const SIGN_ROUND_COMMITMENTS: u32 = 1;

/// Round 2: signature shares over the agreed signing package
pub const SIGN_ROUND_SHARES: u32 = 2;
