//! DKG rounds
//!
//! Each round payload travels inside an [`Envelope`](crate::types::Envelope)
//! whose `data` is the serialized FROST package.

/// Round 1: commitments to the secret polynomial plus proof of knowledge,
/// broadcast to every member
pub const DKG_ROUND_COMMITMENTS: u32 = 1;

/// Round 2: secret share for one recipient, sent point-to-point
pub const DKG_ROUND_SHARES: u32 = 2;
