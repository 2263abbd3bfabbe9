//! Error types for the fallible public surface.
//!
//! Only construction and the outbound calls can fail. Inbound failures
//! (authentication, malformed payloads, stale symbols) are silent drops
//! counted in [`crate::stats::EndpointStats`].

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by [`crate::endpoint::Endpoint`].
#[derive(Debug, Error)]
pub enum Error {
    /// `min_loss` must be a probability.
    #[error("loss floor {0} outside [0, 1]")]
    InvalidLossFloor(f64),

    /// `target_loss` must be a nonzero probability.
    #[error("target residual loss {0} outside (0, 1)")]
    InvalidTargetLoss(f64),

    /// Delay clamp bounds are inverted.
    #[error("delay clamp inverted: min {min:?} > max {max:?}")]
    DelayClampInverted { min: Duration, max: Duration },

    /// `max_data_size` cannot hold the envelope and symbol header.
    #[error("max_data_size {actual} below minimum {min}")]
    DatagramSizeTooSmall { min: usize, actual: usize },

    /// The shared secret has the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Payload exceeds what fits in one datagram after overheads.
    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// Out-of-band payloads must carry at least the type byte.
    #[error("out-of-band payload must carry a type byte")]
    EmptyOob,

    /// The first OOB byte landed in the range owned by the engine.
    #[error("out-of-band type {0:#04x} is reserved for the engine")]
    ReservedOobType(u8),

    /// The AEAD primitive refused to seal a packet.
    #[error("envelope seal failed")]
    Seal,
}
