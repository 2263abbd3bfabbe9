//! # riptide
//!
//! Loss-hardened, authenticated datagram shim.
//!
//! Riptide sits between an application and a raw unreliable packet channel
//! (UDP in practice) and dials the effective loss rate down to a configured
//! target while preventing tampering — without retransmission, ordering, or
//! head-of-line blocking. Outbound datagrams are grouped into code groups,
//! each group extended with systematic erasure-code redundancy sized from a
//! live loss estimate; both endpoints continuously measure loss and
//! round-trip delay through a small pong sub-protocol and adapt group
//! timing and redundancy to the path.
//!
//! Reliability, ordering, and congestion control are deliberately out of
//! scope; those layers compose on top.
//!
//! ## Crate structure
//!
//! - [`wire`] — VarInt, symbol headers, pong body, packet tags
//! - [`cipher`] — authenticated envelope, key schedule, replay protection
//! - [`codec`] — systematic Cauchy erasure code over GF(2^8)
//! - [`pool`] — buffer reuse pool for packet assembly
//! - [`stats`] — loss/delay estimators and exportable counters
//! - [`plan`] — binomial redundancy planner
//! - [`encoder`] — sender group engine: swap timing, recovery pacing
//! - [`decoder`] — receiver group ring: reassembly, decode, statistics
//! - [`endpoint`] — public facade: `Endpoint`, `Settings`, `PacketIo`
//! - [`error`] — error types for the fallible surface

pub mod cipher;
pub mod codec;
pub mod decoder;
pub mod encoder;
pub mod endpoint;
pub mod error;
pub mod plan;
pub mod pool;
pub mod stats;
pub mod wire;
