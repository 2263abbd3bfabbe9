//! # Cipher Envelope
//!
//! Authenticated encryption for every packet on the wire, ChaCha20-Poly1305
//! under a per-direction key schedule.
//!
//! Wire layout: `[counter: u64 BE][ciphertext || tag]`. The counter is both
//! the AEAD nonce (trailing bytes of the 12-byte nonce) and the anti-replay
//! sequence; a 128-entry sliding bitmap drops replayed or long-delayed
//! packets before they reach the decoder.
//!
//! The two directions derive independent keys from the shared secret with
//! HKDF-SHA256; the `initiator` role selects which half an endpoint seals
//! with. Peers MUST pick opposite roles or every packet fails
//! authentication.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305,
};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::Error;

/// Shared secret size handed to [`derive_pair`].
pub const SESSION_KEY_BYTES: usize = 32;

/// Counter prefix carried in clear on every envelope.
pub const COUNTER_BYTES: usize = 8;

/// Poly1305 authentication tag size.
pub const TAG_BYTES: usize = 16;

/// Fixed per-packet ciphertext expansion: counter + tag.
pub const ENVELOPE_OVERHEAD: usize = COUNTER_BYTES + TAG_BYTES;

/// Anti-replay window depth in packets.
const REPLAY_WINDOW: u64 = 128;

const INFO_I2R: &[u8] = b"riptide v1 i2r";
const INFO_R2I: &[u8] = b"riptide v1 r2i";

// ─── Key Schedule ───────────────────────────────────────────────────────────

/// Derive the seal/open pair for one endpoint from the shared secret.
///
/// The initiator seals with the i2r key and opens with r2i; the responder
/// the reverse.
pub fn derive_pair(key: &[u8], initiator: bool) -> Result<(Sealer, Opener), Error> {
    if key.len() != SESSION_KEY_BYTES {
        return Err(Error::InvalidKeyLength {
            expected: SESSION_KEY_BYTES,
            actual: key.len(),
        });
    }

    let hk = Hkdf::<Sha256>::new(None, key);
    let mut i2r = [0u8; SESSION_KEY_BYTES];
    let mut r2i = [0u8; SESSION_KEY_BYTES];
    // Infallible for 32-byte outputs, but the contract is a Result.
    hk.expand(INFO_I2R, &mut i2r).map_err(|_| Error::Seal)?;
    hk.expand(INFO_R2I, &mut r2i).map_err(|_| Error::Seal)?;

    let (seal_key, open_key) = if initiator { (&i2r, &r2i) } else { (&r2i, &i2r) };
    let pair = (
        Sealer {
            cipher: ChaCha20Poly1305::new(seal_key.into()),
            next_counter: 0,
        },
        Opener {
            cipher: ChaCha20Poly1305::new(open_key.into()),
            replay: ReplayWindow::new(),
        },
    );

    i2r.zeroize();
    r2i.zeroize();
    Ok(pair)
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

// ─── Sealer ─────────────────────────────────────────────────────────────────

/// Outbound half: monotonic counter nonces for the instance lifetime.
pub struct Sealer {
    cipher: ChaCha20Poly1305,
    next_counter: u64,
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealer")
            .field("next_counter", &self.next_counter)
            .finish()
    }
}

impl Sealer {
    /// Seal a plaintext into `out` (cleared first).
    pub fn seal(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        let counter = self.next_counter;
        let sealed = self
            .cipher
            .encrypt(
                &nonce_for(counter).into(),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| Error::Seal)?;
        self.next_counter = self.next_counter.wrapping_add(1);

        out.clear();
        out.reserve(COUNTER_BYTES + sealed.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(&sealed);
        Ok(())
    }

    /// Counter the next outbound packet will carry.
    pub fn next_counter(&self) -> u64 {
        self.next_counter
    }
}

// ─── Opener ─────────────────────────────────────────────────────────────────

/// Inbound half: authenticates, decrypts, and rejects replays.
pub struct Opener {
    cipher: ChaCha20Poly1305,
    replay: ReplayWindow,
}

impl std::fmt::Debug for Opener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Opener")
            .field("replay", &self.replay)
            .finish()
    }
}

impl Opener {
    /// Open an envelope. `None` on truncation, authentication failure, or
    /// replay; the window only advances on authenticated packets.
    pub fn open(&mut self, datagram: &[u8]) -> Option<Vec<u8>> {
        if datagram.len() < ENVELOPE_OVERHEAD {
            return None;
        }
        let counter = u64::from_be_bytes(datagram[..COUNTER_BYTES].try_into().ok()?);
        if !self.replay.check(counter) {
            return None;
        }
        let plaintext = self
            .cipher
            .decrypt(
                &nonce_for(counter).into(),
                Payload {
                    msg: &datagram[COUNTER_BYTES..],
                    aad: &[],
                },
            )
            .ok()?;
        self.replay.commit(counter);
        Some(plaintext)
    }
}

// ─── Replay Window ──────────────────────────────────────────────────────────

/// Sliding bitmap over the most recent `REPLAY_WINDOW` counters.
#[derive(Debug)]
struct ReplayWindow {
    highest: u64,
    mask: u128,
    primed: bool,
}

impl ReplayWindow {
    fn new() -> Self {
        ReplayWindow {
            highest: 0,
            mask: 0,
            primed: false,
        }
    }

    /// Would this counter be accepted? Does not mutate.
    fn check(&self, counter: u64) -> bool {
        if !self.primed || counter > self.highest {
            return true;
        }
        let behind = self.highest - counter;
        behind < REPLAY_WINDOW && self.mask & (1u128 << behind) == 0
    }

    /// Record an authenticated counter.
    fn commit(&mut self, counter: u64) {
        if !self.primed {
            self.highest = counter;
            self.mask = 1;
            self.primed = true;
            return;
        }
        if counter > self.highest {
            let shift = counter - self.highest;
            self.mask = if shift >= REPLAY_WINDOW {
                1
            } else {
                (self.mask << shift) | 1
            };
            self.highest = counter;
        } else {
            self.mask |= 1u128 << (self.highest - counter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Vec<u8> {
        (0u8..32).collect()
    }

    fn pair() -> ((Sealer, Opener), (Sealer, Opener)) {
        (
            derive_pair(&key(), true).unwrap(),
            derive_pair(&key(), false).unwrap(),
        )
    }

    #[test]
    fn opposite_roles_roundtrip() {
        let ((mut a_seal, _), (_, mut b_open)) = pair();
        let mut wire = Vec::new();
        a_seal.seal(b"hello riptide", &mut wire).unwrap();
        assert_eq!(wire.len(), 13 + ENVELOPE_OVERHEAD);
        let plain = b_open.open(&wire).unwrap();
        assert_eq!(plain, b"hello riptide");
    }

    #[test]
    fn both_directions_roundtrip() {
        let ((mut a_seal, mut a_open), (mut b_seal, mut b_open)) = pair();
        let mut wire = Vec::new();

        a_seal.seal(b"forward", &mut wire).unwrap();
        assert_eq!(b_open.open(&wire).unwrap(), b"forward");

        b_seal.seal(b"reverse", &mut wire).unwrap();
        assert_eq!(a_open.open(&wire).unwrap(), b"reverse");
    }

    #[test]
    fn same_role_always_fails() {
        let (mut a_seal, _) = derive_pair(&key(), true).unwrap();
        let (_, mut b_open) = derive_pair(&key(), true).unwrap();
        let mut wire = Vec::new();
        for i in 0..20u8 {
            a_seal.seal(&[i; 40], &mut wire).unwrap();
            assert!(b_open.open(&wire).is_none(), "packet {i} must not open");
        }
    }

    #[test]
    fn tampered_packet_dropped() {
        let ((mut a_seal, _), (_, mut b_open)) = pair();
        let mut wire = Vec::new();
        a_seal.seal(b"integrity", &mut wire).unwrap();
        for i in 0..wire.len() {
            let mut flipped = wire.clone();
            flipped[i] ^= 0x40;
            assert!(b_open.open(&flipped).is_none(), "flip at {i} must fail auth");
        }
        // The untouched packet still opens.
        assert!(b_open.open(&wire).is_some());
    }

    #[test]
    fn replayed_packet_dropped() {
        let ((mut a_seal, _), (_, mut b_open)) = pair();
        let mut wire = Vec::new();
        a_seal.seal(b"once", &mut wire).unwrap();
        assert!(b_open.open(&wire).is_some());
        assert!(b_open.open(&wire).is_none(), "replay must be dropped");
    }

    #[test]
    fn out_of_order_within_window_accepted() {
        let ((mut a_seal, _), (_, mut b_open)) = pair();
        let packets: Vec<Vec<u8>> = (0..4u8)
            .map(|i| {
                let mut w = Vec::new();
                a_seal.seal(&[i], &mut w).unwrap();
                w
            })
            .collect();

        assert!(b_open.open(&packets[3]).is_some());
        assert!(b_open.open(&packets[1]).is_some());
        assert!(b_open.open(&packets[0]).is_some());
        assert!(b_open.open(&packets[1]).is_none(), "dup must be dropped");
        assert!(b_open.open(&packets[2]).is_some());
    }

    #[test]
    fn long_delayed_packet_dropped() {
        let ((mut a_seal, _), (_, mut b_open)) = pair();
        let mut first = Vec::new();
        a_seal.seal(b"ancient", &mut first).unwrap();

        let mut latest = Vec::new();
        for _ in 0..(REPLAY_WINDOW + 8) {
            a_seal.seal(b"filler", &mut latest).unwrap();
        }
        assert!(b_open.open(&latest).is_some());
        assert!(
            b_open.open(&first).is_none(),
            "packet beyond the replay window must be dropped"
        );
    }

    #[test]
    fn short_datagram_dropped() {
        let ((_, _), (_, mut b_open)) = pair();
        assert!(b_open.open(&[0u8; ENVELOPE_OVERHEAD - 1]).is_none());
        assert!(b_open.open(&[]).is_none());
    }

    #[test]
    fn failed_auth_does_not_advance_window() {
        let ((mut a_seal, _), (_, mut b_open)) = pair();
        let mut wire = Vec::new();
        a_seal.seal(b"real", &mut wire).unwrap();

        // Forge a huge counter; auth fails, and the genuine packet with a
        // small counter must still be accepted afterwards.
        let mut forged = wire.clone();
        forged[..8].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(b_open.open(&forged).is_none());
        assert!(b_open.open(&wire).is_some());
    }

    #[test]
    fn wrong_key_length_rejected() {
        match derive_pair(&[0u8; 16], true) {
            Err(Error::InvalidKeyLength { expected, actual }) => {
                assert_eq!(expected, 32);
                assert_eq!(actual, 16);
            }
            other => panic!("expected InvalidKeyLength, got {other:?}"),
        }
    }

    #[test]
    fn counters_are_monotonic() {
        let (mut seal, _) = derive_pair(&key(), true).unwrap();
        let mut wire = Vec::new();
        for expect in 0..5u64 {
            assert_eq!(seal.next_counter(), expect);
            seal.seal(b"x", &mut wire).unwrap();
            assert_eq!(&wire[..8], &expect.to_be_bytes());
        }
    }
}
