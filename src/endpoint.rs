//! # Endpoint Facade
//!
//! One instance per side of the channel. Owns the cipher contexts, the
//! encoder and decoder engines, the path estimators, and the redundancy
//! planner; dispatches inbound packets and drives timer work from `tick`.
//!
//! The engine is single-threaded and wait-free: every call runs to
//! completion, calling back synchronously through the caller-supplied
//! [`PacketIo`]. Wall-clock acquisition is the caller's business — the
//! time-bearing operations take `now` explicitly, which also makes the
//! whole engine deterministic under test.

use quanta::Instant;
use std::time::Duration;

use crate::cipher::{self, Opener, Sealer, ENVELOPE_OVERHEAD};
use crate::codec::LENGTH_PREFIX_BYTES;
use crate::decoder::Decoder;
use crate::encoder::{Encoder, SWAP_INTERVAL_FACTOR};
use crate::error::Error;
use crate::plan::RedundancyPlanner;
use crate::pool::BufferPool;
use crate::stats::{DelayEstimator, EndpointStats, LossEstimator};
use crate::wire::{
    PongReport, SymbolHeader, APP_OOB_MIN, RESERVED_TAG_MAX, SYMBOL_HEADER_MAX, TAG_ORIGINAL,
    TAG_PONG, TAG_RECOVERY,
};

/// Smallest `max_data_size` that can hold the envelope, a worst-case
/// symbol header, the padding margin, and at least a few payload bytes.
pub const MIN_DATA_SIZE: usize = 64;

/// Buffers retained by the assembly pool.
const POOL_RETAIN: usize = 64;

// ─── Caller Interface ───────────────────────────────────────────────────────

/// The capability trio the caller implements; the engine drives it
/// synchronously.
pub trait PacketIo {
    /// A received or recovered application payload.
    fn on_packet(&mut self, payload: &[u8]);

    /// An application OOB payload; the first byte is the caller's type code.
    fn on_oob(&mut self, payload: &[u8]);

    /// Transmit an already-encrypted datagram over the unreliable channel.
    fn send_datagram(&mut self, datagram: &[u8]);
}

// ─── Settings ───────────────────────────────────────────────────────────────

/// Endpoint configuration. Peers MUST pick opposite `initiator` roles.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Selects the key-schedule half this endpoint seals with.
    pub initiator: bool,
    /// Residual per-packet loss the redundancy planner aims for.
    pub target_loss: f64,
    /// Floor applied to the measured loss before planning, so redundancy
    /// never collapses during a quiet window.
    pub min_loss: f64,
    /// Clamp on the smoothed delay estimate.
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Ceiling on outbound datagram size after encryption.
    pub max_data_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            initiator: true,
            target_loss: 1e-4,
            min_loss: 0.03,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2000),
            max_data_size: 1350,
        }
    }
}

impl Settings {
    fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.min_loss) || !self.min_loss.is_finite() {
            return Err(Error::InvalidLossFloor(self.min_loss));
        }
        if !(self.target_loss > 0.0 && self.target_loss < 1.0) {
            return Err(Error::InvalidTargetLoss(self.target_loss));
        }
        if self.min_delay > self.max_delay {
            return Err(Error::DelayClampInverted {
                min: self.min_delay,
                max: self.max_delay,
            });
        }
        if self.max_data_size < MIN_DATA_SIZE {
            return Err(Error::DatagramSizeTooSmall {
                min: MIN_DATA_SIZE,
                actual: self.max_data_size,
            });
        }
        Ok(())
    }
}

// ─── Endpoint ───────────────────────────────────────────────────────────────

/// One side of the loss-hardened channel.
pub struct Endpoint<I: PacketIo> {
    io: I,
    settings: Settings,
    sealer: Sealer,
    opener: Opener,
    encoder: Encoder,
    decoder: Decoder,
    planner: RedundancyPlanner,
    loss: LossEstimator,
    delay: DelayEstimator,
    pool: BufferPool,
    stats: EndpointStats,
    /// Plaintext packets staged between engine and sealing.
    outbox: Vec<Vec<u8>>,
    /// Reused ciphertext scratch.
    seal_buf: Vec<u8>,
}

impl<I: PacketIo> Endpoint<I> {
    /// Initialize an endpoint from the shared secret and settings.
    ///
    /// Fails on invalid clamps, an undersized `max_data_size`, or a key of
    /// the wrong length. The two peers must disagree on `initiator`.
    pub fn new(key: &[u8], settings: Settings, io: I) -> Result<Self, Error> {
        settings.validate()?;
        let (sealer, opener) = cipher::derive_pair(key, settings.initiator)?;
        let delay = DelayEstimator::new(settings.min_delay, settings.max_delay);
        let initial_interval = delay.clamped().mul_f64(SWAP_INTERVAL_FACTOR);

        tracing::debug!(
            initiator = settings.initiator,
            target_loss = settings.target_loss,
            max_data_size = settings.max_data_size,
            "endpoint initialized"
        );

        Ok(Endpoint {
            io,
            encoder: Encoder::new(settings.target_loss, initial_interval),
            decoder: Decoder::new(),
            planner: RedundancyPlanner::new(),
            loss: LossEstimator::new(settings.min_loss),
            delay,
            pool: BufferPool::new(POOL_RETAIN),
            stats: EndpointStats::default(),
            outbox: Vec::new(),
            seal_buf: Vec::new(),
            sealer,
            opener,
            settings,
        })
    }

    /// Largest payload `send` accepts: datagram ceiling minus envelope,
    /// worst-case symbol header, and the padding margin that keeps the
    /// group's recovery symbols inside the same ceiling.
    pub fn max_payload_len(&self) -> usize {
        self.settings.max_data_size - ENVELOPE_OVERHEAD - SYMBOL_HEADER_MAX - LENGTH_PREFIX_BYTES
    }

    /// Queue one datagram payload: appended to the current code group and
    /// emitted immediately as an original symbol.
    pub fn send(&mut self, payload: &[u8], now: Instant) -> Result<(), Error> {
        let max = self.max_payload_len();
        if payload.len() > max {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        self.encoder.push(
            payload,
            now,
            &self.planner,
            &mut self.pool,
            &mut self.outbox,
            &mut self.stats,
        );
        self.flush_outbox()
    }

    /// Send an application OOB packet. The first byte is the caller's type
    /// code and must stay outside the engine-reserved range.
    pub fn send_oob(&mut self, payload: &[u8]) -> Result<(), Error> {
        let Some(&type_code) = payload.first() else {
            return Err(Error::EmptyOob);
        };
        if type_code < APP_OOB_MIN {
            return Err(Error::ReservedOobType(type_code));
        }
        let max = self.settings.max_data_size - ENVELOPE_OVERHEAD;
        if payload.len() > max {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        self.seal_and_transmit_slice(payload)?;
        self.stats.oob_sent += 1;
        Ok(())
    }

    /// Feed one inbound datagram from the transport. Undecryptable,
    /// replayed, and malformed packets are dropped silently.
    pub fn recv(&mut self, datagram: &[u8], now: Instant) {
        self.stats.datagrams_received += 1;
        let Some(plaintext) = self.opener.open(datagram) else {
            self.stats.auth_failures += 1;
            tracing::trace!(len = datagram.len(), "dropped unauthenticated datagram");
            return;
        };
        let Some(&tag) = plaintext.first() else {
            self.stats.malformed += 1;
            return;
        };

        match tag {
            TAG_ORIGINAL | TAG_RECOVERY => {
                let mut cursor = plaintext.as_slice();
                let Some(header) = SymbolHeader::decode(&mut cursor) else {
                    self.stats.malformed += 1;
                    return;
                };
                let arrival = self.decoder.on_symbol(&header, cursor, &mut self.stats);
                if arrival.deliver_now {
                    self.io.on_packet(cursor);
                }
                for (_, recovered) in &arrival.recovered {
                    self.io.on_packet(recovered);
                }
            }
            TAG_PONG => {
                let Some(pong) = PongReport::decode(&mut plaintext.as_slice()) else {
                    self.stats.malformed += 1;
                    return;
                };
                self.on_pong(pong, now);
            }
            t if t <= RESERVED_TAG_MAX => {
                // Reserved range from the remote: not ours, not the app's.
                self.stats.malformed += 1;
            }
            _ => {
                self.stats.oob_received += 1;
                self.io.on_oob(&plaintext);
            }
        }
    }

    /// Drive timer-based work. Intended cadence 10–20 ms; irregular ticks
    /// only delay swaps and pongs, never break them.
    pub fn tick(&mut self, now: Instant) {
        self.encoder
            .set_swap_interval(self.delay.clamped().mul_f64(SWAP_INTERVAL_FACTOR));
        self.encoder.set_loss(self.loss.estimate());
        self.encoder.tick(
            now,
            &self.planner,
            &mut self.pool,
            &mut self.outbox,
            &mut self.stats,
        );
        if let Err(err) = self.flush_outbox() {
            tracing::debug!(%err, "dropped outbound packets at seal");
        }

        if let Some(mut pong) = self.decoder.take_pong() {
            pong.rtt_ms = self.delay.delay_ms();
            let mut frame = self.pool.take(16);
            pong.encode(&mut frame);
            let sent = self.seal_and_transmit_slice(&frame);
            self.pool.give(frame);
            if sent.is_ok() {
                self.stats.pongs_sent += 1;
            }
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    /// Forward-path loss estimate (the remote receiver's view), floored at
    /// `min_loss`.
    pub fn loss_estimate(&self) -> f64 {
        self.loss.estimate()
    }

    /// Clamped smoothed one-way delay.
    pub fn delay(&self) -> Duration {
        self.delay.clamped()
    }

    /// Current group swap interval.
    pub fn swap_interval(&self) -> Duration {
        self.encoder.swap_interval()
    }

    /// Id of the group currently accepting originals.
    pub fn current_group(&self) -> u8 {
        self.encoder.current_group()
    }

    pub fn io(&self) -> &I {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut I {
        &mut self.io
    }

    /// Tear down, returning the interface.
    pub fn into_io(self) -> I {
        self.io
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn on_pong(&mut self, pong: PongReport, now: Instant) {
        self.stats.pongs_received += 1;
        if pong.count > 0 {
            self.loss.record(pong.seen as u64, pong.count as u64);
        }
        if let Some(stamp) = self.encoder.take_stamp(pong.group) {
            let rtt = now.saturating_duration_since(stamp);
            self.delay.record_rtt(rtt);
            self.stats.last_rtt_ms = rtt.as_millis() as u32;
            tracing::trace!(
                group = pong.group,
                rtt_ms = self.stats.last_rtt_ms,
                remote_seen = pong.seen,
                remote_count = pong.count,
                "pong applied"
            );
        }
    }

    /// Seal and transmit everything staged in the outbox, returning the
    /// plaintext buffers to the pool.
    fn flush_outbox(&mut self) -> Result<(), Error> {
        let mut result = Ok(());
        for pkt in std::mem::take(&mut self.outbox) {
            if result.is_ok() {
                result = self.sealer.seal(&pkt, &mut self.seal_buf).map(|()| {
                    self.io.send_datagram(&self.seal_buf);
                    self.stats.datagrams_sent += 1;
                });
            }
            self.pool.give(pkt);
        }
        result
    }

    fn seal_and_transmit_slice(&mut self, plaintext: &[u8]) -> Result<(), Error> {
        self.sealer.seal(plaintext, &mut self.seal_buf)?;
        self.io.send_datagram(&self.seal_buf);
        self.stats.datagrams_sent += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Collects everything the engine pushes outward.
    #[derive(Default)]
    struct TestIo {
        sent: Vec<Vec<u8>>,
        delivered: Vec<Vec<u8>>,
        oob: Vec<Vec<u8>>,
    }

    impl PacketIo for TestIo {
        fn on_packet(&mut self, payload: &[u8]) {
            self.delivered.push(payload.to_vec());
        }
        fn on_oob(&mut self, payload: &[u8]) {
            self.oob.push(payload.to_vec());
        }
        fn send_datagram(&mut self, datagram: &[u8]) {
            self.sent.push(datagram.to_vec());
        }
    }

    fn key() -> Vec<u8> {
        (100u8..132).collect()
    }

    fn endpoint(initiator: bool) -> Endpoint<TestIo> {
        Endpoint::new(
            &key(),
            Settings {
                initiator,
                ..Settings::default()
            },
            TestIo::default(),
        )
        .unwrap()
    }

    fn shuttle(from: &mut Endpoint<TestIo>, to: &mut Endpoint<TestIo>, now: Instant) {
        let datagrams = std::mem::take(&mut from.io_mut().sent);
        for d in datagrams {
            to.recv(&d, now);
        }
    }

    // ─── Configuration ──────────────────────────────────────────────────

    #[test]
    fn rejects_bad_settings() {
        let bad_floor = Settings {
            min_loss: 1.5,
            ..Settings::default()
        };
        assert!(matches!(
            Endpoint::new(&key(), bad_floor, TestIo::default()),
            Err(Error::InvalidLossFloor(_))
        ));

        let bad_clamp = Settings {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(100),
            ..Settings::default()
        };
        assert!(matches!(
            Endpoint::new(&key(), bad_clamp, TestIo::default()),
            Err(Error::DelayClampInverted { .. })
        ));

        let bad_size = Settings {
            max_data_size: 32,
            ..Settings::default()
        };
        assert!(matches!(
            Endpoint::new(&key(), bad_size, TestIo::default()),
            Err(Error::DatagramSizeTooSmall { .. })
        ));

        assert!(matches!(
            Endpoint::new(&[0u8; 7], Settings::default(), TestIo::default()),
            Err(Error::InvalidKeyLength { .. })
        ));
    }

    // ─── Send bounds ────────────────────────────────────────────────────

    #[test]
    fn send_at_limit_succeeds_one_more_fails() {
        let mut ep = endpoint(true);
        let now = Instant::now();
        let max = ep.max_payload_len();

        ep.send(&vec![0xAA; max], now).unwrap();
        assert_eq!(ep.io().sent.len(), 1);
        assert!(
            ep.io().sent[0].len() <= ep.settings.max_data_size,
            "sealed datagram must respect max_data_size"
        );

        match ep.send(&vec![0xAA; max + 1], now) {
            Err(Error::PayloadTooLarge { len, max: m }) => {
                assert_eq!(len, max + 1);
                assert_eq!(m, max);
            }
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
        assert_eq!(ep.io().sent.len(), 1, "failed send must not transmit");
    }

    #[test]
    fn oob_validates_type_byte() {
        let mut ep = endpoint(true);
        assert!(matches!(ep.send_oob(&[]), Err(Error::EmptyOob)));
        assert!(matches!(
            ep.send_oob(&[0x02, 1, 2]),
            Err(Error::ReservedOobType(0x02))
        ));
        ep.send_oob(&[APP_OOB_MIN, 1, 2, 3]).unwrap();
        assert_eq!(ep.stats().oob_sent, 1);
    }

    // ─── Loopback pair ──────────────────────────────────────────────────

    #[test]
    fn paired_endpoints_deliver_payloads() {
        let mut a = endpoint(true);
        let mut b = endpoint(false);
        let now = Instant::now();

        for i in 0..20u8 {
            a.send(&[i; 50], now).unwrap();
        }
        shuttle(&mut a, &mut b, now);

        assert_eq!(b.io().delivered.len(), 20);
        for (i, payload) in b.io().delivered.iter().enumerate() {
            assert_eq!(payload, &vec![i as u8; 50]);
        }
        assert_eq!(b.stats().originals_received, 20);
        assert_eq!(b.stats().auth_failures, 0);
    }

    #[test]
    fn oob_roundtrip_between_peers() {
        let mut a = endpoint(true);
        let mut b = endpoint(false);
        let now = Instant::now();

        a.send_oob(&[0x42, 9, 9, 9]).unwrap();
        shuttle(&mut a, &mut b, now);

        assert_eq!(b.io().oob.len(), 1);
        assert_eq!(b.io().oob[0], vec![0x42, 9, 9, 9]);
        assert!(b.io().delivered.is_empty());
    }

    #[test]
    fn same_role_peers_fail_authentication() {
        let mut a = endpoint(true);
        let mut b = endpoint(true);
        let now = Instant::now();

        for i in 0..10u8 {
            a.send(&[i; 30], now).unwrap();
        }
        shuttle(&mut a, &mut b, now);

        assert!(b.io().delivered.is_empty());
        assert_eq!(b.stats().auth_failures, 10);
        assert_eq!(b.stats().originals_received, 0);
    }

    #[test]
    fn corrupted_datagram_produces_no_callbacks() {
        let mut a = endpoint(true);
        let mut b = endpoint(false);
        let now = Instant::now();

        a.send(b"sensitive", now).unwrap();
        let mut datagram = a.io_mut().sent.pop().unwrap();
        datagram[12] ^= 0x01;
        b.recv(&datagram, now);

        assert!(b.io().delivered.is_empty());
        assert!(b.io().oob.is_empty());
        assert_eq!(b.stats().auth_failures, 1);
        // A subsequent pong-bearing tick reports nothing: no state changed.
        b.tick(now);
        assert!(b.io().sent.is_empty());
    }

    #[test]
    fn pong_flows_back_and_updates_estimators() {
        let mut a = endpoint(true);
        let mut b = endpoint(false);
        let epoch = Instant::now();
        let at = |ms: u64| epoch + Duration::from_millis(ms);

        // Two group windows of traffic so B closes a group.
        for burst in 0..30u64 {
            let t = burst * 10;
            for i in 0..4u8 {
                a.send(&[i; 100], at(t)).unwrap();
            }
            a.tick(at(t));
            shuttle(&mut a, &mut b, at(t));
            b.tick(at(t));
            shuttle(&mut b, &mut a, at(t));
        }

        assert!(a.stats().groups_closed > 0, "groups should have closed");
        assert!(b.stats().pongs_sent > 0, "receiver should pong");
        assert_eq!(a.stats().pongs_received, b.stats().pongs_sent);
        assert!(
            a.loss.samples() > 0,
            "pong statistics should feed the loss window"
        );
    }

    #[test]
    fn recovery_repairs_dropped_datagram() {
        let mut a = endpoint(true);
        let mut b = endpoint(false);
        let epoch = Instant::now();
        let at = |ms: u64| epoch + Duration::from_millis(ms);

        // Fill one group, dropping one original on the way.
        for i in 0..8u8 {
            a.send(&[i; 64], at(i as u64)).unwrap();
        }
        let datagrams = std::mem::take(&mut a.io_mut().sent);
        for (i, d) in datagrams.iter().enumerate() {
            if i != 3 {
                b.recv(d, at(10));
            }
        }
        assert_eq!(b.io().delivered.len(), 7);

        // Close the group and drain its recovery through the next window.
        for t in (100..400).step_by(10) {
            a.tick(at(t));
            shuttle(&mut a, &mut b, at(t));
        }

        assert!(
            b.stats().recovered_delivered >= 1,
            "missing original must be reconstructed"
        );
        let recovered = b
            .io()
            .delivered
            .iter()
            .any(|p| p == &vec![3u8; 64]);
        assert!(recovered, "payload 3 must be delivered via decode");
    }
}
