//! # Encoder — Sender Group Engine
//!
//! Pure logic, no I/O. Cuts the outbound stream into code groups, emits
//! originals immediately, and generates recovery symbols at group close
//! which then trickle out across the next group's window.
//!
//! ## Group swap rule
//!
//! A group closes when wall-clock time since its first original reaches the
//! swap interval (checked from both `push` and `tick`), or when it reaches
//! the symbol-count ceiling. Empty groups never close: an idle sender emits
//! nothing, and on resume continues in the successor of its last group.
//!
//! ## Recovery pacing
//!
//! The `r` recovery packets of a just-closed group are pre-built inline and
//! scheduled at `swap_interval / r` spacings so transmit bandwidth stays
//! smooth. If a further group closes while recovery is still draining, the
//! remainder is dropped — latency is protected at the cost of residual
//! loss.

use bytes::Bytes;
use quanta::Instant;
use std::collections::VecDeque;
use std::time::Duration;

use crate::codec::{self, GROUP_ORIGINAL_LIMIT, LENGTH_PREFIX_BYTES};
use crate::plan::RedundancyPlanner;
use crate::pool::BufferPool;
use crate::stats::EndpointStats;
use crate::wire::{SymbolHeader, SymbolKind, SYMBOL_HEADER_MAX};

/// Proportionality constant between the clamped delay estimate and the
/// group swap interval. Unity keeps a group's recovery inside roughly one
/// delay of its originals, which holds decode latency near the path delay
/// while leaving groups long enough for the code to be efficient.
pub const SWAP_INTERVAL_FACTOR: f64 = 1.0;

/// Sender-side group engine.
pub struct Encoder {
    /// Id of the group currently accepting originals.
    code_group: u8,
    /// Raw payloads of the current group, in send order.
    originals: Vec<Bytes>,
    /// When the current group received its first original.
    open_at: Option<Instant>,
    /// Close times per group id, for pong RTT matching.
    stamps: [Option<Instant>; 256],
    /// Current swap interval, refreshed by the endpoint from the delay
    /// estimate.
    swap_interval: Duration,
    /// Forward-path loss estimate the planner consumes, refreshed from
    /// remote pongs.
    loss: f64,
    target_loss: f64,
    /// Pre-built recovery packets of the previously closed group.
    pending_recovery: VecDeque<Vec<u8>>,
    recovery_step: Duration,
    next_recovery_at: Option<Instant>,
}

impl Encoder {
    pub fn new(target_loss: f64, initial_interval: Duration) -> Self {
        Encoder {
            code_group: 0,
            originals: Vec::new(),
            open_at: None,
            stamps: [None; 256],
            swap_interval: initial_interval,
            loss: 0.0,
            target_loss,
            pending_recovery: VecDeque::new(),
            recovery_step: initial_interval,
            next_recovery_at: None,
        }
    }

    /// Refresh the swap interval from the clamped delay estimate.
    pub fn set_swap_interval(&mut self, interval: Duration) {
        self.swap_interval = interval;
    }

    /// Refresh the loss estimate used at the next group close.
    pub fn set_loss(&mut self, loss: f64) {
        self.loss = loss;
    }

    pub fn swap_interval(&self) -> Duration {
        self.swap_interval
    }

    pub fn current_group(&self) -> u8 {
        self.code_group
    }

    /// Consume the close stamp for a group, if still held. Consuming
    /// prevents a late or repeated pong from matching a reused id.
    pub fn take_stamp(&mut self, group: u8) -> Option<Instant> {
        self.stamps[group as usize].take()
    }

    /// Append one original to the current group and emit its packet.
    ///
    /// The built plaintext packets (the original, plus any recovery of a
    /// group this call closed) are pushed to `out` for sealing.
    pub fn push(
        &mut self,
        payload: &[u8],
        now: Instant,
        planner: &RedundancyPlanner,
        pool: &mut BufferPool,
        out: &mut Vec<Vec<u8>>,
        stats: &mut EndpointStats,
    ) {
        if self.originals.len() >= GROUP_ORIGINAL_LIMIT || self.swap_due(now) {
            self.close_group(now, planner, pool, stats);
        }
        if self.open_at.is_none() {
            self.open_at = Some(now);
        }

        let symbol_id = self.originals.len() as u16;
        let header = SymbolHeader {
            kind: SymbolKind::Original,
            group: self.code_group,
            symbol_id,
            original_count: symbol_id + 1,
            recovery_count: 0,
        };
        let mut pkt = pool.take(SYMBOL_HEADER_MAX + payload.len());
        header.encode(&mut pkt);
        pkt.extend_from_slice(payload);
        out.push(pkt);

        self.originals.push(Bytes::copy_from_slice(payload));
        stats.originals_sent += 1;
        stats.bytes_sent += payload.len() as u64;
    }

    /// Drive timer-based decisions: group swap and due recovery emissions.
    pub fn tick(
        &mut self,
        now: Instant,
        planner: &RedundancyPlanner,
        pool: &mut BufferPool,
        out: &mut Vec<Vec<u8>>,
        stats: &mut EndpointStats,
    ) {
        if self.swap_due(now) {
            self.close_group(now, planner, pool, stats);
        }

        while let Some(at) = self.next_recovery_at {
            if self.pending_recovery.is_empty() {
                self.next_recovery_at = None;
                break;
            }
            if at > now {
                break;
            }
            if let Some(pkt) = self.pending_recovery.pop_front() {
                out.push(pkt);
                stats.recovery_sent += 1;
            }
            self.next_recovery_at = Some(at + self.recovery_step);
        }
    }

    fn swap_due(&self, now: Instant) -> bool {
        match self.open_at {
            Some(open) => now.saturating_duration_since(open) >= self.swap_interval,
            None => false,
        }
    }

    /// Close the current group: pick the recovery budget, pre-build the
    /// recovery packets, stamp the close time, advance the group id.
    fn close_group(
        &mut self,
        now: Instant,
        planner: &RedundancyPlanner,
        pool: &mut BufferPool,
        stats: &mut EndpointStats,
    ) {
        let k = self.originals.len();
        if k == 0 {
            return;
        }

        // Older recovery that has not drained is abandoned.
        if !self.pending_recovery.is_empty() {
            stats.recovery_dropped += self.pending_recovery.len() as u64;
            for pkt in self.pending_recovery.drain(..) {
                pool.give(pkt);
            }
        }

        let r = planner.recovery_count(self.loss, k, self.target_loss);
        stats.recovery_planned_last = r as u32;

        if r > 0 {
            let padded_len = self
                .originals
                .iter()
                .map(Bytes::len)
                .max()
                .unwrap_or(0)
                + LENGTH_PREFIX_BYTES;
            let padded: Vec<Vec<u8>> = self
                .originals
                .iter()
                .map(|p| {
                    let mut buf = pool.take(padded_len);
                    codec::write_padded(p, padded_len, &mut buf);
                    buf
                })
                .collect();

            for j in 0..r {
                let header = SymbolHeader {
                    kind: SymbolKind::Recovery,
                    group: self.code_group,
                    symbol_id: (k + j) as u16,
                    original_count: k as u16,
                    recovery_count: r as u16,
                };
                let mut pkt = pool.take(SYMBOL_HEADER_MAX + padded_len);
                header.encode(&mut pkt);
                let body = pkt.len();
                pkt.resize(body + padded_len, 0);
                codec::encode_recovery_symbol(&padded, j, &mut pkt[body..]);
                self.pending_recovery.push_back(pkt);
            }
            for buf in padded {
                pool.give(buf);
            }

            self.recovery_step = self
                .swap_interval
                .checked_div(r as u32)
                .unwrap_or(self.swap_interval)
                .max(Duration::from_millis(1));
            self.next_recovery_at = Some(now + self.recovery_step);
        } else {
            self.next_recovery_at = None;
        }

        tracing::trace!(
            group = self.code_group,
            originals = k,
            recovery = r,
            "code group closed"
        );

        self.stamps[self.code_group as usize] = Some(now);
        self.code_group = self.code_group.wrapping_add(1);
        self.originals.clear();
        self.open_at = None;
        stats.groups_closed += 1;
    }

    /// Recovery packets still waiting for their pacing slot.
    pub fn pending_recovery(&self) -> usize {
        self.pending_recovery.len()
    }

    /// Originals accumulated in the current group.
    pub fn group_fill(&self) -> usize {
        self.originals.len()
    }
}
