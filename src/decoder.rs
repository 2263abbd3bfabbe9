//! # Decoder — Receiver Group Ring
//!
//! Pure logic, no I/O. Reassembles code groups from authenticated symbols,
//! delivers originals the moment they arrive, runs the erasure decoder when
//! a lossy group becomes solvable, and accumulates the per-group loss
//! statistics the pong sub-protocol reports back to the sender.
//!
//! Groups live in a ring of 256 slots indexed by their wrapping 8-bit id.
//! A received id is classified against the largest-seen cursor by signed
//! 8-bit distance: ahead advances the cursor (resetting the slots it passes
//! over), behind within the window is a late-but-welcome symbol, and ids
//! that alias further back are stale. Direct inequality on group ids is
//! never meaningful; all comparisons go through the wrapping distance.
//!
//! A group closes when its authoritative original count is satisfied
//! (directly or by decode), or when the cursor has advanced `SETTLE_LAG`
//! groups past it — by then the sender has drained the group's paced
//! recovery through one full window, with another window of network slack
//! on top.

use bytes::Bytes;

use crate::codec::{self, GROUP_ORIGINAL_LIMIT, LENGTH_PREFIX_BYTES};
use crate::stats::EndpointStats;
use crate::wire::{PongReport, SymbolHeader, SymbolKind};

/// Cursor lag at which an unfinished group is settled.
const GROUP_SETTLE_LAG: u8 = 3;

// ─── Group Slot ─────────────────────────────────────────────────────────────

/// Authoritative group parameters, learned from the first recovery symbol.
#[derive(Debug, Clone, Copy)]
struct FinalParams {
    original_count: u16,
    recovery_count: u16,
    padded_len: usize,
}

/// Bitmap over the 255-symbol id space of one group.
#[derive(Debug, Clone, Copy, Default)]
struct SymbolSet([u64; 4]);

impl SymbolSet {
    fn contains(&self, id: u16) -> bool {
        self.0[(id / 64) as usize] & (1 << (id % 64)) != 0
    }

    fn insert(&mut self, id: u16) {
        self.0[(id / 64) as usize] |= 1 << (id % 64);
    }
}

/// One ring slot: the receive state of a single code group.
#[derive(Debug, Default)]
struct GroupSlot {
    id: u8,
    open: bool,
    done: bool,
    /// Running original count: the largest claim seen from original
    /// symbols. Authoritative only once `params` is known.
    expected: u16,
    params: Option<FinalParams>,
    received: SymbolSet,
    originals_seen: u16,
    received_total: u16,
    /// Held for a potential decode; freed as soon as the group closes.
    originals: Vec<(u16, Bytes)>,
    recovery: Vec<(u16, Bytes)>,
}

impl GroupSlot {
    fn fresh(id: u8) -> Self {
        GroupSlot {
            id,
            open: true,
            ..Default::default()
        }
    }
}

// ─── Arrival Outcome ────────────────────────────────────────────────────────

/// What a processed symbol yields for upward delivery.
#[derive(Debug, Default)]
pub struct SymbolArrival {
    /// The symbol's own payload is a fresh original: deliver it now.
    pub deliver_now: bool,
    /// Originals reconstructed by the erasure decoder, ascending id,
    /// already de-padded.
    pub recovered: Vec<(u16, Vec<u8>)>,
}

// ─── Decoder ────────────────────────────────────────────────────────────────

/// Receiver-side group ring.
pub struct Decoder {
    slots: Vec<GroupSlot>,
    cursor: u8,
    started: bool,
    /// Group the next pong acknowledges for RTT matching: the most recently
    /// superseded or completed group, whose close stamp on the sender is
    /// roughly one path delay old when the pong goes out.
    ack_group: u8,
    /// Pong accumulation since the last report.
    seen_accum: u64,
    count_accum: u64,
    closed_since_pong: u32,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            slots: (0..=255u8).map(|_| GroupSlot::default()).collect(),
            cursor: 0,
            started: false,
            ack_group: 0,
            seen_accum: 0,
            count_accum: 0,
            closed_since_pong: 0,
        }
    }

    /// Largest group id observed.
    pub fn cursor(&self) -> u8 {
        self.cursor
    }

    /// Process one authenticated data symbol.
    pub fn on_symbol(
        &mut self,
        header: &SymbolHeader,
        payload: &[u8],
        stats: &mut EndpointStats,
    ) -> SymbolArrival {
        let group = header.group;

        if !self.started {
            self.started = true;
            self.cursor = group;
            self.slots[group as usize] = GroupSlot::fresh(group);
        } else {
            let distance = group.wrapping_sub(self.cursor) as i8;
            if distance > 0 {
                self.advance_cursor(group, stats);
            } else {
                let slot = &self.slots[group as usize];
                if !slot.open || slot.id != group {
                    stats.stale_symbols += 1;
                    return SymbolArrival::default();
                }
                if slot.done {
                    stats.late_symbols += 1;
                    return SymbolArrival::default();
                }
            }
        }

        match header.kind {
            SymbolKind::Original => self.on_original(header, payload, stats),
            SymbolKind::Recovery => self.on_recovery(header, payload, stats),
        }
    }

    /// Take the pending pong report, if any group closed since the last
    /// one. The caller fills in its local delay estimate.
    pub fn take_pong(&mut self) -> Option<PongReport> {
        if self.closed_since_pong == 0 {
            return None;
        }
        let report = PongReport {
            group: self.ack_group,
            seen: self.seen_accum.min(u32::MAX as u64) as u32,
            count: self.count_accum.min(u32::MAX as u64) as u32,
            rtt_ms: 0,
        };
        self.seen_accum = 0;
        self.count_accum = 0;
        self.closed_since_pong = 0;
        Some(report)
    }

    // ─── Cursor ─────────────────────────────────────────────────────────

    /// Move the cursor forward to `group`, resetting every slot it enters,
    /// then settle the groups the new cursor has left too far behind.
    fn advance_cursor(&mut self, group: u8, stats: &mut EndpointStats) {
        let mut g = self.cursor;
        loop {
            g = g.wrapping_add(1);
            self.slots[g as usize] = GroupSlot::fresh(g);
            if g == group {
                break;
            }
        }
        self.cursor = group;
        // The group whose window just ended is what the next pong should
        // acknowledge; its close stamp at the sender is one delay old.
        self.ack_group = group.wrapping_sub(1);

        for idx in 0..self.slots.len() {
            let slot = &self.slots[idx];
            if !slot.open || slot.done {
                continue;
            }
            let lag = self.cursor.wrapping_sub(slot.id);
            if lag >= GROUP_SETTLE_LAG {
                self.close_slot(idx, stats);
            }
        }
    }

    // ─── Symbol Paths ───────────────────────────────────────────────────

    fn on_original(
        &mut self,
        header: &SymbolHeader,
        payload: &[u8],
        stats: &mut EndpointStats,
    ) -> SymbolArrival {
        let idx = header.group as usize;
        let id = header.symbol_id;

        if id as usize >= GROUP_ORIGINAL_LIMIT {
            stats.malformed += 1;
            return SymbolArrival::default();
        }
        if let Some(params) = self.slots[idx].params {
            if id >= params.original_count
                || payload.len() + LENGTH_PREFIX_BYTES > params.padded_len
            {
                // The symbol contradicts the group's recovery parameters;
                // poison-proof the group but keep the authenticated payload.
                stats.malformed += 1;
                self.close_slot(idx, stats);
                return SymbolArrival {
                    deliver_now: true,
                    recovered: Vec::new(),
                };
            }
        }
        if self.slots[idx].received.contains(id) {
            stats.duplicates += 1;
            return SymbolArrival::default();
        }

        {
            let slot = &mut self.slots[idx];
            slot.received.insert(id);
            slot.originals_seen += 1;
            slot.received_total += 1;
            slot.expected = slot.expected.max(header.original_count).max(id + 1);
            slot.originals.push((id, Bytes::copy_from_slice(payload)));
        }
        stats.originals_received += 1;

        let recovered = self.check_completion(idx, stats);
        SymbolArrival {
            deliver_now: true,
            recovered,
        }
    }

    fn on_recovery(
        &mut self,
        header: &SymbolHeader,
        payload: &[u8],
        stats: &mut EndpointStats,
    ) -> SymbolArrival {
        let idx = header.group as usize;
        let k = header.original_count;
        let r = header.recovery_count;

        let shape_ok = k >= 1
            && k as usize <= GROUP_ORIGINAL_LIMIT
            && r >= 1
            && (k + r) as usize <= 255
            && header.symbol_id >= k
            && header.symbol_id < k + r
            && payload.len() >= LENGTH_PREFIX_BYTES;
        if !shape_ok {
            stats.malformed += 1;
            self.close_slot(idx, stats);
            return SymbolArrival::default();
        }

        match self.slots[idx].params {
            None => {
                // First recovery symbol fixes the group parameters; they
                // must not contradict what the originals already claimed.
                let slot = &mut self.slots[idx];
                if slot.expected > k
                    || slot
                        .originals
                        .iter()
                        .any(|(_, p)| p.len() + LENGTH_PREFIX_BYTES > payload.len())
                {
                    stats.malformed += 1;
                    self.close_slot(idx, stats);
                    return SymbolArrival::default();
                }
                slot.params = Some(FinalParams {
                    original_count: k,
                    recovery_count: r,
                    padded_len: payload.len(),
                });
                slot.expected = k;
            }
            Some(params) => {
                if params.original_count != k
                    || params.recovery_count != r
                    || params.padded_len != payload.len()
                {
                    stats.malformed += 1;
                    self.close_slot(idx, stats);
                    return SymbolArrival::default();
                }
            }
        }

        if self.slots[idx].received.contains(header.symbol_id) {
            stats.duplicates += 1;
            return SymbolArrival::default();
        }

        {
            let slot = &mut self.slots[idx];
            slot.received.insert(header.symbol_id);
            slot.received_total += 1;
            slot.recovery
                .push((header.symbol_id, Bytes::copy_from_slice(payload)));
        }
        stats.recovery_received += 1;

        let recovered = self.check_completion(idx, stats);
        SymbolArrival {
            deliver_now: false,
            recovered,
        }
    }

    // ─── Completion & Decode ────────────────────────────────────────────

    /// Close the group if it is complete, or decode it if it just became
    /// solvable. Returns reconstructed originals ready for delivery.
    fn check_completion(&mut self, idx: usize, stats: &mut EndpointStats) -> Vec<(u16, Vec<u8>)> {
        let Some(params) = self.slots[idx].params else {
            return Vec::new();
        };
        if self.slots[idx].originals_seen >= params.original_count {
            self.close_slot(idx, stats);
            self.ack_group = idx as u8;
            return Vec::new();
        }
        if self.slots[idx].received_total >= params.original_count {
            let recovered = self.decode_group(idx, params, stats);
            self.ack_group = idx as u8;
            return recovered;
        }
        Vec::new()
    }

    fn decode_group(
        &mut self,
        idx: usize,
        params: FinalParams,
        stats: &mut EndpointStats,
    ) -> Vec<(u16, Vec<u8>)> {
        let k = params.original_count;
        let result = {
            let slot = &self.slots[idx];
            let present: Vec<(usize, &[u8])> = slot
                .originals
                .iter()
                .map(|(id, p)| (*id as usize, p.as_ref()))
                .collect();
            let recovery: Vec<(usize, &[u8])> = slot
                .recovery
                .iter()
                .map(|(sid, p)| ((sid - k) as usize, p.as_ref()))
                .collect();
            codec::recover_missing(k as usize, params.padded_len, &present, &recovery)
        };

        let mut delivered = Vec::new();
        match result {
            Ok(reconstructed) => {
                for (id, padded) in reconstructed {
                    match codec::unpad(&padded) {
                        Some(data) => delivered.push((id as u16, data.to_vec())),
                        None => {
                            stats.malformed += 1;
                        }
                    }
                }
                stats.recovered_delivered += delivered.len() as u64;
                tracing::debug!(
                    group = self.slots[idx].id,
                    recovered = delivered.len(),
                    "erasure decode recovered missing originals"
                );
            }
            Err(err) => {
                stats.decode_failures += 1;
                tracing::debug!(group = self.slots[idx].id, %err, "erasure decode declined");
            }
        }
        // Solvable or not, this group is finished: recovered originals are
        // delivered, anything still missing is permanently lost.
        self.close_slot(idx, stats);
        delivered
    }

    /// Close a group: finalize its loss-statistics contribution exactly
    /// once and release its held symbols.
    fn close_slot(&mut self, idx: usize, _stats: &mut EndpointStats) {
        let slot = &mut self.slots[idx];
        if !slot.open || slot.done {
            return;
        }
        let count = slot
            .params
            .map(|p| p.original_count as u64)
            .unwrap_or(slot.expected as u64);
        if count > 0 {
            self.seen_accum += (slot.originals_seen as u64).min(count);
            self.count_accum += count;
            self.closed_since_pong += 1;
        }
        slot.done = true;
        slot.originals = Vec::new();
        slot.recovery = Vec::new();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
