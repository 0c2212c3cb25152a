//! Fault injection on the wire→NIC edge.
//!
//! Each directional pipe owns one injector, seeded from the configured
//! fault seed and the pipe index, so a given configuration perturbs traffic
//! identically on every run. With all knobs at their defaults the injector
//! is a pass-through.

use std::sync::atomic::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::config::NetworkConfig;
use crate::stats::NetworkCounters;

/// Chance (percent) that an eligible packet is held back for reordering
const REORDER_HOLD_PCT: u32 = 25;

pub(crate) struct FaultInjector {
    drop_rate: u32,
    duplicate_rate: u32,
    corrupt_rate: u32,
    reorder: bool,
    rng: StdRng,
    /// A packet held back so its successor overtakes it
    held: Option<Vec<u8>>,
}

impl FaultInjector {
    pub(crate) fn new(config: &NetworkConfig, stream: u64) -> Self {
        Self {
            drop_rate: config.drop_rate.into(),
            duplicate_rate: config.duplicate_rate.into(),
            corrupt_rate: config.corrupt_rate.into(),
            reorder: config.reorder,
            rng: StdRng::seed_from_u64(
                config.fault_seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15),
            ),
            held: None,
        }
    }

    fn roll(&mut self, pct: u32) -> bool {
        pct > 0 && self.rng.gen_range(0..100) < pct
    }

    /// Applies the fault model to one packet, yielding zero or more
    /// deliveries in delivery order
    pub(crate) fn process(&mut self, packet: &[u8], counters: &NetworkCounters) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if self.roll(self.drop_rate) {
            counters.dropped_fault.fetch_add(1, Ordering::Relaxed);
            trace!(len = packet.len(), "fault: dropping packet");
            out.extend(self.held.take());
            return out;
        }
        let mut packet = packet.to_vec();
        if self.roll(self.corrupt_rate) {
            let bit = self.rng.gen_range(0..packet.len() * 8);
            packet[bit / 8] ^= 1 << (bit % 8);
            counters.corrupted.fetch_add(1, Ordering::Relaxed);
            trace!(bit, "fault: corrupting packet");
        }
        if self.reorder && self.held.is_none() && self.roll(REORDER_HOLD_PCT) {
            counters.reordered.fetch_add(1, Ordering::Relaxed);
            trace!("fault: holding packet back");
            self.held = Some(packet);
            return out;
        }
        if self.roll(self.duplicate_rate) {
            counters.duplicated.fetch_add(1, Ordering::Relaxed);
            trace!("fault: duplicating packet");
            out.push(packet.clone());
        }
        out.push(packet);
        // The held packet arrives after the one that overtook it.
        out.extend(self.held.take());
        out
    }

    /// Releases a held packet when the wire goes idle, so reordering never
    /// strands the final packet of a burst
    pub(crate) fn flush_held(&mut self) -> Option<Vec<u8>> {
        self.held.take()
    }
}
