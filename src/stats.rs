//! Engine statistics.
//!
//! Counters are updated atomically by the engine threads and read through
//! point-in-time snapshots. Reads are not synchronized against each other,
//! so a snapshot taken mid-burst can be momentarily inconsistent between
//! fields (e.g. `sent` observed after a packet that `delivered` has not yet
//! counted); totals converge as soon as the wire goes quiet.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub(crate) struct NetworkCounters {
    pub(crate) sent: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) dropped_overflow: AtomicU64,
    pub(crate) dropped_fault: AtomicU64,
    pub(crate) duplicated: AtomicU64,
    pub(crate) corrupted: AtomicU64,
    pub(crate) reordered: AtomicU64,
}

impl NetworkCounters {
    pub(crate) fn snapshot(&self) -> NetworkStats {
        NetworkStats {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            dropped_fault: self.dropped_fault.load(Ordering::Relaxed),
            duplicated: self.duplicated.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
            reordered: self.reordered.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about packets crossing the simulated network, both pipes
/// combined
#[derive(Debug, Default, Copy, Clone)]
#[non_exhaustive]
pub struct NetworkStats {
    /// Packets accepted from either role by `send_packet`
    pub sent: u64,
    /// Packets that reached an inbound NIC (duplicates counted separately)
    pub delivered: u64,
    /// Packets lost to a full wire or inbound NIC
    pub dropped_overflow: u64,
    /// Packets removed by the fault injector
    pub dropped_fault: u64,
    /// Extra deliveries created by the fault injector
    pub duplicated: u64,
    /// Packets with an injected bit flip
    pub corrupted: u64,
    /// Packets held back so a successor could overtake them
    pub reordered: u64,
}

#[derive(Default)]
pub(crate) struct TransportCounters {
    pub(crate) transmissions_sent: AtomicU64,
    pub(crate) transmissions_failed: AtomicU64,
    pub(crate) transmissions_delivered: AtomicU64,
    pub(crate) data_packets_sent: AtomicU64,
    pub(crate) comm_packets_sent: AtomicU64,
    pub(crate) duplicates_discarded: AtomicU64,
}

impl TransportCounters {
    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            transmissions_sent: self.transmissions_sent.load(Ordering::Relaxed),
            transmissions_failed: self.transmissions_failed.load(Ordering::Relaxed),
            transmissions_delivered: self.transmissions_delivered.load(Ordering::Relaxed),
            data_packets_sent: self.data_packets_sent.load(Ordering::Relaxed),
            comm_packets_sent: self.comm_packets_sent.load(Ordering::Relaxed),
            duplicates_discarded: self.duplicates_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about the transport engines
#[derive(Debug, Default, Copy, Clone)]
#[non_exhaustive]
pub struct TransportStats {
    /// `send_transmission` calls that returned success
    pub transmissions_sent: u64,
    /// `send_transmission` calls that exhausted their budget or were shut
    /// down
    pub transmissions_failed: u64,
    /// Completed transmissions claimed by `receive_transmission`
    pub transmissions_delivered: u64,
    /// Data packets pushed to the network, retransmissions included
    pub data_packets_sent: u64,
    /// Acknowledgement packets pushed to the network
    pub comm_packets_sent: u64,
    /// Data packets discarded because their index had already arrived
    pub duplicates_discarded: u64,
}
