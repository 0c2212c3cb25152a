use std::time::Duration;

use thiserror::Error;

use crate::MAX_PACKET_SIZE;

/// Parameters governing the simulated network
///
/// Defaults model a 100 Mbps link with a 20 ms round trip. Tests typically
/// shrink `latency` and the buffer sizes to keep wall-clock time down; the
/// fault knobs default to zero perturbation so an unconfigured network is
/// merely slow, never lossy.
#[derive(Clone)]
pub struct NetworkConfig {
    pub(crate) latency: Duration,
    pub(crate) bandwidth_bps: u64,
    pub(crate) serialization_delay: bool,
    pub(crate) wire_capacity: usize,
    pub(crate) wire_slots: usize,
    pub(crate) nic_slots: usize,
    pub(crate) nic_capacity: usize,
    pub(crate) drop_rate: u8,
    pub(crate) duplicate_rate: u8,
    pub(crate) corrupt_rate: u8,
    pub(crate) reorder: bool,
    pub(crate) fault_seed: u64,
}

impl NetworkConfig {
    /// Simulated round-trip latency; each packet is delayed by half of this
    pub fn latency(&mut self, value: Duration) -> &mut Self {
        self.latency = value;
        self
    }

    /// Wire bandwidth in bits per second, used for the serialization stall
    pub fn bandwidth_bps(&mut self, value: u64) -> &mut Self {
        self.bandwidth_bps = value;
        self
    }

    /// Whether the NIC→wire thread stalls for `packet_bits / bandwidth`
    /// before each packet enters the wire
    ///
    /// Reliability properties hold with or without the stall; disabling it
    /// makes bulk tests faster.
    pub fn serialization_delay(&mut self, value: bool) -> &mut Self {
        self.serialization_delay = value;
        self
    }

    /// Size of each wire buffer's data arena in bytes
    pub fn wire_capacity(&mut self, value: usize) -> &mut Self {
        self.wire_capacity = value;
        self
    }

    /// Number of packet slots in each wire buffer
    pub fn wire_slots(&mut self, value: usize) -> &mut Self {
        self.wire_slots = value;
        self
    }

    /// Number of packet slots in each NIC buffer
    ///
    /// The NIC data arena is sized to hold this many maximum-size packets.
    pub fn nic_slots(&mut self, value: usize) -> &mut Self {
        self.nic_slots = value;
        self.nic_capacity = value * MAX_PACKET_SIZE;
        self
    }

    /// Percentage (0–100) of wire packets silently dropped
    pub fn drop_rate(&mut self, value: u8) -> &mut Self {
        self.drop_rate = value;
        self
    }

    /// Percentage (0–100) of wire packets delivered twice
    pub fn duplicate_rate(&mut self, value: u8) -> &mut Self {
        self.duplicate_rate = value;
        self
    }

    /// Percentage (0–100) of wire packets with one bit flipped
    ///
    /// The core attaches no checksum, so corruption is not detected here;
    /// corrupted headers fail to decode and count as drops, corrupted
    /// payloads are delivered as-is.
    pub fn corrupt_rate(&mut self, value: u8) -> &mut Self {
        self.corrupt_rate = value;
        self
    }

    /// Whether the wire may swap adjacent packets
    pub fn reorder(&mut self, value: bool) -> &mut Self {
        self.reorder = value;
        self
    }

    /// Seed for the fault-injection RNG, making perturbation reproducible
    pub fn fault_seed(&mut self, value: u64) -> &mut Self {
        self.fault_seed = value;
        self
    }

    pub(crate) fn one_way_latency_ms(&self) -> u64 {
        (self.latency.as_millis() / 2) as u64
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        for (name, rate) in [
            ("drop_rate", self.drop_rate),
            ("duplicate_rate", self.duplicate_rate),
            ("corrupt_rate", self.corrupt_rate),
        ] {
            if rate > 100 {
                return Err(ConfigError::RateOutOfRange(name));
            }
        }
        if self.bandwidth_bps == 0 {
            return Err(ConfigError::ZeroBandwidth);
        }
        if self.wire_slots < 2 || self.nic_slots < 2 {
            return Err(ConfigError::BufferTooSmall("at least 2 packet slots"));
        }
        if self.wire_capacity < 2 * MAX_PACKET_SIZE || self.nic_capacity < 2 * MAX_PACKET_SIZE {
            return Err(ConfigError::BufferTooSmall(
                "arena must hold at least 2 maximum-size packets",
            ));
        }
        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        const NIC_SLOTS: usize = 256;
        Self {
            latency: Duration::from_millis(20),
            bandwidth_bps: 100_000_000,
            serialization_delay: true,
            wire_capacity: 16 * 1024 * 1024,
            wire_slots: 16 * 1024,
            nic_slots: NIC_SLOTS,
            nic_capacity: NIC_SLOTS * MAX_PACKET_SIZE,
            drop_rate: 0,
            duplicate_rate: 0,
            corrupt_rate: 0,
            reorder: false,
            fault_seed: 0,
        }
    }
}

/// Parameters governing the transport engines on both sides
#[derive(Clone)]
pub struct TransportConfig {
    pub(crate) retry_interval: Option<Duration>,
    pub(crate) send_budget: Duration,
    pub(crate) packet_wait: Duration,
    pub(crate) comm_every_packets: u32,
    pub(crate) comm_interval: Duration,
    pub(crate) sender_workers: usize,
    pub(crate) cache_slots: usize,
}

impl TransportConfig {
    /// How long the sender waits for acknowledgements before starting the
    /// next retransmission pass
    ///
    /// `None` derives the interval from the network round trip (2× latency).
    pub fn retry_interval(&mut self, value: Option<Duration>) -> &mut Self {
        self.retry_interval = value;
        self
    }

    /// Total wall-clock budget for one `send_transmission` call, after
    /// which the call fails and the in-flight record is torn down
    pub fn send_budget(&mut self, value: Duration) -> &mut Self {
        self.send_budget = value;
        self
    }

    /// Timeout used by the engine threads when polling the network for
    /// packets
    pub fn packet_wait(&mut self, value: Duration) -> &mut Self {
        self.packet_wait = value;
        self
    }

    /// Emit an acknowledgement bitmap after this many data packets arrive
    /// for one transmission
    pub fn comm_every_packets(&mut self, value: u32) -> &mut Self {
        self.comm_every_packets = value;
        self
    }

    /// Emit an acknowledgement bitmap at least this often per active
    /// transmission
    pub fn comm_interval(&mut self, value: Duration) -> &mut Self {
        self.comm_interval = value;
        self
    }

    /// Number of worker threads executing packetization passes
    pub fn sender_workers(&mut self, value: usize) -> &mut Self {
        self.sender_workers = value;
        self
    }

    /// Number of slots in the cache ring between the inbound NIC drain and
    /// the reassembler
    pub fn cache_slots(&mut self, value: usize) -> &mut Self {
        self.cache_slots = value;
        self
    }

    pub(crate) fn effective_retry_interval(&self, network: &NetworkConfig) -> Duration {
        self.retry_interval
            .unwrap_or_else(|| network.latency.saturating_mul(2).max(Duration::from_millis(1)))
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.sender_workers == 0 {
            return Err(ConfigError::NoSenderWorkers);
        }
        if self.comm_every_packets == 0 {
            return Err(ConfigError::ZeroCommCadence);
        }
        if self.cache_slots < 2 {
            return Err(ConfigError::BufferTooSmall("cache needs at least 2 slots"));
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retry_interval: None,
            send_budget: Duration::from_secs(10),
            packet_wait: Duration::from_millis(500),
            comm_every_packets: 16,
            comm_interval: Duration::from_millis(5),
            sender_workers: 2,
            cache_slots: 128,
        }
    }
}

/// Errors in the values of configuration parameters
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// A perturbation percentage exceeds 100
    #[error("{0} must be between 0 and 100")]
    RateOutOfRange(&'static str),
    /// The wire bandwidth is zero
    #[error("bandwidth must be nonzero")]
    ZeroBandwidth,
    /// A buffer is too small to pass packets through
    #[error("buffer too small: {0}")]
    BufferTooSmall(&'static str),
    /// The sender was configured with no worker threads
    #[error("sender needs at least one worker thread")]
    NoSenderWorkers,
    /// The acknowledgement cadence would never fire
    #[error("comm cadence must be at least one packet")]
    ZeroCommCadence,
}
