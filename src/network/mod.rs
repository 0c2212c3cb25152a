//! The simulated network: two directional pipes of lock-free packet rings.
//!
//! Each pipe stages packets through an outbound NIC ring, a wire ring, and
//! an inbound NIC ring. Two threads per pipe move packets along: one drains
//! the outbound NIC onto the wire (stamping each packet with its arrival
//! time and optionally stalling for serialization), the other delivers due
//! wire packets to the inbound NIC, applying the configured fault model on
//! the way. Overflowing either hop silently drops the packet; that is the
//! unreliability the transport layer exists to survive.

use std::io;
use std::ops;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::{ConfigError, NetworkConfig};
use crate::event::{Shutdown, WaitOutcome};
use crate::ring::{PacketRing, TakeResult};
use crate::stats::{NetworkCounters, NetworkStats};
use crate::MAX_PACKET_SIZE;

mod fault;
use fault::FaultInjector;

/// Cap on simulator sleeps, so drops and shutdown are noticed promptly
pub(crate) const NET_RETRY: Duration = Duration::from_millis(5);

/// Minimum well-formed packet: universal header plus type header
const MIN_PACKET_SIZE: usize = 32;

/// Which side of the transport a caller is acting as
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Role {
    /// Originates data packets, consumes comm packets
    Sender = 0,
    /// Consumes data packets, originates comm packets
    Receiver = 1,
}

impl ops::Not for Role {
    type Output = Role;
    fn not(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

/// Millisecond timebase shared by everything that stamps or checks arrivals
pub(crate) struct Clock {
    start: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

struct Pipe {
    outbound: PacketRing,
    wire: PacketRing,
    inbound: PacketRing,
}

struct NetworkInner {
    /// Indexed by the transmitting [`Role`]
    pipes: [Pipe; 2],
    clock: Clock,
    config: NetworkConfig,
    shutdown: Arc<Shutdown>,
    counters: NetworkCounters,
}

/// The simulated unreliable network
///
/// Packets enter through [`send_packet`](Self::send_packet) and leave
/// through [`receive_packet`](Self::receive_packet); in between they ride
/// the pipe belonging to the transmitting role. The layer is fully
/// symmetric: the sender role's packets surface at the receiver role and
/// vice versa.
pub struct NetworkLayer {
    inner: Arc<NetworkInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkLayer {
    /// Builds the network and starts its simulator threads
    pub fn new(config: NetworkConfig) -> Result<Self, CreateError> {
        Self::with_shutdown(config, Arc::new(Shutdown::new()))
    }

    pub(crate) fn with_shutdown(
        config: NetworkConfig,
        shutdown: Arc<Shutdown>,
    ) -> Result<Self, CreateError> {
        config.validate()?;
        let pipe = || Pipe {
            outbound: PacketRing::new(config.nic_slots, config.nic_capacity),
            wire: PacketRing::new(config.wire_slots, config.wire_capacity),
            inbound: PacketRing::new(config.nic_slots, config.nic_capacity),
        };
        let inner = Arc::new(NetworkInner {
            pipes: [pipe(), pipe()],
            clock: Clock::new(),
            config,
            shutdown,
            counters: NetworkCounters::default(),
        });
        let mut threads = Vec::with_capacity(4);
        for direction in [Role::Sender, Role::Receiver] {
            let tag = match direction {
                Role::Sender => "s2r",
                Role::Receiver => "r2s",
            };
            threads.push(spawn_named(
                format!("wireline-nic-{tag}"),
                {
                    let inner = inner.clone();
                    move || nic_to_wire(&inner, direction)
                },
            )?);
            threads.push(spawn_named(
                format!("wireline-wire-{tag}"),
                {
                    let inner = inner.clone();
                    move || wire_to_nic(&inner, direction)
                },
            )?);
        }
        Ok(Self {
            inner,
            threads: Mutex::new(threads),
        })
    }

    /// Hands a packet to the network for delivery to the opposite role
    ///
    /// `Full` is transient back-pressure; the caller may retry. `Rejected`
    /// means the bytes cannot be a packet and were not enqueued.
    pub fn send_packet(&self, packet: &[u8], role: Role) -> Result<(), SendPacketError> {
        if packet.len() < MIN_PACKET_SIZE || packet.len() > MAX_PACKET_SIZE {
            return Err(SendPacketError::Rejected("illegal packet size"));
        }
        self.inner.pipes[role as usize]
            .outbound
            .push(packet, 0)
            .map_err(|_| SendPacketError::Full)?;
        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Packet counters for both pipes combined
    pub fn stats(&self) -> NetworkStats {
        self.inner.counters.snapshot()
    }

    /// Waits up to `timeout` for a packet addressed to `role`
    pub fn receive_packet(&self, role: Role, timeout: Duration) -> Result<Vec<u8>, ReceiveError> {
        let deadline = Instant::now() + timeout;
        let ring = &self.inner.pipes[!role as usize].inbound;
        let mut out = Vec::new();
        loop {
            if self.inner.shutdown.is_set() {
                return Err(ReceiveError::Shutdown);
            }
            if let TakeResult::Taken(taken) = ring.try_take() {
                taken.read_into(&mut out);
                return Ok(out);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ReceiveError::Timeout);
            }
            // Re-check after arming the event so a publish between the take
            // and the reset cannot be slept through.
            ring.packets_waiting().reset();
            if let TakeResult::Taken(taken) = ring.try_take() {
                taken.read_into(&mut out);
                return Ok(out);
            }
            match ring
                .packets_waiting()
                .wait((deadline - now).min(NET_RETRY), &self.inner.shutdown)
            {
                WaitOutcome::Shutdown => return Err(ReceiveError::Shutdown),
                WaitOutcome::Signaled | WaitOutcome::TimedOut => {}
            }
        }
    }

    /// Non-blocking variant of [`receive_packet`](Self::receive_packet)
    pub fn try_receive_packet(&self, role: Role) -> Option<Vec<u8>> {
        let ring = &self.inner.pipes[!role as usize].inbound;
        match ring.try_take() {
            TakeResult::Taken(taken) => {
                let mut out = Vec::new();
                taken.read_into(&mut out);
                Some(out)
            }
            _ => None,
        }
    }

    /// Stops the simulator threads without draining in-flight packets
    ///
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        self.inner.shutdown.trigger();
        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for NetworkLayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_named(
    name: String,
    f: impl FnOnce() + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name).spawn(f)
}

/// Drains one pipe's outbound NIC onto its wire
fn nic_to_wire(inner: &NetworkInner, direction: Role) {
    let pipe = &inner.pipes[direction as usize];
    let one_way = inner.config.one_way_latency_ms();
    let mut scratch = Vec::with_capacity(MAX_PACKET_SIZE);
    debug!(?direction, "nic-to-wire running");
    while !inner.shutdown.is_set() {
        match pipe.outbound.try_take() {
            TakeResult::Taken(taken) => {
                taken.read_into(&mut scratch);
                drop(taken);
                if inner.config.serialization_delay {
                    // One wire, one packet at a time: sleeping here is what
                    // serializes the link.
                    let nanos = (scratch.len() as u128 * 8 * 1_000_000_000)
                        / inner.config.bandwidth_bps as u128;
                    if nanos > 0 {
                        thread::sleep(Duration::from_nanos(nanos.min(u64::MAX as u128) as u64));
                    }
                }
                let arrival = inner.clock.now_ms() + one_way;
                if pipe.wire.push(&scratch, arrival).is_err() {
                    inner.counters.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                    trace!(len = scratch.len(), "wire full; dropping packet");
                }
            }
            TakeResult::NotDue(_) => unreachable!("outbound packets carry no arrival stamp"),
            TakeResult::Empty => {
                // A publish racing this reset is picked up at worst one
                // retry interval later; the wait is capped for exactly that.
                pipe.outbound.packets_waiting().reset();
                pipe.outbound.packets_waiting().wait(NET_RETRY, &inner.shutdown);
            }
        }
    }
    debug!(?direction, "nic-to-wire exiting");
}

/// Delivers due wire packets to the inbound NIC, with faults applied
fn wire_to_nic(inner: &NetworkInner, direction: Role) {
    let pipe = &inner.pipes[direction as usize];
    let mut faults = FaultInjector::new(&inner.config, direction as u64);
    let mut scratch = Vec::with_capacity(MAX_PACKET_SIZE);
    debug!(?direction, "wire-to-nic running");
    while !inner.shutdown.is_set() {
        let now = inner.clock.now_ms();
        match pipe.wire.try_take_due(now) {
            TakeResult::Taken(taken) => {
                taken.read_into(&mut scratch);
                drop(taken);
                for delivery in faults.process(&scratch, &inner.counters) {
                    deliver(inner, pipe, &delivery);
                }
            }
            TakeResult::NotDue(eta) => {
                let wait = Duration::from_millis(eta.saturating_sub(now).max(1)).min(NET_RETRY);
                pipe.wire.packets_waiting().wait(wait, &inner.shutdown);
            }
            TakeResult::Empty => {
                if let Some(held) = faults.flush_held() {
                    deliver(inner, pipe, &held);
                    continue;
                }
                pipe.wire.packets_waiting().reset();
                pipe.wire.packets_waiting().wait(NET_RETRY, &inner.shutdown);
            }
        }
    }
    debug!(?direction, "wire-to-nic exiting");
}

fn deliver(inner: &NetworkInner, pipe: &Pipe, packet: &[u8]) {
    if pipe.inbound.push(packet, 0).is_err() {
        inner.counters.dropped_overflow.fetch_add(1, Ordering::Relaxed);
        trace!(len = packet.len(), "inbound NIC full; dropping packet");
    } else {
        inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

/// Errors from [`NetworkLayer::send_packet`]
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum SendPacketError {
    /// The bytes are not a plausible packet; nothing was enqueued
    #[error("packet rejected: {0}")]
    Rejected(&'static str),
    /// The outbound NIC has no room; retry after backing off
    #[error("outbound NIC full")]
    Full,
}

/// Errors from [`NetworkLayer::receive_packet`]
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum ReceiveError {
    /// No packet arrived within the timeout
    #[error("timed out waiting for a packet")]
    Timeout,
    /// The engine is shutting down
    #[error("shutting down")]
    Shutdown,
}

/// Errors from constructing a layer
#[derive(Debug, Error)]
pub enum CreateError {
    /// A configuration parameter is out of range
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The operating system refused a thread
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] io::Error),
}
