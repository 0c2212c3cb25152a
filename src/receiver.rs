//! The receiver engine: caching, reassembly, acknowledgement, delivery.
//!
//! Two threads serve the receive path. The drain thread moves inbound NIC
//! packets into a bounded cache ring, waiting (never dropping) when the
//! cache is full, which back-pressures the path without stalling the
//! network simulator. The reassembler thread empties the cache: it creates
//! a record the first time it sees a transmission id, copies each payload
//! to its index-addressed position, and counts packets down to completion.
//! Acknowledgement bitmaps go back to the sender every few packets, on a
//! timer, on duplicates (the sender evidently missed one), and on
//! completion.
//!
//! Completed transmissions wait in their records until an application
//! thread claims them through `receive_transmission`, either by id or by
//! the id-0 wildcard; an auto-reset event serializes wildcard consumers so
//! each completion is delivered exactly once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::bitmap::AtomicBitmap;
use crate::config::TransportConfig;
use crate::event::{Event, Shutdown, WaitOutcome};
use crate::network::{CreateError, NetworkLayer, ReceiveError, Role, NET_RETRY};
use crate::packet::{CommPacket, DataPacket, Packet};
use crate::ring::{PacketRing, TakeResult};
use crate::stats::TransportCounters;
use crate::{TransmissionId, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE};

/// Poll interval while waiting for a record that does not exist yet
const ABSENT_POLL: Duration = Duration::from_millis(10);

/// Ids remembered after delivery, to re-acknowledge stale retransmissions
const RETIRED_CAP: usize = 1024;

/// Data-packet indices covered by one comm packet's bitmap
const WINDOW_BITS: u32 = (MAX_PAYLOAD_SIZE * 8) as u32;

/// One in-flight inbound transmission
struct RecvRecord {
    id: TransmissionId,
    n_packets: u32,
    /// Bit k set ⇔ packet k arrived at least once
    received: AtomicBitmap,
    remaining: AtomicU32,
    /// Learned from the final-index packet; valid once `remaining` is 0
    total_bytes: AtomicUsize,
    buf: Mutex<Box<[u8]>>,
    complete: Event,
    claimed: AtomicBool,
}

impl RecvRecord {
    fn new(id: TransmissionId, n_packets: u32) -> Self {
        Self {
            id,
            n_packets,
            received: AtomicBitmap::new(n_packets),
            remaining: AtomicU32::new(n_packets),
            total_bytes: AtomicUsize::new(0),
            buf: Mutex::new(vec![0; n_packets as usize * MAX_PAYLOAD_SIZE].into_boxed_slice()),
            complete: Event::manual(),
            claimed: AtomicBool::new(false),
        }
    }
}

/// Bounded memory of delivered ids
///
/// A data packet for a delivered transmission means its final
/// acknowledgement was lost; answering with a synthesized full bitmap lets
/// the sender finish instead of burning its whole retry budget.
struct RetiredLog {
    set: FxHashSet<u32>,
    order: VecDeque<u32>,
}

impl RetiredLog {
    fn new() -> Self {
        Self {
            set: FxHashSet::default(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, id: u32) {
        if self.set.insert(id) {
            self.order.push_back(id);
            if self.order.len() > RETIRED_CAP {
                if let Some(oldest) = self.order.pop_front() {
                    self.set.remove(&oldest);
                }
            }
        }
    }

    fn contains(&self, id: u32) -> bool {
        self.set.contains(&id)
    }
}

struct ReceiverShared {
    network: Arc<NetworkLayer>,
    /// Bounded hand-off between the drain thread and the reassembler
    cache: PacketRing,
    records: Mutex<FxHashMap<u32, Arc<RecvRecord>>>,
    completions: Mutex<VecDeque<u32>>,
    /// Auto-reset: each completion releases exactly one wildcard waiter
    completion_ready: Event,
    retired: Mutex<RetiredLog>,
    shutdown: Arc<Shutdown>,
    counters: Arc<TransportCounters>,
    packet_wait: Duration,
    comm_every_packets: u32,
    comm_interval: Duration,
}

pub(crate) struct ReceiverEngine {
    shared: Arc<ReceiverShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ReceiverEngine {
    pub(crate) fn new(
        network: Arc<NetworkLayer>,
        config: &TransportConfig,
        shutdown: Arc<Shutdown>,
        counters: Arc<TransportCounters>,
    ) -> Result<Self, CreateError> {
        let shared = Arc::new(ReceiverShared {
            network,
            cache: PacketRing::new(config.cache_slots, config.cache_slots * MAX_PACKET_SIZE),
            records: Mutex::new(FxHashMap::default()),
            completions: Mutex::new(VecDeque::new()),
            completion_ready: Event::auto(),
            retired: Mutex::new(RetiredLog::new()),
            shutdown,
            counters,
            packet_wait: config.packet_wait,
            comm_every_packets: config.comm_every_packets,
            comm_interval: config.comm_interval,
        });
        let threads = vec![
            thread::Builder::new()
                .name("wireline-recv-drain".into())
                .spawn({
                    let shared = shared.clone();
                    move || drain_loop(&shared)
                })?,
            thread::Builder::new()
                .name("wireline-recv-reassembler".into())
                .spawn({
                    let shared = shared.clone();
                    move || reassemble_loop(&shared)
                })?,
        ];
        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Waits up to `timeout` for a completed transmission and copies it out
    ///
    /// `id` 0 is the wildcard: the first queued completion is delivered,
    /// whichever transmission it belongs to. A timeout leaves `dest` and
    /// all records untouched, so a later call can still claim the data.
    pub(crate) fn receive_transmission(
        &self,
        id: u32,
        dest: &mut [u8],
        timeout: Duration,
    ) -> Result<Received, RecvError> {
        if TransmissionId::new(id).is_none() {
            return Err(RecvError::InvalidId);
        }
        let deadline = Instant::now() + timeout;
        if id == 0 {
            self.receive_any(dest, deadline)
        } else {
            self.receive_by_id(id, dest, deadline)
        }
    }

    fn receive_by_id(
        &self,
        id: u32,
        dest: &mut [u8],
        deadline: Instant,
    ) -> Result<Received, RecvError> {
        let shared = &self.shared;
        loop {
            if shared.shutdown.is_set() {
                return Err(RecvError::ShuttingDown);
            }
            let record = shared.records.lock().get(&id).cloned();
            let remaining = deadline.saturating_duration_since(Instant::now());
            match record {
                Some(record) => {
                    match record.complete.wait(remaining, &shared.shutdown) {
                        WaitOutcome::Signaled => {
                            if record.claimed.swap(true, Ordering::AcqRel) {
                                // A wildcard consumer won this record; it is
                                // about to vanish from the table.
                                continue;
                            }
                            return self.deliver(&record, dest);
                        }
                        WaitOutcome::TimedOut => return Err(RecvError::Timeout),
                        WaitOutcome::Shutdown => return Err(RecvError::ShuttingDown),
                    }
                }
                None => {
                    if remaining.is_zero() {
                        return Err(RecvError::Timeout);
                    }
                    // Nothing to wait on until the first packet creates the
                    // record; poll at a coarse interval.
                    if shared.shutdown.sleep(ABSENT_POLL.min(remaining)) == WaitOutcome::Shutdown {
                        return Err(RecvError::ShuttingDown);
                    }
                }
            }
        }
    }

    fn receive_any(&self, dest: &mut [u8], deadline: Instant) -> Result<Received, RecvError> {
        let shared = &self.shared;
        loop {
            if shared.shutdown.is_set() {
                return Err(RecvError::ShuttingDown);
            }
            let next = shared.completions.lock().pop_front();
            match next {
                Some(id) => {
                    let record = shared.records.lock().get(&id).cloned();
                    let Some(record) = record else {
                        continue; // claimed by id before we got here
                    };
                    if record.claimed.swap(true, Ordering::AcqRel) {
                        continue;
                    }
                    let result = match self.deliver(&record, dest) {
                        Err(RecvError::BufferTooSmall) => {
                            // Leave the completion claimable by a better
                            // equipped consumer.
                            shared.completions.lock().push_front(id);
                            Err(RecvError::BufferTooSmall)
                        }
                        other => other,
                    };
                    // The auto-reset event holds at most one pending signal,
                    // so hand it on if completions are still queued.
                    if !shared.completions.lock().is_empty() {
                        shared.completion_ready.set();
                    }
                    return result;
                }
                None => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(RecvError::Timeout);
                    }
                    match shared.completion_ready.wait(remaining, &shared.shutdown) {
                        WaitOutcome::Shutdown => return Err(RecvError::ShuttingDown),
                        WaitOutcome::Signaled | WaitOutcome::TimedOut => {}
                    }
                }
            }
        }
    }

    /// Copies a claimed record out and retires it
    fn deliver(&self, record: &Arc<RecvRecord>, dest: &mut [u8]) -> Result<Received, RecvError> {
        let len = record.total_bytes.load(Ordering::Acquire);
        if dest.len() < len {
            record.claimed.store(false, Ordering::Release);
            return Err(RecvError::BufferTooSmall);
        }
        dest[..len].copy_from_slice(&record.buf.lock()[..len]);
        self.shared.records.lock().remove(&record.id.0);
        self.shared.retired.lock().insert(record.id.0);
        self.shared
            .counters
            .transmissions_delivered
            .fetch_add(1, Ordering::Relaxed);
        debug!(id = %record.id, len, "transmission delivered");
        Ok(Received {
            id: record.id.0,
            len,
        })
    }

    /// Waits for the drain and reassembler threads after shutdown
    pub(crate) fn join(&self) {
        debug_assert!(self.shared.shutdown.is_set());
        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }
    }
}

/// Moves inbound NIC packets into the cache, blocking when it is full
fn drain_loop(shared: &ReceiverShared) {
    debug!("receiver drain running");
    loop {
        match shared.network.receive_packet(Role::Receiver, shared.packet_wait) {
            Ok(bytes) => loop {
                if shared.cache.push(&bytes, 0).is_ok() {
                    break;
                }
                let freed = shared.cache.space_freed();
                freed.reset();
                if shared.cache.push(&bytes, 0).is_ok() {
                    break;
                }
                if freed.wait(NET_RETRY, &shared.shutdown) == WaitOutcome::Shutdown {
                    return;
                }
            },
            Err(ReceiveError::Timeout) => {}
            Err(ReceiveError::Shutdown) => break,
        }
    }
    debug!("receiver drain exiting");
}

/// Acknowledgement cadence state, private to the reassembler
struct Cadence {
    since_comm: u32,
    last_comm: Instant,
}

fn reassemble_loop(shared: &ReceiverShared) {
    debug!("reassembler running");
    let mut cadence: FxHashMap<u32, Cadence> = FxHashMap::default();
    let mut bytes = Vec::with_capacity(MAX_PACKET_SIZE);
    loop {
        if shared.shutdown.is_set() {
            break;
        }
        match shared.cache.try_take() {
            TakeResult::Taken(taken) => {
                taken.read_into(&mut bytes);
                drop(taken);
                process_packet(shared, &bytes, &mut cadence);
            }
            _ => {
                // Idle: flush any acknowledgements the interval timer owes
                // before sleeping.
                sweep_cadence(shared, &mut cadence);
                let waiting = shared.cache.packets_waiting();
                waiting.reset();
                if let TakeResult::Taken(taken) = shared.cache.try_take() {
                    taken.read_into(&mut bytes);
                    drop(taken);
                    process_packet(shared, &bytes, &mut cadence);
                    continue;
                }
                if waiting.wait(NET_RETRY, &shared.shutdown) == WaitOutcome::Shutdown {
                    break;
                }
            }
        }
    }
    debug!("reassembler exiting");
}

fn process_packet(shared: &ReceiverShared, bytes: &[u8], cadence: &mut FxHashMap<u32, Cadence>) {
    match Packet::decode(bytes) {
        Ok(Packet::Data(data)) => handle_data(shared, &data, cadence),
        Ok(Packet::Comm(_)) => warn!("comm packet delivered to the receiver role; discarding"),
        Err(error) => trace!(%error, "discarding undecodable packet"),
    }
}

fn handle_data(shared: &ReceiverShared, data: &DataPacket, cadence: &mut FxHashMap<u32, Cadence>) {
    // Interior packets are always full; anything else is damage.
    if data.index + 1 != data.total && data.payload.len() != MAX_PAYLOAD_SIZE {
        trace!(id = %data.id, index = data.index, "mis-sized interior packet; discarding");
        return;
    }
    if shared.retired.lock().contains(data.id.0) {
        trace!(id = %data.id, "data for a delivered transmission; re-acknowledging");
        send_full_ack(shared, data.id, data.total);
        return;
    }
    let record = shared
        .records
        .lock()
        .entry(data.id.0)
        .or_insert_with(|| {
            debug!(id = %data.id, packets = data.total, "new inbound transmission");
            Arc::new(RecvRecord::new(data.id, data.total))
        })
        .clone();
    if record.n_packets != data.total {
        trace!(id = %data.id, "packet disagrees with its transmission's size; discarding");
        return;
    }

    let entry = cadence.entry(data.id.0).or_insert_with(|| Cadence {
        since_comm: 0,
        last_comm: Instant::now(),
    });
    entry.since_comm += 1;
    let mut force_comm = false;
    let mut completed = false;
    if !record.received.set(data.index) {
        // Duplicate: the payload is discarded, but the retransmission means
        // the sender has not seen our acknowledgement.
        shared.counters.duplicates_discarded.fetch_add(1, Ordering::Relaxed);
        trace!(id = %data.id, index = data.index, "duplicate data packet");
        force_comm = true;
    } else {
        let start = data.index as usize * MAX_PAYLOAD_SIZE;
        record.buf.lock()[start..start + data.payload.len()].copy_from_slice(&data.payload);
        if data.index + 1 == data.total {
            record.total_bytes.store(
                (data.total as usize - 1) * MAX_PAYLOAD_SIZE + data.payload.len(),
                Ordering::Release,
            );
        }
        if record.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            completed = true;
            force_comm = true;
        }
    }
    if force_comm
        || entry.since_comm >= shared.comm_every_packets
        || entry.last_comm.elapsed() >= shared.comm_interval
    {
        send_bitmap(shared, &record);
        entry.since_comm = 0;
        entry.last_comm = Instant::now();
    }
    if completed {
        debug!(id = %record.id, "transmission reassembled");
        cadence.remove(&data.id.0);
        record.complete.set();
        shared.completions.lock().push_back(data.id.0);
        shared.completion_ready.set();
    }
}

/// Emits the current received bitmap as one comm packet per window
fn send_bitmap(shared: &ReceiverShared, record: &RecvRecord) {
    let mut wire_buf = Vec::new();
    let mut first = 0;
    while first < record.n_packets {
        let bits = (record.n_packets - first).min(WINDOW_BITS);
        Packet::Comm(CommPacket {
            id: record.id,
            first_index: first,
            bits,
            bitmap: record.received.snapshot_bytes(first, bits),
        })
        .encode(&mut wire_buf);
        match shared.network.send_packet(&wire_buf, Role::Receiver) {
            Ok(()) => {
                shared.counters.comm_packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            // Lost acknowledgements are retried at the next cadence tick.
            Err(error) => trace!(%error, "comm packet not sent"),
        }
        first += bits;
    }
}

/// Acknowledges every packet of a transmission we no longer hold
fn send_full_ack(shared: &ReceiverShared, id: TransmissionId, total: u32) {
    let mut wire_buf = Vec::new();
    let mut first = 0;
    while first < total {
        let bits = (total - first).min(WINDOW_BITS);
        Packet::Comm(CommPacket {
            id,
            first_index: first,
            bits,
            bitmap: vec![0xFF; ((bits + 7) / 8) as usize],
        })
        .encode(&mut wire_buf);
        match shared.network.send_packet(&wire_buf, Role::Receiver) {
            Ok(()) => {
                shared.counters.comm_packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => trace!(%error, "re-acknowledgement not sent"),
        }
        first += bits;
    }
}

/// Emits overdue acknowledgements while the cache is idle
fn sweep_cadence(shared: &ReceiverShared, cadence: &mut FxHashMap<u32, Cadence>) {
    for (id, entry) in cadence.iter_mut() {
        if entry.since_comm == 0 || entry.last_comm.elapsed() < shared.comm_interval {
            continue;
        }
        let record = shared.records.lock().get(id).cloned();
        if let Some(record) = record {
            send_bitmap(shared, &record);
        }
        entry.since_comm = 0;
        entry.last_comm = Instant::now();
    }
}

/// A successfully received transmission
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Received {
    /// The transmission's id, informative for wildcard receives
    pub id: u32,
    /// Number of bytes written to the destination buffer
    pub len: usize,
}

/// Errors from [`TransportLayer::receive_transmission`](crate::TransportLayer::receive_transmission)
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum RecvError {
    /// The id is ≥ 2³¹
    #[error("transmission id out of range")]
    InvalidId,
    /// No matching transmission completed within the timeout
    #[error("no completed transmission within the timeout")]
    Timeout,
    /// The destination buffer cannot hold the transmission; the record is
    /// preserved for a retry
    #[error("destination buffer too small")]
    BufferTooSmall,
    /// Shutdown was triggered while waiting
    #[error("shutting down")]
    ShuttingDown,
}
