//! The sender engine: packetization, acknowledgement tracking, retransmit.
//!
//! `send_transmission` registers a record, then alternates between queueing
//! a packetization pass (executed by the worker threads) and waiting on the
//! record's completion event. Each pass sends exactly the indices whose
//! acknowledgement bit is still clear, so retransmission cost shrinks as
//! bitmaps flow back. One listener thread consumes comm packets and ORs
//! their bitmaps into the records; the OR is idempotent, making duplicate
//! acknowledgements free.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::bitmap::AtomicBitmap;
use crate::config::TransportConfig;
use crate::event::{Event, Shutdown, WaitOutcome};
use crate::network::{CreateError, NetworkLayer, ReceiveError, Role, SendPacketError};
use crate::packet::{CommPacket, DataPacket, Packet};
use crate::stats::TransportCounters;
use crate::{TransmissionId, MAX_PAYLOAD_SIZE};

/// Yield-spins against a full outbound NIC before backing off to sleep
const SEND_SPINS: u32 = 64;

/// How long an idle worker sleeps between work-queue checks
const WORKER_IDLE: Duration = Duration::from_millis(50);

/// One in-flight outbound transmission
struct SendRecord {
    id: TransmissionId,
    data: Box<[u8]>,
    n_packets: u32,
    /// Bit k set ⇔ packet k acknowledged by the receiver
    acked: AtomicBitmap,
    acked_count: AtomicU32,
    /// Deduplicates work-queue entries for this record
    pass_queued: AtomicBool,
    complete: Event,
}

struct SenderShared {
    network: Arc<NetworkLayer>,
    records: Mutex<FxHashMap<u32, Arc<SendRecord>>>,
    work: Mutex<VecDeque<Arc<SendRecord>>>,
    work_ready: Event,
    shutdown: Arc<Shutdown>,
    counters: Arc<TransportCounters>,
    retry_interval: Duration,
    send_budget: Duration,
    packet_wait: Duration,
}

impl SenderShared {
    fn enqueue_pass(&self, record: &Arc<SendRecord>) {
        if !record.pass_queued.swap(true, Ordering::AcqRel) {
            self.work.lock().push_back(record.clone());
            self.work_ready.set();
        }
    }
}

pub(crate) struct SenderEngine {
    shared: Arc<SenderShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SenderEngine {
    pub(crate) fn new(
        network: Arc<NetworkLayer>,
        config: &TransportConfig,
        retry_interval: Duration,
        shutdown: Arc<Shutdown>,
        counters: Arc<TransportCounters>,
    ) -> Result<Self, CreateError> {
        let shared = Arc::new(SenderShared {
            network,
            records: Mutex::new(FxHashMap::default()),
            work: Mutex::new(VecDeque::new()),
            work_ready: Event::auto(),
            shutdown,
            counters,
            retry_interval,
            send_budget: config.send_budget,
            packet_wait: config.packet_wait,
        });
        let mut threads = Vec::with_capacity(config.sender_workers + 1);
        threads.push(
            thread::Builder::new()
                .name("wireline-send-listener".into())
                .spawn({
                    let shared = shared.clone();
                    move || listener_loop(&shared)
                })?,
        );
        for worker in 0..config.sender_workers {
            threads.push(
                thread::Builder::new()
                    .name(format!("wireline-send-worker-{worker}"))
                    .spawn({
                        let shared = shared.clone();
                        move || worker_loop(&shared)
                    })?,
            );
        }
        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Reliably delivers `data` to the receiver side as transmission `id`
    ///
    /// Blocks until every packet is acknowledged, the send budget runs out,
    /// or shutdown is triggered. The in-flight record lives only for the
    /// duration of this call.
    pub(crate) fn send_transmission(&self, id: u32, data: &[u8]) -> Result<(), SendError> {
        let shared = &self.shared;
        if shared.shutdown.is_set() {
            return Err(SendError::ShuttingDown);
        }
        let id = match TransmissionId::new(id) {
            // Id 0 is the receive-side wildcard and cannot name a transmission.
            Some(id) if id.0 != 0 => id,
            _ => return Err(SendError::InvalidId),
        };
        if data.is_empty() {
            return Err(SendError::EmptyTransmission);
        }
        let n_packets = ((data.len() + MAX_PAYLOAD_SIZE - 1) / MAX_PAYLOAD_SIZE) as u32;
        let record = Arc::new(SendRecord {
            id,
            data: data.into(),
            n_packets,
            acked: AtomicBitmap::new(n_packets),
            acked_count: AtomicU32::new(0),
            pass_queued: AtomicBool::new(false),
            complete: Event::manual(),
        });
        {
            use std::collections::hash_map::Entry;
            let mut records = shared.records.lock();
            match records.entry(id.0) {
                Entry::Occupied(_) => return Err(SendError::AlreadyInFlight),
                Entry::Vacant(slot) => {
                    slot.insert(record.clone());
                }
            }
        }
        debug!(%id, bytes = data.len(), packets = n_packets, "transmission registered");

        let deadline = Instant::now() + shared.send_budget;
        let result = loop {
            shared.enqueue_pass(&record);
            match record.complete.wait(shared.retry_interval, &shared.shutdown) {
                WaitOutcome::Signaled => break Ok(()),
                WaitOutcome::Shutdown => break Err(SendError::ShuttingDown),
                WaitOutcome::TimedOut => {
                    if Instant::now() >= deadline {
                        warn!(
                            %id,
                            acked = record.acked_count.load(Ordering::Relaxed),
                            of = n_packets,
                            "send budget exhausted"
                        );
                        break Err(SendError::TimedOut);
                    }
                    trace!(%id, "retransmission pass due");
                }
            }
        };
        shared.records.lock().remove(&id.0);
        match &result {
            Ok(()) => shared.counters.transmissions_sent.fetch_add(1, Ordering::Relaxed),
            Err(_) => shared.counters.transmissions_failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Waits for the listener and workers after shutdown has been triggered
    pub(crate) fn join(&self) {
        debug_assert!(self.shared.shutdown.is_set());
        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }
    }
}

fn worker_loop(shared: &SenderShared) {
    let mut wire_buf = Vec::new();
    loop {
        if shared.shutdown.is_set() {
            return;
        }
        let record = shared.work.lock().pop_front();
        match record {
            Some(record) => {
                // Clear before running so a pass requested mid-run is not
                // lost; the worst case is one redundant (cheap) pass.
                record.pass_queued.store(false, Ordering::Release);
                run_pass(shared, &record, &mut wire_buf);
            }
            None => {
                if shared.work_ready.wait(WORKER_IDLE, &shared.shutdown) == WaitOutcome::Shutdown {
                    return;
                }
            }
        }
    }
}

/// Sends every not-yet-acknowledged packet of one transmission
fn run_pass(shared: &SenderShared, record: &SendRecord, wire_buf: &mut Vec<u8>) {
    let mut sent = 0u32;
    for index in 0..record.n_packets {
        if shared.shutdown.is_set() {
            return;
        }
        if record.acked.get(index) {
            continue;
        }
        let start = index as usize * MAX_PAYLOAD_SIZE;
        let end = record.data.len().min(start + MAX_PAYLOAD_SIZE);
        Packet::Data(DataPacket {
            id: record.id,
            index,
            total: record.n_packets,
            payload: record.data[start..end].to_vec(),
        })
        .encode(wire_buf);
        if !push_until_accepted(shared, wire_buf) {
            return;
        }
        shared.counters.data_packets_sent.fetch_add(1, Ordering::Relaxed);
        sent += 1;
    }
    trace!(id = %record.id, sent, "packetization pass complete");
}

/// Spin-retries a full outbound NIC; returns false only on shutdown
fn push_until_accepted(shared: &SenderShared, wire_buf: &[u8]) -> bool {
    let mut spins = 0u32;
    loop {
        match shared.network.send_packet(wire_buf, Role::Sender) {
            Ok(()) => return true,
            Err(SendPacketError::Full) => {
                spins += 1;
                if spins <= SEND_SPINS {
                    thread::yield_now();
                } else if shared.shutdown.sleep(Duration::from_millis(1)) == WaitOutcome::Shutdown {
                    return false;
                }
            }
            Err(SendPacketError::Rejected(reason)) => {
                // The engine only builds well-formed packets.
                warn!(reason, "network rejected an engine packet");
                debug_assert!(false, "network rejected an engine packet: {reason}");
                return false;
            }
        }
    }
}

fn listener_loop(shared: &SenderShared) {
    debug!("sender listener running");
    loop {
        match shared.network.receive_packet(Role::Sender, shared.packet_wait) {
            Ok(bytes) => match Packet::decode(&bytes) {
                Ok(Packet::Comm(comm)) => apply_comm(shared, &comm),
                Ok(Packet::Data(_)) => warn!("data packet delivered to the sender role; discarding"),
                Err(error) => trace!(%error, "discarding undecodable packet"),
            },
            Err(ReceiveError::Timeout) => {}
            Err(ReceiveError::Shutdown) => break,
        }
    }
    debug!("sender listener exiting");
}

/// ORs a received acknowledgement bitmap into its transmission's record
fn apply_comm(shared: &SenderShared, comm: &CommPacket) {
    let record = shared.records.lock().get(&comm.id.0).cloned();
    let Some(record) = record else {
        trace!(id = %comm.id, "acknowledgement for a transmission no longer in flight");
        return;
    };
    let mut newly_acked = 0;
    for k in 0..comm.bits {
        if !comm.bit(k) {
            continue;
        }
        let index = match comm.first_index.checked_add(k) {
            Some(index) if index < record.n_packets => index,
            _ => {
                trace!(id = %comm.id, "acknowledgement beyond transmission bounds; discarding rest");
                break;
            }
        };
        if record.acked.set(index) {
            newly_acked += 1;
        }
    }
    if newly_acked > 0 {
        let total = record.acked_count.fetch_add(newly_acked, Ordering::AcqRel) + newly_acked;
        trace!(id = %record.id, acked = total, of = record.n_packets, "acknowledgements merged");
        if total == record.n_packets {
            debug!(id = %record.id, "transmission fully acknowledged");
            record.complete.set();
        }
    }
}

/// Errors from [`TransportLayer::send_transmission`](crate::TransportLayer::send_transmission)
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum SendError {
    /// The id is 0 (reserved for the receive wildcard) or ≥ 2³¹
    #[error("transmission id out of range")]
    InvalidId,
    /// Zero-length transmissions cannot be packetized
    #[error("transmission is empty")]
    EmptyTransmission,
    /// Another call is already sending this id
    #[error("transmission id already in flight")]
    AlreadyInFlight,
    /// The send budget elapsed before every packet was acknowledged
    #[error("transmission was not acknowledged within the send budget")]
    TimedOut,
    /// Shutdown was triggered while the transmission was in flight
    #[error("shutting down")]
    ShuttingDown,
}
