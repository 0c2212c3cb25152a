//! Lock-free variable-size MPMC packet ring.
//!
//! Each ring pairs a circular sequence of metadata slots with a contiguous
//! byte arena. Producers claim the slot at the write cursor, carve a byte
//! region that starts where the previous producer's region ended (wrapping
//! to the arena start at most once), copy their packet in, and publish.
//! Consumers take published slots in cursor order and release both the slot
//! and its region. Slot state machine:
//!
//! ```text
//! Empty → Reserved → Writing → Ready → Reading → Empty
//! ```
//!
//! Region invariant: a producer's claimed region lies strictly between the
//! previous producer's end and the current reader's start, modulo the arena
//! size. Because a claimed slot publishes its region bounds before leaving
//! `Reserved`, the next producer can always learn where to start; it spins
//! briefly while its predecessor is still `Reserved`.
//!
//! A reservation that cannot find arena space publishes its slot as a
//! zero-length tombstone instead of un-claiming it, so the cursor sequence
//! stays dense; consumers skip tombstones transparently. The caller still
//! observes `RingFull` and the packet is dropped, as the contract requires.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::{hint, ptr, slice, thread};

use crossbeam_utils::CachePadded;
use thiserror::Error;

use crate::event::Event;

const EMPTY: u64 = 0;
const RESERVED: u64 = 1;
const WRITING: u64 = 2;
const READY: u64 = 3;
const READING: u64 = 4;

/// Spin iterations on a still-`Reserved` predecessor before yielding
const RESOLVE_SPINS: u32 = 20;

/// The ring cannot accept the packet right now; the caller drops or retries
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("packet ring full")]
pub(crate) struct RingFull;

struct Slot {
    status: AtomicU64,
    start: AtomicUsize,
    len: AtomicUsize,
    arrival_ms: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            status: AtomicU64::new(EMPTY),
            start: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
            arrival_ms: AtomicU64::new(0),
        }
    }
}

pub(crate) struct PacketRing {
    meta: Box<[Slot]>,
    data: Box<[UnsafeCell<u8>]>,
    write_cursor: CachePadded<AtomicU64>,
    read_cursor: CachePadded<AtomicU64>,
    /// Signaled whenever a slot is published
    packets_waiting: Event,
    /// Signaled whenever a slot is released
    space_freed: Event,
}

// SAFETY: all arena access is mediated by the slot status protocol. A region
// is written only by the producer holding its slot in Reserved/Writing and
// read only by the consumer holding it in Reading, and live regions never
// overlap.
unsafe impl Send for PacketRing {}
unsafe impl Sync for PacketRing {}

impl PacketRing {
    pub(crate) fn new(slots: usize, capacity: usize) -> Self {
        assert!(slots >= 2 && capacity > 0);
        Self {
            meta: (0..slots).map(|_| Slot::new()).collect(),
            data: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
            write_cursor: CachePadded::new(AtomicU64::new(0)),
            read_cursor: CachePadded::new(AtomicU64::new(0)),
            packets_waiting: Event::manual(),
            space_freed: Event::manual(),
        }
    }

    pub(crate) fn packets_waiting(&self) -> &Event {
        &self.packets_waiting
    }

    pub(crate) fn space_freed(&self) -> &Event {
        &self.space_freed
    }

    /// Claims a slot and an arena region for a `size`-byte packet
    pub(crate) fn reserve(&self, size: usize, arrival_ms: u64) -> Result<Reservation<'_>, RingFull> {
        assert!(size > 0 && size <= self.data.len());
        let n = self.meta.len() as u64;

        // Claim the first free slot at or after the write cursor. Slots
        // behind the cursor are never Empty (the release path clears status
        // before advancing the read cursor), so a successful claim of the
        // slot reached at walk position `seq` owns exactly sequence `seq`.
        let mut seq = self.write_cursor.load(Ordering::Acquire);
        let slot = loop {
            let read = self.read_cursor.load(Ordering::Acquire);
            if seq < read {
                // Stale cursor snapshot; never walk behind the reader.
                seq = read;
            }
            if seq - read >= n {
                return Err(RingFull);
            }
            let slot = &self.meta[(seq % n) as usize];
            match slot
                .status
                .compare_exchange(EMPTY, RESERVED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break slot,
                Err(_) => seq += 1,
            }
        };
        self.advance_write_cursor(seq + 1);

        // The predecessor's end becomes our start. While the predecessor is
        // still Reserved its bounds are unknown; its own predecessor chain
        // resolves strictly in sequence order, so this wait is short and
        // cannot cycle.
        let prev = &self.meta[((seq + n - 1) % n) as usize];
        let mut spins = 0;
        while prev.status.load(Ordering::Acquire) == RESERVED {
            spins += 1;
            if spins % RESOLVE_SPINS == 0 {
                thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }
        let prev_end = prev.start.load(Ordering::Acquire) + prev.len.load(Ordering::Acquire);

        let read = self.read_cursor.load(Ordering::Acquire);
        let head_start = if read == seq {
            None // no live regions to collide with
        } else {
            Some(self.meta[(read % n) as usize].start.load(Ordering::Acquire))
        };
        let start = match self.carve(prev_end, size, head_start) {
            Some(start) => start,
            None => {
                // Publish a tombstone so consumers can pass this sequence.
                slot.start.store(prev_end, Ordering::Relaxed);
                slot.len.store(0, Ordering::Relaxed);
                slot.arrival_ms.store(0, Ordering::Relaxed);
                slot.status.store(READY, Ordering::Release);
                self.packets_waiting.set();
                return Err(RingFull);
            }
        };

        slot.start.store(start, Ordering::Relaxed);
        slot.len.store(size, Ordering::Relaxed);
        slot.arrival_ms.store(arrival_ms, Ordering::Relaxed);
        slot.status.store(WRITING, Ordering::Release);
        Ok(Reservation {
            ring: self,
            seq,
            start,
            len: size,
            written: 0,
            published: false,
        })
    }

    /// Picks a start offset for a `size`-byte region beginning at the
    /// previous producer's end, or `None` if it would collide with the
    /// oldest live region
    fn carve(&self, prev_end: usize, size: usize, head_start: Option<usize>) -> Option<usize> {
        let capacity = self.data.len();
        let head = match head_start {
            None => {
                // Ring empty: anywhere fits, wrap only at the arena edge.
                return Some(if prev_end + size <= capacity { prev_end } else { 0 });
            }
            Some(head) => head,
        };
        if prev_end > head {
            // Live bytes occupy [head, prev_end).
            if prev_end + size <= capacity {
                Some(prev_end)
            } else if size <= head {
                Some(0)
            } else {
                None
            }
        } else {
            // Wrapped: live bytes occupy [head, capacity) and [0, prev_end).
            if prev_end + size <= head {
                Some(prev_end)
            } else {
                None
            }
        }
    }

    fn advance_write_cursor(&self, to: u64) {
        let mut cur = self.write_cursor.load(Ordering::Relaxed);
        while cur < to {
            match self.write_cursor.compare_exchange_weak(
                cur,
                to,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Reserve-write-publish in one step
    pub(crate) fn push(&self, bytes: &[u8], arrival_ms: u64) -> Result<(), RingFull> {
        let mut reservation = self.reserve(bytes.len(), arrival_ms)?;
        reservation.write(bytes);
        reservation.publish();
        Ok(())
    }

    /// Takes the packet at the head of the ring, if one is published
    pub(crate) fn try_take(&self) -> TakeResult<'_> {
        self.try_take_due(u64::MAX)
    }

    /// Takes the head packet only if its arrival stamp is due
    ///
    /// Arrival stamps are monotone in publication order on every ring the
    /// simulator builds, so gating the head is gating the earliest.
    pub(crate) fn try_take_due(&self, now_ms: u64) -> TakeResult<'_> {
        let n = self.meta.len() as u64;
        loop {
            let seq = self.read_cursor.load(Ordering::Acquire);
            if seq == self.write_cursor.load(Ordering::Acquire) {
                return TakeResult::Empty;
            }
            let slot = &self.meta[(seq % n) as usize];
            if slot.status.load(Ordering::Acquire) != READY {
                // Head is still being written, or another consumer owns it.
                return TakeResult::Empty;
            }
            let arrival_ms = slot.arrival_ms.load(Ordering::Acquire);
            if arrival_ms > now_ms {
                return TakeResult::NotDue(arrival_ms);
            }
            if slot
                .status
                .compare_exchange(READY, READING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return TakeResult::Empty;
            }
            if self.read_cursor.load(Ordering::Acquire) != seq {
                // The head moved under us and this Ready belongs to a newer
                // lap of the slot; put it back and retry.
                slot.status.store(READY, Ordering::Release);
                continue;
            }
            let len = slot.len.load(Ordering::Acquire);
            if len == 0 {
                self.release(seq, slot);
                continue; // tombstone from a rejected reservation
            }
            return TakeResult::Taken(TakenPacket {
                ring: self,
                seq,
                start: slot.start.load(Ordering::Acquire),
                len,
            });
        }
    }

    fn release(&self, seq: u64, slot: &Slot) {
        // Clearing status before advancing the cursor keeps the claim-walk
        // invariant: a producer that passes the fullness check never finds
        // the previous occupant still in the slot.
        slot.status.store(EMPTY, Ordering::Release);
        let advanced = self
            .read_cursor
            .compare_exchange(seq, seq + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        debug_assert!(advanced, "release raced another owner of the same slot");
        self.space_freed.set();
    }

    fn copy_in(&self, start: usize, offset: usize, bytes: &[u8]) {
        let base = self.data.as_ptr() as *mut u8;
        // SAFETY: the caller holds the slot in Reserved/Writing, giving it
        // exclusive access to [start, start + len), and `carve` guarantees
        // the region is in bounds and disjoint from all live regions.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(start + offset), bytes.len());
        }
    }

    fn copy_out(&self, start: usize, len: usize, out: &mut Vec<u8>) {
        out.clear();
        let base = self.data.as_ptr() as *const u8;
        // SAFETY: the caller holds the slot in Reading, so no producer can
        // touch [start, start + len) until it is released.
        out.extend_from_slice(unsafe { slice::from_raw_parts(base.add(start), len) });
    }
}

/// Outcome of a take attempt
pub(crate) enum TakeResult<'a> {
    Taken(TakenPacket<'a>),
    /// The head packet has not yet arrived; its stamp is returned
    NotDue(u64),
    Empty,
}

/// A claimed slot whose region the producer is filling
pub(crate) struct Reservation<'a> {
    ring: &'a PacketRing,
    seq: u64,
    start: usize,
    len: usize,
    written: usize,
    published: bool,
}

impl Reservation<'_> {
    /// Appends bytes to the claimed region; the total must reach exactly
    /// the reserved size before publishing
    pub(crate) fn write(&mut self, bytes: &[u8]) {
        assert!(self.written + bytes.len() <= self.len);
        self.ring.copy_in(self.start, self.written, bytes);
        self.written += bytes.len();
    }

    pub(crate) fn publish(mut self) {
        assert_eq!(self.written, self.len);
        self.published = true;
        let n = self.ring.meta.len() as u64;
        let slot = &self.ring.meta[(self.seq % n) as usize];
        slot.status.store(READY, Ordering::Release);
        self.ring.packets_waiting.set();
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        // An abandoned reservation must still occupy its sequence or the
        // ring wedges. Publish whatever is there; the garbage fails to
        // decode downstream and is discarded like any damaged packet.
        let n = self.ring.meta.len() as u64;
        let slot = &self.ring.meta[(self.seq % n) as usize];
        slot.status.store(READY, Ordering::Release);
        self.ring.packets_waiting.set();
    }
}

/// A taken packet; dropping it releases the slot and its region
pub(crate) struct TakenPacket<'a> {
    ring: &'a PacketRing,
    seq: u64,
    start: usize,
    len: usize,
}

impl TakenPacket<'_> {
    /// Copies the packet bytes out, replacing the contents of `out`
    pub(crate) fn read_into(&self, out: &mut Vec<u8>) {
        self.ring.copy_out(self.start, self.len, out);
    }
}

impl Drop for TakenPacket<'_> {
    fn drop(&mut self) {
        let n = self.ring.meta.len() as u64;
        self.ring.release(self.seq, &self.ring.meta[(self.seq % n) as usize]);
    }
}
