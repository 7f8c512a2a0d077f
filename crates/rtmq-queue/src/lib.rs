use std::{cell::UnsafeCell, collections::VecDeque};

use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueError {
    #[error("queue capacity must be non-zero")]
    ZeroCapacity,
    #[error("payload of {len} bytes exceeds slot capacity {cap}")]
    PayloadTooLarge { len: usize, cap: usize },
}

/// In-memory routing record prefixing every queued payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForwardHeader {
    pub msg_type: u16,
    pub orig: u32,
    pub dest: u32,
    pub length: u32,
}

struct Slot {
    fwd: ForwardHeader,
    buf: Box<[u8]>,
}

/// Owned reference to one reserved slot.
///
/// Whoever holds the handle is the slot's only accessor: a producer from
/// `reserve` until `push`, a consumer from `pop` until `release`. The handle
/// is deliberately neither `Copy` nor `Clone`. Dropping it without `push` or
/// `release` leaks the slot for the queue's lifetime.
pub struct MsgSlot {
    idx: u32,
}

/// Fixed-slot bounded queue with pre-allocated payload storage.
///
/// All memory is allocated up front: `max` slots of `size` payload bytes
/// each. `reserve`/`push`/`pop`/`release` are non-blocking and never
/// allocate. When every slot is reserved or in flight, `reserve` returns
/// `None` and the caller drops at source, accounting the loss itself.
#[derive(Debug)]
pub struct SlabQueue {
    slots: Box<[UnsafeCell<Slot>]>,
    free: spin::Mutex<Vec<u32>>,
    ready: spin::Mutex<VecDeque<u32>>,
    payload_cap: usize,
}

// Safety: a slot index lives in exactly one place at any instant (the free
// list, the ready list, or a single MsgSlot handle), so the UnsafeCell behind
// it has one accessor at a time. The lists themselves are spin-locked.
unsafe impl Send for SlabQueue {}
unsafe impl Sync for SlabQueue {}

impl SlabQueue {
    pub fn with_capacity(max: usize, size: usize) -> Result<Self, QueueError> {
        if max == 0 || size == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        let slots = (0..max)
            .map(|_| {
                UnsafeCell::new(Slot {
                    fwd: ForwardHeader::default(),
                    buf: vec![0u8; size].into_boxed_slice(),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // LIFO free list keeps recently touched slots warm.
        let free = (0..max as u32).rev().collect();
        Ok(Self {
            slots,
            free: spin::Mutex::new(free),
            ready: spin::Mutex::new(VecDeque::with_capacity(max)),
            payload_cap: size,
        })
    }

    /// Takes a free slot, or `None` when the slab is exhausted.
    #[inline]
    pub fn reserve(&self) -> Option<MsgSlot> {
        self.free.lock().pop().map(|idx| MsgSlot { idx })
    }

    /// Copies `fwd` and `payload` into the reserved slot.
    #[inline]
    pub fn fill(
        &self,
        slot: &mut MsgSlot,
        fwd: ForwardHeader,
        payload: &[u8],
    ) -> Result<(), QueueError> {
        if payload.len() > self.payload_cap {
            return Err(QueueError::PayloadTooLarge { len: payload.len(), cap: self.payload_cap });
        }
        debug_assert_eq!(fwd.length as usize, payload.len());
        let s = self.slot_mut(slot);
        s.fwd = fwd;
        s.buf[..payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Enqueues a filled slot. O(1); hands the slot back if the ring is full.
    #[inline]
    pub fn push(&self, slot: MsgSlot) -> Result<(), MsgSlot> {
        let mut ready = self.ready.lock();
        if ready.len() == self.slots.len() {
            return Err(slot);
        }
        ready.push_back(slot.idx);
        Ok(())
    }

    /// Dequeues the oldest slot, or `None` when empty. Non-blocking.
    #[inline]
    pub fn pop(&self) -> Option<MsgSlot> {
        self.ready.lock().pop_front().map(|idx| MsgSlot { idx })
    }

    /// Reads the forwarding header and payload of a popped slot.
    #[inline]
    pub fn view(&self, slot: &MsgSlot) -> (ForwardHeader, &[u8]) {
        // Safety: shared access through the unique handle, see type comment.
        let s = unsafe { &*self.slots[slot.idx as usize].get() };
        (s.fwd, &s.buf[..s.fwd.length as usize])
    }

    /// Returns a slot to the free list.
    #[inline]
    pub fn release(&self, slot: MsgSlot) {
        self.free.lock().push(slot.idx);
    }

    #[inline]
    pub fn free_slots(&self) -> usize {
        self.free.lock().len()
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.ready.lock().len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn payload_cap(&self) -> usize {
        self.payload_cap
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn slot_mut(&self, slot: &MsgSlot) -> &mut Slot {
        // Safety: exclusive access through the unique handle, see type comment.
        unsafe { &mut *self.slots[slot.idx as usize].get() }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn enqueue(q: &SlabQueue, fwd: ForwardHeader, payload: &[u8]) -> bool {
        let Some(mut slot) = q.reserve() else {
            return false;
        };
        q.fill(&mut slot, fwd, payload).unwrap();
        match q.push(slot) {
            Ok(()) => true,
            Err(slot) => {
                q.release(slot);
                false
            }
        }
    }

    #[test]
    fn fifo_and_accounting() {
        let q = SlabQueue::with_capacity(8, 64).unwrap();
        for i in 0..5u32 {
            let fwd = ForwardHeader { msg_type: 7, orig: i, dest: 0, length: 4 };
            assert!(enqueue(&q, fwd, &i.to_be_bytes()));
        }
        assert_eq!(q.pending(), 5);
        assert_eq!(q.free_slots(), 3);

        for i in 0..5u32 {
            let slot = q.pop().unwrap();
            let (fwd, body) = q.view(&slot);
            assert_eq!(fwd.orig, i);
            assert_eq!(body, i.to_be_bytes());
            q.release(slot);
        }
        assert!(q.pop().is_none());
        // Every push was matched by a pop+release: storage is back to initial.
        assert_eq!(q.free_slots(), q.capacity());
    }

    #[test]
    fn reserve_exhaustion() {
        let q = SlabQueue::with_capacity(2, 16).unwrap();
        let a = q.reserve().unwrap();
        let b = q.reserve().unwrap();
        assert!(q.reserve().is_none());
        q.release(a);
        q.release(b);
        assert_eq!(q.free_slots(), 2);
    }

    #[test]
    fn single_slot_still_delivers() {
        let q = SlabQueue::with_capacity(1, 16).unwrap();
        for round in 0..100u32 {
            let fwd = ForwardHeader { msg_type: 1, orig: round, dest: 0, length: 4 };
            assert!(enqueue(&q, fwd, &round.to_be_bytes()));
            // A second producer in the same window drops at source.
            assert!(q.reserve().is_none());
            let slot = q.pop().unwrap();
            assert_eq!(q.view(&slot).0.orig, round);
            q.release(slot);
        }
        assert_eq!(q.free_slots(), 1);
    }

    #[test]
    fn payload_too_large() {
        let q = SlabQueue::with_capacity(2, 8).unwrap();
        let mut slot = q.reserve().unwrap();
        let fwd = ForwardHeader { msg_type: 1, orig: 1, dest: 0, length: 16 };
        assert_eq!(
            q.fill(&mut slot, fwd, &[0u8; 16]),
            Err(QueueError::PayloadTooLarge { len: 16, cap: 8 })
        );
        q.release(slot);
    }

    #[test]
    fn zero_capacity_rejected() {
        assert_eq!(SlabQueue::with_capacity(0, 64).unwrap_err(), QueueError::ZeroCapacity);
        assert_eq!(SlabQueue::with_capacity(64, 0).unwrap_err(), QueueError::ZeroCapacity);
    }

    #[test]
    fn multithread_mpsc() {
        use std::sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        };

        let q = Arc::new(SlabQueue::with_capacity(64, 16).unwrap());
        let done = Arc::new(AtomicBool::new(false));
        let n_producers = 4usize;
        let per_producer = 10_000u32;

        let mut producers = Vec::new();
        for p in 0..n_producers {
            let q = Arc::clone(&q);
            producers.push(std::thread::spawn(move || {
                let mut sent = 0u64;
                for i in 0..per_producer {
                    let fwd = ForwardHeader { msg_type: p as u16, orig: i, dest: 0, length: 4 };
                    if enqueue(&q, fwd, &i.to_be_bytes()) {
                        sent += 1;
                    }
                    std::thread::yield_now();
                }
                sent
            }));
        }

        let consumer = {
            let q = Arc::clone(&q);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut last_seen = vec![None::<u32>; 4];
                let mut got = 0u64;
                loop {
                    match q.pop() {
                        Some(slot) => {
                            let (fwd, _) = q.view(&slot);
                            // Per-producer FIFO holds even with drops in between.
                            if let Some(prev) = last_seen[fwd.msg_type as usize] {
                                assert!(fwd.orig > prev);
                            }
                            last_seen[fwd.msg_type as usize] = Some(fwd.orig);
                            q.release(slot);
                            got += 1;
                        }
                        None if done.load(Ordering::Acquire) => break,
                        None => std::thread::yield_now(),
                    }
                }
                got
            })
        };

        let sent: u64 = producers.into_iter().map(|h| h.join().unwrap()).sum();
        done.store(true, Ordering::Release);
        let got = consumer.join().unwrap();

        // Every successful push is seen exactly once and the slab balances.
        assert_eq!(got, sent);
        assert_eq!(q.free_slots(), q.capacity());
    }
}
