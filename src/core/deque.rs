//! A fixed-capacity Chase-Lev work-stealing deque of task handles.
//!
//! The owner pushes and pops at the tail, thieves steal from the head. `tail` is
//! only ever written by the owner, `head` is advanced by whoever wins a CAS on it
//! (any thief, or the owner when it competes for the last item).
//!
//! The buffer never grows: pushing into a full deque fails. Slots hold the raw
//! bits of a `Guid` in an atomic so that a thief reading a slot the owner is
//! concurrently recycling observes a stale value (and then loses the CAS) rather
//! than racing on plain memory.

use crate::directory::Guid;
use crate::error::{Error, Result};
use crate::sync::{AtomicI64, AtomicU64, Ordering, fence};

use crossbeam_utils::CachePadded;

pub struct Deque {
    head: CachePadded<AtomicI64>,
    tail: CachePadded<AtomicI64>,
    buffer: Box<[AtomicU64]>,
}

impl Deque {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "deque capacity must be non-zero");

        Deque {
            head: CachePadded::new(AtomicI64::new(0)),
            tail: CachePadded::new(AtomicI64::new(0)),
            buffer: (0..capacity).map(|_| AtomicU64::new(Guid::NULL.to_bits())).collect(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize { self.buffer.len() }

    /// Approximate number of items, exact when called by the owner with no
    /// concurrent thief.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        (tail - head).max(0) as usize
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    #[inline]
    fn slot(&self, index: i64) -> &AtomicU64 {
        debug_assert!(index >= 0);
        &self.buffer[index as usize % self.buffer.len()]
    }

    /// Owner only.
    pub fn push(&self, task: Guid) -> Result<()> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail - head >= self.buffer.len() as i64 {
            return Err(Error::DequeFull { capacity: self.buffer.len() });
        }

        self.slot(tail).store(task.to_bits(), Ordering::Relaxed);
        // Publish the slot before the new tail.
        fence(Ordering::Release);
        self.tail.store(tail + 1, Ordering::Relaxed);

        Ok(())
    }

    /// Owner only. Takes the most recently pushed item.
    pub fn pop(&self) -> Option<Guid> {
        let tail = self.tail.load(Ordering::Relaxed) - 1;
        self.tail.store(tail, Ordering::Relaxed);
        // The tail decrement must be visible to thieves before we look at head.
        fence(Ordering::SeqCst);
        let head = self.head.load(Ordering::Relaxed);

        if tail < head {
            // Already empty, or emptied by a thief in the mean time.
            self.tail.store(head, Ordering::Relaxed);
            return None;
        }

        let task = Guid::from_bits(self.slot(tail).load(Ordering::Relaxed));

        if tail > head {
            return Some(task);
        }

        // Exactly one item left: whoever moves head first gets it.
        let won = self.head
            .compare_exchange(head, head + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.tail.store(head + 1, Ordering::Relaxed);

        if won { Some(task) } else { None }
    }

    /// Any thread. Takes the oldest item.
    ///
    /// Returns `None` both when the deque is empty and when another thread won the
    /// race for the head item, the caller moves on to its next victim either way.
    pub fn steal(&self) -> Option<Guid> {
        let head = self.head.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::Acquire);

        if tail - head <= 0 {
            return None;
        }

        let bits = self.slot(head).load(Ordering::Relaxed);

        if self.head
            .compare_exchange(head, head + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        Some(Guid::from_bits(bits))
    }
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn pop_steal_race() {
        loom::model(|| {
            let deque = Arc::new(Deque::with_capacity(2));
            let task = Guid::from_bits((1 << 32) | 1);
            deque.push(task).unwrap();

            let thief = {
                let deque = Arc::clone(&deque);
                thread::spawn(move || deque.steal())
            };

            let popped = deque.pop();
            let stolen = thief.join().unwrap();

            assert!(popped.is_some() ^ stolen.is_some());
        });
    }
}
