use super::deque::Deque;
use crate::directory::Guid;
use crate::error::Result;
use crate::util::ExclusiveCheck;

use crossbeam_utils::CachePadded;
use log::trace;

// How many times we try to steal from a victim that still has work before moving
// on to the next one.
const STEAL_ATTEMPTS: u32 = 50;

/// The task container of one context.
///
/// Only the owning context pushes and pops, any context can steal.
pub struct Workpile {
    deque: Deque,
    owner: ExclusiveCheck<u32>,
}

impl Workpile {
    pub fn new(owner: u32, capacity: usize) -> Self {
        Workpile {
            deque: Deque::with_capacity(capacity),
            owner: ExclusiveCheck::with_tag(owner),
        }
    }

    #[inline]
    fn owner_op<R>(&self, op: impl FnOnce(&Deque) -> R) -> R {
        if cfg!(debug_assertions) {
            self.owner.run(|| op(&self.deque))
        } else {
            op(&self.deque)
        }
    }

    pub fn push(&self, task: Guid) -> Result<()> {
        self.owner_op(|deque| deque.push(task))
    }

    pub fn pop(&self) -> Option<Guid> {
        self.owner_op(|deque| deque.pop())
    }

    pub fn steal(&self) -> Option<Guid> {
        self.deque.steal()
    }

    pub fn len(&self) -> usize { self.deque.len() }

    pub fn is_empty(&self) -> bool { self.deque.is_empty() }

    pub fn capacity(&self) -> usize { self.deque.capacity() }
}

/// Maps contexts to workpiles.
///
/// Every context, worker or not, owns the workpile at its own index. Tasks are
/// always given to the workpile of the context that made them ready and
/// redistributed by stealing.
pub struct Scheduler {
    workpiles: Box<[CachePadded<Workpile>]>,
}

impl Scheduler {
    pub fn new(num_workpiles: usize, capacity: usize) -> Self {
        Scheduler {
            workpiles: (0..num_workpiles)
                .map(|id| CachePadded::new(Workpile::new(id as u32, capacity)))
                .collect(),
        }
    }

    pub fn num_workpiles(&self) -> usize { self.workpiles.len() }

    pub fn workpile(&self, id: u32) -> &Workpile {
        &self.workpiles[id as usize]
    }

    /// Pop from our own workpile, or steal from the others.
    pub fn take(&self, worker_id: u32) -> Option<Guid> {
        profiling::scope!("take");

        if let Some(task) = self.workpile(worker_id).pop() {
            return Some(task);
        }

        self.steal(worker_id)
    }

    /// Visit every other workpile once, starting after our own.
    pub fn steal(&self, thief: u32) -> Option<Guid> {
        let n = self.workpiles.len() as u32;
        for i in 1..n {
            let victim = (thief + i) % n;
            let workpile = self.workpile(victim);

            for _ in 0..STEAL_ATTEMPTS {
                if workpile.is_empty() {
                    break;
                }

                if let Some(task) = workpile.steal() {
                    trace!("context #{} stole {:?} from #{}", thief, task, victim);
                    return Some(task);
                }
            }
        }

        None
    }

    pub fn give(&self, worker_id: u32, task: Guid) -> Result<()> {
        profiling::scope!("give");
        self.workpile(worker_id).push(task)
    }

    /// Whether any workpile may have something to take.
    pub fn has_work(&self) -> bool {
        self.workpiles.iter().any(|workpile| !workpile.is_empty())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn g(n: u64) -> Guid { Guid::from_bits((1 << 32) | n) }

    #[test]
    fn take_prefers_own_workpile() {
        let scheduler = Scheduler::new(3, 16);
        scheduler.give(0, g(1)).unwrap();
        scheduler.give(0, g(2)).unwrap();
        scheduler.give(1, g(10)).unwrap();

        assert_eq!(scheduler.take(0), Some(g(2)));
        assert_eq!(scheduler.take(0), Some(g(1)));
        // Own workpile is empty, steal from #1.
        assert_eq!(scheduler.take(0), Some(g(10)));
        assert_eq!(scheduler.take(0), None);
        assert!(!scheduler.has_work());
    }

    #[test]
    fn steal_rotation_starts_after_thief() {
        let scheduler = Scheduler::new(4, 16);
        scheduler.give(0, g(0)).unwrap();
        scheduler.give(1, g(1)).unwrap();
        scheduler.give(3, g(3)).unwrap();

        // #2 visits 3, 0, 1.
        assert_eq!(scheduler.take(2), Some(g(3)));
        assert_eq!(scheduler.take(2), Some(g(0)));
        assert_eq!(scheduler.take(2), Some(g(1)));
        assert_eq!(scheduler.take(2), None);
    }

    #[test]
    fn never_steals_from_itself() {
        let scheduler = Scheduler::new(1, 4);
        assert_eq!(scheduler.steal(0), None);
        scheduler.give(0, g(1)).unwrap();
        assert_eq!(scheduler.steal(0), None);
        assert_eq!(scheduler.take(0), Some(g(1)));
    }

    #[test]
    fn give_reports_overflow() {
        let scheduler = Scheduler::new(2, 2);
        scheduler.give(1, g(1)).unwrap();
        scheduler.give(1, g(2)).unwrap();
        assert_eq!(scheduler.give(1, g(3)), Err(Error::DequeFull { capacity: 2 }));
        // Other workpiles are unaffected.
        scheduler.give(0, g(4)).unwrap();
    }

    #[test]
    fn takers_share_one_producer() {
        const N: u64 = 10_000;
        let scheduler = Arc::new(Scheduler::new(4, N as usize));
        let seen: Arc<Vec<AtomicUsize>> = Arc::new((0..=N).map(|_| AtomicUsize::new(0)).collect());
        let done = Arc::new(AtomicUsize::new(0));

        let mut takers = Vec::new();
        for id in 1..4 {
            let scheduler = Arc::clone(&scheduler);
            let seen = Arc::clone(&seen);
            let done = Arc::clone(&done);
            takers.push(thread::spawn(move || {
                loop {
                    match scheduler.take(id) {
                        Some(task) => { seen[task.index() as usize].fetch_add(1, Ordering::Relaxed); }
                        None if done.load(Ordering::Acquire) == 1 && !scheduler.has_work() => break,
                        None => thread::yield_now(),
                    }
                }
            }));
        }

        for i in 1..=N {
            scheduler.give(0, g(i)).unwrap();
        }
        while let Some(task) = scheduler.take(0) {
            seen[task.index() as usize].fetch_add(1, Ordering::Relaxed);
        }
        done.store(1, Ordering::Release);

        for taker in takers {
            taker.join().unwrap();
        }

        for i in 1..=N as usize {
            assert_eq!(seen[i].load(Ordering::Relaxed), 1, "task {}", i);
        }
    }
}
