use super::sync::{Ordering, AtomicI64, AtomicPtr, AtomicU64};
use super::context::Context;
use super::finish::{self, FinishScope};
use crate::directory::{Guid, Object};
use crate::error::{Error, Result};

use log::{debug, trace, warn};

/// Slot of a latch that decrements its counter.
pub const LATCH_DECR_SLOT: u32 = 0;
/// Slot of a latch that increments its counter.
pub const LATCH_INCR_SLOT: u32 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Single assignment, destroyed once it has delivered its value.
    Once,
    /// Single assignment, further satisfactions are ignored.
    Idem,
    /// Single assignment, satisfying it twice is an error.
    Sticky,
    /// Counter that fires when it gets back to zero.
    Latch,
    /// Internal latch backing a finish scope.
    FinishLatch,
}

impl EventKind {
    pub fn is_single_assignment(self) -> bool {
        matches!(self, EventKind::Once | EventKind::Idem | EventKind::Sticky)
    }
}

/// Something to notify when an event fires: a task dependency slot, or an
/// event (and the slot to satisfy it on).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Waiter {
    pub guid: Guid,
    pub slot: u32,
}

/// A future value or a synchronization signal.
///
/// Single-assignment events (once, idem, sticky) hold a data guid that goes from
/// unset to a value exactly once. Latches hold a counter and fire the first time
/// it gets back to zero.
///
/// Registration and satisfaction race freely: the waiter list is sealed by the
/// satisfying thread after the data is written, and a registration that finds
/// the list sealed signals its waiter on the spot with the committed data. Either
/// way each waiter is signaled exactly once.
pub struct Event {
    guid: Guid,
    kind: EventKind,
    // Guid bits, `Guid::UNSET_BITS` until satisfied.
    data: AtomicU64,
    waiters: WaiterList,
    // Latches: the count. Once events: the number of outstanding references, one
    // for the pending satisfaction plus one per task slot bound to the event.
    counter: AtomicI64,
    finish: Option<FinishScope>,
}

impl Event {
    pub(crate) fn new(guid: Guid, kind: EventKind) -> Self {
        debug_assert!(kind != EventKind::FinishLatch);
        let counter = if kind == EventKind::Once { 1 } else { 0 };

        Event {
            guid,
            kind,
            data: AtomicU64::new(Guid::UNSET_BITS),
            waiters: WaiterList::new(),
            counter: AtomicI64::new(counter),
            finish: None,
        }
    }

    pub(crate) fn new_finish_latch(guid: Guid, scope: FinishScope) -> Self {
        Event {
            guid,
            kind: EventKind::FinishLatch,
            data: AtomicU64::new(Guid::UNSET_BITS),
            waiters: WaiterList::new(),
            counter: AtomicI64::new(0),
            finish: Some(scope),
        }
    }

    #[inline]
    pub fn guid(&self) -> Guid { self.guid }

    #[inline]
    pub fn kind(&self) -> EventKind { self.kind }

    pub(crate) fn finish_scope(&self) -> Option<&FinishScope> {
        self.finish.as_ref()
    }

    /// The latch counter. Meaningless for single-assignment events.
    pub fn count(&self) -> i64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Current value of the event.
    ///
    /// Single-assignment events return their data once satisfied. Latches return
    /// the null guid once they have fired.
    pub fn get(&self) -> Result<Guid> {
        match self.kind {
            EventKind::Latch | EventKind::FinishLatch => {
                if self.waiters.is_sealed() {
                    Ok(Guid::NULL)
                } else {
                    Err(Error::Unset(self.guid))
                }
            }
            _ => match self.data.load(Ordering::Acquire) {
                Guid::UNSET_BITS => Err(Error::Unset(self.guid)),
                bits => Ok(Guid::from_bits(bits)),
            },
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.get().is_ok()
    }

    /// Have `waiter` signaled when this event is satisfied, or right away if it
    /// already is.
    pub(crate) fn register_waiter(&self, ctx: &mut Context, waiter: Waiter) {
        assert!(
            self.kind != EventKind::FinishLatch,
            "finish latch {:?} does not accept waiters after creation",
            self.guid,
        );

        match self.waiters.push(waiter) {
            Ok(()) => {
                trace!("{:?} waits on {:?} slot {}", waiter.guid, self.guid, waiter.slot);
            }
            Err(waiter) => {
                // Sealed, the data was committed before the seal.
                let data = self.committed_data();
                signal_waiter(ctx, waiter, data);
            }
        }
    }

    fn committed_data(&self) -> Guid {
        match self.kind {
            EventKind::Latch | EventKind::FinishLatch => Guid::NULL,
            _ => {
                let bits = self.data.load(Ordering::Acquire);
                debug_assert!(bits != Guid::UNSET_BITS);
                Guid::from_bits(bits)
            }
        }
    }

    pub(crate) fn satisfy(&self, ctx: &mut Context, data: Guid, slot: u32) {
        profiling::scope!("satisfy");
        match self.kind {
            EventKind::Latch | EventKind::FinishLatch => self.satisfy_latch(ctx, slot),
            _ => self.satisfy_single(ctx, data),
        }
    }

    fn satisfy_single(&self, ctx: &mut Context, data: Guid) {
        let first = self.data
            .compare_exchange(Guid::UNSET_BITS, data.to_bits(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if !first {
            match self.kind {
                EventKind::Sticky => panic!("sticky event {:?} satisfied twice", self.guid),
                _ => {
                    debug!("ignoring extra satisfaction of {:?} event {:?}", self.kind, self.guid);
                    return;
                }
            }
        }

        debug!("satisfy {:?} event {:?} with {:?}", self.kind, self.guid, data);

        if let Some(waiters) = self.waiters.seal() {
            for waiter in waiters {
                signal_waiter(ctx, waiter, data);
            }
        }

        if self.kind == EventKind::Once {
            self.release_once_ref(ctx);
        }
    }

    fn satisfy_latch(&self, ctx: &mut Context, slot: u32) {
        let delta = match slot {
            LATCH_INCR_SLOT => 1,
            LATCH_DECR_SLOT => -1,
            _ => panic!("invalid slot {} for latch {:?}", slot, self.guid),
        };

        let count = self.counter.fetch_add(delta, Ordering::AcqRel) + delta;
        trace!("{:?} {:?} {} -> {}", self.kind, self.guid, if delta > 0 { "incr" } else { "decr" }, count);
        // Plain latches may dip below zero, finish scopes check in before checking out.
        debug_assert!(
            count >= 0 || self.kind == EventKind::Latch,
            "finish latch {:?} decremented below zero", self.guid,
        );

        if count != 0 {
            return;
        }

        debug!("{:?} {:?} reached zero", self.kind, self.guid);

        // Finish latches never have waiters, sealing only marks them as done.
        if let Some(waiters) = self.waiters.seal() {
            for waiter in waiters {
                signal_waiter(ctx, waiter, Guid::NULL);
            }
        }

        if let Some(scope) = &self.finish {
            finish::scope_completed(ctx, self.guid, scope);
        }
    }

    /// Take a reference on a once event on behalf of a task slot bound to it.
    ///
    /// Fails if the event has already delivered its value and been released.
    pub(crate) fn acquire_once_ref(&self) -> bool {
        debug_assert_eq!(self.kind, EventKind::Once);
        let mut count = self.counter.load(Ordering::Acquire);
        loop {
            if count == 0 {
                return false;
            }
            match self.counter.compare_exchange_weak(count, count + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(current) => count = current,
            }
        }
    }

    pub(crate) fn release_once_ref(&self, ctx: &mut Context) {
        debug_assert_eq!(self.kind, EventKind::Once);
        let count = self.counter.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(count >= 0);
        if count == 0 {
            debug!("destroy once event {:?}", self.guid);
            ctx.directory().release(self.guid);
        }
    }
}

/// Dispatch a signal to whatever `waiter` names.
///
/// A waiter destroyed after registering (a task destroyed before running, a once
/// event that already delivered its value) no longer listens: the signal is dropped.
pub(crate) fn signal_waiter(ctx: &mut Context, waiter: Waiter, data: Guid) {
    let object = match ctx.directory().resolve(waiter.guid) {
        Ok(object) => object,
        Err(_) => {
            debug!("dropping signal for slot {} of destroyed {:?}", waiter.slot, waiter.guid);
            return;
        }
    };

    match object {
        Object::Event(event) => event.satisfy(ctx, data, waiter.slot),
        Object::Task(task) => task.signaled(ctx, data, waiter.slot),
        Object::Data(_) => panic!("data block {:?} cannot wait on anything", waiter.guid),
    }
}

// Marks a sealed list. Never a valid node address since nodes are 8-byte aligned.
const SEALED: *mut Node = usize::MAX as *mut Node;

struct Node {
    waiter: Waiter,
    next: *mut Node,
}

/// A lock-free stack of waiters that can be sealed exactly once.
///
/// Nodes are immutable once linked: pushers build a node completely before
/// publishing it with a CAS on the head, and sealing swaps the head for `SEALED`,
/// which hands the whole chain to the sealing thread.
pub(crate) struct WaiterList {
    head: AtomicPtr<Node>,
}

impl WaiterList {
    pub fn new() -> Self {
        WaiterList {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.head.load(Ordering::Acquire) == SEALED
    }

    /// Hands the waiter back if the list is sealed.
    pub fn push(&self, waiter: Waiter) -> std::result::Result<(), Waiter> {
        let mut head = self.head.load(Ordering::Acquire);
        if head == SEALED {
            return Err(waiter);
        }

        let node = Box::into_raw(Box::new(Node { waiter, next: head }));

        loop {
            match self.head.compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(current) if current == SEALED => {
                    // Sealed under our feet, the node was never published.
                    let node = unsafe { Box::from_raw(node) };
                    return Err(node.waiter);
                }
                Err(current) => {
                    head = current;
                    unsafe { (*node).next = head; }
                }
            }
        }
    }

    /// Seal the list and return the waiters in registration order.
    ///
    /// Returns `None` if the list was already sealed.
    pub fn seal(&self) -> Option<Vec<Waiter>> {
        let head = self.head.swap(SEALED, Ordering::AcqRel);
        if head == SEALED {
            return None;
        }

        let mut waiters = unsafe { Self::drain(head) };
        waiters.reverse();

        Some(waiters)
    }

    // Safety: the caller must own the chain starting at `node`.
    unsafe fn drain(mut node: *mut Node) -> Vec<Waiter> {
        let mut waiters = Vec::new();
        while !node.is_null() {
            let boxed = Box::from_raw(node);
            waiters.push(boxed.waiter);
            node = boxed.next;
        }

        waiters
    }
}

impl Drop for WaiterList {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Acquire);
        if head == SEALED || head.is_null() {
            return;
        }

        let waiters = unsafe { Self::drain(head) };
        warn!("event destroyed with {} waiter(s) never signaled: {:?}", waiters.len(), waiters);
    }
}

unsafe impl Send for WaiterList {}
unsafe impl Sync for WaiterList {}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn push_seal_race() {
        loom::model(|| {
            let list = Arc::new(WaiterList::new());
            let w = Waiter { guid: Guid::from_bits((1 << 32) | 1), slot: 0 };

            let pusher = {
                let list = Arc::clone(&list);
                thread::spawn(move || list.push(w).is_ok())
            };

            let sealed = list.seal().unwrap();
            let linked = pusher.join().unwrap();

            assert_eq!(sealed.len(), if linked { 1 } else { 0 });
        });
    }
}
