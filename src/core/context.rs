use crate::sync::{Mutex, Arc, thread};

use crossbeam_utils::Backoff;
use log::debug;

use super::Shared;
use super::event::{self, Event, EventKind, Waiter, LATCH_INCR_SLOT};
use super::runtime::{Runtime, RuntimeId};
use super::task::{self, Task, TaskBuilder, TaskTemplate};
use crate::data::DataBlock;
use crate::directory::{Directory, Guid, Object, ObjectKind};
use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) u32);

impl ContextId {
    pub fn index(&self) -> usize { self.0 as usize }
}

/// The main entry point for creating events and tasks and for processing work.
///
/// Each worker thread runs its own context, external threads borrow one from
/// the runtime with `Runtime::pop_context`. A context owns the workpile at its
/// index: tasks it creates or makes ready go there.
pub struct Context {
    id: u32,
    is_worker: bool,
    pub(crate) current_task: Option<Arc<Task>>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) stats: Stats,
}

impl Context {
    // Get some stats for debugging purposes.
    pub fn stats(&self) -> &Stats { &self.stats }

    pub fn id(&self) -> ContextId { ContextId(self.id) }

    pub fn runtime_id(&self) -> RuntimeId {
        self.shared.id
    }

    pub fn is_worker_thread(&self) -> bool {
        self.is_worker
    }

    pub fn num_worker_threads(&self) -> u32 { self.shared.num_workers }

    /// Returns the total number of contexts, including worker threads.
    pub fn num_contexts(&self) -> u32 { self.shared.num_contexts }

    /// Returns a reference to this context's runtime.
    pub fn runtime(&self) -> Runtime {
        Runtime {
            shared: self.shared.clone(),
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.shared.directory
    }

    /// The task whose body is running on this context, if any.
    pub fn current_task(&self) -> Option<Guid> {
        self.current_task.as_ref().map(|task| task.guid())
    }

    pub(crate) fn current_finish_latch(&self) -> Guid {
        self.current_task.as_ref().map_or(Guid::NULL, |task| task.finish_latch())
    }

    pub fn create_event(&mut self, kind: EventKind) -> Guid {
        assert!(kind != EventKind::FinishLatch, "finish latches are created by opening a finish scope");

        let event = self.directory().register_with(|guid| Event::new(guid, kind));
        debug!("create {:?} event {:?}", kind, event.guid());

        event.guid()
    }

    /// Satisfy a single-assignment event, or decrement a latch.
    pub fn satisfy(&mut self, event: Guid, data: Guid) -> Result<()> {
        self.satisfy_slot(event, data, 0)
    }

    pub fn satisfy_slot(&mut self, event: Guid, data: Guid, slot: u32) -> Result<()> {
        let target = self.directory().resolve_event(event)?;
        let valid_slot = match target.kind() {
            EventKind::Latch => slot <= LATCH_INCR_SLOT,
            EventKind::FinishLatch => return Err(Error::NotAwaitable(event)),
            kind => kind.is_single_assignment() && slot == 0,
        };

        if !valid_slot {
            return Err(Error::InvalidSlot { guid: event, slot });
        }

        target.satisfy(self, data, slot);

        Ok(())
    }

    /// Non-blocking read of an event's value.
    pub fn get(&self, event: Guid) -> Result<Guid> {
        self.directory().resolve_event(event)?.get()
    }

    /// Destroy an event owned by the caller.
    ///
    /// Once events and finish latches destroy themselves.
    pub fn destroy_event(&mut self, event: Guid) -> Result<()> {
        self.directory().resolve_event(event)?;
        debug!("destroy event {:?}", event);
        self.directory().release(event);

        Ok(())
    }

    pub fn create_data<T>(&mut self, value: T) -> Guid
    where T: std::any::Any + Send + Sync
    {
        let guid = self.directory().register(Object::Data(Arc::new(DataBlock::new(value))));
        debug!("create data block {:?}", guid);

        guid
    }

    pub fn data(&self, guid: Guid) -> Result<Arc<DataBlock>> {
        self.directory().resolve_data(guid)
    }

    pub fn destroy_data(&mut self, guid: Guid) -> Result<()> {
        self.directory().resolve_data(guid)?;
        debug!("destroy data block {:?}", guid);
        self.directory().release(guid);

        Ok(())
    }

    #[inline]
    pub fn task(&mut self, template: &Arc<TaskTemplate>) -> TaskBuilder {
        TaskBuilder::new(self, template)
    }

    /// Destroy a task that has not started running yet.
    ///
    /// Its output event fires with `Guid::NULL` and it leaves its finish scope.
    pub fn destroy_task(&mut self, task: Guid) -> Result<()> {
        let target = self.directory().resolve_task(task)?;
        target.destroy(self)
    }

    /// Read a user local storage slot of the running task.
    pub fn els_get(&self, offset: usize) -> Result<Guid> {
        let task = self.current_task.as_ref().ok_or(Error::NoCurrentTask)?;
        task.els(offset).ok_or(Error::InvalidSlot { guid: task.guid(), slot: offset as u32 })
    }

    /// Write a user local storage slot of the running task.
    pub fn els_set(&mut self, offset: usize, value: Guid) -> Result<()> {
        let task = self.current_task.as_ref().ok_or(Error::NoCurrentTask)?;
        task.set_els(offset, value)
    }

    /// Make `waiter` depend on `signaler`.
    ///
    /// If `waiter` is a task spawned with deferred dependencies, this binds its
    /// `slot`, and resolution starts once all of its slots are bound. If `waiter`
    /// is an event, it gets satisfied on `slot` with the signaler's payload when
    /// the signaler fires.
    pub fn add_dependence(&mut self, signaler: Guid, waiter: Guid, slot: u32) -> Result<()> {
        match self.directory().resolve(waiter)? {
            Object::Task(task) => task::bind_dependence(self, &task, signaler, slot),
            Object::Event(event) => {
                let valid_slot = match event.kind() {
                    EventKind::Latch => slot <= LATCH_INCR_SLOT,
                    EventKind::FinishLatch => return Err(Error::NotAwaitable(waiter)),
                    kind => kind.is_single_assignment() && slot == 0,
                };
                if !valid_slot {
                    return Err(Error::InvalidSlot { guid: waiter, slot });
                }

                let waiter = Waiter { guid: waiter, slot };
                if signaler.is_null() {
                    event::signal_waiter(self, waiter, Guid::NULL);
                    return Ok(());
                }

                match self.directory().resolve(signaler)? {
                    Object::Event(source) => source.register_waiter(self, waiter),
                    Object::Data(_) => event::signal_waiter(self, waiter, signaler),
                    Object::Task(_) => {
                        return Err(Error::KindMismatch { guid: signaler, expected: ObjectKind::Event });
                    }
                }

                Ok(())
            }
            Object::Data(_) => Err(Error::KindMismatch { guid: waiter, expected: ObjectKind::Event }),
        }
    }

    /// Wait until `event` is satisfied, executing other ready tasks meanwhile.
    ///
    /// Only sticky and idem events can be waited on: once events may be gone by
    /// the time we look at them and latches carry no value.
    pub fn wait(&mut self, event: Guid) -> Result<Guid> {
        profiling::scope!("wait");

        let target = self.directory().resolve_event(event)?;
        if !matches!(target.kind(), EventKind::Sticky | EventKind::Idem) {
            return Err(Error::NotAwaitable(event));
        }

        if let Ok(value) = target.get() {
            self.stats.fast_wait += 1;
            return Ok(value);
        }

        self.stats.slow_wait += 1;

        let backoff = Backoff::new();
        loop {
            if let Ok(value) = target.get() {
                return Ok(value);
            }

            if self.keep_busy() {
                backoff.reset();
                continue;
            }

            self.stats.spinned += 1;
            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Attempt to take one ready task and execute it.
    ///
    /// Return false if we couldn't find a task to execute.
    /// Useful when the current thread needs to wait for something to happen and we would rather
    /// process work than put the thread to sleep.
    pub fn keep_busy(&mut self) -> bool {
        match self.shared.scheduler.take(self.id) {
            Some(task) => {
                self.execute_task(task);
                true
            }
            None => false,
        }
    }

    pub(crate) fn schedule_task(&mut self, task: Guid) {
        profiling::scope!("schedule_task");

        if let Err(err) = self.shared.scheduler.give(self.id, task) {
            panic!("cannot schedule {:?} on context #{}: {}", task, self.id, err);
        }

        self.wake(1);
    }

    pub(crate) fn execute_task(&mut self, guid: Guid) {
        let task = match self.directory().resolve_task(guid) {
            Ok(task) => task,
            Err(_) => {
                debug!("scheduled {:?} was destroyed", guid);
                return;
            }
        };

        Task::run(&task, self);
        self.stats.tasks_executed += 1;
    }

    /// Wake up to n worker threads (stop when they are all awake).
    pub(crate) fn wake(&mut self, n: u32) {
        self.shared.sleep.wake(n);
    }

    pub(crate) fn new_worker(id: u32, shared: Arc<Shared>) -> Self {
        Context {
            id,
            is_worker: true,
            current_task: None,
            shared,
            stats: Stats::new(),
        }
    }
}

// We don't store the context itself when recycling it to avoid a reference cycle
// with the shared struct.
struct InactiveContext {
    id: u32,
    is_worker: bool,
}

pub(crate) struct ContextPool {
    contexts: Mutex<Vec<InactiveContext>>,
}

impl ContextPool {
    pub fn with_capacity(cap: usize) -> ContextPool {
        ContextPool {
            contexts: Mutex::new(Vec::with_capacity(cap))
        }
    }

    pub fn pop(shared: Arc<Shared>) -> Option<Context> {
        let mut contexts = shared.context_pool.contexts.lock().unwrap();
        let shared = shared.clone();
        contexts.pop().map(|ctx| Context {
            id: ctx.id,
            is_worker: ctx.is_worker,
            current_task: None,
            shared,
            stats: Stats::new(),
        })
    }

    pub fn recycle(&self, ctx: Context) {
        assert!(ctx.current_task.is_none(), "recycling a context while it runs a task");

        let mut contexts = self.contexts.lock().unwrap();
        contexts.push(InactiveContext {
            id: ctx.id,
            is_worker: ctx.is_worker,
        });
    }

    pub fn init(&self, ids: std::ops::Range<u32>) {
        let mut contexts = self.contexts.lock().unwrap();
        // Popped in increasing id order.
        for id in ids.rev() {
            contexts.push(InactiveContext { id, is_worker: false });
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Stats {
    /// number of tasks executed.
    pub tasks_executed: u64,
    /// How many times waiting on an event found it already satisfied.
    pub fast_wait: u64,
    /// How many times waiting on an event had to look for other work.
    pub slow_wait: u64,
    /// number of spinned iterations
    pub spinned: u64,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }
}
