use super::sync::{Arc, Ordering, AtomicBool, AtomicU8, AtomicU32, AtomicU64};
use super::context::Context;
use super::event::{EventKind, Waiter};
use super::finish;
use crate::data::DataBlock;
use crate::directory::{Guid, Object, ObjectKind};
use crate::error::{Error, Result};

use log::{debug, trace};

use std::fmt;

type TaskFn = dyn Fn(&mut Context, TaskArgs) -> Guid + Send + Sync;

/// The reusable part of a task: its body and the shape of its inputs.
pub struct TaskTemplate {
    func: Box<TaskFn>,
    paramc: usize,
    depc: usize,
}

impl TaskTemplate {
    /// The body receives `paramc` scalar parameters and `depc` resolved
    /// dependencies, and returns the guid its output event is satisfied with.
    pub fn new<F>(paramc: usize, depc: usize, func: F) -> Arc<Self>
    where
        F: Fn(&mut Context, TaskArgs) -> Guid + Send + Sync + 'static
    {
        Arc::new(TaskTemplate {
            func: Box::new(func),
            paramc,
            depc,
        })
    }

    #[inline]
    pub fn num_params(&self) -> usize { self.paramc }

    #[inline]
    pub fn num_deps(&self) -> usize { self.depc }
}

impl fmt::Debug for TaskTemplate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskTemplate")
            .field("paramc", &self.paramc)
            .field("depc", &self.depc)
            .finish_non_exhaustive()
    }
}

/// What a task body gets to work with.
pub struct TaskArgs<'a> {
    pub guid: Guid,
    pub params: &'a [u64],
    pub deps: &'a [Dependency],
}

/// A resolved dependency slot.
#[derive(Clone, Debug)]
pub struct Dependency {
    /// The payload the slot was satisfied with.
    pub guid: Guid,
    /// The data block the payload names, if it names one.
    pub data: Option<Arc<DataBlock>>,
}

impl Dependency {
    pub fn get<T: std::any::Any>(&self) -> Option<&T> {
        self.data.as_ref()?.get::<T>()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Some dependency slots are not bound yet.
    Bound,
    /// Waiting for the given slot, all the ones before it are resolved.
    Waiting(u32),
    Ready,
    Executing,
    Done,
    /// Destroyed before it got to run.
    Destroyed,
}

const BOUND: u8 = 0;
const WAITING: u8 = 1;
const READY: u8 = 2;
const EXECUTING: u8 = 3;
const DONE: u8 = 4;
const DESTROYED: u8 = 5;

/// Number of user-accessible local storage slots per task.
pub const ELS_USER_SLOTS: usize = 8;

struct DepSlot {
    // Guid bits of whatever the slot waits on, `Guid::UNSET_BITS` until bound.
    signaler: AtomicU64,
    payload: AtomicU64,
    // The slot holds a reference on a once event.
    once: AtomicBool,
}

/// A unit of work that runs once all of its dependency slots are resolved.
///
/// Slots are resolved strictly in order: the task only ever waits on one slot at
/// a time (its frontier), and only registers on the next signaler once the
/// current one has fired. The order in which the underlying events are satisfied
/// does not matter.
pub struct Task {
    guid: Guid,
    template: Arc<TaskTemplate>,
    params: Box<[u64]>,
    slots: Box<[DepSlot]>,
    frontier: AtomicU32,
    added_deps: AtomicU32,
    output_event: Guid,
    opens_scope: bool,
    // The latch of the finish scope this task belongs to (or opened).
    finish_latch: AtomicU64,
    // User local storage, guid bits.
    els: [AtomicU64; ELS_USER_SLOTS],
    phase: AtomicU8,
}

impl Task {
    fn new(guid: Guid, template: Arc<TaskTemplate>, params: Box<[u64]>, output_event: Guid, opens_scope: bool) -> Self {
        let slots = (0..template.depc).map(|_| DepSlot {
            signaler: AtomicU64::new(Guid::UNSET_BITS),
            payload: AtomicU64::new(Guid::NULL.to_bits()),
            once: AtomicBool::new(false),
        }).collect();

        Task {
            guid,
            template,
            params,
            slots,
            frontier: AtomicU32::new(0),
            added_deps: AtomicU32::new(0),
            output_event,
            opens_scope,
            finish_latch: AtomicU64::new(Guid::NULL.to_bits()),
            els: std::array::from_fn(|_| AtomicU64::new(Guid::NULL.to_bits())),
            phase: AtomicU8::new(BOUND),
        }
    }

    #[inline]
    pub fn guid(&self) -> Guid { self.guid }

    #[inline]
    pub fn num_deps(&self) -> usize { self.slots.len() }

    pub fn output_event(&self) -> Option<Guid> {
        if self.output_event.is_null() { None } else { Some(self.output_event) }
    }

    pub fn opens_scope(&self) -> bool { self.opens_scope }

    pub fn state(&self) -> TaskState {
        match self.phase.load(Ordering::Acquire) {
            BOUND => TaskState::Bound,
            WAITING => TaskState::Waiting(self.frontier.load(Ordering::Acquire)),
            READY => TaskState::Ready,
            EXECUTING => TaskState::Executing,
            DONE => TaskState::Done,
            _ => TaskState::Destroyed,
        }
    }

    pub(crate) fn finish_latch(&self) -> Guid {
        Guid::from_bits(self.finish_latch.load(Ordering::Acquire))
    }

    fn set_finish_latch(&self, latch: Guid) {
        self.finish_latch.store(latch.to_bits(), Ordering::Release);
    }

    pub(crate) fn clear_finish_latch(&self, latch: Guid) {
        let _ = self.finish_latch.compare_exchange(
            latch.to_bits(),
            Guid::NULL.to_bits(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Read a user local storage slot, `None` if `offset` is out of range.
    pub fn els(&self, offset: usize) -> Option<Guid> {
        let bits = self.els.get(offset)?.load(Ordering::Acquire);
        Some(Guid::from_bits(bits))
    }

    pub(crate) fn set_els(&self, offset: usize, value: Guid) -> Result<()> {
        match self.els.get(offset) {
            Some(slot) => {
                slot.store(value.to_bits(), Ordering::Release);
                Ok(())
            }
            None => Err(Error::InvalidSlot { guid: self.guid, slot: offset as u32 }),
        }
    }

    // Move from one of `from` to `to`. Fails if the task is elsewhere, destroyed in particular.
    fn transition(&self, from: &[u8], to: u8) -> std::result::Result<(), u8> {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            if !from.contains(&current) {
                return Err(current);
            }
            match self.phase.compare_exchange_weak(current, to, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(phase) => current = phase,
            }
        }
    }

    fn is_destroyed(&self) -> bool {
        self.phase.load(Ordering::Acquire) == DESTROYED
    }

    fn signaler(&self, slot: u32) -> Guid {
        Guid::from_bits(self.slots[slot as usize].signaler.load(Ordering::Acquire))
    }

    /// Bind a dependency slot. Returns true if it was the last unbound one.
    pub(crate) fn bind_slot(&self, slot: u32, signaler: Guid, once: bool) -> bool {
        let dep = &self.slots[slot as usize];
        dep.once.store(once, Ordering::Relaxed);

        let bound = dep.signaler
            .compare_exchange(Guid::UNSET_BITS, signaler.to_bits(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        assert!(bound, "slot {} of {:?} bound twice", slot, self.guid);

        trace!("{:?} slot {} bound to {:?}", self.guid, slot, signaler);

        self.added_deps.fetch_add(1, Ordering::AcqRel) + 1 == self.slots.len() as u32
    }

    /// Start resolving the dependency slots, every slot must be bound.
    pub(crate) fn start(&self, ctx: &mut Context) {
        if self.slots.is_empty() {
            self.make_ready(ctx);
            return;
        }

        if self.transition(&[BOUND], WAITING).is_err() {
            return;
        }
        if let Some(payload) = self.wait_on_slot(ctx, 0) {
            self.signaled(ctx, payload, 0);
        }
    }

    /// The signaler of the frontier slot fired.
    pub(crate) fn signaled(&self, ctx: &mut Context, data: Guid, slot: u32) {
        let mut slot = slot;
        let mut data = data;
        loop {
            if self.is_destroyed() {
                return;
            }

            self.resolve_slot(ctx, slot, data);

            let next = slot + 1;
            if next as usize == self.slots.len() {
                self.make_ready(ctx);
                return;
            }

            match self.wait_on_slot(ctx, next) {
                Some(payload) => {
                    slot = next;
                    data = payload;
                }
                None => return,
            }
        }
    }

    fn resolve_slot(&self, ctx: &mut Context, slot: u32, data: Guid) {
        let frontier = self.frontier.load(Ordering::Acquire);
        assert_eq!(
            slot, frontier,
            "{:?} signaled on slot {} while waiting on slot {}", self.guid, slot, frontier,
        );

        let dep = &self.slots[slot as usize];
        dep.payload.store(data.to_bits(), Ordering::Release);

        if dep.once.swap(false, Ordering::AcqRel) {
            let signaler = self.signaler(slot);
            match ctx.directory().resolve_event(signaler) {
                Ok(event) => event.release_once_ref(ctx),
                Err(err) => panic!("once event bound to slot {} of {:?}: {}", slot, self.guid, err),
            }
        }

        trace!("{:?} slot {} resolved with {:?}", self.guid, slot, data);
        self.frontier.store(slot + 1, Ordering::Release);
    }

    // Returns the payload directly if the slot does not need to wait.
    fn wait_on_slot(&self, ctx: &mut Context, slot: u32) -> Option<Guid> {
        let signaler = self.signaler(slot);
        if signaler.is_null() {
            return Some(Guid::NULL);
        }

        let event = match ctx.directory().resolve(signaler) {
            Ok(Object::Data(_)) => return Some(signaler),
            Ok(Object::Event(event)) => event,
            Ok(Object::Task(_)) => panic!("slot {} of {:?} is bound to a task", slot, self.guid),
            // The reference this slot held was dropped along with the task.
            Err(_) if self.is_destroyed() => return None,
            Err(err) => panic!("cannot wait on slot {} of {:?}: {}", slot, self.guid, err),
        };

        if let Ok(data) = event.get() {
            return Some(data);
        }

        event.register_waiter(ctx, Waiter { guid: self.guid, slot });

        None
    }

    fn make_ready(&self, ctx: &mut Context) {
        if self.transition(&[BOUND, WAITING], READY).is_err() {
            debug!("{:?} destroyed before getting ready", self.guid);
            return;
        }
        debug!("{:?} is ready", self.guid);
        ctx.schedule_task(self.guid);
    }

    pub(crate) fn run(task: &Arc<Task>, ctx: &mut Context) {
        profiling::scope!("run task");

        match task.transition(&[READY], EXECUTING) {
            Ok(()) => {}
            Err(DESTROYED) => {
                debug!("skipping destroyed {:?}", task.guid);
                return;
            }
            Err(phase) => panic!("{:?} executed in phase {}", task.guid, phase),
        }

        let deps: Vec<Dependency> = task.slots.iter().map(|slot| {
            let guid = Guid::from_bits(slot.payload.load(Ordering::Acquire));
            let data = ctx.directory().resolve_data(guid).ok();
            Dependency { guid, data }
        }).collect();

        debug!("execute {:?}", task.guid);

        let prev_task = ctx.current_task.replace(Arc::clone(task));
        let ret = (task.template.func)(ctx, TaskArgs {
            guid: task.guid,
            params: &task.params,
            deps: &deps,
        });
        ctx.current_task = prev_task;

        drop(deps);
        task.phase.store(DONE, Ordering::Release);

        task.complete(ctx, ret);
    }

    fn complete(&self, ctx: &mut Context, ret: Guid) {
        let latch = self.finish_latch();

        if self.opens_scope {
            // The scope forwards the value to the output event once the subtree is done.
            finish::set_return_value(ctx, latch, ret);
        } else if !self.output_event.is_null() {
            match ctx.directory().resolve_event(self.output_event) {
                Ok(event) => event.satisfy(ctx, ret, 0),
                Err(_) => debug!("output event of {:?} destroyed before completion", self.guid),
            }
        }

        if !latch.is_null() {
            finish::check_out(ctx, latch);
        }

        ctx.directory().release(self.guid);
        debug!("{:?} done", self.guid);
    }

    /// Destroy a task that has not started running.
    ///
    /// The task leaves its finish scope as if it had completed with a null value:
    /// its output event fires with `Guid::NULL` (directly, or through the scope it
    /// opened once that scope drains). References held on once events by slots
    /// that were not resolved yet are dropped.
    pub(crate) fn destroy(&self, ctx: &mut Context) -> Result<()> {
        if self.transition(&[BOUND, WAITING, READY], DESTROYED).is_err() {
            return Err(Error::TaskStarted(self.guid));
        }

        debug!("destroy {:?}", self.guid);

        for dep in self.slots.iter() {
            if dep.once.swap(false, Ordering::AcqRel) {
                let signaler = Guid::from_bits(dep.signaler.load(Ordering::Acquire));
                release_signaler(ctx, signaler);
            }
        }

        self.complete(ctx, Guid::NULL);

        Ok(())
    }
}

/// Check that `signaler` can be bound to a dependency slot, taking a reference on
/// it if it is a once event. Returns whether a reference was taken.
pub(crate) fn acquire_signaler(ctx: &Context, signaler: Guid) -> Result<bool> {
    if signaler.is_null() {
        return Ok(false);
    }

    match ctx.directory().resolve(signaler)? {
        Object::Data(_) => Ok(false),
        Object::Event(event) => match event.kind() {
            EventKind::Once if !event.acquire_once_ref() => Err(Error::StaleHandle(signaler)),
            EventKind::Once => Ok(true),
            EventKind::FinishLatch => Err(Error::NotAwaitable(signaler)),
            _ => Ok(false),
        },
        Object::Task(_) => Err(Error::KindMismatch { guid: signaler, expected: ObjectKind::Event }),
    }
}

fn release_signaler(ctx: &mut Context, signaler: Guid) {
    if let Ok(event) = ctx.directory().resolve_event(signaler) {
        event.release_once_ref(ctx);
    }
}

pub(crate) fn bind_dependence(ctx: &mut Context, task: &Task, signaler: Guid, slot: u32) -> Result<()> {
    if slot as usize >= task.num_deps() {
        return Err(Error::InvalidSlot { guid: task.guid(), slot });
    }

    let once = acquire_signaler(ctx, signaler)?;
    if task.bind_slot(slot, signaler, once) {
        task.start(ctx);
    }

    Ok(())
}

/// The output of `TaskBuilder::spawn`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpawnedTask {
    pub task: Guid,
    pub output_event: Option<Guid>,
}

pub struct TaskBuilder<'c> {
    ctx: &'c mut Context,
    template: Arc<TaskTemplate>,
    params: Vec<u64>,
    deps: Vec<Guid>,
    deferred_deps: bool,
    output_event: bool,
    finish_scope: bool,
}

impl<'c> TaskBuilder<'c> {
    pub(crate) fn new(ctx: &'c mut Context, template: &Arc<TaskTemplate>) -> Self {
        TaskBuilder {
            ctx,
            template: Arc::clone(template),
            params: Vec::new(),
            deps: Vec::new(),
            deferred_deps: false,
            output_event: false,
            finish_scope: false,
        }
    }

    #[inline]
    pub fn with_params(mut self, params: &[u64]) -> Self {
        self.params.extend_from_slice(params);

        self
    }

    /// Signalers of the dependency slots, in slot order: events, data blocks or
    /// the null guid.
    #[inline]
    pub fn with_deps(mut self, deps: &[Guid]) -> Self {
        self.deps.extend_from_slice(deps);

        self
    }

    /// Spawn the task with unbound slots, to be bound with `Context::add_dependence`.
    ///
    /// Resolution starts once every slot is bound.
    #[inline]
    pub fn with_deferred_deps(mut self) -> Self {
        self.deferred_deps = true;

        self
    }

    /// Create a sticky event satisfied with the task's return value.
    #[inline]
    pub fn with_output_event(mut self) -> Self {
        self.output_event = true;

        self
    }

    /// Open a finish scope: the output event only fires once the task and
    /// everything spawned inside it has completed.
    #[inline]
    pub fn with_finish_scope(mut self) -> Self {
        self.finish_scope = true;

        self
    }

    pub fn spawn(self) -> Result<SpawnedTask> {
        profiling::scope!("spawn");

        let TaskBuilder { ctx, template, params, deps, deferred_deps, output_event, finish_scope } = self;

        if params.len() != template.paramc {
            return Err(Error::ArityMismatch { what: "parameters", expected: template.paramc, got: params.len() });
        }

        let expected_deps = if deferred_deps { 0 } else { template.depc };
        if deps.len() != expected_deps {
            return Err(Error::ArityMismatch { what: "dependencies", expected: expected_deps, got: deps.len() });
        }

        let mut once = Vec::with_capacity(deps.len());
        for &dep in &deps {
            match acquire_signaler(ctx, dep) {
                Ok(acquired) => once.push(acquired),
                Err(err) => {
                    for (&dep, _) in deps.iter().zip(&once).filter(|(_, acquired)| **acquired) {
                        release_signaler(ctx, dep);
                    }
                    return Err(err);
                }
            }
        }

        let output = if output_event {
            Some(ctx.create_event(EventKind::Sticky))
        } else {
            None
        };

        let task = ctx.directory().register_with(|guid| {
            Task::new(guid, template, params.into_boxed_slice(), output.unwrap_or(Guid::NULL), finish_scope)
        });

        let enclosing = ctx.current_finish_latch();
        let latch = if finish_scope {
            let parent = if enclosing.is_null() { None } else { Some(enclosing) };
            finish::open_scope(ctx, task.guid(), output, parent)
        } else {
            if !enclosing.is_null() {
                finish::check_in(ctx, enclosing);
            }
            enclosing
        };
        task.set_finish_latch(latch);

        debug!("spawn {:?} ({} deps, scope {:?})", task.guid(), task.num_deps(), latch);

        if task.num_deps() == 0 {
            task.start(ctx);
        }

        for (slot, (&dep, acquired)) in deps.iter().zip(once).enumerate() {
            if task.bind_slot(slot as u32, dep, acquired) {
                task.start(ctx);
            }
        }

        Ok(SpawnedTask { task: task.guid(), output_event: output })
    }
}
