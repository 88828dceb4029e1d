pub mod context;
pub mod event;
pub mod task;
pub mod finish;
pub mod deque;
pub mod scheduler;
pub mod runtime;
pub mod shutdown;
/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub mod sync;

use crossbeam_utils::{CachePadded, sync::{Parker, Unparker}};
use log::debug;

use std::time::Duration;

use sync::{Arc, Ordering, AtomicU32, fence, thread};
use runtime::{Runtime, RuntimeBuilder, RuntimeId};
use context::{Context, ContextPool};
use scheduler::Scheduler;
use shutdown::Shutdown;
use crate::directory::Directory;

// Use std's atomic type explicitly here because loom's doesn't support static initialization.
static NEXT_RUNTIME_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

/// Data accessible by all contexts from any thread.
pub(crate) struct Shared {
    /// Number of dedicated worker threads.
    pub num_workers: u32,
    /// Number of contexts, including the workers'.
    pub num_contexts: u32,
    /// Every event, task and data block of the runtime.
    pub directory: Directory,
    /// One workpile per context.
    pub scheduler: Scheduler,
    /// State and logic to put worker threads to sleep and wake them up.
    pub sleep: Sleep,
    /// The unused contexts that can be requested by threads.
    pub context_pool: ContextPool,
    /// A unique ID per runtime to sanity-check that contexts aren't recycled
    /// into the wrong one.
    pub id: RuntimeId,
    /// state and logic to handle shutting down.
    pub shutdown: Shutdown,
    pub workpile_capacity: usize,
    park_timeout: Duration,
    handlers: RuntimeHooks,
}

pub(crate) fn init(params: RuntimeBuilder) -> Runtime {
    let num_threads = params.num_threads as usize;
    let num_contexts = num_threads + params.num_contexts as usize;

    let (sleep, mut parkers) = Sleep::new(num_threads);

    let shared = Arc::new(Shared {
        num_workers: num_threads as u32,
        num_contexts: num_contexts as u32,

        directory: Directory::new(),

        scheduler: Scheduler::new(num_contexts, params.workpile_capacity),

        sleep,

        handlers: RuntimeHooks {
            start: params.start_handler,
            exit: params.exit_handler,
        },

        shutdown: Shutdown::new(num_threads as u32),

        id: RuntimeId(NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed)),

        context_pool: ContextPool::with_capacity(params.num_contexts as usize),

        workpile_capacity: params.workpile_capacity,

        park_timeout: params.park_timeout,
    });

    shared.context_pool.init(num_threads as u32..num_contexts as u32);

    debug!(
        "runtime {:?}: {} workers, {} contexts, workpile capacity {}",
        shared.id, num_threads, num_contexts, params.workpile_capacity,
    );

    for (i, parker) in parkers.drain(..).enumerate() {
        let mut worker = Worker {
            ctx: Context::new_worker(i as u32, shared.clone()),
            parker,
        };

        let mut builder = thread::Builder::new()
            .name((params.name_handler)(i as u32));

        if let Some(stack_size) = params.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let _ = builder.spawn(move || {
            profiling::register_thread!("Worker");

            worker.run();

        }).unwrap();
    }

    Runtime { shared }
}

pub(crate) struct Sleep {
    /// Atomic bitfield. Setting the Nth bit to one means the Nth worker thread is sleepy.
    sleepy_workers: AtomicU32,
    unparkers: Vec<CachePadded<Unparker>>,
}

impl Sleep {
    fn new(num_threads: usize) -> (Self, Vec<Parker>) {
        let mut parkers = Vec::with_capacity(num_threads);
        let mut unparkers = Vec::with_capacity(num_threads);

        for _ in 0..num_threads {
            let parker = Parker::new();
            unparkers.push(CachePadded::new(parker.unparker().clone()));
            parkers.push(parker);
        }

        (
            Sleep {
                sleepy_workers: AtomicU32::new(0),
                unparkers,
            },
            parkers,
        )
    }

    /// Wake up to n worker threads (stop when they are all awake).
    ///
    /// This function is fairly expensive when it causes a thread to
    /// wake up, however it is fairly cheap if all workers are already awake.
    pub fn wake(&self, mut n: u32) {
        // Order the work we just published before reading the sleepy bits, the
        // worker side does the opposite before its last look at the workpiles.
        fence(Ordering::SeqCst);

        while n > 0 {
            let mut sleepy_bits = self.sleepy_workers.load(Ordering::Acquire);

            if sleepy_bits == 0 {
                // Everyone is already awake.
                return;
            }

            for i in 0..(self.unparkers.len() as u32) {
                let bit = 1 << i;
                if sleepy_bits & bit == 0 {
                    continue;
                }

                let prev = self.sleepy_workers.fetch_and(!bit, Ordering::AcqRel);
                if prev & bit == 0 {
                    // Someone else woke the thread up before we got to it.
                    // A good time to refresh our view of the sleep thread bits.
                    sleepy_bits = self.sleepy_workers.load(Ordering::Acquire);

                    if sleepy_bits == 0 {
                        return;
                    }

                    continue;
                }

                profiling::scope!("unpark");
                self.unparkers[i as usize].unpark();

                n -= 1;
                break;
            }
        }
    }

    fn mark_sleepy(&self, worker: u32) {
        let sleepy_bit = 1 << worker;
        self.sleepy_workers.fetch_or(sleepy_bit, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    fn mark_awake(&self, worker: u32) {
        let sleepy_bit = 1 << worker;
        self.sleepy_workers.fetch_and(!sleepy_bit, Ordering::AcqRel);
    }

    /// Wake all workers.
    ///
    /// This is a bit heavy handed and mostly intended for the shutdown code. In the majority
    /// of cases (other than shutdown), using `wake` is better.
    fn wake_all(&self) {
        for unparker in &self.unparkers {
            unparker.unpark();
        }
    }
}

struct Worker {
    ctx: Context,
    parker: Parker,
}

impl Worker {
    fn run(&mut self) {
        let ctx = &mut self.ctx;
        let shared = Arc::clone(&ctx.shared);
        let id = ctx.id().0;

        if let Some(handler) = &shared.handlers.start {
            handler.run(id);
        }

        loop {
            // Take from our own workpile first, then steal from the others.
            while let Some(task) = shared.scheduler.take(id) {
                ctx.execute_task(task);
            }

            if shared.shutdown.is_shutting_down() {
                break;
            }

            // Couldn't find work to do in our or another context's workpile, so
            // it's sleepy time. Look one last time after announcing it, anyone
            // giving work from now on will see our bit and wake us up.
            shared.sleep.mark_sleepy(id);

            if shared.scheduler.has_work() || shared.shutdown.is_shutting_down() {
                shared.sleep.mark_awake(id);
                continue;
            }

            self.parker.park_timeout(shared.park_timeout);
            shared.sleep.mark_awake(id);
        }

        // Shutdown phase.

        debug!("worker #{} exits", id);

        if let Some(handler) = &shared.handlers.exit {
            handler.run(id);
        }

        shared.shutdown.worker_has_shut_down();
    }
}

pub(crate) struct RuntimeHooks {
    start: Option<Box<dyn WorkerHook>>,
    exit: Option<Box<dyn WorkerHook>>,
}

pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_id: u32) { self(worker_id) }
}
