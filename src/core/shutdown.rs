/// Shutdown
///
/// Workers check whether the runtime is shutting down by reading an atomic that
/// is set when the shutdown starts, once they run out of tasks. Then we have a
/// simple mutex/condvar pair tracking the remaining number of workers to shut down
/// that we can wait on.

use crate::sync::{Ordering, AtomicBool, Mutex, Condvar, Arc};

use crate::core::Shared;

use log::debug;

pub(crate) struct Shutdown {
    pub is_shutting_down: AtomicBool,
    pub shutdown_mutex: Mutex<u32>,
    pub shutdown_cond: Condvar,
}

impl Shutdown {
    pub fn new(num_threads: u32) -> Self {
        Shutdown {
            is_shutting_down: AtomicBool::new(false),
            shutdown_mutex: Mutex::new(num_threads),
            shutdown_cond: Condvar::new(),
        }
    }

    pub fn begin_shut_down(shared: Arc<Shared>) -> ShutdownHandle {
        debug!("shutting down runtime {:?}", shared.id);
        shared.shutdown.is_shutting_down.store(true, Ordering::SeqCst);

        shared.sleep.wake_all();

        ShutdownHandle { shared }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn wait_shutdown(&self) {
        let mut num_workers = self.shutdown_mutex.lock().unwrap();
        while *num_workers > 0 {
            num_workers = self.shutdown_cond.wait(num_workers).unwrap();
        }
    }

    pub fn worker_has_shut_down(&self) {
        let mut num_workers = self.shutdown_mutex.lock().unwrap();
        *num_workers -= 1;
        if *num_workers == 0 {
            self.shutdown_cond.notify_all();
        }
    }
}

pub struct ShutdownHandle {
    shared: Arc<Shared>
}

impl ShutdownHandle {
    /// Block until every worker thread has exited.
    pub fn wait(self) {
        self.shared.shutdown.wait_shutdown();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::{EventKind, Runtime, TaskTemplate, Guid};
    use std::sync::atomic::AtomicU32;

    #[test]
    fn start_and_exit_hooks_run_once_per_worker() {
        static INITIALIZED_WORKERS: AtomicU32 = AtomicU32::new(0);
        static SHUTDOWN_WORKERS: AtomicU32 = AtomicU32::new(0);

        for _ in 0..10 {
            for num_threads in 0..8 {
                INITIALIZED_WORKERS.store(0, Ordering::SeqCst);
                SHUTDOWN_WORKERS.store(0, Ordering::SeqCst);

                let runtime = Runtime::builder()
                    .with_worker_threads(num_threads)
                    .with_start_handler(|_id| { INITIALIZED_WORKERS.fetch_add(1, Ordering::SeqCst); })
                    .with_exit_handler(|_id| { SHUTDOWN_WORKERS.fetch_add(1, Ordering::SeqCst); })
                    .build();

                let handle = runtime.shut_down();
                handle.wait();

                assert_eq!(INITIALIZED_WORKERS.load(Ordering::SeqCst), num_threads);
                assert_eq!(SHUTDOWN_WORKERS.load(Ordering::SeqCst), num_threads);
            }
        }
    }

    #[test]
    fn workers_drain_ready_tasks_before_exiting() {
        static EXECUTED: AtomicU32 = AtomicU32::new(0);

        let runtime = Runtime::builder().with_worker_threads(2).build();
        let mut ctx = runtime.pop_context().unwrap();

        let template = TaskTemplate::new(0, 0, |_, _| {
            EXECUTED.fetch_add(1, Ordering::SeqCst);
            Guid::NULL
        });

        let done = ctx.create_event(EventKind::Sticky);
        let last = TaskTemplate::new(0, 0, move |ctx, _| {
            ctx.satisfy(done, Guid::NULL).unwrap();
            Guid::NULL
        });

        for _ in 0..100 {
            ctx.task(&template).spawn().unwrap();
        }
        ctx.task(&last).spawn().unwrap();

        ctx.wait(done).unwrap();
        runtime.recycle_context(ctx);

        runtime.shut_down().wait();

        assert_eq!(EXECUTED.load(Ordering::SeqCst), 100);
    }
}
