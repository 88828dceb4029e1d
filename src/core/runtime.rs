use super::{Shared, WorkerHook};
use super::sync::Arc;
use super::context::{Context, ContextPool};
use super::shutdown::{Shutdown, ShutdownHandle};

use std::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RuntimeId(pub(crate) u32);

/// A reference to a runtime: its worker threads, workpiles and object directory.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) shared: Arc<Shared>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            num_threads: 3,
            num_contexts: 1,
            workpile_capacity: 4096,
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("Worker#{}", idx)),
            stack_size: None,
            park_timeout: Duration::from_millis(100),
        }
    }

    pub fn shut_down(&self) -> ShutdownHandle {
        Shutdown::begin_shut_down(Arc::clone(&self.shared))
    }

    pub fn pop_context(&self) -> Option<Context> {
        ContextPool::pop(Arc::clone(&self.shared))
    }

    pub fn recycle_context(&self, ctx: Context) {
        assert_eq!(ctx.shared.id, self.shared.id);
        self.shared.context_pool.recycle(ctx);
    }

    pub fn id(&self) -> RuntimeId {
        self.shared.id
    }

    pub fn num_worker_threads(&self) -> u32 { self.shared.num_workers }

    pub fn num_contexts(&self) -> u32 { self.shared.num_contexts }

    pub fn workpile_capacity(&self) -> usize { self.shared.workpile_capacity }

    /// Number of events, tasks and data blocks currently alive.
    pub fn num_live_objects(&self) -> usize { self.shared.directory.len() }
}

pub struct RuntimeBuilder {
    pub(crate) num_threads: u32,
    pub(crate) num_contexts: u32,
    pub(crate) workpile_capacity: usize,
    pub(crate) start_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) exit_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) name_handler: Box<dyn Fn(u32) -> String>,
    pub(crate) stack_size: Option<usize>,
    pub(crate) park_timeout: Duration,
}

impl RuntimeBuilder {
    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.start_handler = Some(Box::new(handler));

        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.exit_handler = Some(Box::new(handler));

        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where F: Fn(u32) -> String + 'static
    {
        self.name_handler = Box::new(handler);

        self
    }

    /// Zero is allowed: tasks then only run when external contexts call
    /// `keep_busy` or `wait`.
    pub fn with_worker_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads;

        // The sleep bitfield limits us to 32 workers, and that should be fine.
        assert!(self.num_threads < 32);
        assert!(self.num_threads + self.num_contexts < 32);

        self
    }

    /// Number of contexts available to external threads through `Runtime::pop_context`.
    pub fn with_contexts(mut self, num_contexts: u32) -> Self {
        self.num_contexts = num_contexts.max(1);

        assert!(self.num_threads + self.num_contexts < 32);

        self
    }

    /// Workpiles never grow: a context that makes more tasks ready than this
    /// without any of them being taken is a fatal error.
    pub fn with_workpile_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "workpile capacity must be non-zero");
        self.workpile_capacity = capacity;

        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);

        self
    }

    /// Upper bound on how long an idle worker sleeps before looking for work again.
    pub fn with_park_timeout(mut self, timeout: Duration) -> Self {
        self.park_timeout = timeout;

        self
    }

    pub fn build(self) -> Runtime {
        crate::core::init(self)
    }
}
