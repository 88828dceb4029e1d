//! An event-driven task runtime.
//!
//! Tasks declare their inputs as an ordered list of dependency slots, each bound
//! to an event or a data block. A task becomes runnable once every slot has been
//! resolved, and a work-stealing scheduler spreads runnable tasks over the worker
//! threads.
//!
//! The moving parts:
//! - Events are single-assignment futures (once, idem, sticky) or counters
//!   (latches). Registering a waiter and satisfying an event race without locks,
//!   each waiter is signaled exactly once.
//! - Tasks resolve their slots one at a time, in index order, then get handed to
//!   the scheduler.
//! - Finish scopes detect when a task and everything it spawned, transitively,
//!   has completed.
//! - Each context owns a bounded Chase-Lev workpile. Workers pop their own and
//!   steal from the others.
//!
//! Every object is referred to by a generational `Guid` resolved through the
//! runtime's directory, stale handles are detected instead of aliasing.
//!
//! ```no_run
//! use edt_runtime::{Runtime, TaskTemplate, EventKind, Guid};
//!
//! let runtime = Runtime::builder().with_worker_threads(4).build();
//! let mut ctx = runtime.pop_context().unwrap();
//!
//! let input = ctx.create_event(EventKind::Sticky);
//! let double = TaskTemplate::new(0, 1, |ctx, args| {
//!     let value = args.deps[0].get::<u32>().copied().unwrap_or(0);
//!     ctx.create_data(value * 2)
//! });
//!
//! let spawned = ctx.task(&double).with_deps(&[input]).with_output_event().spawn().unwrap();
//!
//! let data = ctx.create_data(21u32);
//! ctx.satisfy(input, data).unwrap();
//!
//! let result = ctx.wait(spawned.output_event.unwrap()).unwrap();
//! assert_eq!(ctx.data(result).unwrap().get::<u32>(), Some(&42));
//!
//! runtime.recycle_context(ctx);
//! runtime.shut_down().wait();
//! ```

// TODO: handle panics in task bodies, a panicking body currently takes its worker down
//       and leaves its finish scope open.

mod core;
pub mod data;
pub mod directory;
pub mod error;
pub mod util;

pub use crate::core::context::*;
pub use crate::core::event::{Event, EventKind, LATCH_DECR_SLOT, LATCH_INCR_SLOT};
pub use crate::core::task::{Task, TaskTemplate, TaskArgs, TaskBuilder, TaskState, Dependency, SpawnedTask, ELS_USER_SLOTS};
pub use crate::core::deque::Deque;
pub use crate::core::scheduler::{Scheduler, Workpile};
pub use crate::core::runtime::{Runtime, RuntimeId, RuntimeBuilder};
pub use crate::core::shutdown::ShutdownHandle;
pub use crate::core::WorkerHook;
pub use crate::core::sync;
pub use crate::data::DataBlock;
pub use crate::directory::{Directory, Guid, Object, ObjectKind};
pub use crate::error::{Error, Result};

pub use crossbeam_utils::CachePadded;
