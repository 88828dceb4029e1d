//! Finish scopes: structured completion detection for task subtrees.
//!
//! A task spawned with `with_finish_scope()` opens a scope backed by a finish
//! latch. The latch counts one check-in for the opening task and one for every
//! task spawned (transitively) inside the scope, and each of them checks out when
//! it completes. When the count lands on zero the whole subtree is done: the
//! opening task's output event fires with the opening task's return value, and
//! the enclosing scope, if any, gets the check-out that matches the check-in it
//! received when this scope was opened.
//!
//! Everything a scope notifies is known when it is opened, the latch never
//! accepts waiters afterwards.

use super::sync::{Arc, Ordering, AtomicU64};
use super::context::Context;
use super::event::{Event, Waiter, LATCH_DECR_SLOT, LATCH_INCR_SLOT};
use crate::directory::Guid;

use log::{debug, trace};

pub(crate) struct FinishScope {
    /// The task that opened the scope.
    owner: Guid,
    /// Where the opening task's return value goes once the scope completes.
    output: Option<Waiter>,
    /// Decrement slot of the enclosing scope's latch.
    parent: Option<Waiter>,
    return_value: AtomicU64,
}

impl FinishScope {
    /// Recorded by the opening task before it checks out.
    pub fn set_return_value(&self, value: Guid) {
        self.return_value.store(value.to_bits(), Ordering::Release);
    }

    fn return_value(&self) -> Guid {
        Guid::from_bits(self.return_value.load(Ordering::Acquire))
    }
}

/// Open a scope owned by `owner`, nested in `parent` if there is one.
///
/// The returned latch already accounts for the opening task.
pub(crate) fn open_scope(ctx: &mut Context, owner: Guid, output_event: Option<Guid>, parent: Option<Guid>) -> Guid {
    if let Some(parent) = parent {
        check_in(ctx, parent);
    }

    let scope = FinishScope {
        owner,
        output: output_event.map(|guid| Waiter { guid, slot: 0 }),
        parent: parent.map(|guid| Waiter { guid, slot: LATCH_DECR_SLOT }),
        return_value: AtomicU64::new(Guid::NULL.to_bits()),
    };

    let latch = ctx.directory().register_with(|guid| Event::new_finish_latch(guid, scope));
    debug!("{:?} opens finish scope {:?} (parent {:?})", owner, latch.guid(), parent);

    latch.satisfy(ctx, Guid::NULL, LATCH_INCR_SLOT);

    latch.guid()
}

pub(crate) fn check_in(ctx: &mut Context, latch: Guid) {
    trace!("check in {:?}", latch);
    resolve_latch(ctx, latch).satisfy(ctx, Guid::NULL, LATCH_INCR_SLOT);
}

pub(crate) fn check_out(ctx: &mut Context, latch: Guid) {
    trace!("check out {:?}", latch);
    resolve_latch(ctx, latch).satisfy(ctx, Guid::NULL, LATCH_DECR_SLOT);
}

pub(crate) fn set_return_value(ctx: &Context, latch: Guid, value: Guid) {
    if let Some(scope) = resolve_latch(ctx, latch).finish_scope() {
        scope.set_return_value(value);
    }
}

fn resolve_latch(ctx: &Context, latch: Guid) -> Arc<Event> {
    let event = ctx.directory().resolve_event(latch).unwrap_or_else(|err| {
        panic!("finish latch {:?} is gone ({}), unbalanced check-in/check-out", latch, err)
    });
    assert!(event.finish_scope().is_some(), "{:?} is not a finish latch", latch);

    event
}

/// Called once, by whoever brought the latch to zero.
pub(crate) fn scope_completed(ctx: &mut Context, latch: Guid, scope: &FinishScope) {
    profiling::scope!("finish scope completed");
    debug!("finish scope {:?} of {:?} completed", latch, scope.owner);

    // Drop the owner's reference to the latch before anything downstream runs.
    if let Ok(owner) = ctx.directory().resolve_task(scope.owner) {
        owner.clear_finish_latch(latch);
    }

    if let Some(output) = scope.output {
        match ctx.directory().resolve_event(output.guid) {
            Ok(event) => event.satisfy(ctx, scope.return_value(), output.slot),
            Err(_) => debug!("output event of {:?} destroyed before its scope completed", scope.owner),
        }
    }

    if let Some(parent) = scope.parent {
        debug_assert_eq!(parent.slot, LATCH_DECR_SLOT);
        check_out(ctx, parent.guid);
    }

    ctx.directory().release(latch);
}

#[cfg(all(test, not(loom)))]
mod tests {
    use crate::{Context, EventKind, Guid, Runtime, TaskTemplate};
    use std::sync::{Arc, Mutex};

    // No worker threads: tasks only run when the test drives the context.
    fn single_context() -> (Runtime, Context) {
        let runtime = Runtime::builder().with_worker_threads(0).build();
        let ctx = runtime.pop_context().unwrap();
        (runtime, ctx)
    }

    fn drain(ctx: &mut Context) {
        while ctx.keep_busy() {}
    }

    fn text(ctx: &Context, event: Guid) -> &'static str {
        let data = ctx.get(event).unwrap();
        *ctx.data(data).unwrap().get::<&'static str>().unwrap()
    }

    #[test]
    fn nested_scopes_complete_bottom_up() {
        let (runtime, mut ctx) = single_context();

        // Idem events keep the first value they receive: they tell which output fired first.
        let first_of_all = ctx.create_event(EventKind::Idem);
        let first_of_outer_two = ctx.create_event(EventKind::Idem);

        let leaf = TaskTemplate::new(0, 0, |_, _| Guid::NULL);

        let innermost = TaskTemplate::new(0, 0, move |ctx, _| {
            ctx.task(&leaf).spawn().unwrap();
            ctx.create_data("c")
        });

        let middle = TaskTemplate::new(0, 0, move |ctx, _| {
            let c = ctx.task(&innermost).with_finish_scope().with_output_event().spawn().unwrap();
            ctx.add_dependence(c.output_event.unwrap(), first_of_all, 0).unwrap();
            ctx.create_data("b")
        });

        let outer = TaskTemplate::new(0, 0, move |ctx, _| {
            let b = ctx.task(&middle).with_finish_scope().with_output_event().spawn().unwrap();
            ctx.add_dependence(b.output_event.unwrap(), first_of_outer_two, 0).unwrap();
            ctx.create_data("a")
        });

        let a = ctx.task(&outer).with_finish_scope().with_output_event().spawn().unwrap();
        let a_out = a.output_event.unwrap();
        ctx.add_dependence(a_out, first_of_all, 0).unwrap();
        ctx.add_dependence(a_out, first_of_outer_two, 0).unwrap();

        assert!(ctx.get(a_out).is_err());
        drain(&mut ctx);

        assert_eq!(text(&ctx, a_out), "a");
        assert_eq!(text(&ctx, first_of_all), "c");
        assert_eq!(text(&ctx, first_of_outer_two), "b");

        // Tasks and finish latches are gone. Left: three outputs, two idem events
        // and three data blocks.
        assert_eq!(runtime.num_live_objects(), 8);

        runtime.recycle_context(ctx);
        runtime.shut_down().wait();
    }

    #[test]
    fn scope_waits_for_pending_children() {
        let (runtime, mut ctx) = single_context();

        let gate = ctx.create_event(EventKind::Sticky);
        let child = TaskTemplate::new(0, 1, |_, _| Guid::NULL);
        let parent = TaskTemplate::new(1, 0, move |ctx, args| {
            let gate = Guid::from_bits(args.params[0]);
            ctx.task(&child).with_deps(&[gate]).spawn().unwrap();
            ctx.task(&child).with_deps(&[gate]).spawn().unwrap();
            Guid::NULL
        });

        let spawned = ctx.task(&parent)
            .with_params(&[gate.to_bits()])
            .with_finish_scope()
            .with_output_event()
            .spawn()
            .unwrap();
        let out = spawned.output_event.unwrap();

        drain(&mut ctx);
        // The scope opener is done but its children are still waiting.
        assert!(ctx.get(out).is_err());
        assert_eq!(ctx.stats().tasks_executed, 1);

        ctx.satisfy(gate, Guid::NULL).unwrap();
        drain(&mut ctx);

        assert_eq!(ctx.get(out), Ok(Guid::NULL));
        assert_eq!(ctx.stats().tasks_executed, 3);

        runtime.recycle_context(ctx);
        runtime.shut_down().wait();
    }

    #[test]
    fn plain_children_inherit_the_scope() {
        let (runtime, mut ctx) = single_context();

        let grandchild = TaskTemplate::new(0, 0, |ctx, _| {
            // Not opening a scope: still accounted for by the enclosing one.
            assert!(ctx.current_task().is_some());
            Guid::NULL
        });
        let child = TaskTemplate::new(0, 0, move |ctx, _| {
            ctx.task(&grandchild).spawn().unwrap();
            Guid::NULL
        });
        let opener = TaskTemplate::new(0, 0, move |ctx, _| {
            ctx.task(&child).spawn().unwrap();
            Guid::NULL
        });

        let spawned = ctx.task(&opener).with_finish_scope().with_output_event().spawn().unwrap();
        let out = spawned.output_event.unwrap();

        // opener, then child: the grandchild is still pending.
        assert!(ctx.keep_busy());
        assert!(ctx.keep_busy());
        assert!(ctx.get(out).is_err());

        assert!(ctx.keep_busy());
        assert!(ctx.get(out).is_ok());
        assert!(!ctx.keep_busy());

        runtime.recycle_context(ctx);
        runtime.shut_down().wait();
    }

    #[test]
    fn destroyed_child_leaves_its_scope() {
        let (runtime, mut ctx) = single_context();

        let gate = ctx.create_event(EventKind::Sticky);
        let children = Arc::new(Mutex::new(Vec::new()));

        let child = TaskTemplate::new(0, 1, |_, _| panic!("destroyed child ran"));
        let opener = {
            let children = Arc::clone(&children);
            TaskTemplate::new(0, 0, move |ctx, _| {
                let spawned = ctx.task(&child).with_deps(&[gate]).spawn().unwrap();
                children.lock().unwrap().push(spawned.task);
                ctx.create_data("opener")
            })
        };

        let spawned = ctx.task(&opener).with_finish_scope().with_output_event().spawn().unwrap();
        let out = spawned.output_event.unwrap();

        drain(&mut ctx);
        assert!(ctx.get(out).is_err());

        let pending = children.lock().unwrap().pop().unwrap();
        ctx.destroy_task(pending).unwrap();

        // The scope still forwards the opener's value.
        assert_eq!(text(&ctx, out), "opener");

        runtime.recycle_context(ctx);
        runtime.shut_down().wait();
    }
}
