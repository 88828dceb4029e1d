use edt_runtime::*;

use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

fn runtime(workers: u32, contexts: u32) -> Runtime {
    let _ = env_logger::builder().is_test(true).try_init();

    Runtime::builder()
        .with_worker_threads(workers)
        .with_contexts(contexts)
        .build()
}

#[test]
fn no_lost_wakeups() {
    const SPAWNERS: usize = 4;
    const TASKS_PER_SPAWNER: usize = 500;
    const TOTAL: usize = SPAWNERS * TASKS_PER_SPAWNER;

    for _ in 0..20 {
        let runtime = runtime(3, SPAWNERS as u32 + 1);
        let mut ctx = runtime.pop_context().unwrap();

        let gate = ctx.create_event(EventKind::Sticky);
        let done = ctx.create_event(EventKind::Sticky);
        let executed = Arc::new(AtomicUsize::new(0));

        let template = {
            let executed = Arc::clone(&executed);
            TaskTemplate::new(0, 1, move |ctx, _| {
                if executed.fetch_add(1, Ordering::SeqCst) + 1 == TOTAL {
                    ctx.satisfy(done, Guid::NULL).unwrap();
                }
                Guid::NULL
            })
        };

        let barrier = Arc::new(Barrier::new(SPAWNERS + 1));
        let mut spawners = Vec::new();
        for _ in 0..SPAWNERS {
            let runtime = runtime.clone();
            let template = Arc::clone(&template);
            let barrier = Arc::clone(&barrier);
            spawners.push(thread::spawn(move || {
                let mut ctx = runtime.pop_context().unwrap();
                barrier.wait();
                for _ in 0..TASKS_PER_SPAWNER {
                    ctx.task(&template).with_deps(&[gate]).spawn().unwrap();
                }
                runtime.recycle_context(ctx);
            }));
        }

        // Satisfy the gate while the spawners are registering on it.
        barrier.wait();
        ctx.satisfy(gate, Guid::NULL).unwrap();

        for spawner in spawners {
            spawner.join().unwrap();
        }

        ctx.wait(done).unwrap();
        assert_eq!(executed.load(Ordering::SeqCst), TOTAL);

        runtime.recycle_context(ctx);
        runtime.shut_down().wait();
    }
}

#[test]
fn slots_satisfied_in_reverse_from_other_threads() {
    let runtime = runtime(2, 2);
    let mut ctx = runtime.pop_context().unwrap();

    let events: Vec<Guid> = (0..3).map(|_| ctx.create_event(EventKind::Sticky)).collect();
    let payloads: Vec<Guid> = (0..3usize).map(|i| ctx.create_data(i)).collect();

    let runs = Arc::new(AtomicUsize::new(0));
    let template = {
        let runs = Arc::clone(&runs);
        TaskTemplate::new(0, 3, move |ctx, args| {
            runs.fetch_add(1, Ordering::SeqCst);
            let order: Vec<usize> = args.deps.iter().map(|dep| *dep.get::<usize>().unwrap()).collect();
            ctx.create_data(order)
        })
    };

    let spawned = ctx.task(&template).with_deps(&events).with_output_event().spawn().unwrap();

    for slot in (0..3).rev() {
        let runtime = runtime.clone();
        let (event, payload) = (events[slot], payloads[slot]);
        let task = spawned.task;
        thread::spawn(move || {
            let mut ctx = runtime.pop_context().unwrap();
            ctx.satisfy(event, payload).unwrap();
            if slot > 0 {
                // The task still waits on slot 0.
                let state = ctx.directory().resolve_task(task).unwrap().state();
                assert_eq!(state, TaskState::Waiting(0));
            }
            runtime.recycle_context(ctx);
        }).join().unwrap();
    }

    let result = ctx.wait(spawned.output_event.unwrap()).unwrap();
    assert_eq!(ctx.data(result).unwrap().get::<Vec<usize>>(), Some(&vec![0, 1, 2]));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    runtime.recycle_context(ctx);
    runtime.shut_down().wait();
}

#[test]
fn finish_scope_waits_for_children_satisfied_elsewhere() {
    for _ in 0..50 {
        let runtime = runtime(3, 3);
        let mut ctx = runtime.pop_context().unwrap();

        let e1 = ctx.create_event(EventKind::Sticky);
        let e2 = ctx.create_event(EventKind::Sticky);
        let b_runs = Arc::new(AtomicUsize::new(0));
        let c_runs = Arc::new(AtomicUsize::new(0));

        let counting = |runs: &Arc<AtomicUsize>| {
            let runs = Arc::clone(runs);
            TaskTemplate::new(0, 1, move |_, _| {
                runs.fetch_add(1, Ordering::SeqCst);
                Guid::NULL
            })
        };
        let b = counting(&b_runs);
        let c = counting(&c_runs);

        let a = TaskTemplate::new(2, 0, move |ctx, args| {
            let (e1, e2) = (Guid::from_bits(args.params[0]), Guid::from_bits(args.params[1]));
            ctx.task(&b).with_deps(&[e1]).spawn().unwrap();
            ctx.task(&c).with_deps(&[e2]).spawn().unwrap();
            Guid::NULL
        });

        let spawned = ctx.task(&a)
            .with_params(&[e1.to_bits(), e2.to_bits()])
            .with_finish_scope()
            .with_output_event()
            .spawn()
            .unwrap();

        let satisfiers: Vec<_> = [e2, e1].iter().map(|&event| {
            let runtime = runtime.clone();
            thread::spawn(move || {
                let mut ctx = runtime.pop_context().unwrap();
                ctx.satisfy(event, Guid::NULL).unwrap();
                runtime.recycle_context(ctx);
            })
        }).collect();

        ctx.wait(spawned.output_event.unwrap()).unwrap();
        assert_eq!(b_runs.load(Ordering::SeqCst), 1);
        assert_eq!(c_runs.load(Ordering::SeqCst), 1);

        for satisfier in satisfiers {
            satisfier.join().unwrap();
        }

        runtime.recycle_context(ctx);
        runtime.shut_down().wait();
    }
}

#[test]
fn recursive_fan_out_completes() {
    // Binary tree of tasks, each node opening its own scope.
    fn node(counter: Arc<AtomicUsize>) -> Arc<TaskTemplate> {
        TaskTemplate::new(1, 0, move |ctx, args| {
            counter.fetch_add(1, Ordering::Relaxed);
            let remaining = args.params[0];
            if remaining > 0 {
                let child = node(Arc::clone(&counter));
                for _ in 0..2 {
                    ctx.task(&child)
                        .with_params(&[remaining - 1])
                        .with_finish_scope()
                        .spawn()
                        .unwrap();
                }
            }
            Guid::NULL
        })
    }

    let runtime = runtime(4, 1);
    let mut ctx = runtime.pop_context().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let root = node(Arc::clone(&counter));
    let spawned = ctx.task(&root)
        .with_params(&[9])
        .with_finish_scope()
        .with_output_event()
        .spawn()
        .unwrap();

    ctx.wait(spawned.output_event.unwrap()).unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), (1 << 10) - 1);

    runtime.recycle_context(ctx);
    runtime.shut_down().wait();

    // Everything but the root's output event is gone.
    assert_eq!(runtime.num_live_objects(), 1);
}
