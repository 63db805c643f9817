//! Work queue behavior on the simulator port.
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use keryx_kernel::{
    workqueue::{EnterOutcome, WorkQueue, Worklet},
    ContextRef, Port,
};
use keryx_port_std::{simulate_interrupt, with_core, StdPort};

type Queue = WorkQueue<StdPort>;

fn owned_queue() -> Arc<Queue> {
    Arc::new(Queue::new(StdPort::current_context()))
}

#[test]
fn drains_in_fifo_order() {
    with_core(|| {
        let queue = owned_queue();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = Arc::clone(&order);
            queue.post(Worklet::new(move || order.lock().unwrap().push(i)));
        }
        assert!(queue.check());
        queue.run();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert!(!queue.check());
    });
}

#[test]
fn interrupt_posts_run_in_post_order() {
    with_core(|| {
        let wakeups = Arc::new(AtomicUsize::new(0));
        let queue = {
            let wakeups = Arc::clone(&wakeups);
            Arc::new(Queue::with_wakeup(StdPort::current_context(), move || {
                wakeups.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let order = Arc::new(Mutex::new(Vec::new()));
        simulate_interrupt(|| {
            for name in ["a", "b"] {
                let order = Arc::clone(&order);
                queue.post(Worklet::new(move || order.lock().unwrap().push(name)));
            }
        });
        // Two posts to an idle queue, one notification.
        assert_eq!(wakeups.load(Ordering::SeqCst), 1);
        queue.run();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    });
}

#[test]
fn wakeup_fires_once_per_pending_transition() {
    with_core(|| {
        let wakeups = Arc::new(AtomicUsize::new(0));
        let queue = {
            let wakeups = Arc::clone(&wakeups);
            Arc::new(Queue::with_wakeup(StdPort::current_context(), move || {
                wakeups.fetch_add(1, Ordering::SeqCst);
            }))
        };

        // Repeated same-context posts coalesce into one wakeup.
        queue.post(Worklet::new(|| {}));
        queue.post(Worklet::new(|| {}));
        queue.post(Worklet::new(|| {}));
        assert_eq!(wakeups.load(Ordering::SeqCst), 1);

        queue.run();

        // Drained; the next post is a fresh transition.
        queue.post(Worklet::new(|| {}));
        assert_eq!(wakeups.load(Ordering::SeqCst), 2);
        queue.run();
    });
}

#[test]
fn worklets_posted_during_run_wait_for_next_run() {
    with_core(|| {
        let queue = owned_queue();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let queue2 = Arc::clone(&queue);
            let hits = Arc::clone(&hits);
            queue.post(Worklet::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                let hits = Arc::clone(&hits);
                queue2.post(Worklet::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }));
            }));
        }
        queue.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        queue.run();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    });
}

#[test]
fn enter_detects_a_drain_in_progress() {
    with_core(|| {
        let queue = owned_queue();

        // Outside `run`, `enter` degrades to a post.
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            let outcome = queue.enter(Worklet::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
            assert_eq!(outcome, EnterOutcome::Posted);
        }
        queue.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Inside `run` on the owning context, the caller may proceed inline.
        {
            let queue2 = Arc::clone(&queue);
            queue.post(Worklet::new(move || {
                let outcome = queue2.enter(Worklet::new(|| unreachable!()));
                assert_eq!(outcome, EnterOutcome::AlreadyInside);
            }));
        }
        queue.run();
    });
}

#[test]
fn no_posts_lost_across_threads() {
    with_core(|| {
        let queue = owned_queue();
        let hits = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let hits = Arc::clone(&hits);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let hits = Arc::clone(&hits);
                        queue.post(Worklet::new(move || {
                            hits.fetch_add(1, Ordering::Relaxed);
                        }));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        queue.run();
        assert_eq!(hits.load(Ordering::Relaxed), 400);
    });
}

#[test]
fn general_queue_is_owned_by_the_boot_context() {
    with_core(|| {
        // Impersonate the context that booted the core so this thread may
        // drain its general-purpose queue.
        keryx_port_std::set_context(keryx_port_std::boot_context());
        let queue = keryx_kernel::general_queue::<StdPort>();
        assert_eq!(queue.owner(), keryx_port_std::boot_context());

        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            queue.post(Worklet::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        queue.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    });
}

#[test]
#[should_panic = "non-owning context"]
fn run_from_a_foreign_context_panics() {
    with_core(|| {
        let queue = Queue::new(ContextRef::from_raw(!0));
        queue.run();
    });
}

#[test]
#[should_panic = "reentered"]
fn reentrant_run_panics() {
    with_core(|| {
        let queue = owned_queue();
        let queue2 = Arc::clone(&queue);
        queue.post(Worklet::new(move || queue2.run()));
        queue.run();
    });
}
