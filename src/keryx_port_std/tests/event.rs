//! Oneshot and bitset events, including cancellation races.
use std::sync::{Arc, Mutex};

use keryx_kernel::{
    cancel::{CancelRegistry, CancelToken},
    event::{
        BitsetEvent, OneshotEvent, WaitNode, WaitResult, ONESHOT_SEQ_IDLE, ONESHOT_SEQ_TRIGGERED,
    },
    workqueue::WorkQueue,
    Port,
};
use keryx_port_std::{with_core, StdPort};

static REGISTRY: CancelRegistry<StdPort> = CancelRegistry::new();

fn owned_queue() -> Arc<WorkQueue<StdPort>> {
    Arc::new(WorkQueue::new(StdPort::current_context()))
}

/// A wait node whose continuation records the results it receives.
fn recording_wait(
    queue: &Arc<WorkQueue<StdPort>>,
    token: CancelToken,
) -> (Arc<WaitNode<StdPort>>, Arc<Mutex<Vec<WaitResult>>>) {
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    let node = WaitNode::new(Arc::clone(queue), token, move |result| {
        sink.lock().unwrap().push(result)
    });
    (node, results)
}

#[test]
fn oneshot_baseline_and_trigger() {
    with_core(|| {
        let queue = owned_queue();
        let event = OneshotEvent::<StdPort>::new();

        // Sequence 0 asks for an immediate baseline answer.
        let (node, results) = recording_wait(&queue, CancelToken::detached());
        event.submit_await(node, 0);
        queue.run();
        assert_eq!(
            *results.lock().unwrap(),
            vec![WaitResult {
                sequence: ONESHOT_SEQ_IDLE,
                bitset: 0,
                cancelled: false,
            }]
        );

        // A wait at the idle sequence pends until the trigger.
        let (node, results) = recording_wait(&queue, CancelToken::detached());
        event.submit_await(node, ONESHOT_SEQ_IDLE);
        queue.run();
        assert!(results.lock().unwrap().is_empty());

        event.trigger();
        assert!(event.is_triggered());
        queue.run();
        assert_eq!(
            *results.lock().unwrap(),
            vec![WaitResult {
                sequence: ONESHOT_SEQ_TRIGGERED,
                bitset: 1,
                cancelled: false,
            }]
        );

        // A late waiter completes without pending.
        let (node, results) = recording_wait(&queue, CancelToken::detached());
        event.submit_await(node, ONESHOT_SEQ_IDLE);
        queue.run();
        assert_eq!(results.lock().unwrap()[0].sequence, ONESHOT_SEQ_TRIGGERED);
    });
}

#[test]
#[should_panic = "triggered twice"]
fn oneshot_double_trigger_panics() {
    with_core(|| {
        let event = OneshotEvent::<StdPort>::new();
        event.trigger();
        event.trigger();
    });
}

#[test]
#[should_panic = "future sequence"]
fn oneshot_await_future_sequence_panics() {
    with_core(|| {
        let queue = owned_queue();
        let event = OneshotEvent::<StdPort>::new();
        let (node, _results) = recording_wait(&queue, CancelToken::detached());
        event.submit_await(node, ONESHOT_SEQ_TRIGGERED);
    });
}

#[test]
fn cancellation_completes_a_pending_wait() {
    with_core(|| {
        let queue = owned_queue();
        let event = OneshotEvent::<StdPort>::new();
        let guard = REGISTRY.register_tag(21).unwrap();

        let (node, results) = recording_wait(&queue, guard.token());
        event.submit_await(node, ONESHOT_SEQ_IDLE);

        assert_eq!(REGISTRY.cancel(21), 1);
        queue.run();
        {
            let results = results.lock().unwrap();
            assert_eq!(results.len(), 1);
            assert!(results[0].cancelled);
            assert_eq!(results[0].bitset, 0);
        }

        // The trigger must not complete the cancelled wait a second time.
        event.trigger();
        queue.run();
        assert_eq!(results.lock().unwrap().len(), 1);

        REGISTRY.unregister_tag(guard);
    });
}

#[test]
fn trigger_wins_the_race_against_a_later_cancel() {
    with_core(|| {
        let queue = owned_queue();
        let event = OneshotEvent::<StdPort>::new();
        let guard = REGISTRY.register_tag(22).unwrap();

        let (node, results) = recording_wait(&queue, guard.token());
        event.submit_await(node, ONESHOT_SEQ_IDLE);

        event.trigger();
        // The registration is still reached, but the wait already
        // completed normally.
        assert_eq!(REGISTRY.cancel(22), 1);
        queue.run();
        {
            let results = results.lock().unwrap();
            assert_eq!(results.len(), 1);
            assert!(!results[0].cancelled);
            assert_eq!(results[0].sequence, ONESHOT_SEQ_TRIGGERED);
        }

        REGISTRY.unregister_tag(guard);
    });
}

#[test]
fn waiting_on_a_cancelled_token_completes_immediately() {
    with_core(|| {
        let queue = owned_queue();
        let event = OneshotEvent::<StdPort>::new();
        let guard = REGISTRY.register_tag(23).unwrap();
        assert_eq!(REGISTRY.cancel(23), 1);

        let (node, results) = recording_wait(&queue, guard.token());
        event.submit_await(node, ONESHOT_SEQ_IDLE);
        queue.run();
        assert!(results.lock().unwrap()[0].cancelled);

        REGISTRY.unregister_tag(guard);
    });
}

#[test]
fn a_trigger_racing_the_submission_is_never_missed() {
    with_core(|| {
        let queue = owned_queue();
        for i in 0..200 {
            let event = Arc::new(OneshotEvent::<StdPort>::new());
            let (node, results) = recording_wait(&queue, CancelToken::detached());

            let racer = Arc::clone(&event);
            let trigger = std::thread::spawn(move || {
                if i % 2 == 0 {
                    std::thread::yield_now();
                }
                racer.trigger();
            });
            event.submit_await(node, ONESHOT_SEQ_IDLE);
            trigger.join().unwrap();

            // Whichever side won, the wait must have been completed exactly
            // once, never left parked.
            queue.run();
            let results = results.lock().unwrap();
            assert_eq!(results.len(), 1, "iteration {}", i);
            assert_eq!(results[0].sequence, ONESHOT_SEQ_TRIGGERED);
            assert!(!results[0].cancelled);
        }
    });
}

#[test]
fn bitset_trigger_and_await() {
    with_core(|| {
        let queue = owned_queue();
        let event = BitsetEvent::<StdPort>::new();
        assert_eq!(event.sequence(), 1);

        event.trigger(0b0010);
        assert_eq!(event.sequence(), 2);

        // Awaiting from before the trigger completes immediately.
        let (node, results) = recording_wait(&queue, CancelToken::detached());
        event.submit_await(node, 1);
        queue.run();
        assert_eq!(
            *results.lock().unwrap(),
            vec![WaitResult {
                sequence: 2,
                bitset: 0b0010,
                cancelled: false,
            }]
        );

        // Sequence 0 reports everything that has ever fired.
        let (node, results) = recording_wait(&queue, CancelToken::detached());
        event.submit_await(node, 0);
        queue.run();
        assert_eq!(results.lock().unwrap()[0].bitset, 0b0010);

        // A wait at the current sequence pends for the next trigger and
        // sees only the new bits.
        let (node, results) = recording_wait(&queue, CancelToken::detached());
        event.submit_await(node, 2);
        queue.run();
        assert!(results.lock().unwrap().is_empty());

        event.trigger(0b1000);
        queue.run();
        assert_eq!(
            *results.lock().unwrap(),
            vec![WaitResult {
                sequence: 3,
                bitset: 0b1000,
                cancelled: false,
            }]
        );

        // Catching up from further back reports the union.
        let (node, results) = recording_wait(&queue, CancelToken::detached());
        event.submit_await(node, 1);
        queue.run();
        assert_eq!(results.lock().unwrap()[0].bitset, 0b1010);
        assert_eq!(results.lock().unwrap()[0].sequence, 3);
    });
}

#[test]
fn bitset_wakes_every_pending_waiter() {
    with_core(|| {
        let queue = owned_queue();
        let event = BitsetEvent::<StdPort>::new();

        let waits: Vec<_> = (0..3)
            .map(|_| {
                let (node, results) = recording_wait(&queue, CancelToken::detached());
                event.submit_await(node, 1);
                results
            })
            .collect();

        event.trigger(0b1);
        queue.run();
        for results in waits {
            let results = results.lock().unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].bitset, 0b1);
        }
    });
}

#[test]
fn bitset_cancellation_races_are_settled_exactly_once() {
    with_core(|| {
        let queue = owned_queue();
        let event = BitsetEvent::<StdPort>::new();
        let guard = REGISTRY.register_tag(24).unwrap();

        let (node, results) = recording_wait(&queue, guard.token());
        event.submit_await(node, 1);

        assert_eq!(REGISTRY.cancel(24), 1);
        event.trigger(0b100);
        queue.run();
        {
            let results = results.lock().unwrap();
            assert_eq!(results.len(), 1);
            assert!(results[0].cancelled);
        }

        REGISTRY.unregister_tag(guard);
    });
}

#[test]
fn bitset_triggers_racing_submissions_are_never_missed() {
    with_core(|| {
        let queue = owned_queue();
        for i in 0..200 {
            let event = Arc::new(BitsetEvent::<StdPort>::new());
            let (node, results) = recording_wait(&queue, CancelToken::detached());

            let racer = Arc::clone(&event);
            let trigger = std::thread::spawn(move || {
                if i % 2 == 0 {
                    std::thread::yield_now();
                }
                racer.trigger(0b1);
            });
            event.submit_await(node, 1);
            trigger.join().unwrap();

            queue.run();
            let results = results.lock().unwrap();
            assert_eq!(results.len(), 1, "iteration {}", i);
            assert_eq!(results[0].bitset, 0b1);
            assert_eq!(results[0].sequence, 2);
        }
    });
}

#[test]
#[should_panic = "future sequence"]
fn bitset_await_future_sequence_panics() {
    with_core(|| {
        let queue = owned_queue();
        let event = BitsetEvent::<StdPort>::new();
        let (node, _results) = recording_wait(&queue, CancelToken::detached());
        event.submit_await(node, 99);
    });
}

#[test]
fn sequence_is_monotonic_across_triggers() {
    with_core(|| {
        let event = BitsetEvent::<StdPort>::new();
        let mut last = event.sequence();
        for bits in [0b1, 0b10, 0b1, 0b11110000] {
            event.trigger(bits);
            let seq = event.sequence();
            assert_eq!(seq, last + 1);
            last = seq;
        }
        // Triggering nothing does not advance the sequence.
        event.trigger(0);
        assert_eq!(event.sequence(), last);
    });
}
