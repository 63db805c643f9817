//! Completion-based event objects.
//!
//! Waits are asynchronous: a waiter submits a [`WaitNode`] carrying a
//! continuation, and the event later completes the node by posting the
//! continuation to the waiter's work queue. A wait never blocks the
//! submitting context.
//!
//! Every completion carries a sequence number. Waiters pass the last
//! sequence they observed; an event whose state already advanced past that
//! sequence completes the wait immediately, which closes the lost-wakeup
//! window between observing state and submitting a wait.
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    cancel::CancelToken,
    irq::IrqSpinlock,
    workqueue::{WorkQueue, Worklet},
    Port,
};

/// Number of distinct bits a [`BitsetEvent`] tracks.
pub const BITSET_EVENT_BITS: usize = 32;

/// The outcome of a completed wait.
///
/// Cancellation is an ordinary result, not an error escape hatch; every
/// waiter must inspect [`cancelled`](Self::cancelled).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitResult {
    /// The event's sequence number at completion time.
    pub sequence: u64,
    /// The bits that advanced past the sequence the waiter had observed.
    /// Always `0` for a cancelled or baseline completion.
    pub bitset: u32,
    /// The wait was cut short by cancellation.
    pub cancelled: bool,
}

type Continuation = Box<dyn FnOnce(WaitResult) + Send>;

/// One pending wait. Created by the waiter, completed exactly once by the
/// event (or by cancellation).
pub struct WaitNode<Traits: Port> {
    /// The sequence the waiter had observed when it submitted the wait.
    since: AtomicU64,
    result: spin::Mutex<Option<WaitResult>>,
    token: CancelToken,
    queue: Arc<WorkQueue<Traits>>,
    continuation: spin::Mutex<Option<Continuation>>,
}

impl<Traits: Port> WaitNode<Traits> {
    pub fn new(
        queue: Arc<WorkQueue<Traits>>,
        token: CancelToken,
        continuation: impl FnOnce(WaitResult) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            since: AtomicU64::new(0),
            result: spin::Mutex::new(None),
            token,
            queue,
            continuation: spin::Mutex::new(Some(Box::new(continuation))),
        })
    }

    /// The result recorded so far, if the wait has completed.
    pub fn result(&self) -> Option<WaitResult> {
        *self.result.lock()
    }

    /// Records the result and posts the continuation to the waiter's queue.
    fn complete(self: &Arc<Self>, result: WaitResult) {
        let prev = self.result.lock().replace(result);
        debug_assert!(prev.is_none(), "wait node completed twice");
        if let Some(continuation) = self.continuation.lock().take() {
            self.queue.post(Worklet::new(move || continuation(result)));
        }
    }

    /// Completes the node as cancelled. Installed as the node's
    /// cancellation callback while the wait is pending.
    fn complete_cancelled(self: &Arc<Self>, sequence: u64) {
        self.complete(WaitResult {
            sequence,
            bitset: 0,
            cancelled: true,
        });
    }

    /// Arms the node's cancellation token to complete the node as
    /// cancelled. Returns `false` if the token is already cancelled, in
    /// which case nothing was armed.
    fn arm_cancellation(self: &Arc<Self>, sequence: u64) -> bool {
        let node = Arc::clone(self);
        self.token
            .arm(Box::new(move || node.complete_cancelled(sequence)))
    }
}

impl<Traits: Port> fmt::Debug for WaitNode<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitNode")
            .field("since", &self.since.load(Ordering::Relaxed))
            .field("result", &*self.result.lock())
            .finish_non_exhaustive()
    }
}

/// Sequence numbers for [`OneshotEvent`]. The event is at sequence
/// `ONESHOT_SEQ_IDLE` until triggered and `ONESHOT_SEQ_TRIGGERED` after.
pub const ONESHOT_SEQ_IDLE: u64 = 1;
pub const ONESHOT_SEQ_TRIGGERED: u64 = 2;

struct OneshotState<Traits: Port> {
    triggered: bool,
    waiters: Vec<Arc<WaitNode<Traits>>>,
}

/// An event that fires at most once. Triggering it a second time is a
/// fatal logic error.
pub struct OneshotEvent<Traits: Port> {
    inner: IrqSpinlock<OneshotState<Traits>>,
}

impl<Traits: Port> OneshotEvent<Traits> {
    pub const fn new() -> Self {
        Self {
            inner: IrqSpinlock::new(OneshotState {
                triggered: false,
                waiters: Vec::new(),
            }),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.lock::<Traits>().triggered
    }

    /// Fires the event, completing every pending wait that cancellation
    /// has not already claimed.
    pub fn trigger(&self) {
        let waiters = {
            let mut inner = self.inner.lock::<Traits>();
            assert!(!inner.triggered, "oneshot event triggered twice");
            inner.triggered = true;
            core::mem::take(&mut inner.waiters)
        };
        log::trace!("oneshot: triggered, waking {} waiter(s)", waiters.len());
        for node in waiters {
            if node.token.try_reset() {
                node.complete(WaitResult {
                    sequence: ONESHOT_SEQ_TRIGGERED,
                    bitset: 1,
                    cancelled: false,
                });
            }
        }
    }

    /// Submits a wait. `sequence` is the last sequence the waiter observed:
    /// `0` asks for an immediate baseline answer, `ONESHOT_SEQ_IDLE` waits
    /// for the trigger. Passing a sequence the event can never have reached
    /// is a fatal logic error.
    pub fn submit_await(&self, node: Arc<WaitNode<Traits>>, sequence: u64) {
        assert!(
            sequence <= ONESHOT_SEQ_IDLE,
            "wait submitted for a future sequence"
        );

        // The state check, the arm, and the enqueue share one lock
        // acquisition, so a concurrent `trigger` is ordered either before
        // the check (and completes the wait immediately) or after the
        // enqueue (and finds the waiter on the list); it can never fall in
        // between. Completions are posted after the lock is released.
        let immediate = {
            let mut inner = self.inner.lock::<Traits>();
            if inner.triggered {
                Some(WaitResult {
                    sequence: ONESHOT_SEQ_TRIGGERED,
                    bitset: 1,
                    cancelled: false,
                })
            } else if sequence == 0 {
                Some(WaitResult {
                    sequence: ONESHOT_SEQ_IDLE,
                    bitset: 0,
                    cancelled: false,
                })
            } else {
                node.since.store(sequence, Ordering::Relaxed);
                if node.arm_cancellation(sequence) {
                    inner.waiters.push(Arc::clone(&node));
                    None
                } else {
                    Some(WaitResult {
                        sequence,
                        bitset: 0,
                        cancelled: true,
                    })
                }
            }
        };
        if let Some(result) = immediate {
            node.complete(result);
        }
    }
}

impl<Traits: Port> Default for OneshotEvent<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: Port> fmt::Debug for OneshotEvent<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneshotEvent").finish_non_exhaustive()
    }
}

struct BitsetState<Traits: Port> {
    /// Monotonic; advances by one per trigger. Starts at `1` so that a
    /// submitted sequence of `0` always reads as "behind".
    sequence: u64,
    /// Per bit, the sequence at which the bit last fired.
    bit_seq: [u64; BITSET_EVENT_BITS],
    waiters: Vec<Arc<WaitNode<Traits>>>,
}

impl<Traits: Port> BitsetState<Traits> {
    /// The bits that fired after `since`.
    fn bits_since(&self, since: u64) -> u32 {
        let mut mask = 0u32;
        for (bit, &seq) in self.bit_seq.iter().enumerate() {
            if seq > since {
                mask |= 1 << bit;
            }
        }
        mask
    }
}

/// An event tracking 32 independently triggerable bits. Each trigger
/// advances a shared sequence number; waiters learn which bits fired since
/// the sequence they last saw.
pub struct BitsetEvent<Traits: Port> {
    inner: IrqSpinlock<BitsetState<Traits>>,
}

impl<Traits: Port> BitsetEvent<Traits> {
    pub const fn new() -> Self {
        Self {
            inner: IrqSpinlock::new(BitsetState {
                sequence: 1,
                bit_seq: [0; BITSET_EVENT_BITS],
                waiters: Vec::new(),
            }),
        }
    }

    /// The current sequence number.
    pub fn sequence(&self) -> u64 {
        self.inner.lock::<Traits>().sequence
    }

    /// Fires the bits in `bits`, advancing the sequence and waking every
    /// pending wait that cancellation has not already claimed. Firing no
    /// bits is a no-op.
    pub fn trigger(&self, bits: u32) {
        if bits == 0 {
            return;
        }
        let (sequence, waiters) = {
            let mut inner = self.inner.lock::<Traits>();
            inner.sequence += 1;
            let sequence = inner.sequence;
            for bit in 0..BITSET_EVENT_BITS {
                if bits & (1 << bit) != 0 {
                    inner.bit_seq[bit] = sequence;
                }
            }
            (sequence, core::mem::take(&mut inner.waiters))
        };
        log::trace!(
            "bitset: trigger {:#x} -> seq {}, waking {} waiter(s)",
            bits,
            sequence,
            waiters.len()
        );
        for node in waiters {
            if node.token.try_reset() {
                let since = node.since.load(Ordering::Relaxed);
                // The freshly fired bits are newer than any waiter's
                // sequence, so the mask is never empty here.
                let inner = self.inner.lock::<Traits>();
                let mask = inner.bits_since(since);
                let seq = inner.sequence;
                drop(inner);
                node.complete(WaitResult {
                    sequence: seq,
                    bitset: mask,
                    cancelled: false,
                });
            }
        }
    }

    /// Submits a wait for any bit to fire after `sequence`. If bits fired
    /// already, the wait completes immediately with those bits; otherwise
    /// it pends until the next trigger. Passing a sequence the event has
    /// not reached yet is a fatal logic error.
    pub fn submit_await(&self, node: Arc<WaitNode<Traits>>, sequence: u64) {
        // Armed and enqueued under the same lock acquisition as the
        // sequence check; see [`OneshotEvent::submit_await`].
        let immediate = {
            let mut inner = self.inner.lock::<Traits>();
            assert!(
                sequence <= inner.sequence,
                "wait submitted for a future sequence"
            );
            if sequence < inner.sequence {
                Some(WaitResult {
                    sequence: inner.sequence,
                    bitset: inner.bits_since(sequence),
                    cancelled: false,
                })
            } else {
                node.since.store(sequence, Ordering::Relaxed);
                if node.arm_cancellation(sequence) {
                    inner.waiters.push(Arc::clone(&node));
                    None
                } else {
                    Some(WaitResult {
                        sequence,
                        bitset: 0,
                        cancelled: true,
                    })
                }
            }
        };
        if let Some(result) = immediate {
            node.complete(result);
        }
    }
}

impl<Traits: Port> Default for BitsetEvent<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: Port> fmt::Debug for BitsetEvent<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitsetEvent").finish_non_exhaustive()
    }
}
