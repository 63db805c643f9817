//! Cross-execution-context work queues.
//!
//! A [`WorkQueue`] accumulates posted [`Worklet`]s and drains them when its
//! owning execution context runs. Posting is allowed from any context:
//! posts made by the owning context take a fast path guarded only by the
//! core's interrupt-protected section, while posts from any other context
//! (including interrupt context) go through a spinlocked list.
//!
//! The queue coalesces notifications: the `wakeup` hook fires exactly once
//! per empty-to-non-empty transition of a pending list. This is correct
//! because [`WorkQueue::run`] always drains everything present.
use alloc::{boxed::Box, collections::VecDeque};
use core::{
    fmt,
    marker::PhantomData,
    mem,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::{
    irq::IrqSpinlock,
    klock::{self, IrqCell},
    ContextRef, Port,
};

/// A single pending callback unit managed by a [`WorkQueue`].
///
/// Ownership follows the worklet around: it is owned by whichever queue
/// currently holds it, transferred at post and drain. A worklet is therefore
/// in at most one queue at a time by construction.
pub struct Worklet {
    func: Box<dyn FnOnce() + Send>,
}

impl Worklet {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self { func: Box::new(f) }
    }

    fn invoke(self) {
        (self.func)()
    }
}

impl fmt::Debug for Worklet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Worklet").finish_non_exhaustive()
    }
}

bitflags::bitflags! {
    /// State bits of a [`WorkQueue`], stored in an `AtomicU8`.
    struct QueueFlags: u8 {
        /// The local pending list is non-empty.
        const LOCAL_PENDING = 1 << 0;
        /// The foreign pending list is non-empty.
        const FOREIGN_PENDING = 1 << 1;
        /// A `run` invocation is in progress.
        const RUNNING = 1 << 2;
    }
}

/// The result of [`WorkQueue::enter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterOutcome {
    /// The caller is already executing inside this queue's [`WorkQueue::run`]
    /// on the owning context; the worklet was not queued and the caller may
    /// proceed inline.
    AlreadyInside,
    /// The worklet was posted like [`WorkQueue::post`] would.
    Posted,
}

/// A queue of deferred callbacks drained by one owning execution context.
pub struct WorkQueue<Traits: Port> {
    owner: ContextRef,

    /// `QueueFlags`. The pending bits are kept consistent with the lists by
    /// updating them while the respective list's lock is held.
    flags: AtomicU8,

    /// Posts made by the owning execution context.
    local: IrqCell<Traits, VecDeque<Worklet>>,

    /// Posts made by any other context, including interrupt context.
    foreign: IrqSpinlock<VecDeque<Worklet>>,

    /// Invoked once per empty-to-non-empty transition of a pending list,
    /// e.g. to unblock a fiber or ping the owning thread's core.
    wakeup: Option<Box<dyn Fn() + Send + Sync>>,

    _phantom: PhantomData<Traits>,
}

impl<Traits: Port> WorkQueue<Traits> {
    pub fn new(owner: ContextRef) -> Self {
        Self {
            owner,
            flags: AtomicU8::new(0),
            local: IrqCell::new(VecDeque::new()),
            foreign: IrqSpinlock::new(VecDeque::new()),
            wakeup: None,
            _phantom: PhantomData,
        }
    }

    /// Like [`Self::new`], with a wakeup hook.
    pub fn with_wakeup(owner: ContextRef, hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            wakeup: Some(Box::new(hook)),
            ..Self::new(owner)
        }
    }

    /// The execution context that owns (drains) this queue.
    pub fn owner(&self) -> ContextRef {
        self.owner
    }

    /// Post a worklet. Never fails; may be called from any context.
    pub fn post(&self, worklet: Worklet) {
        let local = !Traits::is_interrupt_context() && Traits::current_context() == self.owner;

        let was_pending = if local {
            klock::with::<Traits, _>(|mut token| {
                self.local.write(&mut *token).push_back(worklet);
                let prev = self.flags.fetch_or(QueueFlags::LOCAL_PENDING.bits(), Ordering::AcqRel);
                prev & QueueFlags::LOCAL_PENDING.bits() != 0
            })
        } else {
            let mut list = self.foreign.lock::<Traits>();
            list.push_back(worklet);
            let prev = self
                .flags
                .fetch_or(QueueFlags::FOREIGN_PENDING.bits(), Ordering::AcqRel);
            prev & QueueFlags::FOREIGN_PENDING.bits() != 0
        };

        if !was_pending {
            log::trace!("workqueue: wakeup for {:?}", self.owner);
            if let Some(hook) = &self.wakeup {
                hook();
            }
        }
    }

    /// Whether any work is pending. Non-blocking.
    pub fn check(&self) -> bool {
        let flags = QueueFlags::from_bits_truncate(self.flags.load(Ordering::Acquire));
        flags.intersects(QueueFlags::LOCAL_PENDING | QueueFlags::FOREIGN_PENDING)
    }

    /// Drain the queue, invoking every worklet present at the start of the
    /// call in FIFO order (local posts first, then foreign posts).
    ///
    /// Worklets posted *during* the drain are left for the next `run` call;
    /// they are never executed reentrantly.
    ///
    /// Must be called by the owning execution context, and must not be
    /// reentered; both are fatal logic errors.
    pub fn run(&self) {
        assert!(
            !Traits::is_interrupt_context() && Traits::current_context() == self.owner,
            "WorkQueue::run called from a non-owning context",
        );
        let prev = QueueFlags::from_bits_truncate(
            self.flags.fetch_or(QueueFlags::RUNNING.bits(), Ordering::AcqRel),
        );
        assert!(!prev.contains(QueueFlags::RUNNING), "WorkQueue::run reentered");

        // Splice both pending lists into a private batch, clearing each
        // pending bit while the respective lock is held.
        let mut batch = klock::with::<Traits, _>(|mut token| {
            self.flags
                .fetch_and(!QueueFlags::LOCAL_PENDING.bits(), Ordering::AcqRel);
            mem::take(self.local.write(&mut *token))
        });
        {
            let mut foreign = self.foreign.lock::<Traits>();
            self.flags
                .fetch_and(!QueueFlags::FOREIGN_PENDING.bits(), Ordering::AcqRel);
            batch.append(&mut *foreign);
        }

        log::trace!("workqueue: draining {} worklet(s) for {:?}", batch.len(), self.owner);
        for worklet in batch {
            worklet.invoke();
        }

        self.flags
            .fetch_and(!QueueFlags::RUNNING.bits(), Ordering::Release);
    }

    /// Fast path for code that may already be executing inside this queue's
    /// [`Self::run`] on the owning context: returns
    /// [`EnterOutcome::AlreadyInside`] without queuing in that case, and
    /// otherwise falls back to posting (rather than skipping the worklet).
    pub fn enter(&self, worklet: Worklet) -> EnterOutcome {
        let flags = QueueFlags::from_bits_truncate(self.flags.load(Ordering::Acquire));
        if flags.contains(QueueFlags::RUNNING)
            && !Traits::is_interrupt_context()
            && Traits::current_context() == self.owner
        {
            // `run` is single-threaded per queue, so if the owning context
            // observes RUNNING it is the one inside `run`.
            EnterOutcome::AlreadyInside
        } else {
            self.post(worklet);
            EnterOutcome::Posted
        }
    }
}

impl<Traits: Port> fmt::Debug for WorkQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("owner", &self.owner)
            .field(
                "flags",
                &QueueFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed)),
            )
            .finish_non_exhaustive()
    }
}
