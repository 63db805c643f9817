//! Self-interrupt calls.
//!
//! A [`SelfIntCall`] schedules a callback to run in interrupt context on the
//! *same* core, once interrupts are (re-)enabled, by pushing itself onto a
//! core-local lock-free list and sending a self-directed IPI. This lets code
//! running in restricted contexts (e.g. very-low-level exception handlers)
//! defer work to a context where normal kernel facilities are usable,
//! without blocking or allocating.
use core::{
    fmt,
    marker::PhantomData,
    ptr,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

use crate::Port;

/// Head of a core's list of scheduled self-interrupt calls.
///
/// The producer side pushes with a compare-and-swap loop; the consumer side
/// ([`run_scheduled_calls`]) detaches the whole list with a single swap, so
/// no CAS is needed there.
pub(crate) struct ListHead<Traits: Port> {
    head: AtomicPtr<SelfIntCall<Traits>>,
}

impl<Traits: Port> ListHead<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// A schedulable callback that runs in interrupt context on the scheduling
/// core.
///
/// Instances are statically allocated (the scheduling API requires
/// `&'static self`) and embed their own list linkage, so scheduling never
/// allocates.
pub struct SelfIntCall<Traits: Port> {
    /// Exactly-once admission: set by the first `schedule` since the last
    /// invocation, cleared by `run_scheduled_calls` right before the
    /// callback runs.
    scheduled: AtomicBool,
    next: AtomicPtr<Self>,
    handler: fn(&'static Self),
    _phantom: PhantomData<Traits>,
}

impl<Traits: Port> SelfIntCall<Traits> {
    pub const fn new(handler: fn(&'static Self)) -> Self {
        Self {
            scheduled: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
            handler,
            _phantom: PhantomData,
        }
    }

    /// Schedule the callback to run in interrupt context on the calling
    /// core. Calling `schedule` while already scheduled is a no-op, not a
    /// double invocation.
    ///
    /// A callback that calls `schedule` on itself is safe and causes a fresh
    /// invocation via a future interrupt; it cannot loop synchronously.
    pub fn schedule(&'static self) {
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let head = &Traits::core_state().selfint_head.head;
        let this = self as *const Self as *mut Self;
        let mut cur = head.load(Ordering::Relaxed);
        loop {
            self.next.store(cur, Ordering::Relaxed);
            match head.compare_exchange_weak(cur, this, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        log::trace!("selfint: scheduled, pending self-IPI");
        // Safety: we are the kernel
        unsafe {
            Traits::pend_self_interrupt();
        }
    }

    /// Whether the call is currently scheduled.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }
}

impl<Traits: Port> fmt::Debug for SelfIntCall<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SelfIntCall")
            .field("scheduled", &self.is_scheduled())
            .finish_non_exhaustive()
    }
}

/// Detach and invoke every scheduled self-interrupt call on the calling
/// core.
///
/// Invoked by the interrupt entry path of the self-directed IPI.
/// Precondition: interrupts are disabled (interrupt context).
pub fn run_scheduled_calls<Traits: Port>() {
    debug_assert!(Traits::is_interrupt_context());

    let head = &Traits::core_state().selfint_head.head;
    let mut p = head.swap(ptr::null_mut(), Ordering::Acquire);
    while !p.is_null() {
        // Safety: Every node in the list was pushed via `schedule`, which
        //         requires `&'static self`.
        let call: &'static SelfIntCall<Traits> = unsafe { &*p };
        let next = call.next.swap(ptr::null_mut(), Ordering::Relaxed);
        call.scheduled.store(false, Ordering::Release);
        (call.handler)(call);
        p = next;
    }
}
