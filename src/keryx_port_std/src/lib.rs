//! Simulator port of the Keryx kernel substrate for a hosted environment.
//!
//! Each OS thread models one execution context of a single simulated core.
//! "Disabling interrupts" is thread-local bookkeeping: a per-thread nesting
//! counter plus a per-thread "in interrupt handler" flag. A self-directed
//! interrupt pended while the pending thread has interrupts masked is
//! serviced when that thread's outermost [`Port::release_irq`] unmasks them,
//! which reproduces the delivery order the kernel relies on.
//!
//! The port also carries the scaffolding the integration tests are built
//! on: [`with_core`] serializes tests sharing the simulated core's global
//! state, and [`simulate_interrupt`] runs a closure in interrupt context.
use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Once, OnceLock,
    },
};

use keryx_kernel::{workqueue::WorkQueue, ContextRef, CoreState, Port};

/// Used by the test scaffolding. Re-exported for downstream test crates.
pub extern crate env_logger;

/// The port type. All kernel objects in this crate's tests are
/// parameterized by this.
pub struct StdPort;

static CORE_STATE: CoreState<StdPort> = CoreState::new();

/// Counts [`Port::pend_reschedule`] invocations, see [`take_reschedules`].
static RESCHEDULES: AtomicUsize = AtomicUsize::new(0);

/// Source of per-thread context identities. `0` is `ContextRef::INVALID`.
static NEXT_CONTEXT: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Interrupt-protected-section nesting depth of this thread.
    static IRQ_NESTING: Cell<usize> = const { Cell::new(0) };
    /// Whether this thread is currently running a simulated interrupt
    /// handler.
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
    /// A self-directed interrupt is pended and waiting for this thread to
    /// unmask interrupts.
    static IPI_PENDING: Cell<bool> = const { Cell::new(false) };
    /// This thread's context identity; assigned lazily, overridable with
    /// [`set_context`].
    static CONTEXT: Cell<usize> = const { Cell::new(0) };
}

/// Run every pended self-directed interrupt, in interrupt context.
///
/// A handler that re-pends is serviced by another pass of the loop, i.e.
/// by a fresh simulated interrupt.
fn service_pending_ipi() {
    while IPI_PENDING.with(|c| c.replace(false)) {
        log::trace!("taking simulated self-interrupt");
        IN_INTERRUPT.with(|c| c.set(true));
        keryx_kernel::selfint::run_scheduled_calls::<StdPort>();
        IN_INTERRUPT.with(|c| c.set(false));
    }
}

unsafe impl Port for StdPort {
    fn core_state() -> &'static CoreState<Self> {
        &CORE_STATE
    }

    unsafe fn acquire_irq() {
        IRQ_NESTING.with(|c| c.set(c.get() + 1));
    }

    unsafe fn release_irq() {
        let depth = IRQ_NESTING.with(|c| {
            let depth = c.get();
            assert!(depth > 0, "`release_irq` without a matching `acquire_irq`");
            c.set(depth - 1);
            depth - 1
        });
        if depth == 0 && !Self::is_interrupt_context() {
            service_pending_ipi();
        }
    }

    fn irq_protected() -> bool {
        IRQ_NESTING.with(|c| c.get()) > 0 || Self::is_interrupt_context()
    }

    fn current_context() -> ContextRef {
        let raw = CONTEXT.with(|c| {
            if c.get() == 0 {
                c.set(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed));
            }
            c.get()
        });
        ContextRef::from_raw(raw)
    }

    fn is_interrupt_context() -> bool {
        IN_INTERRUPT.with(|c| c.get())
    }

    unsafe fn pend_self_interrupt() {
        IPI_PENDING.with(|c| c.set(true));
        if !Self::irq_protected() {
            // Interrupts are unmasked, so the interrupt is taken at once.
            service_pending_ipi();
        }
    }

    unsafe fn pend_reschedule() {
        log::trace!("reschedule requested");
        RESCHEDULES.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fixes this thread's [`Port::current_context`] answer, e.g. to make it
/// impersonate a queue's owning context.
pub fn set_context(context: ContextRef) {
    CONTEXT.with(|c| c.set(context.as_raw()));
}

/// Runs `f` in a simulated interrupt handler on the calling thread, then
/// services any self-directed interrupts `f` pended.
pub fn simulate_interrupt<R>(f: impl FnOnce() -> R) -> R {
    assert!(
        !StdPort::is_interrupt_context(),
        "nested `simulate_interrupt`"
    );
    IN_INTERRUPT.with(|c| c.set(true));
    let ret = f();
    IN_INTERRUPT.with(|c| c.set(false));
    if IRQ_NESTING.with(|c| c.get()) == 0 {
        service_pending_ipi();
    }
    ret
}

/// Takes and resets the number of reschedule requests the kernel has made.
pub fn take_reschedules() -> usize {
    RESCHEDULES.swap(0, Ordering::Relaxed)
}

/// The context that booted the simulated core; it owns the general-purpose
/// work queue.
pub fn boot_context() -> ContextRef {
    *BOOT_CONTEXT.get().expect("`with_core` has not run yet")
}

static BOOT_CONTEXT: OnceLock<ContextRef> = OnceLock::new();

/// Serializes access to the simulated core and makes sure it is booted.
///
/// Every test touching kernel state runs inside this. The first caller in
/// the process boots the core, installing the general-purpose work queue
/// with the calling thread's context as its owner (see [`boot_context`]).
pub fn with_core<R>(f: impl FnOnce() -> R) -> R {
    static LOCK: Mutex<()> = Mutex::new(());
    static BOOT: Once = Once::new();

    // A panicking test (e.g. `#[should_panic]`) poisons the lock; the
    // global state it guards is reinitialized by each test, so keep going.
    let _guard = match LOCK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    BOOT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        let owner = StdPort::current_context();
        let _ = BOOT_CONTEXT.set(owner);
        keryx_kernel::init_core::<StdPort>(
            (keryx_kernel::ipl::NUM_IPL_LEVELS - 1) as keryx_kernel::ipl::IplLevel,
            Arc::new(WorkQueue::new(owner)),
        );
    });
    f()
}
