//! The interrupt-safe concurrency and deferred-work substrate of the Keryx
//! microkernel.
//!
//! This crate provides the layer that lets interrupt handlers, kernel fibers,
//! and kernel threads safely share state, hand work to one another, and
//! cancel in-flight operations without deadlock or lost wakeups:
//!
//!  - [`irq::IrqMutex`], the nested interrupt-disabling mutex, and
//!    [`ipl::IplGuard`], monotonic priority-level escalation with
//!    deferred-execution-on-descent.
//!  - [`workqueue::WorkQueue`], cross-execution-context callback queues.
//!  - [`selfint::SelfIntCall`], scheduling a callback to run in interrupt
//!    context via a self-directed interrupt.
//!  - [`cancel::CancelRegistry`], the tagged cancellation registry.
//!  - [`event::OneshotEvent`] and [`event::BitsetEvent`], coroutine-style
//!    wake-up primitives built on the above.
//!
//! Everything is parameterized by a [`Port`] implementation supplying the
//! machine-dependent primitives (interrupt control, self-IPI, execution
//! context identity). The `keryx_port_std` crate provides a hosted port used
//! for testing.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::AtomicBool;

pub mod utils;

pub mod cancel;
pub mod error;
pub mod event;
pub mod ipl;
pub mod irq;
mod klock;
pub mod selfint;
pub mod workqueue;

use crate::utils::Init;

/// Identity of an execution context (a kernel thread or fiber).
///
/// Contexts are compared by identity and never dereferenced by this crate.
/// The scheduler assigns one `ContextRef` per thread and one per fiber; the
/// value is typically derived from the address of the context's control
/// block.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextRef(usize);

impl ContextRef {
    /// A reserved value meaning "no context", used before the scheduler has
    /// assigned one.
    pub const INVALID: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ContextRef({:#x})", self.0)
    }
}

/// The machine-dependent primitives this crate is built on.
///
/// # Safety
///
/// The implementor must uphold the following for every method's stated
/// contract, and additionally:
///
///  - [`Self::core_state`] must return the calling core's instance, and the
///    same instance for the lifetime of the core.
///  - [`Self::acquire_irq`]`/`[`Self::release_irq`] must implement a
///    *recursive*, core-local interrupt-protected section: the outermost
///    `acquire_irq` disables interrupts on the calling core and records
///    whether they were previously enabled, the matching outermost
///    `release_irq` restores that state, and nested pairs only adjust a
///    counter ([ref:irq_mutex_nesting]).
///  - Kernel-lock-guarded state (see `klock`) must only ever be reached from
///    the execution contexts belonging to this `Port` instance's core.
pub unsafe trait Port: Sized + Send + Sync + 'static {
    /// Get the calling core's [`CoreState`].
    ///
    /// Must be called while preemption/migration is impossible, i.e. while
    /// interrupts are disabled or the caller is pinned to a core.
    fn core_state() -> &'static CoreState<Self>;

    /// Enter the core-local interrupt-protected section. Recursive.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn acquire_irq();

    /// Leave the interrupt-protected section entered by [`Self::acquire_irq`].
    ///
    /// # Safety
    ///
    /// Must be paired with a preceding `acquire_irq` on the same core.
    unsafe fn release_irq();

    /// Whether the calling core is inside an interrupt-protected section.
    fn irq_protected() -> bool;

    /// The identity of the currently running thread or fiber.
    fn current_context() -> ContextRef;

    /// Whether the caller is running in interrupt context.
    fn is_interrupt_context() -> bool;

    /// Send a self-directed interrupt to the calling core. The interrupt
    /// entry path is expected to call [`selfint::run_scheduled_calls`].
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn pend_self_interrupt();

    /// Request a local reschedule. This is the fixed handler invoked for
    /// deferred priority levels ([`ipl::defer_work`]).
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn pend_reschedule();
}

/// Per-core kernel state. One instance exists per physical core, anchored by
/// [`Port::core_state`], created at core bring-up and alive for the lifetime
/// of the system.
///
/// All fields are mutated only by code running *on* that core, with
/// interrupts disabled; see the module documentation of `klock` for how this
/// is enforced.
pub struct CoreState<Traits: Port> {
    /// Whether the kernel lock token is currently minted. See `klock`.
    pub(crate) klock_taken: AtomicBool,

    /// The current and ceiling interrupt priority levels.
    pub(crate) ipl: klock::IrqCell<Traits, ipl::IplState>,

    /// Priority levels with deferred work pending.
    pub(crate) deferred: klock::IrqCell<Traits, utils::LevelBitmap>,

    /// Head of the lock-free list of scheduled self-interrupt calls.
    pub(crate) selfint_head: selfint::ListHead<Traits>,

    /// The core's general-purpose work queue, installed by [`init_core`].
    pub(crate) general_queue: spin::Once<Arc<workqueue::WorkQueue<Traits>>>,
}

impl<Traits: Port> CoreState<Traits> {
    pub const fn new() -> Self {
        Self {
            klock_taken: AtomicBool::new(false),
            ipl: klock::IrqCell::new(ipl::IplState::INIT),
            deferred: klock::IrqCell::new(utils::LevelBitmap::INIT),
            selfint_head: selfint::ListHead::new(),
            general_queue: spin::Once::new(),
        }
    }
}

impl<Traits: Port> Init for CoreState<Traits> {
    const INIT: Self = Self::new();
}

impl<Traits: Port> Default for CoreState<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the core's general-purpose work queue and IPL ceiling. Called
/// once per core at bring-up, before any other operation of this crate.
pub fn init_core<Traits: Port>(ceiling: ipl::IplLevel, queue: Arc<workqueue::WorkQueue<Traits>>) {
    assert!((ceiling as usize) < ipl::NUM_IPL_LEVELS);
    let state = Traits::core_state();
    state.general_queue.call_once(|| queue);
    klock::with::<Traits, _>(|mut token| {
        state.ipl.replace(
            &mut *token,
            ipl::IplState {
                current: 0,
                ceiling,
            },
        );
    });
}

/// The calling core's general-purpose work queue.
pub fn general_queue<Traits: Port>() -> &'static Arc<workqueue::WorkQueue<Traits>> {
    Traits::core_state()
        .general_queue
        .get()
        .expect("general work queue used before `init_core`")
}
