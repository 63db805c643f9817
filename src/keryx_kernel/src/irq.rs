//! The nested interrupt-disabling mutex and the cross-context spinlock
//! layered on top of it.
use core::{marker::PhantomData, mem::ManuallyDrop, ops};

use crate::Port;

/// A recursive, core-local interrupt-disabling lock.
///
/// On the outermost [`lock`](Self::lock), if interrupts are currently
/// enabled on the calling core, they are disabled and that fact is
/// remembered; the matching outermost unlock (guard drop) restores them.
/// Nested acquisitions only adjust a counter ([tag:irq_mutex_nesting], kept
/// by the port's per-core block).
///
/// This is *not* a mutual-exclusion primitive across cores; it solely
/// guarantees "this core will not take an interrupt while the guard lives".
/// Cross-core exclusion is layered on top with [`IrqSpinlock`].
pub struct IrqMutex<Traits> {
    _phantom: PhantomData<Traits>,
}

impl<Traits: Port> IrqMutex<Traits> {
    /// Enter the interrupt-protected section and get an RAII guard.
    #[inline]
    pub fn lock() -> IrqMutexGuard<Traits> {
        // Safety: we are the kernel
        unsafe { Traits::acquire_irq() };
        IrqMutexGuard {
            _not_send: PhantomData,
        }
    }
}

/// RAII guard for [`IrqMutex`]. Dropping it leaves the interrupt-protected
/// section, restoring the interrupt state remembered by the outermost
/// acquisition.
pub struct IrqMutexGuard<Traits: Port> {
    // The guard must be released on the core that acquired it.
    _not_send: PhantomData<(*mut (), Traits)>,
}

impl<Traits: Port> Drop for IrqMutexGuard<Traits> {
    #[inline]
    fn drop(&mut self) {
        // Safety: Paired with the `acquire_irq` in `IrqMutex::lock`
        unsafe {
            Traits::release_irq();
        }
    }
}

/// A spinlock acquired with interrupts disabled on the acquiring core.
///
/// This is the lock used by the two structures that are touched from a
/// different core or execution context than their owner (the cancellation
/// registry tree and a work queue's foreign pending list): the embedded
/// `spin::Mutex` provides cross-core exclusion, and holding [`IrqMutex`]
/// for the duration prevents the classic same-core deadlock where an
/// interrupt handler spins on a lock its interruptee holds.
pub(crate) struct IrqSpinlock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqSpinlock<T> {
    pub(crate) const fn new(x: T) -> Self {
        Self {
            inner: spin::Mutex::new(x),
        }
    }

    pub(crate) fn lock<Traits: Port>(&self) -> IrqSpinlockGuard<'_, Traits, T> {
        let irq = IrqMutex::<Traits>::lock();
        IrqSpinlockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            _irq: irq,
        }
    }
}

pub(crate) struct IrqSpinlockGuard<'a, Traits: Port, T> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    _irq: IrqMutexGuard<Traits>,
}

impl<Traits: Port, T> Drop for IrqSpinlockGuard<'_, Traits, T> {
    fn drop(&mut self) {
        // Release the spinlock before `_irq` re-enables interrupts.
        // Safety: `guard` is not used again
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
    }
}

impl<Traits: Port, T> ops::Deref for IrqSpinlockGuard<'_, Traits, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<Traits: Port, T> ops::DerefMut for IrqSpinlockGuard<'_, Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
