//! Kernel state locking mechanism.
//!
//! Per-core kernel state ([`crate::CoreState`] fields and each
//! [`crate::workqueue::WorkQueue`]'s local pending list) is protected by the
//! core's interrupt-protected section ([`crate::irq`]) and accessed through a
//! zero-sized `tokenlock` token serving as a proof of that section. The token
//! is a singleton: at most one [`IrqLockGuard`] exists at any time, so the
//! borrow checker statically rules out aliased mutable access to the cells.
//!
//! Nested code does not re-lock; it receives a borrowed token
//! ([`IrqTokenRefMut`]) from its caller instead. The kernel never holds the
//! token across a callback invocation, so [`lock`] succeeding is an
//! invariant of every public entry point; a failure to mint the token is a
//! logic bug and panics.
use core::{ops, sync::atomic::Ordering};
use tokenlock::UnsyncTokenLock;

use crate::{utils::Init, Port};

pub(super) struct IrqLockTag<Traits>(Traits);

/// The key that "unlocks" [`IrqCell`].
pub(super) type IrqToken<Traits> = tokenlock::UnsyncSingletonToken<IrqLockTag<Traits>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`IrqToken`].
pub(super) type IrqKeyhole<Traits> = tokenlock::SingletonTokenId<IrqLockTag<Traits>>;

/// Borrowed version of [`IrqLockGuard`]. This is equivalent to
/// `&'a mut IrqLockGuard` but does not consume memory.
pub(super) type IrqTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, IrqLockTag<Traits>>;

/// Cell type that can be accessed by [`IrqToken`] (which can be obtained by
/// [`lock`]).
pub(super) struct IrqCell<Traits, T: ?Sized>(UnsyncTokenLock<T, IrqKeyhole<Traits>>);

impl<Traits, T> IrqCell<Traits, T> {
    pub(super) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(IrqKeyhole::new(), x))
    }
}

impl<Traits, T: Init> Init for IrqCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

impl<Traits, T> ops::Deref for IrqCell<Traits, T> {
    type Target = UnsyncTokenLock<T, IrqKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for IrqCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Enter the interrupt-protected section and mint the kernel lock token.
///
/// Panics if the token is already minted. The kernel never holds the token
/// across callback invocations, so this can only fire on a reentrancy bug.
pub(super) fn lock<Traits: Port>() -> IrqLockGuard<Traits> {
    // Safety: we are the kernel
    unsafe { Traits::acquire_irq() };
    if Traits::core_state()
        .klock_taken
        .swap(true, Ordering::Acquire)
    {
        panic!("kernel lock token is already held");
    }
    // Safety: We just observed the token to be unminted and won the race to
    //         mint it, so no other instance of `IrqToken` exists.
    IrqLockGuard {
        token: unsafe { IrqToken::new_unchecked() },
    }
}

/// Run `f` with the kernel lock token. See [`lock`] for the precondition.
#[inline]
pub(super) fn with<Traits: Port, R>(f: impl FnOnce(IrqTokenRefMut<'_, Traits>) -> R) -> R {
    let mut guard = lock::<Traits>();
    f(guard.borrow_mut())
}

/// RAII guard for the kernel lock token.
///
/// [`IrqToken`] can be borrowed from this type.
pub(super) struct IrqLockGuard<Traits: Port> {
    token: IrqToken<Traits>,
}

impl<Traits: Port> IrqLockGuard<Traits> {
    /// Construct an [`IrqTokenRefMut`] by borrowing `self`.
    pub(super) fn borrow_mut(&mut self) -> IrqTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: Port> Drop for IrqLockGuard<Traits> {
    fn drop(&mut self) {
        Traits::core_state()
            .klock_taken
            .store(false, Ordering::Release);
        // Safety: Paired with the `acquire_irq` in `lock`
        unsafe {
            Traits::release_irq();
        }
    }
}

impl<Traits: Port> ops::Deref for IrqLockGuard<Traits> {
    type Target = IrqToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: Port> ops::DerefMut for IrqLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
