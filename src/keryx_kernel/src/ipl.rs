//! Interrupt priority levels (IPL).
//!
//! A per-core integer indicates which classes of deferred work are currently
//! permitted to run; higher values exclude more handlers. Code raises the
//! level with an RAII [`IplGuard`] and the level escalates monotonically:
//! the observed current level at any point equals the maximum of all
//! currently-held guards' levels.
//!
//! Work deferred at a level the core is currently at (or above) is recorded
//! in a per-core bitmask and dispatched when a guard lowers the level past
//! it, before that guard's drop returns.
use core::marker::PhantomData;

use crate::{
    klock::{self, IrqTokenRefMut},
    utils::Init,
    Port,
};

/// A per-core interrupt priority level.
pub type IplLevel = u8;

/// The number of priority levels. Valid levels are `0..NUM_IPL_LEVELS`;
/// level 0 is the base level at which everything may run.
pub const NUM_IPL_LEVELS: usize = 16;

/// The current and ceiling priority levels of a core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct IplState {
    /// The current level. Only ever raised by a live [`IplGuard`].
    pub(crate) current: IplLevel,
    /// The highest level this core dispatches deferred work for.
    pub(crate) ceiling: IplLevel,
}

impl Init for IplState {
    const INIT: Self = Self {
        current: 0,
        ceiling: (NUM_IPL_LEVELS - 1) as IplLevel,
    };
}

/// Raises the core's current IPL to at least `LEVEL` for the guard's
/// lifetime (a no-op if already ≥ `LEVEL`).
///
/// Guards must be released in the reverse order of acquisition; an
/// out-of-order release is a fatal logic error, since IPL exists precisely
/// to prevent code from running at a level it did not declare it could
/// tolerate.
pub struct IplGuard<Traits: Port, const LEVEL: IplLevel> {
    prev: IplLevel,
    // Core-local; the guard must drop on the core that created it.
    _not_send: PhantomData<(*mut (), Traits)>,
}

impl<Traits: Port, const LEVEL: IplLevel> IplGuard<Traits, LEVEL> {
    /// Raise the calling core's IPL to at least `LEVEL`.
    pub fn raise() -> Self {
        assert!((LEVEL as usize) < NUM_IPL_LEVELS);
        let prev = klock::with::<Traits, _>(|mut token| {
            let state = Traits::core_state();
            let mut ipl = state.ipl.get(&*token);
            let prev = ipl.current;
            if LEVEL > ipl.current {
                ipl.current = LEVEL;
                state.ipl.replace(&mut *token, ipl);
                log::trace!("ipl: {} -> {}", prev, LEVEL);
            }
            prev
        });
        Self {
            prev,
            _not_send: PhantomData,
        }
    }

    /// The level this guard restores on drop.
    pub fn saved_level(&self) -> IplLevel {
        self.prev
    }
}

impl<Traits: Port, const LEVEL: IplLevel> Drop for IplGuard<Traits, LEVEL> {
    fn drop(&mut self) {
        klock::with::<Traits, _>(|mut token| {
            let state = Traits::core_state();
            let mut ipl = state.ipl.get(&*token);

            // Any guard nested inside this one must already have restored
            // the level to what this guard raised it to.
            let expected = LEVEL.max(self.prev);
            assert!(
                ipl.current == expected,
                "IPL guard released out of order (current {}, expected {})",
                ipl.current,
                expected,
            );

            if ipl.current != self.prev {
                ipl.current = self.prev;
                state.ipl.replace(&mut *token, ipl);
                log::trace!("ipl: {} -> {}", expected, self.prev);
                dispatch_deferred::<Traits>(token.borrow_mut());
            }
        });
    }
}

/// Mark deferred work pending at `level`.
///
/// If the core currently runs at or above `level`, the work stays deferred
/// until a guard lowers the level below it; otherwise its handler is
/// dispatched immediately.
pub fn defer_work<Traits: Port>(level: IplLevel) {
    klock::with::<Traits, _>(|mut token| {
        let state = Traits::core_state();
        let ipl = state.ipl.get(&*token);
        assert!(level <= ipl.ceiling, "deferred level above the core's ceiling");

        let mut deferred = state.deferred.get(&*token);
        deferred.set(level as usize);
        state.deferred.replace(&mut *token, deferred);

        if level > ipl.current {
            dispatch_deferred::<Traits>(token.borrow_mut());
        } else {
            log::trace!("ipl: deferring level {level} work (current {})", ipl.current);
        }
    });
}

/// The calling core's current IPL.
pub fn current_ipl<Traits: Port>() -> IplLevel {
    klock::with::<Traits, _>(|token| Traits::core_state().ipl.get(&*token).current)
}

/// Repeatedly find the highest pending deferred level that is at most the
/// ceiling and above the current level, clear its bit, and invoke its fixed
/// handler, until no such level remains.
fn dispatch_deferred<Traits: Port>(mut token: IrqTokenRefMut<'_, Traits>) {
    let state = Traits::core_state();
    loop {
        let ipl = state.ipl.get(&*token);
        let mut deferred = state.deferred.get(&*token);
        let level = match deferred.find_highest_set_at_most(ipl.ceiling as usize) {
            Some(level) if level > ipl.current as usize => level,
            _ => break,
        };
        deferred.clear(level);
        state.deferred.replace(&mut *token, deferred);

        log::trace!("ipl: dispatching deferred level {level} work");
        // The only registered deferred action today is a local reschedule.
        // Safety: we are the kernel
        unsafe {
            Traits::pend_reschedule();
        }
    }
}
