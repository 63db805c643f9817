//! Tagged cancellation registry.
//!
//! In-flight operations register a caller-chosen [`Tag`] and receive a
//! [`CancelToken`] in return. A later [`CancelRegistry::cancel`] call with the
//! same tag delivers cancellation, at most once, to every operation currently
//! registered under that tag. Tag `0` means "not cancellable" and registers
//! nothing.
//!
//! Delivery races against normal completion: the completing side performs an
//! atomic try-reset ([`CancelToken::try_reset`]) and the cancelling side an
//! atomic state transition, so exactly one of the two observes success for
//! each armed wait.
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use arrayvec::ArrayVec;
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
};

use crate::{error::RegisterError, irq::IrqSpinlock, Port};

/// Identifies a group of cancellable operations. `0` is reserved to mean
/// "not cancellable".
pub type Tag = u64;

/// Upper bound on registrations cancelled while holding the registry lock.
/// Larger groups are drained in multiple passes.
const CANCEL_BATCH_LEN: usize = 16;

// Slot states. `RESETTING` is a transient state covering the window in
// which a successful try-reset is still clearing the armed callback.
const ST_VACANT: u8 = 0;
const ST_ARMED: u8 = 1;
const ST_CANCELLED: u8 = 2;
const ST_RESETTING: u8 = 3;

type CancelFn = Box<dyn FnOnce() + Send>;

/// The per-registration cancellation state machine.
///
/// A slot is reused across successive waits on the same registration: each
/// wait arms it with a callback, and either the completion path resets it
/// back to vacant or a cancel request fires the callback and leaves the slot
/// permanently cancelled.
pub(crate) struct CancelSlot {
    state: AtomicU8,
    /// Written only by the thread performing a `Vacant → Armed` transition
    /// and taken only by the winner of an `Armed → _` transition.
    callback: spin::Mutex<Option<CancelFn>>,
}

impl CancelSlot {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(ST_VACANT),
            callback: spin::Mutex::new(None),
        }
    }

    /// Arms the slot with a cancellation callback. Returns `false` if the
    /// slot is already cancelled, in which case the callback is dropped
    /// without being called.
    ///
    /// Panics if the slot is already armed. One registration supports only
    /// one in-flight wait at a time.
    pub(crate) fn arm(&self, callback: CancelFn) -> bool {
        *self.callback.lock() = Some(callback);
        match self.state.compare_exchange(
            ST_VACANT,
            ST_ARMED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(ST_CANCELLED) => {
                *self.callback.lock() = None;
                false
            }
            Err(_) => panic!("cancellation slot armed twice"),
        }
    }

    /// Atomically disarms the slot, returning `true` if this call won the
    /// race against cancellation. The armed callback is dropped unfired.
    pub(crate) fn try_reset(&self) -> bool {
        if self
            .state
            .compare_exchange(ST_ARMED, ST_RESETTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let callback = self.callback.lock().take();
        self.state.store(ST_VACANT, Ordering::Release);
        drop(callback);
        true
    }

    /// Moves the slot to the cancelled state, firing the armed callback if
    /// there is one. Returns `true` unless the slot was already cancelled.
    /// Cancellation is sticky: later `arm` calls fail.
    pub(crate) fn cancel(&self) -> bool {
        loop {
            match self.state.load(Ordering::Acquire) {
                ST_CANCELLED => return false,
                ST_RESETTING => {
                    // A try-reset is mid-flight; wait for it to settle.
                    core::hint::spin_loop();
                }
                ST_VACANT => {
                    if self
                        .state
                        .compare_exchange(
                            ST_VACANT,
                            ST_CANCELLED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return true;
                    }
                }
                _ => {
                    if self
                        .state
                        .compare_exchange(
                            ST_ARMED,
                            ST_CANCELLED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        let callback = self.callback.lock().take();
                        if let Some(callback) = callback {
                            callback();
                        }
                        return true;
                    }
                }
            }
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == ST_CANCELLED
    }
}

impl fmt::Debug for CancelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = match self.state.load(Ordering::Relaxed) {
            ST_VACANT => "Vacant",
            ST_ARMED => "Armed",
            ST_CANCELLED => "Cancelled",
            _ => "Resetting",
        };
        f.debug_tuple("CancelSlot").field(&st).finish()
    }
}

/// One registration in a [`CancelRegistry`].
struct CancelNode {
    tag: Tag,
    /// Set when a `cancel` pass picks this node up. Guarantees at-most-once
    /// delivery even when the pass drops the registry lock between batches.
    delivered: AtomicBool,
    slot: CancelSlot,
}

impl CancelNode {
    fn new(tag: Tag) -> Self {
        Self {
            tag,
            delivered: AtomicBool::new(false),
            slot: CancelSlot::new(),
        }
    }
}

impl fmt::Debug for CancelNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelNode")
            .field("tag", &self.tag)
            .field("slot", &self.slot)
            .finish()
    }
}

/// Cancellation handle carried by an in-flight operation. Cloneable; all
/// clones observe the same slot.
#[derive(Clone)]
pub struct CancelToken {
    node: Arc<CancelNode>,
}

impl CancelToken {
    /// A token that is never cancelled, for operations registered with
    /// tag `0`.
    pub fn detached() -> Self {
        Self {
            node: Arc::new(CancelNode::new(0)),
        }
    }

    /// See [`CancelSlot::arm`].
    pub(crate) fn arm(&self, callback: CancelFn) -> bool {
        self.node.slot.arm(callback)
    }

    /// See [`CancelSlot::try_reset`].
    pub(crate) fn try_reset(&self) -> bool {
        self.node.slot.try_reset()
    }

    pub fn is_cancelled(&self) -> bool {
        self.node.slot.is_cancelled()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelToken").field(&self.node).finish()
    }
}

/// Proof of registration. Must be surrendered to
/// [`CancelRegistry::unregister_tag`] before being dropped; dropping a live
/// guard would leave a dangling registry entry, so it's treated as a fatal
/// logic error.
pub struct CancelGuard {
    node: Arc<CancelNode>,
    key: Option<(Tag, u64)>,
}

impl CancelGuard {
    /// The token to hand to the operation being guarded.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            node: Arc::clone(&self.node),
        }
    }
}

impl fmt::Debug for CancelGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelGuard")
            .field("node", &self.node)
            .field("key", &self.key)
            .finish()
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.key.is_some() {
            panic!("cancellation guard dropped while still registered");
        }
    }
}

/// Registry mapping tags to the operations registered under them.
pub struct CancelRegistry<Traits> {
    tree: IrqSpinlock<BTreeMap<(Tag, u64), Arc<CancelNode>>>,
    /// Disambiguates registrations sharing a tag.
    next_serial: AtomicU64,
    _phantom: core::marker::PhantomData<Traits>,
}

impl<Traits: Port> CancelRegistry<Traits> {
    pub const fn new() -> Self {
        Self {
            tree: IrqSpinlock::new(BTreeMap::new()),
            next_serial: AtomicU64::new(0),
            _phantom: core::marker::PhantomData,
        }
    }

    /// Registers an operation under `tag`. A tag of `0` registers nothing
    /// and yields a guard whose token is never cancelled.
    ///
    /// Multiple concurrent registrations of the same tag are expected;
    /// each gets its own entry.
    pub fn register_tag(&self, tag: Tag) -> Result<CancelGuard, RegisterError> {
        let node = Arc::new(CancelNode::new(tag));
        if tag == 0 {
            return Ok(CancelGuard { node, key: None });
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let key = (tag, serial);
        if self
            .tree
            .lock::<Traits>()
            .insert(key, Arc::clone(&node))
            .is_some()
        {
            // Unreachable unless the serial counter wraps.
            return Err(RegisterError::AlreadyExists);
        }
        log::trace!("cancel: registered {:?}", key);
        Ok(CancelGuard {
            node,
            key: Some(key),
        })
    }

    /// Removes a registration. The guard's tokens keep working as plain
    /// cancellation state but no longer receive tag-directed cancels.
    pub fn unregister_tag(&self, mut guard: CancelGuard) {
        if let Some(key) = guard.key.take() {
            let removed = self.tree.lock::<Traits>().remove(&key);
            debug_assert!(removed.is_some());
            log::trace!("cancel: unregistered {:?}", key);
        }
    }

    /// Delivers cancellation to every operation currently registered under
    /// `tag`, at most once each, and returns how many were reached. A tag
    /// with no registrations is not an error; the call returns `0`.
    ///
    /// Callbacks run outside the registry lock, so a callback may itself
    /// register or unregister tags.
    pub fn cancel(&self, tag: Tag) -> usize {
        if tag == 0 {
            return 0;
        }

        // Serials at or past this point belong to registrations made after
        // the scan began; those are outside this call's snapshot even
        // though the lock is dropped between batches.
        let snapshot_end = self.next_serial.load(Ordering::Relaxed);

        let mut count = 0;
        loop {
            let mut batch: ArrayVec<Arc<CancelNode>, CANCEL_BATCH_LEN> = ArrayVec::new();
            {
                let tree = self.tree.lock::<Traits>();
                for (_, node) in tree.range((tag, 0)..(tag, snapshot_end)) {
                    if batch.is_full() {
                        break;
                    }
                    if !node.delivered.swap(true, Ordering::AcqRel) {
                        batch.push(Arc::clone(node));
                    }
                }
            }

            let exhausted = !batch.is_full();
            for node in batch {
                node.slot.cancel();
                count += 1;
            }
            if exhausted {
                break;
            }
        }

        log::trace!("cancel: tag {} reached {} registration(s)", tag, count);
        count
    }
}

impl<Traits: Port> Default for CancelRegistry<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits> fmt::Debug for CancelRegistry<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelRegistry").finish_non_exhaustive()
    }
}
