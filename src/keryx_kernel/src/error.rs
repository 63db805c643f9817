//! Error types.
//!
//! Nearly every precondition violation in this crate is a fatal logic error
//! (a panic), not a recoverable condition; the types here cover the few
//! genuinely recoverable results. Cancellation is reported through
//! [`crate::event::WaitResult`], not an error type.

/// Error type for
/// [`CancelRegistry::register_tag`](crate::cancel::CancelRegistry::register_tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum RegisterError {
    /// The registration collided with an existing key. Callers must treat
    /// this as a recoverable registration failure.
    AlreadyExists = -1,
}
