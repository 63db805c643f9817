//! Utility items shared across the crate.
mod bitmap;

pub use self::bitmap::LevelBitmap;

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
pub trait Init {
    /// The default value.
    const INIT: Self;
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: ?Sized> Init for core::marker::PhantomData<T> {
    const INIT: Self = core::marker::PhantomData;
}

impl Init for core::sync::atomic::AtomicBool {
    const INIT: Self = Self::new(false);
}

impl<T> Init for core::sync::atomic::AtomicPtr<T> {
    const INIT: Self = Self::new(core::ptr::null_mut());
}

macro_rules! impl_init {
    ( $( $ty:ty => $value:expr, )* ) => {
        $(
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    bool => false,
    u8 => 0,
    u16 => 0,
    u32 => 0,
    u64 => 0,
    usize => 0,
}
