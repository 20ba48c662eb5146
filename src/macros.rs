//! Handle types for kernel objects
//!
//! Every kernel object lives in an arena owned by [`crate::Kernel`] and is
//! addressed by a small typed index. Handles are only minted by the kernel
//! that owns the arena.

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u16);

        impl $name {
            /// Arena index of this handle
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

/// Next free handle value for an arena of `len` objects
pub(crate) fn next_index(len: usize) -> crate::error::KResult<u16> {
    u16::try_from(len).map_err(|_| crate::error::KernelError::ResourceExhausted)
}
