//! Atomic 32-bit variable
//!
//! Every operation is sequentially consistent and returns the previous
//! value unless noted otherwise.

use core::sync::atomic::{AtomicU32, Ordering};

/// Lock-free 32-bit variable, usable from threads and interrupts
#[derive(Debug, Default)]
pub struct Atomic(AtomicU32);

impl Atomic {
    pub const fn new(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: u32) -> u32 {
        self.0.swap(value, Ordering::SeqCst)
    }

    pub fn clear(&self) -> u32 {
        self.set(0)
    }

    pub fn inc(&self) -> u32 {
        self.add(1)
    }

    pub fn dec(&self) -> u32 {
        self.sub(1)
    }

    /// Wrapping add
    pub fn add(&self, value: u32) -> u32 {
        self.0.fetch_add(value, Ordering::SeqCst)
    }

    /// Wrapping subtract
    pub fn sub(&self, value: u32) -> u32 {
        self.0.fetch_sub(value, Ordering::SeqCst)
    }

    pub fn or(&self, mask: u32) -> u32 {
        self.0.fetch_or(mask, Ordering::SeqCst)
    }

    pub fn and(&self, mask: u32) -> u32 {
        self.0.fetch_and(mask, Ordering::SeqCst)
    }

    pub fn xor(&self, mask: u32) -> u32 {
        self.0.fetch_xor(mask, Ordering::SeqCst)
    }

    pub fn nand(&self, mask: u32) -> u32 {
        self.0.fetch_nand(mask, Ordering::SeqCst)
    }

    /// Compare-and-swap: true if `old` matched and `new` was stored
    pub fn cas(&self, old: u32, new: u32) -> bool {
        self.0
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn test_bit(&self, bit: u32) -> bool {
        self.get() & (1 << (bit % 32)) != 0
    }

    pub fn set_bit(&self, bit: u32) {
        self.or(1 << (bit % 32));
    }

    pub fn clear_bit(&self, bit: u32) {
        self.and(!(1 << (bit % 32)));
    }

    /// Set a bit, returning whether it was already set
    pub fn test_and_set_bit(&self, bit: u32) -> bool {
        let mask = 1 << (bit % 32);
        self.or(mask) & mask != 0
    }

    /// Clear a bit, returning whether it was set
    pub fn test_and_clear_bit(&self, bit: u32) -> bool {
        let mask = 1 << (bit % 32);
        self.and(!mask) & mask != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic_returns_old() {
        let a = Atomic::new(5);
        assert_eq!(a.inc(), 5);
        assert_eq!(a.add(10), 6);
        assert_eq!(a.dec(), 16);
        assert_eq!(a.sub(5), 15);
        assert_eq!(a.get(), 10);
        assert_eq!(a.clear(), 10);
        assert_eq!(a.get(), 0);
    }

    #[test]
    fn test_wrapping() {
        let a = Atomic::new(0);
        a.dec();
        assert_eq!(a.get(), u32::MAX);
        a.inc();
        assert_eq!(a.get(), 0);
    }

    #[test]
    fn test_cas() {
        let a = Atomic::new(7);
        assert!(!a.cas(3, 9));
        assert_eq!(a.get(), 7);
        assert!(a.cas(7, 9));
        assert_eq!(a.get(), 9);
    }

    #[test]
    fn test_bitwise() {
        let a = Atomic::new(0b1100);
        assert_eq!(a.or(0b0011), 0b1100);
        assert_eq!(a.and(0b0110), 0b1111);
        assert_eq!(a.xor(0b0101), 0b0110);
        assert_eq!(a.nand(0b0011), 0b0011);
        assert_eq!(a.get(), !0b0011);
    }

    #[test]
    fn test_bits() {
        let a = Atomic::default();
        assert!(!a.test_and_set_bit(3));
        assert!(a.test_and_set_bit(3));
        assert!(a.test_bit(3));
        assert_eq!(a.get(), 0b1000);
        a.set_bit(31);
        assert!(a.test_and_clear_bit(31));
        assert!(!a.test_and_clear_bit(31));
        a.clear_bit(3);
        assert_eq!(a.get(), 0);
    }
}
