//! 256-bit register arithmetic for the big-number core.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Not};

/// A 256-bit value stored as four 64-bit limbs, least significant first.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct Wide([u64; 4]);

const_assert_eq!(std::mem::size_of::<Wide>(), 32);

impl Wide {
    pub const ZERO: Self = Self([0; 4]);
    pub const MAX: Self = Self([u64::MAX; 4]);

    pub const fn from_limbs(limbs: [u64; 4]) -> Self {
        Self(limbs)
    }

    pub const fn from_u64(value: u64) -> Self {
        Self([value, 0, 0, 0])
    }

    pub const fn from_u128(value: u128) -> Self {
        Self([value as u64, (value >> 64) as u64, 0, 0])
    }

    pub const fn limbs(self) -> [u64; 4] {
        self.0
    }

    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        let mut limbs = [0u64; 4];
        for (index, chunk) in bytes.chunks_exact(8).enumerate() {
            let mut limb = [0u8; 8];
            limb.copy_from_slice(chunk);
            limbs[index] = u64::from_le_bytes(limb);
        }
        Self(limbs)
    }

    pub fn to_le_bytes(self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (chunk, limb) in bytes.chunks_exact_mut(8).zip(self.0) {
            chunk.copy_from_slice(&limb.to_le_bytes());
        }
        bytes
    }

    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    /// Value of bit `index`. Panics if `index >= 256`.
    pub fn bit(self, index: u32) -> bool {
        self.0[(index / 64) as usize] >> (index % 64) & 1 != 0
    }

    /// 64-bit quarter-word `index` (0 is the least significant). Panics if `index >= 4`.
    pub fn quarter(self, index: usize) -> u64 {
        self.0[index]
    }

    /// 32-bit word `index` (0 is the least significant). Panics if `index >= 8`.
    ///
    /// Used by the word-wide CSR windows into the wide registers.
    pub fn word(self, index: usize) -> u32 {
        (self.0[index / 2] >> (32 * (index % 2) as u32)) as u32
    }

    /// Replace 32-bit word `index`. Panics if `index >= 8`.
    pub fn set_word(&mut self, index: usize, value: u32) {
        let shift = 32 * (index % 2) as u32;
        let limb = &mut self.0[index / 2];
        *limb = (*limb & !(0xFFFF_FFFFu64 << shift)) | ((value as u64) << shift);
    }

    pub fn overflowing_add(self, other: Self) -> (Self, bool) {
        let mut limbs = [0u64; 4];
        let mut carry = false;
        for index in 0..4 {
            let (sum, first) = self.0[index].overflowing_add(other.0[index]);
            let (sum, second) = sum.overflowing_add(carry as u64);
            limbs[index] = sum;
            carry = first || second;
        }
        (Self(limbs), carry)
    }

    pub fn overflowing_sub(self, other: Self) -> (Self, bool) {
        let mut limbs = [0u64; 4];
        let mut borrow = false;
        for index in 0..4 {
            let (difference, first) = self.0[index].overflowing_sub(other.0[index]);
            let (difference, second) = difference.overflowing_sub(borrow as u64);
            limbs[index] = difference;
            borrow = first || second;
        }
        (Self(limbs), borrow)
    }

    pub fn wrapping_add(self, other: Self) -> Self {
        self.overflowing_add(other).0
    }

    pub fn wrapping_sub(self, other: Self) -> Self {
        self.overflowing_sub(other).0
    }

    /// Shift left by `amount` bits, dropping bits shifted past bit 255. Shifts of 256 or more
    /// yield zero.
    pub fn shl(self, amount: u32) -> Self {
        if amount >= 256 {
            return Self::ZERO;
        }
        let limb_shift = (amount / 64) as usize;
        let bit_shift = amount % 64;
        let mut limbs = [0u64; 4];
        for index in limb_shift..4 {
            let mut limb = self.0[index - limb_shift] << bit_shift;
            if bit_shift != 0 && index > limb_shift {
                limb |= self.0[index - limb_shift - 1] >> (64 - bit_shift);
            }
            limbs[index] = limb;
        }
        Self(limbs)
    }

    /// Logical shift right by `amount` bits. Shifts of 256 or more yield zero.
    pub fn shr(self, amount: u32) -> Self {
        if amount >= 256 {
            return Self::ZERO;
        }
        let limb_shift = (amount / 64) as usize;
        let bit_shift = amount % 64;
        let mut limbs = [0u64; 4];
        for index in 0..4 - limb_shift {
            let mut limb = self.0[index + limb_shift] >> bit_shift;
            if bit_shift != 0 && index + limb_shift + 1 < 4 {
                limb |= self.0[index + limb_shift + 1] << (64 - bit_shift);
            }
            limbs[index] = limb;
        }
        Self(limbs)
    }
}

impl Ord for Wide {
    fn cmp(&self, other: &Self) -> Ordering {
        for index in (0..4).rev() {
            match self.0[index].cmp(&other.0[index]) {
                Ordering::Equal => {}
                ordering => return ordering,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Wide {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl BitAnd for Wide {
    type Output = Self;
    fn bitand(self, other: Self) -> Self {
        Self([
            self.0[0] & other.0[0],
            self.0[1] & other.0[1],
            self.0[2] & other.0[2],
            self.0[3] & other.0[3],
        ])
    }
}

impl BitOr for Wide {
    type Output = Self;
    fn bitor(self, other: Self) -> Self {
        Self([
            self.0[0] | other.0[0],
            self.0[1] | other.0[1],
            self.0[2] | other.0[2],
            self.0[3] | other.0[3],
        ])
    }
}

impl BitXor for Wide {
    type Output = Self;
    fn bitxor(self, other: Self) -> Self {
        Self([
            self.0[0] ^ other.0[0],
            self.0[1] ^ other.0[1],
            self.0[2] ^ other.0[2],
            self.0[3] ^ other.0[3],
        ])
    }
}

impl Not for Wide {
    type Output = Self;
    fn not(self) -> Self {
        Self([!self.0[0], !self.0[1], !self.0[2], !self.0[3]])
    }
}

impl fmt::Debug for Wide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:016x}_{:016x}_{:016x}_{:016x}",
            self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

impl fmt::LowerHex for Wide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:016x}{:016x}{:016x}",
            self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_carry_chain() {
        let (sum, carry) = Wide::MAX.overflowing_add(Wide::from_u64(1));
        assert_eq!(Wide::ZERO, sum);
        assert!(carry);

        let almost = Wide::from_limbs([u64::MAX, u64::MAX, 0, 0]);
        let (sum, carry) = almost.overflowing_add(Wide::from_u64(1));
        assert_eq!(Wide::from_limbs([0, 0, 1, 0]), sum);
        assert!(!carry);
    }

    #[test]
    fn test_sub_borrow_chain() {
        let (difference, borrow) = Wide::ZERO.overflowing_sub(Wide::from_u64(1));
        assert_eq!(Wide::MAX, difference);
        assert!(borrow);

        let (difference, borrow) =
            Wide::from_limbs([0, 0, 1, 0]).overflowing_sub(Wide::from_u64(1));
        assert_eq!(Wide::from_limbs([u64::MAX, u64::MAX, 0, 0]), difference);
        assert!(!borrow);
    }

    #[test]
    fn test_shifts_cross_limbs() {
        let one = Wide::from_u64(1);
        assert_eq!(Wide::from_limbs([0, 0, 0, 1 << 63]), one.shl(255));
        assert_eq!(Wide::ZERO, one.shl(256));
        assert_eq!(one, one.shl(255).shr(255));
        assert_eq!(
            Wide::from_limbs([0xAB00, 0, 0, 0]),
            Wide::from_limbs([0, 0, 0xAB00, 0]).shr(128)
        );
        let pattern = Wide::from_limbs([0x8000_0000_0000_0001, 0, 0, 0]);
        assert_eq!(Wide::from_limbs([2, 1, 0, 0]), pattern.shl(1));
    }

    #[test]
    fn test_ordering_uses_most_significant_limb_first() {
        let low = Wide::from_limbs([u64::MAX, u64::MAX, u64::MAX, 0]);
        let high = Wide::from_limbs([0, 0, 0, 1]);
        assert!(low < high);
        assert!(high > Wide::ZERO);
        assert_eq!(Ordering::Equal, high.cmp(&high));
    }

    #[test]
    fn test_word_accessors() {
        let mut value = Wide::ZERO;
        value.set_word(0, 0x1111_1111);
        value.set_word(1, 0x2222_2222);
        value.set_word(7, 0xDEAD_BEEF);
        assert_eq!(0x2222_2222_1111_1111, value.quarter(0));
        assert_eq!(0xDEAD_BEEF, value.word(7));
        assert_eq!(0xDEAD_BEEF_0000_0000, value.quarter(3));
        value.set_word(0, 0);
        assert_eq!(0x2222_2222_0000_0000, value.quarter(0));
    }

    #[test]
    fn test_byte_roundtrip_and_bits() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x01;
        bytes[31] = 0x80;
        let value = Wide::from_le_bytes(bytes);
        assert!(value.bit(0));
        assert!(value.bit(255));
        assert!(!value.bit(100));
        assert_eq!(bytes, value.to_le_bytes());
    }
}
