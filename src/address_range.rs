use std::cmp::Ordering;
use std::collections::Bound;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::ops::{Range, RangeBounds, RangeInclusive};
use thiserror::Error;

/// A non-empty range in a 64-bit physical address space bounded inclusively below and above.
///
/// Enforces the invariant that `self.start() <= self.end()`.
///
/// Note that this is indifferent as to what is addressed, this can be bytes, words, or anything
/// else.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AddressRange {
    start: u64,
    end: u64,
}

impl Default for AddressRange {
    fn default() -> Self {
        Self::full()
    }
}

impl Display for AddressRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x}]", self.start, self.end)
    }
}

impl AddressRange {
    pub fn new(start: u64, end: u64) -> Result<Self, InvalidBoundsError> {
        (start <= end)
            .then_some(Self { start, end })
            .ok_or(InvalidBoundsError { start, end })
    }

    /// Create a new address range covering all possible 64-bit addresses.
    pub fn full() -> Self {
        Self {
            start: 0,
            end: u64::MAX,
        }
    }

    pub fn start(self) -> u64 {
        self.start
    }

    pub fn end(self) -> u64 {
        self.end
    }

    pub fn with_start(self, start: u64) -> Result<Self, InvalidBoundsError> {
        (start <= self.end)
            .then_some(Self {
                start,
                end: self.end,
            })
            .ok_or(InvalidBoundsError {
                start,
                end: self.end,
            })
    }

    pub fn with_end(self, end: u64) -> Result<Self, InvalidBoundsError> {
        (self.start <= end)
            .then_some(Self {
                start: self.start,
                end,
            })
            .ok_or(InvalidBoundsError {
                start: self.start,
                end,
            })
    }

    /// Check if an address is contained within this address range.
    pub fn contains(self, address: u64) -> bool {
        self.start <= address && address <= self.end
    }

    /// Check if `other` is fully contained within this address range.
    pub fn contains_range(self, other: Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Check if `other` shares at least one address with this address range.
    pub fn overlaps(self, other: Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns `self.end() - self.start()`, which is the size minus 1.
    ///
    /// This value is always within the range `0..=u64::MAX`.
    pub fn delta(self) -> u64 {
        self.end - self.start
    }

    /// Returns the size of this address range if it is representable by a `u64`, or `None` if the
    /// range covers the full address space.
    pub fn size(self) -> Option<u64> {
        self.delta().checked_add(1)
    }

    /// Compare the size of this address range to another.
    pub fn cmp_size(self, other: Self) -> Ordering {
        // Since this is a comparison, it doesn't matter that we're comparing "size - 1" of both
        self.delta().cmp(&other.delta())
    }
}

impl TryFrom<RangeInclusive<u64>> for AddressRange {
    type Error = InvalidBoundsError;

    fn try_from(value: RangeInclusive<u64>) -> Result<Self, Self::Error> {
        Self::new(*value.start(), *value.end())
    }
}

impl TryFrom<Range<u64>> for AddressRange {
    type Error = InvalidBoundsError;

    fn try_from(value: Range<u64>) -> Result<Self, Self::Error> {
        match value.end.checked_sub(1) {
            Some(end) => Self::new(value.start, end),
            None => Err(InvalidBoundsError {
                start: value.start,
                end: value.end,
            }),
        }
    }
}

impl From<AddressRange> for RangeInclusive<u64> {
    fn from(value: AddressRange) -> Self {
        value.start..=value.end
    }
}

impl RangeBounds<u64> for AddressRange {
    fn start_bound(&self) -> Bound<&u64> {
        Bound::Included(&self.start)
    }

    fn end_bound(&self) -> Bound<&u64> {
        Bound::Included(&self.end)
    }
}

#[derive(Error, Debug, Clone)]
#[error("bounds [{start:#x}, {end:#x}] do not form a valid 64-bit address range")]
pub struct InvalidBoundsError {
    start: u64,
    end: u64,
}

#[macro_export]
macro_rules! address_range {
    ($start:expr, $end:expr) => {
        $crate::address_range::AddressRange::new($start, $end).unwrap()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_bounds() {
        assert!(AddressRange::new(0x1000, 0xFFF).is_err());
        assert!(AddressRange::new(0x1000, 0x1000).is_ok());
    }

    #[test]
    fn test_contains() {
        let range = address_range!(0x8000_0000, 0x8000_0FFF);
        assert!(range.contains(0x8000_0000));
        assert!(range.contains(0x8000_0FFF));
        assert!(!range.contains(0x7FFF_FFFF));
        assert!(!range.contains(0x8000_1000));
    }

    #[test]
    fn test_overlaps() {
        let range = address_range!(0x100, 0x1FF);
        assert!(range.overlaps(address_range!(0x1FF, 0x2FF)));
        assert!(range.overlaps(address_range!(0x0, 0x100)));
        assert!(!range.overlaps(address_range!(0x200, 0x2FF)));
        assert!(range.contains_range(address_range!(0x180, 0x1C0)));
        assert!(!range.contains_range(address_range!(0x180, 0x240)));
    }

    #[test]
    fn test_size() {
        assert_eq!(Some(0x1000), address_range!(0x0, 0xFFF).size());
        assert_eq!(None, AddressRange::full().size());
    }
}
