//! External physical memory protection engine.
//!
//! An ordered list of entries, each carrying a config byte (permissions, matching mode, lock bit)
//! and a raw address register. The engine answers what permissions a `[address, size]` span is
//! granted under the effective privilege level, with first-match-wins entry priority.

use log::{trace, warn};
use thiserror::Error;

use crate::address_range::AddressRange;
use crate::cpu::{effective_privilege_level, PmpCore};
use crate::{AccessType, PrivilegeLevel};

pub mod permission {
    //! Permission bits as laid out in a PMP config byte.

    pub const READ: u8 = 1 << 0;
    pub const WRITE: u8 = 1 << 1;
    pub const EXECUTE: u8 = 1 << 2;
    pub const FULL: u8 = READ | WRITE | EXECUTE;
    pub const NONE: u8 = 0;
}

const LOCK_BIT: u8 = 0x80;
const MODE_SHIFT: u32 = 3;
/// Permission, mode and lock bits; bits 5 and 6 are reserved and always read as zero.
const CONFIG_MASK: u8 = 0x9F;

/// Address-matching mode of a PMP entry, bits 3 and 4 of its config byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MatchingMode {
    Off = 0,
    /// Top of range: the entry covers `[previous address, own address)`.
    TopOfRange = 1,
    /// Naturally aligned four-byte region.
    NaturallyAligned4Byte = 2,
    /// Naturally aligned power-of-two region, size encoded in trailing one-bits.
    NaturallyAlignedPowerOfTwo = 3,
}

impl MatchingMode {
    fn from_config(config: u8) -> Self {
        match config >> MODE_SHIFT & 0b11 {
            0 => Self::Off,
            1 => Self::TopOfRange,
            2 => Self::NaturallyAligned4Byte,
            _ => Self::NaturallyAlignedPowerOfTwo,
        }
    }
}

/// Static configuration of a [`Pmp`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PmpConfig {
    pub entries: usize,
    /// Width of the address registers in bits.
    pub address_bits: u32,
    /// Minimum NAPOT grain: registers encoding fewer trailing ones are clamped up.
    pub napot_grain: u32,
    /// 64-bit layout: config CSRs pack 8 entries and odd CSR indices are invalid.
    pub rv64: bool,
}

impl Default for PmpConfig {
    fn default() -> Self {
        Self {
            entries: 16,
            address_bits: 32,
            napot_grain: 0,
            rv64: false,
        }
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum PmpConfigError {
    #[error("number of entries must be in 1..=64, got {0}")]
    InvalidEntryCount(usize),
    #[error("address registers must be at most 62 bits wide, got {0}")]
    InvalidAddressBits(u32),
}

/// Recoverable CSR indexing errors; the offending access becomes a no-op.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum PmpCsrError {
    #[error("PMP CSR index {0} is out of range")]
    IndexOutOfRange(usize),
    #[error("odd PMP config CSR index {0} is invalid on a 64-bit hart")]
    OddConfigIndex(usize),
}

#[derive(Debug, Clone)]
struct Entry {
    config: u8,
    address: u64,
    /// Derived from config/address, and from the previous entry's address in top-of-range mode.
    range: Option<AddressRange>,
}

impl Entry {
    fn new() -> Self {
        Self {
            config: 0,
            address: 0,
            range: None,
        }
    }

    fn mode(&self) -> MatchingMode {
        MatchingMode::from_config(self.config)
    }

    fn permissions(&self) -> u8 {
        self.config & permission::FULL
    }

    fn lock_bit(&self) -> bool {
        self.config & LOCK_BIT != 0
    }
}

pub struct Pmp {
    config: PmpConfig,
    entries: Vec<Entry>,
    core: Box<dyn PmpCore + Send>,
}

impl std::fmt::Debug for Pmp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pmp")
            .field("config", &self.config)
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl Pmp {
    pub fn new(config: PmpConfig, core: Box<dyn PmpCore + Send>) -> Result<Self, PmpConfigError> {
        if !(1..=64).contains(&config.entries) {
            return Err(PmpConfigError::InvalidEntryCount(config.entries));
        }
        if config.address_bits > 62 {
            return Err(PmpConfigError::InvalidAddressBits(config.address_bits));
        }
        Ok(Self {
            entries: vec![Entry::new(); config.entries],
            config,
            core,
        })
    }

    fn entries_per_config_csr(&self) -> usize {
        match self.config.rv64 {
            true => 8,
            false => 4,
        }
    }

    fn address_mask(&self) -> u64 {
        u64::MAX >> (64 - self.config.address_bits)
    }

    /// An entry is locked by its own lock bit, or by the next entry being a locked top-of-range
    /// entry (whose lower bound depends on this entry's address).
    fn is_entry_locked(&self, index: usize) -> bool {
        if self.entries[index].lock_bit() {
            return true;
        }
        match self.entries.get(index + 1) {
            Some(next) => next.mode() == MatchingMode::TopOfRange && next.lock_bit(),
            None => false,
        }
    }

    pub fn is_any_region_locked(&self) -> bool {
        self.entries.iter().any(|entry| entry.lock_bit())
    }

    /// PMP is disabled while no entry has a matching mode configured.
    fn is_disabled(&self) -> bool {
        self.entries
            .iter()
            .all(|entry| entry.mode() == MatchingMode::Off)
    }

    fn compute_range(&self, index: usize) -> Option<AddressRange> {
        let entry = &self.entries[index];
        match entry.mode() {
            MatchingMode::Off => None,
            MatchingMode::TopOfRange => {
                let start = match index {
                    0 => 0,
                    i => self.entries[i - 1].address << 2,
                };
                let end = (entry.address << 2).checked_sub(1)?;
                AddressRange::new(start, end).ok()
            }
            MatchingMode::NaturallyAligned4Byte => {
                let start = entry.address << 2;
                AddressRange::new(start, start.checked_add(3)?).ok()
            }
            MatchingMode::NaturallyAlignedPowerOfTwo => {
                if entry.address == self.address_mask() {
                    return Some(AddressRange::full());
                }
                let mut grain = entry.address.trailing_ones();
                if grain < self.config.napot_grain {
                    warn!(
                        entry = index,
                        grain = grain,
                        minimum = self.config.napot_grain;
                        "NAPOT grain below the supported minimum, clamping"
                    );
                    grain = self.config.napot_grain;
                }
                // Size is 2^(grain + 3) bytes
                let delta = match grain + 3 < 64 {
                    true => (1u64 << (grain + 3)) - 1,
                    false => u64::MAX,
                };
                let base = (entry.address & !(u64::MAX >> (63 - grain))) << 2;
                AddressRange::new(base, base.checked_add(delta)?).ok()
            }
        }
    }

    /// Recompute the derived range of `index` (and of a following top-of-range entry, whose lower
    /// bound depends on it), publish the new ranges, and flush cached translations.
    fn refresh_entry(&mut self, index: usize) {
        let mut touched = vec![index];
        if let Some(next) = self.entries.get(index + 1) {
            if next.mode() == MatchingMode::TopOfRange {
                touched.push(index + 1);
            }
        }
        for i in touched {
            let range = self.compute_range(i);
            self.entries[i].range = range;
            match range {
                Some(range) => self.core.set_pmp_address(i, range.start(), range.end()),
                None => self.core.set_pmp_address(i, 0, 0),
            }
        }
        self.core.flush_tlb();
    }

    /// Permissions granted to the byte span `[address, address + size)`.
    ///
    /// A span that only partially overlaps an entry's range is denied outright. Machine mode
    /// keeps its full default access unless the matching entry is locked. The first matching
    /// entry wins.
    pub fn get_access(&self, address: u64, size: u64, access_type: AccessType) -> u8 {
        if self.is_disabled() || size == 0 {
            return permission::FULL;
        }
        let Some(span) = address
            .checked_add(size - 1)
            .and_then(|end| AddressRange::new(address, end).ok())
        else {
            return permission::NONE;
        };
        let privilege = effective_privilege_level(
            self.core.current_privilege_level(),
            self.core.mstatus(),
            access_type,
        );
        let default_access = match privilege == PrivilegeLevel::Machine {
            true => permission::FULL,
            false => permission::NONE,
        };

        for (index, entry) in self.entries.iter().enumerate() {
            let Some(range) = entry.range else {
                continue;
            };
            if range.contains_range(span) {
                return match privilege != PrivilegeLevel::Machine || self.is_entry_locked(index) {
                    true => entry.permissions(),
                    false => default_access,
                };
            }
            if range.overlaps(span) {
                // Partial matches always deny, regardless of privilege
                return permission::NONE;
            }
        }
        default_access
    }

    /// The range of the first active entry overlapping the byte span, used by the bus
    /// collaborator to invalidate page-granular permission caches.
    pub fn try_get_overlapping_region(&self, address: u64, size: u64) -> Option<AddressRange> {
        let end = address.checked_add(size.checked_sub(1)?)?;
        let span = AddressRange::new(address, end).ok()?;
        self.entries
            .iter()
            .filter_map(|entry| entry.range)
            .find(|range| range.overlaps(span))
    }

    /// Derived range of an entry, `None` while the entry is off or empty.
    pub fn entry_range(&self, index: usize) -> Option<AddressRange> {
        self.entries.get(index)?.range
    }

    /// Read a packed config CSR: 4 entries per CSR on RV32, 8 on RV64 (even indices only).
    pub fn read_config_csr(&self, index: usize) -> Result<u64, PmpCsrError> {
        let per_csr = self.entries_per_config_csr();
        if self.config.rv64 && index % 2 != 0 {
            return Err(PmpCsrError::OddConfigIndex(index));
        }
        let base = match self.config.rv64 {
            true => index / 2 * per_csr,
            false => index * per_csr,
        };
        if base >= self.config.entries {
            return Err(PmpCsrError::IndexOutOfRange(index));
        }
        let mut value = 0u64;
        for slot in 0..per_csr {
            if let Some(entry) = self.entries.get(base + slot) {
                value |= (entry.config as u64) << (8 * slot);
            }
        }
        Ok(value)
    }

    /// Write a packed config CSR. Locked entries silently keep their old configuration.
    pub fn write_config_csr(&mut self, index: usize, value: u64) -> Result<(), PmpCsrError> {
        let per_csr = self.entries_per_config_csr();
        if self.config.rv64 && index % 2 != 0 {
            return Err(PmpCsrError::OddConfigIndex(index));
        }
        let base = match self.config.rv64 {
            true => index / 2 * per_csr,
            false => index * per_csr,
        };
        if base >= self.config.entries {
            return Err(PmpCsrError::IndexOutOfRange(index));
        }
        for slot in 0..per_csr {
            let entry_index = base + slot;
            if entry_index >= self.config.entries {
                break;
            }
            if self.is_entry_locked(entry_index) {
                trace!(entry = entry_index; "config write to locked entry ignored");
                continue;
            }
            let config = (value >> (8 * slot)) as u8 & CONFIG_MASK;
            if config != self.entries[entry_index].config {
                self.entries[entry_index].config = config;
                self.refresh_entry(entry_index);
            }
        }
        Ok(())
    }

    pub fn read_address_csr(&self, index: usize) -> Result<u64, PmpCsrError> {
        match self.entries.get(index) {
            Some(entry) => Ok(entry.address),
            None => Err(PmpCsrError::IndexOutOfRange(index)),
        }
    }

    /// Write an address CSR. Writes to locked entries (including entries pinned by a locked
    /// top-of-range successor) are silently ignored.
    pub fn write_address_csr(&mut self, index: usize, value: u64) -> Result<(), PmpCsrError> {
        if index >= self.config.entries {
            return Err(PmpCsrError::IndexOutOfRange(index));
        }
        if self.is_entry_locked(index) {
            trace!(entry = index; "address write to locked entry ignored");
            return Ok(());
        }
        let masked = value & self.address_mask();
        if masked != self.entries[index].address {
            self.entries[index].address = masked;
            self.refresh_entry(index);
        }
        Ok(())
    }

    /// Reset clears every entry, including locked ones.
    pub fn reset(&mut self) {
        for index in 0..self.config.entries {
            self.entries[index] = Entry::new();
            self.core.set_pmp_address(index, 0, 0);
        }
        self.core.flush_tlb();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct TestCore {
        privilege: Arc<Mutex<PrivilegeLevel>>,
        mstatus: Arc<AtomicU64>,
        flushes: Arc<AtomicU64>,
        published: Arc<Mutex<Vec<(usize, u64, u64)>>>,
    }

    impl TestCore {
        fn new(privilege: PrivilegeLevel) -> Self {
            Self {
                privilege: Arc::new(Mutex::new(privilege)),
                mstatus: Arc::new(AtomicU64::new(0)),
                flushes: Arc::new(AtomicU64::new(0)),
                published: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl PmpCore for TestCore {
        fn current_privilege_level(&self) -> PrivilegeLevel {
            *self.privilege.lock().unwrap()
        }

        fn mstatus(&self) -> u64 {
            self.mstatus.load(Ordering::SeqCst)
        }

        fn flush_tlb(&mut self) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }

        fn set_pmp_address(&mut self, index: usize, start: u64, end: u64) {
            self.published.lock().unwrap().push((index, start, end));
        }
    }

    fn pmp(privilege: PrivilegeLevel) -> (Pmp, TestCore) {
        let core = TestCore::new(privilege);
        let pmp = Pmp::new(PmpConfig::default(), Box::new(core.clone())).unwrap();
        (pmp, core)
    }

    const NAPOT: u8 = (MatchingMode::NaturallyAlignedPowerOfTwo as u8) << 3;
    const TOR: u8 = (MatchingMode::TopOfRange as u8) << 3;
    const NA4: u8 = (MatchingMode::NaturallyAligned4Byte as u8) << 3;

    /// NAPOT address register for `[base, base + (1 << log2_size))`.
    fn napot_address(base: u64, log2_size: u32) -> u64 {
        base >> 2 | (1u64 << (log2_size - 3)) - 1
    }

    #[test]
    fn test_disabled_pmp_grants_everything() {
        let (pmp, _) = pmp(PrivilegeLevel::User);
        assert_eq!(
            permission::FULL,
            pmp.get_access(0xDEAD_BEEF, 4, AccessType::Store)
        );
    }

    #[test]
    fn test_napot_decode() {
        let (mut pmp, _) = pmp(PrivilegeLevel::User);
        // 4 KiB region at 0x8000_0000
        pmp.write_address_csr(0, napot_address(0x8000_0000, 12))
            .unwrap();
        pmp.write_config_csr(0, (NAPOT | permission::READ) as u64)
            .unwrap();
        assert_eq!(
            Some(crate::address_range!(0x8000_0000, 0x8000_0FFF)),
            pmp.entry_range(0)
        );
        assert_eq!(
            permission::READ,
            pmp.get_access(0x8000_0800, 8, AccessType::Load)
        );
    }

    #[test]
    fn test_napot_all_ones_covers_everything() {
        let (mut pmp, _) = pmp(PrivilegeLevel::User);
        pmp.write_address_csr(0, 0xFFFF_FFFF).unwrap();
        pmp.write_config_csr(0, (NAPOT | permission::FULL) as u64)
            .unwrap();
        assert_eq!(Some(AddressRange::full()), pmp.entry_range(0));
    }

    #[test]
    fn test_napot_grain_clamp() {
        let core = TestCore::new(PrivilegeLevel::User);
        let mut pmp = Pmp::new(
            PmpConfig {
                napot_grain: 3,
                ..PmpConfig::default()
            },
            Box::new(core.clone()),
        )
        .unwrap();
        // One trailing one would encode an 8-byte range; the grain of 3 forces 2^(3+3) = 64 bytes
        pmp.write_address_csr(0, 0x100 >> 2 | 0b1).unwrap();
        pmp.write_config_csr(0, (NAPOT | permission::READ) as u64)
            .unwrap();
        let range = pmp.entry_range(0).unwrap();
        assert_eq!(Some(64), range.size());
    }

    #[test]
    fn test_partial_match_denies_even_machine() {
        let (mut pmp, _) = pmp(PrivilegeLevel::Machine);
        pmp.write_address_csr(0, napot_address(0x1000, 12)).unwrap();
        pmp.write_config_csr(0, (NAPOT | permission::FULL) as u64)
            .unwrap();
        // Span straddles the region's upper bound
        assert_eq!(
            permission::NONE,
            pmp.get_access(0x1FFC, 8, AccessType::Load)
        );
    }

    #[test]
    fn test_machine_default_access_unless_locked() {
        let (mut pmp, _) = pmp(PrivilegeLevel::Machine);
        pmp.write_address_csr(0, napot_address(0x1000, 12)).unwrap();
        pmp.write_config_csr(0, (NAPOT | permission::READ) as u64)
            .unwrap();
        // Unlocked entry does not constrain machine mode
        assert_eq!(
            permission::FULL,
            pmp.get_access(0x1000, 4, AccessType::Store)
        );
        pmp.write_config_csr(0, (LOCK_BIT | NAPOT | permission::READ) as u64)
            .unwrap();
        // Locked entries apply to machine mode too
        assert_eq!(
            permission::READ,
            pmp.get_access(0x1000, 4, AccessType::Store)
        );
    }

    #[test]
    fn test_first_match_wins() {
        let (mut pmp, _) = pmp(PrivilegeLevel::User);
        pmp.write_address_csr(0, napot_address(0x1000, 12)).unwrap();
        pmp.write_address_csr(1, napot_address(0x0, 16)).unwrap();
        pmp.write_config_csr(
            0,
            (NAPOT | permission::READ) as u64 | ((NAPOT | permission::FULL) as u64) << 8,
        )
        .unwrap();
        // Entry 1 would grant everything, but entry 0 matches first
        assert_eq!(
            permission::READ,
            pmp.get_access(0x1000, 4, AccessType::Load)
        );
        assert_eq!(permission::FULL, pmp.get_access(0x0, 4, AccessType::Load));
    }

    #[test]
    fn test_tor_uses_previous_entry_address() {
        let (mut pmp, _) = pmp(PrivilegeLevel::User);
        pmp.write_address_csr(0, 0x1000 >> 2).unwrap();
        pmp.write_address_csr(1, 0x2000 >> 2).unwrap();
        pmp.write_config_csr(0, ((TOR | permission::WRITE) as u64) << 8)
            .unwrap();
        assert_eq!(
            Some(crate::address_range!(0x1000, 0x1FFF)),
            pmp.entry_range(1)
        );
        // Entry 0 itself is off
        assert_eq!(None, pmp.entry_range(0));
        // Changing the previous address moves the lower bound
        pmp.write_address_csr(0, 0x1800 >> 2).unwrap();
        assert_eq!(
            Some(crate::address_range!(0x1800, 0x1FFF)),
            pmp.entry_range(1)
        );
    }

    #[test]
    fn test_tor_entry_zero_starts_at_zero() {
        let (mut pmp, _) = pmp(PrivilegeLevel::User);
        pmp.write_address_csr(0, 0x1000 >> 2).unwrap();
        pmp.write_config_csr(0, (TOR | permission::READ) as u64)
            .unwrap();
        assert_eq!(Some(crate::address_range!(0, 0xFFF)), pmp.entry_range(0));
    }

    #[test]
    fn test_na4_range() {
        let (mut pmp, _) = pmp(PrivilegeLevel::User);
        pmp.write_address_csr(0, 0x80 >> 2).unwrap();
        pmp.write_config_csr(0, (NA4 | permission::EXECUTE) as u64)
            .unwrap();
        assert_eq!(Some(crate::address_range!(0x80, 0x83)), pmp.entry_range(0));
        assert_eq!(
            permission::EXECUTE,
            pmp.get_access(0x80, 4, AccessType::InstructionFetch)
        );
        // One byte past the region partially matches nothing; PMP is enabled so user gets none
        assert_eq!(
            permission::NONE,
            pmp.get_access(0x84, 4, AccessType::InstructionFetch)
        );
    }

    #[test]
    fn test_lock_chain() {
        let (mut pmp, _) = pmp(PrivilegeLevel::Machine);
        pmp.write_address_csr(0, 0x1000 >> 2).unwrap();
        pmp.write_address_csr(1, 0x2000 >> 2).unwrap();
        // Entry 1: locked top-of-range; this also pins entry 0's address
        pmp.write_config_csr(0, ((LOCK_BIT | TOR | permission::READ) as u64) << 8)
            .unwrap();
        assert!(pmp.is_any_region_locked());

        pmp.write_address_csr(1, 0x3000 >> 2).unwrap();
        assert_eq!(0x2000 >> 2, pmp.read_address_csr(1).unwrap());
        pmp.write_address_csr(0, 0x1800 >> 2).unwrap();
        assert_eq!(0x1000 >> 2, pmp.read_address_csr(0).unwrap());
        // Entry 1's own config is pinned as well
        pmp.write_config_csr(0, 0).unwrap();
        assert_eq!(
            ((LOCK_BIT | TOR | permission::READ) as u64) << 8,
            pmp.read_config_csr(0).unwrap()
        );
        // Reset clears locked entries
        pmp.reset();
        assert!(!pmp.is_any_region_locked());
        assert_eq!(0, pmp.read_address_csr(1).unwrap());
    }

    #[test]
    fn test_mprv_redirects_loads_to_mpp() {
        let (mut pmp, core) = pmp(PrivilegeLevel::Machine);
        pmp.write_address_csr(0, napot_address(0x1000, 12)).unwrap();
        pmp.write_config_csr(0, (NAPOT | permission::READ) as u64)
            .unwrap();
        // MPRV set, MPP = user
        core.mstatus.store(crate::cpu::mstatus::MPRV, Ordering::SeqCst);
        assert_eq!(
            permission::READ,
            pmp.get_access(0x1000, 4, AccessType::Load)
        );
        // Instruction fetches keep the real (machine) privilege
        assert_eq!(
            permission::FULL,
            pmp.get_access(0x1000, 4, AccessType::InstructionFetch)
        );
    }

    #[test]
    fn test_rule_changes_flush_and_publish() {
        let (mut pmp, core) = pmp(PrivilegeLevel::User);
        pmp.write_address_csr(0, napot_address(0x1000, 12)).unwrap();
        pmp.write_config_csr(0, (NAPOT | permission::READ) as u64)
            .unwrap();
        assert_eq!(2, core.flushes.load(Ordering::SeqCst));
        let published = core.published.lock().unwrap();
        assert_eq!((0, 0x1000, 0x1FFF), *published.last().unwrap());
    }

    #[test]
    fn test_rv64_config_packing() {
        let core = TestCore::new(PrivilegeLevel::User);
        let mut pmp = Pmp::new(
            PmpConfig {
                rv64: true,
                address_bits: 54,
                ..PmpConfig::default()
            },
            Box::new(core.clone()),
        )
        .unwrap();
        assert_eq!(
            Err(PmpCsrError::OddConfigIndex(1)),
            pmp.write_config_csr(1, 0)
        );
        // pmpcfg2 covers entries 8..16
        let value = ((NAPOT | permission::READ) as u64) << 56;
        pmp.write_address_csr(15, napot_address(0x4000, 12)).unwrap();
        pmp.write_config_csr(2, value).unwrap();
        assert_eq!(value, pmp.read_config_csr(2).unwrap());
        assert_eq!(
            Some(crate::address_range!(0x4000, 0x4FFF)),
            pmp.entry_range(15)
        );
    }

    #[test]
    fn test_overlapping_region_lookup() {
        let (mut pmp, _) = pmp(PrivilegeLevel::User);
        pmp.write_address_csr(0, napot_address(0x1000, 12)).unwrap();
        pmp.write_config_csr(0, (NAPOT | permission::READ) as u64)
            .unwrap();
        assert_eq!(
            Some(crate::address_range!(0x1000, 0x1FFF)),
            pmp.try_get_overlapping_region(0x1FF0, 0x100)
        );
        assert_eq!(None, pmp.try_get_overlapping_region(0x3000, 0x10));
    }

    #[test]
    fn test_csr_index_errors() {
        let (mut pmp, _) = pmp(PrivilegeLevel::User);
        assert_eq!(
            Err(PmpCsrError::IndexOutOfRange(16)),
            pmp.write_address_csr(16, 0)
        );
        assert_eq!(
            Err(PmpCsrError::IndexOutOfRange(4)),
            pmp.read_config_csr(4)
        );
    }
}
