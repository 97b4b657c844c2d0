//! Interfaces the owning CPU core implements for its interrupt controllers and PMP.

use crate::{AccessType, PrivilegeLevel, RawPrivilegeLevel};

/// Interface a CLIC uses to present its arbitration winner to the hart.
///
/// The controller calls [`present_interrupt`](Self::present_interrupt) every time the winning
/// source (or its level/mode) changes, and [`retract_interrupt`](Self::retract_interrupt) when no
/// enabled source is pending.
pub trait ClicCore {
    fn present_interrupt(
        &mut self,
        index: u16,
        vectored: bool,
        level: u8,
        privilege: PrivilegeLevel,
    );

    fn retract_interrupt(&mut self);
}

/// Interface for raising simulated access faults from a memory-mapped component.
///
/// `secondary_cause` ends up in the platform's extended cause CSR; its meaning is
/// implementation-defined.
pub trait ExceptionSink {
    fn raise_load_access_fault(&mut self, address: u64, secondary_cause: u32);

    fn raise_store_access_fault(&mut self, address: u64, secondary_cause: u32);

    fn raise_access_fault(&mut self, access_type: AccessType, address: u64, secondary_cause: u32) {
        match access_type {
            AccessType::Store => self.raise_store_access_fault(address, secondary_cause),
            _ => self.raise_load_access_fault(address, secondary_cause),
        }
    }
}

/// Interface a PMP engine uses to query and notify the hart it protects.
pub trait PmpCore {
    fn current_privilege_level(&self) -> PrivilegeLevel;

    /// Current value of the `mstatus` CSR, used for the `MPRV`/`MPP` effective-privilege rules.
    fn mstatus(&self) -> u64;

    /// Invalidate any cached translations/permissions; called after every PMP rule change.
    fn flush_tlb(&mut self);

    /// Publish the decoded address range of a PMP entry so the core can maintain page-granular
    /// permission caches. `start..=end` is inclusive; an empty entry publishes `(0, 0)`.
    fn set_pmp_address(&mut self, index: usize, start: u64, end: u64);
}

/// `mstatus` fields the PMP cares about.
pub mod mstatus {
    pub const MPRV: u64 = 1 << 17;
    pub const MPP_SHIFT: u32 = 11;
    pub const MPP_MASK: u64 = 0b11 << MPP_SHIFT;
}

/// Extract the effective privilege level for an access: `MPP` when `mstatus.MPRV` is set and the
/// access is a data access, the current level otherwise.
pub fn effective_privilege_level(
    current: PrivilegeLevel,
    mstatus_value: u64,
    access_type: AccessType,
) -> RawPrivilegeLevel {
    if access_type.is_data_access() && mstatus_value & mstatus::MPRV != 0 {
        let mpp = (mstatus_value & mstatus::MPP_MASK) >> mstatus::MPP_SHIFT;
        RawPrivilegeLevel::from_u2(mpp as u8)
    } else {
        current.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_privilege() {
        let mprv_user = mstatus::MPRV; // MPP == 0b00
        assert_eq!(
            RawPrivilegeLevel::User,
            effective_privilege_level(PrivilegeLevel::Machine, mprv_user, AccessType::Load)
        );
        // MPRV never redirects instruction fetches
        assert_eq!(
            RawPrivilegeLevel::Machine,
            effective_privilege_level(
                PrivilegeLevel::Machine,
                mprv_user,
                AccessType::InstructionFetch
            )
        );
        assert_eq!(
            RawPrivilegeLevel::Supervisor,
            effective_privilege_level(PrivilegeLevel::Supervisor, 0, AccessType::Store)
        );
    }
}
