//! Core-local interrupt controller with per-source level/priority/mode arbitration.
//!
//! Every source carries pending/enable state, a trigger type, a target-mode field and a control
//! byte packing its interrupt level and priority. On every relevant state change the controller
//! re-arbitrates and presents the winning source to the core, or retracts when none qualifies.

use log::{trace, warn};
use std::sync::Mutex;
use thiserror::Error;

use crate::cpu::ClicCore;
use crate::interrupt::Trigger;
use crate::PrivilegeLevel;

pub const CONFIGURATION_ADDR: u64 = 0x0;
pub const TRIGGER_BASE_ADDR: u64 = 0x40;
pub const TRIGGER_COUNT: usize = 32;
pub const SOURCE_BASE_ADDR: u64 = 0x1000;
/// Byte registers per source: pending, enable, attribute, input control.
pub const SOURCE_STRIDE: u64 = 4;

/// Indirect CSR select ranges. Each control/attribute select covers four sources; the bitmap
/// selects cover 32 sources per data register.
pub const ISELECT_CONTROL_BASE: u16 = 0x000;
pub const ISELECT_BITMAP_BASE: u16 = 0x400;
pub const ISELECT_TRIGGER_BASE: u16 = 0x480;
pub const ISELECT_RESERVED_BASE: u16 = 0x4A0;

/// Level presented when a source has all level bits implemented and set.
pub const MAX_LEVEL: u8 = u8::MAX;

/// Static configuration of a [`Clic`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClicConfig {
    pub sources: usize,
    /// Implemented machine-mode interrupt-level bits (0..=8).
    pub machine_level_bits: u8,
    /// Implemented supervisor-mode interrupt-level bits (0..=8).
    pub supervisor_level_bits: u8,
    /// Implemented bits of the per-source mode field (0..=2).
    pub mode_bits: u8,
    /// Implemented bits of the per-source control byte (0..=8), split between level and priority.
    pub control_bits: u8,
    /// Use the legacy 8-bit configuration register layout carrying the nv bit, in which the
    /// shared `nlbits` field is authoritative for the level width.
    pub legacy_nv_layout: bool,
}

impl Default for ClicConfig {
    fn default() -> Self {
        Self {
            sources: 4096,
            machine_level_bits: 8,
            supervisor_level_bits: 0,
            mode_bits: 2,
            control_bits: 8,
            legacy_nv_layout: false,
        }
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ClicConfigError {
    #[error("number of sources must be in 2..=4096, got {0}")]
    InvalidSourceCount(usize),
    #[error("{name} must be at most {max}, got {value}")]
    BitWidthOutOfRange {
        name: &'static str,
        max: u8,
        value: u8,
    },
    #[error("level bits ({level_bits}) cannot exceed control bits ({control_bits})")]
    LevelExceedsControl { level_bits: u8, control_bits: u8 },
}

impl ClicConfig {
    fn validate(&self) -> Result<(), ClicConfigError> {
        if !(2..=4096).contains(&self.sources) {
            return Err(ClicConfigError::InvalidSourceCount(self.sources));
        }
        let widths = [
            ("machine level bits", self.machine_level_bits, 8),
            ("supervisor level bits", self.supervisor_level_bits, 8),
            ("mode bits", self.mode_bits, 2),
            ("control bits", self.control_bits, 8),
        ];
        for (name, value, max) in widths {
            if value > max {
                return Err(ClicConfigError::BitWidthOutOfRange { name, max, value });
            }
        }
        if self.machine_level_bits > self.control_bits {
            return Err(ClicConfigError::LevelExceedsControl {
                level_bits: self.machine_level_bits,
                control_bits: self.control_bits,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct Source {
    pending: bool,
    enabled: bool,
    /// Selective hardware vectoring for this source.
    vectored: bool,
    trigger: Trigger,
    /// Raw 2-bit mode field, clamped at write time to a value valid under the current nmbits.
    mode: u8,
    /// Control byte; only the top `control_bits` are backed by storage.
    control: u8,
}

/// Runtime (register-visible) configuration, on top of the static [`ClicConfig`].
#[derive(Debug, Clone)]
struct RuntimeCfg {
    /// Authoritative level width: mnlbits in the 32-bit layout, nlbits in the legacy one.
    level_bits: u8,
    nmbits: u8,
    snlbits: u8,
    unlbits: u8,
    /// Legacy layout only: selective vectoring enable.
    nvbits: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Winner {
    index: u16,
    vectored: bool,
    level: u8,
    priority: u8,
    privilege: PrivilegeLevel,
}

#[derive(Debug)]
struct State {
    config: ClicConfig,
    cfg: RuntimeCfg,
    sources: Vec<Source>,
    triggers: [u32; TRIGGER_COUNT],
    presented: Option<Winner>,
    /// Set while the core is servicing the acknowledged interrupt; blocks priority-only
    /// re-presentation until completion.
    acknowledged: Option<Winner>,
}

impl State {
    fn new(config: ClicConfig) -> Self {
        let cfg = RuntimeCfg {
            level_bits: config.machine_level_bits,
            nmbits: config.mode_bits,
            snlbits: config.supervisor_level_bits,
            unlbits: 0,
            nvbits: false,
        };
        Self {
            sources: vec![Source::default(); config.sources],
            triggers: [0; TRIGGER_COUNT],
            presented: None,
            acknowledged: None,
            cfg,
            config,
        }
    }

    /// Bits of the control byte that are not backed by storage read as ones.
    fn control_byte(&self, source: &Source) -> u8 {
        let unimplemented = 8 - self.config.control_bits as u32;
        source.control | (u8::MAX.checked_shr(8 - unimplemented).unwrap_or(0))
    }

    /// Effective interrupt level: the top `level_bits` of the control byte, left-justified with
    /// the remaining low bits forced to one.
    fn effective_level(&self, source: &Source) -> u8 {
        let level_bits = self.cfg.level_bits as u32;
        if level_bits == 0 {
            return MAX_LEVEL;
        }
        let low = 8 - level_bits;
        self.control_byte(source) | (u8::MAX.checked_shr(8 - low).unwrap_or(0))
    }

    /// Effective priority: the control bits below the level field, left-justified into 8 bits
    /// with the remaining low bits forced to one.
    fn effective_priority(&self, source: &Source) -> u8 {
        let priority_bits = (self.config.control_bits - self.cfg.level_bits) as u32;
        if priority_bits == 0 {
            return u8::MAX;
        }
        let field = self.control_byte(source) >> (8 - self.cfg.level_bits as u32 - priority_bits)
            & (u8::MAX >> (8 - priority_bits));
        field << (8 - priority_bits) | u8::MAX.checked_shr(priority_bits).unwrap_or(0)
    }

    /// Target privilege of a source under the current nmbits setting.
    fn effective_privilege(&self, source: &Source) -> PrivilegeLevel {
        match self.cfg.nmbits {
            0 => PrivilegeLevel::Machine,
            1 => match source.mode & 0b10 != 0 {
                true => PrivilegeLevel::Machine,
                false => PrivilegeLevel::Supervisor,
            },
            _ => match source.mode {
                0b00 => PrivilegeLevel::User,
                0b01 | 0b10 => PrivilegeLevel::Supervisor,
                _ => PrivilegeLevel::Machine,
            },
        }
    }

    /// Best enabled+pending source: highest privilege, then level, then priority, lowest id on
    /// ties.
    fn best_candidate(&self) -> Option<Winner> {
        let mut best: Option<Winner> = None;
        for (id, source) in self.sources.iter().enumerate() {
            if !(source.pending && source.enabled) {
                continue;
            }
            let candidate = Winner {
                index: id as u16,
                vectored: source.vectored,
                level: self.effective_level(source),
                priority: self.effective_priority(source),
                privilege: self.effective_privilege(source),
            };
            let replaces = match best {
                None => true,
                Some(current) => {
                    (candidate.privilege, candidate.level, candidate.priority)
                        > (current.privilege, current.level, current.priority)
                }
            };
            if replaces {
                best = Some(candidate);
            }
        }
        best
    }

    /// The source to present, honoring the acknowledged-interrupt freeze: while a handler runs,
    /// only a strictly higher privilege or level may be presented; priority differences alone
    /// never preempt.
    fn winner(&self) -> Option<Winner> {
        let best = self.best_candidate()?;
        match self.acknowledged {
            None => Some(best),
            Some(active) => ((best.privilege, best.level) > (active.privilege, active.level))
                .then_some(best),
        }
    }
}

/// Clamp a written mode field to a value valid under the current nmbits width.
fn clamp_mode(nmbits: u8, raw: u8) -> u8 {
    match nmbits {
        0 => 0b11,
        1 => match raw & 0b10 != 0 {
            true => 0b11,
            false => 0b01,
        },
        _ => match raw {
            0b10 => 0b01, // reserved privilege level
            raw => raw,
        },
    }
}

pub struct Clic {
    state: Mutex<State>,
    core: Mutex<Box<dyn ClicCore + Send>>,
}

impl std::fmt::Debug for Clic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clic")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Clic {
    /// Create a new Clic in reset state, presenting interrupts to `core`.
    pub fn new(
        config: ClicConfig,
        core: Box<dyn ClicCore + Send>,
    ) -> Result<Self, ClicConfigError> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(State::new(config)),
            core: Mutex::new(core),
        })
    }

    pub fn reset(&self) {
        {
            let mut state = self.state.lock().unwrap();
            let config = state.config.clone();
            *state = State::new(config);
        }
        self.core.lock().unwrap().retract_interrupt();
    }

    /// Re-arbitrate and push the outcome to the core if it changed.
    fn update(&self) {
        let change = {
            let mut state = self.state.lock().unwrap();
            let winner = state.winner();
            match winner == state.presented {
                true => None,
                false => {
                    state.presented = winner;
                    Some(winner)
                }
            }
        };
        if let Some(winner) = change {
            let mut core = self.core.lock().unwrap();
            match winner {
                Some(w) => core.present_interrupt(w.index, w.vectored, w.level, w.privilege),
                None => core.retract_interrupt(),
            }
        }
    }

    /// Drive the input signal of a source. Edge-triggered sources latch on the configured
    /// transition; level-triggered sources follow the (polarity-corrected) signal.
    pub fn on_signal(&self, source: usize, high: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if source >= state.config.sources {
                trace!(source = source; "signal on out-of-range source dropped");
                return;
            }
            let effective = high != state.sources[source].trigger.is_inverted();
            let entry = &mut state.sources[source];
            match entry.trigger.is_edge() {
                true => entry.pending |= effective,
                false => entry.pending = effective,
            }
        }
        self.update();
    }

    /// Called by the core when it takes the presented interrupt. Freezes priority-based
    /// preemption until [`complete`](Self::complete).
    pub fn acknowledge(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.acknowledged = state.presented;
        }
        self.update();
    }

    /// Called by the core when the handler for the acknowledged interrupt returns.
    pub fn complete(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.acknowledged = None;
        }
        self.update();
    }

    /// Clear the pending bit of the currently presented source, provided it is edge-triggered.
    /// The explicit acknowledge path is the only way to clear an edge-latched pending bit.
    pub fn clear_edge_interrupt(&self) {
        {
            let mut state = self.state.lock().unwrap();
            let Some(presented) = state.presented else {
                return;
            };
            let index = presented.index as usize;
            if state.sources[index].trigger.is_edge() {
                state.sources[index].pending = false;
            }
        }
        self.update();
    }

    /// Index, level and privilege of the currently presented source, if any. Debugger interface.
    pub fn presented(&self) -> Option<(u16, u8, PrivilegeLevel)> {
        let state = self.state.lock().unwrap();
        state.presented.map(|w| (w.index, w.level, w.privilege))
    }

    pub fn is_pending(&self, source: usize) -> bool {
        let state = self.state.lock().unwrap();
        state.sources.get(source).is_some_and(|s| s.pending)
    }

    fn source_register(address: u64, sources: usize) -> Option<(usize, u64)> {
        if address < SOURCE_BASE_ADDR {
            return None;
        }
        let offset = address - SOURCE_BASE_ADDR;
        let source = (offset / SOURCE_STRIDE) as usize;
        (source < sources).then_some((source, offset % SOURCE_STRIDE))
    }

    /// Read one of the per-source byte registers.
    pub fn read_u8(&self, address: u64) -> u8 {
        let state = self.state.lock().unwrap();
        if state.config.legacy_nv_layout && address == CONFIGURATION_ADDR {
            return self.compose_legacy_configuration(&state);
        }
        let Some((source, register)) = Self::source_register(address, state.config.sources) else {
            trace!(address = address; "read from unmapped offset");
            return 0;
        };
        let entry = &state.sources[source];
        match register {
            0 => entry.pending as u8,
            1 => entry.enabled as u8,
            2 => self.compose_attribute(entry),
            _ => state.control_byte(entry),
        }
    }

    /// Write one of the per-source byte registers.
    pub fn write_u8(&self, address: u64, value: u8) {
        {
            let mut state = self.state.lock().unwrap();
            if state.config.legacy_nv_layout && address == CONFIGURATION_ADDR {
                self.write_legacy_configuration(&mut state, value);
                drop(state);
                self.update();
                return;
            }
            let Some((source, register)) = Self::source_register(address, state.config.sources)
            else {
                trace!(address = address, value = value; "write to unmapped offset dropped");
                return;
            };
            match register {
                0 => {
                    // Level-triggered pending follows the input signal and is read-only here.
                    match state.sources[source].trigger.is_edge() {
                        true => state.sources[source].pending = value & 1 != 0,
                        false => warn!(
                            source = source;
                            "pending of a level-triggered source follows its input, write dropped"
                        ),
                    }
                }
                1 => state.sources[source].enabled = value & 1 != 0,
                2 => self.write_attribute(&mut state, source, value),
                _ => {
                    let mask = u8::MAX
                        .checked_shl(8 - state.config.control_bits as u32)
                        .unwrap_or(0);
                    state.sources[source].control = value & mask;
                }
            }
        }
        self.update();
    }

    fn compose_attribute(&self, source: &Source) -> u8 {
        let trig = (source.trigger.is_edge() as u8) | (source.trigger.is_inverted() as u8) << 1;
        (source.vectored as u8) | trig << 1 | source.mode << 6
    }

    fn write_attribute(&self, state: &mut State, source: usize, value: u8) {
        let nmbits = state.cfg.nmbits;
        let raw_mode = value >> 6;
        let mode = clamp_mode(nmbits, raw_mode);
        if mode != raw_mode {
            warn!(
                source = source,
                written = raw_mode,
                clamped = mode;
                "mode not representable under the current nmbits, clamped"
            );
        }
        let entry = &mut state.sources[source];
        entry.vectored = value & 1 != 0;
        entry.trigger = Trigger::from_bits(value & 0b10 != 0, value & 0b100 != 0);
        entry.mode = mode;
    }

    fn compose_legacy_configuration(&self, state: &State) -> u8 {
        (state.cfg.nvbits as u8)
            | (state.cfg.level_bits & 0xF) << 1
            | (state.cfg.nmbits & 0b11) << 5
    }

    fn write_legacy_configuration(&self, state: &mut State, value: u8) {
        let nlbits = (value >> 1) & 0xF;
        let nmbits = (value >> 5) & 0b11;
        state.cfg.nvbits = value & 1 != 0;
        state.cfg.level_bits = clamp_field(nlbits, state.config.machine_level_bits, "nlbits");
        state.cfg.nmbits = clamp_field(nmbits, state.config.mode_bits, "nmbits");
    }

    fn compose_configuration(&self, state: &State) -> u32 {
        (state.cfg.level_bits as u32 & 0xF)
            | (state.cfg.nmbits as u32 & 0b11) << 4
            | (state.cfg.snlbits as u32 & 0xF) << 16
            | (state.cfg.unlbits as u32 & 0xF) << 24
    }

    fn write_configuration(&self, state: &mut State, value: u32) {
        let mnlbits = (value & 0xF) as u8;
        let nmbits = (value >> 4 & 0b11) as u8;
        let snlbits = (value >> 16 & 0xF) as u8;
        let unlbits = (value >> 24 & 0xF) as u8;
        state.cfg.level_bits = clamp_field(mnlbits, state.config.machine_level_bits, "mnlbits");
        state.cfg.nmbits = clamp_field(nmbits, state.config.mode_bits, "nmbits");
        state.cfg.snlbits = clamp_field(snlbits, state.config.supervisor_level_bits, "snlbits");
        state.cfg.unlbits = clamp_field(unlbits, 8, "unlbits");
    }

    /// Read a 32-bit register: the configuration register (non-legacy layout) or one of the
    /// interrupt-trigger registers.
    pub fn read_u32(&self, address: u64) -> u32 {
        let state = self.state.lock().unwrap();
        match address {
            CONFIGURATION_ADDR if !state.config.legacy_nv_layout => {
                self.compose_configuration(&state)
            }
            TRIGGER_BASE_ADDR..=0xBC if address % 4 == 0 => {
                state.triggers[((address - TRIGGER_BASE_ADDR) / 4) as usize]
            }
            _ => {
                trace!(address = address; "read from unmapped offset");
                0
            }
        }
    }

    pub fn write_u32(&self, address: u64, value: u32) {
        {
            let mut state = self.state.lock().unwrap();
            match address {
                CONFIGURATION_ADDR if !state.config.legacy_nv_layout => {
                    self.write_configuration(&mut state, value)
                }
                TRIGGER_BASE_ADDR..=0xBC if address % 4 == 0 => {
                    // interrupt number | nxti enable (bit 30) | enable (bit 31)
                    let index = ((address - TRIGGER_BASE_ADDR) / 4) as usize;
                    state.triggers[index] = value & (0x1FFF | 1 << 30 | 1 << 31);
                }
                _ => {
                    trace!(address = address, value = value; "write to unmapped offset dropped");
                    return;
                }
            }
        }
        self.update();
    }

    /// Read through the indirect CSR window (`iselect`, data register index 0 or 1).
    pub fn read_indirect_csr(&self, iselect: u16, reg: u8) -> u32 {
        let state = self.state.lock().unwrap();
        match iselect {
            ISELECT_CONTROL_BASE..=0x3FF => {
                let base = iselect as usize * 4;
                let mut value = 0u32;
                for i in 0..4 {
                    let Some(source) = state.sources.get(base + i) else {
                        break;
                    };
                    let byte = match reg {
                        0 => state.control_byte(source),
                        _ => self.compose_attribute(source),
                    };
                    value |= (byte as u32) << (8 * i);
                }
                value
            }
            ISELECT_BITMAP_BASE..=0x47F => {
                let word = (iselect - ISELECT_BITMAP_BASE) as usize;
                let mut value = 0u32;
                for bit in 0..32 {
                    let Some(source) = state.sources.get(word * 32 + bit) else {
                        break;
                    };
                    let set = match reg {
                        0 => source.pending,
                        _ => source.enabled,
                    };
                    value |= (set as u32) << bit;
                }
                value
            }
            ISELECT_TRIGGER_BASE..=0x49F if reg == 0 => {
                state.triggers[(iselect - ISELECT_TRIGGER_BASE) as usize]
            }
            _ => {
                warn!(iselect = iselect, reg = reg; "read from unimplemented indirect CSR");
                0
            }
        }
    }

    /// Write through the indirect CSR window.
    pub fn write_indirect_csr(&self, iselect: u16, reg: u8, value: u32) {
        {
            let mut state = self.state.lock().unwrap();
            match iselect {
                ISELECT_CONTROL_BASE..=0x3FF => {
                    let base = iselect as usize * 4;
                    let control_mask = u8::MAX
                        .checked_shl(8 - state.config.control_bits as u32)
                        .unwrap_or(0);
                    for i in 0..4 {
                        if base + i >= state.config.sources {
                            break;
                        }
                        let byte = (value >> (8 * i)) as u8;
                        match reg {
                            0 => state.sources[base + i].control = byte & control_mask,
                            _ => self.write_attribute(&mut state, base + i, byte),
                        }
                    }
                }
                ISELECT_BITMAP_BASE..=0x47F => {
                    let word = (iselect - ISELECT_BITMAP_BASE) as usize;
                    for bit in 0..32 {
                        let index = word * 32 + bit;
                        if index >= state.config.sources {
                            break;
                        }
                        let set = value & 1 << bit != 0;
                        match reg {
                            0 => {
                                if state.sources[index].trigger.is_edge() {
                                    state.sources[index].pending = set;
                                }
                            }
                            _ => state.sources[index].enabled = set,
                        }
                    }
                }
                ISELECT_TRIGGER_BASE..=0x49F if reg == 0 => {
                    let index = (iselect - ISELECT_TRIGGER_BASE) as usize;
                    state.triggers[index] = value & (0x1FFF | 1 << 30 | 1 << 31);
                }
                _ => {
                    warn!(
                        iselect = iselect,
                        reg = reg,
                        value = value;
                        "write to unimplemented indirect CSR dropped"
                    );
                    return;
                }
            }
        }
        self.update();
    }
}

fn clamp_field(value: u8, max: u8, name: &'static str) -> u8 {
    if value > max {
        warn!(field = name, written = value, clamped = max; "field clamped to implemented width");
    }
    value.min(max)
}
