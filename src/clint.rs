//! Core Local Interruptor: per-hart software and timer interrupts.

use std::sync::Mutex;

use crate::interrupt::DynIrqLine;

pub const MSIP_ADDR: u64 = 0x0;
pub const MTIMECMP_ADDR_LO: u64 = 0x4000;
pub const MTIMECMP_ADDR_HI: u64 = MTIMECMP_ADDR_LO + 4;
pub const MTIME_ADDR_LO: u64 = 0xBFF8;
pub const MTIME_ADDR_HI: u64 = MTIME_ADDR_LO + 4;

#[derive(Debug)]
pub struct Clint {
    state: Mutex<State>,
    timer_irq: DynIrqLine,
    software_irq: DynIrqLine,
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct State {
    msip: bool,
    mtime: u64,
    mtimecmp: u64,
}

impl State {
    fn new() -> Self {
        Self {
            msip: false,
            mtime: 0,
            mtimecmp: 0,
        }
    }

    fn set_mtime_higher(&mut self, value: u32) {
        self.mtime = ((value as u64) << 32) | (self.mtime & 0xffffffff);
    }

    fn set_mtime_lower(&mut self, value: u32) {
        self.mtime = (self.mtime & 0xffffffff_00000000) | value as u64;
    }

    fn set_mtimecmp_higher(&mut self, value: u32) {
        self.mtimecmp = ((value as u64) << 32) | (self.mtimecmp & 0xffffffff);
    }

    fn set_mtimecmp_lower(&mut self, value: u32) {
        self.mtimecmp = (self.mtimecmp & 0xffffffff_00000000) | value as u64;
    }

    fn needs_timer_interrupt(&self) -> bool {
        self.mtimecmp <= self.mtime
    }
}

impl Clint {
    /// Create new Clint in reset state.
    pub fn new(timer_irq: DynIrqLine, software_irq: DynIrqLine) -> Self {
        Self {
            state: Mutex::new(State::new()),
            timer_irq,
            software_irq,
        }
    }

    /// Restart the CLINT, setting everything to its reset state.
    ///
    /// mtime and msip will be set to 0, mtimecmp will not be changed.
    pub fn reset(&self) {
        self.update(|state| {
            state.mtime = 0;
            state.msip = false;
        });
    }

    /// Advance mtime by one tick.
    pub fn step(&self) {
        self.update(|state| state.mtime = state.mtime.wrapping_add(1));
    }

    pub fn mtime(&self) -> u64 {
        self.state.lock().unwrap().mtime
    }

    /// Read a u32 from the mmio registers.
    ///
    /// Only 4 byte aligned addresses will work
    fn read_u32(&self, address: u64) -> u32 {
        let state = self.state.lock().unwrap();
        match address {
            MSIP_ADDR => state.msip as u32,
            MTIMECMP_ADDR_LO => state.mtimecmp as u32,
            MTIMECMP_ADDR_HI => (state.mtimecmp >> 32) as u32,
            MTIME_ADDR_LO => state.mtime as u32,
            MTIME_ADDR_HI => (state.mtime >> 32) as u32,
            _ => 0,
        }
    }

    /// Write a u32 to the mmio registers.
    ///
    /// Only 4 byte aligned addresses will work
    fn write_u32(&self, address: u64, value: u32) {
        match address {
            MSIP_ADDR => {
                let msip = value & 1 != 0;
                self.state.lock().unwrap().msip = msip;
                self.software_irq.set(msip);
            }
            MTIMECMP_ADDR_LO => self.update(|state| state.set_mtimecmp_lower(value)),
            MTIMECMP_ADDR_HI => self.update(|state| state.set_mtimecmp_higher(value)),
            MTIME_ADDR_LO => self.update(|state| state.set_mtime_lower(value)),
            MTIME_ADDR_HI => self.update(|state| state.set_mtime_higher(value)),
            _ => {}
        }
    }

    /// Write a u64 to the mmio registers.
    ///
    /// Only 8 byte aligned addresses will work
    fn write_u64(&self, address: u64, value: u64) {
        match address {
            MTIMECMP_ADDR_LO => self.update(|state| state.mtimecmp = value),
            MTIME_ADDR_LO => self.update(|state| state.mtime = value),
            _ => {}
        }
    }

    pub fn read(&self, buf: &mut [u8], address: u64) {
        if address != address & !0b11 {
            return;
        }
        match buf.len() {
            4 => {
                let v = self.read_u32(address);
                buf.copy_from_slice(&v.to_le_bytes())
            }
            8 => {
                let lo = self.read_u32(address) as u64;
                let hi = self.read_u32(address + 4) as u64;
                buf.copy_from_slice(&(hi << 32 | lo).to_le_bytes())
            }
            _ => {}
        }
    }

    pub fn write(&self, address: u64, buf: &[u8]) {
        if address != address & !0b11 {
            return;
        }
        match buf {
            [a, b, c, d] => {
                self.write_u32(address, u32::from_le_bytes([*a, *b, *c, *d]));
            }
            [a, b, c, d, e, f, g, h] => {
                self.write_u64(
                    address,
                    u64::from_le_bytes([*a, *b, *c, *d, *e, *f, *g, *h]),
                );
            }
            _ => {}
        }
    }

    fn update(&self, op: impl FnOnce(&mut State)) {
        let (irq_before, irq_after) = {
            let mut state = self.state.lock().unwrap();
            let irq_before = state.needs_timer_interrupt();
            op(&mut state);
            (irq_before, state.needs_timer_interrupt())
        };
        match (irq_before, irq_after) {
            (true, false) => self.timer_irq.lower(),
            (false, true) => self.timer_irq.raise(),
            _ => {}
        }
    }
}
