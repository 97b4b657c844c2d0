//! Platform-level interrupt controller with per-context claim/complete.

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;
use log::{trace, warn};
use std::sync::Mutex;
use thiserror::Error;

use crate::interrupt::DynIrqLine;

pub const PRIORITY_BASE_ADDR: u64 = 0x0;
pub const PENDING_BASE_ADDR: u64 = 0x1000;
pub const ENABLES_BASE_ADDR: u64 = 0x2000;
pub const ENABLES_CONTEXT_STRIDE: u64 = 0x80;
pub const CONTEXT_BASE_ADDR: u64 = 0x20_0000;
pub const CONTEXT_STRIDE: u64 = 0x1000;
pub const THRESHOLD_OFFSET: u64 = 0x0;
pub const CLAIMCOMPLETE_OFFSET: u64 = 0x4;

/// Source priorities and thresholds are 3-bit values.
pub const MAX_PRIORITY: u32 = 7;

/// Static configuration of a [`Plic`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PlicConfig {
    /// Number of interrupt sources, including the reserved source 0.
    pub sources: usize,
    /// Number of claiming contexts (hart/privilege pairs).
    pub contexts: usize,
}

impl Default for PlicConfig {
    fn default() -> Self {
        Self {
            sources: 54,
            contexts: 1,
        }
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum PlicConfigError {
    #[error("number of sources must be in 2..=1024, got {0}")]
    InvalidSourceCount(usize),
    #[error("at least one context is required")]
    NoContexts,
    #[error("{contexts} contexts configured but {lines} interrupt lines connected")]
    LineCountMismatch { contexts: usize, lines: usize },
}

#[derive(Debug)]
pub struct Plic {
    state: Mutex<State>,
    context_irqs: Vec<DynIrqLine>,
}

#[derive(Debug)]
struct State {
    config: PlicConfig,
    priorities: Vec<u32>,
    /// Current level of each input signal. Pending is latched separately so a source stays
    /// claimable after its line drops.
    levels: BitVec<u32, Lsb0>,
    pending: BitVec<u32, Lsb0>,
    contexts: Vec<Context>,
}

#[derive(Debug, Clone)]
struct Context {
    enabled: BitVec<u32, Lsb0>,
    priority_threshold: u32,
    /// Claimed-but-not-completed sources, in claim order.
    active: Vec<u16>,
}

impl State {
    fn new(config: PlicConfig) -> Self {
        let sources = config.sources;
        let contexts = config.contexts;
        Self {
            config,
            priorities: vec![0; sources],
            levels: BitVec::repeat(false, sources),
            pending: BitVec::repeat(false, sources),
            contexts: vec![
                Context {
                    enabled: BitVec::repeat(false, sources),
                    priority_threshold: 0,
                    active: Vec::new(),
                };
                contexts
            ],
        }
    }

    fn set_priority(&mut self, index: usize, value: u32) {
        if value > MAX_PRIORITY {
            warn!(
                source = index,
                value = value;
                "priority above the supported maximum, clamping"
            );
        }
        self.priorities[index] = value.min(MAX_PRIORITY);
    }

    fn set_priority_threshold(&mut self, context: usize, value: u32) {
        if value > MAX_PRIORITY {
            warn!(
                context = context,
                value = value;
                "priority threshold above the supported maximum, clamping"
            );
        }
        self.contexts[context].priority_threshold = value.min(MAX_PRIORITY);
    }

    /// Best pending enabled source for a context: highest priority first, lowest id on ties.
    /// Returns 0 if none is pending.
    fn best_pending(&self, context: usize) -> u32 {
        let mut best = 0usize;
        let mut best_priority = 0u32;
        for id in 1..self.config.sources {
            if !(self.pending[id] && self.contexts[context].enabled[id]) {
                continue;
            }
            if best == 0 || self.priorities[id] > best_priority {
                best = id;
                best_priority = self.priorities[id];
            }
        }
        best as u32
    }

    fn claim(&mut self, context: usize) -> u32 {
        let id = self.best_pending(context);
        if id != 0 {
            self.pending.set(id as usize, false);
            self.contexts[context].active.push(id as u16);
        }
        id
    }

    fn complete(&mut self, context: usize, id: u32) {
        if id as usize >= self.config.sources {
            trace!(context = context, source = id; "completion of out-of-range source dropped");
            return;
        }
        let active = &mut self.contexts[context].active;
        match active.last() {
            Some(&top) if top as u32 == id => {
                active.pop();
                // Level-triggered re-arm: the source goes pending again if its line is still high.
                if self.levels[id as usize] {
                    self.pending.set(id as usize, true);
                }
            }
            _ => {
                warn!(
                    context = context,
                    source = id;
                    "completion does not match the most recently claimed source"
                );
            }
        }
    }

    /// The context line is high while some pending enabled source sits strictly above the
    /// threshold.
    fn needs_interrupt(&self, context: usize) -> bool {
        let id = self.best_pending(context);
        id != 0 && self.priorities[id as usize] > self.contexts[context].priority_threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrAccessor {
    Priority(usize),
    Pending(usize),
    Enabled(usize, usize),
    Threshold(usize),
    ClaimComplete(usize),
}

impl AddrAccessor {
    fn from_address(address: u64, config: &PlicConfig) -> Option<Self> {
        let pending_words = config.sources.div_ceil(32);
        match address {
            PRIORITY_BASE_ADDR..=0xFFF => {
                let id = (address / 4) as usize;
                (address % 4 == 0 && id < config.sources).then_some(Self::Priority(id))
            }
            PENDING_BASE_ADDR..=0x1FFF => {
                let word = ((address - PENDING_BASE_ADDR) / 4) as usize;
                (address % 4 == 0 && word < pending_words).then_some(Self::Pending(word))
            }
            ENABLES_BASE_ADDR..=0x1F_FFFF => {
                let context = ((address - ENABLES_BASE_ADDR) / ENABLES_CONTEXT_STRIDE) as usize;
                let word = ((address - ENABLES_BASE_ADDR) % ENABLES_CONTEXT_STRIDE / 4) as usize;
                (address % 4 == 0 && context < config.contexts && word < pending_words)
                    .then_some(Self::Enabled(context, word))
            }
            CONTEXT_BASE_ADDR.. => {
                let context = ((address - CONTEXT_BASE_ADDR) / CONTEXT_STRIDE) as usize;
                if context >= config.contexts {
                    return None;
                }
                match (address - CONTEXT_BASE_ADDR) % CONTEXT_STRIDE {
                    THRESHOLD_OFFSET => Some(Self::Threshold(context)),
                    CLAIMCOMPLETE_OFFSET => Some(Self::ClaimComplete(context)),
                    _ => None,
                }
            }
        }
    }
}

impl Plic {
    /// Create a new Plic in reset state, with one outgoing line per context.
    pub fn new(config: PlicConfig, context_irqs: Vec<DynIrqLine>) -> Result<Self, PlicConfigError> {
        if !(2..=1024).contains(&config.sources) {
            return Err(PlicConfigError::InvalidSourceCount(config.sources));
        }
        if config.contexts == 0 {
            return Err(PlicConfigError::NoContexts);
        }
        if context_irqs.len() != config.contexts {
            return Err(PlicConfigError::LineCountMismatch {
                contexts: config.contexts,
                lines: context_irqs.len(),
            });
        }
        Ok(Self {
            state: Mutex::new(State::new(config)),
            context_irqs,
        })
    }

    pub fn reset(&self) {
        {
            let mut state = self.state.lock().unwrap();
            let config = state.config.clone();
            *state = State::new(config);
        }
        for line in &self.context_irqs {
            line.lower();
        }
    }

    /// Drive the input signal of a source. Source 0 is reserved and ignored.
    pub fn on_signal(&self, source: usize, high: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if source == 0 || source >= state.config.sources {
                trace!(source = source; "signal on out-of-range source dropped");
                return;
            }
            state.levels.set(source, high);
            if high {
                state.pending.set(source, true);
            }
        }
        self.refresh_lines();
    }

    fn refresh_lines(&self) {
        let state = self.state.lock().unwrap();
        for (context, line) in self.context_irqs.iter().enumerate() {
            line.set(state.needs_interrupt(context));
        }
    }

    /// The id a claim at `context` would return, without consuming it. Debugger interface.
    pub fn peek_claim(&self, context: usize) -> u32 {
        self.state.lock().unwrap().best_pending(context)
    }

    fn read_u32(&self, address: u64) -> u32 {
        let accessor = {
            let state = self.state.lock().unwrap();
            AddrAccessor::from_address(address, &state.config)
        };
        let Some(accessor) = accessor else {
            trace!(address = address; "read from unmapped offset");
            return 0;
        };
        let claimed = {
            let mut state = self.state.lock().unwrap();
            match accessor {
                AddrAccessor::Priority(i) => return state.priorities[i],
                AddrAccessor::Pending(i) => return state.pending.as_raw_slice()[i],
                AddrAccessor::Enabled(context, i) => {
                    return state.contexts[context].enabled.as_raw_slice()[i]
                }
                AddrAccessor::Threshold(context) => {
                    return state.contexts[context].priority_threshold
                }
                AddrAccessor::ClaimComplete(context) => state.claim(context),
            }
        };
        self.refresh_lines();
        claimed
    }

    /// Side-effect-free read for debugger use: a claim offset reports without consuming.
    fn read_u32_debug(&self, address: u64) -> u32 {
        let state = self.state.lock().unwrap();
        let Some(accessor) = AddrAccessor::from_address(address, &state.config) else {
            return 0;
        };
        match accessor {
            AddrAccessor::Priority(i) => state.priorities[i],
            AddrAccessor::Pending(i) => state.pending.as_raw_slice()[i],
            AddrAccessor::Enabled(context, i) => state.contexts[context].enabled.as_raw_slice()[i],
            AddrAccessor::Threshold(context) => state.contexts[context].priority_threshold,
            AddrAccessor::ClaimComplete(context) => state.best_pending(context),
        }
    }

    fn write_u32(&self, address: u64, value: u32) {
        {
            let mut state = self.state.lock().unwrap();
            let Some(accessor) = AddrAccessor::from_address(address, &state.config) else {
                trace!(address = address, value = value; "write to unmapped offset dropped");
                return;
            };
            match accessor {
                AddrAccessor::Priority(0) => {
                    warn!("write to the priority of reserved source 0 dropped");
                }
                AddrAccessor::Priority(i) => state.set_priority(i, value),
                AddrAccessor::Pending(_) => {
                    trace!(address = address; "pending bits are read-only, write dropped");
                }
                AddrAccessor::Enabled(context, i) => {
                    let value = if i == 0 { value & !1 } else { value };
                    state.contexts[context].enabled.as_raw_mut_slice()[i] = value;
                }
                AddrAccessor::Threshold(context) => state.set_priority_threshold(context, value),
                AddrAccessor::ClaimComplete(context) => state.complete(context, value),
            }
        }
        self.refresh_lines();
    }

    pub fn read(&self, buf: &mut [u8], address: u64) {
        if address != address & !0b11 {
            return;
        }
        if buf.len() == 4 {
            let v = self.read_u32(address);
            buf.copy_from_slice(&v.to_le_bytes())
        }
    }

    pub fn read_debug(&self, buf: &mut [u8], address: u64) {
        if address != address & !0b11 {
            return;
        }
        if buf.len() == 4 {
            let v = self.read_u32_debug(address);
            buf.copy_from_slice(&v.to_le_bytes())
        }
    }

    pub fn write(&self, address: u64, buf: &[u8]) {
        if address != address & !0b11 {
            return;
        }
        if let [a, b, c, d] = buf {
            self.write_u32(address, u32::from_le_bytes([*a, *b, *c, *d]));
        }
    }
}
