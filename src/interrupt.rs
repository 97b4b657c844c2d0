//! Interrupt output lines and trigger types shared by the interrupt controllers.

use std::ops::Deref;

/// An outgoing interrupt line of a controller, connected at construction time.
pub trait IrqLine {
    fn raise(&self);

    fn lower(&self);

    /// Drive the line to the given logic level.
    fn set(&self, high: bool) {
        match high {
            true => self.raise(),
            false => self.lower(),
        }
    }
}

pub struct DynIrqLine(pub Box<dyn IrqLine + Send>);

impl Deref for DynIrqLine {
    type Target = dyn IrqLine;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl std::fmt::Debug for DynIrqLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynIrqLine").finish_non_exhaustive()
    }
}

/// How an interrupt source reacts to its incoming signal.
///
/// Level-triggered sources track the signal, edge-triggered sources latch on the configured
/// transition and stay pending until explicitly cleared.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Trigger {
    #[default]
    HighLevel,
    LowLevel,
    RisingEdge,
    FallingEdge,
}

impl Trigger {
    pub fn is_edge(self) -> bool {
        matches!(self, Self::RisingEdge | Self::FallingEdge)
    }

    /// Returns `true` if the source reacts to the low/falling polarity of its signal.
    pub fn is_inverted(self) -> bool {
        matches!(self, Self::LowLevel | Self::FallingEdge)
    }

    /// Construct a trigger from its two configuration bits.
    pub fn from_bits(edge: bool, inverted: bool) -> Self {
        match (edge, inverted) {
            (false, false) => Self::HighLevel,
            (false, true) => Self::LowLevel,
            (true, false) => Self::RisingEdge,
            (true, true) => Self::FallingEdge,
        }
    }
}
