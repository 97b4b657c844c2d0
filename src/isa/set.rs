//! Ordered instruction-handler sets and custom CSR registries.

use std::collections::btree_map::Entry as MapEntry;
use std::collections::BTreeMap;

use log::{trace, warn};
use thiserror::Error;

use super::pattern::{BitPattern, PatternError};
use super::Fault;

pub type Handler<C> = Box<dyn FnMut(&mut C, u64) -> Result<(), Fault> + Send>;

struct Entry<C> {
    pattern: BitPattern,
    name: &'static str,
    handler: Handler<C>,
}

/// An ordered collection of custom instruction patterns with their handlers.
///
/// Lookup returns the first installed pattern matching an opcode, in installation order, so more
/// specific patterns must be installed before overlapping general ones.
pub struct InstructionSet<C> {
    entries: Vec<Entry<C>>,
}

impl<C> InstructionSet<C> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Install `handler` for all opcodes matching `source` (see [`BitPattern::parse`]).
    pub fn install(
        &mut self,
        source: &str,
        name: &'static str,
        handler: Handler<C>,
    ) -> Result<(), PatternError> {
        let pattern = BitPattern::parse(source)?;
        self.entries.push(Entry {
            pattern,
            name,
            handler,
        });
        Ok(())
    }

    /// Name of the first installed pattern matching `opcode`, if any.
    pub fn decode(&self, opcode: u64) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|entry| entry.pattern.matches(opcode))
            .map(|entry| entry.name)
    }

    /// Run the handler of the first installed pattern matching `opcode`.
    ///
    /// Returns `None` when no pattern matches, leaving the opcode for the base ISA.
    pub fn execute(&mut self, context: &mut C, opcode: u64) -> Option<Result<(), Fault>> {
        for entry in &mut self.entries {
            if entry.pattern.matches(opcode) {
                trace!(instruction = entry.name, opcode = opcode; "executing custom instruction");
                return Some((entry.handler)(context, opcode));
            }
        }
        None
    }
}

impl<C> Default for InstructionSet<C> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CsrReadFn<C> = Box<dyn FnMut(&mut C) -> u64 + Send>;
pub type CsrWriteFn<C> = Box<dyn FnMut(&mut C, u64) + Send>;

struct Csr<C> {
    name: &'static str,
    read: CsrReadFn<C>,
    write: CsrWriteFn<C>,
}

/// Registry of custom CSRs, keyed by CSR number.
///
/// Reads of unregistered numbers yield 0 and writes are dropped, both with a warning; defining the
/// same number twice is an error, since it would silently shadow an extension's register.
pub struct CsrFile<C> {
    csrs: BTreeMap<u16, Csr<C>>,
}

impl<C> CsrFile<C> {
    pub fn new() -> Self {
        Self {
            csrs: BTreeMap::new(),
        }
    }

    pub fn register(
        &mut self,
        number: u16,
        name: &'static str,
        read: CsrReadFn<C>,
        write: CsrWriteFn<C>,
    ) -> Result<(), CsrDefinitionError> {
        match self.csrs.entry(number) {
            MapEntry::Occupied(occupied) => Err(CsrDefinitionError {
                number,
                existing: occupied.get().name,
            }),
            MapEntry::Vacant(vacant) => {
                vacant.insert(Csr { name, read, write });
                Ok(())
            }
        }
    }

    pub fn is_defined(&self, number: u16) -> bool {
        self.csrs.contains_key(&number)
    }

    pub fn read(&mut self, context: &mut C, number: u16) -> u64 {
        match self.csrs.get_mut(&number) {
            Some(csr) => {
                let value = (csr.read)(context);
                trace!(csr = csr.name, value = value; "CSR read");
                value
            }
            None => {
                warn!(csr = number; "read of unregistered CSR yields 0");
                0
            }
        }
    }

    pub fn write(&mut self, context: &mut C, number: u16, value: u64) {
        match self.csrs.get_mut(&number) {
            Some(csr) => {
                trace!(csr = csr.name, value = value; "CSR write");
                (csr.write)(context, value);
            }
            None => {
                warn!(csr = number, value = value; "write to unregistered CSR dropped");
            }
        }
    }
}

impl<C> Default for CsrFile<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("CSR {number:#05x} is already defined as {existing}")]
pub struct CsrDefinitionError {
    pub number: u16,
    pub existing: &'static str,
}
