//! Bit-field register primitive for memory-mapped peripherals.
//!
//! A [`Register`] is a fixed-width storage cell partitioned into non-overlapping fields, each with
//! its own read/write semantics and callbacks. Callbacks receive an external context `&mut C` (the
//! owning peripheral's state), so all side effects are explicit in the register's type.

use log::{error, warn};
use std::collections::BTreeMap;
use thiserror::Error;

/// Supported register widths, in bits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegisterWidth {
    Byte = 8,
    Halfword = 16,
    Word = 32,
    Doubleword = 64,
}

impl RegisterWidth {
    pub fn bits(self) -> u32 {
        self as u32
    }

    fn mask(self) -> u64 {
        match self {
            RegisterWidth::Doubleword => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }
}

/// What a read does to a field's stored value.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum ReadMode {
    /// Reads return 0 for this field; storage is untouched.
    Ignored,
    #[default]
    Read,
    /// The stored value is returned, then cleared.
    ReadToClear,
    /// The stored value is returned, then set to all ones.
    ReadToSet,
}

/// How a written value combines with a field's stored value. The variants are mutually exclusive.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum WriteMode {
    /// Writes to this field are dropped.
    Ignored,
    #[default]
    Write,
    /// Written ones set the corresponding bits.
    Set,
    /// Written ones toggle the corresponding bits.
    Toggle,
    WriteOneToClear,
    WriteZeroToClear,
    WriteZeroToSet,
    WriteZeroToToggle,
    /// Any write clears the whole field, regardless of the written value.
    WriteToClear,
    /// Any write sets the whole field, regardless of the written value.
    WriteToSet,
}

impl WriteMode {
    fn apply(self, stored: u64, written: u64, field_mask: u64) -> u64 {
        let result = match self {
            WriteMode::Ignored => stored,
            WriteMode::Write => written,
            WriteMode::Set => stored | written,
            WriteMode::Toggle => stored ^ written,
            WriteMode::WriteOneToClear => stored & !written,
            WriteMode::WriteZeroToClear => stored & written,
            WriteMode::WriteZeroToSet => stored | (!written & field_mask),
            WriteMode::WriteZeroToToggle => stored ^ (!written & field_mask),
            WriteMode::WriteToClear => 0,
            WriteMode::WriteToSet => field_mask,
        };
        result & field_mask
    }
}

/// Combined access mode of a field.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct FieldMode {
    pub read: ReadMode,
    pub write: WriteMode,
}

impl FieldMode {
    pub const READ_ONLY: Self = Self {
        read: ReadMode::Read,
        write: WriteMode::Ignored,
    };

    pub const WRITE_ONLY: Self = Self {
        read: ReadMode::Ignored,
        write: WriteMode::Write,
    };

    pub const READ_WRITE: Self = Self {
        read: ReadMode::Read,
        write: WriteMode::Write,
    };

    pub fn read(read: ReadMode) -> Self {
        Self {
            read,
            write: WriteMode::Ignored,
        }
    }

    pub fn write(write: WriteMode) -> Self {
        Self {
            read: ReadMode::Ignored,
            write,
        }
    }

    pub fn read_write(read: ReadMode, write: WriteMode) -> Self {
        Self { read, write }
    }
}

/// Callback taking the context plus the field's (or register's) old and new value.
pub type ChangeCallback<C> = Box<dyn FnMut(&mut C, u64, u64) + Send>;
/// Callback producing the current value of a field right before a read composes the register.
pub type ValueProvider<C> = Box<dyn FnMut(&mut C, u64) -> u64 + Send>;

struct Field<C> {
    name: Option<&'static str>,
    offset: u32,
    width: u32,
    mode: FieldMode,
    reset_value: u64,
    soft_resettable: bool,
    value_provider: Option<ValueProvider<C>>,
    read_callback: Option<ChangeCallback<C>>,
    write_callback: Option<ChangeCallback<C>>,
    change_callback: Option<ChangeCallback<C>>,
}

impl<C> Field<C> {
    fn mask(&self) -> u64 {
        match self.width {
            64 => u64::MAX,
            w => ((1u64 << w) - 1) << self.offset,
        }
    }

    fn extract(&self, register_value: u64) -> u64 {
        (register_value & self.mask()) >> self.offset
    }

    fn field_mask(&self) -> u64 {
        self.mask() >> self.offset
    }
}

impl<C> std::fmt::Debug for Field<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("offset", &self.offset)
            .field("width", &self.width)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Describes a field to be added to a [`Register`]. Callbacks are attached with the builder
/// methods before the descriptor is passed to [`Register::add_field`].
pub struct FieldDesc<C> {
    field: Field<C>,
}

impl<C> FieldDesc<C> {
    pub fn new(offset: u32, width: u32, mode: FieldMode) -> Self {
        Self {
            field: Field {
                name: None,
                offset,
                width,
                mode,
                reset_value: 0,
                soft_resettable: true,
                value_provider: None,
                read_callback: None,
                write_callback: None,
                change_callback: None,
            },
        }
    }

    /// Single-bit field shorthand.
    pub fn flag(offset: u32, mode: FieldMode) -> Self {
        Self::new(offset, 1, mode)
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.field.name = Some(name);
        self
    }

    pub fn with_reset_value(mut self, value: u64) -> Self {
        self.field.reset_value = value;
        self
    }

    /// Fields that are not soft-resettable keep their value across [`Register::reset`].
    pub fn without_soft_reset(mut self) -> Self {
        self.field.soft_resettable = false;
        self
    }

    pub fn with_value_provider(mut self, provider: ValueProvider<C>) -> Self {
        self.field.value_provider = Some(provider);
        self
    }

    pub fn with_read_callback(mut self, callback: ChangeCallback<C>) -> Self {
        self.field.read_callback = Some(callback);
        self
    }

    pub fn with_write_callback(mut self, callback: ChangeCallback<C>) -> Self {
        self.field.write_callback = Some(callback);
        self
    }

    pub fn with_change_callback(mut self, callback: ChangeCallback<C>) -> Self {
        self.field.change_callback = Some(callback);
        self
    }
}

/// Reserved bits with a single allowed value. Writing anything else is logged as an error, but the
/// write to the remaining fields still goes through.
#[derive(Debug)]
struct ReservedTag {
    offset: u32,
    width: u32,
    allowed_value: u64,
}

impl ReservedTag {
    fn mask(&self) -> u64 {
        match self.width {
            64 => u64::MAX,
            w => ((1u64 << w) - 1) << self.offset,
        }
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum FieldError {
    #[error("field at bits [{offset}, {last}] exceeds the {width}-bit register width")]
    OutOfBounds { offset: u32, last: u32, width: u32 },
    #[error("field at bit {offset} has zero width")]
    ZeroWidth { offset: u32 },
    #[error("field at bits [{offset}, {last}] overlaps an already defined field or tag")]
    Overlap { offset: u32, last: u32 },
}

/// A fixed-width register built from non-overlapping fields.
pub struct Register<C> {
    name: &'static str,
    width: RegisterWidth,
    value: u64,
    fields: Vec<Field<C>>,
    reserved: Vec<ReservedTag>,
    read_callback: Option<ChangeCallback<C>>,
    write_callback: Option<ChangeCallback<C>>,
    change_callback: Option<ChangeCallback<C>>,
}

impl<C> std::fmt::Debug for Register<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Register")
            .field("name", &self.name)
            .field("width", &self.width)
            .field("value", &self.value)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

impl<C> Register<C> {
    pub fn new(name: &'static str, width: RegisterWidth) -> Self {
        Self {
            name,
            width,
            value: 0,
            fields: Vec::new(),
            reserved: Vec::new(),
            read_callback: None,
            write_callback: None,
            change_callback: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn width(&self) -> RegisterWidth {
        self.width
    }

    fn check_bounds(&self, offset: u32, width: u32) -> Result<u64, FieldError> {
        if width == 0 {
            return Err(FieldError::ZeroWidth { offset });
        }
        let last = offset + width - 1;
        if last >= self.width.bits() {
            return Err(FieldError::OutOfBounds {
                offset,
                last,
                width: self.width.bits(),
            });
        }
        let mask = match width {
            64 => u64::MAX,
            w => ((1u64 << w) - 1) << offset,
        };
        if mask & self.defined_mask() != 0 {
            return Err(FieldError::Overlap { offset, last });
        }
        Ok(mask)
    }

    /// Add a field. Fails if it overlaps a previously defined field or reserved tag, or does not
    /// fit the register width.
    pub fn add_field(&mut self, desc: FieldDesc<C>) -> Result<(), FieldError> {
        let field = desc.field;
        self.check_bounds(field.offset, field.width)?;
        self.value |= (field.reset_value << field.offset) & field.mask();
        self.fields.push(field);
        Ok(())
    }

    /// Mark bits as reserved with a single allowed write value.
    pub fn add_reserved(
        &mut self,
        offset: u32,
        width: u32,
        allowed_value: u64,
    ) -> Result<(), FieldError> {
        self.check_bounds(offset, width)?;
        self.reserved.push(ReservedTag {
            offset,
            width,
            allowed_value,
        });
        Ok(())
    }

    pub fn with_read_callback(mut self, callback: ChangeCallback<C>) -> Self {
        self.read_callback = Some(callback);
        self
    }

    pub fn with_write_callback(mut self, callback: ChangeCallback<C>) -> Self {
        self.write_callback = Some(callback);
        self
    }

    pub fn with_change_callback(mut self, callback: ChangeCallback<C>) -> Self {
        self.change_callback = Some(callback);
        self
    }

    fn defined_mask(&self) -> u64 {
        self.fields.iter().map(|f| f.mask()).fold(0, |a, m| a | m)
            | self.reserved.iter().map(|t| t.mask()).fold(0, |a, m| a | m)
    }

    /// The raw stored value. Does not trigger side effects or callbacks.
    pub fn peek(&self) -> u64 {
        self.value
    }

    /// Overwrite the raw stored value without firing callbacks.
    pub fn set(&mut self, value: u64) {
        self.value = value & self.width.mask();
    }

    /// Restore all soft-resettable fields to their reset values.
    pub fn reset(&mut self) {
        let mut value = 0;
        for field in &self.fields {
            let kept = match field.soft_resettable {
                true => (field.reset_value << field.offset) & field.mask(),
                false => self.value & field.mask(),
            };
            value |= kept;
        }
        self.value = value;
    }

    /// Read the register, running value providers and read side effects, and firing callbacks.
    pub fn read(&mut self, context: &mut C) -> u64 {
        let old_value = self.value;

        for field in &mut self.fields {
            let mask = field.mask();
            let offset = field.offset;
            let field_mask = field.field_mask();
            if let Some(provider) = &mut field.value_provider {
                let old = (self.value & mask) >> offset;
                let provided = provider(context, old) & field_mask;
                self.value = (self.value & !mask) | (provided << offset);
            }
        }

        let mut result = 0;
        for field in &mut self.fields {
            let stored = (self.value & field.mask()) >> field.offset;
            match field.mode.read {
                ReadMode::Ignored => {}
                ReadMode::Read => result |= stored << field.offset,
                ReadMode::ReadToClear => {
                    result |= stored << field.offset;
                    self.value &= !field.mask();
                }
                ReadMode::ReadToSet => {
                    result |= stored << field.offset;
                    self.value |= field.mask();
                }
            }
        }
        for tag in &self.reserved {
            result |= (tag.allowed_value << tag.offset) & tag.mask();
        }

        let new_value = self.value;
        for field in &mut self.fields {
            let old = field.extract(old_value);
            let new = field.extract(new_value);
            if let Some(callback) = &mut field.read_callback {
                callback(context, old, new);
            }
            if old != new {
                if let Some(callback) = &mut field.change_callback {
                    callback(context, old, new);
                }
            }
        }
        if let Some(callback) = &mut self.read_callback {
            callback(context, old_value, new_value);
        }
        if old_value != new_value {
            if let Some(callback) = &mut self.change_callback {
                callback(context, old_value, new_value);
            }
        }

        result
    }

    /// Write the register, applying each field's write semantics and firing callbacks.
    ///
    /// Bits not covered by any field or reserved tag are dropped with a warning.
    pub fn write(&mut self, context: &mut C, value: u64) {
        let value = value & self.width.mask();
        let old_value = self.value;

        let unhandled = value & !self.defined_mask();
        if unhandled != 0 {
            warn!(
                register = self.name,
                value = value,
                unhandled = unhandled;
                "unhandled bits written to register"
            );
        }
        for tag in &self.reserved {
            let written = (value & tag.mask()) >> tag.offset;
            if written != tag.allowed_value {
                error!(
                    register = self.name,
                    offset = tag.offset,
                    written = written,
                    allowed = tag.allowed_value;
                    "invalid value written to reserved bits"
                );
            }
        }

        for field in &self.fields {
            let stored = field.extract(self.value);
            let written = field.extract(value);
            let new = field.mode.write.apply(stored, written, field.field_mask());
            self.value = (self.value & !field.mask()) | (new << field.offset);
        }

        let new_value = self.value;
        for field in &mut self.fields {
            let old = field.extract(old_value);
            let new = field.extract(new_value);
            let written = field.extract(value);
            if let Some(callback) = &mut field.write_callback {
                callback(context, old, written);
            }
            if old != new {
                if let Some(callback) = &mut field.change_callback {
                    callback(context, old, new);
                }
            }
        }
        if let Some(callback) = &mut self.write_callback {
            callback(context, old_value, value);
        }
        if old_value != new_value {
            if let Some(callback) = &mut self.change_callback {
                callback(context, old_value, new_value);
            }
        }
    }
}

/// An offset-keyed group of registers, the backing store of a peripheral's register block.
#[derive(Debug)]
pub struct RegisterCollection<C> {
    registers: BTreeMap<u64, Register<C>>,
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("a register is already defined at offset {0:#x}")]
pub struct DuplicateOffsetError(pub u64);

impl<C> RegisterCollection<C> {
    pub fn new() -> Self {
        Self {
            registers: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, offset: u64, register: Register<C>) -> Result<(), DuplicateOffsetError> {
        match self.registers.contains_key(&offset) {
            true => Err(DuplicateOffsetError(offset)),
            false => {
                self.registers.insert(offset, register);
                Ok(())
            }
        }
    }

    pub fn get(&self, offset: u64) -> Option<&Register<C>> {
        self.registers.get(&offset)
    }

    pub fn get_mut(&mut self, offset: u64) -> Option<&mut Register<C>> {
        self.registers.get_mut(&offset)
    }

    /// Read the register at `offset`, or `None` if nothing is mapped there.
    pub fn try_read(&mut self, context: &mut C, offset: u64) -> Option<u64> {
        self.registers
            .get_mut(&offset)
            .map(|register| register.read(context))
    }

    /// Write the register at `offset`. Returns `false` if nothing is mapped there.
    pub fn try_write(&mut self, context: &mut C, offset: u64, value: u64) -> bool {
        match self.registers.get_mut(&offset) {
            Some(register) => {
                register.write(context, value);
                true
            }
            None => false,
        }
    }

    pub fn reset(&mut self) {
        for register in self.registers.values_mut() {
            register.reset();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Register<C>)> {
        self.registers.iter()
    }
}

impl<C> Default for RegisterCollection<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_bounds() {
        let mut register = Register::<()>::new("test", RegisterWidth::Word);
        assert_eq!(
            Err(FieldError::ZeroWidth { offset: 4 }),
            register.add_field(FieldDesc::new(4, 0, FieldMode::READ_WRITE))
        );
        assert_eq!(
            Err(FieldError::OutOfBounds {
                offset: 30,
                last: 33,
                width: 32
            }),
            register.add_field(FieldDesc::new(30, 4, FieldMode::READ_WRITE))
        );
        register
            .add_field(FieldDesc::new(0, 8, FieldMode::READ_WRITE))
            .unwrap();
        assert_eq!(
            Err(FieldError::Overlap { offset: 4, last: 7 }),
            register.add_field(FieldDesc::new(4, 4, FieldMode::READ_WRITE))
        );
    }

    #[test]
    fn test_exclusive_write_modes() {
        let cases = [
            (WriteMode::Write, 0b1010),
            (WriteMode::Set, 0b1110),
            (WriteMode::Toggle, 0b0110),
            (WriteMode::WriteOneToClear, 0b0100),
            (WriteMode::WriteZeroToClear, 0b1000),
            (WriteMode::WriteZeroToSet, 0b1101),
            (WriteMode::WriteZeroToToggle, 0b1001),
            (WriteMode::WriteToClear, 0b0000),
            (WriteMode::WriteToSet, 0b1111),
        ];
        for (mode, expected) in cases {
            // stored 0b1100, written 0b1010
            assert_eq!(expected, mode.apply(0b1100, 0b1010, 0b1111), "{mode:?}");
        }
    }

    #[test]
    fn test_read_to_clear() {
        let mut register = Register::<()>::new("status", RegisterWidth::Byte);
        register
            .add_field(
                FieldDesc::new(0, 8, FieldMode::read(ReadMode::ReadToClear)).with_reset_value(0xA5),
            )
            .unwrap();
        assert_eq!(0xA5, register.read(&mut ()));
        assert_eq!(0, register.read(&mut ()));
    }

    #[test]
    fn test_value_provider_and_callback_order() {
        let mut order: Vec<&'static str> = Vec::new();
        let mut register = Register::<Vec<&'static str>>::new("ctrl", RegisterWidth::Word);
        register
            .add_field(
                FieldDesc::new(0, 16, FieldMode::READ_WRITE)
                    .with_value_provider(Box::new(|log: &mut Vec<&'static str>, _| {
                        log.push("provider");
                        0x1234
                    }))
                    .with_read_callback(Box::new(|log, _, _| log.push("field read")))
                    .with_change_callback(Box::new(|log, _, _| log.push("field change"))),
            )
            .unwrap();
        let mut register = register
            .with_read_callback(Box::new(|log, _, _| log.push("register read")))
            .with_change_callback(Box::new(|log, _, _| log.push("register change")));

        assert_eq!(0x1234, register.read(&mut order));
        assert_eq!(
            vec![
                "provider",
                "field read",
                "field change",
                "register read",
                "register change"
            ],
            order
        );
    }

    #[test]
    fn test_unreadable_field_masked() {
        let mut register = Register::<()>::new("mixed", RegisterWidth::Word);
        register
            .add_field(FieldDesc::new(0, 8, FieldMode::WRITE_ONLY).with_reset_value(0xFF))
            .unwrap();
        register
            .add_field(FieldDesc::new(8, 8, FieldMode::READ_WRITE).with_reset_value(0x42))
            .unwrap();
        // Write-only field reads as zero but keeps its storage.
        assert_eq!(0x4200, register.read(&mut ()));
        assert_eq!(0x42FF, register.peek());
    }

    #[test]
    fn test_unhandled_write_bits_dropped() {
        let mut register = Register::<()>::new("sparse", RegisterWidth::Word);
        register
            .add_field(FieldDesc::new(0, 4, FieldMode::READ_WRITE))
            .unwrap();
        register.write(&mut (), 0xFFFF_FFFF);
        assert_eq!(0xF, register.peek());
    }

    #[test]
    fn test_write_ignored_field() {
        let mut register = Register::<()>::new("ro", RegisterWidth::Word);
        register
            .add_field(FieldDesc::new(0, 32, FieldMode::READ_ONLY).with_reset_value(0xCAFE))
            .unwrap();
        register.write(&mut (), 0xDEAD_BEEF);
        assert_eq!(0xCAFE, register.read(&mut ()));
    }

    #[test]
    fn test_reset_keeps_non_soft_fields() {
        let mut register = Register::<()>::new("persist", RegisterWidth::Word);
        register
            .add_field(FieldDesc::new(0, 8, FieldMode::READ_WRITE).with_reset_value(0x11))
            .unwrap();
        register
            .add_field(
                FieldDesc::new(8, 8, FieldMode::READ_WRITE)
                    .with_reset_value(0x22)
                    .without_soft_reset(),
            )
            .unwrap();
        register.write(&mut (), 0xFFFF);
        register.reset();
        assert_eq!(0xFF11, register.peek());
    }

    #[test]
    fn test_collection() {
        let mut collection = RegisterCollection::<()>::new();
        let mut register = Register::new("a", RegisterWidth::Word);
        register
            .add_field(FieldDesc::new(0, 32, FieldMode::READ_WRITE).with_reset_value(7))
            .unwrap();
        collection.add(0x0, register).unwrap();
        assert!(collection
            .add(0x0, Register::new("b", RegisterWidth::Word))
            .is_err());
        assert_eq!(Some(7), collection.try_read(&mut (), 0x0));
        assert_eq!(None, collection.try_read(&mut (), 0x4));
        assert!(collection.try_write(&mut (), 0x0, 9));
        assert_eq!(Some(9), collection.try_read(&mut (), 0x0));
    }
}
