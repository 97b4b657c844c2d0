//! Bit patterns for matching instruction encodings.

use thiserror::Error;

/// A pattern over the opcode space, built from a string of `0`, `1`, and don't-care characters.
///
/// The first character of the source string corresponds to the most significant bit. `-` and ASCII
/// letters are don't-cares; letters are conventionally used to mark the operand fields they cover,
/// e.g. `"0000010RRRRRSSSSS100DDDDD0110011"`.
///
/// Patterns must be 16, 32, or 64 characters long, and the literal bits must be consistent with
/// the RISC-V instruction-length encoding for that length (a 32-bit pattern must end in `11`
/// without bits `[4:2]` being all ones, and so on).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BitPattern {
    length: u32,
    mask: u64,
    value: u64,
}

impl BitPattern {
    pub fn parse(source: &str) -> Result<Self, PatternError> {
        let length = source.len();
        if !matches!(length, 16 | 32 | 64) {
            return Err(PatternError::InvalidLength(length));
        }
        let mut mask = 0u64;
        let mut value = 0u64;
        for (index, character) in source.chars().enumerate() {
            mask <<= 1;
            value <<= 1;
            match character {
                '0' => mask |= 1,
                '1' => {
                    mask |= 1;
                    value |= 1;
                }
                '-' => {}
                c if c.is_ascii_alphabetic() => {}
                character => return Err(PatternError::InvalidCharacter { index, character }),
            }
        }
        let pattern = Self {
            length: length as u32,
            mask,
            value,
        };
        pattern.check_length_encoding()?;
        Ok(pattern)
    }

    /// Pattern length in bits (16, 32, or 64).
    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn matches(&self, opcode: u64) -> bool {
        opcode & self.mask == self.value
    }

    /// The literal low bits of every RISC-V instruction encode its length; reject patterns whose
    /// literal bits contradict the pattern's own length.
    fn check_length_encoding(&self) -> Result<(), PatternError> {
        let consistent = match self.length {
            // Compressed instructions never have both low bits set.
            16 => self.value & 0b11 != 0b11,
            32 => {
                self.mask & 0b11 == 0b11
                    && self.value & 0b11 == 0b11
                    && (self.value >> 2) & 0b111 != 0b111
            }
            64 => self.mask & 0x7F == 0x7F && self.value & 0x7F == 0b011_1111,
            _ => unreachable!(),
        };
        if consistent {
            Ok(())
        } else {
            Err(PatternError::LengthEncodingMismatch(self.length))
        }
    }
}

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum PatternError {
    #[error("pattern is {0} characters long, expected 16, 32, or 64")]
    InvalidLength(usize),
    #[error("invalid pattern character {character:?} at index {index}")]
    InvalidCharacter { index: usize, character: char },
    #[error("literal bits contradict the RISC-V length encoding for a {0}-bit instruction")]
    LengthEncodingMismatch(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_pattern_matches_exactly() {
        let pattern = BitPattern::parse("00000000000000000000000001110011").unwrap();
        assert!(pattern.matches(0x0000_0073));
        assert!(!pattern.matches(0x0010_0073));
    }

    #[test]
    fn test_field_letters_are_dont_cares() {
        let pattern = BitPattern::parse("0000010RRRRRSSSSS100DDDDD0110011").unwrap();
        assert_eq!(32, pattern.length());
        assert!(pattern.matches(0b0000010_10101_01010_100_00001_0110011));
        assert!(!pattern.matches(0b0000010_10101_01010_101_00001_0110011));
    }

    #[test]
    fn test_invalid_length_rejected() {
        assert_eq!(
            Err(PatternError::InvalidLength(7)),
            BitPattern::parse("1110011")
        );
    }

    #[test]
    fn test_invalid_character_rejected() {
        assert_eq!(
            Err(PatternError::InvalidCharacter {
                index: 0,
                character: '?'
            }),
            BitPattern::parse("?0000000000000000000000001110011")
        );
    }

    #[test]
    fn test_length_encoding_checked() {
        // 32-bit patterns must have literal `11` as their lowest bits.
        assert_eq!(
            Err(PatternError::LengthEncodingMismatch(32)),
            BitPattern::parse("00000000000000000000000001110000")
        );
        // ... and must not spill into the wider-than-32-bit encodings.
        assert_eq!(
            Err(PatternError::LengthEncodingMismatch(32)),
            BitPattern::parse("00000000000000000000000000011111")
        );
        // A 16-bit pattern with both low bits set would be a 32-bit instruction.
        assert_eq!(
            Err(PatternError::LengthEncodingMismatch(16)),
            BitPattern::parse("0000000000000011")
        );
        assert!(BitPattern::parse("000000000000--00").is_ok());
        assert!(BitPattern::parse(
            "0000000000000000000000000000000000000000000000000000000000111111"
        )
        .is_ok());
    }
}
