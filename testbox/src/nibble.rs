//! A 4-bit value type for the packed function and software IDs of HID++
//! headers.

use std::fmt;

use crate::error::{Error, Result};

/// Represents an unsigned 4-bit value (nibble) encoded as a byte.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct U4(u8);

impl U4 {
    /// The largest value a nibble can hold.
    pub const MAX: U4 = U4(0x0f);

    /// Constructs a nibble from the 4 low/rightmost bits of a byte.
    pub fn from_lo(raw: u8) -> Self {
        Self(raw & 0x0f)
    }

    /// Constructs a nibble from the 4 high/leftmost bits of a byte.
    pub fn from_hi(raw: u8) -> Self {
        Self(raw >> 4)
    }

    /// Returns the value as a byte with the nibble in the 4 low bits.
    pub fn to_lo(self) -> u8 {
        self.0
    }

    /// Returns the value as a byte with the nibble in the 4 high bits.
    pub fn to_hi(self) -> u8 {
        self.0 << 4
    }

    /// Splits a byte into its high and low nibbles.
    pub fn split(raw: u8) -> (Self, Self) {
        (Self::from_hi(raw), Self::from_lo(raw))
    }
}

impl TryFrom<u8> for U4 {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        if value > Self::MAX.0 {
            return Err(Error::OutOfRange(format!(
                "{value:#04x} does not fit into a nibble"
            )));
        }

        Ok(Self(value))
    }
}

impl From<U4> for u8 {
    fn from(value: U4) -> Self {
        value.0
    }
}

impl fmt::Display for U4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

/// Combines two nibbles to a byte, with `a` being set to the 4 leftmost and
/// `b` being set to the 4 rightmost bits.
pub fn combine(a: U4, b: U4) -> u8 {
    a.to_hi() | b.to_lo()
}
