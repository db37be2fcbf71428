//! A mutable octet sequence with bit-level access.
//!
//! [`HexList`] is the value type of every field in the message model. Its
//! integer views are big-endian: bit offset `0` is the most significant bit of
//! the first octet.

use std::{
    fmt,
    ops::{Add, Deref, DerefMut, RangeBounds},
    str::FromStr,
};

use crate::error::{Error, Result};

/// The widest integer window supported by [`HexList::extract_bits`] and
/// [`HexList::insert_bits`].
pub const MAX_INT_BITS: usize = u128::BITS as usize;

/// An ordered, mutable sequence of octets.
///
/// The length in octets is authoritative. Equality compares values.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HexList(Vec<u8>);

impl HexList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Creates a list of `len` zero octets.
    pub fn zeroes(len: usize) -> Self {
        Self(vec![0; len])
    }

    /// Creates a list of `len` octets holding `value` in big-endian order.
    ///
    /// Returns [`Error::OutOfRange`] if `value` needs more than `len` octets.
    pub fn from_int(value: u128, len: usize) -> Result<Self> {
        let significant = significant_bits(value);
        if significant > len * 8 {
            return Err(Error::OutOfRange(format!(
                "{value:#x} does not fit into {len} octets"
            )));
        }

        let bytes = value.to_be_bytes();
        let mut list = Self::zeroes(len);
        let copied = len.min(bytes.len());
        list.0[len - copied..].copy_from_slice(&bytes[bytes.len() - copied..]);

        Ok(list)
    }

    /// Parses a string of hex digits. Whitespace between digits is ignored.
    ///
    /// Returns [`Error::InvalidArgument`] for odd digit counts or non-hex
    /// characters.
    pub fn from_hex(src: &str) -> Result<Self> {
        let digits = src
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<Vec<char>>();

        if digits.len() % 2 != 0 {
            return Err(Error::InvalidArgument(format!(
                "hex string {src:?} has an odd number of digits"
            )));
        }

        digits
            .chunks_exact(2)
            .map(|pair| {
                let hi = pair[0].to_digit(16);
                let lo = pair[1].to_digit(16);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => Ok((hi << 4 | lo) as u8),
                    _ => Err(Error::InvalidArgument(format!(
                        "hex string {src:?} contains non-hex characters"
                    ))),
                }
            })
            .collect::<Result<Vec<u8>>>()
            .map(Self)
    }

    /// The length in octets.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list holds no octets.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The length in bits.
    pub fn bit_len(&self) -> usize {
        self.0.len() * 8
    }

    /// Borrows the octets.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the list and returns its octets.
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    /// Interprets the whole list as a big-endian unsigned integer.
    ///
    /// Leading zero octets are ignored, so lists longer than 16 octets are
    /// accepted as long as their value fits into a [`u128`].
    pub fn to_u128(&self) -> Result<u128> {
        let start = self
            .0
            .iter()
            .position(|&byte| byte != 0)
            .unwrap_or(self.0.len());
        let significant = &self.0[start..];

        if significant.len() > 16 {
            return Err(Error::OutOfRange(format!(
                "{self} does not fit into a 128 bit integer"
            )));
        }

        Ok(significant
            .iter()
            .fold(0u128, |acc, &byte| acc << 8 | u128::from(byte)))
    }

    /// Copies a range of octets into a new list.
    ///
    /// Returns [`Error::OutOfRange`] if the range exceeds the list.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Result<Self> {
        let start = match range.start_bound() {
            std::ops::Bound::Included(&start) => start,
            std::ops::Bound::Excluded(&start) => start + 1,
            std::ops::Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            std::ops::Bound::Included(&end) => end + 1,
            std::ops::Bound::Excluded(&end) => end,
            std::ops::Bound::Unbounded => self.0.len(),
        };

        self.0
            .get(start..end)
            .map(|octets| Self(octets.to_vec()))
            .ok_or_else(|| {
                Error::OutOfRange(format!(
                    "range {start}..{end} exceeds a list of {} octets",
                    self.0.len()
                ))
            })
    }

    /// Extracts `length` bits starting at `msb_offset` as a big-endian
    /// integer.
    ///
    /// A `length` of zero yields `0`. Windows wider than [`MAX_INT_BITS`] or
    /// reaching past the end of the list return [`Error::OutOfRange`].
    pub fn extract_bits(&self, msb_offset: usize, length: usize) -> Result<u128> {
        if length == 0 {
            return Ok(0);
        }
        self.check_window(msb_offset, length)?;

        let mut value = 0u128;
        for bit in msb_offset..msb_offset + length {
            value = value << 1 | u128::from(self.bit(bit));
        }

        Ok(value)
    }

    /// Overwrites `length` bits starting at `msb_offset` with `value`,
    /// preserving all surrounding bits.
    ///
    /// A `length` of zero is a no-op. If `value` does not fit into the window,
    /// its truncated low bits are written anyway and [`Error::OutOfRange`] is
    /// returned.
    pub fn insert_bits(&mut self, msb_offset: usize, length: usize, value: u128) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        self.check_window(msb_offset, length)?;

        let truncated = value & mask(length);
        for i in 0..length {
            let bit = (truncated >> (length - 1 - i)) & 1 == 1;
            self.set_bit(msb_offset + i, bit);
        }

        if truncated != value {
            return Err(Error::OutOfRange(format!(
                "{value:#x} does not fit into a {length} bit window"
            )));
        }

        Ok(())
    }

    /// Reads a single bit, `0` being the most significant bit of the first
    /// octet.
    ///
    /// Panics if `bit` is out of bounds.
    pub fn bit(&self, bit: usize) -> bool {
        self.0[bit / 8] >> (7 - bit % 8) & 1 == 1
    }

    /// Writes a single bit, `0` being the most significant bit of the first
    /// octet.
    ///
    /// Panics if `bit` is out of bounds.
    pub fn set_bit(&mut self, bit: usize, value: bool) {
        let shift = 7 - bit % 8;
        if value {
            self.0[bit / 8] |= 1 << shift;
        } else {
            self.0[bit / 8] &= !(1 << shift);
        }
    }

    /// Prepends `fill` octets until the list is `len` octets long.
    ///
    /// Longer lists are left untouched.
    pub fn pad_left(&mut self, len: usize, fill: u8) {
        if self.0.len() < len {
            let missing = len - self.0.len();
            self.0.splice(0..0, std::iter::repeat_n(fill, missing));
        }
    }

    /// Appends `fill` octets until the list is `len` octets long.
    ///
    /// Longer lists are left untouched.
    pub fn pad_right(&mut self, len: usize, fill: u8) {
        if self.0.len() < len {
            self.0.resize(len, fill);
        }
    }

    /// Appends the octets of another list.
    pub fn extend_from(&mut self, other: &HexList) {
        self.0.extend_from_slice(&other.0);
    }

    /// Appends a single octet.
    pub fn push(&mut self, octet: u8) {
        self.0.push(octet);
    }

    fn check_window(&self, msb_offset: usize, length: usize) -> Result<()> {
        if length > MAX_INT_BITS {
            return Err(Error::OutOfRange(format!(
                "bit windows are limited to {MAX_INT_BITS} bits, got {length}"
            )));
        }
        if msb_offset
            .checked_add(length)
            .is_none_or(|end| end > self.bit_len())
        {
            return Err(Error::OutOfRange(format!(
                "bit window {msb_offset}+{length} exceeds a list of {} bits",
                self.bit_len()
            )));
        }

        Ok(())
    }
}

/// Returns a mask of the `length` low bits.
pub(crate) fn mask(length: usize) -> u128 {
    if length >= MAX_INT_BITS {
        u128::MAX
    } else {
        (1u128 << length) - 1
    }
}

/// Counts the bits needed to represent `value`.
pub(crate) fn significant_bits(value: u128) -> usize {
    (u128::BITS - value.leading_zeros()) as usize
}

impl Deref for HexList {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for HexList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Display for HexList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HexList({self})")
    }
}

impl FromStr for HexList {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<Vec<u8>> for HexList {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for HexList {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for HexList {
    fn from(value: [u8; N]) -> Self {
        Self(value.to_vec())
    }
}

impl From<HexList> for Vec<u8> {
    fn from(value: HexList) -> Self {
        value.0
    }
}

impl FromIterator<u8> for HexList {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for HexList {
    type Item = u8;
    type IntoIter = std::vec::IntoIter<u8>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a HexList {
    type Item = &'a u8;
    type IntoIter = std::slice::Iter<'a, u8>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Extend<u8> for HexList {
    fn extend<I: IntoIterator<Item = u8>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl Add for HexList {
    type Output = HexList;

    fn add(mut self, rhs: Self) -> Self::Output {
        self.0.extend(rhs.0);
        self
    }
}

impl Add<&HexList> for HexList {
    type Output = HexList;

    fn add(mut self, rhs: &HexList) -> Self::Output {
        self.extend_from(rhs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructs_from_all_sources() -> Result<()> {
        let from_int = HexList::from_int(0x0102, 3)?;
        let from_hex = HexList::from_hex("00 01 02")?;
        let from_iter = [0u8, 1, 2].into_iter().collect::<HexList>();

        assert_eq!(from_int, from_hex);
        assert_eq!(from_hex, from_iter);
        assert_eq!(from_int.to_string(), "000102");
        Ok(())
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(matches!(
            HexList::from_hex("ABC"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            HexList::from_hex("ZZ"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn renders_uppercase_without_separators() -> Result<()> {
        let list: HexList = "0a0bff".parse()?;
        assert_eq!(list.to_string(), "0A0BFF");
        assert_eq!(format!("{list:?}"), "HexList(0A0BFF)");
        Ok(())
    }

    #[test]
    fn empty_list_is_legal() -> Result<()> {
        let empty = HexList::from_hex("")?;
        assert!(empty.is_empty());
        assert_eq!(empty.to_u128()?, 0);
        assert_eq!(empty.extract_bits(0, 0)?, 0);
        Ok(())
    }

    #[test]
    fn from_int_rejects_oversized_values() {
        assert!(matches!(
            HexList::from_int(0x1_0000, 2),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn extracts_big_endian_bit_windows() -> Result<()> {
        let list = HexList::from_hex("A5 0F")?;
        assert_eq!(list.extract_bits(0, 4)?, 0xA);
        assert_eq!(list.extract_bits(4, 8)?, 0x50);
        assert_eq!(list.extract_bits(12, 4)?, 0xF);
        assert_eq!(list.extract_bits(0, 16)?, 0xA50F);
        assert!(matches!(list.extract_bits(12, 5), Err(Error::OutOfRange(_))));
        Ok(())
    }

    #[test]
    fn insert_preserves_surrounding_bits() -> Result<()> {
        let mut list = HexList::from_hex("FFFF")?;
        list.insert_bits(4, 8, 0x00)?;
        assert_eq!(list.to_string(), "F00F");

        list.insert_bits(0, 0, 0x1234)?;
        assert_eq!(list.to_string(), "F00F");
        Ok(())
    }

    #[test]
    fn oversized_insert_truncates_and_fails() -> Result<()> {
        let mut list = HexList::zeroes(1);
        let res = list.insert_bits(4, 4, 0x1F);
        assert!(matches!(res, Err(Error::OutOfRange(_))));
        assert_eq!(list.to_string(), "0F");
        Ok(())
    }

    #[test]
    fn windows_past_the_address_space_are_out_of_range() {
        let mut list = HexList::zeroes(2);
        assert!(matches!(
            list.extract_bits(usize::MAX, 8),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(
            list.insert_bits(usize::MAX - 3, 8, 0x12),
            Err(Error::OutOfRange(_))
        ));
        assert_eq!(list.to_string(), "0000");
    }

    #[test]
    fn pads_and_concatenates() -> Result<()> {
        let mut list = HexList::from_hex("AB")?;
        list.pad_left(3, 0x00);
        list.pad_right(5, 0xFF);
        assert_eq!(list.to_string(), "0000ABFFFF");

        list.pad_right(2, 0x11);
        assert_eq!(list.len(), 5);

        let joined = HexList::from_hex("01")? + HexList::from_hex("02")?;
        assert_eq!(joined.to_string(), "0102");
        Ok(())
    }

    #[test]
    fn slices_and_indexes() -> Result<()> {
        let list = HexList::from_hex("00112233")?;
        assert_eq!(list[1], 0x11);
        assert_eq!(list.slice(1..3)?.to_string(), "1122");
        assert_eq!(list.slice(2..)?.to_string(), "2233");
        assert!(list.slice(3..5).is_err());
        Ok(())
    }

    #[test]
    fn wide_values_ignore_leading_zeroes() -> Result<()> {
        let mut list = HexList::zeroes(20);
        list[19] = 0x07;
        assert_eq!(list.to_u128()?, 7);

        list[0] = 0x01;
        assert!(list.to_u128().is_err());
        Ok(())
    }
}
