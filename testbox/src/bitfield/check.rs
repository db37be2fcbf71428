//! Validators attached to fields.

use crate::{
    error::{Error, Result},
    hexlist::HexList,
};

/// A validator run on every value assigned to a field.
///
/// A field passes validation only if all of its checks accept the value.
#[derive(Clone, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub enum Check {
    /// The integer value lies within `min..=max`.
    Int {
        /// The smallest accepted value.
        min: u128,

        /// The largest accepted value.
        max: u128,
    },

    /// The integer value fits into a single octet.
    Byte,

    /// The value is between `min` and `max` octets long (both inclusive).
    HexList {
        /// The minimum length in octets.
        min: usize,

        /// The maximum length in octets.
        max: usize,
    },

    /// The integer value is one of the listed values.
    List(Vec<u128>),
}

impl Check {
    /// Accepts integers within `min..=max`.
    pub fn int(min: u128, max: u128) -> Self {
        Self::Int { min, max }
    }

    /// Accepts values of exactly `len` octets.
    pub fn hex_list(len: usize) -> Self {
        Self::HexList { min: len, max: len }
    }

    /// Accepts values between `min` and `max` octets long.
    pub fn hex_list_range(min: usize, max: usize) -> Self {
        Self::HexList { min, max }
    }

    /// Accepts only the listed integer values.
    pub fn list(values: impl IntoIterator<Item = u128>) -> Self {
        Self::List(values.into_iter().collect())
    }

    /// Runs the check against a value assigned to the field `field`.
    ///
    /// Returns [`Error::InvalidArgument`] naming the field and the value if it
    /// is rejected.
    pub fn verify(&self, field: &str, value: &HexList) -> Result<()> {
        let accepted = match self {
            Self::Int { min, max } => value
                .to_u128()
                .is_ok_and(|int| (*min..=*max).contains(&int)),
            Self::Byte => value.to_u128().is_ok_and(|int| int <= 0xff),
            Self::HexList { min, max } => (*min..=*max).contains(&value.len()),
            Self::List(allowed) => value.to_u128().is_ok_and(|int| allowed.contains(&int)),
        };

        if accepted {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "field {field} rejects value {value} ({self:?})"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_range_is_inclusive() -> Result<()> {
        let check = Check::int(1, 15);
        check.verify("software_id", &HexList::from_int(15, 1)?)?;
        assert!(check.verify("software_id", &HexList::from_int(0, 1)?).is_err());
        Ok(())
    }

    #[test]
    fn byte_and_list_checks() -> Result<()> {
        Check::Byte.verify("index", &HexList::from_hex("00FF")?)?;
        assert!(Check::Byte.verify("index", &HexList::from_hex("0100")?).is_err());

        let check = Check::list([0x10, 0x11]);
        check.verify("report_id", &HexList::from_hex("11")?)?;
        assert!(check.verify("report_id", &HexList::from_hex("12")?).is_err());
        Ok(())
    }

    #[test]
    fn rejection_names_field_and_value() -> Result<()> {
        let err = Check::hex_list(2)
            .verify("name_chunk", &HexList::from_hex("AABBCC")?)
            .unwrap_err();
        let Error::InvalidArgument(msg) = err else {
            panic!("unexpected error {err:?}");
        };
        assert!(msg.contains("name_chunk"));
        assert!(msg.contains("AABBCC"));
        Ok(())
    }
}
