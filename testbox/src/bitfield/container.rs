//! Record instances holding one value per field of a [`Schema`].

use std::{fmt, sync::Arc};

use super::{FieldLayout, FieldLength, Schema};
use crate::{
    error::{Error, Result},
    hexlist::HexList,
    timestamp,
};

/// A value assigned to a field.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum FieldValue {
    /// An unsigned integer, stored big-endian.
    Int(u128),

    /// Raw octets.
    Bytes(HexList),
}

macro_rules! impl_int_field_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    Self::Int(u128::from(value))
                }
            }
        )*
    };
}

impl_int_field_value!(bool, u8, u16, u32, u64, u128);

impl From<HexList> for FieldValue {
    fn from(value: HexList) -> Self {
        Self::Bytes(value)
    }
}

impl From<&HexList> for FieldValue {
    fn from(value: &HexList) -> Self {
        Self::Bytes(value.clone())
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(HexList::from(value))
    }
}

impl From<&[u8]> for FieldValue {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(HexList::from(value))
    }
}

impl<const N: usize> From<[u8; N]> for FieldValue {
    fn from(value: [u8; N]) -> Self {
        Self::Bytes(HexList::from(value))
    }
}

/// An instance of a record type.
///
/// Every value is stored as a [`HexList`] right-aligned into the octets of its
/// field, with surplus high bits zeroed. Optional fields may be absent.
///
/// The construction timestamp is metadata: it is neither serialized nor
/// compared.
#[derive(Clone, Debug)]
pub struct Container {
    schema: Arc<Schema>,
    values: Vec<Option<HexList>>,
    timestamp_ns: u64,
}

impl Container {
    /// Creates an instance with every field set to its default.
    pub fn new(schema: &Arc<Schema>) -> Self {
        Self {
            schema: Arc::clone(schema),
            values: schema
                .fields()
                .map(|layout| layout.default_value().cloned())
                .collect(),
            timestamp_ns: timestamp::now_ns(),
        }
    }

    /// Creates an instance, assigning the given fields after running their
    /// checks. Unassigned fields take their defaults.
    ///
    /// Unknown field names return [`Error::InvalidArgument`].
    pub fn with_values<'a, V: Into<FieldValue>>(
        schema: &Arc<Schema>,
        values: impl IntoIterator<Item = (&'a str, V)>,
    ) -> Result<Self> {
        let mut container = Self::new(schema);
        for (name, value) in values {
            container.set(name, value)?;
        }

        Ok(container)
    }

    /// Parses a buffer by walking the fields in wire order.
    ///
    /// Interpreted fields are parsed with their nested schema as well, so a
    /// malformed nested record fails the whole parse. Surplus trailing octets
    /// are ignored unless the last field is variable, which then consumes them.
    ///
    /// Returns [`Error::Truncated`] if a mandatory field reaches past the end
    /// of `buf`.
    pub fn from_hex_list(schema: &Arc<Schema>, buf: &HexList) -> Result<Self> {
        let total = buf.bit_len();
        let mut values = Vec::with_capacity(schema.len());

        for layout in schema.fields() {
            let value = match layout.field().length() {
                FieldLength::Fixed(bits) => {
                    if layout.offset() + bits > total {
                        if layout.field().is_optional() && layout.offset() >= total {
                            values.push(None);
                            continue;
                        }
                        return Err(Error::Truncated {
                            required: schema.min_bits().max(layout.offset() + bits),
                            actual: total,
                        });
                    }
                    read_fixed(layout, bits, buf)?
                },
                FieldLength::Variable => {
                    let start = layout.offset() / 8;
                    if start >= buf.len() {
                        HexList::new()
                    } else {
                        buf.slice(start..)?
                    }
                },
            };

            if let Some(interpreter) = layout.field().interpreter() {
                Container::from_hex_list(interpreter, &value)?;
            }

            values.push(Some(value));
        }

        Ok(Self {
            schema: Arc::clone(schema),
            values,
            timestamp_ns: timestamp::now_ns(),
        })
    }

    /// The schema of the instance.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The construction timestamp in nanoseconds. See
    /// [`crate::timestamp::now_ns`].
    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    /// Overrides the timestamp, e.g. with the arrival time of a report.
    pub fn set_timestamp_ns(&mut self, timestamp_ns: u64) {
        self.timestamp_ns = timestamp_ns;
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.schema.position(name).ok_or_else(|| {
            Error::InvalidArgument(format!("{} has no field {name}", self.schema.name()))
        })
    }

    /// Assigns a field after running its checks.
    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        let position = self.position(name)?;
        let normalized = self
            .schema
            .layout_at(position)
            .field()
            .normalize(value.into())?;
        self.values[position] = Some(normalized);

        Ok(())
    }

    /// Assigns a field from a nested record.
    pub fn set_nested(&mut self, name: &str, nested: &Container) -> Result<()> {
        self.set(name, nested.to_hex_list())
    }

    /// Removes the value of an optional field.
    pub fn unset(&mut self, name: &str) -> Result<()> {
        let position = self.position(name)?;
        if !self.schema.layout_at(position).field().is_optional() {
            return Err(Error::InvalidArgument(format!(
                "field {name} of {} is not optional",
                self.schema.name()
            )));
        }
        self.values[position] = None;

        Ok(())
    }

    /// Whether a field holds a value.
    pub fn is_present(&self, name: &str) -> Result<bool> {
        Ok(self.values[self.position(name)?].is_some())
    }

    /// Returns the value of a field.
    ///
    /// Unknown or absent fields return [`Error::InvalidArgument`].
    pub fn get(&self, name: &str) -> Result<&HexList> {
        self.values[self.position(name)?].as_ref().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "field {name} of {} is absent",
                self.schema.name()
            ))
        })
    }

    /// Returns the value of a field as an integer.
    pub fn get_int(&self, name: &str) -> Result<u128> {
        self.get(name)?.to_u128()
    }

    /// Returns the value of a field converted to an integer type.
    ///
    /// Returns [`Error::OutOfRange`] if the value does not fit into `T`.
    pub fn get_as<T: TryFrom<u128>>(&self, name: &str) -> Result<T> {
        let int = self.get_int(name)?;
        T::try_from(int).map_err(|_| {
            Error::OutOfRange(format!(
                "field {name} value {int:#x} does not fit into {}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Returns an interpreted field parsed as its nested record.
    pub fn nested(&self, name: &str) -> Result<Container> {
        let position = self.position(name)?;
        let Some(interpreter) = self.schema.layout_at(position).field().interpreter() else {
            return Err(Error::InvalidArgument(format!(
                "field {name} of {} has no interpreter",
                self.schema.name()
            )));
        };

        Container::from_hex_list(interpreter, self.get(name)?)
    }

    /// The current length of the record in bits.
    ///
    /// Serialization stops at the first absent field.
    pub fn bit_length(&self) -> usize {
        let mut bits = 0;
        for (layout, value) in self.schema.fields().zip(&self.values) {
            let Some(value) = value else {
                break;
            };
            bits = layout.offset()
                + match layout.field().length() {
                    FieldLength::Fixed(field_bits) => field_bits,
                    FieldLength::Variable => value.bit_len(),
                };
        }

        bits
    }

    /// Serializes the record in wire order.
    ///
    /// The result is padded with zero bits to the next octet boundary.
    pub fn to_hex_list(&self) -> HexList {
        let mut out = HexList::zeroes(self.bit_length().div_ceil(8));

        for (layout, value) in self.schema.fields().zip(&self.values) {
            let Some(value) = value else {
                break;
            };
            match layout.field().length() {
                FieldLength::Fixed(bits) => write_fixed(layout, bits, value, &mut out),
                FieldLength::Variable => {
                    let start = layout.offset() / 8;
                    out[start..start + value.len()].copy_from_slice(value);
                },
            }
        }

        out
    }

    /// Iterates the fields in wire order with their values.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Option<&HexList>)> {
        self.schema
            .fields()
            .zip(&self.values)
            .map(|(layout, value)| (layout.field().name(), value.as_ref()))
    }
}

fn read_fixed(layout: &FieldLayout, bits: usize, buf: &HexList) -> Result<HexList> {
    if layout.is_octet_aligned() {
        let start = layout.offset() / 8;
        let mut value = buf.slice(start..start + bits / 8)?;
        if layout.field().is_little_endian() {
            value.reverse();
        }
        return Ok(value);
    }

    HexList::from_int(buf.extract_bits(layout.offset(), bits)?, bits.div_ceil(8))
}

fn write_fixed(layout: &FieldLayout, bits: usize, value: &HexList, out: &mut HexList) {
    if layout.is_octet_aligned() {
        let start = layout.offset() / 8;
        let window = &mut out[start..start + bits / 8];
        window.copy_from_slice(value);
        if layout.field().is_little_endian() {
            window.reverse();
        }
        return;
    }

    // Unaligned fields are at most 128 bits wide and hold normalized values,
    // so neither conversion can fail.
    if let Ok(int) = value.to_u128() {
        let _ = out.insert_bits(layout.offset(), bits, int);
    }
}

impl PartialEq for Container {
    fn eq(&self, other: &Self) -> bool {
        (Arc::ptr_eq(&self.schema, &other.schema) || self.schema.name() == other.schema.name())
            && self.values == other.values
    }
}

impl Eq for Container {}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.schema.name())?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            match value {
                Some(value) => write!(f, "{name}={value}")?,
                None => write!(f, "{name}=-")?,
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::{BitField, Check};

    fn sample_schema() -> Arc<Schema> {
        Arc::new(
            Schema::with_length(
                "Sample",
                vec![
                    BitField::new(0x05, "report_id", 8).with_default(0x10u8),
                    BitField::new(0x04, "flag", 1),
                    BitField::new(0x03, "mode", 3).with_check(Check::int(0, 5)),
                    BitField::new(0x02, "nibble", 4),
                    BitField::new(0x01, "word", 16).little_endian(),
                ],
                32,
            )
            .unwrap(),
        )
    }

    #[test]
    fn defaults_apply_to_unassigned_fields() -> Result<()> {
        let container = Container::new(&sample_schema());
        assert_eq!(container.get_int("report_id")?, 0x10);
        assert_eq!(container.to_hex_list().to_string(), "10000000");
        Ok(())
    }

    #[test]
    fn serializes_in_wire_order() -> Result<()> {
        let container = Container::with_values(&sample_schema(), [
            ("nibble", 0x0au16),
            ("flag", 1),
            ("mode", 5),
            ("word", 0x1234),
        ])?;

        assert_eq!(container.to_hex_list().to_string(), "10DA3412");
        assert_eq!(container.get("word")?.to_string(), "1234");
        Ok(())
    }

    #[test]
    fn parses_what_it_serializes() -> Result<()> {
        let schema = sample_schema();
        let original = Container::with_values(&schema, [("mode", 3u16), ("word", 0xbeef)])?;
        let parsed = Container::from_hex_list(&schema, &original.to_hex_list())?;

        assert_eq!(parsed, original);
        assert_eq!(parsed.get_as::<u16>("word")?, 0xbeef);
        Ok(())
    }

    #[test]
    fn rejects_unknown_fields_and_failed_checks() {
        let schema = sample_schema();
        assert!(matches!(
            Container::with_values(&schema, [("missing", 1u8)]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Container::with_values(&schema, [("mode", 6u8)]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Container::with_values(&schema, [("nibble", 0x10u8)]),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn short_buffers_are_truncated() -> Result<()> {
        let err = Container::from_hex_list(&sample_schema(), &HexList::from_hex("10DA34")?)
            .unwrap_err();
        assert_eq!(err, Error::Truncated {
            required: 32,
            actual: 24
        });
        Ok(())
    }

    #[test]
    fn variable_tail_consumes_remaining_octets() -> Result<()> {
        let schema = Arc::new(Schema::new("Frame", vec![
            BitField::new(0x02, "id", 8),
            BitField::variable(0x01, "payload"),
        ])?);

        let parsed = Container::from_hex_list(&schema, &HexList::from_hex("01AABBCC")?)?;
        assert_eq!(parsed.get("payload")?.to_string(), "AABBCC");
        assert_eq!(parsed.bit_length(), 32);

        let bare = Container::from_hex_list(&schema, &HexList::from_hex("01")?)?;
        assert!(bare.get("payload")?.is_empty());
        Ok(())
    }

    #[test]
    fn optional_fields_may_be_missing() -> Result<()> {
        let schema = Arc::new(Schema::new("Versioned", vec![
            BitField::new(0x02, "index", 8),
            BitField::new(0x01, "version", 8).optional(),
        ])?);

        let short = Container::from_hex_list(&schema, &HexList::from_hex("04")?)?;
        assert!(!short.is_present("version")?);
        assert_eq!(short.to_hex_list().to_string(), "04");

        let long = Container::from_hex_list(&schema, &HexList::from_hex("0402")?)?;
        assert_eq!(long.get_int("version")?, 2);
        Ok(())
    }

    #[test]
    fn nested_records_are_interpreted() -> Result<()> {
        let flags = Arc::new(Schema::with_length(
            "Flags",
            vec![
                BitField::new(0x02, "hidden", 1),
                BitField::new(0x01, "reserved", 7),
            ],
            8,
        )?);
        let schema = Arc::new(Schema::new("Outer", vec![
            BitField::new(0x02, "index", 8),
            BitField::new(0x01, "flags", 8).with_interpreter(Arc::clone(&flags)),
        ])?);

        let outer = Container::from_hex_list(&schema, &HexList::from_hex("0480")?)?;
        assert_eq!(outer.nested("flags")?.get_int("hidden")?, 1);

        let mut rebuilt = Container::new(&schema);
        rebuilt.set("index", 4u8)?;
        rebuilt.set_nested("flags", &Container::with_values(&flags, [("hidden", 1u8)])?)?;
        assert_eq!(rebuilt, outer);
        Ok(())
    }

    #[test]
    fn equality_ignores_timestamps() -> Result<()> {
        let schema = sample_schema();
        let a = Container::new(&schema);
        let mut b = Container::new(&schema);
        b.set_timestamp_ns(a.timestamp_ns() + 1000);
        assert_eq!(a, b);
        Ok(())
    }
}
