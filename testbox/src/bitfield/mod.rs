//! Declarative bit-level record layouts.
//!
//! A [`Schema`] is built once from a list of [`BitField`] descriptors and then
//! shared by every [`Container`] instance of that record type. The wire order of
//! the fields is given solely by their field ID (`fid`): fields with a higher
//! `fid` come first. Declaration order does not matter.
//!
//! ```
//! use std::sync::Arc;
//!
//! use testbox::bitfield::{BitField, Check, Container, Schema};
//!
//! let schema = Arc::new(
//!     Schema::with_length("Sample", vec![
//!         BitField::new(0x01, "low", 4),
//!         BitField::new(0x02, "high", 4).with_check(Check::int(0, 9)),
//!     ], 8)
//!     .unwrap(),
//! );
//!
//! let sample = Container::with_values(&schema, [("high", 0x5u8), ("low", 0xa)]).unwrap();
//! assert_eq!(sample.to_hex_list().to_string(), "5A");
//! ```

mod check;
mod container;

use std::{collections::HashSet, fmt, sync::Arc};

pub use check::Check;
pub use container::{Container, FieldValue};

use crate::{
    error::{Error, Result},
    hexlist::{HexList, MAX_INT_BITS},
};

/// The length of a field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FieldLength {
    /// The field always occupies this amount of bits.
    Fixed(usize),

    /// The field consumes the rest of the record. Only the last field of a
    /// schema may be variable.
    Variable,
}

/// Describes a single field of a record.
///
/// Descriptors are assembled with the `with_*` builder methods and turned into
/// a layout by [`Schema::new`].
#[derive(Clone, Debug)]
pub struct BitField {
    fid: u8,
    name: &'static str,
    title: &'static str,
    length: FieldLength,
    default: Option<FieldValue>,
    checks: Vec<Check>,
    little_endian: bool,
    optional: bool,
    aliases: Vec<&'static str>,
    interpreter: Option<Arc<Schema>>,
}

impl BitField {
    /// Creates a fixed-length field of `bits` bits.
    pub fn new(fid: u8, name: &'static str, bits: usize) -> Self {
        Self::with_length(fid, name, FieldLength::Fixed(bits))
    }

    /// Creates a variable-length field consuming the rest of the record.
    pub fn variable(fid: u8, name: &'static str) -> Self {
        Self::with_length(fid, name, FieldLength::Variable)
    }

    fn with_length(fid: u8, name: &'static str, length: FieldLength) -> Self {
        Self {
            fid,
            name,
            title: name,
            length,
            default: None,
            checks: Vec::new(),
            little_endian: false,
            optional: false,
            aliases: Vec::new(),
            interpreter: None,
        }
    }

    /// Sets a human readable title.
    pub fn with_title(mut self, title: &'static str) -> Self {
        self.title = title;
        self
    }

    /// Sets the value used when a container does not assign the field.
    ///
    /// Without a default, fixed fields start zeroed and variable fields start
    /// empty.
    pub fn with_default(mut self, value: impl Into<FieldValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Adds a validator.
    pub fn with_check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    /// Marks the field as little-endian on the wire. Its value is still
    /// accessed in big-endian order.
    pub fn little_endian(mut self) -> Self {
        self.little_endian = true;
        self
    }

    /// Marks the field as optional: it may be missing at the end of a parsed
    /// buffer.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Adds an alternative name the field can be accessed by.
    pub fn with_alias(mut self, alias: &'static str) -> Self {
        self.aliases.push(alias);
        self
    }

    /// Interprets the raw value of the field as a nested record.
    pub fn with_interpreter(mut self, schema: Arc<Schema>) -> Self {
        self.interpreter = Some(schema);
        self
    }

    /// The field ID ordering the field on the wire.
    pub fn fid(&self) -> u8 {
        self.fid
    }

    /// The name of the field.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The human readable title of the field.
    pub fn title(&self) -> &'static str {
        self.title
    }

    /// The length of the field.
    pub fn length(&self) -> FieldLength {
        self.length
    }

    /// The amount of bits a fixed-length field occupies.
    pub fn bits(&self) -> Option<usize> {
        match self.length {
            FieldLength::Fixed(bits) => Some(bits),
            FieldLength::Variable => None,
        }
    }

    /// The amount of octets a value of a fixed-length field holds.
    pub fn octets(&self) -> Option<usize> {
        self.bits().map(|bits| bits.div_ceil(8))
    }

    /// Whether the field consumes the rest of the record.
    pub fn is_variable(&self) -> bool {
        self.length == FieldLength::Variable
    }

    /// Whether the field may be missing at the end of a parsed buffer.
    pub fn is_optional(&self) -> bool {
        self.optional
    }

    /// Whether the field is stored little-endian on the wire.
    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    /// The validators of the field.
    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    /// The alternative names of the field.
    pub fn aliases(&self) -> &[&'static str] {
        &self.aliases
    }

    /// The schema interpreting the raw value, if any.
    pub fn interpreter(&self) -> Option<&Arc<Schema>> {
        self.interpreter.as_ref()
    }

    /// Whether `name` is the name or one of the aliases of the field.
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.contains(&name)
    }

    /// Converts a value into the stored representation and runs all checks on
    /// it.
    ///
    /// Fixed-length values are right-aligned into [`Self::octets`] octets.
    /// Values with more significant bits than the field holds are rejected
    /// with [`Error::OutOfRange`].
    pub fn normalize(&self, value: FieldValue) -> Result<HexList> {
        let normalized = match (self.length, value) {
            (FieldLength::Fixed(bits), FieldValue::Int(int)) => {
                if crate::hexlist::significant_bits(int) > bits {
                    return Err(self.out_of_range(&format!("{int:#x}"), bits));
                }
                HexList::from_int(int, bits.div_ceil(8))?
            },
            (FieldLength::Fixed(bits), FieldValue::Bytes(mut bytes)) => {
                if significant_bits_of(&bytes) > bits {
                    return Err(self.out_of_range(&bytes.to_string(), bits));
                }

                let octets = bits.div_ceil(8);
                if bytes.len() > octets {
                    bytes = bytes.slice(bytes.len() - octets..)?;
                }
                bytes.pad_left(octets, 0);
                bytes
            },
            (FieldLength::Variable, FieldValue::Int(int)) => {
                let octets = crate::hexlist::significant_bits(int).div_ceil(8).max(1);
                HexList::from_int(int, octets)?
            },
            (FieldLength::Variable, FieldValue::Bytes(bytes)) => bytes,
        };

        for check in &self.checks {
            check.verify(self.name, &normalized)?;
        }

        Ok(normalized)
    }

    fn out_of_range(&self, value: &str, bits: usize) -> Error {
        Error::OutOfRange(format!(
            "{value} does not fit into the {bits} bit field {}",
            self.name
        ))
    }
}

/// Counts the significant bits of a big-endian octet sequence.
fn significant_bits_of(bytes: &HexList) -> usize {
    match bytes.iter().position(|&byte| byte != 0) {
        Some(first) => (bytes.len() - first) * 8 - bytes[first].leading_zeros() as usize,
        None => 0,
    }
}

/// A field placed at its bit offset within a schema.
#[derive(Clone, Debug)]
pub struct FieldLayout {
    field: BitField,
    offset: usize,
    default: Option<HexList>,
}

impl FieldLayout {
    /// The field descriptor.
    pub fn field(&self) -> &BitField {
        &self.field
    }

    /// The offset of the field in bits, counted from the most significant bit
    /// of the record.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The normalized default value. [`None`] for optional fields without a
    /// declared default.
    pub fn default_value(&self) -> Option<&HexList> {
        self.default.as_ref()
    }

    /// Whether the field occupies whole octets at an octet boundary.
    pub fn is_octet_aligned(&self) -> bool {
        self.offset % 8 == 0 && self.field.bits().is_none_or(|bits| bits % 8 == 0)
    }
}

/// The evaluated layout of a record type.
///
/// Invariants established by [`Schema::new`]:
/// - fields are ordered by descending `fid`, and offsets are the running sum
///   of the preceding lengths;
/// - the fixed fields add up to the declared length, unless the last field is
///   variable, in which case they must not exceed it;
/// - optional fields only appear at the end of the record.
#[derive(Debug)]
pub struct Schema {
    name: &'static str,
    layout: Vec<FieldLayout>,
    fixed_bits: usize,
    min_bits: usize,
    declared_bits: Option<usize>,
}

impl Schema {
    /// Evaluates a record layout without a declared total length.
    pub fn new(name: &'static str, fields: Vec<BitField>) -> Result<Self> {
        Self::evaluate(name, fields, None)
    }

    /// Evaluates a record layout whose fixed fields must add up to
    /// `bitfield_length` bits.
    pub fn with_length(
        name: &'static str,
        fields: Vec<BitField>,
        bitfield_length: usize,
    ) -> Result<Self> {
        Self::evaluate(name, fields, Some(bitfield_length))
    }

    fn evaluate(
        name: &'static str,
        mut fields: Vec<BitField>,
        declared_bits: Option<usize>,
    ) -> Result<Self> {
        let config_err = |msg: String| Error::Configuration(format!("{name}: {msg}"));

        let mut fids = HashSet::new();
        let mut names = HashSet::new();
        for field in &fields {
            if !fids.insert(field.fid) {
                return Err(config_err(format!("duplicate fid {:#04x}", field.fid)));
            }
            for alias in std::iter::once(&field.name).chain(field.aliases.iter()) {
                if !names.insert(*alias) {
                    return Err(config_err(format!("duplicate field name {alias}")));
                }
            }
        }

        fields.sort_by(|a, b| b.fid.cmp(&a.fid));

        let field_count = fields.len();
        let mut layout = Vec::with_capacity(field_count);
        let mut offset = 0;
        let mut min_bits = None;

        for (i, field) in fields.into_iter().enumerate() {
            match field.length {
                FieldLength::Variable if i != field_count - 1 => {
                    return Err(config_err(format!(
                        "variable field {} is not the last field",
                        field.name
                    )));
                },
                FieldLength::Variable if offset % 8 != 0 => {
                    return Err(config_err(format!(
                        "variable field {} does not start at an octet boundary",
                        field.name
                    )));
                },
                FieldLength::Fixed(0) => {
                    return Err(config_err(format!("field {} has no bits", field.name)));
                },
                FieldLength::Fixed(bits)
                    if (offset % 8 != 0 || bits % 8 != 0) && bits > MAX_INT_BITS =>
                {
                    return Err(config_err(format!(
                        "unaligned field {} is wider than {MAX_INT_BITS} bits",
                        field.name
                    )));
                },
                _ => (),
            }

            if field.little_endian
                && (offset % 8 != 0 || field.bits().is_some_and(|bits| bits % 8 != 0))
            {
                return Err(config_err(format!(
                    "little-endian field {} is not octet aligned",
                    field.name
                )));
            }

            if let Some(interpreter) = &field.interpreter {
                let fits = match field.length {
                    FieldLength::Fixed(bits) => {
                        bits % 8 == 0
                            && !interpreter.has_variable_tail()
                            && interpreter.bit_length() == bits
                    },
                    FieldLength::Variable => true,
                };
                if !fits {
                    return Err(config_err(format!(
                        "interpreter {} does not match field {}",
                        interpreter.name(),
                        field.name
                    )));
                }
            }

            if field.optional {
                min_bits.get_or_insert(offset);
            } else if min_bits.is_some() && !field.is_variable() {
                return Err(config_err(format!(
                    "mandatory field {} follows an optional field",
                    field.name
                )));
            }

            let default = match (&field.default, field.optional) {
                (Some(value), _) => Some(field.normalize(value.clone()).map_err(|err| {
                    config_err(format!("invalid default for {}: {err}", field.name))
                })?),
                (None, true) => None,
                (None, false) => Some(match field.octets() {
                    Some(octets) => HexList::zeroes(octets),
                    None => HexList::new(),
                }),
            };

            let bits = field.bits().unwrap_or(0);
            layout.push(FieldLayout {
                field,
                offset,
                default,
            });
            offset += bits;
        }

        let has_variable_tail = layout.last().is_some_and(|last| last.field.is_variable());
        if let Some(declared) = declared_bits {
            let consistent = if has_variable_tail {
                offset <= declared
            } else {
                offset == declared
            };
            if !consistent {
                return Err(config_err(format!(
                    "fields add up to {offset} bits, declared length is {declared} bits"
                )));
            }
        }

        Ok(Self {
            name,
            layout,
            fixed_bits: offset,
            min_bits: min_bits.unwrap_or(offset),
            declared_bits,
        })
    }

    /// The name of the record type.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The fields in wire order.
    pub fn fields(&self) -> impl Iterator<Item = &FieldLayout> {
        self.layout.iter()
    }

    /// The amount of fields.
    pub fn len(&self) -> usize {
        self.layout.len()
    }

    /// Whether the schema has no fields.
    pub fn is_empty(&self) -> bool {
        self.layout.is_empty()
    }

    /// Looks up a field by its name or one of its aliases, returning its
    /// position in wire order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.layout
            .iter()
            .position(|layout| layout.field.answers_to(name))
    }

    /// Looks up a field by its name or one of its aliases.
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.position(name).map(|i| &self.layout[i])
    }

    pub(crate) fn layout_at(&self, position: usize) -> &FieldLayout {
        &self.layout[position]
    }

    /// The sum of all fixed field lengths in bits.
    pub fn bit_length(&self) -> usize {
        self.fixed_bits
    }

    /// The amount of bits a parsed buffer must at least hold.
    pub fn min_bits(&self) -> usize {
        self.min_bits
    }

    /// The declared total length, if any.
    pub fn declared_length(&self) -> Option<usize> {
        self.declared_bits
    }

    /// Whether the last field consumes the rest of the record.
    pub fn has_variable_tail(&self) -> bool {
        self.layout
            .last()
            .is_some_and(|last| last.field.is_variable())
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.name)?;
        for (i, layout) in self.layout.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            match layout.field.length {
                FieldLength::Fixed(bits) => {
                    write!(f, "{}@{}:{}", layout.field.name, layout.offset, bits)?
                },
                FieldLength::Variable => write!(f, "{}@{}:*", layout.field.name, layout.offset)?,
            }
        }
        write!(f, "]")
    }
}
