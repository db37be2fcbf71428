//! Implements the message model shared by HID++2.0, HID++1.0 and VLP.
//!
//! A [`MessageClass`] pairs a [`Schema`] with the routing information of a
//! request, response or event (feature ID, function or event index, feature
//! version). A [`Message`] is a [`Container`] instance of such a class.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    bitfield::{Container, FieldValue, Schema},
    error::{Error, Result},
    hexlist::HexList,
    nibble::U4,
};

pub mod hidpp;
pub mod hidpp1;
pub mod vlp;

/// The report ID of short HID++ messages.
pub const SHORT_REPORT_ID: u8 = 0x10;

/// The report ID of long HID++ messages.
pub const LONG_REPORT_ID: u8 = 0x11;

/// The report ID of very long HID++ messages.
pub const VERY_LONG_REPORT_ID: u8 = 0x12;

/// The report ID of VLP frames.
pub const VLP_REPORT_ID: u8 = 0x13;

/// The length of short HID++ reports, including the report ID.
pub const SHORT_REPORT_LENGTH: usize = 7;

/// The length of long HID++ reports, including the report ID.
pub const LONG_REPORT_LENGTH: usize = 20;

/// The length of very long HID++ reports, including the report ID.
pub const VERY_LONG_REPORT_LENGTH: usize = 64;

/// The maximum length of VLP frames, including the report ID.
pub const VLP_REPORT_LENGTH: usize = 65;

/// The byte at offset 2 of a HID++2.0 error report.
pub const HIDPP20_ERROR_TAG: u8 = 0xff;

/// The byte at offset 2 of a HID++1.0 error report.
pub const HIDPP10_ERROR_TAG: u8 = 0x8f;

/// The report IDs of pairing notifications sent by DJ receivers.
pub const DJ_REPORT_IDS: [u8; 2] = [0x41, 0x42];

/// Represents the HID report types carrying HID++ or VLP messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ReportType {
    /// A HID++ report with 3 bytes of payload.
    Short,

    /// A HID++ report with 16 bytes of payload.
    Long,

    /// A HID++ report with 60 bytes of payload.
    VeryLong,

    /// A VLP frame with up to 60 bytes of payload.
    Vlp,
}

impl ReportType {
    /// All report types, ordered by report ID.
    pub const ALL: [ReportType; 4] = [Self::Short, Self::Long, Self::VeryLong, Self::Vlp];

    /// The HID report ID of the report type.
    pub fn report_id(self) -> u8 {
        match self {
            Self::Short => SHORT_REPORT_ID,
            Self::Long => LONG_REPORT_ID,
            Self::VeryLong => VERY_LONG_REPORT_ID,
            Self::Vlp => VLP_REPORT_ID,
        }
    }

    /// The (maximum) length of a report of this type, including the report
    /// ID.
    pub fn length(self) -> usize {
        match self {
            Self::Short => SHORT_REPORT_LENGTH,
            Self::Long => LONG_REPORT_LENGTH,
            Self::VeryLong => VERY_LONG_REPORT_LENGTH,
            Self::Vlp => VLP_REPORT_LENGTH,
        }
    }

    /// Maps a HID report ID to its report type.
    pub fn from_report_id(report_id: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|report_type| report_type.report_id() == report_id)
    }

    /// The protocol the report type belongs to.
    pub fn protocol(self) -> Protocol {
        match self {
            Self::Vlp => Protocol::Vlp,
            _ => Protocol::Hidpp,
        }
    }
}

/// Represents the application protocol spoken on a channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// HID++2.0 (including HID++1.0 register access).
    #[default]
    Hidpp,

    /// VLP 1.0.
    Vlp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hidpp => write!(f, "HID++"),
            Self::Vlp => write!(f, "VLP"),
        }
    }
}

/// An error report received from a device.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ErrorReport {
    /// The device index the report was received from.
    pub device_index: u8,

    /// The reported error: [`Error::Hidpp`], [`Error::Hidpp1`] or
    /// [`Error::Vlp`].
    pub error: Error,

    /// The raw report.
    pub report: HexList,
}

/// Represents the role of a message class.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MessageKind {
    /// Sent by the host to invoke a function.
    Request,

    /// Sent by the device in answer to a request.
    Response,

    /// Sent by the device without a request.
    Event,
}

/// Describes a concrete request, response or event of a feature.
///
/// Classes are created through the constructors in [`hidpp`] and [`vlp`],
/// which prepend the protocol header to the payload fields.
#[derive(Debug)]
pub struct MessageClass {
    name: &'static str,
    kind: MessageKind,
    protocol: Protocol,
    feature_id: u16,
    index: u8,
    version: u8,
    report_type: ReportType,
    schema: Arc<Schema>,
}

impl MessageClass {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        name: &'static str,
        kind: MessageKind,
        protocol: Protocol,
        feature_id: u16,
        index: u8,
        version: u8,
        report_type: ReportType,
        schema: Schema,
    ) -> Self {
        Self {
            name,
            kind,
            protocol,
            feature_id,
            index,
            version,
            report_type,
            schema: Arc::new(schema),
        }
    }

    /// The name of the class, e.g. `GetFeatureResponse`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The role of the class.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The protocol of the class.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The ID of the feature the class belongs to.
    pub fn feature_id(&self) -> u16 {
        self.feature_id
    }

    /// The function index of requests and responses, or the event index of
    /// events.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// The feature version the class was defined for.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The report type requests are sent with. Responses and events accept
    /// any report type of their protocol.
    pub fn report_type(&self) -> ReportType {
        self.report_type
    }

    /// The full layout, including the protocol header.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Creates a message with every field set to its default.
    pub fn instantiate(self: &Arc<Self>) -> Message {
        Message::new(self)
    }

    /// Parses a received report with this class.
    pub fn parse(self: &Arc<Self>, report: &HexList) -> Result<Message> {
        Message::from_hex_list(self, report)
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (feature {:#06x} v{}, index {})",
            self.name, self.feature_id, self.version, self.index
        )
    }
}

/// An instance of a [`MessageClass`].
///
/// Derefs to its [`Container`] for field access by name.
#[derive(Clone, Debug)]
pub struct Message {
    class: Arc<MessageClass>,
    container: Container,
}

impl Message {
    /// Creates a message with every field set to its default.
    pub fn new(class: &Arc<MessageClass>) -> Self {
        Self {
            class: Arc::clone(class),
            container: Container::new(class.schema()),
        }
    }

    /// Creates a message, assigning the given fields after running their
    /// checks.
    pub fn build<'a, V: Into<FieldValue>>(
        class: &Arc<MessageClass>,
        values: impl IntoIterator<Item = (&'a str, V)>,
    ) -> Result<Self> {
        Ok(Self {
            class: Arc::clone(class),
            container: Container::with_values(class.schema(), values)?,
        })
    }

    /// Parses a report with the given class.
    ///
    /// Returns [`Error::UnexpectedResponse`] if the report ID does not belong
    /// to the protocol of the class or the function index does not match.
    pub fn from_hex_list(class: &Arc<MessageClass>, report: &HexList) -> Result<Self> {
        let container = Container::from_hex_list(class.schema(), report)?;
        let message = Self {
            class: Arc::clone(class),
            container,
        };

        let report_type = ReportType::from_report_id(message.report_id());
        if report_type.map(ReportType::protocol) != Some(class.protocol()) {
            return Err(Error::UnexpectedResponse(format!(
                "report ID {:#04x} cannot carry {}",
                message.report_id(),
                class.name()
            )));
        }
        if message.function_index() != class.index() {
            return Err(Error::UnexpectedResponse(format!(
                "function index {} does not match {}",
                message.function_index(),
                class.name()
            )));
        }

        Ok(message)
    }

    /// The class of the message.
    pub fn class(&self) -> &Arc<MessageClass> {
        &self.class
    }

    /// Consumes the message and returns its container.
    pub fn into_container(self) -> Container {
        self.container
    }

    /// Serializes the message as the full report to be written.
    ///
    /// HID++ messages are zero-padded to the length of their report type. VLP
    /// frames are never padded.
    pub fn to_report(&self) -> HexList {
        let mut report = self.container.to_hex_list();
        if let Some(report_type) = self.report_type()
            && report_type != ReportType::Vlp
        {
            report.pad_right(report_type.length(), 0);
        }

        report
    }

    fn header_byte(&self, name: &str) -> u8 {
        // Header fields are mandatory and at most 8 bits wide.
        self.container.get_as(name).unwrap_or_default()
    }

    /// The report ID of the message.
    pub fn report_id(&self) -> u8 {
        self.header_byte("report_id")
    }

    /// The report type matching the report ID of the message.
    pub fn report_type(&self) -> Option<ReportType> {
        ReportType::from_report_id(self.report_id())
    }

    /// The index of the device involved in the communication.
    pub fn device_index(&self) -> u8 {
        self.header_byte("device_index")
    }

    /// The feature index the message is addressed to.
    pub fn feature_index(&self) -> u8 {
        self.header_byte("feature_index")
    }

    /// The function index (or event index) of the message.
    pub fn function_index(&self) -> u8 {
        self.header_byte("function_index")
    }

    /// The software ID of a HID++ message. Always zero for VLP messages.
    pub fn software_id(&self) -> U4 {
        match self.class.protocol() {
            Protocol::Hidpp => U4::from_lo(self.header_byte("software_id")),
            Protocol::Vlp => U4::default(),
        }
    }

    /// Sets the index of the device involved in the communication.
    pub fn set_device_index(&mut self, device_index: u8) -> Result<()> {
        self.container.set("device_index", device_index)
    }

    /// Sets the feature index the message is addressed to.
    pub fn set_feature_index(&mut self, feature_index: u8) -> Result<()> {
        self.container.set("feature_index", feature_index)
    }

    /// Sets the software ID of a HID++ message.
    pub fn set_software_id(&mut self, software_id: U4) -> Result<()> {
        self.container.set("software_id", u8::from(software_id))
    }
}

impl Deref for Message {
    type Target = Container;

    fn deref(&self) -> &Self::Target {
        &self.container
    }
}

impl DerefMut for Message {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.container
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.class, &other.class) && self.container == other.container
    }
}

impl Eq for Message {}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.container.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_ids_map_to_types() {
        assert_eq!(ReportType::from_report_id(0x11), Some(ReportType::Long));
        assert_eq!(ReportType::from_report_id(0x13), Some(ReportType::Vlp));
        assert_eq!(ReportType::from_report_id(0x20), None);
        assert_eq!(ReportType::VeryLong.length(), 64);
        assert_eq!(ReportType::Vlp.protocol(), Protocol::Vlp);
    }
}
