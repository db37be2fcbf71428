//! Implements the HID++2.0 framing.
//!
//! Every HID++2.0 report starts with the same four octets:
//! `report_id | device_index | feature_index | function_index << 4 | software_id`.
//! The payload fields of a class follow the header in descending field ID
//! order, so payload fields must use IDs below [`FIRST_PAYLOAD_FID`].

use std::sync::Arc;

use super::{
    ErrorReport,
    HIDPP10_ERROR_TAG,
    HIDPP20_ERROR_TAG,
    MessageClass,
    MessageKind,
    Protocol,
    ReportType,
};
use crate::{
    bitfield::{BitField, Check, Schema},
    error::{Error, HidppError, Hidpp1Error, Result},
    hexlist::HexList,
    nibble::U4,
};

/// The highest field ID a payload field may use.
pub const FIRST_PAYLOAD_FID: u8 = 0xfa;

/// The field ID of the padding appended by the class constructors.
pub const PADDING_FID: u8 = 0x00;

/// The length of the HID++2.0 header in octets, including the report ID.
pub const HEADER_LENGTH: usize = 4;

/// Represents the header that every HID++2.0 report starts with.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ReportHeader {
    /// The report ID.
    pub report_type: ReportType,

    /// The index of the device involved in the communication.
    pub device_index: u8,

    /// The index of the feature the message belongs to.
    ///
    /// This is not the same as the feature ID, but the index returned from a
    /// feature lookup.
    pub feature_index: u8,

    /// The function (or event) index.
    pub function_index: U4,

    /// The ID of the software communicating with the device.
    pub software_id: U4,
}

impl ReportHeader {
    /// Extracts the header of a raw HID++ report.
    ///
    /// Returns [`None`] for reports that are too short or carry no HID++
    /// report ID.
    pub fn parse(report: &[u8]) -> Option<Self> {
        let report_type = ReportType::from_report_id(*report.first()?)?;
        if report_type == ReportType::Vlp || report.len() < HEADER_LENGTH {
            return None;
        }

        let (function_index, software_id) = U4::split(report[3]);
        Some(Self {
            report_type,
            device_index: report[1],
            feature_index: report[2],
            function_index,
            software_id,
        })
    }
}

/// Builds the header fields of a HID++2.0 class.
fn header(report_type: ReportType, function_index: u8) -> Vec<BitField> {
    vec![
        BitField::new(0xff, "report_id", 8)
            .with_default(report_type.report_id())
            .with_check(Check::list([
                u128::from(super::SHORT_REPORT_ID),
                u128::from(super::LONG_REPORT_ID),
                u128::from(super::VERY_LONG_REPORT_ID),
            ])),
        BitField::new(0xfe, "device_index", 8).with_default(0xffu8),
        BitField::new(0xfd, "feature_index", 8),
        BitField::new(0xfc, "function_index", 4)
            .with_alias("function_id")
            .with_alias("event_index")
            .with_default(function_index),
        BitField::new(0xfb, "software_id", 4),
    ]
}

fn validate(
    name: &'static str,
    index: u8,
    report_type: ReportType,
    payload: &[BitField],
) -> Result<()> {
    if index > 0x0f {
        return Err(Error::Configuration(format!(
            "{name}: index {index} does not fit into a nibble"
        )));
    }
    if report_type == ReportType::Vlp {
        return Err(Error::Configuration(format!(
            "{name}: HID++ classes cannot use VLP reports"
        )));
    }
    if let Some(field) = payload
        .iter()
        .find(|field| field.fid() > FIRST_PAYLOAD_FID || field.fid() == PADDING_FID)
    {
        return Err(Error::Configuration(format!(
            "{name}: payload field {} uses reserved fid {:#04x}",
            field.name(),
            field.fid()
        )));
    }

    Ok(())
}

/// Creates a request class.
///
/// Requests always occupy a full report of `report_type`. A trailing padding
/// field is added if the payload does not fill the report.
pub fn request(
    name: &'static str,
    feature_id: u16,
    function_index: u8,
    version: u8,
    report_type: ReportType,
    payload: Vec<BitField>,
) -> Result<Arc<MessageClass>> {
    validate(name, function_index, report_type, &payload)?;

    let total = report_type.length() * 8;
    let used = HEADER_LENGTH * 8 + payload.iter().filter_map(BitField::bits).sum::<usize>();
    let has_variable_tail = payload.iter().any(BitField::is_variable);

    let mut fields = header(report_type, function_index);
    fields.extend(payload);
    if !has_variable_tail && used < total {
        fields.push(BitField::new(PADDING_FID, "padding", total - used));
    }

    let schema = Schema::with_length(name, fields, total)?;
    Ok(Arc::new(MessageClass::from_parts(
        name,
        MessageKind::Request,
        Protocol::Hidpp,
        feature_id,
        function_index,
        version,
        report_type,
        schema,
    )))
}

/// Builds a class parsed from reports of any length: a variable padding field
/// absorbs whatever follows the payload.
fn incoming(
    name: &'static str,
    kind: MessageKind,
    feature_id: u16,
    index: u8,
    version: u8,
    report_type: ReportType,
    payload: Vec<BitField>,
) -> Result<Arc<MessageClass>> {
    validate(name, index, report_type, &payload)?;

    let has_variable_tail = payload.iter().any(BitField::is_variable);
    let mut fields = header(report_type, index);
    fields.extend(payload);
    if !has_variable_tail {
        fields.push(BitField::variable(PADDING_FID, "padding"));
    }

    let schema = Schema::with_length(name, fields, report_type.length() * 8)?;
    Ok(Arc::new(MessageClass::from_parts(
        name,
        kind,
        Protocol::Hidpp,
        feature_id,
        index,
        version,
        report_type,
        schema,
    )))
}

/// Creates a response class.
///
/// `report_type` is the report type the device usually answers with, but
/// responses parse from any HID++ report long enough to hold the payload.
pub fn response(
    name: &'static str,
    feature_id: u16,
    function_index: u8,
    version: u8,
    report_type: ReportType,
    payload: Vec<BitField>,
) -> Result<Arc<MessageClass>> {
    incoming(
        name,
        MessageKind::Response,
        feature_id,
        function_index,
        version,
        report_type,
        payload,
    )
}

/// Creates an event class.
pub fn event(
    name: &'static str,
    feature_id: u16,
    event_index: u8,
    version: u8,
    report_type: ReportType,
    payload: Vec<BitField>,
) -> Result<Arc<MessageClass>> {
    incoming(
        name,
        MessageKind::Event,
        feature_id,
        event_index,
        version,
        report_type,
        payload,
    )
}

/// Parses a HID++ error report of either protocol version.
///
/// HID++2.0 errors (tag `0xff`) become [`Error::Hidpp`], HID++1.0 errors (tag
/// `0x8f`) become [`Error::Hidpp1`].
pub fn parse_error(report: &[u8]) -> Option<ErrorReport> {
    let report_type = ReportType::from_report_id(*report.first()?)?;
    if report_type == ReportType::Vlp || report.len() < 6 {
        return None;
    }

    let error = match report[2] {
        HIDPP20_ERROR_TAG => {
            let (function_index, software_id) = U4::split(report[4]);
            Error::Hidpp(HidppError {
                feature_index: report[3],
                function_index: function_index.to_lo(),
                software_id: software_id.to_lo(),
                error_code: report[5],
            })
        },
        HIDPP10_ERROR_TAG => Error::Hidpp1(Hidpp1Error {
            device_index: report[1],
            sub_id: report[3],
            address: report[4],
            error_code: report[5],
        }),
        _ => return None,
    };

    Some(ErrorReport {
        device_index: report[1],
        error,
        report: HexList::from(report),
    })
}

/// Reads a HID++1.0 error report as if it answered a HID++2.0 request.
///
/// Both error formats place the feature index (or sub ID) and the function
/// byte (or register address) at the same offsets.
pub fn as_hidpp_error(report: &ErrorReport) -> Option<HidppError> {
    match report.error {
        Error::Hidpp(err) => Some(err),
        Error::Hidpp1(err) => {
            let (function_index, software_id) = U4::split(err.address);
            Some(HidppError {
                feature_index: err.sub_id,
                function_index: function_index.to_lo(),
                software_id: software_id.to_lo(),
                error_code: err.error_code,
            })
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    fn get_feature_classes() -> Result<(Arc<MessageClass>, Arc<MessageClass>)> {
        let request = request("GetFeature", 0x0000, 0, 0, ReportType::Long, vec![
            BitField::new(0x01, "feature_id", 16),
        ])?;
        let response = response("GetFeatureResponse", 0x0000, 0, 0, ReportType::Long, vec![
            BitField::new(0x03, "index", 8),
            BitField::new(0x02, "feature_type", 8),
            BitField::new(0x01, "feature_version", 8),
        ])?;
        Ok((request, response))
    }

    #[test]
    fn requests_fill_their_report() -> Result<()> {
        let (request, _) = get_feature_classes()?;
        let mut message = Message::build(&request, [("feature_id", 0x0007u16)])?;
        message.set_device_index(0x01)?;
        message.set_software_id(U4::MAX)?;

        assert_eq!(
            message.to_report().to_string(),
            format!("1101000F0007{}", "00".repeat(14))
        );
        assert_eq!(message.to_report().len(), 20);
        Ok(())
    }

    #[test]
    fn responses_accept_any_report_length() -> Result<()> {
        let (_, response) = get_feature_classes()?;

        let long = HexList::from_hex(&format!("1101000F04{}", "00".repeat(15)))?;
        let long = Message::from_hex_list(&response, &long)?;
        assert_eq!(long.get_int("index")?, 4);
        assert_eq!(long.software_id(), U4::MAX);

        let short = Message::from_hex_list(&response, &HexList::from_hex("1001000F040102")?)?;
        assert_eq!(short.get_int("feature_version")?, 2);
        assert_eq!(short.get("padding")?.len(), 0);
        Ok(())
    }

    #[test]
    fn rejects_foreign_reports() -> Result<()> {
        let (_, response) = get_feature_classes()?;
        let vlp = HexList::from_hex("1301000F040102")?;
        assert!(matches!(
            Message::from_hex_list(&response, &vlp),
            Err(Error::UnexpectedResponse(_))
        ));

        let wrong_function = HexList::from_hex("1001001F040102")?;
        assert!(matches!(
            Message::from_hex_list(&response, &wrong_function),
            Err(Error::UnexpectedResponse(_))
        ));
        Ok(())
    }

    #[test]
    fn rejects_reserved_fids_and_oversized_payloads() {
        assert!(matches!(
            request("Bad", 0x0001, 0, 0, ReportType::Short, vec![BitField::new(
                0xfb, "value", 8
            )]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            request("Big", 0x0001, 0, 0, ReportType::Short, vec![BitField::new(
                0x01, "value", 32
            )]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            event("Nibble", 0x0001, 16, 0, ReportType::Short, vec![]),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn parses_header_and_errors() {
        let header = ReportHeader::parse(&[0x10, 0x01, 0x04, 0x51, 0, 0, 0]);
        assert_eq!(
            header.map(|h| (h.feature_index, h.function_index.to_lo(), h.software_id.to_lo())),
            Some((0x04, 5, 1))
        );
        assert_eq!(ReportHeader::parse(&[0x13, 0x01, 0x04, 0x51]), None);

        let err = parse_error(&[0x10, 0x01, 0x8f, 0x04, 0x51, 0x07, 0x00]);
        assert!(matches!(
            err.as_ref().map(|report| &report.error),
            Some(Error::Hidpp1(_))
        ));
        assert_eq!(
            err.as_ref().and_then(as_hidpp_error),
            Some(HidppError {
                feature_index: 4,
                function_index: 5,
                software_id: 1,
                error_code: 7
            })
        );

        assert_eq!(parse_error(&[0x10, 0x01, 0x04, 0x51, 0, 0, 0]), None);
    }
}
