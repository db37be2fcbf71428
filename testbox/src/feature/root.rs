//! Implements the Root feature (ID `0x0000`) that every device supports by
//! default.

use std::sync::Arc;

use super::{BoundFeature, FeatureInformation, FeatureModel, FeatureType};
use crate::{
    bitfield::{BitField, FieldValue},
    channel::Channel,
    error::{Error, Result},
    protocol::{Message, MessageClass, Protocol, ReportType, hidpp},
};

/// The protocol ID of the Root feature.
pub const ID: u16 = 0x0000;

fn get_feature(version: u8) -> Result<Arc<MessageClass>> {
    hidpp::request("GetFeature", ID, 0, version, ReportType::Long, vec![
        BitField::new(0xfa, "feature_id", 16),
    ])
}

/// The feature type bits, followed by the feature version from version 1 on.
///
/// Shared by Root and FeatureSet, whose answers describe features the same
/// way. Field IDs count down from `first_fid`.
pub(super) fn type_and_version_fields(first_fid: u8, version: u8) -> Vec<BitField> {
    let mut fields = vec![
        BitField::new(first_fid, "obsolete", 1),
        BitField::new(first_fid - 1, "hidden", 1),
        BitField::new(first_fid - 2, "engineering", 1),
    ];
    match version {
        0 => fields.push(BitField::new(first_fid - 3, "reserved", 5)),
        1 => fields.extend([
            BitField::new(first_fid - 3, "reserved", 5),
            BitField::new(first_fid - 4, "feat_version", 8),
        ]),
        _ => fields.extend([
            BitField::new(first_fid - 3, "manufacturing_deactivatable", 1),
            BitField::new(first_fid - 4, "compliance_deactivatable", 1),
            BitField::new(first_fid - 5, "reserved", 3),
            BitField::new(first_fid - 6, "feat_version", 8),
        ]),
    }

    fields
}

fn get_feature_response(version: u8) -> Result<Arc<MessageClass>> {
    let mut payload = vec![BitField::new(0xfa, "feat_index", 8)];
    payload.extend(type_and_version_fields(0xf9, version));

    hidpp::response(
        "GetFeatureResponse",
        ID,
        0,
        version,
        ReportType::Long,
        payload,
    )
}

fn get_protocol_version(version: u8) -> Result<Arc<MessageClass>> {
    hidpp::request(
        "GetProtocolVersion",
        ID,
        1,
        version,
        ReportType::Short,
        vec![
            BitField::new(0xfa, "zero", 16),
            BitField::new(0xf9, "ping_data", 8),
        ],
    )
}

fn get_protocol_version_response(version: u8) -> Result<Arc<MessageClass>> {
    hidpp::response(
        "GetProtocolVersionResponse",
        ID,
        1,
        version,
        ReportType::Long,
        vec![
            BitField::new(0xfa, "protocol_number", 8),
            BitField::new(0xf9, "target_software", 8),
            BitField::new(0xf8, "ping_data", 8),
        ],
    )
}

/// The Root models, versions 0 to 2.
///
/// Version 1 adds the feature version to `GetFeatureResponse`, version 2 the
/// deactivatable feature type bits.
pub fn models() -> Result<Vec<FeatureModel>> {
    (0..=2)
        .map(|version| {
            Ok(FeatureModel::builder(ID, "Root", version, Protocol::Hidpp)
                .function(get_feature(version)?, get_feature_response(version)?)?
                .function(
                    get_protocol_version(version)?,
                    get_protocol_version_response(version)?,
                )?
                .build())
        })
        .collect()
}

/// The answer to [`RootFeature::get_protocol_version`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, serde::Serialize)]
pub struct ProtocolVersion {
    /// The major HID++ protocol version (4 for HID++2.0).
    pub protocol_number: u8,

    /// The protocol revision, reported in place of the target software.
    pub target_software: u8,

    /// The echoed ping byte.
    pub ping_data: u8,
}

/// Implements the `Root` / `0x0000` feature that every HID++2.0 device
/// supports at index 0.
#[derive(Clone, Debug)]
pub struct RootFeature {
    bound: BoundFeature,
}

impl RootFeature {
    /// Creates the facade, using the newest Root model the settings allow.
    pub fn new(chan: Arc<dyn Channel>) -> Result<Self> {
        let dispatcher = chan.dispatcher();
        let version = dispatcher.feature_version(ID).unwrap_or(u8::MAX);
        let model = dispatcher
            .registry()
            .lookup_compatible(Protocol::Hidpp, ID, version)
            .cloned()
            .ok_or_else(|| Error::Configuration("no Root model registered".to_string()))?;

        Ok(Self {
            bound: BoundFeature::new(chan, model, 0),
        })
    }

    /// Retrieves the index, type and version of a feature.
    ///
    /// Returns [`None`] if the device does not support the feature. Found
    /// features are stored in the channel's feature table.
    pub fn get_feature(&self, feature_id: u16) -> Result<Option<FeatureInformation>> {
        let response = self
            .bound
            .call(0, [("feature_id", FieldValue::from(feature_id))])?;

        let index: u8 = response.get_as("feat_index")?;
        if index == 0 && feature_id != ID {
            return Ok(None);
        }

        let info = FeatureInformation {
            feature_id,
            index,
            typ: feature_type(&response),
            version: optional_byte(&response, "feat_version")?,
        };
        self.bound
            .channel()
            .dispatcher()
            .feature_table()
            .insert(info.index, feature_id, info.version);

        Ok(Some(info))
    }

    /// Retrieves the HID++ protocol version, echoing `ping_data`.
    ///
    /// Returns [`Error::UnexpectedResponse`] if the device echoes another
    /// byte.
    pub fn get_protocol_version(&self, ping_data: u8) -> Result<ProtocolVersion> {
        let response = self
            .bound
            .call(1, [("ping_data", FieldValue::from(ping_data))])?;

        let version = ProtocolVersion {
            protocol_number: response.get_as("protocol_number")?,
            target_software: response.get_as("target_software")?,
            ping_data: response.get_as("ping_data")?,
        };
        if version.ping_data != ping_data {
            return Err(Error::UnexpectedResponse(format!(
                "ping echoed {:#04x} instead of {ping_data:#04x}",
                version.ping_data
            )));
        }

        Ok(version)
    }
}

pub(super) fn optional_byte(response: &Message, name: &str) -> Result<u8> {
    match response.schema().field(name) {
        Some(_) => response.get_as(name),
        None => Ok(0),
    }
}

pub(super) fn feature_type(response: &Message) -> FeatureType {
    let flag = |name: &str| response.get_int(name).is_ok_and(|value| value != 0);

    FeatureType {
        obsolete: flag("obsolete"),
        hidden: flag("hidden"),
        engineering: flag("engineering"),
        manufacturing_deactivatable: flag("manufacturing_deactivatable"),
        compliance_deactivatable: flag("compliance_deactivatable"),
    }
}
