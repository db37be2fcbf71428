//! Implements the FeatureSet feature (ID `0x0001`), used to enumerate every
//! feature of a device.

use std::sync::Arc;

use super::{
    BoundFeature,
    FeatureInformation,
    FeatureModel,
    root::{feature_type, optional_byte, type_and_version_fields},
};
use crate::{
    bitfield::{BitField, FieldValue},
    channel::Channel,
    error::Result,
    protocol::{MessageClass, Protocol, ReportType, hidpp},
};

/// The protocol ID of the FeatureSet feature.
pub const ID: u16 = 0x0001;

fn get_count(version: u8) -> Result<Arc<MessageClass>> {
    hidpp::request("GetCount", ID, 0, version, ReportType::Short, vec![])
}

fn get_count_response(version: u8) -> Result<Arc<MessageClass>> {
    hidpp::response("GetCountResponse", ID, 0, version, ReportType::Short, vec![
        BitField::new(0xfa, "count", 8),
    ])
}

fn get_feature_id(version: u8) -> Result<Arc<MessageClass>> {
    hidpp::request("GetFeatureId", ID, 1, version, ReportType::Short, vec![
        BitField::new(0xfa, "feat_index", 8),
    ])
}

fn get_feature_id_response(version: u8) -> Result<Arc<MessageClass>> {
    let mut payload = vec![BitField::new(0xfa, "feature_id", 16)];
    payload.extend(type_and_version_fields(0xf9, version));

    hidpp::response(
        "GetFeatureIdResponse",
        ID,
        1,
        version,
        ReportType::Long,
        payload,
    )
}

/// The FeatureSet models, versions 0 to 2.
pub fn models() -> Result<Vec<FeatureModel>> {
    (0..=2)
        .map(|version| {
            Ok(
                FeatureModel::builder(ID, "FeatureSet", version, Protocol::Hidpp)
                    .function(get_count(version)?, get_count_response(version)?)?
                    .function(get_feature_id(version)?, get_feature_id_response(version)?)?
                    .build(),
            )
        })
        .collect()
}

/// Implements the `FeatureSet` / `0x0001` feature.
///
/// To collect all features of a device, call [`Self::count`] and then
/// [`Self::get_feature`] for every `i in 1..=count` (1-based, as the root
/// feature at index 0 is not listed), or use [`Self::enumerate`].
#[derive(Clone, Debug)]
pub struct FeatureSetFeature {
    bound: BoundFeature,
}

impl FeatureSetFeature {
    /// Locates the feature on the device behind `chan`.
    pub fn resolve(chan: &Arc<dyn Channel>) -> Result<Self> {
        Ok(Self {
            bound: BoundFeature::resolve(chan, ID)?,
        })
    }

    /// Retrieves the number of features supported by the device, not
    /// including the root feature.
    pub fn count(&self) -> Result<u8> {
        self.bound.call(0, [])?.get_as("count")
    }

    /// Retrieves the feature stored at `index` in the feature table.
    ///
    /// Feature index `0` for the root feature is not allowed.
    pub fn get_feature(&self, index: u8) -> Result<FeatureInformation> {
        let response = self
            .bound
            .call(1, [("feat_index", FieldValue::from(index))])?;

        Ok(FeatureInformation {
            feature_id: response.get_as("feature_id")?,
            index,
            typ: feature_type(&response),
            version: optional_byte(&response, "feat_version")?,
        })
    }

    /// Lists every feature of the device and stores them in the channel's
    /// feature table.
    pub fn enumerate(&self) -> Result<Vec<FeatureInformation>> {
        let count = self.count()?;
        let table = self.bound.channel().dispatcher().feature_table();

        let mut features = Vec::with_capacity(usize::from(count));
        for index in 1..=count {
            let info = self.get_feature(index)?;
            table.insert(index, info.feature_id, info.version);
            features.push(info);
        }

        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hexlist::HexList, protocol::Message};

    #[test]
    fn get_feature_id_response_reads_type_and_version() -> Result<()> {
        let report = HexList::from_hex("1001011F000740")?;
        let v0 = get_feature_id_response(0)?.parse(&report)?;
        assert_eq!(v0.get_int("feature_id")?, 0x0007);
        assert!(feature_type(&v0).hidden);

        let report = HexList::from_hex(&format!("1101011F1D4B0003{}", "00".repeat(12)))?;
        let v1 = get_feature_id_response(1)?.parse(&report)?;
        assert_eq!(v1.get_int("feature_id")?, 0x1d4b);
        assert_eq!(optional_byte(&v1, "feat_version")?, 3);
        Ok(())
    }

    #[test]
    fn get_count_is_a_short_request() -> Result<()> {
        let request = Message::new(&get_count(0)?);
        assert_eq!(request.to_report().len(), 7);
        Ok(())
    }
}
