//! Implements the VLP Root feature (ID `0x0000`), which maps VLP feature IDs
//! to the indices they are reached at.

use std::sync::Arc;

use serde::Serialize;

use super::{BoundFeature, FeatureModel};
use crate::{
    bitfield::{BitField, FieldValue},
    channel::Channel,
    error::{Error, Result},
    protocol::{MessageClass, Protocol, vlp},
};

/// The protocol ID of the VLP Root feature.
pub const ID: u16 = 0x0000;

fn get_feature_index() -> Result<Arc<MessageClass>> {
    vlp::request("GetFeatureIndex", ID, 0, 0, vec![
        BitField::new(0xf7, "feature_id", 16),
    ])
}

fn get_feature_index_response() -> Result<Arc<MessageClass>> {
    vlp::response("GetFeatureIndexResponse", ID, 0, 0, vec![
        BitField::new(0xf7, "feature_id", 16),
        BitField::new(0xf6, "feat_index", 8),
        BitField::new(0xf5, "hidden", 1),
        BitField::new(0xf4, "reserved", 7),
        BitField::new(0xf3, "feat_version", 8),
        BitField::new(0xf2, "feature_max_memory", 16),
    ])
}

/// The VLP Root model, version 0.
pub fn models() -> Result<Vec<FeatureModel>> {
    Ok(vec![
        FeatureModel::builder(ID, "VlpRoot", 0, Protocol::Vlp)
            .function(get_feature_index()?, get_feature_index_response()?)?
            .build(),
    ])
}

/// A VLP feature as reported by [`VlpRootFeature::get_feature_index`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct VlpFeatureInformation {
    /// The protocol ID of the feature.
    pub feature_id: u16,

    /// The VLP feature index.
    pub index: u8,

    /// Whether the feature is hidden from user software.
    pub hidden: bool,

    /// The version of the feature.
    pub version: u8,

    /// The largest message the feature accepts, in octets.
    pub max_memory: u16,
}

/// Implements the VLP `Root` / `0x0000` feature, always found at VLP feature
/// index 0.
#[derive(Clone, Debug)]
pub struct VlpRootFeature {
    bound: BoundFeature,
}

impl VlpRootFeature {
    /// Creates the facade for the device behind `chan`.
    pub fn new(chan: Arc<dyn Channel>) -> Result<Self> {
        let model = chan
            .dispatcher()
            .registry()
            .lookup_compatible(Protocol::Vlp, ID, u8::MAX)
            .cloned()
            .ok_or_else(|| Error::Configuration("no VLP Root model registered".to_string()))?;

        Ok(Self {
            bound: BoundFeature::new(chan, model, 0),
        })
    }

    /// Retrieves the VLP index of a feature.
    ///
    /// Returns [`None`] if the device does not support the feature. Found
    /// features are stored in the channel's VLP feature table.
    pub fn get_feature_index(&self, feature_id: u16) -> Result<Option<VlpFeatureInformation>> {
        let response = self
            .bound
            .call(0, [("feature_id", FieldValue::from(feature_id))])?;

        let reported_id: u16 = response.get_as("feature_id")?;
        if reported_id != feature_id {
            return Err(Error::UnexpectedResponse(format!(
                "asked for VLP feature {feature_id:#06x}, got {reported_id:#06x}"
            )));
        }

        let info = VlpFeatureInformation {
            feature_id,
            index: response.get_as("feat_index")?,
            hidden: response.get_int("hidden")? != 0,
            version: response.get_as("feat_version")?,
            max_memory: response.get_as("feature_max_memory")?,
        };
        if info.index == 0 && feature_id != ID {
            return Ok(None);
        }

        self.bound
            .channel()
            .dispatcher()
            .vlp_feature_table()
            .insert(info.index, feature_id, info.version);

        Ok(Some(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hexlist::HexList, protocol::Message};

    #[test]
    fn request_is_a_single_unpadded_frame() -> Result<()> {
        let request = Message::build(&get_feature_index()?, [("feature_id", 0x1234u16)])?;
        assert_eq!(request.to_report(), HexList::from_hex("13FF0006001234")?);
        Ok(())
    }

    #[test]
    fn response_decodes_the_feature_entry() -> Result<()> {
        let report = HexList::from_hex("1301000600123405800201F4")?;
        let response = get_feature_index_response()?.parse(&report)?;

        assert_eq!(response.get_int("feat_index")?, 5);
        assert_eq!(response.get_int("hidden")?, 1);
        assert_eq!(response.get_int("feat_version")?, 2);
        assert_eq!(response.get_int("feature_max_memory")?, 500);
        Ok(())
    }
}
