//! Implements the DeviceFriendlyName feature (ID `0x0007`).

use std::sync::Arc;

use serde::Serialize;

use super::{BoundFeature, FeatureModel};
use crate::{
    bitfield::{BitField, FieldValue},
    channel::Channel,
    error::{Error, Result},
    hexlist::HexList,
    protocol::{MessageClass, Protocol, ReportType, hidpp},
};

/// The protocol ID of the DeviceFriendlyName feature.
pub const ID: u16 = 0x0007;

/// The number of name octets carried by a single request or response.
pub const CHUNK_LENGTH: usize = 15;

fn classes() -> Result<Vec<(Arc<MessageClass>, Arc<MessageClass>)>> {
    let chunk_request = |name, index| {
        hidpp::request(name, ID, index, 0, ReportType::Short, vec![
            BitField::new(0xfa, "byte_index", 8),
        ])
    };
    let chunk_response = |name, index| {
        hidpp::response(name, ID, index, 0, ReportType::Long, vec![
            BitField::new(0xfa, "byte_index", 8),
            BitField::variable(0xf9, "name_chunk"),
        ])
    };
    let length_response = |name, index| {
        hidpp::response(name, ID, index, 0, ReportType::Short, vec![
            BitField::new(0xfa, "name_len", 8),
        ])
    };

    Ok(vec![
        (
            hidpp::request("GetFriendlyNameLen", ID, 0, 0, ReportType::Short, vec![])?,
            hidpp::response(
                "GetFriendlyNameLenResponse",
                ID,
                0,
                0,
                ReportType::Short,
                vec![
                    BitField::new(0xfa, "name_len", 8),
                    BitField::new(0xf9, "name_max_len", 8),
                    BitField::new(0xf8, "default_name_len", 8),
                ],
            )?,
        ),
        (
            chunk_request("GetFriendlyName", 1)?,
            chunk_response("GetFriendlyNameResponse", 1)?,
        ),
        (
            chunk_request("GetDefaultFriendlyName", 2)?,
            chunk_response("GetDefaultFriendlyNameResponse", 2)?,
        ),
        (
            hidpp::request("SetFriendlyName", ID, 3, 0, ReportType::Long, vec![
                BitField::new(0xfa, "byte_index", 8),
                BitField::new(0xf9, "name_chunk", CHUNK_LENGTH * 8),
            ])?,
            length_response("SetFriendlyNameResponse", 3)?,
        ),
        (
            hidpp::request("ResetFriendlyName", ID, 4, 0, ReportType::Short, vec![])?,
            length_response("ResetFriendlyNameResponse", 4)?,
        ),
    ])
}

/// The DeviceFriendlyName model, version 0.
pub fn models() -> Result<Vec<FeatureModel>> {
    let model = classes()?.into_iter().try_fold(
        FeatureModel::builder(ID, "DeviceFriendlyName", 0, Protocol::Hidpp),
        |builder, (request, response)| builder.function(request, response),
    )?;

    Ok(vec![model.build()])
}

/// The length data as returned by
/// [`DeviceFriendlyNameFeature::get_friendly_name_len`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct FriendlyNameLength {
    /// The current length of the friendly name.
    pub name_len: u8,

    /// The maximum length of the friendly name.
    pub name_max_len: u8,

    /// The length of the default friendly name.
    pub default_name_len: u8,
}

/// Implements the `DeviceFriendlyName` / `0x0007` feature.
#[derive(Clone, Debug)]
pub struct DeviceFriendlyNameFeature {
    bound: BoundFeature,
}

impl DeviceFriendlyNameFeature {
    /// Locates the feature on the device behind `chan`.
    pub fn resolve(chan: &Arc<dyn Channel>) -> Result<Self> {
        Ok(Self {
            bound: BoundFeature::resolve(chan, ID)?,
        })
    }

    /// Retrieves the current, maximum and default name lengths.
    pub fn get_friendly_name_len(&self) -> Result<FriendlyNameLength> {
        let response = self.bound.call(0, [])?;

        Ok(FriendlyNameLength {
            name_len: response.get_as("name_len")?,
            name_max_len: response.get_as("name_max_len")?,
            default_name_len: response.get_as("default_name_len")?,
        })
    }

    fn get_chunk(&self, function_index: u8, byte_index: u8) -> Result<HexList> {
        let response = self
            .bound
            .call(function_index, [("byte_index", FieldValue::from(byte_index))])?;

        Ok(response.get("name_chunk")?.clone())
    }

    fn get_whole(&self, function_index: u8, len: u8) -> Result<String> {
        let len = usize::from(len);
        let mut name = Vec::with_capacity(len);

        while name.len() < len {
            let chunk = self.get_chunk(function_index, name.len() as u8)?;
            if chunk.is_empty() {
                return Err(Error::UnexpectedResponse(format!(
                    "name chunk at {} is empty",
                    name.len()
                )));
            }

            let take = chunk.len().min(len - name.len());
            name.extend_from_slice(&chunk[..take]);
        }

        String::from_utf8(name)
            .map_err(|_| Error::UnexpectedResponse("the name is not valid UTF-8".to_string()))
    }

    /// Retrieves a chunk of the friendly name, starting at `byte_index`.
    ///
    /// The chunk is returned as received, including trailing zeroes past the
    /// end of the name.
    pub fn get_friendly_name(&self, byte_index: u8) -> Result<HexList> {
        self.get_chunk(1, byte_index)
    }

    /// Retrieves the whole friendly name by reading its length first and then
    /// as many chunks as required.
    pub fn get_whole_friendly_name(&self) -> Result<String> {
        let len = self.get_friendly_name_len()?.name_len;
        self.get_whole(1, len)
    }

    /// Retrieves a chunk of the default friendly name, starting at
    /// `byte_index`.
    pub fn get_default_friendly_name(&self, byte_index: u8) -> Result<HexList> {
        self.get_chunk(2, byte_index)
    }

    /// Retrieves the whole default friendly name.
    pub fn get_whole_default_friendly_name(&self) -> Result<String> {
        let len = self.get_friendly_name_len()?.default_name_len;
        self.get_whole(2, len)
    }

    /// Writes a chunk of at most [`CHUNK_LENGTH`] octets of the friendly name,
    /// starting at `byte_index`. The device truncates the name at its
    /// maximum length.
    ///
    /// Returns the new length of the name.
    pub fn set_friendly_name(&self, byte_index: u8, chunk: &[u8]) -> Result<u8> {
        if chunk.len() > CHUNK_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "name chunks hold at most {CHUNK_LENGTH} octets, got {}",
                chunk.len()
            )));
        }

        let mut padded = HexList::from(chunk);
        padded.pad_right(CHUNK_LENGTH, 0);

        self.bound
            .call(3, [
                ("byte_index", FieldValue::from(byte_index)),
                ("name_chunk", FieldValue::from(padded)),
            ])?
            .get_as("name_len")
    }

    /// Writes the whole friendly name, truncated to the maximum length the
    /// device reports.
    ///
    /// Returns the length of the name after writing it.
    pub fn set_whole_friendly_name(&self, name: &str) -> Result<u8> {
        let max_len = usize::from(self.get_friendly_name_len()?.name_max_len);
        let bytes = &name.as_bytes()[..name.len().min(max_len)];
        if bytes.is_empty() {
            return self.set_friendly_name(0, &[]);
        }

        let mut name_len = 0;
        for (i, chunk) in bytes.chunks(CHUNK_LENGTH).enumerate() {
            name_len = self.set_friendly_name((i * CHUNK_LENGTH) as u8, chunk)?;
        }

        Ok(name_len)
    }

    /// Resets the friendly name to the default one.
    ///
    /// Returns the length of the name after resetting it.
    pub fn reset_friendly_name(&self) -> Result<u8> {
        self.bound.call(4, [])?.get_as("name_len")
    }
}
