//! Defines the raw HID transport channels are built on.
//!
//! Any type implementing [`RawHidChannel`] can carry HID++ and VLP traffic.
//! Whether a transport actually supports HID++ is determined when a channel
//! is opened, either from [`RawHidChannel::supported_reports`] or by parsing
//! the HID report descriptor.

use std::time::Duration;

use hidreport::ReportDescriptor;
use thiserror::Error;

use crate::{error::Error, protocol::ReportType};

pub mod mock;

/// The maximum expected size of HID report descriptors.
pub const MAX_REPORT_DESCRIPTOR_LENGTH: usize = 4096;

/// The size of the buffer incoming reports are read into.
pub const MAX_REPORT_LENGTH: usize = 65;

/// Represents an error returned by a [`RawHidChannel`] implementation.
#[derive(Clone, PartialEq, Eq, Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The device is gone.
    #[error("the device was disconnected")]
    Disconnected,

    /// The transport did not accept a report in time.
    #[error("the report was not accepted in time")]
    Timeout,

    /// Any other failure of the implementation.
    #[error("{0}")]
    Io(String),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected => Self::ChannelClosed,
            TransportError::Timeout => Self::SendTimeout,
            TransportError::Io(msg) => Self::Transport(msg),
        }
    }
}

/// Represents an arbitrary HID communication channel that is both readable and
/// writable.
///
/// Reads are polled by the receive worker of a channel, so
/// [`Self::read_report`] must return after at most `timeout`, even if nothing
/// arrived.
pub trait RawHidChannel: Send + Sync + 'static {
    /// Writes a raw report, including its report ID.
    ///
    /// Returns the amount of written bytes, or [`TransportError::Timeout`] if
    /// the report was not accepted within `timeout`.
    fn write_report(&self, src: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Reads a raw report, including its report ID, waiting at most
    /// `timeout`.
    ///
    /// If the buffer is not large enough to fit the whole report, its
    /// remainder is discarded. Returns the amount of read bytes, `0` if no
    /// report arrived in time.
    fn read_report(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// The USB vendor ID of the device.
    fn vendor_id(&self) -> u16;

    /// The USB product ID of the device, if known.
    fn product_id(&self) -> Option<u16>;

    /// If the implementation already knows which HID++ and VLP reports the
    /// interface supports, it returns them here and the report descriptor is
    /// not parsed.
    fn supported_reports(&self) -> Option<Vec<ReportType>>;

    /// Retrieves the raw HID report descriptor.
    ///
    /// Returns the exact size of the report descriptor.
    fn get_report_descriptor(&self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Determines the HID++ and VLP report types a transport supports.
///
/// A report type counts as supported if the report descriptor declares an
/// input report with its report ID.
pub fn supported_reports<T: RawHidChannel + ?Sized>(
    transport: &T,
) -> Result<Vec<ReportType>, Error> {
    if let Some(reports) = transport.supported_reports() {
        return Ok(reports);
    }

    let mut raw_descriptor = vec![0u8; MAX_REPORT_DESCRIPTOR_LENGTH];
    let descriptor_size = transport.get_report_descriptor(&mut raw_descriptor)?;

    reports_in_descriptor(&raw_descriptor[..descriptor_size])
}

/// Lists the HID++ and VLP report types declared by a raw report descriptor.
pub fn reports_in_descriptor(raw_descriptor: &[u8]) -> Result<Vec<ReportType>, Error> {
    let descriptor = ReportDescriptor::try_from(raw_descriptor)
        .map_err(|err| Error::Transport(format!("invalid report descriptor: {err:?}")))?;

    Ok(ReportType::ALL
        .into_iter()
        .filter(|report_type| {
            descriptor
                .find_input_report(&[report_type.report_id()])
                .is_some()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_channel_errors() {
        assert_eq!(
            Error::from(TransportError::Disconnected),
            Error::ChannelClosed
        );
        assert_eq!(Error::from(TransportError::Timeout), Error::SendTimeout);
    }
}
