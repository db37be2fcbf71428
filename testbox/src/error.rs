//! Errors returned by the message model, the channels and the dispatcher.
//!
//! Protocol errors are reported by the device and carry the indices of the
//! request they answer. Framework errors are raised by this crate itself.
//! Diagnostics are never returned to a caller; the dispatcher only counts them
//! and tags the affected reports with them.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::protocol::ReportType;

/// The result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Represents the error codes a HID++2.0 device reports in an error message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum Hidpp20ErrorCode {
    /// No error.
    NoError = 0x00,

    /// The device could not classify the error.
    Unknown = 0x01,

    /// A parameter of the request is invalid.
    InvalidArgument = 0x02,

    /// A parameter of the request is out of the supported range.
    OutOfRange = 0x03,

    /// The hardware of the device failed to execute the request.
    HwError = 0x04,

    /// A Logitech internal error.
    LogitechInternal = 0x05,

    /// The feature index of the request does not exist on the device.
    InvalidFeatureIndex = 0x06,

    /// The function index of the request does not exist for the feature.
    InvalidFunctionId = 0x07,

    /// The device is busy and cannot process the request right now.
    Busy = 0x08,

    /// The request is not supported by the device.
    Unsupported = 0x09,
}

/// Represents the error codes a HID++1.0 receiver or device reports in an
/// error message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum Hidpp10ErrorCode {
    /// No error.
    Success = 0x00,

    /// The sub ID of the request is unknown to the receiver.
    UnknownRequest = 0x01,

    /// The register address of the request is invalid.
    InvalidAddress = 0x02,

    /// A value of the request is invalid.
    InvalidValue = 0x03,

    /// A connection request failed on the receiver's side.
    ConnectFail = 0x04,

    /// Too many devices are connected to the receiver.
    TooManyDevices = 0x05,

    /// The requested entity already exists.
    AlreadyExists = 0x06,

    /// The receiver is handling another downstream message.
    Busy = 0x07,

    /// There is no device paired at the requested device index.
    UnknownDevice = 0x08,

    /// The addressed device is currently disconnected.
    ResourceError = 0x09,

    /// The request is not available in the current context.
    RequestUnavailable = 0x0a,

    /// A request parameter has an unsupported value.
    InvalidParamValue = 0x0b,

    /// The entered PIN code was wrong.
    WrongPinCode = 0x0c,
}

/// An error report sent by a HID++2.0 device in response to a request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Error)]
#[error(
    "HID++2.0 error {error_code:#04x} for feature index {feature_index:#04x}, function {function_index}"
)]
pub struct HidppError {
    /// The feature index of the failed request.
    pub feature_index: u8,

    /// The function index of the failed request.
    pub function_index: u8,

    /// The software ID of the failed request.
    pub software_id: u8,

    /// The raw error code. See [`Self::code`].
    pub error_code: u8,
}

impl HidppError {
    /// Maps the raw error code to a known [`Hidpp20ErrorCode`].
    pub fn code(&self) -> Option<Hidpp20ErrorCode> {
        Hidpp20ErrorCode::try_from(self.error_code).ok()
    }
}

/// An error report sent by a HID++1.0 receiver in response to a register
/// access.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Error)]
#[error("HID++1.0 error {error_code:#04x} for sub ID {sub_id:#04x}, address {address:#04x}")]
pub struct Hidpp1Error {
    /// The device index the failed request was addressed to.
    pub device_index: u8,

    /// The sub ID of the failed request.
    pub sub_id: u8,

    /// The register address of the failed request.
    pub address: u8,

    /// The raw error code. See [`Self::code`].
    pub error_code: u8,
}

impl Hidpp1Error {
    /// Maps the raw error code to a known [`Hidpp10ErrorCode`].
    pub fn code(&self) -> Option<Hidpp10ErrorCode> {
        Hidpp10ErrorCode::try_from(self.error_code).ok()
    }
}

/// An error report sent by a VLP device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Error)]
#[error("VLP error {error_code:#04x} for feature index {feature_index:#04x}, function {function_index}")]
pub struct VlpError {
    /// The VLP feature index of the failed request.
    pub feature_index: u8,

    /// The VLP function index of the failed request.
    pub function_index: u8,

    /// The raw error code. VLP shares the code space of HID++2.0.
    pub error_code: u8,
}

impl VlpError {
    /// Maps the raw error code to a known [`Hidpp20ErrorCode`].
    pub fn code(&self) -> Option<Hidpp20ErrorCode> {
        Hidpp20ErrorCode::try_from(self.error_code).ok()
    }
}

/// Represents any error the crate returns to a caller.
///
/// The type is [`Clone`] so a single reason (e.g. [`Error::ChannelClosed`])
/// can resolve every pending request of a channel.
#[derive(Clone, PartialEq, Eq, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The device answered a HID++2.0 request with an error report.
    #[error(transparent)]
    Hidpp(#[from] HidppError),

    /// The receiver answered a HID++1.0 request with an error report.
    #[error(transparent)]
    Hidpp1(#[from] Hidpp1Error),

    /// The device answered a VLP request with an error report.
    #[error(transparent)]
    Vlp(#[from] VlpError),

    /// No response arrived within the timeout of the request.
    #[error("no response arrived in time")]
    Timeout,

    /// The transport did not accept the report within the send timeout.
    #[error("the transport did not accept the report in time")]
    SendTimeout,

    /// The channel is not open, was closed or lost its transport.
    #[error("the channel is closed")]
    ChannelClosed,

    /// The receiver channel owning this through-receiver channel was closed.
    #[error("the parent receiver channel was closed")]
    ParentClosed,

    /// The pending request was cancelled.
    #[error("the pending request was cancelled")]
    Cancelled,

    /// No software ID is free, or an identical request is already pending.
    #[error("all request slots are in use")]
    Busy,

    /// A field value or API argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A schema, registry or settings definition is inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A buffer is shorter than the schema parsing it requires.
    #[error("buffer of {actual} bits is shorter than the required {required} bits")]
    Truncated {
        /// The amount of bits required.
        required: usize,

        /// The amount of bits available.
        actual: usize,
    },

    /// A value does not fit into its bit window or index range.
    #[error("value out of range: {0}")]
    OutOfRange(String),

    /// A VLP frame arrived out of sequence and the partial transfer was
    /// discarded.
    #[error("VLP sequence error: expected {expected}, received {received}")]
    VlpSequence {
        /// The sequence number the reassembly expected.
        expected: u8,

        /// The sequence number that arrived.
        received: u8,
    },

    /// The HID interface does not declare any HID++ or VLP reports.
    #[error("the HID interface does not support HID++")]
    HidppNotSupported,

    /// The HID interface does not support the report type of a message.
    #[error("the HID interface does not support {0:?} reports")]
    ReportTypeNotSupported(ReportType),

    /// The transport implementation failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The device does not implement a feature a facade was bound to.
    #[error("the device does not support feature {0:#06x}")]
    FeatureNotSupported(u16),

    /// A response arrived but did not have the expected layout.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl Error {
    /// Whether the error was reported by the device rather than by the
    /// framework.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Hidpp(_) | Self::Hidpp1(_) | Self::Vlp(_))
    }
}

/// Tags a report that could not be delivered to its intended consumer.
///
/// Diagnostics are never raised. The dispatcher logs them, counts them in its
/// statistics and attaches them to the report it enqueues on the RAW queue.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[non_exhaustive]
pub enum Diagnostic {
    /// A response arrived for a request that already timed out.
    Orphan,

    /// The report ID is not handled by the dispatcher.
    UnknownReport,

    /// The report could not be parsed with any known message class.
    Unparsed,

    /// A VLP frame broke the sequence of a multi-frame transfer.
    VlpSequence,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err_with_code(error_code: u8) -> HidppError {
        HidppError {
            feature_index: 4,
            function_index: 5,
            software_id: 1,
            error_code,
        }
    }

    #[test]
    fn error_codes_map_from_raw_values() {
        assert_eq!(
            err_with_code(7).code(),
            Some(Hidpp20ErrorCode::InvalidFunctionId)
        );

        let err = Hidpp1Error {
            device_index: 0xff,
            sub_id: 0x81,
            address: 0x02,
            error_code: 0x0a,
        };
        assert_eq!(err.code(), Some(Hidpp10ErrorCode::RequestUnavailable));

        let unknown = HidppError {
            error_code: 0x42,
            ..err_with_code(0)
        };
        assert_eq!(unknown.code(), None);
    }

    #[test]
    fn protocol_errors_are_distinguished() {
        let err = Error::from(VlpError {
            feature_index: 1,
            function_index: 2,
            error_code: 9,
        });
        assert!(err.is_protocol_error());
        assert!(!Error::Timeout.is_protocol_error());
    }
}
