//! Implements the parts of HID++1.0 still used alongside HID++2.0: register
//! access on receivers and pairing notifications.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

use super::{DJ_REPORT_IDS, LONG_REPORT_LENGTH, ReportType, SHORT_REPORT_LENGTH};
use crate::{
    error::{Error, Result},
    hexlist::HexList,
};

/// Represents the sub IDs used to access receiver registers.
///
/// A request of any of these types is answered with a response of the same
/// type, or with a HID++1.0 error report.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum RegisterAccess {
    /// Sets a 3-byte register value.
    SetRegister = 0x80,

    /// Retrieves a 3-byte register value.
    GetRegister = 0x81,

    /// Sets a 16-byte register value.
    SetLongRegister = 0x82,

    /// Retrieves a 16-byte register value.
    GetLongRegister = 0x83,
}

impl RegisterAccess {
    /// The report type the request is sent with.
    ///
    /// Only writing a long register needs a long report; reading one is
    /// requested with a short report and answered with a long one.
    pub fn request_report_type(self) -> ReportType {
        match self {
            Self::SetLongRegister => ReportType::Long,
            _ => ReportType::Short,
        }
    }
}

/// Represents the event types of pairing notifications.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive, Serialize)]
#[non_exhaustive]
#[repr(u8)]
pub enum NotificationType {
    /// A paired device disconnected from the receiver.
    DeviceDisconnection = 0x40,

    /// A paired device connected to the receiver, or its arrival was
    /// triggered explicitly.
    DeviceConnection = 0x41,

    /// The pairing state of the receiver changed.
    PairingStatus = 0x54,
}

/// Represents a HID++1.0 message.
///
/// The layout is `report_id | device_index | sub_id | address | payload`.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Hidpp1Message {
    /// The report type.
    pub report_type: ReportType,

    /// The index of the device involved in the communication.
    pub device_index: u8,

    /// The sub ID of the message.
    pub sub_id: u8,

    /// The register address.
    pub address: u8,

    /// The register value (3 bytes in short and 16 bytes in long reports).
    pub payload: HexList,
}

impl Hidpp1Message {
    /// Builds a register access request.
    ///
    /// Returns [`Error::InvalidArgument`] if `payload` exceeds the report.
    pub fn register_request(
        device_index: u8,
        access: RegisterAccess,
        address: u8,
        payload: &[u8],
    ) -> Result<Self> {
        let report_type = access.request_report_type();
        let capacity = report_type.length() - 4;
        if payload.len() > capacity {
            return Err(Error::InvalidArgument(format!(
                "{access:?} takes at most {capacity} payload bytes, got {}",
                payload.len()
            )));
        }

        let mut payload = HexList::from(payload);
        payload.pad_right(capacity, 0);

        Ok(Self {
            report_type,
            device_index,
            sub_id: access.into(),
            address,
            payload,
        })
    }

    /// Parses a short or long HID++ report.
    pub fn parse(report: &[u8]) -> Option<Self> {
        let report_type = match ReportType::from_report_id(*report.first()?)? {
            report_type @ (ReportType::Short | ReportType::Long) => report_type,
            _ => return None,
        };
        if report.len() < 4 {
            return None;
        }

        Some(Self {
            report_type,
            device_index: report[1],
            sub_id: report[2],
            address: report[3],
            payload: HexList::from(&report[4..]),
        })
    }

    /// Serializes the message, padded to the length of its report type.
    pub fn to_report(&self) -> HexList {
        let mut report = HexList::from([
            self.report_type.report_id(),
            self.device_index,
            self.sub_id,
            self.address,
        ]);
        report.extend_from(&self.payload);
        report.pad_right(self.report_type.length(), 0);

        report
    }
}

/// Represents the kind of a device connected through a receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive, Serialize)]
#[non_exhaustive]
#[repr(u8)]
pub enum DeviceKind {
    Unknown = 0x00,
    Keyboard = 0x01,
    Mouse = 0x02,
    Numpad = 0x03,
    Presenter = 0x04,
    Remote = 0x07,
    Trackball = 0x08,
    Touchpad = 0x09,
    Tablet = 0x0a,
    Gamepad = 0x0b,
    Joystick = 0x0c,
    Headset = 0x0d,
}

/// Contains the information of a device connection notification.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct DeviceConnection {
    /// The index of the device, used to address it through the receiver.
    pub device_index: u8,

    /// The kind of the device.
    pub kind: DeviceKind,

    /// Whether the link to the device is encrypted.
    pub encrypted: bool,

    /// Whether the device is currently reachable.
    pub online: bool,

    /// The wireless product ID of the device.
    pub wpid: u16,
}

/// A pairing notification sent by a receiver.
///
/// Both DJ reports and HID++1.0 notifications share the layout
/// `report_id | device_index | event_type | parameters`.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct PairingNotification {
    /// The report ID the notification arrived with.
    pub report_id: u8,

    /// The device index the notification refers to.
    pub device_index: u8,

    /// The raw event type.
    pub event_type: u8,

    /// The parameters following the event type.
    pub parameters: HexList,
}

impl PairingNotification {
    /// Parses a DJ report, or a HID++ report whose sub ID is a known
    /// [`NotificationType`].
    pub fn parse(report: &[u8]) -> Option<Self> {
        let report_id = *report.first()?;
        if report.len() < 3 {
            return None;
        }

        let is_dj = DJ_REPORT_IDS.contains(&report_id);
        let is_hidpp_notification = matches!(
            ReportType::from_report_id(report_id),
            Some(ReportType::Short | ReportType::Long)
        ) && NotificationType::try_from(report[2]).is_ok();
        if !is_dj && !is_hidpp_notification {
            return None;
        }

        Some(Self {
            report_id,
            device_index: report[1],
            event_type: report[2],
            parameters: HexList::from(&report[3..]),
        })
    }

    /// The known event type of the notification.
    pub fn notification_type(&self) -> Option<NotificationType> {
        NotificationType::try_from(self.event_type).ok()
    }

    /// Decodes a [`NotificationType::DeviceConnection`] notification.
    pub fn connection(&self) -> Option<DeviceConnection> {
        if self.notification_type() != Some(NotificationType::DeviceConnection)
            || self.parameters.len() < 4
        {
            return None;
        }

        let info = self.parameters[1];
        Some(DeviceConnection {
            device_index: self.device_index,
            kind: DeviceKind::try_from(info & 0x0f).ok()?,
            encrypted: info & (1 << 5) != 0,
            online: info & (1 << 6) == 0,
            wpid: u16::from_le_bytes([self.parameters[2], self.parameters[3]]),
        })
    }
}

/// The length of the register value in short reports.
pub const SHORT_REGISTER_LENGTH: usize = SHORT_REPORT_LENGTH - 4;

/// The length of the register value in long reports.
pub const LONG_REGISTER_LENGTH: usize = LONG_REPORT_LENGTH - 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_register_requests() -> Result<()> {
        let read = Hidpp1Message::register_request(0xff, RegisterAccess::GetRegister, 0x02, &[])?;
        assert_eq!(read.to_report().to_string(), "10FF8102000000");

        let write =
            Hidpp1Message::register_request(0xff, RegisterAccess::SetLongRegister, 0xc1, &[
                0x03, 0x02,
            ])?;
        assert_eq!(write.to_report().len(), LONG_REPORT_LENGTH);
        assert_eq!(write.payload.len(), LONG_REGISTER_LENGTH);

        assert!(matches!(
            Hidpp1Message::register_request(0xff, RegisterAccess::SetRegister, 0x02, &[0; 4]),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn parses_register_responses() {
        let response = Hidpp1Message::parse(&[0x10, 0xff, 0x81, 0x02, 0x00, 0x03, 0x00]);
        assert_eq!(
            response.map(|msg| (msg.sub_id, msg.address, msg.payload[1])),
            Some((0x81, 0x02, 0x03))
        );
        assert_eq!(Hidpp1Message::parse(&[0x12, 0xff, 0x81, 0x02]), None);
    }

    #[test]
    fn decodes_device_connections() {
        let notification =
            PairingNotification::parse(&[0x10, 0x02, 0x41, 0x10, 0x22, 0x8a, 0x40]).unwrap();
        assert_eq!(
            notification.notification_type(),
            Some(NotificationType::DeviceConnection)
        );
        assert_eq!(
            notification.connection(),
            Some(DeviceConnection {
                device_index: 2,
                kind: DeviceKind::Mouse,
                encrypted: true,
                online: true,
                wpid: 0x408a,
            })
        );

        let offline = PairingNotification::parse(&[0x41, 0x01, 0x41, 0x10, 0x41, 0x00, 0x00])
            .and_then(|notification| notification.connection());
        assert_eq!(offline.map(|conn| (conn.kind, conn.online)), Some((DeviceKind::Keyboard, false)));
    }

    #[test]
    fn ignores_regular_hidpp_reports() {
        assert_eq!(
            PairingNotification::parse(&[0x10, 0x01, 0x04, 0x51, 0x00, 0x00, 0x00]),
            None
        );
        assert!(PairingNotification::parse(&[0x42, 0x01, 0x03]).is_some());
    }
}
