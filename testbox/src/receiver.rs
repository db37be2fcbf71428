//! Implements receiver-level HID++1.0 register access, including pairing.
//!
//! Receivers expose their pairing state through registers rather than
//! features. Connection notifications of paired devices arrive on the
//! [`QueueKind::Pairing`] queue of the receiver channel.

use std::{sync::Arc, time::Duration};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use tracing::debug;

use crate::{
    channel::{Channel, DIRECT_DEVICE_INDEX, PAIRING_SLOTS},
    dispatcher::QueueKind,
    error::{Error, Result},
    protocol::hidpp1::{DeviceConnection, DeviceKind, Hidpp1Message, RegisterAccess},
};

/// The index to use when communicating with the receiver itself.
pub const RECEIVER_DEVICE_INDEX: u8 = DIRECT_DEVICE_INDEX;

/// Represents the known registers of a receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive, Serialize)]
#[non_exhaustive]
#[repr(u8)]
pub enum ReceiverRegister {
    /// Provides the amount of paired devices and triggers arrival
    /// notifications.
    Connections = 0x02,

    /// Opens and closes the pairing lock.
    DeviceConnection = 0xb2,

    /// Provides information about the receiver and paired devices, selected
    /// by a sub-register.
    ReceiverInfo = 0xb5,

    /// Provides pairing and unpairing support.
    Pairing = 0xc1,
}

/// The sub-register of [`ReceiverRegister::ReceiverInfo`] holding the pairing
/// information of device `N` at `0x5N`.
const DEVICE_PAIRING_INFORMATION: u8 = 0x50;

/// The pairing information a receiver stores for a device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct DevicePairingInformation {
    /// The wireless product ID.
    pub wpid: u16,

    /// The kind of device.
    pub kind: DeviceKind,

    /// Whether the link is encrypted.
    pub encrypted: bool,

    /// Whether the device is currently connected.
    pub online: bool,

    /// The unit ID of the device.
    pub unit_id: [u8; 4],
}

/// Implements register access to a receiver reached through a channel at
/// [`RECEIVER_DEVICE_INDEX`].
#[derive(Clone)]
pub struct Receiver {
    chan: Arc<dyn Channel>,
}

impl Receiver {
    /// Wraps the channel of a receiver.
    ///
    /// Returns [`Error::InvalidArgument`] if the channel addresses a paired
    /// device instead of the receiver.
    pub fn new(chan: Arc<dyn Channel>) -> Result<Self> {
        if chan.device_index() != RECEIVER_DEVICE_INDEX {
            return Err(Error::InvalidArgument(format!(
                "receivers are addressed at {RECEIVER_DEVICE_INDEX:#04x}, not {:#04x}",
                chan.device_index()
            )));
        }

        Ok(Self { chan })
    }

    /// The channel of the receiver.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.chan
    }

    fn access(
        &self,
        access: RegisterAccess,
        register: ReceiverRegister,
        payload: &[u8],
    ) -> Result<Hidpp1Message> {
        let timeout = self
            .chan
            .dispatcher()
            .timeouts()
            .for_report(access.request_report_type());

        self.chan
            .send_register(access, register.into(), payload, timeout)
    }

    /// Counts the devices paired to the receiver, whether they are online or
    /// not.
    pub fn count_pairings(&self) -> Result<u8> {
        let response = self.access(
            RegisterAccess::GetRegister,
            ReceiverRegister::Connections,
            &[],
        )?;

        response.payload.get(1).copied().ok_or(Error::Truncated {
            required: 2,
            actual: response.payload.len(),
        })
    }

    /// Makes the receiver send a connection notification for every paired
    /// device.
    ///
    /// The receiver answers the register write only after sending all
    /// notifications, so they are queued once this returns.
    pub fn trigger_device_arrival(&self) -> Result<()> {
        self.access(
            RegisterAccess::SetRegister,
            ReceiverRegister::Connections,
            &[0x02, 0x00, 0x00],
        )?;

        Ok(())
    }

    /// Collects the connection information of all paired devices by calling
    /// [`Self::trigger_device_arrival`] and draining the connection
    /// notifications it caused from the pairing queue.
    ///
    /// Other pairing notifications stay queued.
    pub fn collect_paired_devices(&self) -> Result<Vec<DeviceConnection>> {
        self.trigger_device_arrival()?;

        let queue = self.chan.dispatcher().queue(QueueKind::Pairing);
        let mut devices = Vec::new();
        while let Ok(entry) = queue.get_first(Duration::ZERO, |entry| {
            entry
                .message
                .as_pairing()
                .and_then(|notification| notification.connection())
                .is_some()
        }) {
            if let Some(connection) = entry
                .message
                .as_pairing()
                .and_then(|notification| notification.connection())
            {
                devices.push(connection);
            }
        }

        debug!(count = devices.len(), "collected paired devices");
        Ok(devices)
    }

    /// Reads the pairing information of the device paired at `device_index`.
    pub fn get_device_pairing_information(
        &self,
        device_index: u8,
    ) -> Result<DevicePairingInformation> {
        Self::check_slot(device_index)?;

        let response = self.access(
            RegisterAccess::GetLongRegister,
            ReceiverRegister::ReceiverInfo,
            &[DEVICE_PAIRING_INFORMATION | device_index, 0x00, 0x00],
        )?;
        let payload = &response.payload;
        if payload.len() < 8 {
            return Err(Error::Truncated {
                required: 8,
                actual: payload.len(),
            });
        }

        Ok(DevicePairingInformation {
            wpid: u16::from_le_bytes([payload[2], payload[3]]),
            kind: DeviceKind::try_from(payload[1] & 0x0f).map_err(|_| {
                Error::UnexpectedResponse(format!("unknown device kind {:#04x}", payload[1]))
            })?,
            encrypted: payload[1] & (1 << 5) != 0,
            online: payload[1] & (1 << 6) == 0,
            unit_id: [payload[4], payload[5], payload[6], payload[7]],
        })
    }

    /// Unpairs the device at `device_index`.
    pub fn unpair_device(&self, device_index: u8) -> Result<()> {
        Self::check_slot(device_index)?;

        self.access(
            RegisterAccess::SetLongRegister,
            ReceiverRegister::Pairing,
            &[0x03, device_index],
        )?;

        Ok(())
    }

    /// Opens the pairing lock for `timeout_s` seconds, letting a new device
    /// pair. A timeout of `0` keeps the receiver's default.
    pub fn open_pairing_lock(&self, timeout_s: u8) -> Result<()> {
        self.access(
            RegisterAccess::SetRegister,
            ReceiverRegister::DeviceConnection,
            &[0x01, 0x00, timeout_s],
        )?;

        Ok(())
    }

    /// Closes the pairing lock.
    pub fn close_pairing_lock(&self) -> Result<()> {
        self.access(
            RegisterAccess::SetRegister,
            ReceiverRegister::DeviceConnection,
            &[0x02, 0x00, 0x00],
        )?;

        Ok(())
    }

    fn check_slot(device_index: u8) -> Result<()> {
        if PAIRING_SLOTS.contains(&device_index) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "no pairing slot {device_index}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::DeviceChannel,
        error::Hidpp1Error,
        feature::FeatureRegistry,
        hexlist::HexList,
        protocol::hidpp1::NotificationType,
        settings::Settings,
        transport::mock::MockTransport,
    };

    fn receiver(transport: &MockTransport) -> Result<Receiver> {
        let chan = DeviceChannel::new(
            transport.clone(),
            RECEIVER_DEVICE_INDEX,
            Arc::new(FeatureRegistry::with_defaults()?),
            &Settings::default(),
        );
        chan.open()?;

        Receiver::new(Arc::new(chan))
    }

    fn hex(src: &str) -> HexList {
        HexList::from_hex(src).expect("valid hex")
    }

    #[test]
    fn counts_pairings() -> Result<()> {
        let transport = MockTransport::new();
        transport.respond_with(|report| match report {
            [0x10, 0xff, 0x81, 0x02, ..] => vec![hex("10FF8102000200")],
            _ => Vec::new(),
        });

        assert_eq!(receiver(&transport)?.count_pairings()?, 2);
        assert_eq!(transport.write_history(), vec![hex("10FF8102000000")]);
        Ok(())
    }

    #[test]
    fn collects_paired_devices() -> Result<()> {
        let transport = MockTransport::new();
        transport.respond_with(|report| match report {
            [0x10, 0xff, 0x80, 0x02, 0x02, ..] => vec![
                hex("10015400000000"),
                hex("10014100024010"),
                hex("10024100E1B240"),
                hex("10FF8002000000"),
            ],
            _ => Vec::new(),
        });
        let receiver = receiver(&transport)?;

        let devices = receiver.collect_paired_devices()?;
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_index, 1);
        assert_eq!(devices[0].kind, DeviceKind::Mouse);
        assert_eq!(devices[0].wpid, 0x1040);
        assert!(devices[0].online);
        assert!(devices[1].encrypted);
        assert!(!devices[1].online);

        let status = receiver
            .channel()
            .dispatcher()
            .queue(QueueKind::Pairing)
            .try_get()
            .and_then(|entry| entry.message.as_pairing().cloned());
        assert_eq!(
            status.and_then(|status| status.notification_type()),
            Some(NotificationType::PairingStatus)
        );
        Ok(())
    }

    #[test]
    fn rejects_invalid_slots() -> Result<()> {
        let transport = MockTransport::new();
        let receiver = receiver(&transport)?;

        assert!(matches!(receiver.unpair_device(0), Err(Error::InvalidArgument(_))));
        assert_eq!(
            receiver.unpair_device(7),
            Err(Error::InvalidArgument("no pairing slot 7".to_string()))
        );
        Ok(())
    }

    #[test]
    fn unpair_errors_resolve_the_request() -> Result<()> {
        let transport = MockTransport::new();
        transport.respond_with(|report| match report {
            [0x11, 0xff, 0x82, 0xc1, 0x03, 0x05, ..] => vec![hex("10FF8F82C10300")],
            _ => Vec::new(),
        });
        let receiver = receiver(&transport)?;

        assert_eq!(
            receiver.unpair_device(5),
            Err(Error::Hidpp1(Hidpp1Error {
                device_index: 0xff,
                sub_id: 0x82,
                address: 0xc1,
                error_code: 0x03,
            }))
        );
        Ok(())
    }

    #[test]
    fn decodes_pairing_information() -> Result<()> {
        let transport = MockTransport::new();
        transport.respond_with(|report| match report {
            [0x10, 0xff, 0x83, 0xb5, 0x52, ..] => {
                vec![hex("11FF83B552224099DEADBEEF0000000000000000")]
            },
            _ => Vec::new(),
        });

        let info = receiver(&transport)?.get_device_pairing_information(2)?;
        assert_eq!(info.wpid, 0x9940);
        assert_eq!(info.kind, DeviceKind::Mouse);
        assert!(info.encrypted);
        assert_eq!(info.unit_id, [0xde, 0xad, 0xbe, 0xef]);
        Ok(())
    }

    #[test]
    fn rejects_device_channels() -> Result<()> {
        let chan = DeviceChannel::new(
            MockTransport::new(),
            1,
            Arc::new(FeatureRegistry::with_defaults()?),
            &Settings::default(),
        );

        assert!(matches!(
            Receiver::new(Arc::new(chan)),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }
}
