//! Implements messaging across channels to a device.
//!
//! A [`Channel`] owns a [`Dispatcher`] receiving everything the device sends
//! and exposes request/response correlation on top of a raw send operation.
//! [`DeviceChannel`] talks to a HID interface directly, while
//! [`ThroughReceiverChannel`] reaches a device paired to a receiver through
//! the receiver's [`DeviceChannel`].

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    dispatcher::{Dispatcher, WhenBusy},
    error::{Error, Result},
    protocol::{
        Message,
        MessageClass,
        Protocol,
        ReportType,
        hidpp1::{Hidpp1Message, RegisterAccess},
        vlp::{self, HEADER_LENGTH, MAX_FRAME_PAYLOAD},
    },
};

mod device;
mod through_receiver;

pub use device::DeviceChannel;
pub use through_receiver::{PAIRING_SLOTS, ThroughReceiverChannel};

/// The device index addressing a device connected directly, or the receiver
/// itself.
pub const DIRECT_DEVICE_INDEX: u8 = 0xff;

/// How a device is reached.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransportKind {
    /// A wired USB connection.
    #[default]
    Usb,

    /// A Unifying or other eQuad receiver.
    Equad,

    /// Bluetooth Low Energy without a receiver.
    Ble,

    /// A BLE Pro (Bolt) receiver.
    BlePro,

    /// A USB connection with a fixed report layout.
    Ufy,
}

/// Uniquely identifies a channel within the process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocates a fresh ID.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Describes the transport a channel runs on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct TransportId {
    /// The USB vendor ID.
    pub vendor_id: u16,

    /// The USB product ID, if known.
    pub product_id: Option<u16>,

    /// The protocol spoken with the device.
    pub protocol: Protocol,

    /// How the device is reached.
    pub kind: TransportKind,
}

/// Options of a correlated send.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SendOptions {
    /// How long to wait for the response.
    pub timeout: Duration,

    /// What to do if every software ID is taken.
    pub when_busy: WhenBusy,
}

impl SendOptions {
    /// Waits up to `timeout` and fails with [`Error::Busy`] if no software ID
    /// is free.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            when_busy: WhenBusy::Fail,
        }
    }
}

/// Represents a channel to a single device.
///
/// Only [`Self::send_raw`] and the lifecycle methods are transport specific;
/// message serialization and request correlation are shared.
pub trait Channel: Send + Sync {
    /// The process-wide ID of the channel.
    fn id(&self) -> ChannelId;

    /// The device index outbound reports are addressed to.
    fn device_index(&self) -> u8;

    /// The dispatcher inbound reports of the device are routed through.
    fn dispatcher(&self) -> &Arc<Dispatcher>;

    /// Describes the underlying transport.
    fn transport_id(&self) -> TransportId;

    /// Whether the channel was opened and not closed since.
    fn is_open(&self) -> bool;

    /// Whether the channel is open and its transport did not fail.
    fn is_connected(&self) -> bool;

    /// Opens the channel. Opening an open channel does nothing.
    ///
    /// Channels are single-use: opening a closed channel returns
    /// [`Error::ChannelClosed`].
    fn open(&self) -> Result<()>;

    /// Closes the channel, resolving every pending request with
    /// [`Error::ChannelClosed`]. Closing a closed channel does nothing.
    fn close(&self);

    /// Whether the channel can send reports of the given type.
    fn supports(&self, report_type: ReportType) -> bool;

    /// Writes a raw report, blocking until the transport accepted it or
    /// `timeout` elapsed ([`Error::SendTimeout`]).
    fn send_raw(&self, report: &[u8], timeout: Duration) -> Result<()>;

    /// Sends a message without waiting for a response.
    ///
    /// VLP messages whose payload exceeds a single frame are split into
    /// consecutive frames.
    fn send_report(&self, message: &Message) -> Result<()> {
        let report_type = message.report_type().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "{} has no known report ID",
                message.class().name()
            ))
        })?;
        if !self.supports(report_type) {
            return Err(Error::ReportTypeNotSupported(report_type));
        }

        let report = message.to_report();
        let send_timeout = self.dispatcher().timeouts().send();
        trace!(channel = %self.id(), %report, "sending report");

        if report_type != ReportType::Vlp {
            return self.send_raw(&report, send_timeout);
        }

        let frames = report
            .len()
            .saturating_sub(HEADER_LENGTH)
            .div_ceil(MAX_FRAME_PAYLOAD)
            .max(1);
        let first_sequence = self.dispatcher().reserve_vlp_sequence(frames);
        for frame in vlp::fragment(&report, first_sequence)? {
            self.send_raw(&frame, send_timeout)?;
        }

        Ok(())
    }

    /// Sends a request and waits up to `timeout` for the response of class
    /// `expected`.
    fn send_report_wait_response(
        &self,
        request: Message,
        expected: &Arc<MessageClass>,
        timeout: Duration,
    ) -> Result<Message> {
        self.send_report_wait_response_with(request, expected, SendOptions::with_timeout(timeout))
    }

    /// Sends a request and waits for the response of class `expected`.
    ///
    /// HID++2.0 requests get a software ID no other pending request uses.
    /// Protocol errors answering the request are returned as
    /// [`Error::Hidpp`] or [`Error::Vlp`].
    fn send_report_wait_response_with(
        &self,
        mut request: Message,
        expected: &Arc<MessageClass>,
        options: SendOptions,
    ) -> Result<Message> {
        let dispatcher = self.dispatcher();
        let handle = dispatcher.register_request(&mut request, expected, options.when_busy)?;

        if let Err(err) = self.send_report(&request) {
            dispatcher.pending().abandon(handle);
            return Err(err);
        }

        dispatcher
            .pending()
            .wait(handle, options.timeout)?
            .into_message()
    }

    /// Accesses a HID++1.0 register of the device and waits up to `timeout`
    /// for the answer.
    fn send_register(
        &self,
        access: RegisterAccess,
        address: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Hidpp1Message> {
        let request =
            Hidpp1Message::register_request(self.device_index(), access, address, payload)?;
        if !self.supports(request.report_type) {
            return Err(Error::ReportTypeNotSupported(request.report_type));
        }

        let dispatcher = self.dispatcher();
        let handle = dispatcher.register_register_request(&request)?;
        let report = request.to_report();
        trace!(channel = %self.id(), %report, "sending register request");

        if let Err(err) = self.send_raw(&report, dispatcher.timeouts().send()) {
            dispatcher.pending().abandon(handle);
            return Err(err);
        }

        dispatcher.pending().wait(handle, timeout)?.into_register()
    }
}
