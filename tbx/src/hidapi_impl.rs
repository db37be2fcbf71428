//! Implements HID communication using the `hidapi` crate.

use std::{
    ffi::{CStr, CString},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use hidapi::{DeviceInfo, HidApi, HidDevice, HidError};
use itertools::Itertools;
use serde::Serialize;
use testbox::{
    channel::{Channel, DIRECT_DEVICE_INDEX, DeviceChannel, ThroughReceiverChannel},
    feature::FeatureRegistry,
    protocol::ReportType,
    settings::Settings,
    transport::{self, RawHidChannel, TransportError},
};
use tracing::debug;

/// A HID interface opened twice, so the receive worker never holds up
/// writes.
struct HidapiDevice {
    reader: Mutex<HidDevice>,
    writer: Mutex<HidDevice>,
    vendor_id: u16,
    product_id: u16,
}

fn io_error(err: HidError) -> TransportError {
    TransportError::Io(err.to_string())
}

impl RawHidChannel for HidapiDevice {
    // hidapi writes block without a timeout.
    fn write_report(&self, src: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(src)
            .map_err(io_error)
    }

    fn read_report(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read_timeout(buf, millis)
            .map_err(io_error)
    }

    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> Option<u16> {
        Some(self.product_id)
    }

    fn supported_reports(&self) -> Option<Vec<ReportType>> {
        None
    }

    fn get_report_descriptor(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_report_descriptor(buf)
            .map_err(io_error)
    }
}

/// A HID interface matching the vendor and product ID of the settings.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct Interface {
    #[serde(skip)]
    path: CString,

    /// The platform-specific path of the interface.
    pub path_display: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface_number: i32,
    pub product: Option<String>,
    pub serial_number: Option<String>,

    /// The HID++ and VLP report types declared by the report descriptor.
    pub reports: Vec<ReportType>,
}

impl Interface {
    fn from_info(api: &HidApi, info: &DeviceInfo) -> Self {
        // Interfaces we cannot open or parse simply declare no reports.
        let reports = HidapiDevice::open(api, info.path(), info.vendor_id(), info.product_id())
            .ok()
            .and_then(|device| transport::supported_reports(&device).ok())
            .unwrap_or_default();

        Self {
            path: info.path().to_owned(),
            path_display: info.path().to_string_lossy().into_owned(),
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            interface_number: info.interface_number(),
            product: info.product_string().map(str::to_string),
            serial_number: info.serial_number().map(str::to_string),
            reports,
        }
    }

    /// Whether the interface carries HID++ or VLP traffic.
    pub fn is_hidpp(&self) -> bool {
        !self.reports.is_empty()
    }
}

impl HidapiDevice {
    fn open(api: &HidApi, path: &CStr, vendor_id: u16, product_id: u16) -> Result<Self, HidError> {
        Ok(Self {
            reader: Mutex::new(api.open_path(path)?),
            writer: Mutex::new(api.open_path(path)?),
            vendor_id,
            product_id,
        })
    }
}

/// Lists the HID interfaces matching the vendor and product ID of
/// `settings`.
///
/// hidapi returns one entry per usage of every interface, so entries are
/// deduplicated by path.
pub fn enumerate(api: &HidApi, settings: &Settings) -> Vec<Interface> {
    api
        .device_list()
        .filter(|info| info.vendor_id() == settings.vid)
        .filter(|info| settings.pid.is_none_or(|pid| info.product_id() == pid))
        .unique_by(|info| info.path().to_owned())
        .map(|info| Interface::from_info(api, info))
        .sorted_by(|a, b| a.path.cmp(&b.path))
        .collect()
}

/// Opens the channel described by `settings`.
///
/// The interface is the `port_index`-th HID++ capable one. If the settings
/// name a `device_index`, the interface is treated as a receiver and the
/// returned channel reaches the device paired at that index.
pub fn open(
    api: &HidApi,
    settings: &Settings,
    registry: Arc<FeatureRegistry>,
) -> Result<Arc<dyn Channel>> {
    let interface = enumerate(api, settings)
        .into_iter()
        .filter(Interface::is_hidpp)
        .nth(settings.port_index)
        .ok_or_else(|| {
            anyhow!(
                "no HID++ interface #{} found for {:#06x}:{}",
                settings.port_index,
                settings.vid,
                settings
                    .pid
                    .map_or("*".to_string(), |pid| format!("{pid:#06x}"))
            )
        })?;
    debug!(path = %interface.path_display, "opening interface");

    let device = HidapiDevice::open(
        api,
        &interface.path,
        interface.vendor_id,
        interface.product_id,
    )
    .context("could not open the interface")?;

    let Some(device_index) = settings.device_index else {
        let chan = DeviceChannel::new(device, DIRECT_DEVICE_INDEX, registry, settings);
        chan.open().context("could not open the device channel")?;
        return Ok(Arc::new(chan));
    };

    let receiver = Arc::new(DeviceChannel::new(
        device,
        DIRECT_DEVICE_INDEX,
        registry,
        settings,
    ));
    receiver
        .open()
        .context("could not open the receiver channel")?;

    let chan = ThroughReceiverChannel::new(&receiver, device_index)?;
    chan.open()
        .with_context(|| format!("could not reach the device paired at {device_index}"))?;

    Ok(Arc::new(chan))
}
