//! Per-run settings: which device to talk to, which feature versions to
//! assume and how long to wait for answers.
//!
//! Settings are read from TOML. Every key is optional and falls back to the
//! defaults below.

use std::{collections::HashSet, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    channel::TransportKind,
    error::{Error, Result},
    protocol::{Protocol, ReportType},
};

/// The vendor ID of Logitech.
pub const LOGITECH_VENDOR_ID: u16 = 0x046d;

/// Pins the version of a feature instead of using the one reported by the
/// device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct FeatureVersion {
    /// The protocol ID of the feature.
    pub feature_id: u16,

    /// The version whose model is used.
    pub version: u8,
}

/// Timeouts in milliseconds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Timeouts {
    /// The response timeout of short requests.
    #[serde(default = "default_short")]
    pub short: u64,

    /// The response timeout of long requests.
    #[serde(default = "default_long")]
    pub long: u64,

    /// The response timeout of very long requests and VLP transfers.
    #[serde(default = "default_very_long")]
    pub very_long: u64,

    /// How long to wait for an expected event.
    #[serde(default = "default_event_wait")]
    pub event_wait: u64,

    /// How long to wait for pairing notifications.
    #[serde(default = "default_pairing")]
    pub pairing: u64,

    /// How long the transport may take to accept a report.
    #[serde(default = "default_send")]
    pub send: u64,
}

fn default_short() -> u64 {
    500
}
fn default_long() -> u64 {
    1000
}
fn default_very_long() -> u64 {
    3000
}
fn default_event_wait() -> u64 {
    2000
}
fn default_pairing() -> u64 {
    30000
}
fn default_send() -> u64 {
    500
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            short: default_short(),
            long: default_long(),
            very_long: default_very_long(),
            event_wait: default_event_wait(),
            pairing: default_pairing(),
            send: default_send(),
        }
    }
}

impl Timeouts {
    /// The response timeout of a request sent with `report_type`.
    pub fn for_report(&self, report_type: ReportType) -> Duration {
        Duration::from_millis(match report_type {
            ReportType::Short => self.short,
            ReportType::Long => self.long,
            ReportType::VeryLong | ReportType::Vlp => self.very_long,
        })
    }

    /// The event wait timeout.
    pub fn event_wait(&self) -> Duration {
        Duration::from_millis(self.event_wait)
    }

    /// The pairing timeout.
    pub fn pairing(&self) -> Duration {
        Duration::from_millis(self.pairing)
    }

    /// The send timeout.
    pub fn send(&self) -> Duration {
        Duration::from_millis(self.send)
    }
}

/// Sizes the message queues of a dispatcher.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct QueueSettings {
    /// The capacity of every queue.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// How many milliseconds a full critical queue may block the receive
    /// worker before the new entry is dropped.
    #[serde(default = "default_block_timeout")]
    pub block_timeout: u64,
}

fn default_capacity() -> usize {
    1024
}
fn default_block_timeout() -> u64 {
    1000
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            block_timeout: default_block_timeout(),
        }
    }
}

impl QueueSettings {
    /// The block timeout of critical queues.
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout)
    }
}

/// The report IDs of plain HID input reports.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ReportIds {
    /// Keyboard input report IDs.
    #[serde(default = "default_keyboard")]
    pub keyboard: Vec<u8>,

    /// Mouse input report IDs.
    #[serde(default = "default_mouse")]
    pub mouse: Vec<u8>,

    /// Consumer control input report IDs.
    #[serde(default = "default_consumer")]
    pub consumer: Vec<u8>,
}

fn default_keyboard() -> Vec<u8> {
    vec![0x01]
}
fn default_mouse() -> Vec<u8> {
    vec![0x02]
}
fn default_consumer() -> Vec<u8> {
    vec![0x03]
}

impl Default for ReportIds {
    fn default() -> Self {
        Self {
            keyboard: default_keyboard(),
            mouse: default_mouse(),
            consumer: default_consumer(),
        }
    }
}

/// The settings of a run.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Settings {
    /// How the device is reached.
    #[serde(default)]
    pub transport: TransportKind,

    /// The USB vendor ID.
    #[serde(default = "default_vid")]
    pub vid: u16,

    /// The USB product ID. Any product of the vendor matches if unset.
    #[serde(default)]
    pub pid: Option<u16>,

    /// The wireless product ID of a device behind a receiver.
    #[serde(default)]
    pub tid: Option<u16>,

    /// The protocol spoken with the device.
    #[serde(default)]
    pub protocol: Protocol,

    /// Which of several matching HID interfaces to open.
    #[serde(default)]
    pub port_index: usize,

    /// The receiver slot of the device, for devices behind a receiver.
    #[serde(default)]
    pub device_index: Option<u8>,

    /// Feature versions used instead of the ones reported by the device.
    #[serde(default)]
    pub feature_versions: Vec<FeatureVersion>,

    /// Response and wait timeouts.
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Queue sizing.
    #[serde(default)]
    pub queues: QueueSettings,

    /// The report IDs of plain HID input reports.
    #[serde(default)]
    pub report_ids: ReportIds,
}

fn default_vid() -> u16 {
    LOGITECH_VENDOR_ID
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            vid: default_vid(),
            pid: None,
            tid: None,
            protocol: Protocol::default(),
            port_index: 0,
            device_index: None,
            feature_versions: Vec::new(),
            timeouts: Timeouts::default(),
            queues: QueueSettings::default(),
            report_ids: ReportIds::default(),
        }
    }
}

impl Settings {
    /// Parses and validates settings from TOML.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(src).map_err(|err| Error::Configuration(err.message().to_string()))?;
        settings.validate()?;

        Ok(settings)
    }

    /// Reads settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path).map_err(|err| {
            Error::Configuration(format!("cannot read {}: {err}", path.display()))
        })?;

        Self::from_toml_str(&src)
    }

    /// Checks the settings for values no channel can work with.
    pub fn validate(&self) -> Result<()> {
        if let Some(device_index) = self.device_index
            && !(1..=6).contains(&device_index)
        {
            return Err(Error::Configuration(format!(
                "device_index must be within 1..=6, got {device_index}"
            )));
        }

        let timeouts = &self.timeouts;
        if [
            timeouts.short,
            timeouts.long,
            timeouts.very_long,
            timeouts.event_wait,
            timeouts.pairing,
            timeouts.send,
        ]
        .contains(&0)
        {
            return Err(Error::Configuration("timeouts must not be zero".to_string()));
        }

        if self.queues.capacity == 0 {
            return Err(Error::Configuration(
                "queue capacity must not be zero".to_string(),
            ));
        }

        let mut feature_ids = HashSet::new();
        if let Some(duplicate) = self
            .feature_versions
            .iter()
            .find(|pinned| !feature_ids.insert(pinned.feature_id))
        {
            return Err(Error::Configuration(format!(
                "feature {:#06x} has more than one pinned version",
                duplicate.feature_id
            )));
        }

        let ids = &self.report_ids;
        let mut report_ids = HashSet::new();
        if let Some(reused) = ids
            .keyboard
            .iter()
            .chain(&ids.mouse)
            .chain(&ids.consumer)
            .find(|&&id| !report_ids.insert(id) || ReportType::from_report_id(id).is_some())
        {
            return Err(Error::Configuration(format!(
                "input report ID {reused:#04x} is used twice or collides with HID++"
            )));
        }

        Ok(())
    }

    /// The version pinned for `feature_id`, if any.
    pub fn feature_version(&self, feature_id: u16) -> Option<u8> {
        self.feature_versions
            .iter()
            .find(|pinned| pinned.feature_id == feature_id)
            .map(|pinned| pinned.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() -> Result<()> {
        let settings = Settings::from_toml_str("")?;
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.vid, 0x046d);
        assert_eq!(
            settings.timeouts.for_report(ReportType::Short),
            Duration::from_millis(500)
        );
        assert_eq!(settings.timeouts.pairing(), Duration::from_secs(30));
        Ok(())
    }

    #[test]
    fn parses_a_full_file() -> Result<()> {
        let settings = Settings::from_toml_str(
            r#"
            transport = "ble_pro"
            vid = 0x046d
            pid = 0xc548
            tid = 0x4099
            protocol = "vlp"
            device_index = 2

            [[feature_versions]]
            feature_id = 0x0007
            version = 0

            [timeouts]
            long = 1500

            [queues]
            capacity = 16

            [report_ids]
            mouse = [0x02, 0x05]
            "#,
        )?;

        assert_eq!(settings.transport, TransportKind::BlePro);
        assert_eq!(settings.protocol, Protocol::Vlp);
        assert_eq!(settings.tid, Some(0x4099));
        assert_eq!(settings.feature_version(0x0007), Some(0));
        assert_eq!(settings.feature_version(0x0001), None);
        assert_eq!(settings.timeouts.long, 1500);
        assert_eq!(settings.timeouts.short, 500);
        assert_eq!(settings.queues.capacity, 16);
        assert_eq!(settings.queues.block_timeout, 1000);
        assert_eq!(settings.report_ids.mouse, vec![0x02, 0x05]);
        assert_eq!(settings.report_ids.keyboard, vec![0x01]);
        Ok(())
    }

    #[test]
    fn rejects_inconsistent_values() {
        for src in [
            "device_index = 7",
            "[timeouts]\nshort = 0",
            "[queues]\ncapacity = 0",
            "[report_ids]\nkeyboard = [0x10]",
            "[report_ids]\nkeyboard = [0x02]",
            "[[feature_versions]]\nfeature_id = 1\nversion = 0\n[[feature_versions]]\nfeature_id = 1\nversion = 1",
            "transport = \"serial\"",
        ] {
            assert!(
                matches!(Settings::from_toml_str(src), Err(Error::Configuration(_))),
                "{src:?} was accepted"
            );
        }
    }
}
