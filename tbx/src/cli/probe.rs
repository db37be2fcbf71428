use std::{
    io::{BufWriter, Write},
    sync::Arc,
};

use anyhow::Result;
use clap::Args;
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;
use testbox::{
    channel::{Channel, TransportId},
    feature::{
        FeatureInformation,
        device_friendly_name::{self, DeviceFriendlyNameFeature},
        feature_set::FeatureSetFeature,
        registry::feature_name,
        root::{ProtocolVersion, RootFeature},
        vlp_root::{VlpFeatureInformation, VlpRootFeature},
    },
    protocol::Protocol,
    settings::Settings,
};

use super::{Cli, open_channel, parse_hex_u16};

/// The byte Root.GetProtocolVersion is asked to echo.
const PING_DATA: u8 = 0x5a;

/// Detect and view general information about the configured device.
#[derive(Args)]
pub struct ProbeCommand {
    /// Also look up the given feature ID (hex); the only way to find VLP
    /// features
    #[arg(short, long = "feature", value_parser = parse_hex_u16)]
    features: Vec<u16>,
}

impl ProbeCommand {
    pub fn execute(&self, root: &Cli, settings: &Settings) -> Result<()> {
        let chan = open_channel(settings)?;
        let probed = match settings.protocol {
            Protocol::Vlp => self.probe_vlp(&chan),
            Protocol::Hidpp => self.probe_hidpp(&chan),
        };
        chan.close();
        let probed = probed?;

        let mut stdout = BufWriter::new(anstream::stdout());

        if root.json {
            writeln!(stdout, "{}", json!(probed))?;
            stdout.flush()?;
            return Ok(());
        }

        writeln!(
            stdout,
            "{} ({:#06x}:{}) via {:?}",
            probed.friendly_name.as_deref().unwrap_or("Unnamed device"),
            probed.transport.vendor_id.bright_black(),
            probed
                .transport
                .product_id
                .map_or("*".to_string(), |pid| format!("{pid:#06x}"))
                .bright_black(),
            probed.transport.kind.green(),
        )?;

        if let Some(version) = probed.protocol_version {
            writeln!(
                stdout,
                " ├─ PROTOCOL: HID++ {}.{}",
                version.protocol_number.blue(),
                version.target_software.blue()
            )?;
        }
        writeln!(stdout, " │")?;

        let features = probed.features;
        if features.is_empty() {
            writeln!(
                stdout,
                " ╰─ {}",
                "No features were found.".bright_black().italic()
            )?;
            stdout.flush()?;
            return Ok(());
        }

        let features_len = features.len();
        for (feature_i, feature) in features.into_iter().enumerate() {
            writeln!(
                stdout,
                "{} {}: {:#06x} {} v{}{}",
                if feature_i == features_len - 1 {
                    " ╰─"
                } else {
                    " ├─"
                },
                format!("{:>3}", feature.index).bright_blue(),
                feature.feature_id,
                feature.name.unwrap_or("Unknown"),
                feature.version.bright_black(),
                if feature.hidden {
                    " (hidden)".bright_black().italic().to_string()
                } else {
                    String::new()
                },
            )?;
        }

        stdout.flush()?;

        Ok(())
    }

    fn probe_hidpp(&self, chan: &Arc<dyn Channel>) -> Result<ProbedDevice> {
        let root = RootFeature::new(Arc::clone(chan))?;
        let protocol_version = root.get_protocol_version(PING_DATA)?;

        let mut features = FeatureSetFeature::resolve(chan)?.enumerate()?;
        for &feature_id in &self.features {
            if features.iter().all(|info| info.feature_id != feature_id)
                && let Some(info) = root.get_feature(feature_id)?
            {
                features.push(info);
            }
        }
        features.sort_by_key(|info| info.index);

        let friendly_name = if features
            .iter()
            .any(|info| info.feature_id == device_friendly_name::ID)
        {
            Some(DeviceFriendlyNameFeature::resolve(chan)?.get_whole_friendly_name()?)
        } else {
            None
        };

        Ok(ProbedDevice {
            transport: chan.transport_id(),
            protocol_version: Some(protocol_version),
            friendly_name,
            features: features.into_iter().map(ProbedFeature::from).collect(),
        })
    }

    fn probe_vlp(&self, chan: &Arc<dyn Channel>) -> Result<ProbedDevice> {
        let root = VlpRootFeature::new(Arc::clone(chan))?;

        let mut features = Vec::with_capacity(self.features.len());
        for &feature_id in &self.features {
            if let Some(info) = root.get_feature_index(feature_id)? {
                features.push(ProbedFeature::from(info));
            }
        }
        features.sort_by_key(|feature| feature.index);

        Ok(ProbedDevice {
            transport: chan.transport_id(),
            protocol_version: None,
            friendly_name: None,
            features,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
struct ProbedDevice {
    transport: TransportId,

    #[serde(skip_serializing_if = "Option::is_none")]
    protocol_version: Option<ProtocolVersion>,

    #[serde(skip_serializing_if = "Option::is_none")]
    friendly_name: Option<String>,

    features: Vec<ProbedFeature>,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
struct ProbedFeature {
    index: u8,
    feature_id: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'static str>,

    version: u8,
    hidden: bool,
}

impl From<FeatureInformation> for ProbedFeature {
    fn from(info: FeatureInformation) -> Self {
        Self {
            index: info.index,
            feature_id: info.feature_id,
            name: feature_name(info.feature_id),
            version: info.version,
            hidden: info.typ.hidden,
        }
    }
}

impl From<VlpFeatureInformation> for ProbedFeature {
    fn from(info: VlpFeatureInformation) -> Self {
        Self {
            index: info.index,
            feature_id: info.feature_id,
            name: None,
            version: info.version,
            hidden: info.hidden,
        }
    }
}
