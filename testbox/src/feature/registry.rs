//! Maintains the registry of feature models known to a dispatcher, along with
//! the names of well-known HID++2.0 features.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use lazy_static::lazy_static;
use tracing::debug;

use super::{FeatureModel, device_friendly_name, feature_set, root, vlp_root};
use crate::{
    dispatcher::QueueKind,
    error::{Error, Result},
    protocol::Protocol,
};

lazy_static! {
    static ref KNOWN_FEATURE_NAMES: HashMap<u16, &'static str> = HashMap::from([
        (0x0000, "Root"),
        (0x0001, "FeatureSet"),
        (0x0002, "FeatureInfo"),
        (0x0003, "DeviceInformation"),
        (0x0004, "UnitId"),
        (0x0005, "DeviceTypeAndName"),
        (0x0006, "DeviceGroups"),
        (0x0007, "DeviceFriendlyName"),
        (0x0008, "KeepAlive"),
        (0x0020, "ConfigChange"),
        (0x0021, "UniqueRandomId"),
        (0x0030, "TargetSoftware"),
        (0x0080, "WirelessSignalStrength"),
        (0x00c0, "DfuControlLegacy"),
        (0x00c1, "DfuControlUnsigned"),
        (0x00c2, "DfuControlSigned"),
        (0x00c3, "DfuControl"),
        (0x00d0, "Dfu"),
        (0x1000, "BatteryStatus"),
        (0x1001, "BatteryVoltage"),
        (0x1004, "UnifiedBattery"),
        (0x1010, "ChargingControl"),
        (0x1300, "LedControl"),
        (0x1800, "GenericTest"),
        (0x1802, "DeviceReset"),
        (0x1805, "OobState"),
        (0x1806, "ConfigDeviceProps"),
        (0x1814, "ChangeHost"),
        (0x1815, "HostsInfo"),
        (0x1981, "Backlight1"),
        (0x1982, "Backlight2"),
        (0x1983, "Backlight3"),
        (0x1990, "Illumination"),
        (0x1a00, "PresenterControl"),
        (0x1a01, "Sensor3D"),
        (0x1b00, "ReprogControls"),
        (0x1b01, "ReprogControls2"),
        (0x1b02, "ReprogControls3"),
        (0x1b03, "ReprogControls4"),
        (0x1b04, "ReprogControls5"),
        (0x1bc0, "ReportHidUsages"),
        (0x1c00, "PersistentRemappableAction"),
        (0x1d4b, "WirelessDeviceStatus"),
        (0x1df0, "RemainingPairings"),
        (0x1f1f, "FirmwareProperties"),
        (0x1f20, "AdcMeasurement"),
        (0x2001, "SwapLeftRightButton"),
        (0x2005, "ButtonSwapCancel"),
        (0x2006, "PointerAxesOrientation"),
        (0x2100, "VerticalScrolling"),
        (0x2110, "SmartShiftWheel"),
        (0x2111, "SmartShiftWheelEnhanced"),
        (0x2120, "HighResolutionScrolling"),
        (0x2121, "HiResWheel"),
        (0x2130, "RatchetWheel"),
        (0x2150, "Thumbwheel"),
        (0x2200, "MousePointer"),
        (0x2201, "AdjustableDpi"),
        (0x2202, "ExtendedAdjustableDpi"),
        (0x2205, "PointerMotionScaling"),
        (0x2230, "SensorAngleSnapping"),
        (0x2240, "SurfaceTuning"),
        (0x2250, "XyStats"),
        (0x2251, "WheelStats"),
        (0x2400, "HybridTrackingEngine"),
        (0x40a0, "FnInversion"),
        (0x40a2, "FnInversionWithDefaultState"),
        (0x40a3, "FnInversionForMultiHostDevices"),
        (0x4100, "Encryption"),
        (0x4220, "LockKeyState"),
        (0x4301, "SolarKeyboardDashboard"),
        (0x4520, "KeyboardLayout"),
        (0x4521, "DisableKeys"),
        (0x4522, "DisableKeysByUsage"),
        (0x4530, "DualPlatform"),
        (0x4531, "MultiPlatform"),
        (0x4540, "KeyboardInternationalLayouts"),
        (0x4600, "Crown"),
        (0x6010, "TouchpadFwItems"),
        (0x6011, "TouchpadSwItems"),
        (0x6012, "TouchpadWin8FwItems"),
        (0x6020, "TapEnable"),
        (0x6021, "TapEnableExtended"),
        (0x6030, "CursorBallistic"),
        (0x6040, "TouchpadResolutionDivider"),
        (0x6100, "TouchpadRawXy"),
        (0x6110, "TouchMouseRawTouchPoints"),
        (0x6120, "BtTouchMouseSettings"),
        (0x6500, "Gestures1"),
        (0x6501, "Gestures2"),
        (0x8010, "GamingGKeys"),
        (0x8020, "GamingMKeys"),
        (0x8030, "MacroRecord"),
        (0x8040, "BrightnessControl"),
        (0x8060, "AdjustableReportRate"),
        (0x8061, "ExtendedAdjustableReportRate"),
        (0x8070, "ColorLedEffects"),
        (0x8071, "RgbEffects"),
        (0x8080, "PerKeyLighting"),
        (0x8081, "PerKeyLighting2"),
        (0x8090, "ModeStatus"),
        (0x8100, "OnboardProfiles"),
        (0x8110, "MouseButtonFilter"),
        (0x8111, "LatencyMonitoring"),
        (0x8120, "GamingAttachments"),
        (0x8123, "ForceFeedback"),
        (0x8300, "Sidetone"),
        (0x8310, "Equalizer"),
        (0x8320, "HeadsetOut"),
    ]);
}

/// Looks up the name of a well-known HID++2.0 feature by its ID.
pub fn feature_name(feature_id: u16) -> Option<&'static str> {
    KNOWN_FEATURE_NAMES.get(&feature_id).copied()
}

/// The category queue of a feature without an explicit one.
///
/// Root and FeatureSet are [`QueueKind::Important`]; everything else is
/// derived from the range the feature ID lies in.
pub fn default_category(feature_id: u16) -> QueueKind {
    match feature_id {
        0x0000 | 0x0001 => QueueKind::Important,
        0x0002..=0x0fff => QueueKind::Common,
        0x1000..=0x1fff => QueueKind::Peripheral,
        0x2000..=0x3fff => QueueKind::Mouse,
        0x4000..=0x5fff => QueueKind::Keyboard,
        0x6000..=0x7fff => QueueKind::Touchpad,
        0x8000..=0x8fff => QueueKind::Gaming,
        _ => QueueKind::Common,
    }
}

/// An immutable map from `(protocol, feature ID, version)` to feature models.
///
/// Build one with [`FeatureRegistry::builder`] and share it between
/// dispatchers through an [`Arc`].
#[derive(Debug, Default)]
pub struct FeatureRegistry {
    models: HashMap<(Protocol, u16), BTreeMap<u8, Arc<FeatureModel>>>,
}

impl FeatureRegistry {
    /// Starts an empty registry.
    pub fn builder() -> FeatureRegistryBuilder {
        FeatureRegistryBuilder::default()
    }

    /// Creates a registry holding the models the framework itself relies on:
    /// Root, FeatureSet, DeviceFriendlyName and the VLP root feature.
    pub fn with_defaults() -> Result<Self> {
        Ok(Self::builder().register_defaults()?.build())
    }

    /// Looks up the model of an exact feature version.
    pub fn lookup(
        &self,
        protocol: Protocol,
        feature_id: u16,
        version: u8,
    ) -> Option<&Arc<FeatureModel>> {
        self.models.get(&(protocol, feature_id))?.get(&version)
    }

    /// Looks up the newest model not newer than `version`.
    ///
    /// Feature versions are backwards compatible, so a model describing an
    /// older version still talks correctly to a newer implementation.
    pub fn lookup_compatible(
        &self,
        protocol: Protocol,
        feature_id: u16,
        version: u8,
    ) -> Option<&Arc<FeatureModel>> {
        self.models
            .get(&(protocol, feature_id))?
            .range(..=version)
            .next_back()
            .map(|(_, model)| model)
    }

    /// The registered versions of a feature, in ascending order.
    pub fn versions(&self, protocol: Protocol, feature_id: u16) -> Vec<u8> {
        self.models
            .get(&(protocol, feature_id))
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// All registered models.
    pub fn models(&self) -> impl Iterator<Item = &Arc<FeatureModel>> {
        self.models.values().flat_map(BTreeMap::values)
    }

    /// The number of registered models.
    pub fn len(&self) -> usize {
        self.models.values().map(BTreeMap::len).sum()
    }

    /// Whether no model is registered.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Collects feature models into a [`FeatureRegistry`].
#[derive(Debug, Default)]
pub struct FeatureRegistryBuilder {
    models: HashMap<(Protocol, u16), BTreeMap<u8, Arc<FeatureModel>>>,
}

impl FeatureRegistryBuilder {
    /// Adds a model.
    ///
    /// Returns [`Error::Configuration`] if a model of the same protocol,
    /// feature ID and version was registered before.
    pub fn register(mut self, model: FeatureModel) -> Result<Self> {
        let versions = self
            .models
            .entry((model.protocol(), model.feature_id()))
            .or_default();

        if versions.contains_key(&model.version()) {
            debug!(model = %model, "feature model registered twice");
            return Err(Error::Configuration(format!(
                "{model} is already registered"
            )));
        }

        versions.insert(model.version(), Arc::new(model));
        Ok(self)
    }

    /// Adds the models of [`FeatureRegistry::with_defaults`].
    pub fn register_defaults(self) -> Result<Self> {
        root::models()?
            .into_iter()
            .chain(feature_set::models()?)
            .chain(device_friendly_name::models()?)
            .chain(vlp_root::models()?)
            .try_fold(self, Self::register)
    }

    /// Finishes the registry.
    pub fn build(self) -> FeatureRegistry {
        FeatureRegistry {
            models: self.models,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knows_feature_names() {
        assert_eq!(feature_name(0x0007), Some("DeviceFriendlyName"));
        assert_eq!(feature_name(0x1d4b), Some("WirelessDeviceStatus"));
        assert_eq!(feature_name(0xfffe), None);
    }

    #[test]
    fn derives_categories_from_ids() {
        assert_eq!(default_category(0x0001), QueueKind::Important);
        assert_eq!(default_category(0x0007), QueueKind::Common);
        assert_eq!(default_category(0x1004), QueueKind::Peripheral);
        assert_eq!(default_category(0x2201), QueueKind::Mouse);
        assert_eq!(default_category(0x40a3), QueueKind::Keyboard);
        assert_eq!(default_category(0x6100), QueueKind::Touchpad);
        assert_eq!(default_category(0x8071), QueueKind::Gaming);
    }

    #[test]
    fn defaults_cover_the_core_features() -> Result<()> {
        let registry = FeatureRegistry::with_defaults()?;
        assert_eq!(registry.versions(Protocol::Hidpp, 0x0000), vec![0, 1, 2]);
        assert_eq!(registry.versions(Protocol::Hidpp, 0x0001), vec![0, 1, 2]);
        assert!(registry.lookup(Protocol::Hidpp, 0x0007, 0).is_some());
        assert!(registry.lookup(Protocol::Vlp, 0x0000, 0).is_some());
        assert!(registry.lookup(Protocol::Vlp, 0x0007, 0).is_none());
        Ok(())
    }

    #[test]
    fn compatible_lookup_picks_newest_older_model() -> Result<()> {
        let registry = FeatureRegistry::with_defaults()?;
        let model = registry.lookup_compatible(Protocol::Hidpp, 0x0000, 9);
        assert_eq!(model.map(|model| model.version()), Some(2));

        let model = registry.lookup_compatible(Protocol::Hidpp, 0x0007, 3);
        assert_eq!(model.map(|model| model.version()), Some(0));
        Ok(())
    }

    #[test]
    fn rejects_duplicates() -> Result<()> {
        let builder = FeatureRegistry::builder().register_defaults()?;
        let duplicate = root::models()?.into_iter().next();
        assert!(matches!(
            duplicate.map(|model| builder.register(model)),
            Some(Err(Error::Configuration(_)))
        ));
        Ok(())
    }
}
