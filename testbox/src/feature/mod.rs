//! Describes HID++2.0 and VLP features and implements typed facades for the
//! features the framework relies on.
//!
//! A [`FeatureModel`] groups the request, response and event classes of one
//! version of a feature. Models are collected in a [`FeatureRegistry`] that is
//! handed to every dispatcher. Facades such as [`root::RootFeature`] wrap a
//! [`BoundFeature`], which knows the feature index on a concrete channel.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::Serialize;

use crate::{
    bitfield::FieldValue,
    channel::Channel,
    dispatcher::QueueKind,
    error::{Error, Result},
    protocol::{Message, MessageClass, MessageKind, Protocol},
};

pub mod device_friendly_name;
pub mod feature_set;
pub mod registry;
pub mod root;
pub mod vlp_root;

pub use registry::FeatureRegistry;

/// A request class paired with the response class answering it.
#[derive(Clone, Debug)]
pub struct Function {
    /// The request sent to invoke the function.
    pub request: Arc<MessageClass>,

    /// The response the device answers with.
    pub response: Arc<MessageClass>,
}

/// Describes one version of a feature.
#[derive(Debug)]
pub struct FeatureModel {
    feature_id: u16,
    name: &'static str,
    version: u8,
    protocol: Protocol,
    category: QueueKind,
    functions: BTreeMap<u8, Function>,
    events: BTreeMap<u8, Arc<MessageClass>>,
}

impl FeatureModel {
    /// Starts describing a feature version.
    ///
    /// The category queue defaults to the one derived from the feature ID,
    /// see [`registry::default_category`].
    pub fn builder(
        feature_id: u16,
        name: &'static str,
        version: u8,
        protocol: Protocol,
    ) -> FeatureModelBuilder {
        FeatureModelBuilder {
            model: Self {
                feature_id,
                name,
                version,
                protocol,
                category: registry::default_category(feature_id),
                functions: BTreeMap::new(),
                events: BTreeMap::new(),
            },
        }
    }

    /// The protocol ID of the feature.
    pub fn feature_id(&self) -> u16 {
        self.feature_id
    }

    /// The name of the feature.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The feature version described.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The protocol the feature is spoken in.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The queue messages of the feature are delivered to, besides the
    /// protocol-wide queues.
    pub fn category(&self) -> QueueKind {
        self.category
    }

    /// The highest function index, or `None` for features without functions.
    pub fn max_function_index(&self) -> Option<u8> {
        self.functions.keys().next_back().copied()
    }

    /// The function at `index`.
    pub fn function(&self, index: u8) -> Option<&Function> {
        self.functions.get(&index)
    }

    /// The function whose request class is called `name`.
    pub fn function_by_name(&self, name: &str) -> Option<&Function> {
        self.functions
            .values()
            .find(|function| function.request.name() == name)
    }

    /// The request class of the function at `index`.
    pub fn request(&self, index: u8) -> Option<&Arc<MessageClass>> {
        self.function(index).map(|function| &function.request)
    }

    /// The response class of the function at `index`.
    pub fn response(&self, index: u8) -> Option<&Arc<MessageClass>> {
        self.function(index).map(|function| &function.response)
    }

    /// The event class at `index`.
    pub fn event(&self, index: u8) -> Option<&Arc<MessageClass>> {
        self.events.get(&index)
    }

    /// The event class called `name`.
    pub fn event_by_name(&self, name: &str) -> Option<&Arc<MessageClass>> {
        self.events.values().find(|event| event.name() == name)
    }

    /// All functions, ordered by index.
    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.values()
    }

    /// All events, ordered by index.
    pub fn events(&self) -> impl Iterator<Item = &Arc<MessageClass>> {
        self.events.values()
    }
}

impl fmt::Display for FeatureModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:#06x} v{}, {})",
            self.name, self.feature_id, self.version, self.protocol
        )
    }
}

/// Collects the classes of a [`FeatureModel`], checking that they belong to
/// it.
#[derive(Debug)]
pub struct FeatureModelBuilder {
    model: FeatureModel,
}

impl FeatureModelBuilder {
    /// Overrides the category queue of the feature.
    pub fn category(mut self, category: QueueKind) -> Self {
        self.model.category = category;
        self
    }

    fn check(&self, class: &MessageClass, kind: MessageKind) -> Result<()> {
        let model = &self.model;
        if class.kind() != kind
            || class.feature_id() != model.feature_id
            || class.version() != model.version
            || class.protocol() != model.protocol
        {
            return Err(Error::Configuration(format!(
                "{} is not a {kind:?} of {model}",
                class
            )));
        }

        Ok(())
    }

    /// Adds a function.
    ///
    /// Returns [`Error::Configuration`] if the classes belong to another
    /// feature, version or function, or if the index is taken.
    pub fn function(
        mut self,
        request: Arc<MessageClass>,
        response: Arc<MessageClass>,
    ) -> Result<Self> {
        self.check(&request, MessageKind::Request)?;
        self.check(&response, MessageKind::Response)?;

        let index = request.index();
        if response.index() != index {
            return Err(Error::Configuration(format!(
                "{} does not answer {}",
                response.name(),
                request.name()
            )));
        }
        if self.model.functions.contains_key(&index) {
            return Err(Error::Configuration(format!(
                "{}: function index {index} is defined twice",
                self.model
            )));
        }

        self.model
            .functions
            .insert(index, Function { request, response });
        Ok(self)
    }

    /// Adds an event.
    pub fn event(mut self, event: Arc<MessageClass>) -> Result<Self> {
        self.check(&event, MessageKind::Event)?;

        let index = event.index();
        if self.model.events.insert(index, event).is_some() {
            return Err(Error::Configuration(format!(
                "{}: event index {index} is defined twice",
                self.model
            )));
        }

        Ok(self)
    }

    /// Finishes the model.
    pub fn build(self) -> FeatureModel {
        self.model
    }
}

/// A bitfield describing some properties of a feature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize)]
pub struct FeatureType {
    /// An obsolete feature has been replaced by a newer one, but is still
    /// advertised for older software.
    pub obsolete: bool,

    /// A hidden feature should not be managed by end user configuration
    /// software.
    pub hidden: bool,

    /// A hidden feature that has been disabled for user software. Used for
    /// internal testing and manufacturing.
    pub engineering: bool,

    /// A manufacturing feature that can be permanently deactivated.
    pub manufacturing_deactivatable: bool,

    /// A compliance feature that can be permanently deactivated.
    pub compliance_deactivatable: bool,
}

impl From<u8> for FeatureType {
    fn from(value: u8) -> Self {
        Self {
            obsolete: value & (1 << 7) != 0,
            hidden: value & (1 << 6) != 0,
            engineering: value & (1 << 5) != 0,
            manufacturing_deactivatable: value & (1 << 4) != 0,
            compliance_deactivatable: value & (1 << 3) != 0,
        }
    }
}

impl From<FeatureType> for u8 {
    fn from(value: FeatureType) -> Self {
        [
            (value.obsolete, 7),
            (value.hidden, 6),
            (value.engineering, 5),
            (value.manufacturing_deactivatable, 4),
            (value.compliance_deactivatable, 3),
        ]
        .into_iter()
        .filter(|&(set, _)| set)
        .fold(0, |raw, (_, bit)| raw | 1 << bit)
    }
}

/// Information about a feature as reported by the device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct FeatureInformation {
    /// The protocol ID of the feature.
    pub feature_id: u16,

    /// The index of the feature in the feature table.
    pub index: u8,

    /// The type of the feature.
    #[serde(rename = "type")]
    pub typ: FeatureType,

    /// The latest version of the feature supported by the device.
    ///
    /// Devices implementing Root v0 report `0` for every feature.
    pub version: u8,
}

/// A feature located on a concrete channel.
///
/// Facades wrap this type to invoke functions by index with checked field
/// values.
#[derive(Clone)]
pub struct BoundFeature {
    chan: Arc<dyn Channel>,
    model: Arc<FeatureModel>,
    feature_index: u8,
}

impl BoundFeature {
    /// Binds a feature at a known index.
    pub fn new(chan: Arc<dyn Channel>, model: Arc<FeatureModel>, feature_index: u8) -> Self {
        Self {
            chan,
            model,
            feature_index,
        }
    }

    /// Binds a HID++2.0 feature, asking the device for its index through
    /// `Root.GetFeature` unless the channel's feature table already holds it.
    ///
    /// The model version is taken from the settings if configured there, and
    /// from the device otherwise. Returns [`Error::FeatureNotSupported`] if
    /// the device does not implement the feature.
    pub fn resolve(chan: &Arc<dyn Channel>, feature_id: u16) -> Result<Self> {
        let dispatcher = chan.dispatcher();
        let (feature_index, reported_version) =
            match dispatcher.feature_table().index_of(feature_id) {
                Some(found) => found,
                None => {
                    let info = root::RootFeature::new(Arc::clone(chan))?
                        .get_feature(feature_id)?
                        .ok_or(Error::FeatureNotSupported(feature_id))?;
                    (info.index, info.version)
                },
            };

        let version = dispatcher
            .feature_version(feature_id)
            .unwrap_or(reported_version);
        let model = dispatcher
            .registry()
            .lookup_compatible(Protocol::Hidpp, feature_id, version)
            .cloned()
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "no model registered for feature {feature_id:#06x} up to v{version}"
                ))
            })?;

        Ok(Self::new(Arc::clone(chan), model, feature_index))
    }

    /// The channel the feature is reached through.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.chan
    }

    /// The model used to build requests and parse responses.
    pub fn model(&self) -> &Arc<FeatureModel> {
        &self.model
    }

    /// The index of the feature on the device.
    pub fn feature_index(&self) -> u8 {
        self.feature_index
    }

    /// Builds the request of the function at `function_index`, addressed to
    /// the feature.
    pub fn request<'a>(
        &self,
        function_index: u8,
        values: impl IntoIterator<Item = (&'a str, FieldValue)>,
    ) -> Result<(Message, Arc<MessageClass>)> {
        let function = self.model.function(function_index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "{} has no function {function_index}",
                self.model
            ))
        })?;

        let mut request = Message::build(&function.request, values)?;
        request.set_device_index(self.chan.device_index())?;
        request.set_feature_index(self.feature_index)?;

        Ok((request, Arc::clone(&function.response)))
    }

    /// Invokes the function at `function_index` and waits for its response,
    /// using the timeout configured for the request's report type.
    pub fn call<'a>(
        &self,
        function_index: u8,
        values: impl IntoIterator<Item = (&'a str, FieldValue)>,
    ) -> Result<Message> {
        let (request, response) = self.request(function_index, values)?;
        let timeout = self
            .chan
            .dispatcher()
            .timeouts()
            .for_report(request.class().report_type());

        self.chan
            .send_report_wait_response(request, &response, timeout)
    }
}

impl fmt::Debug for BoundFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundFeature")
            .field("channel", &self.chan.id())
            .field("model", &self.model.to_string())
            .field("feature_index", &self.feature_index)
            .finish()
    }
}
