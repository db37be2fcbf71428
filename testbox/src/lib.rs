//! A test framework core for Logitech HID++2.0 and VLP1.0 devices.
//!
//! The crate models every protocol message as a bit-level record, sends
//! requests over a HID transport, correlates responses with the requests they
//! answer and sorts everything else a device sends into typed queues a test
//! can wait on.
//!
//! # Layers
//!
//! - [`hexlist::HexList`] and [`bitfield`] describe byte strings and the
//!   bit-level records laid out in them.
//! - [`protocol`] defines the HID++2.0, HID++1.0 and VLP framing on top of
//!   those records, and [`feature`] groups message classes into versioned
//!   feature models collected in a [`feature::FeatureRegistry`].
//! - [`transport::RawHidChannel`] abstracts the HID implementation. The
//!   crate does not talk to HID devices itself.
//! - [`channel::DeviceChannel`] runs a receive worker feeding a
//!   [`dispatcher::Dispatcher`], which resolves pending requests and fills
//!   the queues. [`channel::ThroughReceiverChannel`] reaches devices paired to
//!   a receiver.
//! - Feature facades such as
//!   [`feature::device_friendly_name::DeviceFriendlyNameFeature`] and the
//!   [`receiver::Receiver`] expose typed operations.
//!
//! # Quickstart
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use testbox::{
//!     channel::{Channel, DeviceChannel},
//!     dispatcher::QueueKind,
//!     feature::{FeatureRegistry, device_friendly_name::DeviceFriendlyNameFeature},
//!     settings::Settings,
//!     transport::mock::MockTransport,
//! };
//!
//! # fn main() -> testbox::error::Result<()> {
//! let settings = Settings::load("testbox.toml")?;
//! let registry = Arc::new(FeatureRegistry::with_defaults()?);
//!
//! // Any `RawHidChannel` implementation works here.
//! let chan: Arc<dyn Channel> = Arc::new(DeviceChannel::new(
//!     MockTransport::new(),
//!     settings.device_index.unwrap_or(0xff),
//!     registry,
//!     &settings,
//! ));
//! chan.open()?;
//!
//! // Resolving a facade asks `Root.GetFeature` for the feature index.
//! let friendly_name = DeviceFriendlyNameFeature::resolve(&chan)?;
//! println!("{}", friendly_name.get_whole_friendly_name()?);
//!
//! // Unsolicited messages are waited on through the queues.
//! let event = chan
//!     .dispatcher()
//!     .queue(QueueKind::Event)
//!     .get(settings.timeouts.event_wait())?;
//! println!("{event:?}");
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod feature;
pub mod hexlist;
pub mod nibble;
pub mod protocol;
pub mod receiver;
pub mod settings;
pub mod timestamp;
pub mod transport;
