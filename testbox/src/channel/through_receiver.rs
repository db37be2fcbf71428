//! A channel to a device paired to a receiver.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tracing::debug;

use super::{Channel, ChannelId, DeviceChannel, TransportId};
use crate::{
    dispatcher::Dispatcher,
    error::{Error, Result},
    protocol::ReportType,
    transport::RawHidChannel,
};

/// The receiver slots devices can be paired to.
pub const PAIRING_SLOTS: std::ops::RangeInclusive<u8> = 1..=6;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Created,
    Open,
    Closed,
}

/// Represents a device reached through the [`DeviceChannel`] of a receiver.
///
/// Outbound reports are tagged with the device index of the paired device,
/// and the receiver channel routes reports carrying that index to this
/// channel's own dispatcher. Closing this channel leaves the receiver channel
/// open, while closing the receiver channel resolves requests pending here
/// with [`Error::ParentClosed`].
pub struct ThroughReceiverChannel<T: RawHidChannel> {
    id: ChannelId,
    parent: Arc<DeviceChannel<T>>,
    device_index: u8,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<State>,
}

impl<T: RawHidChannel> ThroughReceiverChannel<T> {
    /// Creates a closed channel to the device paired at `device_index`.
    ///
    /// Returns [`Error::InvalidArgument`] if `device_index` is no pairing
    /// slot.
    pub fn new(parent: &Arc<DeviceChannel<T>>, device_index: u8) -> Result<Self> {
        if !PAIRING_SLOTS.contains(&device_index) {
            return Err(Error::InvalidArgument(format!(
                "device index must be within {PAIRING_SLOTS:?}, got {device_index}"
            )));
        }

        let receiver_dispatcher = parent.dispatcher();
        let dispatcher = Dispatcher::new(
            Arc::clone(receiver_dispatcher.registry()),
            receiver_dispatcher.settings(),
        );

        Ok(Self {
            id: ChannelId::next(),
            parent: Arc::clone(parent),
            device_index,
            dispatcher: Arc::new(dispatcher),
            state: Mutex::new(State::Created),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The receiver channel.
    pub fn parent(&self) -> &Arc<DeviceChannel<T>> {
        &self.parent
    }
}

impl<T: RawHidChannel> Channel for ThroughReceiverChannel<T> {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn device_index(&self) -> u8 {
        self.device_index
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn transport_id(&self) -> TransportId {
        self.parent.transport_id()
    }

    fn is_open(&self) -> bool {
        *self.lock_state() == State::Open && !self.dispatcher.is_closed()
    }

    fn is_connected(&self) -> bool {
        self.is_open() && self.parent.is_connected()
    }

    fn open(&self) -> Result<()> {
        let mut state = self.lock_state();
        match *state {
            State::Open => return Ok(()),
            State::Closed => return Err(Error::ChannelClosed),
            State::Created => {},
        }

        self.parent
            .attach(self.device_index, Arc::clone(&self.dispatcher))?;
        *state = State::Open;
        debug!(
            channel = %self.id,
            receiver = %self.parent.id(),
            device_index = self.device_index,
            "channel opened"
        );

        Ok(())
    }

    fn close(&self) {
        let mut state = self.lock_state();
        let previous = std::mem::replace(&mut *state, State::Closed);
        if previous == State::Closed {
            return;
        }

        if previous == State::Open {
            self.parent.detach(self.device_index, &self.dispatcher);
        }
        self.dispatcher.shutdown(Error::ChannelClosed);
        debug!(channel = %self.id, "channel closed");
    }

    fn supports(&self, report_type: ReportType) -> bool {
        self.parent.supports(report_type)
    }

    fn send_raw(&self, report: &[u8], timeout: Duration) -> Result<()> {
        if *self.lock_state() != State::Open {
            return Err(Error::ChannelClosed);
        }
        if self.dispatcher.is_closed() {
            return Err(Error::ParentClosed);
        }

        let mut tagged = report.to_vec();
        if let Some(device_index) = tagged.get_mut(1) {
            *device_index = self.device_index;
        }

        self.parent.send_raw(&tagged, timeout)
    }
}

impl<T: RawHidChannel> Drop for ThroughReceiverChannel<T> {
    fn drop(&mut self) {
        self.close();
    }
}
