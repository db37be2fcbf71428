//! A channel talking to a HID interface directly.

use std::{
    collections::HashMap,
    mem,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, trace, warn};

use super::{Channel, ChannelId, TransportId, TransportKind};
use crate::{
    dispatcher::Dispatcher,
    error::{Error, Result},
    feature::FeatureRegistry,
    protocol::{DJ_REPORT_IDS, ReportType, hidpp1::PairingNotification},
    settings::Settings,
    timestamp,
    transport::{self, MAX_REPORT_LENGTH, RawHidChannel},
};

/// How long a single read of the receive worker may block, bounding the
/// latency of [`Channel::close`].
const POLL_INTERVAL: Duration = Duration::from_millis(10);

enum State {
    Created,
    Open {
        worker: JoinHandle<()>,
        reports: Vec<ReportType>,
    },
    Closed,
}

type Children = Arc<Mutex<HashMap<u8, Arc<Dispatcher>>>>;

fn lock_children(children: &Children) -> MutexGuard<'_, HashMap<u8, Arc<Dispatcher>>> {
    children.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Represents a HID interface of a device or receiver.
///
/// Opening the channel starts a receive worker thread routing every inbound
/// report to the channel's dispatcher, or to the dispatcher of the
/// [`ThroughReceiverChannel`](super::ThroughReceiverChannel) attached at the
/// report's device index.
pub struct DeviceChannel<T: RawHidChannel> {
    id: ChannelId,
    kind: TransportKind,
    device_index: u8,
    transport: Arc<T>,
    dispatcher: Arc<Dispatcher>,
    children: Children,
    state: Mutex<State>,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
}

impl<T: RawHidChannel> DeviceChannel<T> {
    /// Creates a closed channel addressing `device_index` on `transport`.
    ///
    /// Use [`super::DIRECT_DEVICE_INDEX`] for directly connected devices and
    /// receivers.
    pub fn new(
        transport: T,
        device_index: u8,
        registry: Arc<FeatureRegistry>,
        settings: &Settings,
    ) -> Self {
        Self {
            id: ChannelId::next(),
            kind: settings.transport,
            device_index,
            transport: Arc::new(transport),
            dispatcher: Arc::new(Dispatcher::new(registry, settings)),
            children: Arc::default(),
            state: Mutex::new(State::Created),
            running: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The underlying raw HID channel.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// The report types the interface declared when the channel was opened.
    pub fn supported_reports(&self) -> Vec<ReportType> {
        match &*self.lock_state() {
            State::Open { reports, .. } => reports.clone(),
            State::Created | State::Closed => Vec::new(),
        }
    }

    /// Routes reports carrying `device_index` to `dispatcher` instead of the
    /// channel's own dispatcher.
    ///
    /// Returns [`Error::ChannelClosed`] if the channel is not open and
    /// [`Error::Busy`] if another dispatcher is attached at the index.
    pub fn attach(&self, device_index: u8, dispatcher: Arc<Dispatcher>) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }

        let mut children = lock_children(&self.children);
        match children.get(&device_index) {
            Some(attached) if !Arc::ptr_eq(attached, &dispatcher) => Err(Error::Busy),
            _ => {
                children.insert(device_index, dispatcher);
                debug!(channel = %self.id, device_index, "attached device");
                Ok(())
            },
        }
    }

    /// Stops routing reports of `device_index` to `dispatcher`.
    pub fn detach(&self, device_index: u8, dispatcher: &Arc<Dispatcher>) {
        let mut children = lock_children(&self.children);
        if children
            .get(&device_index)
            .is_some_and(|attached| Arc::ptr_eq(attached, dispatcher))
        {
            children.remove(&device_index);
            debug!(channel = %self.id, device_index, "detached device");
        }
    }

    fn spawn_worker(&self) -> Result<JoinHandle<()>> {
        let router = Router {
            dispatcher: Arc::clone(&self.dispatcher),
            children: Arc::clone(&self.children),
        };
        let transport = Arc::clone(&self.transport);
        let running = Arc::clone(&self.running);
        let connected = Arc::clone(&self.connected);
        let id = self.id;

        thread::Builder::new()
            .name(format!("testbox-rx-{}", id.0))
            .spawn(move || {
                debug!(channel = %id, "receive worker started");
                let mut buf = [0u8; MAX_REPORT_LENGTH];

                while running.load(Ordering::Acquire) {
                    match transport.read_report(&mut buf, POLL_INTERVAL) {
                        Ok(0) => continue,
                        Ok(len) => router.route(&buf[..len], timestamp::now_ns()),
                        Err(err) => {
                            warn!(channel = %id, %err, "transport failed, closing channel");
                            connected.store(false, Ordering::Release);
                            router.shutdown();
                            break;
                        },
                    }
                }

                debug!(channel = %id, "receive worker stopped");
            })
            .map_err(|err| Error::Transport(format!("cannot spawn receive worker: {err}")))
    }
}

impl<T: RawHidChannel> Channel for DeviceChannel<T> {
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
        TransportId {
            vendor_id: self.transport.vendor_id(),
            product_id: self.transport.product_id(),
            protocol: self.dispatcher.settings().protocol,
            kind: self.kind,
        }
    }

    fn is_open(&self) -> bool {
        matches!(*self.lock_state(), State::Open { .. }) && !self.dispatcher.is_closed()
    }

    fn is_connected(&self) -> bool {
        self.is_open() && self.connected.load(Ordering::Acquire)
    }

    fn open(&self) -> Result<()> {
        let mut state = self.lock_state();
        match *state {
            State::Open { .. } => return Ok(()),
            State::Closed => return Err(Error::ChannelClosed),
            State::Created => {},
        }

        let reports = transport::supported_reports(&*self.transport)?;
        if reports.is_empty() {
            return Err(Error::HidppNotSupported);
        }

        self.running.store(true, Ordering::Release);
        self.connected.store(true, Ordering::Release);
        let worker = match self.spawn_worker() {
            Ok(worker) => worker,
            Err(err) => {
                self.running.store(false, Ordering::Release);
                self.connected.store(false, Ordering::Release);
                return Err(err);
            },
        };

        debug!(channel = %self.id, ?reports, "channel opened");
        *state = State::Open { worker, reports };
        Ok(())
    }

    fn close(&self) {
        let mut state = self.lock_state();
        let previous = mem::replace(&mut *state, State::Closed);

        match previous {
            State::Closed => return,
            State::Created => {},
            State::Open { worker, .. } => {
                self.running.store(false, Ordering::Release);
                if worker.join().is_err() {
                    warn!(channel = %self.id, "receive worker panicked");
                }
            },
        }
        self.connected.store(false, Ordering::Release);

        Router {
            dispatcher: Arc::clone(&self.dispatcher),
            children: Arc::clone(&self.children),
        }
        .shutdown();
        debug!(channel = %self.id, "channel closed");
    }

    fn supports(&self, report_type: ReportType) -> bool {
        match &*self.lock_state() {
            State::Open { reports, .. } => reports.contains(&report_type),
            State::Created | State::Closed => false,
        }
    }

    fn send_raw(&self, report: &[u8], timeout: Duration) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }

        self.transport
            .write_report(report, timeout)
            .map(|_| ())
            .map_err(Error::from)
    }
}

impl<T: RawHidChannel> Drop for DeviceChannel<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Hands inbound reports to the dispatcher they belong to.
struct Router {
    dispatcher: Arc<Dispatcher>,
    children: Children,
}

impl Router {
    fn route(&self, report: &[u8], timestamp_ns: u64) {
        let Some(child) = self.child_for(report) else {
            self.dispatcher.dispatch(report, timestamp_ns);
            return;
        };

        // Connection notifications concern the receiver as much as the device.
        if let Some(notification) = PairingNotification::parse(report) {
            let is_hidpp_feature = child.feature_table().get(report[2]).is_some()
                && !DJ_REPORT_IDS.contains(&notification.report_id);
            if !is_hidpp_feature {
                trace!(device_index = notification.device_index, "mirroring notification");
                self.dispatcher.dispatch(report, timestamp_ns);
            }
        }

        child.dispatch(report, timestamp_ns);
    }

    fn child_for(&self, report: &[u8]) -> Option<Arc<Dispatcher>> {
        let (&report_id, &device_index) = (report.first()?, report.get(1)?);
        if ReportType::from_report_id(report_id).is_none() && !DJ_REPORT_IDS.contains(&report_id) {
            return None;
        }

        lock_children(&self.children).get(&device_index).cloned()
    }

    fn shutdown(&self) {
        self.dispatcher.shutdown(Error::ChannelClosed);

        let children = mem::take(&mut *lock_children(&self.children));
        for child in children.into_values() {
            child.shutdown(Error::ParentClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::DIRECT_DEVICE_INDEX,
        dispatcher::QueueKind,
        hexlist::HexList,
        protocol::hidpp1::{Hidpp1Message, RegisterAccess},
        transport::mock::MockTransport,
    };

    const WAIT: Duration = Duration::from_secs(1);

    fn channel(transport: &MockTransport) -> Result<DeviceChannel<MockTransport>> {
        Ok(DeviceChannel::new(
            transport.clone(),
            DIRECT_DEVICE_INDEX,
            Arc::new(FeatureRegistry::with_defaults()?),
            &Settings::default(),
        ))
    }

    #[test]
    fn open_requires_hidpp_reports() -> Result<()> {
        let transport = MockTransport::with_reports(Some(Vec::new()), Vec::new());
        let chan = channel(&transport)?;

        assert_eq!(chan.open(), Err(Error::HidppNotSupported));
        assert!(!chan.is_open());
        Ok(())
    }

    #[test]
    fn channels_are_single_use() -> Result<()> {
        let transport = MockTransport::new();
        let chan = channel(&transport)?;

        chan.open()?;
        chan.open()?;
        assert!(chan.is_connected());
        assert!(chan.supports(ReportType::Long));

        chan.close();
        chan.close();
        assert!(!chan.is_open());
        assert_eq!(chan.open(), Err(Error::ChannelClosed));
        assert_eq!(
            chan.send_raw(&[0x10, 0xff, 0, 0, 0, 0, 0], WAIT),
            Err(Error::ChannelClosed)
        );
        Ok(())
    }

    #[test]
    fn transport_failure_resolves_pending_requests() -> Result<()> {
        let transport = MockTransport::new();
        let chan = channel(&transport)?;
        chan.open()?;

        let request =
            Hidpp1Message::register_request(0xff, RegisterAccess::GetRegister, 0x02, &[])?;
        let handle = chan.dispatcher().register_register_request(&request)?;
        transport.disconnect();

        assert_eq!(
            chan.dispatcher().pending().wait(handle, WAIT),
            Err(Error::ChannelClosed)
        );
        assert!(!chan.is_connected());
        Ok(())
    }

    #[test]
    fn routes_reports_to_attached_devices() -> Result<()> {
        let transport = MockTransport::new();
        let chan = channel(&transport)?;
        chan.open()?;

        let child = Arc::new(Dispatcher::new(
            Arc::clone(chan.dispatcher().registry()),
            &Settings::default(),
        ));
        chan.attach(2, Arc::clone(&child))?;
        assert_eq!(
            chan.attach(2, Arc::new(Dispatcher::new(
                Arc::clone(chan.dispatcher().registry()),
                &Settings::default(),
            ))),
            Err(Error::Busy)
        );

        transport.queue_read(HexList::from_hex("10024100 01 4010")?);
        transport.queue_read(HexList::from_hex("1103FF00 000000")?);

        let mirrored = chan.dispatcher().queue(QueueKind::Pairing).get(WAIT)?;
        let routed = child.queue(QueueKind::Pairing).get(WAIT)?;
        assert_eq!(mirrored.message, routed.message);

        // Nothing is attached at index 3.
        let error = chan.dispatcher().queue(QueueKind::Error).get(WAIT)?;
        assert_eq!(error.message.as_error().map(|error| error.device_index), Some(3));

        chan.close();
        assert!(child.is_closed());
        Ok(())
    }
}
