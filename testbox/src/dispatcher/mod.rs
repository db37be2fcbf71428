//! Multiplexes the inbound report stream of a channel into typed queues and
//! correlates outbound requests with their responses.
//!
//! The receive worker of a channel hands every report to
//! [`Dispatcher::dispatch`], which
//!
//! 1. resolves pending requests with error reports and always enqueues those
//!    on [`QueueKind::Error`],
//! 2. completes the pending request a report answers, if its expected class
//!    parses it,
//! 3. parses unsolicited messages through the feature table and the
//!    [`FeatureRegistry`], enqueueing them on their protocol queue (or
//!    [`QueueKind::Event`]) and their feature's category queue,
//! 4. sorts pairing notifications and HID input reports into their queues,
//! 5. tags everything else with a [`Diagnostic`] on [`QueueKind::Raw`].
//!
//! Pending requests are completed before anything derived from the same
//! report is enqueued, so a response is always observed before a later event.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
};

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::{
    error::{Diagnostic, Error, Result},
    feature::{FeatureModel, FeatureRegistry},
    hexlist::HexList,
    nibble::U4,
    protocol::{
        ErrorReport,
        Message,
        MessageClass,
        Protocol,
        ReportType,
        hidpp::{self, ReportHeader},
        hidpp1::{Hidpp1Message, PairingNotification, RegisterAccess},
        vlp::{self, FrameHeader, Reassembler},
    },
    settings::{Settings, Timeouts},
};

mod feature_table;
mod pending;
mod queue;

pub use feature_table::{FeatureEntry, FeatureTable};
pub use pending::{PendingHandle, PendingKey, PendingTable, Response, WhenBusy};
pub use queue::{
    InputReport,
    MessageQueue,
    Overflow,
    QueueKind,
    QueuedMessage,
    ReceivedMessage,
};

/// Counters of reports the dispatcher could not deliver as intended.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize)]
pub struct DispatcherStats {
    /// Responses that arrived after their request timed out.
    pub orphans: u64,

    /// Reports with an unhandled report ID.
    pub unknown_reports: u64,

    /// HID++ or VLP reports no known class could parse.
    pub unparsed: u64,

    /// VLP frames that broke the sequence of their transfer.
    pub vlp_sequence_errors: u64,

    /// Error reports that resolved no pending request.
    pub unmatched_errors: u64,

    /// Entries dropped by full queues.
    pub dropped: BTreeMap<QueueKind, u64>,
}

#[derive(Debug, Default)]
struct Counters {
    orphans: AtomicU64,
    unknown_reports: AtomicU64,
    unparsed: AtomicU64,
    vlp_sequence_errors: AtomicU64,
    unmatched_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// The dispatcher of a single channel.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<FeatureRegistry>,
    settings: Settings,
    queues: Vec<MessageQueue>,
    pending: PendingTable,
    features: FeatureTable,
    vlp_features: FeatureTable,
    reassembler: Mutex<Reassembler>,
    vlp_sequence: AtomicU8,
    counters: Counters,
    closed: AtomicBool,
}

impl Dispatcher {
    /// Creates a dispatcher with empty queues and no pending requests.
    ///
    /// [`QueueKind::is_critical`] queues block the receive worker for at most
    /// the configured block timeout when full; every other queue drops its
    /// oldest entry.
    pub fn new(registry: Arc<FeatureRegistry>, settings: &Settings) -> Self {
        let queues = QueueKind::ALL
            .into_iter()
            .map(|kind| {
                let overflow = if kind.is_critical() {
                    Overflow::Block(settings.queues.block_timeout())
                } else {
                    Overflow::DropOldest
                };
                MessageQueue::new(kind, settings.queues.capacity, overflow)
            })
            .collect();

        Self {
            registry,
            settings: settings.clone(),
            queues,
            pending: PendingTable::new(),
            features: FeatureTable::new(),
            vlp_features: FeatureTable::new(),
            reassembler: Mutex::new(Reassembler::new()),
            vlp_sequence: AtomicU8::new(0),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// The feature models messages are parsed with.
    pub fn registry(&self) -> &Arc<FeatureRegistry> {
        &self.registry
    }

    /// The settings the dispatcher was created with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The configured timeouts.
    pub fn timeouts(&self) -> &Timeouts {
        &self.settings.timeouts
    }

    /// The version pinned for a feature in the settings, if any.
    pub fn feature_version(&self, feature_id: u16) -> Option<u8> {
        self.settings.feature_version(feature_id)
    }

    /// The HID++2.0 feature table of the channel.
    pub fn feature_table(&self) -> &FeatureTable {
        &self.features
    }

    /// The VLP feature table of the channel.
    pub fn vlp_feature_table(&self) -> &FeatureTable {
        &self.vlp_features
    }

    /// The table of requests waiting for a response.
    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// The queue of the given category.
    pub fn queue(&self, kind: QueueKind) -> &MessageQueue {
        &self.queues[kind.position()]
    }

    /// Whether [`Self::shutdown`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshots the diagnostic counters.
    pub fn stats(&self) -> DispatcherStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let counters = &self.counters;

        DispatcherStats {
            orphans: load(&counters.orphans),
            unknown_reports: load(&counters.unknown_reports),
            unparsed: load(&counters.unparsed),
            vlp_sequence_errors: load(&counters.vlp_sequence_errors),
            unmatched_errors: load(&counters.unmatched_errors),
            dropped: self
                .queues
                .iter()
                .filter(|queue| queue.dropped() > 0)
                .map(|queue| (queue.kind(), queue.dropped()))
                .collect(),
        }
    }

    /// Registers a request for correlation, stamping a free software ID into
    /// HID++2.0 requests.
    ///
    /// The returned handle must be waited on through [`PendingTable::wait`]
    /// or given up with [`PendingTable::abandon`].
    pub fn register_request(
        &self,
        request: &mut Message,
        expected: &Arc<MessageClass>,
        when_busy: WhenBusy,
    ) -> Result<PendingHandle> {
        match request.class().protocol() {
            Protocol::Hidpp => {
                let handle = self.pending.register_hidpp(
                    request.feature_index(),
                    request.function_index(),
                    expected,
                    when_busy,
                )?;
                if let Some(software_id) = handle.software_id()
                    && let Err(err) = request.set_software_id(software_id)
                {
                    self.pending.abandon(handle);
                    return Err(err);
                }

                Ok(handle)
            },
            Protocol::Vlp => self.pending.register(
                PendingKey::Vlp {
                    feature_index: request.feature_index(),
                    function_index: request.function_index(),
                },
                Some(expected),
            ),
        }
    }

    /// Registers a HID++1.0 register request for correlation.
    pub fn register_register_request(&self, request: &Hidpp1Message) -> Result<PendingHandle> {
        self.pending.register(
            PendingKey::Hidpp1 {
                sub_id: request.sub_id,
                address: request.address,
            },
            None,
        )
    }

    /// Resolves the pending HID++2.0 request using `software_id` with
    /// [`Error::Cancelled`].
    pub fn cancel_pending(&self, software_id: U4) -> bool {
        self.pending.cancel(software_id)
    }

    /// Reserves `frames` consecutive outbound VLP sequence numbers, returning
    /// the first.
    pub(crate) fn reserve_vlp_sequence(&self, frames: usize) -> u8 {
        self.vlp_sequence.fetch_add(frames as u8, Ordering::Relaxed)
    }

    /// Resolves every pending request with `reason`, empties every queue and
    /// forgets feature indices and partial VLP transfers.
    ///
    /// Returns the number of resolved requests.
    pub fn shutdown(&self, reason: Error) -> usize {
        self.closed.store(true, Ordering::Release);
        let drained = self.pending.drain_all(reason);

        for queue in &self.queues {
            queue.clear();
        }
        self.features.clear();
        self.vlp_features.clear();
        self.lock_reassembler().discard_all();

        debug!(drained, "dispatcher shut down");
        drained
    }

    fn lock_reassembler(&self) -> MutexGuard<'_, Reassembler> {
        self.reassembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, kinds: &[QueueKind], timestamp_ns: u64, message: ReceivedMessage) {
        let Some((&last, others)) = kinds.split_last() else {
            return;
        };

        for &kind in others {
            self.queue(kind).push(QueuedMessage {
                timestamp_ns,
                message: message.clone(),
            });
        }
        self.queue(last).push(QueuedMessage {
            timestamp_ns,
            message,
        });
    }

    fn enqueue_raw(&self, diagnostic: Diagnostic, report: &[u8], timestamp_ns: u64) {
        let counter = match diagnostic {
            Diagnostic::Orphan => &self.counters.orphans,
            Diagnostic::UnknownReport => &self.counters.unknown_reports,
            Diagnostic::VlpSequence => &self.counters.vlp_sequence_errors,
            Diagnostic::Unparsed => &self.counters.unparsed,
        };
        bump(counter);

        self.enqueue(&[QueueKind::Raw], timestamp_ns, ReceivedMessage::Raw {
            diagnostic,
            report: HexList::from(report),
        });
    }

    /// Routes a single inbound report.
    ///
    /// Never fails: undeliverable reports end up on [`QueueKind::Raw`].
    pub fn dispatch(&self, report: &[u8], timestamp_ns: u64) {
        let Some(&report_id) = report.first() else {
            return;
        };
        trace!(report = %HexList::from(report), "received report");

        match ReportType::from_report_id(report_id) {
            Some(ReportType::Vlp) => self.dispatch_vlp(report, timestamp_ns),
            Some(_) => self.dispatch_hidpp(report, timestamp_ns),
            None => self.dispatch_other(report, timestamp_ns),
        }
    }

    fn dispatch_error(&self, error: ErrorReport, timestamp_ns: u64) {
        let mut resolved = false;

        if let Error::Hidpp1(err) = error.error {
            resolved = self.pending.fail(
                &PendingKey::Hidpp1 {
                    sub_id: err.sub_id,
                    address: err.address,
                },
                error.error.clone(),
            );
        }

        if !resolved
            && let Some(err) = hidpp::as_hidpp_error(&error)
            && err.software_id != 0
        {
            resolved = self.pending.fail(
                &PendingKey::Hidpp {
                    feature_index: err.feature_index,
                    function_index: err.function_index,
                    software_id: err.software_id,
                },
                Error::Hidpp(err),
            );
        }

        if let Error::Vlp(err) = error.error {
            resolved = self.pending.fail(
                &PendingKey::Vlp {
                    feature_index: err.feature_index,
                    function_index: err.function_index,
                },
                error.error.clone(),
            );
        }

        if !resolved {
            bump(&self.counters.unmatched_errors);
            debug!(error = %error.error, "error report resolved no request");
        }

        self.enqueue(&[QueueKind::Error], timestamp_ns, ReceivedMessage::Error(error));
    }

    fn complete_pending(
        &self,
        key: PendingKey,
        report: &HexList,
        timestamp_ns: u64,
        wrap: fn(Message) -> Response,
    ) -> bool {
        self.pending.complete_with(&key, |expected| {
            let mut message = expected?.parse(report).ok()?;
            message.set_timestamp_ns(timestamp_ns);
            Some(Ok(wrap(message)))
        })
    }

    /// Looks up the model of the feature at `feature_index`.
    fn model_at(&self, protocol: Protocol, feature_index: u8) -> Option<&Arc<FeatureModel>> {
        let table = match protocol {
            Protocol::Hidpp => &self.features,
            Protocol::Vlp => &self.vlp_features,
        };
        let entry = table.get(feature_index)?;

        self.registry
            .lookup_compatible(protocol, entry.feature_id, entry.version)
    }

    fn dispatch_hidpp(&self, report: &[u8], timestamp_ns: u64) {
        if let Some(error) = hidpp::parse_error(report) {
            self.dispatch_error(error, timestamp_ns);
            return;
        }

        if let Some(message) = Hidpp1Message::parse(report)
            && RegisterAccess::try_from(message.sub_id).is_ok()
        {
            let key = PendingKey::Hidpp1 {
                sub_id: message.sub_id,
                address: message.address,
            };
            if self.pending.complete_with(&key, |expected| {
                expected
                    .is_none()
                    .then(|| Ok(Response::Hidpp1(message.clone())))
            }) {
                return;
            }
        }

        let Some(header) = ReportHeader::parse(report) else {
            self.enqueue_raw(Diagnostic::Unparsed, report, timestamp_ns);
            return;
        };
        let report = HexList::from(report);

        let key = PendingKey::Hidpp {
            feature_index: header.feature_index,
            function_index: header.function_index.to_lo(),
            software_id: header.software_id.to_lo(),
        };
        if header.software_id.to_lo() != 0
            && self.complete_pending(key, &report, timestamp_ns, Response::Hidpp)
        {
            return;
        }

        if self.features.get(header.feature_index).is_none()
            && let Some(notification) = PairingNotification::parse(&report)
        {
            self.enqueue(
                &[QueueKind::Pairing],
                timestamp_ns,
                ReceivedMessage::Pairing(notification),
            );
            return;
        }

        if header.software_id.to_lo() != 0 && self.pending.take_expired(&key) {
            warn!(%report, "response arrived after its request timed out");
            self.enqueue_raw(Diagnostic::Orphan, &report, timestamp_ns);
            return;
        }

        let Some(model) = self.model_at(Protocol::Hidpp, header.feature_index) else {
            debug!(%report, "report for an unknown feature index");
            self.enqueue_raw(Diagnostic::Unparsed, &report, timestamp_ns);
            return;
        };
        let function_index = header.function_index.to_lo();

        if header.software_id.to_lo() == 0
            && let Some(mut event) = model
                .event(function_index)
                .and_then(|class| class.parse(&report).ok())
        {
            event.set_timestamp_ns(timestamp_ns);
            self.enqueue(
                &[QueueKind::Event, model.category()],
                timestamp_ns,
                ReceivedMessage::Hidpp(event),
            );
            return;
        }

        match model
            .response(function_index)
            .and_then(|class| class.parse(&report).ok())
        {
            Some(mut response) => {
                response.set_timestamp_ns(timestamp_ns);
                self.enqueue(
                    &[QueueKind::Hidpp, model.category()],
                    timestamp_ns,
                    ReceivedMessage::Hidpp(response),
                );
            },
            None => {
                debug!(%report, feature = %model, "no class parses the report");
                self.enqueue_raw(Diagnostic::Unparsed, &report, timestamp_ns);
            },
        }
    }

    fn dispatch_vlp(&self, frame: &[u8], timestamp_ns: u64) {
        if let Some(error) = vlp::parse_error(frame) {
            self.dispatch_error(error, timestamp_ns);
            return;
        }

        let reassembled = self.lock_reassembler().push(frame);
        let report = match reassembled {
            Ok(Some(report)) => report,
            Ok(None) => return,
            Err(err @ Error::VlpSequence { .. }) => {
                warn!(%err, frame = %HexList::from(frame), "discarding VLP transfer");
                self.enqueue_raw(Diagnostic::VlpSequence, frame, timestamp_ns);
                return;
            },
            Err(err) => {
                warn!(%err, frame = %HexList::from(frame), "discarding VLP frame");
                self.enqueue_raw(Diagnostic::Unparsed, frame, timestamp_ns);
                return;
            },
        };

        let Some(header) = FrameHeader::parse(&report) else {
            self.enqueue_raw(Diagnostic::Unparsed, &report, timestamp_ns);
            return;
        };
        if header.is_ack() && !header.is_begin() && !header.is_end() {
            self.enqueue(&[QueueKind::Vlp], timestamp_ns, ReceivedMessage::VlpAck(report));
            return;
        }

        let key = PendingKey::Vlp {
            feature_index: header.feature_index,
            function_index: header.function_index,
        };
        if self.complete_pending(key, &report, timestamp_ns, Response::Vlp) {
            return;
        }

        let model = self.model_at(Protocol::Vlp, header.feature_index);
        if let Some(mut event) = model
            .and_then(|model| model.event(header.function_index))
            .and_then(|class| class.parse(&report).ok())
        {
            event.set_timestamp_ns(timestamp_ns);
            self.enqueue(
                &[QueueKind::Vlp, QueueKind::VlpEvent],
                timestamp_ns,
                ReceivedMessage::Vlp(event),
            );
            return;
        }

        match model
            .and_then(|model| model.response(header.function_index))
            .and_then(|class| class.parse(&report).ok())
        {
            Some(mut response) => {
                response.set_timestamp_ns(timestamp_ns);
                self.enqueue(
                    &[QueueKind::Vlp],
                    timestamp_ns,
                    ReceivedMessage::Vlp(response),
                );
            },
            None => {
                debug!(%report, "no class parses the VLP message");
                self.enqueue_raw(Diagnostic::Unparsed, &report, timestamp_ns);
            },
        }
    }

    fn dispatch_other(&self, report: &[u8], timestamp_ns: u64) {
        if let Some(notification) = PairingNotification::parse(report) {
            self.enqueue(
                &[QueueKind::Pairing],
                timestamp_ns,
                ReceivedMessage::Pairing(notification),
            );
            return;
        }

        let report_id = report[0];
        let ids = &self.settings.report_ids;
        let kind = if ids.keyboard.contains(&report_id) {
            QueueKind::HidKeyboard
        } else if ids.mouse.contains(&report_id) {
            QueueKind::HidMouse
        } else if ids.consumer.contains(&report_id) {
            QueueKind::HidConsumer
        } else {
            warn!(report_id, "unknown report ID");
            self.enqueue_raw(Diagnostic::UnknownReport, report, timestamp_ns);
            return;
        };

        self.enqueue(
            &[kind],
            timestamp_ns,
            ReceivedMessage::Input(InputReport {
                report_id,
                report: HexList::from(report),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        bitfield::BitField,
        feature::registry::FeatureRegistryBuilder,
        protocol::hidpp1::NotificationType,
    };

    const WAIT: Duration = Duration::from_millis(200);

    fn battery_model() -> Result<FeatureModel> {
        let request = hidpp::request("GetStatus", 0x1000, 0, 0, ReportType::Short, vec![])?;
        let response = hidpp::response("GetStatusResponse", 0x1000, 0, 0, ReportType::Long, vec![
            BitField::new(0xfa, "level", 8),
        ])?;
        let event = hidpp::event("StatusEvent", 0x1000, 0, 0, ReportType::Long, vec![
            BitField::new(0xfa, "level", 8),
            BitField::new(0xf9, "next_level", 8),
            BitField::new(0xf8, "status", 8),
        ])?;

        Ok(FeatureModel::builder(0x1000, "BatteryStatus", 0, Protocol::Hidpp)
            .function(request, response)?
            .event(event)?
            .build())
    }

    fn dispatcher() -> Result<Dispatcher> {
        let registry = FeatureRegistryBuilder::default()
            .register_defaults()?
            .register(battery_model()?)?
            .build();
        let dispatcher = Dispatcher::new(Arc::new(registry), &Settings::default());
        dispatcher.feature_table().insert(4, 0x1000, 0);

        Ok(dispatcher)
    }

    fn report(hex: &str) -> Result<HexList> {
        let mut report = HexList::from_hex(hex)?;
        let len = ReportType::from_report_id(report[0]).map_or(report.len(), ReportType::length);
        report.pad_right(len, 0);
        Ok(report)
    }

    #[test]
    fn events_fan_out_to_event_and_category_queues() -> Result<()> {
        let dispatcher = dispatcher()?;
        dispatcher.dispatch(&report("110104 00AABBCC")?, 7);

        let event = dispatcher.queue(QueueKind::Event).get(WAIT)?;
        assert_eq!(event.timestamp_ns, 7);
        let message = event.message.as_message().cloned();
        assert_eq!(
            message.map(|message| message.get_int("next_level")),
            Some(Ok(0xbb))
        );

        let category = dispatcher.queue(QueueKind::Peripheral).get(WAIT)?;
        assert_eq!(category.message, event.message);
        assert!(dispatcher.queue(QueueKind::Hidpp).is_empty());
        Ok(())
    }

    #[test]
    fn responses_resolve_before_later_events_are_visible() -> Result<()> {
        let dispatcher = dispatcher()?;
        let model = battery_model()?;
        let function = model.function(0).cloned().ok_or(Error::FeatureNotSupported(0x1000))?;

        let mut request = Message::build(&function.request, [("feature_index", 4u8)])?;
        let handle = dispatcher.register_request(&mut request, &function.response, WhenBusy::Fail)?;
        assert_eq!(request.software_id(), U4::MAX);

        dispatcher.dispatch(&report("1101040F55")?, 1);
        dispatcher.dispatch(&report("1101040056")?, 2);

        let response = dispatcher.pending().wait(handle, WAIT)?.into_message()?;
        assert_eq!(response.get_int("level")?, 0x55);
        assert_eq!(dispatcher.queue(QueueKind::Event).len(), 1);
        assert!(dispatcher.queue(QueueKind::Hidpp).is_empty());
        Ok(())
    }

    #[test]
    fn errors_resolve_requests_and_reach_the_error_queue() -> Result<()> {
        let dispatcher = dispatcher()?;
        let model = battery_model()?;
        let function = model.function(0).cloned().ok_or(Error::FeatureNotSupported(0x1000))?;

        let mut request = Message::build(&function.request, [("feature_index", 4u8)])?;
        let handle = dispatcher.register_request(&mut request, &function.response, WhenBusy::Fail)?;
        dispatcher.dispatch(&report("1001FF040F09")?, 1);

        assert!(matches!(
            dispatcher.pending().wait(handle, WAIT),
            Err(Error::Hidpp(err)) if err.error_code == 9
        ));
        assert_eq!(dispatcher.queue(QueueKind::Error).len(), 1);

        // A broadcast error resolves nothing.
        dispatcher.dispatch(&report("1001FF040009")?, 2);
        assert_eq!(dispatcher.queue(QueueKind::Error).len(), 2);
        assert_eq!(dispatcher.stats().unmatched_errors, 1);
        Ok(())
    }

    #[test]
    fn late_responses_are_orphans() -> Result<()> {
        let dispatcher = dispatcher()?;
        let model = battery_model()?;
        let function = model.function(0).cloned().ok_or(Error::FeatureNotSupported(0x1000))?;

        let mut request = Message::build(&function.request, [("feature_index", 4u8)])?;
        let handle = dispatcher.register_request(&mut request, &function.response, WhenBusy::Fail)?;
        assert_eq!(
            dispatcher.pending().wait(handle, Duration::from_millis(10)),
            Err(Error::Timeout)
        );

        dispatcher.dispatch(&report("1101040F55")?, 1);
        let raw = dispatcher.queue(QueueKind::Raw).get(WAIT)?;
        assert_eq!(raw.message.diagnostic(), Some(Diagnostic::Orphan));
        assert_eq!(dispatcher.stats().orphans, 1);

        // Once reported, a repeated answer is an ordinary unsolicited response.
        dispatcher.dispatch(&report("1101040F56")?, 2);
        assert_eq!(dispatcher.queue(QueueKind::Hidpp).len(), 1);
        assert_eq!(dispatcher.queue(QueueKind::Peripheral).len(), 1);
        Ok(())
    }

    #[test]
    fn sorts_pairing_input_and_unknown_reports() -> Result<()> {
        let dispatcher = dispatcher()?;

        dispatcher.dispatch(&report("1002410C0140 10")?, 1);
        dispatcher.dispatch(&[0x02, 0x00, 0x05, 0xfb], 2);
        dispatcher.dispatch(&[0x77, 0x01], 3);

        let pairing = dispatcher.queue(QueueKind::Pairing).get(WAIT)?;
        let connection = pairing
            .message
            .as_pairing()
            .and_then(PairingNotification::connection);
        assert_eq!(connection.map(|connection| connection.wpid), Some(0x1040));
        assert_eq!(
            pairing
                .message
                .as_pairing()
                .and_then(PairingNotification::notification_type),
            Some(NotificationType::DeviceConnection)
        );

        assert_eq!(dispatcher.queue(QueueKind::HidMouse).len(), 1);
        let raw = dispatcher.queue(QueueKind::Raw).get(WAIT)?;
        assert_eq!(raw.message.diagnostic(), Some(Diagnostic::UnknownReport));
        assert_eq!(dispatcher.stats().unknown_reports, 1);
        Ok(())
    }

    #[test]
    fn register_responses_complete_register_requests() -> Result<()> {
        let dispatcher = dispatcher()?;
        let request =
            Hidpp1Message::register_request(0xff, RegisterAccess::GetRegister, 0x02, &[])?;
        let handle = dispatcher.register_register_request(&request)?;

        dispatcher.dispatch(&report("10FF8102000300")?, 1);

        let response = dispatcher.pending().wait(handle, WAIT)?.into_register()?;
        assert_eq!(response.payload[1], 0x03);
        Ok(())
    }

    #[test]
    fn vlp_transfers_are_reassembled_before_delivery() -> Result<()> {
        let dispatcher = dispatcher()?;
        let frame = |flags: u8, sequence: u8, len: usize| {
            HexList::from([0x13, 0x01, 0x00, flags, sequence]) + HexList::from(vec![0xaa; len])
        };

        dispatcher.dispatch(&frame(vlp::BEGIN, 0, 60), 1);
        dispatcher.dispatch(&frame(0, 1, 60), 2);
        dispatcher.dispatch(&frame(vlp::END, 2, 20), 3);

        // VLP Root at index 0 has no events, so the message parses as its
        // response.
        let entry = dispatcher.queue(QueueKind::Vlp).get(WAIT)?;
        let message = entry.message.as_message().cloned();
        assert_eq!(
            message.map(|message| message.get_int("feat_index")),
            Some(Ok(0xaa))
        );
        assert!(dispatcher.queue(QueueKind::VlpEvent).is_empty());

        dispatcher.dispatch(&frame(0, 7, 10), 4);
        let raw = dispatcher.queue(QueueKind::Raw).get(WAIT)?;
        assert_eq!(raw.message.diagnostic(), Some(Diagnostic::VlpSequence));
        Ok(())
    }

    #[test]
    fn shutdown_drains_pending_requests_and_queues() -> Result<()> {
        let dispatcher = dispatcher()?;
        let model = battery_model()?;
        let function = model.function(0).cloned().ok_or(Error::FeatureNotSupported(0x1000))?;

        let mut request = Message::build(&function.request, [("feature_index", 4u8)])?;
        let handle = dispatcher.register_request(&mut request, &function.response, WhenBusy::Fail)?;
        dispatcher.dispatch(&[0x02, 0x00], 1);

        assert_eq!(dispatcher.shutdown(Error::ChannelClosed), 1);
        assert_eq!(
            dispatcher.pending().wait(handle, WAIT),
            Err(Error::ChannelClosed)
        );
        assert!(dispatcher.queue(QueueKind::HidMouse).is_empty());
        assert_eq!(dispatcher.feature_table().len(), 1);
        assert!(dispatcher.is_closed());

        let mut request = Message::new(&function.request);
        assert_eq!(
            dispatcher
                .register_request(&mut request, &function.response, WhenBusy::Fail)
                .map(|handle| handle.key()),
            Err(Error::ChannelClosed)
        );
        Ok(())
    }
}
