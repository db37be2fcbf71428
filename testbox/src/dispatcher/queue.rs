//! Bounded message queues, one per category.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        Condvar,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::warn;

use crate::{
    error::{Diagnostic, Error, Result},
    hexlist::HexList,
    protocol::{
        ErrorReport,
        Message,
        MessageClass,
        hidpp1::{Hidpp1Message, PairingNotification},
    },
};

/// Represents the categories inbound reports are sorted into.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum QueueKind {
    /// Parsed HID++ responses not consumed by a pending request.
    Hidpp,

    /// Every parsed VLP message not consumed by a pending request.
    Vlp,

    /// HID mouse input reports.
    HidMouse,

    /// HID keyboard input reports.
    HidKeyboard,

    /// HID consumer control input reports.
    HidConsumer,

    /// Pairing and device connection notifications.
    Pairing,

    /// Parsed HID++ events.
    Event,

    /// HID++ and VLP error reports.
    Error,

    /// Reports that could not be delivered elsewhere, tagged with a
    /// [`Diagnostic`].
    Raw,

    /// Messages of common device features.
    Common,

    /// Messages of the features every device implements (Root, FeatureSet).
    Important,

    /// Messages of keyboard features.
    Keyboard,

    /// Messages of mouse features.
    Mouse,

    /// Messages of gaming features.
    Gaming,

    /// Messages of peripheral features (battery, lighting, controls).
    Peripheral,

    /// Messages of touchpad features.
    Touchpad,

    /// Parsed VLP events.
    VlpEvent,
}

impl QueueKind {
    /// All queue categories.
    pub const ALL: [QueueKind; 17] = [
        Self::Hidpp,
        Self::Vlp,
        Self::HidMouse,
        Self::HidKeyboard,
        Self::HidConsumer,
        Self::Pairing,
        Self::Event,
        Self::Error,
        Self::Raw,
        Self::Common,
        Self::Important,
        Self::Keyboard,
        Self::Mouse,
        Self::Gaming,
        Self::Peripheral,
        Self::Touchpad,
        Self::VlpEvent,
    ];

    /// The upper-case name of the category.
    pub fn name(self) -> &'static str {
        match self {
            Self::Hidpp => "HIDPP",
            Self::Vlp => "VLP",
            Self::HidMouse => "HID_MOUSE",
            Self::HidKeyboard => "HID_KEYBOARD",
            Self::HidConsumer => "HID_CONSUMER",
            Self::Pairing => "PAIRING",
            Self::Event => "EVENT",
            Self::Error => "ERROR",
            Self::Raw => "RAW",
            Self::Common => "COMMON",
            Self::Important => "IMPORTANT",
            Self::Keyboard => "KEYBOARD",
            Self::Mouse => "MOUSE",
            Self::Gaming => "GAMING",
            Self::Peripheral => "PERIPHERAL",
            Self::Touchpad => "TOUCHPAD",
            Self::VlpEvent => "VLP_EVENT",
        }
    }

    /// Whether the queue blocks the receive worker when full instead of
    /// dropping its oldest entry.
    pub fn is_critical(self) -> bool {
        matches!(self, Self::Hidpp | Self::Vlp | Self::Event | Self::Error)
    }

    pub(crate) fn position(self) -> usize {
        Self::ALL
            .iter()
            .position(|&kind| kind == self)
            .unwrap_or_default()
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A HID input report (mouse, keyboard or consumer control).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct InputReport {
    /// The report ID.
    pub report_id: u8,

    /// The full report, including the report ID.
    pub report: HexList,
}

/// Represents a message delivered to a queue.
#[derive(Clone, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub enum ReceivedMessage {
    /// A parsed HID++2.0 response or event.
    Hidpp(Message),

    /// A HID++1.0 register response.
    Hidpp1(Hidpp1Message),

    /// A parsed (and reassembled) VLP message.
    Vlp(Message),

    /// A VLP acknowledgement frame.
    VlpAck(HexList),

    /// A HID++ or VLP error report.
    Error(ErrorReport),

    /// A HID input report.
    Input(InputReport),

    /// A pairing notification.
    Pairing(PairingNotification),

    /// A report that could not be delivered elsewhere.
    Raw {
        /// Why the report ended up on the RAW queue.
        diagnostic: Diagnostic,

        /// The raw report.
        report: HexList,
    },
}

impl ReceivedMessage {
    /// The parsed HID++ or VLP message, if any.
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Hidpp(message) | Self::Vlp(message) => Some(message),
            _ => None,
        }
    }

    /// The error report, if any.
    pub fn as_error(&self) -> Option<&ErrorReport> {
        match self {
            Self::Error(report) => Some(report),
            _ => None,
        }
    }

    /// The pairing notification, if any.
    pub fn as_pairing(&self) -> Option<&PairingNotification> {
        match self {
            Self::Pairing(notification) => Some(notification),
            _ => None,
        }
    }

    /// The diagnostic of a RAW entry, if any.
    pub fn diagnostic(&self) -> Option<Diagnostic> {
        match self {
            Self::Raw { diagnostic, .. } => Some(*diagnostic),
            _ => None,
        }
    }

    /// Whether the entry is a message of the given class.
    pub fn is_instance_of(&self, class: &Arc<MessageClass>) -> bool {
        self.as_message()
            .is_some_and(|message| Arc::ptr_eq(message.class(), class))
    }
}

/// An entry of a [`MessageQueue`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct QueuedMessage {
    /// The time the underlying report was received, see
    /// [`crate::timestamp::now_ns`].
    pub timestamp_ns: u64,

    /// The message.
    pub message: ReceivedMessage,
}

/// What a full queue does with a new entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Overflow {
    /// Drops the oldest entry to make room.
    DropOldest,

    /// Waits up to the given duration for room, then drops the new entry.
    Block(Duration),
}

/// A bounded FIFO queue of received messages.
///
/// Entries are ordered by arrival. Getters wait on a condition variable for
/// at most their timeout.
pub struct MessageQueue {
    kind: QueueKind,
    capacity: usize,
    overflow: Overflow,
    entries: Mutex<VecDeque<QueuedMessage>>,
    not_empty: Condvar,
    not_full: Condvar,
    dropped: AtomicU64,
}

impl MessageQueue {
    /// Creates an empty queue.
    pub fn new(kind: QueueKind, capacity: usize, overflow: Overflow) -> Self {
        Self {
            kind,
            capacity: capacity.max(1),
            overflow,
            entries: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// The category of the queue.
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedMessage>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an entry, applying the overflow policy if the queue is full.
    ///
    /// Returns whether the entry was stored.
    pub(crate) fn push(&self, entry: QueuedMessage) -> bool {
        let mut entries = self.lock();

        if entries.len() >= self.capacity {
            match self.overflow {
                Overflow::DropOldest => {
                    entries.pop_front();
                    self.record_drop();
                },
                Overflow::Block(block_timeout) => {
                    let (guard, _) = self
                        .not_full
                        .wait_timeout_while(entries, block_timeout, |entries| {
                            entries.len() >= self.capacity
                        })
                        .unwrap_or_else(PoisonError::into_inner);
                    entries = guard;

                    if entries.len() >= self.capacity {
                        self.record_drop();
                        return false;
                    }
                },
            }
        }

        entries.push_back(entry);
        drop(entries);
        self.not_empty.notify_all();

        true
    }

    fn record_drop(&self) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(queue = %self.kind, dropped, "queue overflow, dropping an entry");
    }

    /// Removes the oldest entry, waiting up to `timeout` for one to arrive.
    pub fn get(&self, timeout: Duration) -> Result<QueuedMessage> {
        self.get_first(timeout, |_| true)
    }

    /// Removes the oldest entry without waiting.
    pub fn try_get(&self) -> Option<QueuedMessage> {
        let entry = self.lock().pop_front();
        if entry.is_some() {
            self.not_full.notify_all();
        }

        entry
    }

    /// Removes the oldest entry matching `filter`, waiting up to `timeout` for
    /// one to arrive. Entries that do not match stay in the queue.
    pub fn get_first(
        &self,
        timeout: Duration,
        mut filter: impl FnMut(&QueuedMessage) -> bool,
    ) -> Result<QueuedMessage> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.lock();

        loop {
            let position = entries.iter().position(&mut filter);
            if let Some(entry) = position.and_then(|position| entries.remove(position)) {
                drop(entries);
                self.not_full.notify_all();
                return Ok(entry);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }

            entries = self
                .not_empty
                .wait_timeout(entries, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Removes the oldest message of the given class.
    pub fn get_message(&self, class: &Arc<MessageClass>, timeout: Duration) -> Result<Message> {
        let entry = self.get_first(timeout, |entry| entry.message.is_instance_of(class))?;
        match entry.message {
            ReceivedMessage::Hidpp(message) | ReceivedMessage::Vlp(message) => Ok(message),
            _ => Err(Error::UnexpectedResponse(format!(
                "{} queue returned a non-message entry",
                self.kind
            ))),
        }
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.lock().clear();
        self.not_full.notify_all();
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The number of entries dropped due to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn raw(byte: u8) -> QueuedMessage {
        QueuedMessage {
            timestamp_ns: u64::from(byte),
            message: ReceivedMessage::Raw {
                diagnostic: Diagnostic::UnknownReport,
                report: HexList::from([byte]),
            },
        }
    }

    #[test]
    fn delivers_in_arrival_order() -> Result<()> {
        let queue = MessageQueue::new(QueueKind::Raw, 8, Overflow::DropOldest);
        queue.push(raw(1));
        queue.push(raw(2));

        assert_eq!(queue.get(Duration::ZERO)?.timestamp_ns, 1);
        assert_eq!(queue.try_get().map(|entry| entry.timestamp_ns), Some(2));
        assert!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn get_times_out_on_empty_queue() {
        let queue = MessageQueue::new(QueueKind::Event, 8, Overflow::DropOldest);
        let start = Instant::now();
        assert_eq!(queue.get(Duration::from_millis(20)), Err(Error::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn non_critical_queues_drop_oldest() {
        let queue = MessageQueue::new(QueueKind::HidMouse, 2, Overflow::DropOldest);
        for byte in 1..=3 {
            assert!(queue.push(raw(byte)));
        }

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_get().map(|entry| entry.timestamp_ns), Some(2));
    }

    #[test]
    fn critical_queues_drop_newest_after_blocking() {
        let queue = MessageQueue::new(
            QueueKind::Hidpp,
            1,
            Overflow::Block(Duration::from_millis(10)),
        );
        assert!(queue.push(raw(1)));
        assert!(!queue.push(raw(2)));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_get().map(|entry| entry.timestamp_ns), Some(1));
    }

    #[test]
    fn blocked_push_resumes_when_room_frees_up() {
        let queue = Arc::new(MessageQueue::new(
            QueueKind::Error,
            1,
            Overflow::Block(Duration::from_secs(5)),
        ));
        queue.push(raw(1));

        let consumer = thread::spawn({
            let queue = Arc::clone(&queue);
            move || {
                thread::sleep(Duration::from_millis(20));
                queue.try_get()
            }
        });

        assert!(queue.push(raw(2)));
        assert!(consumer.join().unwrap().is_some());
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn filtered_get_skips_other_entries() -> Result<()> {
        let queue = Arc::new(MessageQueue::new(QueueKind::Raw, 8, Overflow::DropOldest));
        queue.push(raw(1));

        let producer = thread::spawn({
            let queue = Arc::clone(&queue);
            move || {
                thread::sleep(Duration::from_millis(10));
                queue.push(raw(7));
            }
        });

        let entry = queue.get_first(Duration::from_secs(2), |entry| entry.timestamp_ns == 7)?;
        producer.join().unwrap();

        assert_eq!(entry.timestamp_ns, 7);
        assert_eq!(queue.len(), 1);
        Ok(())
    }
}
