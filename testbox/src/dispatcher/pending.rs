//! Correlates outbound requests with their responses.
//!
//! Every request waiting for an answer owns an entry keyed by the header
//! fields its response echoes. The receive worker completes entries through
//! [`PendingTable::complete_with`]; the caller waits on its [`PendingHandle`]
//! and removes the entry itself once its timeout elapses.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use flume::RecvTimeoutError;
use tracing::trace;

use crate::{
    error::{Error, Result},
    nibble::U4,
    protocol::{Message, MessageClass, hidpp1::Hidpp1Message},
};

/// How many timed out keys are remembered to recognize late responses.
const EXPIRED_CAPACITY: usize = 32;

/// Identifies a pending request by the fields its response echoes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PendingKey {
    /// A HID++2.0 function call.
    Hidpp {
        feature_index: u8,
        function_index: u8,
        software_id: u8,
    },

    /// A HID++1.0 register access.
    Hidpp1 { sub_id: u8, address: u8 },

    /// A VLP function call.
    Vlp {
        feature_index: u8,
        function_index: u8,
    },
}

impl PendingKey {
    fn software_id(&self) -> Option<u8> {
        match *self {
            Self::Hidpp { software_id, .. } => Some(software_id),
            _ => None,
        }
    }
}

/// The answer a pending request was completed with.
#[derive(Clone, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub enum Response {
    /// A parsed HID++2.0 response.
    Hidpp(Message),

    /// A HID++1.0 register response.
    Hidpp1(Hidpp1Message),

    /// A parsed (and reassembled) VLP response.
    Vlp(Message),
}

impl Response {
    /// Unwraps a HID++2.0 or VLP response message.
    pub fn into_message(self) -> Result<Message> {
        match self {
            Self::Hidpp(message) | Self::Vlp(message) => Ok(message),
            Self::Hidpp1(message) => Err(Error::UnexpectedResponse(format!(
                "expected a message, got register response {:#04x}",
                message.sub_id
            ))),
        }
    }

    /// Unwraps a HID++1.0 register response.
    pub fn into_register(self) -> Result<Hidpp1Message> {
        match self {
            Self::Hidpp1(message) => Ok(message),
            Self::Hidpp(message) | Self::Vlp(message) => Err(Error::UnexpectedResponse(format!(
                "expected a register response, got {}",
                message.class().name()
            ))),
        }
    }
}

/// What to do when all 15 software IDs are taken.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum WhenBusy {
    /// Fail immediately with [`Error::Busy`].
    #[default]
    Fail,

    /// Wait up to the given duration for a software ID to be released, then
    /// fail with [`Error::Busy`].
    Wait(Duration),
}

struct PendingEntry {
    /// The class that must parse the response. `None` for register access.
    expected: Option<Arc<MessageClass>>,

    sender: flume::Sender<Result<Response>>,
}

#[derive(Default)]
struct State {
    entries: HashMap<PendingKey, PendingEntry>,

    /// The software ID the next allocation starts probing at.
    next_software_id: u8,

    /// Keys whose waiter gave up, newest last.
    expired: VecDeque<PendingKey>,

    /// Set once the table was drained for good.
    closed: Option<Error>,
}

/// The table of requests waiting for a response.
pub struct PendingTable {
    state: Mutex<State>,
    released: Condvar,
}

/// The receiving end of a pending request.
#[derive(Debug)]
#[must_use = "the entry stays registered until the handle is waited on or abandoned"]
pub struct PendingHandle {
    key: PendingKey,
    receiver: flume::Receiver<Result<Response>>,
}

impl PendingHandle {
    /// The key the request is registered under.
    pub fn key(&self) -> PendingKey {
        self.key
    }

    /// The software ID stamped into a HID++2.0 request.
    pub fn software_id(&self) -> Option<U4> {
        self.key.software_id().map(U4::from_lo)
    }
}

impl PendingTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_software_id: 15,
                ..State::default()
            }),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a HID++2.0 request, allocating a software ID that no other
    /// pending request uses.
    ///
    /// Software IDs are handed out round-robin over `1..=15`, starting at
    /// `15`; `0` is left to unsolicited events and fire-and-forget requests.
    pub fn register_hidpp(
        &self,
        feature_index: u8,
        function_index: u8,
        expected: &Arc<MessageClass>,
        when_busy: WhenBusy,
    ) -> Result<PendingHandle> {
        let deadline = match when_busy {
            WhenBusy::Fail => None,
            WhenBusy::Wait(timeout) => Some(Instant::now() + timeout),
        };

        let mut state = self.lock();
        loop {
            if let Some(reason) = &state.closed {
                return Err(reason.clone());
            }

            if let Some(software_id) = Self::allocate_software_id(&mut state) {
                let key = PendingKey::Hidpp {
                    feature_index,
                    function_index,
                    software_id,
                };
                return Ok(Self::insert(&mut state, key, Some(Arc::clone(expected))));
            }

            let now = Instant::now();
            let Some(deadline) = deadline.filter(|&deadline| deadline > now) else {
                return Err(Error::Busy);
            };
            state = self
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn allocate_software_id(state: &mut State) -> Option<u8> {
        let start = state.next_software_id;
        let software_id = (0..15)
            .map(|offset| (start - 1 + offset) % 15 + 1)
            .find(|&candidate| {
                !state
                    .entries
                    .keys()
                    .any(|key| key.software_id() == Some(candidate))
            })?;

        state.next_software_id = software_id % 15 + 1;
        Some(software_id)
    }

    /// Registers a HID++1.0 register request or a VLP request.
    ///
    /// Returns [`Error::Busy`] if an identical request is already pending,
    /// as its response could not be told apart.
    pub fn register(
        &self,
        key: PendingKey,
        expected: Option<&Arc<MessageClass>>,
    ) -> Result<PendingHandle> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }
        if state.entries.contains_key(&key) {
            return Err(Error::Busy);
        }

        Ok(Self::insert(&mut state, key, expected.cloned()))
    }

    fn insert(
        state: &mut State,
        key: PendingKey,
        expected: Option<Arc<MessageClass>>,
    ) -> PendingHandle {
        let (sender, receiver) = flume::bounded(1);
        state.entries.insert(key, PendingEntry { expected, sender });
        state.expired.retain(|expired| *expired != key);
        trace!(?key, "registered pending request");

        PendingHandle { key, receiver }
    }

    /// Waits up to `timeout` for the request to be completed.
    ///
    /// On timeout the entry is removed and its key remembered, so a late
    /// response can be recognized as an orphan.
    pub fn wait(&self, handle: PendingHandle, timeout: Duration) -> Result<Response> {
        match handle.receiver.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Disconnected) => Err(Error::ChannelClosed),
            Err(RecvTimeoutError::Timeout) => {
                let mut state = self.lock();
                let removed = state.entries.remove(&handle.key).is_some();
                if removed {
                    if state.expired.len() == EXPIRED_CAPACITY {
                        state.expired.pop_front();
                    }
                    state.expired.push_back(handle.key);
                }
                // A drain may have taken the entry without sending yet.
                let closed = state.closed.clone().filter(|_| !removed);
                drop(state);
                self.released.notify_all();

                // The worker may have completed the entry while the lock was
                // being taken.
                handle
                    .receiver
                    .try_recv()
                    .unwrap_or_else(|_| Err(closed.unwrap_or(Error::Timeout)))
            },
        }
    }

    /// Removes an entry whose request never made it to the device.
    pub fn abandon(&self, handle: PendingHandle) {
        self.lock().entries.remove(&handle.key);
        self.released.notify_all();
    }

    /// Completes the entry registered under `key` if `resolve` accepts the
    /// received report.
    ///
    /// `resolve` receives the class expected by the entry and returns the
    /// outcome, or `None` if the report does not answer the request. Returns
    /// whether an entry was completed.
    pub fn complete_with(
        &self,
        key: &PendingKey,
        resolve: impl FnOnce(Option<&Arc<MessageClass>>) -> Option<Result<Response>>,
    ) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entries.get(key) else {
            return false;
        };
        let Some(outcome) = resolve(entry.expected.as_ref()) else {
            return false;
        };

        if let Some(entry) = state.entries.remove(key) {
            // The waiter may have given up already.
            let _ = entry.sender.send(outcome);
        }
        drop(state);
        self.released.notify_all();

        true
    }

    /// Resolves the entry registered under `key` with an error.
    pub fn fail(&self, key: &PendingKey, error: Error) -> bool {
        self.complete_with(key, |_| Some(Err(error)))
    }

    /// Returns whether `key` belongs to a request that timed out recently,
    /// forgetting it.
    pub fn take_expired(&self, key: &PendingKey) -> bool {
        let mut state = self.lock();
        match state.expired.iter().position(|expired| expired == key) {
            Some(position) => {
                state.expired.remove(position);
                true
            },
            None => false,
        }
    }

    /// Resolves the HID++2.0 request using `software_id` with
    /// [`Error::Cancelled`].
    pub fn cancel(&self, software_id: U4) -> bool {
        let key = self
            .lock()
            .entries
            .keys()
            .find(|key| key.software_id() == Some(software_id.to_lo()))
            .copied();

        key.is_some_and(|key| self.fail(&key, Error::Cancelled))
    }

    /// Resolves every entry with `reason` and rejects later registrations
    /// with it.
    ///
    /// Returns the number of resolved entries.
    pub fn drain_all(&self, reason: Error) -> usize {
        let mut state = self.lock();
        let entries = std::mem::take(&mut state.entries);
        state.expired.clear();
        state.closed = Some(reason.clone());
        drop(state);
        self.released.notify_all();

        let count = entries.len();
        for entry in entries.into_values() {
            let _ = entry.sender.send(Err(reason.clone()));
        }

        count
    }

    /// The number of pending requests.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no request is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// The software IDs currently held by pending HID++2.0 requests.
    pub fn software_ids_in_use(&self) -> Vec<u8> {
        let mut software_ids: Vec<u8> = self
            .lock()
            .entries
            .keys()
            .filter_map(PendingKey::software_id)
            .collect();
        software_ids.sort_unstable();

        software_ids
    }
}

impl fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("PendingTable")
            .field("keys", &state.entries.keys().collect::<Vec<_>>())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{
        bitfield::BitField,
        protocol::{ReportType, hidpp},
    };

    fn class() -> Arc<MessageClass> {
        hidpp::response("PingResponse", 0x0000, 1, 0, ReportType::Short, vec![
            BitField::new(0x01, "ping_data", 8),
        ])
        .unwrap()
    }

    #[test]
    fn software_ids_are_unique_and_round_robin() {
        let table = PendingTable::new();
        let class = class();

        let handles: Vec<_> = (0..15)
            .map(|_| table.register_hidpp(0, 1, &class, WhenBusy::Fail).unwrap())
            .collect();
        assert_eq!(table.software_ids_in_use(), (1..=15).collect::<Vec<_>>());
        assert!(matches!(
            table.register_hidpp(0, 1, &class, WhenBusy::Fail),
            Err(Error::Busy)
        ));

        let mut handles = handles.into_iter();
        let first = handles.next().unwrap();
        assert_eq!(first.software_id(), Some(U4::MAX));
        assert_eq!(
            handles.next().and_then(|handle| handle.software_id()),
            Some(U4::from_lo(1))
        );
        table.abandon(first);

        let reused = table.register_hidpp(0, 1, &class, WhenBusy::Fail).unwrap();
        assert_eq!(reused.software_id(), Some(U4::MAX));
    }

    #[test]
    fn busy_callers_wait_for_a_released_id() {
        let table = Arc::new(PendingTable::new());
        let class = class();
        let mut handles: Vec<_> = (0..15)
            .map(|_| table.register_hidpp(0, 1, &class, WhenBusy::Fail).unwrap())
            .collect();

        let releaser = thread::spawn({
            let table = Arc::clone(&table);
            let handle = handles.pop().unwrap();
            move || {
                thread::sleep(Duration::from_millis(20));
                table.abandon(handle);
            }
        });

        let handle = table
            .register_hidpp(0, 1, &class, WhenBusy::Wait(Duration::from_secs(5)))
            .unwrap();
        releaser.join().unwrap();
        assert_eq!(handle.software_id(), Some(U4::from_lo(14)));
    }

    #[test]
    fn timeouts_free_the_slot_and_remember_the_key() {
        let table = PendingTable::new();
        let handle = table.register_hidpp(4, 0, &class(), WhenBusy::Fail).unwrap();
        let key = handle.key();

        let start = Instant::now();
        assert_eq!(
            table.wait(handle, Duration::from_millis(30)),
            Err(Error::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(table.is_empty());

        assert!(!table.complete_with(&key, |_| unreachable!()));
        assert!(table.take_expired(&key));
        assert!(!table.take_expired(&key));
    }

    #[test]
    fn duplicate_register_requests_are_busy() {
        let table = PendingTable::new();
        let key = PendingKey::Hidpp1 {
            sub_id: 0x81,
            address: 0x02,
        };
        let _handle = table.register(key, None).unwrap();
        assert!(matches!(table.register(key, None), Err(Error::Busy)));
    }

    #[test]
    fn rejected_reports_leave_the_entry_pending() {
        let table = PendingTable::new();
        let handle = table.register_hidpp(4, 0, &class(), WhenBusy::Fail).unwrap();
        let key = handle.key();

        assert!(!table.complete_with(&key, |_| None));
        assert_eq!(table.len(), 1);
        assert!(table.fail(&key, Error::Cancelled));
        assert_eq!(table.wait(handle, Duration::ZERO), Err(Error::Cancelled));
    }

    #[test]
    fn cancel_and_drain() {
        let table = PendingTable::new();
        let class = class();
        let first = table.register_hidpp(4, 0, &class, WhenBusy::Fail).unwrap();
        let second = table.register_hidpp(4, 1, &class, WhenBusy::Fail).unwrap();

        assert!(table.cancel(first.software_id().unwrap()));
        assert_eq!(table.wait(first, Duration::ZERO), Err(Error::Cancelled));

        assert_eq!(table.drain_all(Error::ChannelClosed), 1);
        assert_eq!(
            table.wait(second, Duration::from_secs(1)),
            Err(Error::ChannelClosed)
        );
        assert!(matches!(
            table.register_hidpp(4, 0, &class, WhenBusy::Fail),
            Err(Error::ChannelClosed)
        ));
    }

    #[test]
    fn timing_out_during_a_drain_reports_the_drain_reason() {
        let table = PendingTable::new();
        let handle = table.register_hidpp(4, 0, &class(), WhenBusy::Fail).unwrap();

        // Leave the table as a drain does between taking the entries and
        // resolving them.
        let entries = {
            let mut state = table.lock();
            state.closed = Some(Error::ParentClosed);
            std::mem::take(&mut state.entries)
        };

        assert_eq!(
            table.wait(handle, Duration::from_millis(5)),
            Err(Error::ParentClosed)
        );
        drop(entries);
    }

    #[test]
    fn debug_output_lists_pending_keys() {
        let table = PendingTable::new();
        let _handle = table.register_hidpp(4, 0, &class(), WhenBusy::Fail).unwrap();

        let debug = format!("{table:?}");
        assert!(debug.starts_with("PendingTable"));
        assert!(debug.contains("software_id: 15"));
    }
}
