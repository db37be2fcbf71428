//! An in-memory transport for tests and demos.
//!
//! Clones of a [`MockTransport`] share their state, so a test can keep one
//! handle to inject reports and inspect writes while a channel owns another.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use super::{RawHidChannel, TransportError};
use crate::{hexlist::HexList, protocol::ReportType, settings::LOGITECH_VENDOR_ID};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<HexList> + Send>;

struct MockState {
    read_queue: VecDeque<HexList>,
    write_history: Vec<HexList>,
    connected: bool,
    stalled: bool,
}

struct Inner {
    vendor_id: u16,
    product_id: Option<u16>,
    reports: Option<Vec<ReportType>>,
    descriptor: Vec<u8>,
    state: Mutex<MockState>,
    readable: Condvar,

    /// Held while answering, so concurrent writers are answered in turn.
    responder: Mutex<Option<Responder>>,
}

/// A scriptable transport.
///
/// Reports written to it are recorded and passed to an optional responder,
/// whose answers are queued for reading.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    /// Creates a connected transport supporting every report type.
    pub fn new() -> Self {
        Self::with_reports(Some(ReportType::ALL.to_vec()), Vec::new())
    }

    /// Creates a transport that either announces `reports` or, if `None`,
    /// leaves it to the channel to parse `descriptor`.
    pub fn with_reports(reports: Option<Vec<ReportType>>, descriptor: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Inner {
                vendor_id: LOGITECH_VENDOR_ID,
                product_id: Some(0xc548),
                reports,
                descriptor,
                state: Mutex::new(MockState {
                    read_queue: VecDeque::new(),
                    write_history: Vec::new(),
                    connected: true,
                    stalled: false,
                }),
                readable: Condvar::new(),
                responder: Mutex::new(None),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a report to be read.
    pub fn queue_read(&self, report: impl Into<HexList>) {
        self.lock().read_queue.push_back(report.into());
        self.inner.readable.notify_all();
    }

    /// Answers every written report with the reports `responder` returns.
    pub fn respond_with(&self, responder: impl FnMut(&[u8]) -> Vec<HexList> + Send + 'static) {
        *self
            .inner
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(responder));
    }

    /// All reports written so far.
    pub fn write_history(&self) -> Vec<HexList> {
        self.lock().write_history.clone()
    }

    /// Makes every further read and write fail with
    /// [`TransportError::Disconnected`].
    pub fn disconnect(&self) {
        self.lock().connected = false;
        self.inner.readable.notify_all();
    }

    /// Makes writes fail with [`TransportError::Timeout`] while `stalled` is
    /// set.
    pub fn stall_writes(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RawHidChannel for MockTransport {
    fn write_report(&self, src: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if state.stalled {
            return Err(TransportError::Timeout);
        }

        state.write_history.push(HexList::from(src));
        drop(state);

        let answers = self
            .inner
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .map(|responder| responder(src))
            .unwrap_or_default();
        if !answers.is_empty() {
            self.lock().read_queue.extend(answers);
            self.inner.readable.notify_all();
        }

        Ok(src.len())
    }

    fn read_report(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let (mut state, _) = self
            .inner
            .readable
            .wait_timeout_while(self.lock(), timeout, |state| {
                state.connected && state.read_queue.is_empty()
            })
            .unwrap_or_else(PoisonError::into_inner);

        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        let Some(report) = state.read_queue.pop_front() else {
            return Ok(0);
        };

        let len = report.len().min(buf.len());
        buf[..len].copy_from_slice(&report[..len]);
        Ok(len)
    }

    fn vendor_id(&self) -> u16 {
        self.inner.vendor_id
    }

    fn product_id(&self) -> Option<u16> {
        self.inner.product_id
    }

    fn supported_reports(&self) -> Option<Vec<ReportType>> {
        self.inner.reports.clone()
    }

    fn get_report_descriptor(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let descriptor = &self.inner.descriptor;
        if descriptor.len() > buf.len() {
            return Err(TransportError::Io("report descriptor too large".to_string()));
        }

        buf[..descriptor.len()].copy_from_slice(descriptor);
        Ok(descriptor.len())
    }
}
