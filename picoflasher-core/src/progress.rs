//! Session states and progress reporting.
//!
//! Progress delivery is decoupled from write throughput: the writer updates a
//! shared snapshot on every chunk, and pushes events over a bounded channel at
//! most once per minimum interval. A slow (or absent) subscriber loses interim
//! events, never throughput; `try_send` keeps the write loop from ever
//! blocking on the consumer.

use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Lifecycle of a write session.
///
/// `Idle → Validating → Writing → Verifying → Done`, with error exits to
/// `Failed` from every working state and a `Cancelling → Cancelled` path
/// reachable from `Writing` or `Verifying`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Validating,
    Writing,
    Verifying,
    Cancelling,
    Done,
    Cancelled,
    Failed,
}

impl SessionState {
    /// Whether the session has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Cancelled | SessionState::Failed
        )
    }
}

/// An immutable snapshot of a session's progress.
#[derive(Clone, Copy, Debug)]
pub struct ProgressEvent {
    /// Bytes committed to the device. Monotonically non-decreasing and never
    /// larger than `total_bytes`.
    pub bytes_written: u64,
    /// Bytes handled in the current phase: equal to `bytes_written` while
    /// writing, and to the number of bytes re-read while verifying.
    pub bytes_processed: u64,
    /// Length of the source image in bytes.
    pub total_bytes: u64,
    /// Time since the session started.
    pub elapsed: Duration,
    /// Estimated time to finish the current phase, once enough data has been
    /// processed to extrapolate a rate.
    pub estimated_remaining: Option<Duration>,
    pub state: SessionState,
}

impl ProgressEvent {
    pub(crate) fn initial(total_bytes: u64) -> Self {
        Self {
            bytes_written: 0,
            bytes_processed: 0,
            total_bytes,
            elapsed: Duration::ZERO,
            estimated_remaining: None,
            state: SessionState::Validating,
        }
    }
}

/// Shared cancellation flag and latest-progress snapshot for one session.
#[derive(Debug)]
pub(crate) struct SessionShared {
    pub(crate) cancel: AtomicBool,
    pub(crate) latest: Mutex<ProgressEvent>,
}

impl SessionShared {
    pub(crate) fn new(total_bytes: u64) -> Self {
        Self {
            cancel: AtomicBool::new(false),
            latest: Mutex::new(ProgressEvent::initial(total_bytes)),
        }
    }

    pub(crate) fn snapshot(&self) -> ProgressEvent {
        *self.latest.lock().expect("progress snapshot poisoned")
    }
}

/// Emits progress snapshots from inside the writer thread.
pub(crate) struct ProgressReporter {
    shared: Arc<SessionShared>,
    tx: SyncSender<ProgressEvent>,
    total_bytes: u64,
    min_interval: Duration,
    started: Instant,
    phase: SessionState,
    phase_started: Instant,
    committed: u64,
    last_emitted: Option<Instant>,
}

impl ProgressReporter {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        tx: SyncSender<ProgressEvent>,
        total_bytes: u64,
        min_interval: Duration,
    ) -> Self {
        let started = Instant::now();
        Self {
            shared,
            tx,
            total_bytes,
            min_interval,
            started,
            phase: SessionState::Validating,
            phase_started: started,
            committed: 0,
            last_emitted: None,
        }
    }

    /// Records `bytes_processed` for the current phase and emits an event if
    /// the minimum interval has elapsed. Terminal states are always emitted.
    pub(crate) fn update(&mut self, bytes_processed: u64, state: SessionState) {
        if state != self.phase {
            self.phase = state;
            self.phase_started = Instant::now();
        }
        if state == SessionState::Writing {
            self.committed = bytes_processed;
        }

        let event = self.event(bytes_processed, state);
        *self.shared.latest.lock().expect("progress snapshot poisoned") = event;

        let due = self
            .last_emitted
            .is_none_or(|last| last.elapsed() >= self.min_interval);
        if (due || state.is_terminal()) && self.tx.try_send(event).is_ok() {
            self.last_emitted = Some(Instant::now());
        }
    }

    /// Publishes the terminal snapshot for the session.
    pub(crate) fn finish(&mut self, state: SessionState, bytes_written: u64) {
        self.committed = bytes_written;
        self.update(bytes_written, state);
    }

    fn event(&self, bytes_processed: u64, state: SessionState) -> ProgressEvent {
        ProgressEvent {
            bytes_written: self.committed,
            bytes_processed,
            total_bytes: self.total_bytes,
            elapsed: self.started.elapsed(),
            estimated_remaining: self.estimated_remaining(bytes_processed, state),
            state,
        }
    }

    fn estimated_remaining(&self, bytes_processed: u64, state: SessionState) -> Option<Duration> {
        if !matches!(state, SessionState::Writing | SessionState::Verifying) {
            return None;
        }
        let elapsed = self.phase_started.elapsed().as_secs_f64();
        if bytes_processed == 0 || elapsed < 1.0 {
            return None;
        }
        let rate = bytes_processed as f64 / elapsed;
        let remaining = self.total_bytes.saturating_sub(bytes_processed) as f64;
        Some(Duration::from_secs_f64(remaining / rate))
    }
}

/// A lazy, finite stream of [`ProgressEvent`]s for one session.
///
/// The iterator ends after yielding a snapshot in a terminal state. If the
/// terminal event was coalesced away on the channel, the latest shared
/// snapshot is yielded instead, so consumers always observe how the session
/// ended.
#[derive(Debug)]
pub struct Events {
    rx: Receiver<ProgressEvent>,
    shared: Arc<SessionShared>,
    finished: bool,
}

impl Events {
    pub(crate) fn new(rx: Receiver<ProgressEvent>, shared: Arc<SessionShared>) -> Self {
        Self {
            rx,
            shared,
            finished: false,
        }
    }
}

impl Iterator for Events {
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv() {
            Ok(event) => {
                if event.state.is_terminal() {
                    self.finished = true;
                }
                Some(event)
            }
            // The writer dropped its sender; its final act before doing so
            // was publishing the terminal snapshot.
            Err(_) => {
                self.finished = true;
                Some(self.shared.snapshot())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn interim_events_are_coalesced_terminal_is_not() {
        let shared = Arc::new(SessionShared::new(1000));
        let (tx, rx) = mpsc::sync_channel(16);
        // An hour-long interval: only the first update and the terminal one
        // may reach the channel.
        let mut reporter =
            ProgressReporter::new(shared.clone(), tx, 1000, Duration::from_secs(3600));

        reporter.update(100, SessionState::Writing);
        reporter.update(200, SessionState::Writing);
        reporter.update(300, SessionState::Writing);
        reporter.finish(SessionState::Done, 1000);
        drop(reporter);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].bytes_written, 100);
        assert_eq!(events[1].state, SessionState::Done);
        assert_eq!(events[1].bytes_written, 1000);

        // The shared snapshot always tracks the latest update.
        assert_eq!(shared.snapshot().state, SessionState::Done);
    }

    #[test]
    fn verify_progress_does_not_move_bytes_written() {
        let shared = Arc::new(SessionShared::new(1000));
        let (tx, rx) = mpsc::sync_channel(16);
        let mut reporter = ProgressReporter::new(shared, tx, 1000, Duration::ZERO);

        reporter.update(1000, SessionState::Writing);
        reporter.update(400, SessionState::Verifying);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events[1].state, SessionState::Verifying);
        assert_eq!(events[1].bytes_written, 1000);
        assert_eq!(events[1].bytes_processed, 400);
    }

    #[test]
    fn events_fall_back_to_shared_snapshot_when_channel_drops_terminal() {
        let shared = Arc::new(SessionShared::new(10));
        // Capacity 1: the terminal event cannot fit behind the interim one.
        let (tx, rx) = mpsc::sync_channel(1);
        let mut reporter = ProgressReporter::new(shared.clone(), tx, 10, Duration::ZERO);

        reporter.update(5, SessionState::Writing);
        reporter.finish(SessionState::Cancelled, 5);
        drop(reporter);

        let collected: Vec<_> = Events::new(rx, shared).collect();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].state, SessionState::Writing);
        assert_eq!(collected[1].state, SessionState::Cancelled);
    }

    #[test]
    fn events_end_after_terminal_event() {
        let shared = Arc::new(SessionShared::new(10));
        let (tx, rx) = mpsc::sync_channel(16);
        let mut reporter = ProgressReporter::new(shared.clone(), tx, 10, Duration::ZERO);

        reporter.update(10, SessionState::Writing);
        reporter.finish(SessionState::Done, 10);
        drop(reporter);

        let mut events = Events::new(rx, shared);
        assert_eq!(events.next().unwrap().state, SessionState::Writing);
        assert_eq!(events.next().unwrap().state, SessionState::Done);
        assert!(events.next().is_none());
    }
}
