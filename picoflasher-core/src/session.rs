//! Write sessions: validation, the background writer, and cancellation.
//!
//! A [`Session`] is the unit of work for one image/device pair. `start`
//! validates the pair before a single byte is written, claims the target so
//! no second session can open it, and then runs the chunked pipeline on a
//! background thread so the caller stays responsive. Failures are terminal;
//! there are no automatic retries, and recovery is always a fresh `start`.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, LazyLock, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::device::TargetDevice;
use crate::error::{FlashError, FlashResult};
#[cfg(target_os = "linux")]
use crate::platform;
use crate::progress::{Events, ProgressEvent, ProgressReporter, SessionShared, SessionState};
use crate::source::ImageSource;
use crate::write::{self, VerifyPhase, WritePhase};

pub use crate::write::DEFAULT_CHUNK_SIZE;

/// Progress events are emitted at most once per this interval.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

const EVENT_QUEUE_DEPTH: usize = 64;

/// Tunables for a write session.
#[derive(Clone, Debug)]
pub struct WriteOptions {
    /// Re-read the written region and compare checksums after writing.
    pub verify: bool,
    /// Transfer unit for both writing and verification.
    pub chunk_size: usize,
    /// Minimum interval between emitted progress events.
    pub progress_interval: Duration,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            verify: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Target devices with an active session. A claim is held for the whole
/// lifetime of the writer thread, so no two sessions can write the same
/// device concurrently.
static ACTIVE_TARGETS: LazyLock<Mutex<HashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

#[derive(Debug)]
struct TargetClaim {
    device: PathBuf,
}

impl TargetClaim {
    fn acquire(device: &Path) -> FlashResult<Self> {
        let device = fs::canonicalize(device).unwrap_or_else(|_| device.to_path_buf());
        let mut active = ACTIVE_TARGETS.lock().expect("target registry poisoned");
        if !active.insert(device.clone()) {
            return Err(FlashError::TargetBusy { device });
        }
        Ok(Self { device })
    }
}

impl Drop for TargetClaim {
    fn drop(&mut self) {
        if let Ok(mut active) = ACTIVE_TARGETS.lock() {
            active.remove(&self.device);
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Every byte was written (and verified, when requested). `digest` is the
    /// SHA-256 of the source image, computed during the write.
    Done { bytes_written: u64, digest: [u8; 32] },
    /// The user cancelled the session. Device contents beyond `bytes_written`
    /// are undefined.
    Cancelled { bytes_written: u64 },
    Failed(FlashError),
}

impl SessionOutcome {
    pub fn state(&self) -> SessionState {
        match self {
            SessionOutcome::Done { .. } => SessionState::Done,
            SessionOutcome::Cancelled { .. } => SessionState::Cancelled,
            SessionOutcome::Failed(_) => SessionState::Failed,
        }
    }

    /// Bytes committed to the device when the session ended.
    pub fn bytes_written(&self) -> u64 {
        match self {
            SessionOutcome::Done { bytes_written, .. }
            | SessionOutcome::Cancelled { bytes_written } => *bytes_written,
            SessionOutcome::Failed(err) => err.bytes_written(),
        }
    }

    /// Process exit code: 0 done, 1 validation, 2 write failure,
    /// 3 verification mismatch, 4 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Done { .. } => 0,
            SessionOutcome::Cancelled { .. } => 4,
            SessionOutcome::Failed(err) => err.exit_code(),
        }
    }
}

/// Final report for a finished session.
#[derive(Debug)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub elapsed: Duration,
}

/// A cloneable control handle for a running session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    /// Requests cooperative cancellation. The writer observes the request at
    /// the next chunk boundary, never mid-chunk.
    ///
    /// Returns `false` if the session has already reached a terminal state
    /// (the request is too late to have any effect). Idempotent.
    pub fn cancel(&self) -> bool {
        if self.shared.snapshot().state.is_terminal() {
            return false;
        }
        self.shared
            .cancel
            .store(true, std::sync::atomic::Ordering::SeqCst);
        true
    }

    /// The latest progress snapshot. Never blocks on device I/O.
    pub fn progress(&self) -> ProgressEvent {
        self.shared.snapshot()
    }
}

/// An active write session.
#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    events: Option<Events>,
    thread: JoinHandle<SessionReport>,
}

impl Session {
    /// Validates the image/device pair and starts writing in the background.
    ///
    /// Validation runs before a single byte is written: the target must not
    /// be the system boot device, must be large enough for the image, and
    /// must not already be claimed by another session. On any validation
    /// failure this returns the error directly and the device is untouched.
    pub fn start(
        source: ImageSource,
        target: &TargetDevice,
        options: WriteOptions,
    ) -> FlashResult<Session> {
        validate(&source, target)?;
        let claim = TargetClaim::acquire(&target.path)?;

        let shared = Arc::new(SessionShared::new(source.length()));
        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        let handle = SessionHandle {
            shared: shared.clone(),
        };

        let events = Events::new(rx, shared.clone());
        let target_path = target.path.clone();
        let thread = thread::spawn(move || {
            // Claim released when the writer exits, whatever the outcome.
            let _claim = claim;
            run_session(source, target_path, options, shared, tx)
        });

        Ok(Session {
            handle,
            events: Some(events),
            thread,
        })
    }

    /// A cloneable handle for cancelling and polling this session.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Requests cooperative cancellation. See [`SessionHandle::cancel`].
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// The latest progress snapshot. Never blocks on device I/O.
    pub fn progress(&self) -> ProgressEvent {
        self.handle.progress()
    }

    /// The session's progress event stream: a lazy, finite sequence ending
    /// with a terminal snapshot. Single consumer; returns `None` once taken.
    pub fn subscribe(&mut self) -> Option<Events> {
        self.events.take()
    }

    /// Blocks until the session finishes and returns its final report.
    pub fn wait(self) -> SessionReport {
        match self.thread.join() {
            Ok(report) => report,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn validate(source: &ImageSource, target: &TargetDevice) -> FlashResult<()> {
    // Guard against self-destruction before anything else: writing the boot
    // device is never allowed, regardless of capacity or flags.
    #[cfg(target_os = "linux")]
    match platform::system_boot_device() {
        Ok(boot) if boot == target.path => {
            return Err(FlashError::UnsafeTarget {
                device: target.path.clone(),
            });
        }
        Ok(_) => {}
        // Without a known boot device there is nothing to compare against;
        // the removable filter in discovery is the remaining guard.
        Err(err) => warn!(error = %err, "could not determine the system boot device"),
    }

    if target.size_bytes < source.length() {
        return Err(FlashError::ImageTooLarge {
            device: target.path.clone(),
            image_size: source.length(),
            capacity: target.size_bytes,
        });
    }

    Ok(())
}

fn run_session(
    source: ImageSource,
    target_path: PathBuf,
    options: WriteOptions,
    shared: Arc<SessionShared>,
    tx: SyncSender<ProgressEvent>,
) -> SessionReport {
    let started = Instant::now();
    let mut reporter =
        ProgressReporter::new(shared.clone(), tx, source.length(), options.progress_interval);

    info!(
        image = %source.path().display(),
        device = %target_path.display(),
        bytes = source.length(),
        verify = options.verify,
        "starting write session"
    );

    let outcome = match run_pipeline(&source, &target_path, &options, &shared, &mut reporter) {
        Ok(outcome) => outcome,
        Err(err) => SessionOutcome::Failed(err),
    };
    reporter.finish(outcome.state(), outcome.bytes_written());

    match &outcome {
        SessionOutcome::Done { bytes_written, .. } => {
            info!(bytes = bytes_written, "write session complete");
        }
        SessionOutcome::Cancelled { bytes_written } => {
            info!(bytes = bytes_written, "write session cancelled");
        }
        SessionOutcome::Failed(err) => {
            warn!(error = %err, "write session failed");
        }
    }

    SessionReport {
        outcome,
        elapsed: started.elapsed(),
    }
}

fn run_pipeline(
    source: &ImageSource,
    target_path: &Path,
    options: &WriteOptions,
    shared: &SessionShared,
    reporter: &mut ProgressReporter,
) -> Result<SessionOutcome, FlashError> {
    let image_len = source.length();

    let mut image = File::open(source.path()).map_err(|err| FlashError::SourceUnreadable {
        path: source.path().to_path_buf(),
        source: err,
    })?;

    // Mounted partitions on the target would race the raw write; drop them
    // first. Best-effort: the exclusive open below is the real gate.
    #[cfg(target_os = "linux")]
    platform::unmount_device(target_path);

    let mut device = open_target(target_path).map_err(|source| FlashError::Write {
        bytes_written: 0,
        source,
    })?;

    reporter.update(0, SessionState::Writing);
    let phase = write::write_image(
        &mut image,
        &mut device,
        image_len,
        options.chunk_size,
        &shared.cancel,
        |bytes, state| reporter.update(bytes, state),
    )?;

    match phase {
        WritePhase::Cancelled { bytes_written } => {
            // Everything up to the boundary must actually be on the device
            // before we report the committed count.
            device.sync_all().map_err(|source| FlashError::Write {
                bytes_written,
                source,
            })?;
            Ok(SessionOutcome::Cancelled { bytes_written })
        }
        WritePhase::Completed { digest } => {
            device.sync_all().map_err(|source| FlashError::Write {
                bytes_written: image_len,
                source,
            })?;
            drop(device);

            if !options.verify {
                return Ok(SessionOutcome::Done {
                    bytes_written: image_len,
                    digest,
                });
            }

            let mut readback = File::open(target_path).map_err(|source| FlashError::Write {
                bytes_written: image_len,
                source,
            })?;
            reporter.update(0, SessionState::Verifying);
            match write::verify_region(
                &mut readback,
                image_len,
                options.chunk_size,
                &digest,
                &shared.cancel,
                |bytes, state| reporter.update(bytes, state),
            )? {
                VerifyPhase::Cancelled { .. } => Ok(SessionOutcome::Cancelled {
                    bytes_written: image_len,
                }),
                VerifyPhase::Verified => Ok(SessionOutcome::Done {
                    bytes_written: image_len,
                    digest,
                }),
            }
        }
    }
}

/// Opens the target for writing, preferring unbuffered I/O.
///
/// `O_DIRECT` bypasses the page cache, which is what we want for a raw block
/// device, but it is not supported everywhere (tmpfs, some loop setups); fall
/// back to a buffered open rather than refusing to write.
fn open_target(path: &Path) -> io::Result<File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;

        match fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)
        {
            Ok(file) => return Ok(file),
            Err(err) => {
                debug!(device = %path.display(), error = %err, "O_DIRECT open failed, using buffered I/O");
            }
        }
    }

    fs::OpenOptions::new().write(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("claimed-device");
        fs::write(&device, b"x").unwrap();

        let first = TargetClaim::acquire(&device).unwrap();
        let busy = TargetClaim::acquire(&device).unwrap_err();
        assert!(matches!(busy, FlashError::TargetBusy { .. }));

        drop(first);
        TargetClaim::acquire(&device).unwrap();
    }

    #[test]
    fn claims_on_different_devices_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("device-a");
        let b = dir.path().join("device-b");
        fs::write(&a, b"x").unwrap();
        fs::write(&b, b"x").unwrap();

        let _claim_a = TargetClaim::acquire(&a).unwrap();
        let _claim_b = TargetClaim::acquire(&b).unwrap();
    }

    #[test]
    fn outcome_exit_codes_cover_every_terminal_state() {
        let done = SessionOutcome::Done {
            bytes_written: 1,
            digest: [0; 32],
        };
        assert_eq!(done.exit_code(), 0);
        assert_eq!(done.state(), SessionState::Done);

        let cancelled = SessionOutcome::Cancelled { bytes_written: 1 };
        assert_eq!(cancelled.exit_code(), 4);

        let failed = SessionOutcome::Failed(FlashError::Verification { bytes_written: 9 });
        assert_eq!(failed.exit_code(), 3);
        assert_eq!(failed.bytes_written(), 9);
    }
}
