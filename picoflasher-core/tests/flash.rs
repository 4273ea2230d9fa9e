//! End-to-end write sessions against regular files standing in for block
//! devices. Chunk sizes are shrunk so the multi-chunk scenarios stay fast.

use std::fs;
use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};

use picoflasher_core::device::TargetDevice;
use picoflasher_core::error::{ErrorKind, FlashError};
use picoflasher_core::progress::SessionState;
use picoflasher_core::session::{Session, SessionOutcome, WriteOptions};
use picoflasher_core::source::ImageSource;

const CHUNK: usize = 8192;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

fn target_for(path: &Path, capacity: u64) -> TargetDevice {
    TargetDevice {
        path: path.to_path_buf(),
        name: "testdev".to_string(),
        size_bytes: capacity,
        removable: true,
        label: String::new(),
        mount_point: String::new(),
    }
}

fn options(verify: bool) -> WriteOptions {
    WriteOptions {
        verify,
        chunk_size: CHUNK,
        progress_interval: Duration::ZERO,
    }
}

#[test]
fn undersized_target_is_refused_before_any_write() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.iso");
    let device = dir.path().join("device");
    fs::write(&image, pattern(8192)).unwrap();
    fs::write(&device, b"").unwrap();

    let source = ImageSource::open(&image).unwrap();
    let err = Session::start(source, &target_for(&device, 4096), options(false)).unwrap_err();

    assert!(matches!(err, FlashError::ImageTooLarge { .. }));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.exit_code(), 1);
    // Not a single byte reached the device.
    assert_eq!(fs::metadata(&device).unwrap().len(), 0);
}

#[test]
fn exact_fit_write_with_verification_completes() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.iso");
    let device = dir.path().join("device");
    let data = pattern(3 * CHUNK + 1234);
    fs::write(&image, &data).unwrap();
    fs::write(&device, b"").unwrap();

    let source = ImageSource::open(&image).unwrap();
    // A target exactly as large as the image is allowed.
    let session = Session::start(
        source,
        &target_for(&device, data.len() as u64),
        options(true),
    )
    .unwrap();
    let report = session.wait();

    let SessionOutcome::Done {
        bytes_written,
        digest,
    } = report.outcome
    else {
        panic!("expected done, got {:?}", report.outcome);
    };
    assert_eq!(bytes_written, data.len() as u64);

    let expected: [u8; 32] = Sha256::digest(&data).into();
    assert_eq!(digest, expected);

    let written = fs::read(&device).unwrap();
    assert_eq!(&written[..data.len()], &data[..]);
}

#[test]
fn progress_events_are_monotone_and_end_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.iso");
    let device = dir.path().join("device");
    let data = pattern(6 * CHUNK);
    fs::write(&image, &data).unwrap();
    fs::write(&device, b"").unwrap();

    let source = ImageSource::open(&image).unwrap();
    let mut session = Session::start(
        source,
        &target_for(&device, 64 * 1024 * 1024),
        options(true),
    )
    .unwrap();

    let events: Vec<_> = session.subscribe().unwrap().collect();
    assert!(!events.is_empty());
    assert!(
        events
            .windows(2)
            .all(|w| w[0].bytes_written <= w[1].bytes_written)
    );
    assert!(events.iter().all(|e| e.bytes_written <= e.total_bytes));

    let last = events.last().unwrap();
    assert_eq!(last.state, SessionState::Done);
    assert_eq!(last.bytes_written, data.len() as u64);

    // Subscribing twice yields nothing; the stream is single-consumer.
    assert!(session.subscribe().is_none());

    let report = session.wait();
    assert_eq!(report.outcome.exit_code(), 0);
}

#[test]
fn cancellation_lands_on_a_chunk_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.iso");
    let device = dir.path().join("device");
    let data = pattern(512 * CHUNK);
    fs::write(&image, &data).unwrap();
    fs::write(&device, b"").unwrap();

    let source = ImageSource::open(&image).unwrap();
    let session = Session::start(
        source,
        &target_for(&device, 64 * 1024 * 1024),
        options(false),
    )
    .unwrap();

    assert!(session.cancel());
    let report = session.wait();

    match report.outcome {
        // Cancellation is cooperative, so the committed count is always a
        // whole number of chunks.
        SessionOutcome::Cancelled { bytes_written } => {
            assert_eq!(bytes_written % CHUNK as u64, 0);
            assert!(bytes_written < data.len() as u64);
            assert_eq!(report.outcome.exit_code(), 4);
        }
        // The writer may have finished before it saw the request.
        SessionOutcome::Done { bytes_written, .. } => {
            assert_eq!(bytes_written, data.len() as u64);
        }
        SessionOutcome::Failed(err) => panic!("unexpected failure: {err}"),
    }
}

#[test]
fn cancel_after_completion_reports_too_late() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.iso");
    let device = dir.path().join("device");
    fs::write(&image, pattern(CHUNK)).unwrap();
    fs::write(&device, b"").unwrap();

    let source = ImageSource::open(&image).unwrap();
    let mut session = Session::start(
        source,
        &target_for(&device, 64 * 1024 * 1024),
        options(false),
    )
    .unwrap();

    // Drain the stream; the session is terminal afterwards.
    let _ = session.subscribe().unwrap().count();
    assert!(!session.cancel());

    let report = session.wait();
    assert!(matches!(report.outcome, SessionOutcome::Done { .. }));
}
