//! The chunked write and verify loops at the heart of a session.
//!
//! Both loops move data in fixed-size chunks, sequentially, offsets strictly
//! increasing. Out-of-order writes to a raw device can corrupt partition
//! structures, so there is no reordering and no skipping. Cancellation is
//! observed only at chunk boundaries, never mid-chunk, which keeps the device
//! state legible after an interruption: everything up to the reported byte
//! count is committed, everything beyond it is undefined.

use std::cmp;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};

use crate::error::FlashError;
use crate::progress::SessionState;

/// Default transfer unit. Large enough for good raw-device throughput, small
/// enough to keep cancellation responsive.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Raw device writes must be aligned to this when the target is opened with
/// `O_DIRECT`.
const BLOCK_SIZE: usize = 512;

/// How the writing phase ended.
#[derive(Debug)]
pub(crate) enum WritePhase {
    /// Every byte of the image was committed; `digest` is the rolling SHA-256
    /// of the source, computed chunk by chunk during the write.
    Completed { digest: [u8; 32] },
    /// A cancel request was observed at a chunk boundary.
    Cancelled { bytes_written: u64 },
}

/// How the verifying phase ended.
#[derive(Debug)]
pub(crate) enum VerifyPhase {
    Verified,
    Cancelled { bytes_verified: u64 },
}

/// Streams `image_len` bytes from `source` to `device` in `chunk_size` units.
///
/// `progress` is invoked with the committed byte count after every chunk, and
/// once with [`SessionState::Cancelling`] if a cancel request is observed.
/// The returned byte counts always reflect whole chunks; a failed chunk is
/// never counted.
pub(crate) fn write_image<R, W, F>(
    source: &mut R,
    device: &mut W,
    image_len: u64,
    chunk_size: usize,
    cancel: &AtomicBool,
    mut progress: F,
) -> Result<WritePhase, FlashError>
where
    R: Read,
    W: Write,
    F: FnMut(u64, SessionState),
{
    // Over-allocate so the chunk can be aligned for O_DIRECT.
    let mut buf = vec![0u8; chunk_size + BLOCK_SIZE];
    let offset = buf.as_ptr().align_offset(BLOCK_SIZE);
    let buffer = &mut buf[offset..offset + chunk_size];

    let mut hasher = Sha256::new();
    let mut written: u64 = 0;

    while written < image_len {
        if cancel.load(Ordering::SeqCst) {
            progress(written, SessionState::Cancelling);
            return Ok(WritePhase::Cancelled {
                bytes_written: written,
            });
        }

        let to_read = cmp::min(chunk_size as u64, image_len - written) as usize;
        source
            .read_exact(&mut buffer[..to_read])
            .map_err(|source| FlashError::Write {
                bytes_written: written,
                source,
            })?;

        // The last chunk may not end on a block boundary; pad it with zeros
        // to satisfy O_DIRECT. Padding never counts toward bytes written.
        let padded = if to_read % BLOCK_SIZE != 0 {
            let end = to_read.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
            buffer[to_read..end].fill(0);
            end
        } else {
            to_read
        };

        device
            .write_all(&buffer[..padded])
            .map_err(|source| FlashError::Write {
                bytes_written: written,
                source,
            })?;

        hasher.update(&buffer[..to_read]);
        written += to_read as u64;
        progress(written, SessionState::Writing);
    }

    Ok(WritePhase::Completed {
        digest: hasher.finalize().into(),
    })
}

/// Re-reads the written region from `device` and compares its SHA-256 against
/// the digest computed during the write.
///
/// `progress` is invoked with the re-read byte count after every chunk.
pub(crate) fn verify_region<R, F>(
    device: &mut R,
    image_len: u64,
    chunk_size: usize,
    expected: &[u8; 32],
    cancel: &AtomicBool,
    mut progress: F,
) -> Result<VerifyPhase, FlashError>
where
    R: Read,
    F: FnMut(u64, SessionState),
{
    let mut buffer = vec![0u8; chunk_size];
    let mut hasher = Sha256::new();
    let mut verified: u64 = 0;

    while verified < image_len {
        if cancel.load(Ordering::SeqCst) {
            progress(verified, SessionState::Cancelling);
            return Ok(VerifyPhase::Cancelled {
                bytes_verified: verified,
            });
        }

        let chunk = cmp::min(chunk_size as u64, image_len - verified) as usize;
        device
            .read_exact(&mut buffer[..chunk])
            .map_err(|source| FlashError::Write {
                bytes_written: image_len,
                source,
            })?;

        hasher.update(&buffer[..chunk]);
        verified += chunk as u64;
        progress(verified, SessionState::Verifying);
    }

    let digest: [u8; 32] = hasher.finalize().into();
    if digest != *expected {
        return Err(FlashError::Verification {
            bytes_written: image_len,
        });
    }

    Ok(VerifyPhase::Verified)
}
