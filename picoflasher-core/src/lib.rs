//! The core, UI-agnostic library for the `PicoFlasher` utility.
//!
//! `picoflasher-core` is designed to be used as a library by any front-end,
//! whether it's a command-line interface (like `picoflasher`) or a graphical
//! user interface. It handles the complexities of device discovery, safe
//! raw-device writing, progress tracking, and post-write verification.
//!
//! The library is structured into several key modules:
//! - [`device`]: Contains the cross-platform [`device::TargetDevice`] struct.
//! - [`platform`]: Provides platform-specific logic, primarily for discovering
//!   removable block devices and identifying the system boot device.
//! - [`source`]: Validates and identifies the input image.
//! - [`session`]: Runs write sessions, one image/device pair at a time.
//! - [`progress`]: Progress events and the subscription stream.
//! - [`error`]: The error taxonomy shared by all of the above.
//!
//! The primary entry point for imaging operations is [`session::Session::start`].
//! Writing runs on a background thread and reports its progress through a
//! bounded event stream, allowing the calling application to display progress
//! in any way it chooses while the write loop never waits on the UI.
//!
//! Safety is layered: discovery only ever lists removable, non-boot devices;
//! a session refuses to start when the target is the system boot device or is
//! smaller than the image; and exactly one session may write a given device
//! at a time. A failed or cancelled session is terminal — the library never
//! retries on its own, and recovery is always a fresh `start`.
//!
//! ## Example: Writing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use anyhow::Result;
//! use picoflasher_core::platform;
//! use picoflasher_core::session::{Session, WriteOptions};
//! use picoflasher_core::source::ImageSource;
//!
//! fn main() -> Result<()> {
//!     let source = ImageSource::open("path/to/image.iso")?;
//!     let devices = platform::get_removable_devices()?;
//!     let target = devices.first().expect("No removable devices found.");
//!
//!     let options = WriteOptions {
//!         verify: true,
//!         ..WriteOptions::default()
//!     };
//!     let mut session = Session::start(source, target, options)?;
//!
//!     // A real app might drive a progress bar widget from these events.
//!     if let Some(events) = session.subscribe() {
//!         for event in events {
//!             println!(
//!                 "{} / {} bytes ({:?})",
//!                 event.bytes_written, event.total_bytes, event.state
//!             );
//!         }
//!     }
//!
//!     let report = session.wait();
//!     println!("finished in {:?}: {:?}", report.elapsed, report.outcome);
//!
//!     Ok(())
//! }
//! ```

pub mod device;
pub mod error;
pub mod platform;
pub mod progress;
pub mod session;
pub mod source;
mod write;
