use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

use picoflasher_core::device::TargetDevice;
use picoflasher_core::platform;
use picoflasher_core::progress::SessionState;
use picoflasher_core::session::{Session, SessionHandle, SessionOutcome, WriteOptions};
use picoflasher_core::source::ImageSource;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "picoflasher")]
#[command(about = "A safe tool for flashing ISO images to removable drives", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flash an ISO image to a removable device
    Flash {
        /// Image file to write
        #[arg(required = true)]
        image: PathBuf,

        /// Target device path; prompts interactively when omitted
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,
    },
    /// List available removable devices
    List,
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// By disabling it, we can have a cleaner exit when the user cancels the
/// operation, as the `ctrlc` handler will print its own message.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            if let Ok(original_termios) = Termios::from_fd(fd) {
                let mut new_termios = original_termios;
                // Disable printing of control characters.
                new_termios.c_lflag &= !ECHOCTL;

                if tcsetattr(fd, TCSANOW, &new_termios).is_ok() {
                    Self {
                        original_termios: Some(original_termios),
                    }
                } else {
                    Self {
                        original_termios: None,
                    }
                }
            } else {
                Self {
                    original_termios: None,
                }
            }
        }
        #[cfg(not(unix))]
        {
            // This is a no-op on non-Unix platforms.
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            // Restore the original terminal settings.
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[TargetDevice], prompt: &str) -> Result<TargetDevice> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn progress_style(color: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(&format!(
            "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
        ))
        .unwrap()
        .progress_chars("■ ")
}

fn cmd_flash(
    image: PathBuf,
    device_path: Option<PathBuf>,
    no_verify: bool,
    active: &Arc<Mutex<Option<SessionHandle>>>,
) -> Result<i32> {
    let source = ImageSource::open(&image)?;
    let total_bytes = source.length();

    let devices = platform::get_removable_devices()?;
    let device = match device_path {
        Some(path) => devices
            .into_iter()
            .find(|d| d.path == path)
            .ok_or_else(|| {
                anyhow!(
                    "{} is not a known removable device (try `picoflasher list`)",
                    path.display()
                )
            })?,
        None => select_device(&devices, "Select the target device to WRITE to")?,
    };

    println!(
        "{} This will erase all data on '{}' ({:.1} GB).",
        style("WARNING:").red().bold(),
        device.name,
        device.size_gb(),
    );
    println!("  Device: {}", style(device.path.display()).cyan());
    println!("  Image:  {}", style(image.display()).cyan());
    println!();

    if !confirm_operation("Are you sure you want to proceed?")? {
        println!("Flash operation cancelled.");
        return Ok(0);
    }

    println!();

    let options = WriteOptions {
        verify: !no_verify,
        ..WriteOptions::default()
    };

    let mut session = match Session::start(source, &device, options) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("{} {err}", style("Error:").red().bold());
            return Ok(err.exit_code());
        }
    };

    // Expose the session to the Ctrl+C handler for cooperative cancellation.
    if let Ok(mut guard) = active.lock() {
        *guard = Some(session.handle());
    }

    let write_pb = ProgressBar::new(total_bytes);
    write_pb.set_prefix("Writing");
    write_pb.set_style(progress_style("green"));

    let verify_pb = if !no_verify {
        ProgressBar::new(total_bytes)
    } else {
        ProgressBar::hidden()
    };

    let mut verifying = false;
    if let Some(events) = session.subscribe() {
        for event in events {
            match event.state {
                SessionState::Writing => write_pb.set_position(event.bytes_written),
                SessionState::Verifying => {
                    if !verifying {
                        verifying = true;
                        write_pb.finish_with_message("Write complete.");
                        verify_pb.set_prefix("Verifying");
                        verify_pb.set_style(progress_style("magenta"));
                    }
                    verify_pb.set_position(event.bytes_processed);
                }
                _ => {}
            }
        }
    }

    let report = session.wait();
    if let Ok(mut guard) = active.lock() {
        *guard = None;
    }

    match &report.outcome {
        SessionOutcome::Done { .. } => {
            if !no_verify {
                verify_pb.finish_with_message("Verification successful.");
            } else {
                write_pb.finish_with_message("Write complete (verification skipped).");
            }
            println!(
                "\n✨ Successfully flashed {} with {}.",
                style(device.path.display()).cyan(),
                style(image.display()).cyan()
            );
        }
        SessionOutcome::Cancelled { bytes_written } => {
            write_pb.finish_and_clear();
            verify_pb.finish_and_clear();
            println!(
                "\nFlash cancelled. {bytes_written} bytes were committed to {}; device contents beyond that point are undefined.",
                device.path.display()
            );
        }
        SessionOutcome::Failed(err) => {
            write_pb.finish_and_clear();
            verify_pb.finish_and_clear();
            eprintln!("\n{} {err}", style("Error:").red().bold());
        }
    }

    Ok(report.outcome.exit_code())
}

fn cmd_list() -> Result<()> {
    let devices = platform::get_removable_devices()?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!(
        "\n  {:<12} {:<25} {:<10} {}",
        "DEVICE", "NAME", "SIZE", "LOCATION"
    );
    println!("  {:-<12} {:-<25} {:-<10} {:-<20}", "", "", "", "");
    for device in devices {
        let name = if device.label.is_empty() {
            device.name.clone()
        } else {
            device.label.clone()
        };
        let location = if device.mount_point.is_empty() {
            "(Not mounted)".to_string()
        } else {
            device.mount_point.clone()
        };
        println!(
            "  {:<12} {:<25} {:>8.1} GB  {}",
            device.path.display(),
            name,
            device.size_gb(),
            location
        );
    }

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // The Ctrl+C handler cancels the active session, if any; the writer
    // observes the request at the next chunk boundary.
    let active: Arc<Mutex<Option<SessionHandle>>> = Arc::new(Mutex::new(None));
    let handler_active = active.clone();
    ctrlc::set_handler(move || {
        let cancelled = handler_active
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(SessionHandle::cancel));
        match cancelled {
            Some(true) => eprintln!("\nCancelling after the current chunk..."),
            Some(false) => {}
            // No session running; behave like a plain interrupt.
            None => std::process::exit(130),
        }
    })?;

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Flash {
            image,
            device,
            no_verify,
        } => cmd_flash(image, device, no_verify, &active)?,
        Commands::List => {
            cmd_list()?;
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }

    Ok(())
}
