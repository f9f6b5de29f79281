//! The event forwarding hot path.
//!
//! One forwarder per (source, synthetic) pair. Events are read in arrival
//! order and written straight back out with at most the key code swapped;
//! the kernel's own EV_SYN reports pass through and frame the batches on
//! the synthetic side.

use crate::mapping::Mappings;
use crate::uinput::SyntheticDevice;
use evdev::{Device, EventType, InputEvent};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tracing::{debug, error, warn};

/// EV_KEY value for auto-repeat.
const KEY_REPEAT: i32 = 2;

/// Decide what to emit for one incoming event.
///
/// Auto-repeat key events are dropped: the environment regenerates them
/// against the synthetic device, so forwarding them duplicates input.
/// Mapped codes are substituted, everything else passes unchanged.
pub fn remap_event(
    mappings: &Mappings,
    event_type: u16,
    code: u16,
    value: i32,
) -> Option<(u16, u16, i32)> {
    if event_type == EventType::KEY.0 && value == KEY_REPEAT {
        return None;
    }

    match mappings.get(code) {
        Some(target) => Some((event_type, target, value)),
        None => Some((event_type, code, value)),
    }
}

/// Put an opened device into non-blocking mode, preserving other flags.
pub fn set_nonblocking(dev: &Device) -> io::Result<()> {
    set_nonblocking_fd(dev.as_raw_fd())
}

/// O_NONBLOCK on a raw descriptor, preserving other flags.
pub fn set_nonblocking_fd(fd: RawFd) -> io::Result<()> {
    let current = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if current < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, current | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

struct SourceFd(RawFd);

impl AsRawFd for SourceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// A grabbed source paired with its synthetic output.
pub struct Forwarder {
    source: Device,
    path: PathBuf,
    sink: SyntheticDevice,
    mappings: Mappings,
}

impl Forwarder {
    pub fn new(source: Device, path: PathBuf, sink: SyntheticDevice, mappings: Mappings) -> Self {
        Self {
            source,
            path,
            sink,
            mappings,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Release the exclusive grab on the source.
    pub fn ungrab(&mut self) -> io::Result<()> {
        self.source.ungrab()
    }

    /// Consume the source's event stream until it ends or the task is
    /// cancelled. A source that stops delivering (unplugged mid-session)
    /// only terminates this forwarder; its siblings keep running.
    pub async fn run(&mut self) {
        debug!(
            "starting to listen for events from {}, fd {}",
            self.path.display(),
            self.source.as_raw_fd()
        );

        let afd = match AsyncFd::with_interest(SourceFd(self.source.as_raw_fd()), Interest::READABLE)
        {
            Ok(afd) => afd,
            Err(err) => {
                error!("failed to watch {}: {err}", self.path.display());
                return;
            }
        };

        loop {
            let mut guard = match afd.readable().await {
                Ok(guard) => guard,
                Err(err) => {
                    error!("failed to wait on {}: {err}", self.path.display());
                    break;
                }
            };

            let fetched = guard.try_io(|_| {
                self.source
                    .fetch_events()
                    .map(|events| events.collect::<Vec<InputEvent>>())
            });

            match fetched {
                Ok(Ok(events)) => {
                    for event in events {
                        self.forward(&event);
                    }
                }
                Ok(Err(err)) => {
                    error!(
                        "the read loop for \"{}\" stopped early: {err}",
                        self.path.display()
                    );
                    break;
                }
                // Spurious wakeup, wait for readiness again.
                Err(_would_block) => continue,
            }
        }
    }

    fn forward(&self, event: &InputEvent) {
        let Some((event_type, code, value)) =
            remap_event(&self.mappings, event.event_type().0, event.code(), event.value())
        else {
            return;
        };

        let (sec, usec) = split_timestamp(event.timestamp());
        if let Err(err) = self.sink.write(sec, usec, event_type, code, value) {
            warn!("uinput write failed on \"{}\": {err}", self.sink.name());
        }
    }
}

fn split_timestamp(timestamp: SystemTime) -> (i64, i64) {
    match timestamp.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => (elapsed.as_secs() as i64, elapsed.subsec_micros() as i64),
        Err(_) => (0, 0),
    }
}
