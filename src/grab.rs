//! Exclusive source grabs.
//!
//! A node is only grabbed when the active mapping can actually fire on it.
//! Grabs contend with whoever held the node before us (typically a
//! previous injection that is still ungrabbing), so EBUSY/EIO are retried
//! for a bounded interval before the node is given up on.

use crate::capabilities::Capabilities;
use crate::key_codes;
use crate::mapping::Mappings;
use evdev::Device;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// Total grab attempts before a node is skipped.
pub const GRAB_ATTEMPTS: u32 = 10;

/// Pause between grab attempts.
pub const GRAB_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Open and exclusively grab one event node.
///
/// Returns `None` (never an error, a skipped node is not fatal for its
/// group) when the node cannot be opened, when no mapping entry applies to
/// its capabilities, or when the grab keeps failing.
pub fn grab_source(path: &Path, mappings: &Mappings) -> Option<Device> {
    let mut dev = match Device::open(path) {
        Ok(dev) => dev,
        Err(err) => {
            error!("could not find device at \"{}\": {err}", path.display());
            return None;
        }
    };

    let caps = match Capabilities::from_device(&dev, false) {
        Ok(caps) => caps,
        Err(err) => {
            error!(
                "failed to read capabilities of \"{}\": {err}",
                path.display()
            );
            return None;
        }
    };

    let Some(desc) = mappings.applies_to(&caps) else {
        debug!("no need to grab device at \"{}\"", path.display());
        return None;
    };
    info!(
        "grabbing device at \"{}\" because of event \"{}\"",
        path.display(),
        key_codes::name(desc.code).unwrap_or("?"),
    );

    let mut attempts = 0;
    loop {
        match dev.grab() {
            Ok(()) => {
                debug!("grabbed {}", path.display());
                return Some(dev);
            }
            Err(err) => {
                attempts += 1;

                // It can take a moment until the node is free again when a
                // previous holder is still releasing it.
                let contended =
                    matches!(err.raw_os_error(), Some(libc::EBUSY) | Some(libc::EIO));
                if !contended || attempts >= GRAB_ATTEMPTS {
                    error!(
                        "cannot grab {}, it is possibly in use ({err})",
                        path.display()
                    );
                    return None;
                }
                debug!("failed attempts to grab {}: {attempts}", path.display());
            }
        }

        thread::sleep(GRAB_RETRY_DELAY);
    }
}
