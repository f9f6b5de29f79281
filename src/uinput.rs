//! Synthetic output devices.
//!
//! Each grabbed source gets one uinput device mirroring its identity,
//! input properties and (sanitized) capability set, so the rest of the
//! desktop cannot tell the remapped device from real hardware. Creation
//! goes through the uinput handle directly because the property bits must
//! be set before the device is created.

use crate::capabilities::Capabilities;
use evdev::{Device, EventType};
use input_linux::{
    AbsoluteAxis, AbsoluteInfo, AbsoluteInfoSetup, EventKind, InputId, InputProperty, Key, LedKind,
    MiscKind, RelativeAxis, SoundKind, SwitchKind, UInputHandle,
};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::OwnedFd;
use thiserror::Error;
use tracing::{debug, warn};

/// Prefix of every synthetic device name.
pub const NAME_PREFIX: &str = "ev-remapper";

/// The kernel rejects device names longer than this.
const MAX_NAME_LEN: usize = 80;

/// `"ev-remapper <source name>"`, truncated on a character boundary so the
/// whole name stays within the kernel limit (one byte is reserved for the
/// NUL terminator).
pub fn synthetic_name(source_name: &str) -> String {
    let remaining = MAX_NAME_LEN - NAME_PREFIX.len() - 2;
    let mut cut = source_name.len().min(remaining);
    while !source_name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{NAME_PREFIX} {}", &source_name[..cut])
}

#[derive(Debug, Error)]
pub enum CreateError {
    /// The kernel refused the input-property setup. Old kernels lack the
    /// uinput property ioctl entirely, which callers treat as fatal.
    #[error("kernel rejected input properties on uinput creation: {0}")]
    Properties(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A created uinput device paired with one grabbed source.
pub struct SyntheticDevice {
    handle: UInputHandle<OwnedFd>,
    name: String,
}

impl SyntheticDevice {
    /// Create a synthetic device mirroring `source`, advertising exactly
    /// the given (already sanitized) capability set.
    pub fn create(source: &Device, caps: &Capabilities) -> Result<Self, CreateError> {
        let fd: OwnedFd = OpenOptions::new().write(true).open("/dev/uinput")?.into();
        let handle = UInputHandle::new(fd);

        for (&event_type, codes) in &caps.events {
            apply_event_type(&handle, event_type, codes)?;
        }

        for &prop in &caps.properties {
            let Ok(prop) = InputProperty::from_code(prop) else {
                warn!("not mirroring unknown input property {prop}");
                continue;
            };
            handle.set_propbit(prop).map_err(CreateError::Properties)?;
        }

        let abs_setups: Vec<AbsoluteInfoSetup> = caps
            .absinfo
            .iter()
            .filter_map(|(&code, info)| {
                let axis = AbsoluteAxis::from_code(code).ok()?;
                Some(AbsoluteInfoSetup {
                    axis,
                    info: AbsoluteInfo {
                        value: info.value,
                        minimum: info.minimum,
                        maximum: info.maximum,
                        fuzz: info.fuzz,
                        flat: info.flat,
                        resolution: info.resolution,
                    },
                })
            })
            .collect();

        let source_id = source.input_id();
        let id = InputId {
            bustype: source_id.bus_type().0,
            vendor: source_id.vendor(),
            product: source_id.product(),
            version: source_id.version(),
        };

        let name = synthetic_name(source.name().unwrap_or_default());
        handle.create(&id, name.as_bytes(), 0, &abs_setups)?;

        debug!("forwarding to uinput device \"{name}\"");
        Ok(Self { handle, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write one event, carrying the source timestamp through.
    pub fn write(&self, sec: i64, usec: i64, event_type: u16, code: u16, value: i32) -> io::Result<()> {
        let mut raw: input_linux::sys::input_event = unsafe { std::mem::zeroed() };
        raw.time.tv_sec = sec as _;
        raw.time.tv_usec = usec as _;
        raw.type_ = event_type;
        raw.code = code;
        raw.value = value;
        self.handle.write(&[raw])?;
        Ok(())
    }
}

fn apply_event_type(
    handle: &UInputHandle<OwnedFd>,
    event_type: u16,
    codes: &[u16],
) -> Result<(), CreateError> {
    match event_type {
        t if t == EventType::KEY.0 => {
            handle.set_evbit(EventKind::Key)?;
            for &code in codes {
                match Key::from_code(code) {
                    Ok(key) => handle.set_keybit(key)?,
                    Err(_) => warn!("not mirroring unknown key code {code}"),
                }
            }
        }
        t if t == EventType::RELATIVE.0 => {
            handle.set_evbit(EventKind::Relative)?;
            for &code in codes {
                match RelativeAxis::from_code(code) {
                    Ok(axis) => handle.set_relbit(axis)?,
                    Err(_) => warn!("not mirroring unknown relative axis {code}"),
                }
            }
        }
        t if t == EventType::ABSOLUTE.0 => {
            // Axis ranges are supplied through the abs setup list at
            // creation time; only the bits are set here.
            handle.set_evbit(EventKind::Absolute)?;
            for &code in codes {
                match AbsoluteAxis::from_code(code) {
                    Ok(axis) => handle.set_absbit(axis)?,
                    Err(_) => warn!("not mirroring unknown absolute axis {code}"),
                }
            }
        }
        t if t == EventType::SWITCH.0 => {
            handle.set_evbit(EventKind::Switch)?;
            for &code in codes {
                match SwitchKind::from_code(code) {
                    Ok(switch) => handle.set_swbit(switch)?,
                    Err(_) => warn!("not mirroring unknown switch {code}"),
                }
            }
        }
        t if t == EventType::MISC.0 => {
            handle.set_evbit(EventKind::Misc)?;
            for &code in codes {
                match MiscKind::from_code(code) {
                    Ok(misc) => handle.set_mscbit(misc)?,
                    Err(_) => warn!("not mirroring unknown misc code {code}"),
                }
            }
        }
        t if t == EventType::LED.0 => {
            handle.set_evbit(EventKind::Led)?;
            for &code in codes {
                match LedKind::from_code(code) {
                    Ok(led) => handle.set_ledbit(led)?,
                    Err(_) => warn!("not mirroring unknown led {code}"),
                }
            }
        }
        t if t == EventType::SOUND.0 => {
            handle.set_evbit(EventKind::Sound)?;
            for &code in codes {
                match SoundKind::from_code(code) {
                    Ok(sound) => handle.set_sndbit(sound)?,
                    Err(_) => warn!("not mirroring unknown sound {code}"),
                }
            }
        }
        t if t == EventType::REPEAT.0 => {
            // Advertising EV_REP makes the kernel regenerate auto-repeat
            // on the synthetic device itself.
            handle.set_evbit(EventKind::Autorepeat)?;
        }
        other => debug!("not mirroring events of type {other}"),
    }
    Ok(())
}
