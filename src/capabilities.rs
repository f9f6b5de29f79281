//! Capability capture and mirroring.
//!
//! A device's capability set is read once and carried around as a plain
//! `{event type -> codes}` map, with per-axis absinfo kept separately. The
//! mirrored copy handed to uinput strips the bits the kernel either refuses
//! or mishandles on synthetic devices.

use evdev::{AbsoluteAxisType, Device, EventType};
use std::collections::BTreeMap;
use std::io;

/// Absolute-axis parameters mirrored verbatim onto the synthetic device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbsSetup {
    pub value: i32,
    pub minimum: i32,
    pub maximum: i32,
    pub fuzz: i32,
    pub flat: i32,
    pub resolution: i32,
}

/// Snapshot of everything a source device advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Event type -> supported codes, in kernel bit order.
    pub events: BTreeMap<u16, Vec<u16>>,
    /// EV_ABS code -> axis parameters. Empty unless captured with absinfo.
    pub absinfo: BTreeMap<u16, AbsSetup>,
    /// Input property bits (INPUT_PROP_*).
    pub properties: Vec<u16>,
}

impl Capabilities {
    /// Read the capability set of an opened device. `absinfo` additionally
    /// queries the per-axis ranges, which costs one ioctl.
    pub fn from_device(dev: &Device, absinfo: bool) -> io::Result<Self> {
        let mut events: BTreeMap<u16, Vec<u16>> = BTreeMap::new();

        for ty in dev.supported_events().iter() {
            let codes: Vec<u16> = if ty == EventType::KEY {
                collect(dev.supported_keys().map(|s| s.iter().map(|k| k.0)))
            } else if ty == EventType::RELATIVE {
                collect(dev.supported_relative_axes().map(|s| s.iter().map(|a| a.0)))
            } else if ty == EventType::ABSOLUTE {
                collect(dev.supported_absolute_axes().map(|s| s.iter().map(|a| a.0)))
            } else if ty == EventType::SWITCH {
                collect(dev.supported_switches().map(|s| s.iter().map(|c| c.0)))
            } else if ty == EventType::LED {
                collect(dev.supported_leds().map(|s| s.iter().map(|c| c.0)))
            } else if ty == EventType::SOUND {
                collect(dev.supported_sounds().map(|s| s.iter().map(|c| c.0)))
            } else if ty == EventType::MISC {
                collect(dev.misc_properties().map(|s| s.iter().map(|c| c.0)))
            } else if ty == EventType::FORCEFEEDBACK {
                collect(dev.supported_ff().map(|s| s.iter().map(|c| c.0)))
            } else {
                // EV_SYN and EV_REP carry no meaningful code list.
                Vec::new()
            };
            events.insert(ty.0, codes);
        }

        let mut abs = BTreeMap::new();
        if absinfo {
            if let Some(axes) = dev.supported_absolute_axes() {
                let state = dev.get_abs_state()?;
                for axis in axes.iter() {
                    let Some(info) = state.get(axis.0 as usize) else {
                        continue;
                    };
                    abs.insert(
                        axis.0,
                        AbsSetup {
                            value: info.value,
                            minimum: info.minimum,
                            maximum: info.maximum,
                            fuzz: info.fuzz,
                            flat: info.flat,
                            resolution: info.resolution,
                        },
                    );
                }
            }
        }

        let properties = dev.properties().iter().map(|p| p.0).collect();

        Ok(Self {
            events,
            absinfo: abs,
            properties,
        })
    }

    /// Whether `(event_type, code)` is advertised by this device.
    pub fn supports(&self, event_type: u16, code: u16) -> bool {
        self.events
            .get(&event_type)
            .is_some_and(|codes| codes.contains(&code))
    }

    /// Codes of one event type, empty when the type is absent.
    pub fn codes(&self, event_type: u16) -> &[u16] {
        self.events.get(&event_type).map_or(&[], Vec::as_slice)
    }

    /// Produce the capability set for the paired synthetic device.
    ///
    /// EV_SYN and EV_FF are dropped entirely: the kernel generates syn
    /// events itself and rejects force-feedback without an upload handler.
    /// ABS_VOLUME is dropped from EV_ABS because its presence on a uinput
    /// device blocks movement and key output.
    pub fn mirror(&self) -> Capabilities {
        let mut out = self.clone();

        out.events.remove(&EventType::SYNCHRONIZATION.0);
        out.events.remove(&EventType::FORCEFEEDBACK.0);

        if let Some(abs) = out.events.get_mut(&EventType::ABSOLUTE.0) {
            abs.retain(|&code| code != AbsoluteAxisType::ABS_VOLUME.0);
        }
        out.absinfo.remove(&AbsoluteAxisType::ABS_VOLUME.0);

        out
    }
}

fn collect<I: Iterator<Item = u16>>(iter: Option<I>) -> Vec<u16> {
    iter.map(|it| it.collect()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdev::Key;

    fn keyboard_caps() -> Capabilities {
        let mut events = BTreeMap::new();
        events.insert(EventType::SYNCHRONIZATION.0, vec![]);
        events.insert(EventType::KEY.0, vec![Key::KEY_A.0, Key::KEY_CAPSLOCK.0]);
        events.insert(EventType::FORCEFEEDBACK.0, vec![0x50]);
        events.insert(
            EventType::ABSOLUTE.0,
            vec![0x00, AbsoluteAxisType::ABS_VOLUME.0],
        );

        let mut absinfo = BTreeMap::new();
        absinfo.insert(
            0x00,
            AbsSetup {
                maximum: 255,
                ..Default::default()
            },
        );
        absinfo.insert(AbsoluteAxisType::ABS_VOLUME.0, AbsSetup::default());

        Capabilities {
            events,
            absinfo,
            properties: vec![0],
        }
    }

    #[test]
    fn mirror_strips_syn_and_ff() {
        let mirrored = keyboard_caps().mirror();
        assert!(!mirrored.events.contains_key(&EventType::SYNCHRONIZATION.0));
        assert!(!mirrored.events.contains_key(&EventType::FORCEFEEDBACK.0));
        assert!(mirrored.events.contains_key(&EventType::KEY.0));
    }

    #[test]
    fn mirror_strips_abs_volume_only() {
        let mirrored = keyboard_caps().mirror();
        let abs = mirrored.codes(EventType::ABSOLUTE.0);
        assert_eq!(abs, &[0x00]);
        assert!(!mirrored.absinfo.contains_key(&AbsoluteAxisType::ABS_VOLUME.0));
        assert_eq!(mirrored.absinfo[&0x00].maximum, 255);
    }

    #[test]
    fn mirror_preserves_everything_else() {
        let caps = keyboard_caps();
        let mirrored = caps.mirror();
        assert_eq!(mirrored.codes(EventType::KEY.0), caps.codes(EventType::KEY.0));
        assert_eq!(mirrored.properties, caps.properties);
    }

    #[test]
    fn supports_matches_type_and_code() {
        let caps = keyboard_caps();
        assert!(caps.supports(EventType::KEY.0, Key::KEY_CAPSLOCK.0));
        assert!(!caps.supports(EventType::KEY.0, Key::KEY_Z.0));
        assert!(!caps.supports(EventType::RELATIVE.0, 0));
    }
}
