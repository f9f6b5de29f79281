//! Preset and global-config stores.
//!
//! Both files are JSON. A preset carries a `"mappings"` object of symbolic
//! key names; the global config carries an `"autoload"` object assigning a
//! preset to a device-group key. Neither format is versioned.

use crate::capabilities::Capabilities;
use crate::key_codes;
use anyhow::{Context, Result, bail};
use evdev::EventType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{error, info};

/// File name of the global config inside the config directory.
pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// `(type, code, value)` triple identifying an event a mapping refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub event_type: u16,
    pub code: u16,
    pub value: i32,
}

impl FromStr for EventDescriptor {
    type Err = anyhow::Error;

    /// Parse from a `"type,code,value"` string.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(',').map(str::trim);
        let (Some(ty), Some(code), Some(value), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            bail!("expected \"type,code,value\", got {s:?}");
        };
        Ok(Self {
            event_type: ty.parse().with_context(|| format!("bad event type in {s:?}"))?,
            code: code.parse().with_context(|| format!("bad code in {s:?}"))?,
            value: value.parse().with_context(|| format!("bad value in {s:?}"))?,
        })
    }
}

#[derive(Deserialize)]
struct PresetFile {
    mappings: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct GlobalConfigFile {
    autoload: BTreeMap<String, String>,
}

/// A loaded preset: source key code -> target key code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mappings {
    table: BTreeMap<u16, u16>,
}

impl Mappings {
    /// Load a preset file, resolving symbolic names to key codes.
    ///
    /// Entries with an unknown name on either side are logged and skipped;
    /// the remaining entries still load.
    pub fn load(path: &Path) -> Result<Self> {
        info!("loading mappings from \"{}\"", path.display());

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read preset \"{}\"", path.display()))?;
        let file: PresetFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid preset \"{}\"", path.display()))?;

        let mut table = BTreeMap::new();
        for (source, target) in &file.mappings {
            let (Some(from), Some(to)) = (key_codes::code(source), key_codes::code(target))
            else {
                error!("skipping mapping entry \"{source}\" -> \"{target}\": unknown key name");
                continue;
            };
            table.insert(from, to);
        }

        Ok(Self { table })
    }

    pub fn from_table(table: BTreeMap<u16, u16>) -> Self {
        Self { table }
    }

    pub fn get(&self, code: u16) -> Option<u16> {
        self.table.get(&code).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// The key-press descriptors this mapping listens for.
    pub fn descriptors(&self) -> impl Iterator<Item = EventDescriptor> + '_ {
        self.table.keys().map(|&code| EventDescriptor {
            event_type: EventType::KEY.0,
            code,
            value: 1,
        })
    }

    /// The first descriptor a device's capability set can produce, if any.
    /// A device that can produce none of them is not worth grabbing.
    pub fn applies_to(&self, caps: &Capabilities) -> Option<EventDescriptor> {
        self.descriptors()
            .find(|desc| caps.supports(desc.event_type, desc.code))
    }
}

/// The global config: which preset to start for which device group.
#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    autoload: BTreeMap<String, String>,
}

impl GlobalConfig {
    pub fn load(path: &Path) -> Result<Self> {
        info!("loading config from \"{}\"", path.display());

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config \"{}\"", path.display()))?;
        let file: GlobalConfigFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config \"{}\"", path.display()))?;

        Ok(Self {
            autoload: file.autoload,
        })
    }

    pub fn autoload(&self) -> impl Iterator<Item = (&str, &str)> {
        self.autoload
            .iter()
            .map(|(key, preset)| (key.as_str(), preset.as_str()))
    }

    pub fn preset_for(&self, device_key: &str) -> Option<&str> {
        self.autoload.get(device_key).map(String::as_str)
    }
}

/// `<config_dir>/config.json`
pub fn global_config_path(config_dir: &Path) -> PathBuf {
    config_dir.join(GLOBAL_CONFIG_FILE)
}

/// `<config_dir>/mappings/<group name>/<preset>.json`
pub fn preset_path(config_dir: &Path, group_name: &str, preset: &str) -> PathBuf {
    config_dir
        .join("mappings")
        .join(group_name)
        .join(format!("{preset}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn preset_resolves_symbolic_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "caps.json",
            r#"{"mappings": {"KEY_CAPSLOCK": "KEY_LEFTCTRL", "KEY_F1": "KEY_F2"}}"#,
        );

        let mappings = Mappings::load(&path).unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings.get(58), Some(29));
        assert_eq!(mappings.get(59), Some(60));
        assert_eq!(mappings.get(30), None);
    }

    #[test]
    fn preset_skips_unknown_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "partial.json",
            r#"{"mappings": {"KEY_NOPE": "KEY_A", "KEY_CAPSLOCK": "KEY_BOGUS", "KEY_A": "KEY_B"}}"#,
        );

        let mappings = Mappings::load(&path).unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings.get(30), Some(48));
    }

    #[test]
    fn preset_without_mappings_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "bad.json", r#"{"bindings": {}}"#);
        assert!(Mappings::load(&path).is_err());
        assert!(Mappings::load(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn descriptors_are_key_presses() {
        let mappings = Mappings::from_table([(58u16, 29u16)].into());
        let descs: Vec<_> = mappings.descriptors().collect();
        assert_eq!(
            descs,
            vec![EventDescriptor {
                event_type: EventType::KEY.0,
                code: 58,
                value: 1
            }]
        );
    }

    #[test]
    fn applies_to_matches_capabilities() {
        let mappings = Mappings::from_table([(58u16, 29u16)].into());

        let mut kbd = Capabilities::default();
        kbd.events.insert(EventType::KEY.0, vec![30, 58]);
        assert!(mappings.applies_to(&kbd).is_some());

        let mut pad = Capabilities::default();
        pad.events.insert(EventType::KEY.0, vec![272]);
        assert!(mappings.applies_to(&pad).is_none());
    }

    #[test]
    fn global_config_reads_autoload_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "config.json",
            r#"{"autoload": {"Some Keyboard": "caps-to-ctrl"}}"#,
        );

        let config = GlobalConfig::load(&path).unwrap();
        assert_eq!(config.preset_for("Some Keyboard"), Some("caps-to-ctrl"));
        assert_eq!(config.preset_for("other"), None);
        assert_eq!(config.autoload().count(), 1);
    }

    #[test]
    fn descriptor_parses_from_string() {
        let desc: EventDescriptor = "1,58,1".parse().unwrap();
        assert_eq!(
            desc,
            EventDescriptor {
                event_type: 1,
                code: 58,
                value: 1
            }
        );
        assert!("1,58".parse::<EventDescriptor>().is_err());
        assert!("1,58,1,0".parse::<EventDescriptor>().is_err());
        assert!("a,b,c".parse::<EventDescriptor>().is_err());
    }

    #[test]
    fn preset_path_layout() {
        let path = preset_path(Path::new("/home/u/.config/ev-remapper"), "Kbd", "caps");
        assert_eq!(
            path,
            PathBuf::from("/home/u/.config/ev-remapper/mappings/Kbd/caps.json")
        );
    }

    #[test]
    fn mappings_snapshot_round_trips() {
        let mappings = Mappings::from_table([(58u16, 29u16), (59, 60)].into());
        let json = serde_json::to_string(&mappings).unwrap();
        let back: Mappings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mappings);
    }
}
