//! Device enumeration and grouping.
//!
//! One physical device usually exposes several event nodes. Nodes are
//! grouped by a stable identifier derived from bus/vendor/product and the
//! physical path, and each group gets a human-readable key the daemon's
//! clients address it by.

use crate::capabilities::Capabilities;
use evdev::{Device, EventType, Key, RelativeAxisType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

const INPUT_DIR: &str = "/dev/input";

/// Synthetic devices created by this service carry this name prefix and are
/// excluded from enumeration so an injection never grabs its own output.
pub const SYNTHETIC_PREFIX: &str = "ev-remapper";

/// Device names that are never worth remapping.
const IGNORED_NAMES: &[&str] = &["Power Button", "Sleep Button"];

/// Minimum wall-clock distance between two full enumerations.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Grace period for the kernel to settle freshly created device nodes.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Keyboard,
    Mouse,
    Unknown,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Keyboard => write!(f, "keyboard"),
            DeviceType::Mouse => write!(f, "mouse"),
            DeviceType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classify a node from its capability set.
///
/// A mouse must expose X/Y/wheel relative motion plus a left button; a
/// keyboard is anything with a letter key.
pub fn classify(caps: &Capabilities) -> DeviceType {
    let rel = caps.codes(EventType::RELATIVE.0);
    let is_mouse = [
        RelativeAxisType::REL_X.0,
        RelativeAxisType::REL_Y.0,
        RelativeAxisType::REL_WHEEL.0,
    ]
    .iter()
    .all(|axis| rel.contains(axis))
        && caps.supports(EventType::KEY.0, Key::BTN_LEFT.0);

    if is_mouse {
        DeviceType::Mouse
    } else if caps.supports(EventType::KEY.0, Key::KEY_A.0) {
        DeviceType::Keyboard
    } else {
        DeviceType::Unknown
    }
}

/// Stable identifier shared by all nodes of one physical device.
pub fn device_identifier(bustype: u16, vendor: u16, product: u16, phys: &str) -> String {
    let mut prefix = phys.split('/').next().unwrap_or("");
    if prefix.is_empty() {
        prefix = "-";
    }
    format!("{bustype}{vendor}_{product}_{prefix}")
}

/// The set of event nodes belonging to one physical device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceGroup {
    /// Unique key clients address this group by.
    pub key: String,
    /// Primary name: the shortest of the node names.
    pub name: String,
    pub paths: Vec<PathBuf>,
    pub names: Vec<String>,
    pub types: Vec<DeviceType>,
}

/// One event node as seen during a scan, before grouping.
#[derive(Debug, Clone)]
pub struct ScannedNode {
    pub path: PathBuf,
    pub name: String,
    pub device_type: DeviceType,
    pub identifier: String,
}

/// Fold scanned nodes into device groups, assigning each group a unique key.
///
/// The key starts as the shortest node name; clashes with earlier groups in
/// the same scan get a `" 2"`, `" 3"`, ... suffix.
pub fn group_nodes(nodes: Vec<ScannedNode>) -> Vec<DeviceGroup> {
    let mut buckets: Vec<(String, Vec<ScannedNode>)> = Vec::new();
    for node in nodes {
        match buckets.iter_mut().find(|(id, _)| *id == node.identifier) {
            Some((_, members)) => members.push(node),
            None => buckets.push((node.identifier.clone(), vec![node])),
        }
    }

    let mut used_keys: Vec<String> = Vec::new();
    let mut groups = Vec::new();
    for (_, members) in buckets {
        let base = members
            .iter()
            .map(|node| node.name.as_str())
            .min_by_key(|name| name.len())
            .unwrap_or_default()
            .to_string();

        let mut key = base.clone();
        let mut n = 2;
        while used_keys.contains(&key) {
            key = format!("{base} {n}");
            n += 1;
        }
        used_keys.push(key.clone());

        groups.push(DeviceGroup {
            key,
            name: base,
            paths: members.iter().map(|node| node.path.clone()).collect(),
            names: members.iter().map(|node| node.name.clone()).collect(),
            types: members.iter().map(|node| node.device_type).collect(),
        });
    }

    groups
}

fn event_nodes(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("event"))
            })
            .collect(),
        Err(err) => {
            error!("failed to read {}: {err}", dir.display());
            Vec::new()
        }
    };
    paths.sort();
    paths
}

/// Enumerate every event node and partition them into device groups.
///
/// Individual nodes that cannot be opened are logged and skipped; the scan
/// itself never fails.
pub fn scan() -> Vec<DeviceGroup> {
    debug!("searching for valid device paths");

    let mut nodes = Vec::new();
    for path in event_nodes(Path::new(INPUT_DIR)) {
        let dev = match Device::open(&path) {
            Ok(dev) => dev,
            Err(err) => {
                error!("failed to access {}: {err}", path.display());
                continue;
            }
        };

        let name = dev.name().unwrap_or_default().to_string();
        if IGNORED_NAMES.contains(&name.as_str()) || name.starts_with(SYNTHETIC_PREFIX) {
            continue;
        }

        let caps = match Capabilities::from_device(&dev, false) {
            Ok(caps) => caps,
            Err(err) => {
                error!("failed to read capabilities of {}: {err}", path.display());
                continue;
            }
        };
        if caps.codes(EventType::KEY.0).is_empty() {
            continue;
        }

        let device_type = classify(&caps);
        let id = dev.input_id();
        let identifier = device_identifier(
            id.bus_type().0,
            id.vendor(),
            id.product(),
            dev.physical_path().unwrap_or_default(),
        );

        debug!(
            "found {device_type} device \"{name}\"(\"{identifier}\") at {}",
            path.display()
        );

        nodes.push(ScannedNode {
            path,
            name,
            device_type,
            identifier,
        });
    }

    group_nodes(nodes)
}

/// Run a scan on a worker thread, delivering the full result over a
/// one-shot channel.
pub fn scan_detached() -> mpsc::Receiver<Vec<DeviceGroup>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(scan());
    });
    rx
}

/// The manager's cache of the last enumeration result.
///
/// Enumeration opens every event node, so results are reused for
/// [`REFRESH_INTERVAL`] unless a caller asks for a group the cache does not
/// contain.
#[derive(Debug, Default)]
pub struct DeviceGroupCache {
    groups: Vec<DeviceGroup>,
    refreshed_at: Option<Instant>,
}

impl DeviceGroupCache {
    pub fn find(&self, key: &str) -> Option<&DeviceGroup> {
        self.groups.iter().find(|group| group.key == key)
    }

    pub fn groups(&self) -> &[DeviceGroup] {
        &self.groups
    }

    /// Whether a lookup for `key` warrants a new enumeration.
    pub fn needs_refresh(&self, key: Option<&str>) -> bool {
        let stale = self
            .refreshed_at
            .is_none_or(|at| at.elapsed() >= REFRESH_INTERVAL);
        let missing = key.is_some_and(|key| self.find(key).is_none());
        stale || missing
    }

    /// Replace the cached result and reset the staleness clock.
    pub fn install(&mut self, groups: Vec<DeviceGroup>) {
        self.groups = groups;
        self.refreshed_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn caps_with(events: &[(u16, &[u16])]) -> Capabilities {
        Capabilities {
            events: events
                .iter()
                .map(|&(ty, codes)| (ty, codes.to_vec()))
                .collect::<BTreeMap<_, _>>(),
            ..Default::default()
        }
    }

    fn node(name: &str, identifier: &str, path: &str) -> ScannedNode {
        ScannedNode {
            path: PathBuf::from(path),
            name: name.to_string(),
            device_type: DeviceType::Keyboard,
            identifier: identifier.to_string(),
        }
    }

    #[test]
    fn classify_mouse_needs_all_axes_and_button() {
        let mouse = caps_with(&[
            (
                EventType::RELATIVE.0,
                &[
                    RelativeAxisType::REL_X.0,
                    RelativeAxisType::REL_Y.0,
                    RelativeAxisType::REL_WHEEL.0,
                ],
            ),
            (EventType::KEY.0, &[Key::BTN_LEFT.0]),
        ]);
        assert_eq!(classify(&mouse), DeviceType::Mouse);

        let wheel_less = caps_with(&[
            (
                EventType::RELATIVE.0,
                &[RelativeAxisType::REL_X.0, RelativeAxisType::REL_Y.0],
            ),
            (EventType::KEY.0, &[Key::BTN_LEFT.0]),
        ]);
        assert_eq!(classify(&wheel_less), DeviceType::Unknown);
    }

    #[test]
    fn classify_keyboard_by_letter_key() {
        let kbd = caps_with(&[(EventType::KEY.0, &[Key::KEY_A.0, Key::KEY_B.0])]);
        assert_eq!(classify(&kbd), DeviceType::Keyboard);

        let pad = caps_with(&[(EventType::KEY.0, &[Key::BTN_LEFT.0])]);
        assert_eq!(classify(&pad), DeviceType::Unknown);
    }

    #[test]
    fn identifier_uses_phys_prefix() {
        assert_eq!(
            device_identifier(3, 1133, 49948, "usb-0000:00:14.0-2/input0"),
            "31133_49948_usb-0000:00:14.0-2"
        );
        assert_eq!(device_identifier(17, 1, 1, ""), "171_1_-");
    }

    #[test]
    fn grouping_collects_nodes_by_identifier() {
        let groups = group_nodes(vec![
            node("Logitech Keyboard", "a", "/dev/input/event3"),
            node("Logitech Keyboard Consumer Control", "a", "/dev/input/event4"),
            node("Some Mouse", "b", "/dev/input/event5"),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "Logitech Keyboard");
        assert_eq!(groups[0].paths.len(), 2);
        assert_eq!(groups[1].key, "Some Mouse");
    }

    #[test]
    fn group_keys_are_unique_within_a_scan() {
        let groups = group_nodes(vec![
            node("Duplicate", "a", "/dev/input/event0"),
            node("Duplicate", "b", "/dev/input/event1"),
            node("Duplicate", "c", "/dev/input/event2"),
        ]);

        assert_eq!(groups[0].key, "Duplicate");
        assert_eq!(groups[1].key, "Duplicate 2");
        assert_eq!(groups[2].key, "Duplicate 3");
        assert!(groups.iter().all(|group| group.name == "Duplicate"));
    }

    #[test]
    fn shortest_name_wins_ties_by_first_occurrence() {
        let groups = group_nodes(vec![
            node("BB Device Extra", "a", "/dev/input/event0"),
            node("AA first", "a", "/dev/input/event1"),
            node("BB other", "a", "/dev/input/event2"),
        ]);
        assert_eq!(groups[0].name, "AA first");
    }

    #[test]
    fn cache_debounces_within_interval() {
        let mut cache = DeviceGroupCache::default();
        assert!(cache.needs_refresh(None));

        cache.install(group_nodes(vec![node("Kbd", "a", "/dev/input/event0")]));
        assert!(!cache.needs_refresh(None));
        assert!(!cache.needs_refresh(Some("Kbd")));
        assert!(cache.needs_refresh(Some("missing")));
    }

    #[test]
    fn group_round_trips_through_json() {
        let groups = group_nodes(vec![node("Kbd", "a", "/dev/input/event0")]);
        let json = serde_json::to_string(&groups[0]).unwrap();
        let back: DeviceGroup = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, "Kbd");
        assert_eq!(back.paths, groups[0].paths);
        assert_eq!(back.types, vec![DeviceType::Keyboard]);
    }
}
