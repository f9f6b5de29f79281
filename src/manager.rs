//! Process-wide injection registry.
//!
//! One manager per daemon. It owns the device-group cache, the global
//! config and every live [`Injector`], keyed by device-group key. The bus
//! binding layer serialises calls into it, so no internal locking is
//! needed.

use crate::devices::{self, DeviceGroupCache};
use crate::injector::{Injector, InjectorState};
use crate::mapping::{self, GlobalConfig, Mappings};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, error, info, warn};

#[derive(Default)]
pub struct Manager {
    config_dir: Option<PathBuf>,
    global_config: GlobalConfig,
    injectors: HashMap<String, Injector>,
    cache: DeviceGroupCache,
}

impl Manager {
    pub fn new() -> Self {
        debug!("creating manager");
        Self::default()
    }

    /// Liveness probe.
    pub fn hello(&self, out: &str) -> String {
        info!("received \"{out}\" in hello");
        out.to_string()
    }

    /// Record the config root and (re)load the global config from it. The
    /// directory is stored even when no config file exists there yet.
    pub fn set_config_dir(&mut self, dir: &Path) {
        info!("using config directory \"{}\"", dir.display());
        self.config_dir = Some(dir.to_path_buf());

        match GlobalConfig::load(&mapping::global_config_path(dir)) {
            Ok(config) => self.global_config = config,
            Err(err) => warn!("{err:#}"),
        }
    }

    /// Re-enumerate when the cache is stale or does not know `key`.
    fn refresh(&mut self, key: Option<&str>) {
        if self.cache.needs_refresh(key) {
            self.refresh_now();
        }
    }

    fn refresh_now(&mut self) {
        debug!("refreshing device list");
        // Give the kernel a moment to settle device nodes that may have
        // just (dis)appeared.
        thread::sleep(devices::SETTLE_DELAY);

        let result = devices::scan_detached();
        self.cache.install(result.recv().unwrap_or_default());
        debug!("finished refreshing");
    }

    /// Start (or restart) injecting `preset` into the group at
    /// `device_key`. Returns whether an injection was started.
    pub fn inject(&mut self, device_key: &str, preset: &str) -> bool {
        let Some(config_dir) = self.config_dir.clone() else {
            error!("cannot inject, no config directory has been set");
            return false;
        };

        self.refresh(Some(device_key));
        let Some(group) = self.cache.find(device_key).cloned() else {
            error!("cannot inject, unknown device \"{device_key}\"");
            return false;
        };

        let preset_path = mapping::preset_path(&config_dir, &group.name, preset);
        let mappings = match Mappings::load(&preset_path) {
            Ok(mappings) => mappings,
            Err(err) => {
                error!("{err:#}");
                return false;
            }
        };

        // Two injectors must never hold the same nodes: stop and reap any
        // previous injection for this group before starting the next one.
        if let Some(mut previous) = self.injectors.remove(&group.key) {
            previous.stop_injecting();
        }

        match Injector::spawn(group.clone(), mappings) {
            Ok(injector) => {
                self.injectors.insert(group.key.clone(), injector);
                true
            }
            Err(err) => {
                error!("failed to start injection for \"{device_key}\": {err:#}");
                false
            }
        }
    }

    pub fn stop_inject(&mut self, device_key: &str) {
        match self.injectors.get_mut(device_key) {
            Some(injector) => injector.stop_injecting(),
            None => info!("no injection to stop for \"{device_key}\""),
        }
    }

    /// Start every injection listed in the global config's autoload table.
    /// Devices that are missing or fail to start are logged and skipped.
    pub fn autoload(&mut self) -> bool {
        if self.config_dir.is_none() {
            error!("cannot autoload, no config directory has been set");
            return false;
        }

        self.refresh_now();

        let entries: Vec<(String, String)> = self
            .global_config
            .autoload()
            .map(|(key, preset)| (key.to_string(), preset.to_string()))
            .collect();
        for (device_key, preset) in entries {
            if !self.inject(&device_key, &preset) {
                warn!("autoload skipped device \"{device_key}\"");
            }
        }
        true
    }

    /// Autoload the configured preset for a single device key.
    pub fn autoload_single(&mut self, device_key: &str) -> bool {
        if self.config_dir.is_none() {
            error!("cannot autoload, no config directory has been set");
            return false;
        }

        self.refresh_now();

        let Some(preset) = self.global_config.preset_for(device_key).map(str::to_string)
        else {
            error!("no autoload entry for device \"{device_key}\"");
            return false;
        };
        self.inject(device_key, &preset)
    }

    pub fn stop_all(&mut self) {
        info!("stopping all injections");
        for injector in self.injectors.values_mut() {
            injector.stop_injecting();
        }
    }

    /// State code of the injection for `device_key`, UNKNOWN when none was
    /// ever started.
    pub fn get_state(&mut self, device_key: &str) -> i32 {
        match self.injectors.get_mut(device_key) {
            Some(injector) => injector.get_state().code(),
            None => InjectorState::Unknown.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_echoes() {
        let manager = Manager::new();
        assert_eq!(manager.hello("hi"), "hi");
    }

    #[test]
    fn inject_requires_config_dir() {
        let mut manager = Manager::new();
        assert!(!manager.inject("some key", "preset"));
    }

    #[test]
    fn autoload_requires_config_dir() {
        let mut manager = Manager::new();
        assert!(!manager.autoload());
        assert!(!manager.autoload_single("some key"));
    }

    #[test]
    fn unknown_device_state_is_unknown() {
        let mut manager = Manager::new();
        assert_eq!(manager.get_state("nope"), InjectorState::Unknown.code());
    }

    #[test]
    fn stop_inject_on_unknown_key_is_a_no_op() {
        let mut manager = Manager::new();
        manager.stop_inject("nope");
        manager.stop_all();
    }

    #[test]
    fn config_dir_is_stored_even_without_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = Manager::new();
        manager.set_config_dir(dir.path());
        // No config.json exists, but autoload now passes the config-dir
        // check (and simply has nothing to load).
        assert!(manager.autoload());
    }
}
