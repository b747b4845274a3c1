//! Devices and the device registry.
//!
//! A [`Device`] is the root [`Module`] of a driver bound to its connection
//! settings and to the [`DeviceLink`] that serializes every call into the
//! instrument. The [`DeviceRegistry`] is the process-scoped service that opens
//! devices by name from their [`DeviceConfig`], keeps them open, and resolves
//! dotted addresses across all of them.
//!
//! # Example
//!
//! ```
//! use lab_sweep::config::DeviceConfig;
//! use lab_sweep::device::DeviceRegistry;
//!
//! let registry = DeviceRegistry::with_builtin_drivers();
//! registry.add_config(DeviceConfig::new("laser", "mock_instrument"))?;
//!
//! let laser = registry.open("laser")?;
//! let power = registry.resolve("laser.power")?;
//! assert_eq!(power.address(), "laser.power");
//! assert_eq!(laser.name(), "laser");
//! # Ok::<(), lab_sweep::error::LabError>(())
//! ```

use crate::config::{DeviceConfig, Settings};
use crate::element::{clean_name, DeviceLink, DriverModelProvider, Element, ElementEvent, Module};
use crate::error::{AppResult, LabError};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

// =============================================================================
// Address resolution
// =============================================================================

/// Anything that can turn a dotted address into a live element.
pub trait ElementResolver: Send + Sync {
    fn resolve_address(&self, address: &str) -> AppResult<Element>;
}

impl ElementResolver for Module {
    fn resolve_address(&self, address: &str) -> AppResult<Element> {
        match address.split_once('.') {
            Some((root, rest)) if root == self.name() => self.resolve_path(rest),
            _ => Err(LabError::not_found(address)),
        }
    }
}

// =============================================================================
// Device
// =============================================================================

/// A variable that could not be read while the device was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitFailure {
    /// Address of the variable
    pub address: String,
    /// Error message
    pub message: String,
}

/// An opened instrument.
pub struct Device {
    config: DeviceConfig,
    driver: Arc<dyn DriverModelProvider>,
    root: Arc<Module>,
    link: Arc<DeviceLink>,
    init_failures: Vec<InitFailure>,
}

impl Device {
    /// Builds the element tree of `driver` and performs the read-on-load pass.
    ///
    /// Tree construction errors abort the open. Read-on-load failures are
    /// logged and kept in [`init_failures`](Self::init_failures).
    pub fn open(config: DeviceConfig, driver: Arc<dyn DriverModelProvider>) -> AppResult<Self> {
        let link = DeviceLink::new(config.name.clone());
        let root = Arc::new(Module::build(&config.name, driver.clone(), &link)?);

        let mut init_failures = Vec::new();
        for variable in root.read_init_variables() {
            if let Err(e) = variable.read() {
                warn!(address = %variable.address(), error = %e, "read on load failed");
                init_failures.push(InitFailure {
                    address: variable.address().to_string(),
                    message: e.to_string(),
                });
            }
        }

        Ok(Self {
            config,
            driver,
            root,
            link,
            init_failures,
        })
    }

    /// Device name, root of its addresses.
    pub fn name(&self) -> &str {
        self.root.name()
    }

    /// Connection settings the device was opened with.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Root module of the element tree.
    pub fn root(&self) -> &Arc<Module> {
        &self.root
    }

    /// Variables whose read on open failed.
    pub fn init_failures(&self) -> &[InitFailure] {
        &self.init_failures
    }

    /// Notifications for every successful call on this device.
    pub fn subscribe(&self) -> broadcast::Receiver<ElementEvent> {
        self.link.subscribe()
    }

    /// Releases the driver.
    pub fn close(&self) -> AppResult<()> {
        let _guard = self.link.acquire();
        self.driver
            .close()
            .map_err(|source| LabError::Communication {
                address: self.name().to_string(),
                source,
            })
    }
}

impl ElementResolver for Device {
    fn resolve_address(&self, address: &str) -> AppResult<Element> {
        if address == self.name() {
            return Ok(Element::Module(self.root.clone()));
        }
        self.root.resolve_address(address)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("driver", &self.config.driver)
            .field("init_failures", &self.init_failures.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Creates a driver instance from its connection settings.
pub type DriverFactory =
    Arc<dyn Fn(&DeviceConfig) -> anyhow::Result<Arc<dyn DriverModelProvider>> + Send + Sync>;

/// Opened devices, configured connections and known drivers.
pub struct DeviceRegistry {
    factories: RwLock<HashMap<String, DriverFactory>>,
    configs: RwLock<IndexMap<String, DeviceConfig>>,
    devices: RwLock<IndexMap<String, Arc<Device>>>,
    opening: Mutex<()>,
}

impl DeviceRegistry {
    /// Empty registry without any driver.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            configs: RwLock::new(IndexMap::new()),
            devices: RwLock::new(IndexMap::new()),
            opening: Mutex::new(()),
        }
    }

    /// Registry knowing the simulated drivers of [`crate::hardware::mock`].
    pub fn with_builtin_drivers() -> Self {
        let registry = Self::new();
        crate::hardware::mock::register_drivers(&registry);
        registry
    }

    /// Registry with the built-in drivers and every device of `settings`.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        let registry = Self::with_builtin_drivers();
        for device in &settings.devices {
            registry.add_config(device.clone())?;
        }
        Ok(registry)
    }

    /// Registers the factory building drivers called `driver`.
    pub fn register_driver<F>(&self, driver: impl Into<String>, factory: F)
    where
        F: Fn(&DeviceConfig) -> anyhow::Result<Arc<dyn DriverModelProvider>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.write().insert(driver.into(), Arc::new(factory));
    }

    /// Adds or replaces the connection settings of a device.
    ///
    /// The name becomes the root of every address of the device, so it may
    /// not contain reserved characters.
    pub fn add_config(&self, config: DeviceConfig) -> AppResult<()> {
        if config.name.is_empty() || clean_name(&config.name) != config.name {
            return Err(LabError::configuration(
                &config.name,
                "device name is empty or contains reserved characters",
            ));
        }
        self.configs.write().insert(config.name.clone(), config);
        Ok(())
    }

    /// Names of the configured devices, open or not.
    pub fn configured_devices(&self) -> Vec<String> {
        self.configs.read().keys().cloned().collect()
    }

    /// Registered driver names, sorted.
    pub fn drivers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Opens the device called `name`, or returns it if it is already open.
    pub fn open(&self, name: &str) -> AppResult<Arc<Device>> {
        let _opening = self.opening.lock();
        if let Some(device) = self.get(name) {
            return Ok(device);
        }

        let config = self
            .configs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LabError::not_found(name))?;
        let factory = self
            .factories
            .read()
            .get(&config.driver)
            .cloned()
            .ok_or_else(|| {
                LabError::configuration(name, format!("unknown driver '{}'", config.driver))
            })?;

        let driver = factory(&config).map_err(|source| LabError::Communication {
            address: name.to_string(),
            source,
        })?;
        let device = Arc::new(Device::open(config, driver)?);

        info!(
            device = %device.name(),
            driver = %device.config().driver,
            init_failures = device.init_failures().len(),
            "device opened"
        );
        self.devices.write().insert(name.to_string(), device.clone());
        Ok(device)
    }

    /// Open device called `name`.
    pub fn get(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.read().get(name).cloned()
    }

    /// Whether the device called `name` is open.
    pub fn is_open(&self, name: &str) -> bool {
        self.devices.read().contains_key(name)
    }

    /// Names of the open devices, in opening order.
    pub fn list_open(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }

    /// Closes the device called `name`. Returns `false` if it was not open.
    pub fn close(&self, name: &str) -> AppResult<bool> {
        let Some(device) = self.devices.write().shift_remove(name) else {
            return Ok(false);
        };
        device.close()?;
        info!(device = %name, "device closed");
        Ok(true)
    }

    /// Closes every open device; failures are logged.
    pub fn close_all(&self) {
        let devices: Vec<_> = self.devices.write().drain(..).collect();
        for (name, device) in devices {
            match device.close() {
                Ok(()) => info!(device = %name, "device closed"),
                Err(e) => warn!(device = %name, error = %e, "device close failed"),
            }
        }
    }
}

impl ElementResolver for DeviceRegistry {
    /// Resolves `device.module.element` across the open devices.
    fn resolve_address(&self, address: &str) -> AppResult<Element> {
        let device_name = address.split('.').next().unwrap_or_default();
        let device = self
            .get(device_name)
            .ok_or_else(|| LabError::not_found(address))?;
        device.resolve_address(address)
    }
}

impl DeviceRegistry {
    /// Same as [`ElementResolver::resolve_address`], without importing the trait.
    pub fn resolve(&self, address: &str) -> AppResult<Element> {
        self.resolve_address(address)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
