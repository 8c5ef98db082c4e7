//! Static table of configured devices.
//!
//! The registry is built once at startup from a list of descriptors, checked
//! for consistency, and then shared read-only with every worker.

use crate::error::{Result, TuyaError};
use crate::protocol::Generation;
use log::info;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 6668;

/// Protocol version as written in `devices.json`: `3.3` or `"3.3"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VersionTag {
    Number(f64),
    Text(String),
}

impl VersionTag {
    pub fn generation(&self) -> Result<Generation> {
        match self {
            VersionTag::Number(n) => format!("{:.1}", n).parse(),
            VersionTag::Text(s) => s.parse(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubDeviceDescriptor {
    pub name: String,
    pub id: String,
    pub cid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub id: String,
    #[serde(alias = "ip")]
    pub address: String,
    pub key: String,
    pub version: VersionTag,
    #[serde(default, alias = "subDevices")]
    pub sub_devices: Vec<SubDeviceDescriptor>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Seconds between status polls
    #[serde(default)]
    pub poll_interval: Option<u64>,
}

/// A device reachable only through a gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDevice {
    pub name: String,
    pub id: String,
    /// Gateway-relative addressing token
    pub cid: String,
    pub gateway_id: String,
}

/// A top-level device with its own connection.
#[derive(Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub id: String,
    pub address: String,
    pub port: u16,
    pub local_key: Vec<u8>,
    pub generation: Generation,
    pub sub_devices: Vec<SubDevice>,
    pub poll_interval: Option<Duration>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("generation", &self.generation)
            .field("sub_devices", &self.sub_devices)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn sub_device_by_cid(&self, cid: &str) -> Option<&SubDevice> {
        self.sub_devices.iter().find(|s| s.cid == cid)
    }

    pub fn sub_device_by_id(&self, id: &str) -> Option<&SubDevice> {
        self.sub_devices.iter().find(|s| s.id == id)
    }

    pub fn is_gateway(&self) -> bool {
        !self.sub_devices.is_empty()
    }
}

/// What a configured name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Device(&'a Device),
    SubDevice(&'a Device, &'a SubDevice),
}

impl<'a> Target<'a> {
    /// The top-level device that owns the connection.
    pub fn device(&self) -> &'a Device {
        match self {
            Target::Device(d) | Target::SubDevice(d, _) => d,
        }
    }

    pub fn name(&self) -> &'a str {
        match self {
            Target::Device(d) => &d.name,
            Target::SubDevice(_, s) => &s.name,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Device(usize),
    SubDevice(usize, usize),
}

/// Immutable device table, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    devices: Vec<Device>,
    by_name: HashMap<String, Slot>,
    by_id: HashMap<String, Slot>,
}

impl DeviceRegistry {
    /// Builds and validates the registry.
    ///
    /// Names and identifiers must be unique across devices and sub-devices,
    /// addressing tokens unique within a gateway, and keys 16 bytes long.
    pub fn from_descriptors(descriptors: Vec<DeviceDescriptor>) -> Result<Self> {
        let mut inner = Inner::default();

        for desc in descriptors {
            let index = inner.devices.len();
            let device = build_device(desc)?;

            insert_unique(&mut inner.by_name, &device.name, Slot::Device(index))?;
            insert_unique(&mut inner.by_id, &device.id, Slot::Device(index))?;

            let mut tokens = HashSet::new();
            for (sub_index, sub) in device.sub_devices.iter().enumerate() {
                if !tokens.insert(sub.cid.as_str()) {
                    return Err(TuyaError::DuplicateDevice(format!(
                        "{} (cid {} on {})",
                        sub.name, sub.cid, device.name
                    )));
                }
                let slot = Slot::SubDevice(index, sub_index);
                insert_unique(&mut inner.by_name, &sub.name, slot)?;
                insert_unique(&mut inner.by_id, &sub.id, slot)?;
            }
            inner.devices.push(device);
        }

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let descriptors: Vec<DeviceDescriptor> = serde_json::from_str(text)
            .map_err(|e| TuyaError::Config(format!("invalid device list: {}", e)))?;
        Self::from_descriptors(descriptors)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| TuyaError::Config(format!("{}: {}", path.display(), e)))?;
        let registry = Self::from_json(&text)?;
        info!(
            "Loaded {} devices ({} sub-devices) from {}",
            registry.devices().len(),
            registry.devices().iter().map(|d| d.sub_devices.len()).sum::<usize>(),
            path.display()
        );
        Ok(registry)
    }

    pub fn devices(&self) -> &[Device] {
        &self.inner.devices
    }

    pub fn is_empty(&self) -> bool {
        self.inner.devices.is_empty()
    }

    /// Every device and sub-device name, in registry order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.devices.iter().flat_map(|d| {
            std::iter::once(d.name.as_str()).chain(d.sub_devices.iter().map(|s| s.name.as_str()))
        })
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        match self.inner.by_id.get(id)? {
            Slot::Device(i) => self.inner.devices.get(*i),
            Slot::SubDevice(..) => None,
        }
    }

    pub fn by_name(&self, name: &str) -> Option<Target<'_>> {
        self.resolve(*self.inner.by_name.get(name)?)
    }

    pub fn by_id(&self, id: &str) -> Option<Target<'_>> {
        self.resolve(*self.inner.by_id.get(id)?)
    }

    fn resolve(&self, slot: Slot) -> Option<Target<'_>> {
        match slot {
            Slot::Device(i) => self.inner.devices.get(i).map(Target::Device),
            Slot::SubDevice(i, j) => {
                let device = self.inner.devices.get(i)?;
                device
                    .sub_devices
                    .get(j)
                    .map(|sub| Target::SubDevice(device, sub))
            }
        }
    }
}

fn build_device(desc: DeviceDescriptor) -> Result<Device> {
    if desc.name.trim().is_empty() || desc.id.trim().is_empty() {
        return Err(TuyaError::Config(format!(
            "device '{}' needs a name and an id",
            desc.id
        )));
    }
    if desc.name.contains(['/', '+', '#']) {
        return Err(TuyaError::Config(format!(
            "device name '{}' is not usable in a topic",
            desc.name
        )));
    }
    if desc.address.trim().is_empty() {
        return Err(TuyaError::Config(format!("device '{}' has no address", desc.name)));
    }
    if desc.key.len() != 16 {
        return Err(TuyaError::Config(format!(
            "device '{}' key must be 16 bytes, got {}",
            desc.name,
            desc.key.len()
        )));
    }
    if desc.poll_interval == Some(0) {
        return Err(TuyaError::Config(format!(
            "device '{}' poll_interval must be positive",
            desc.name
        )));
    }
    let generation = desc
        .version
        .generation()
        .map_err(|e| TuyaError::Config(format!("device '{}': {}", desc.name, e)))?;

    let mut sub_devices = Vec::with_capacity(desc.sub_devices.len());
    for sub in desc.sub_devices {
        if sub.name.trim().is_empty() || sub.cid.trim().is_empty() {
            return Err(TuyaError::Config(format!(
                "sub-device '{}' of '{}' needs a name and a cid",
                sub.id, desc.name
            )));
        }
        if sub.name.contains(['/', '+', '#']) {
            return Err(TuyaError::Config(format!(
                "sub-device name '{}' is not usable in a topic",
                sub.name
            )));
        }
        sub_devices.push(SubDevice {
            name: sub.name,
            id: sub.id,
            cid: sub.cid,
            gateway_id: desc.id.clone(),
        });
    }

    Ok(Device {
        name: desc.name,
        id: desc.id,
        address: desc.address,
        port: desc.port.unwrap_or(DEFAULT_PORT),
        local_key: desc.key.into_bytes(),
        generation,
        sub_devices,
        poll_interval: desc.poll_interval.map(Duration::from_secs),
    })
}

fn insert_unique(map: &mut HashMap<String, Slot>, key: &str, slot: Slot) -> Result<()> {
    if map.insert(key.to_string(), slot).is_some() {
        return Err(TuyaError::DuplicateDevice(key.to_string()));
    }
    Ok(())
}
