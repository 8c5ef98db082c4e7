//! Gateway addressing: splits gateway payloads per sub-device and builds
//! gateway-addressed requests for sub-devices.

use crate::dps::{DpMap, PayloadBuilder, parse_report};
use crate::error::{Result, TuyaError};
use crate::protocol::CommandType;
use crate::registry::Device;
use log::warn;
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the `t` field in outgoing payloads.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    })
}

/// DPs attributed to one node (the gateway itself or one of its sub-devices).
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub id: String,
    pub name: String,
    pub dps: DpMap,
}

/// Per-gateway router; also used for plain devices, which simply never carry
/// an addressing token.
#[derive(Clone)]
pub struct SubDeviceRouter {
    device: Arc<Device>,
    builder: PayloadBuilder,
    clock: Clock,
}

impl SubDeviceRouter {
    pub fn new(device: Arc<Device>) -> Self {
        Self::with_clock(device, system_clock())
    }

    pub fn with_clock(device: Arc<Device>, clock: Clock) -> Self {
        let builder = PayloadBuilder::new(device.id.clone(), device.generation);
        Self {
            device,
            builder,
            clock,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn now(&self) -> u64 {
        (self.clock)()
    }

    /// Attributes a decoded payload to the node it concerns.
    ///
    /// Payloads without an addressing token belong to the gateway. Tokens that
    /// are not configured are dropped with a warning.
    pub fn demux(&self, payload: &Value) -> Vec<Routed> {
        let Some(report) = parse_report(payload) else {
            return Vec::new();
        };

        let node = match report.cid.as_deref() {
            None => Routed {
                id: self.device.id.clone(),
                name: self.device.name.clone(),
                dps: report.dps,
            },
            Some(cid) => match self.device.sub_device_by_cid(cid) {
                Some(sub) => Routed {
                    id: sub.id.clone(),
                    name: sub.name.clone(),
                    dps: report.dps,
                },
                // Some firmware echoes the gateway's own id as cid
                None if cid == self.device.id => Routed {
                    id: self.device.id.clone(),
                    name: self.device.name.clone(),
                    dps: report.dps,
                },
                None => {
                    warn!(
                        "Dropping data for unknown sub-device cid {} on {}",
                        cid, self.device.name
                    );
                    return Vec::new();
                }
            },
        };
        vec![node]
    }

    /// Builds the gateway-addressed control request for a sub-device.
    pub fn mux(&self, sub_id: &str, dps: &DpMap) -> Result<(CommandType, Value)> {
        let cid = self.cid_for(sub_id)?;
        Ok(self.builder.control(Some(cid), dps, self.now()))
    }

    /// Control request for the gateway itself or, with `sub_id`, one of its
    /// sub-devices.
    pub fn control(&self, sub_id: Option<&str>, dps: &DpMap) -> Result<(CommandType, Value)> {
        match sub_id {
            Some(id) => self.mux(id, dps),
            None => Ok(self.builder.control(None, dps, self.now())),
        }
    }

    /// Status queries for the device and every configured sub-device.
    pub fn queries(&self) -> Vec<(CommandType, Value)> {
        let t = self.now();
        std::iter::once(self.builder.query(None, t))
            .chain(
                self.device
                    .sub_devices
                    .iter()
                    .map(|sub| self.builder.query(Some(&sub.cid), t)),
            )
            .collect()
    }

    pub fn heartbeat(&self) -> (CommandType, Value) {
        self.builder.heartbeat()
    }

    fn cid_for(&self, sub_id: &str) -> Result<&str> {
        self.device
            .sub_device_by_id(sub_id)
            .map(|s| s.cid.as_str())
            .ok_or_else(|| TuyaError::SubDeviceNotFound(sub_id.to_string()))
    }
}
