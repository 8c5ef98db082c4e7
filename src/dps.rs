//! Data points and the JSON payloads that carry them.
//!
//! DP values are kept as an explicit tagged variant so a value never changes
//! kind on its way between the wire and the broker.

use crate::error::{Result, TuyaError};
use crate::protocol::{CommandType, Generation};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fmt;

const KEY_CID: &str = "cid";
const KEY_CTYPE: &str = "ctype";
const KEY_DATA: &str = "data";
const KEY_DEV_ID: &str = "devId";
const KEY_DPS: &str = "dps";
const KEY_GW_ID: &str = "gwId";
const KEY_PROTOCOL: &str = "protocol";
const KEY_T: &str = "t";
const KEY_UID: &str = "uid";

/// DP keys are small positive integers.
pub type DpKey = u32;

/// A device state snapshot or a set of values to write.
pub type DpMap = BTreeMap<DpKey, DpValue>;

/// A single data point value.
#[derive(Debug, Clone, PartialEq)]
pub enum DpValue {
    Bool(bool),
    Int(i64),
    Str(String),
    /// Anything else the device reports (floats, objects, arrays, null)
    Raw(Value),
}

impl DpValue {
    pub fn kind(&self) -> &'static str {
        match self {
            DpValue::Bool(_) => "bool",
            DpValue::Int(_) => "int",
            DpValue::Str(_) => "string",
            DpValue::Raw(_) => "raw",
        }
    }

    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Bool(b) => DpValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => DpValue::Int(i),
                None => DpValue::Raw(value.clone()),
            },
            Value::String(s) => DpValue::Str(s.clone()),
            other => DpValue::Raw(other.clone()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            DpValue::Bool(b) => Value::Bool(*b),
            DpValue::Int(i) => Value::from(*i),
            DpValue::Str(s) => Value::String(s.clone()),
            DpValue::Raw(v) => v.clone(),
        }
    }

    /// Parses a command payload received from the broker.
    ///
    /// `on`/`true` and `off`/`false` are booleans, numbers become integers
    /// (decimals are truncated), JSON objects and arrays are kept raw and
    /// anything else is a string.
    pub fn parse_command(raw: &str) -> Option<Self> {
        let text = raw.trim();
        if text.is_empty() {
            return None;
        }
        match text.to_ascii_lowercase().as_str() {
            "on" | "true" => return Some(DpValue::Bool(true)),
            "off" | "false" => return Some(DpValue::Bool(false)),
            _ => {}
        }
        if let Ok(i) = text.parse::<i64>() {
            return Some(DpValue::Int(i));
        }
        if let Ok(f) = text.parse::<f64>() {
            if f.is_finite() && f.abs() < i64::MAX as f64 {
                return Some(DpValue::Int(f.trunc() as i64));
            }
        }
        if text.starts_with('{') || text.starts_with('[') {
            if let Ok(v) = serde_json::from_str::<Value>(text) {
                return Some(DpValue::Raw(v));
            }
        }
        Some(DpValue::Str(text.to_string()))
    }
}

impl fmt::Display for DpValue {
    /// Broker payload form: strings unquoted, everything else as JSON text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DpValue::Bool(b) => write!(f, "{}", b),
            DpValue::Int(i) => write!(f, "{}", i),
            DpValue::Str(s) => f.write_str(s),
            DpValue::Raw(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for DpValue {
    fn from(b: bool) -> Self {
        DpValue::Bool(b)
    }
}

impl From<i64> for DpValue {
    fn from(i: i64) -> Self {
        DpValue::Int(i)
    }
}

impl From<&str> for DpValue {
    fn from(s: &str) -> Self {
        DpValue::Str(s.to_string())
    }
}

/// Serializes a DP map as the `{"<key>": value}` object used on the wire.
pub fn dps_to_json(dps: &DpMap) -> Value {
    let obj: Map<String, Value> = dps
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_json()))
        .collect();
    Value::Object(obj)
}

/// Reads a `{"<key>": value}` object. Keys that are not small integers are
/// skipped.
pub fn dps_from_json(value: &Value) -> DpMap {
    let Some(obj) = value.as_object() else {
        return DpMap::new();
    };
    obj.iter()
        .filter_map(|(k, v)| k.parse::<DpKey>().ok().map(|key| (key, DpValue::from_json(v))))
        .collect()
}

/// Builds JSON request bodies for one top-level device.
///
/// Gateway sub-devices are addressed by passing their `cid`.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    device_id: String,
    generation: Generation,
}

impl PayloadBuilder {
    pub fn new(device_id: impl Into<String>, generation: Generation) -> Self {
        Self {
            device_id: device_id.into(),
            generation,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Status query; returns the generation-specific command and body.
    pub fn query(&self, cid: Option<&str>, t: u64) -> (CommandType, Value) {
        let cmd = self.generation.command_for(CommandType::DpQuery);
        if self.generation >= Generation::V3_4 && cid.is_none() {
            return (cmd, json!({}));
        }
        (cmd, self.legacy_body(cid, t, None))
    }

    /// Control request writing `dps`.
    pub fn control(&self, cid: Option<&str>, dps: &DpMap, t: u64) -> (CommandType, Value) {
        let cmd = self.generation.command_for(CommandType::Control);
        if self.generation >= Generation::V3_4 {
            let mut data = Map::new();
            if let Some(c) = cid {
                data.insert(KEY_CID.into(), c.into());
                data.insert(KEY_CTYPE.into(), 0.into());
            }
            data.insert(KEY_DPS.into(), dps_to_json(dps));
            let body = json!({
                KEY_PROTOCOL: 5,
                KEY_T: t,
                KEY_DATA: Value::Object(data),
            });
            return (cmd, body);
        }
        (cmd, self.legacy_body(cid, t, Some(dps)))
    }

    pub fn heartbeat(&self) -> (CommandType, Value) {
        (
            CommandType::HeartBeat,
            json!({ KEY_GW_ID: self.device_id, KEY_DEV_ID: self.device_id }),
        )
    }

    fn legacy_body(&self, cid: Option<&str>, t: u64, dps: Option<&DpMap>) -> Value {
        let id = self.device_id.as_str();
        let mut body = Map::new();
        body.insert(KEY_GW_ID.into(), id.into());
        body.insert(KEY_DEV_ID.into(), cid.unwrap_or(id).into());
        body.insert(KEY_UID.into(), id.into());
        body.insert(KEY_T.into(), t.to_string().into());
        if let Some(c) = cid {
            body.insert(KEY_CID.into(), c.into());
        }
        if let Some(d) = dps {
            body.insert(KEY_DPS.into(), dps_to_json(d));
        }
        Value::Object(body)
    }
}

/// A decoded status or control payload: which node it concerns and its DPs.
#[derive(Debug, Clone, PartialEq)]
pub struct DpReport {
    pub cid: Option<String>,
    pub dps: DpMap,
}

/// Extracts the addressing token and DPs from a device payload.
///
/// Both the flat layout (`{"cid":..,"dps":{..}}`) and the nested 3.4+ layout
/// (`{"data":{"cid":..,"dps":{..}}}`) are understood. Returns `None` when the
/// payload carries no `dps` object at all.
pub fn parse_report(payload: &Value) -> Option<DpReport> {
    let scope = match payload.get(KEY_DATA) {
        Some(data) if data.get(KEY_DPS).is_some() => data,
        _ => payload,
    };
    let dps = scope.get(KEY_DPS)?;
    if !dps.is_object() {
        return None;
    }
    let cid = scope
        .get(KEY_CID)
        .or_else(|| payload.get(KEY_CID))
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    Some(DpReport {
        cid,
        dps: dps_from_json(dps),
    })
}

/// Parses raw frame bytes as a JSON payload.
pub fn parse_payload(bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(TuyaError::from)
}
