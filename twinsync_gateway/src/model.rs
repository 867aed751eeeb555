// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared data model: the routing address, device lifecycle, sampled frames, and the plan
//! shapes users submit over ingress.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// The global address of a device instance - the routing key for both ingress and egress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    /// Tenant identifier
    pub tenant_id: String,
    /// Gateway identifier
    pub gateway_id: String,
    /// Device identifier
    pub device_id: String,
    /// Device type (e.g. `robot-fanuc`, `plc-allen-bradley`)
    pub device_type: String,
}

impl DeviceKey {
    /// Construct a new [`DeviceKey`].
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        gateway_id: impl Into<String>,
        device_id: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            gateway_id: gateway_id.into(),
            device_id: device_id.into(),
            device_type: device_type.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    /// Canonical string form: `{tenantId}/{gatewayId}/{deviceType}/{deviceId}`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.tenant_id, self.gateway_id, self.device_type, self.device_id
        )
    }
}

/// The lifecycle a [`crate::session::DeviceSessionBase`] walks through.
///
/// The happy path is `Disconnected -> Connecting -> Connected -> Streaming`. `Faulted` is
/// reachable from any state on an unrecoverable transport error, and always transitions to
/// `Disconnected` once cleanup completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceStatus {
    /// No transport connection, not attempting one.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Transport is connected, polling has not yet started.
    Connected,
    /// Transport is connected and the poll/stream loop is running.
    Streaming,
    /// An unrecoverable transport error occurred; cleanup is pending or in progress.
    Faulted,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Connecting => "connecting",
            DeviceStatus::Connected => "connected",
            DeviceStatus::Streaming => "streaming",
            DeviceStatus::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// One sampled snapshot from a robot, framed by its session-local sequence number.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryFrame {
    /// Unix timestamp in milliseconds at which the sample was taken.
    pub ts: i64,
    /// Monotonically increasing per-session sequence number (starts at 1).
    pub seq: u64,
    /// Six-axis joint position in degrees, from a `J=` line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joints_deg: Option<[f64; 6]>,
    /// Digital inputs, keyed by index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub di: Option<BTreeMap<i64, i64>>,
    /// Group inputs, keyed by index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gi: Option<BTreeMap<i64, i64>>,
    /// Group outputs, keyed by index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub go: Option<BTreeMap<i64, i64>>,
    /// Digital outputs, keyed by index.
    #[serde(rename = "do", skip_serializing_if = "Option::is_none")]
    pub d_out: Option<BTreeMap<i64, i64>>,
    /// Registers, keyed by index; `ERR` entries are omitted rather than represented.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r: Option<BTreeMap<i64, RegisterValue>>,
    /// Named variables, verbatim as reported by the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub var: Option<BTreeMap<String, String>>,
}

/// A robot register value, carrying both its integer and real interpretation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegisterValue {
    /// Integer interpretation
    #[serde(rename = "i")]
    pub int_val: i64,
    /// Real (floating point) interpretation
    #[serde(rename = "r")]
    pub real_val: f64,
}

/// One sampled snapshot from a PLC, framed by its session-local sequence number.
#[derive(Debug, Clone, Serialize)]
pub struct PlcFrame {
    /// Unix timestamp in milliseconds at which the sample was taken.
    pub ts: i64,
    /// Monotonically increasing per-session sequence number (starts at 1).
    pub seq: u64,
    /// Values keyed by the item path exactly as the user submitted it in their plan.
    pub values: BTreeMap<String, PlcValue>,
}

/// A sampled frame from either device family.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A frame from a [`crate::session::robot::RobotSession`].
    Telemetry(TelemetryFrame),
    /// A frame from a [`crate::session::plc::PlcSession`].
    Plc(PlcFrame),
}

impl Frame {
    /// The session-local sequence number this frame carries.
    #[must_use]
    pub fn seq(&self) -> u64 {
        match self {
            Frame::Telemetry(f) => f.seq,
            Frame::Plc(f) => f.seq,
        }
    }

    /// The timestamp (unix ms) this frame carries.
    #[must_use]
    pub fn ts(&self) -> i64 {
        match self {
            Frame::Telemetry(f) => f.ts,
            Frame::Plc(f) => f.ts,
        }
    }

    /// Overwrite this frame's sequence number.
    ///
    /// Hooks implementations read a frame without knowing their session's sequence counter (see
    /// [`crate::session::base::DeviceSessionBase`]'s non-cyclic ownership); the supervisor stamps
    /// the real value in just before broadcasting.
    pub fn set_seq(&mut self, seq: u64) {
        match self {
            Frame::Telemetry(f) => f.seq = seq,
            Frame::Plc(f) => f.seq = seq,
        }
    }
}

/// A PLC tag value. Recursive: array and struct members are themselves [`PlcValue`]s.
///
/// Always JSON-serializable as `{"k": <kind>, "v": <value>}`; `Array`/`Struct` members nest the
/// same shape.
#[derive(Debug, Clone, PartialEq)]
pub enum PlcValue {
    /// Absence of a value (e.g. an unreadable tag).
    Null,
    /// Boolean tag.
    Bool(bool),
    /// 32-bit signed integer tag.
    Int32(i32),
    /// 64-bit signed integer tag.
    Int64(i64),
    /// 32-bit floating point tag.
    Float(f32),
    /// 64-bit floating point tag.
    Double(f64),
    /// String tag.
    String(String),
    /// Raw byte tag, base64-encoded on the wire.
    Bytes(Vec<u8>),
    /// An array of tags, e.g. from a `path[a..b]` range read.
    Array(Vec<PlcValue>),
    /// A user-defined-type tag, expanded into its named members.
    Struct(BTreeMap<String, PlcValue>),
}

impl PlcValue {
    fn kind(&self) -> &'static str {
        match self {
            PlcValue::Null => "null",
            PlcValue::Bool(_) => "bool",
            PlcValue::Int32(_) => "int32",
            PlcValue::Int64(_) => "int64",
            PlcValue::Float(_) => "float",
            PlcValue::Double(_) => "double",
            PlcValue::String(_) => "string",
            PlcValue::Bytes(_) => "bytes",
            PlcValue::Array(_) => "array",
            PlcValue::Struct(_) => "struct",
        }
    }
}

impl Serialize for PlcValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("k", self.kind())?;
        match self {
            PlcValue::Null => map.serialize_entry("v", &())?,
            PlcValue::Bool(v) => map.serialize_entry("v", v)?,
            PlcValue::Int32(v) => map.serialize_entry("v", v)?,
            PlcValue::Int64(v) => map.serialize_entry("v", v)?,
            PlcValue::Float(v) => map.serialize_entry("v", v)?,
            PlcValue::Double(v) => map.serialize_entry("v", v)?,
            PlcValue::String(v) => map.serialize_entry("v", v)?,
            PlcValue::Bytes(v) => {
                use base64::Engine;
                map.serialize_entry("v", &base64::engine::general_purpose::STANDARD.encode(v))?;
            }
            PlcValue::Array(v) => map.serialize_entry("v", v)?,
            PlcValue::Struct(v) => map.serialize_entry("v", v)?,
        }
        map.end()
    }
}

/// A single user's telemetry subscription request for a robot session.
///
/// Missing fields MUST be treated as empty sets, never as an error - see `SPEC_FULL.md` §9's
/// note on the telemetry plan schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryPlan {
    /// Digital input indices of interest.
    pub di: Vec<i64>,
    /// Group input indices of interest.
    pub gi: Vec<i64>,
    /// Group output indices of interest.
    pub go: Vec<i64>,
    /// Digital output indices of interest.
    pub d_out: Vec<i64>,
    /// Register indices of interest.
    pub r: Vec<i64>,
    /// Variable names of interest.
    pub var: Vec<String>,
    /// Optional override for the stream loop's tick period, clamped to >= 50ms by the session.
    pub period_ms: Option<u64>,
}

/// One item of a [`MachineDataPlan`]: a tag path, optionally expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineDataPlanItem {
    /// Trimmed, non-empty tag path.
    pub path: String,
    /// `Some("udt")` to expand a user-defined-type tag into its members; `None` for a scalar
    /// (or array-range, via a `[a..b]` suffix in `path`) read.
    pub expand: Option<String>,
}

/// A single user's machine-data subscription request for a PLC session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineDataPlan {
    /// The requested items, in submission order.
    pub items: Vec<MachineDataPlanItem>,
    /// Optional override for the poll loop's soft-pacing period, clamped to >= 50ms.
    pub period_ms: Option<u64>,
}

/// Per-user, per-session plan state: the user's most recent plan and the wall-clock instant it
/// was last refreshed (by `apply` or by a heartbeat).
#[derive(Debug, Clone)]
pub struct UserPlanState<P> {
    /// The user's most recently submitted plan.
    pub plan: P,
    /// The instant this entry was last refreshed.
    pub last_seen: Instant,
}

impl<P> UserPlanState<P> {
    /// Create a new entry, stamped with the current instant.
    #[must_use]
    pub fn new(plan: P) -> Self {
        Self {
            plan,
            last_seen: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_key_canonical_form() {
        let key = DeviceKey::new("acme", "gw1", "R1", "robot-fanuc");
        assert_eq!(key.to_string(), "acme/gw1/robot-fanuc/R1");
    }

    #[test]
    fn device_key_equality_is_componentwise() {
        let a = DeviceKey::new("acme", "gw1", "R1", "robot-fanuc");
        let b = DeviceKey::new("acme", "gw1", "R1", "robot-fanuc");
        let c = DeviceKey::new("acme", "gw1", "R2", "robot-fanuc");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn plc_value_serializes_as_kind_value_pair() {
        let v = PlcValue::Int32(42);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["k"], "int32");
        assert_eq!(json["v"], 42);
    }

    #[test]
    fn plc_value_struct_nests_recursively() {
        let mut members = BTreeMap::new();
        members.insert("Run".to_string(), PlcValue::Bool(true));
        members.insert("FaultCode".to_string(), PlcValue::Int32(0));
        let v = PlcValue::Struct(members);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["k"], "struct");
        assert_eq!(json["v"]["Run"]["k"], "bool");
        assert_eq!(json["v"]["Run"]["v"], true);
    }
}
