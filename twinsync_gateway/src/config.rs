// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-device transport configuration, and the gateway's own tenant/gateway identity.
//!
//! Per-device transport configs (`RobotConfig`, `PlcConfig`) are plain structs assembled by the
//! embedding binary - no config-file parser is implemented in this crate (file-backed config
//! stores are an explicit non-goal; only the structs they would populate are specified here).
//! `GatewayIdentity` is the one piece of ambient configuration this crate does assemble, via a
//! `derive_builder` builder with an `from_environment()` constructor, mirroring
//! `gateway_mqtt::MqttConnectionSettingsBuilder`.

use std::env::{self, VarError};
use std::time::Duration;

/// Connection and timeout configuration for a [`crate::transport::robot::RobotTransport`].
#[derive(Debug, Clone)]
pub struct RobotConfig {
    /// Human-readable name, used in logs and the device roster.
    pub name: String,
    /// IP address or hostname of the robot controller.
    pub ip: String,
    /// TCP port of the robot's line-protocol socket.
    pub port: u16,
    /// Deadline for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Deadline for one `GET_FAST` request/response cycle.
    pub read_timeout: Duration,
}

impl RobotConfig {
    /// Construct a [`RobotConfig`] with the gateway's default timeouts
    /// (connect: 5s, read: 500ms, per `SPEC_FULL.md` §4.2).
    #[must_use]
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_millis(500),
        }
    }
}

/// Connection, timeout, and resource-cap configuration for a
/// [`crate::transport::plc::PlcTransport`].
#[derive(Debug, Clone)]
pub struct PlcConfig {
    /// Human-readable name, used in logs and the device roster.
    pub name: String,
    /// IP address or hostname of the PLC.
    pub ip: String,
    /// TCP port of the PLC's tag-read service.
    pub port: u16,
    /// Backplane slot number (chassis-based PLCs).
    pub slot: u8,
    /// PLC family/model identifier, used to select the wire dialect of a native adapter.
    pub plc_type: String,
    /// CIP/tag-service routing path, if the PLC requires one.
    pub path: String,
    /// Default soft-pace period between poll iterations, clamped to >= 50ms by the session.
    pub default_period_ms: u64,
    /// Per-iteration read deadline, in milliseconds.
    pub timeout_ms: u64,
    /// Maximum number of items the union plan may hold after truncation.
    pub max_items: usize,
    /// Maximum number of elements read from an `[a..b]` array-range item.
    pub max_array_elements: usize,
    /// Maximum number of members read from a `udt`-expanded item.
    pub max_struct_fields: usize,
}

impl PlcConfig {
    /// Construct a [`PlcConfig`] with the gateway's defaults
    /// (period: 200ms, timeout: 200ms, `max_items`: 50, per `SPEC_FULL.md` §4.3).
    #[must_use]
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port,
            slot: 0,
            plc_type: String::new(),
            path: String::new(),
            default_period_ms: 200,
            timeout_ms: 200,
            max_items: 50,
            max_array_elements: 64,
            max_struct_fields: 32,
        }
    }
}

/// Gateway-wide identity, shared by every session's [`crate::model::DeviceKey`], the ingress
/// router (to reject topics addressed to a different tenant/gateway), and the egress/roster
/// publishers.
#[derive(Builder, Debug, Clone)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct GatewayIdentity {
    /// Tenant identifier this gateway instance belongs to.
    pub tenant_id: String,
    /// This gateway instance's identifier.
    pub gateway_id: String,
}

impl GatewayIdentity {
    /// Construct a [`GatewayIdentity`] directly, bypassing the builder.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, gateway_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            gateway_id: gateway_id.into(),
        }
    }
}

impl GatewayIdentityBuilder {
    /// Initialize the builder from `TWINSYNC_TENANT_ID` / `TWINSYNC_GATEWAY_ID`.
    ///
    /// # Errors
    /// Returns a `String` describing the error if either environment variable is set but not
    /// valid Unicode.
    pub fn from_environment() -> Result<Self, String> {
        let tenant_id = string_from_environment("TWINSYNC_TENANT_ID")?;
        let gateway_id = string_from_environment("TWINSYNC_GATEWAY_ID")?;
        if tenant_id.is_none() {
            log::warn!("TWINSYNC_TENANT_ID is not set in environment");
        }
        if gateway_id.is_none() {
            log::warn!("TWINSYNC_GATEWAY_ID is not set in environment");
        }
        Ok(Self {
            tenant_id,
            gateway_id,
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.tenant_id.as_deref().unwrap_or_default().is_empty() {
            return Err("tenant_id cannot be empty".to_string());
        }
        if self.gateway_id.as_deref().unwrap_or_default().is_empty() {
            return Err("gateway_id cannot be empty".to_string());
        }
        Ok(())
    }
}

fn string_from_environment(key: &str) -> Result<Option<String>, String> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => {
            Err(format!("{key}: could not parse non-unicode environment variable"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_requires_nonempty_tenant_and_gateway() {
        assert!(GatewayIdentityBuilder::default()
            .tenant_id("acme")
            .gateway_id("gw1")
            .build()
            .is_ok());
        assert!(GatewayIdentityBuilder::default()
            .tenant_id("")
            .gateway_id("gw1")
            .build()
            .is_err());
    }
}
