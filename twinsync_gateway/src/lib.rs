// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! The TwinSync industrial edge gateway: device sessions for robots and PLCs, an ingress router
//! for per-user subscription plans, and an egress pump/roster publisher that stream device data
//! and fleet state back out over MQTT.
//!
//! See [`config`] for how a deployment assembles its device/gateway configuration, [`session`]
//! for the device supervisor and its two families, [`ingress`] for the inbound plan/heartbeat/
//! leave router, and [`egress`]/[`roster`] for the two outbound publishers.

#[macro_use]
extern crate derive_builder;

pub mod config;
pub mod egress;
pub mod error;
pub mod ingress;
pub mod model;
pub mod roster;
pub mod session;
pub mod transport;

pub use config::{GatewayIdentity, GatewayIdentityBuilder, PlcConfig, RobotConfig};
pub use egress::EgressPump;
pub use ingress::{IngressRouter, SessionRegistry, SessionTable};
pub use roster::RosterPublisher;
pub use session::ManagedSession;
