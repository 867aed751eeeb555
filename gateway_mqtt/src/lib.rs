// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! A thin MQTT connection facade for the TwinSync edge gateway.
//!
//! This crate knows nothing about devices, plans, or the gateway's own ingress/egress topic
//! structure - it owns a single connection to the cloud broker, validates generic MQTT topic
//! names/filters, and fans inbound publishes out to a list of registered handlers. Everything
//! device- and plan-shaped lives in `twinsync_gateway`, one layer up.

pub use crate::connection_settings::{
    MqttConnectionSettings, MqttConnectionSettingsBuilder, MqttConnectionSettingsBuilderError,
};
pub use crate::facade::{BoxFuture, Handler, MqttFacade};

mod connection_settings;
pub mod control_packet;
pub mod error;
mod facade;
pub mod topic;

#[macro_use]
extern crate derive_builder;
