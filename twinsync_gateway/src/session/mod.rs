// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device sessions: the supervisor ([`base`]) and its two concrete device families, unified
//! behind [`ManagedSession`] for the ingress router, egress pump, and roster publisher.

pub mod base;
pub mod plc;
pub mod robot;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub use base::{DeviceSessionBase, SessionHooks};
pub use plc::PlcSession;
pub use robot::RobotSession;

use crate::model::{DeviceKey, DeviceStatus, Frame, MachineDataPlan, TelemetryPlan};

/// The object-safe surface of a device session that the ingress router, egress pump, and roster
/// publisher need, without caring which concrete device family backs it.
///
/// `connect`/`disconnect` are deliberately absent: both take a `self: &Arc<Self>` receiver on the
/// concrete session types, which isn't object-safe here, and neither the router nor the
/// publishers ever need to drive a session's lifecycle - the binary entrypoint does that directly
/// against the concrete `Arc<RobotSession>`/`Arc<PlcSession>` before registering it.
#[async_trait]
pub trait ManagedSession: Send + Sync {
    /// This session's routing address.
    fn key(&self) -> &DeviceKey;

    /// The current lifecycle status.
    fn status(&self) -> DeviceStatus;

    /// Whether upstream publishing is currently permitted for this device.
    fn is_publish_allowed(&self) -> bool;

    /// Subscribe to every frame this session reads, from this point forward.
    fn subscribe_frames(&self) -> broadcast::Receiver<Frame>;

    /// Subscribe to `statusChanged` events, from this point forward.
    fn subscribe_status(&self) -> broadcast::Receiver<(DeviceStatus, Option<String>)>;

    /// Subscribe to `publishAllowedChanged` events, from this point forward.
    fn subscribe_publish_allowed(&self) -> broadcast::Receiver<bool>;

    /// Install or refresh `user`'s telemetry plan. A no-op, logged at debug, on a PLC session -
    /// the ingress router dispatches by topic `type` segment, but a stale or misrouted `apply`
    /// should never panic a session.
    async fn apply_telemetry_plan(&self, user: &str, plan: TelemetryPlan);

    /// Install or refresh `user`'s machine-data plan. A no-op, logged at debug, on a robot
    /// session; see [`ManagedSession::apply_telemetry_plan`].
    async fn apply_machine_data_plan(&self, user: &str, plan: MachineDataPlan);

    /// Refresh `user`'s lease without changing their plan. Returns `false` if the user has no
    /// active plan to refresh.
    async fn touch_user(&self, user: &str) -> bool;

    /// Remove `user`'s plan (an explicit leave).
    async fn remove_user(&self, user: &str);
}
