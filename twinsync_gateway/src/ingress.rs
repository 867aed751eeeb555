// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The ingress router: parses inbound MQTT topics into a [`DeviceKey`] plus verb, and dispatches
//! `plan`/`hb`/`leave` to the session a caller-supplied [`SessionRegistry`] resolves.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Deserialize;

use crate::model::{DeviceKey, MachineDataPlan, MachineDataPlanItem, TelemetryPlan};
use crate::session::ManagedSession;

const TOPIC_ROOT: &str = "twinsync";

/// A caller-supplied lookup from [`DeviceKey`] to the session that owns it.
///
/// The router holds no session state of its own - it just needs a concurrency-safe way to find
/// the target a parsed topic addresses. Modeling this as an explicit registry object, rather than
/// having sessions register themselves with the router, avoids a cyclic ownership between the
/// two (`SPEC_FULL.md` §9).
pub trait SessionRegistry: Send + Sync {
    /// Resolve the session that owns `key`, if any is currently registered.
    fn resolve(&self, key: &DeviceKey) -> Option<Arc<dyn ManagedSession>>;
}

impl<T: SessionRegistry + ?Sized> SessionRegistry for Arc<T> {
    fn resolve(&self, key: &DeviceKey) -> Option<Arc<dyn ManagedSession>> {
        (**self).resolve(key)
    }
}

/// The default [`SessionRegistry`]: an explicit `DeviceKey -> Arc<dyn ManagedSession>` table.
/// Sessions never hold a reference back into this table.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<DeviceKey, Arc<dyn ManagedSession>>>,
}

impl SessionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` under its own key, replacing any prior session at that key.
    pub fn register(&self, session: Arc<dyn ManagedSession>) {
        let key = session.key().clone();
        self.sessions.write().unwrap().insert(key, session);
    }

    /// Remove the session registered at `key`, if any.
    pub fn unregister(&self, key: &DeviceKey) {
        self.sessions.write().unwrap().remove(key);
    }

    /// All keys currently registered, in arbitrary order.
    #[must_use]
    pub fn keys(&self) -> Vec<DeviceKey> {
        self.sessions.read().unwrap().keys().cloned().collect()
    }
}

impl SessionRegistry for SessionTable {
    fn resolve(&self, key: &DeviceKey) -> Option<Arc<dyn ManagedSession>> {
        self.sessions.read().unwrap().get(key).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Plan,
    Heartbeat,
    Leave,
}

fn parse_verb(s: &str) -> Option<Verb> {
    match s.to_ascii_lowercase().as_str() {
        "plan" => Some(Verb::Plan),
        "hb" => Some(Verb::Heartbeat),
        "leave" => Some(Verb::Leave),
        _ => None,
    }
}

/// The wire shape of a `plan` verb's JSON payload (`SPEC_FULL.md` §4.4). Fields absent from the
/// envelope are treated as empty, never as an error.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanEnvelope {
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(default)]
    di: Vec<i64>,
    #[serde(default)]
    gi: Vec<i64>,
    #[serde(default)]
    go: Vec<i64>,
    #[serde(default, rename = "do")]
    d_out: Vec<i64>,
    #[serde(default)]
    r: Vec<i64>,
    #[serde(default)]
    var: Vec<String>,
    period_ms: Option<u64>,
    #[serde(default)]
    items: Vec<ItemEnvelope>,
}

fn default_kind() -> String {
    "telemetry".to_string()
}

#[derive(Debug, Deserialize)]
struct ItemEnvelope {
    path: String,
    expand: Option<String>,
}

impl PlanEnvelope {
    fn into_telemetry_plan(self) -> TelemetryPlan {
        TelemetryPlan {
            di: self.di,
            gi: self.gi,
            go: self.go,
            d_out: self.d_out,
            r: self.r,
            var: self.var,
            period_ms: self.period_ms,
        }
    }

    fn into_machine_data_plan(self) -> MachineDataPlan {
        MachineDataPlan {
            items: self
                .items
                .into_iter()
                .map(|i| MachineDataPlanItem { path: i.path, expand: i.expand })
                .collect(),
            period_ms: self.period_ms,
        }
    }
}

/// Parses inbound MQTT topics addressed to this gateway's tenant/gateway scope and dispatches the
/// `plan`/`hb`/`leave` verb to the session a caller-supplied [`SessionRegistry`] resolves.
///
/// Topic schema: `twinsync/{tenantId}/{gatewayId}/{plan|hb|leave}/{deviceType}/{deviceId}/{user}`
/// - exactly seven `/`-separated segments, empty segments dropped before counting. Anything else
/// is a non-matching topic and is dropped silently.
pub struct IngressRouter<R: SessionRegistry> {
    tenant_id: String,
    gateway_id: String,
    registry: R,
}

impl<R: SessionRegistry> IngressRouter<R> {
    /// Create a router scoped to `tenant_id`/`gateway_id`, resolving targets through `registry`.
    pub fn new(tenant_id: impl Into<String>, gateway_id: impl Into<String>, registry: R) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            gateway_id: gateway_id.into(),
            registry,
        }
    }

    /// The topic filter this router expects to be subscribed to, covering all three verbs.
    #[must_use]
    pub fn topic_filter(&self) -> String {
        format!("{TOPIC_ROOT}/{}/{}/+/+/+/+", self.tenant_id, self.gateway_id)
    }

    fn parse_topic<'a>(&self, topic: &'a str) -> Option<(Verb, DeviceKey, &'a str)> {
        let parts: Vec<&str> = topic.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() != 7 || !parts[0].eq_ignore_ascii_case(TOPIC_ROOT) {
            return None;
        }
        if parts[1] != self.tenant_id || parts[2] != self.gateway_id {
            return None;
        }
        let verb = parse_verb(parts[3])?;
        let device_type = parts[4];
        let device_id = parts[5];
        let user = parts[6];
        let key = DeviceKey::new(
            self.tenant_id.clone(),
            self.gateway_id.clone(),
            device_id,
            device_type,
        );
        Some((verb, key, user))
    }

    /// Handle one inbound publish: parse its topic, resolve the target session, and dispatch the
    /// verb. Malformed topics are dropped silently; a malformed JSON plan envelope or an
    /// unresolved target is logged at `warn` and dropped. This never fails.
    pub async fn handle_publish(&self, topic: &str, payload: &[u8]) {
        let Some((verb, key, user)) = self.parse_topic(topic) else {
            return;
        };

        let Some(target) = self.registry.resolve(&key) else {
            log::warn!("ingress: no session registered for {key}");
            return;
        };

        match verb {
            Verb::Heartbeat => {
                if !target.touch_user(user).await {
                    log::debug!("{key}: heartbeat from unknown user {user}, ignored");
                }
            }
            Verb::Leave => {
                target.remove_user(user).await;
            }
            Verb::Plan => {
                let envelope: PlanEnvelope = match serde_json::from_slice(payload) {
                    Ok(e) => e,
                    Err(e) => {
                        log::warn!("{key}: malformed plan envelope from {user}: {e}");
                        return;
                    }
                };
                if envelope.kind.eq_ignore_ascii_case("machinedata") {
                    target.apply_machine_data_plan(user, envelope.into_machine_data_plan()).await;
                } else {
                    target.apply_telemetry_plan(user, envelope.into_telemetry_plan()).await;
                }
            }
        }
    }

    /// Wrap this router as a [`gateway_mqtt::Handler`] suitable for
    /// [`gateway_mqtt::MqttFacade::add_handler`].
    pub fn into_handler(self: Arc<Self>) -> gateway_mqtt::Handler
    where
        R: 'static,
    {
        Arc::new(move |publish: gateway_mqtt::control_packet::Publish| {
            let router = Arc::clone(&self);
            Box::pin(async move {
                let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                router.handle_publish(&topic, &publish.payload).await;
                Ok(())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceStatus, Frame};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::broadcast;

    struct RecordingSession {
        key: DeviceKey,
        telemetry_calls: AtomicU32,
        machine_data_calls: AtomicU32,
        touched: AtomicBool,
        removed: AtomicBool,
    }

    impl RecordingSession {
        fn new(key: DeviceKey) -> Self {
            Self {
                key,
                telemetry_calls: AtomicU32::new(0),
                machine_data_calls: AtomicU32::new(0),
                touched: AtomicBool::new(false),
                removed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ManagedSession for RecordingSession {
        fn key(&self) -> &DeviceKey {
            &self.key
        }

        fn status(&self) -> DeviceStatus {
            DeviceStatus::Streaming
        }

        fn is_publish_allowed(&self) -> bool {
            true
        }

        fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
            broadcast::channel(1).1
        }

        fn subscribe_status(&self) -> broadcast::Receiver<(DeviceStatus, Option<String>)> {
            broadcast::channel(1).1
        }

        fn subscribe_publish_allowed(&self) -> broadcast::Receiver<bool> {
            broadcast::channel(1).1
        }

        async fn apply_telemetry_plan(&self, _user: &str, _plan: TelemetryPlan) {
            self.telemetry_calls.fetch_add(1, Ordering::SeqCst);
        }

        async fn apply_machine_data_plan(&self, _user: &str, _plan: MachineDataPlan) {
            self.machine_data_calls.fetch_add(1, Ordering::SeqCst);
        }

        async fn touch_user(&self, _user: &str) -> bool {
            self.touched.store(true, Ordering::SeqCst);
            true
        }

        async fn remove_user(&self, _user: &str) {
            self.removed.store(true, Ordering::SeqCst);
        }
    }

    fn router_with(session: Arc<RecordingSession>) -> IngressRouter<Arc<SessionTable>> {
        let table = Arc::new(SessionTable::new());
        table.register(session);
        IngressRouter::new("acme", "gw1", table)
    }

    #[tokio::test]
    async fn dispatches_telemetry_plan_on_default_kind() {
        let key = DeviceKey::new("acme", "gw1", "R1", "robot-fanuc");
        let session = Arc::new(RecordingSession::new(key));
        let router = router_with(session.clone());

        router
            .handle_publish(
                "twinsync/acme/gw1/plan/robot-fanuc/R1/alice",
                br#"{"di":[1,2]}"#,
            )
            .await;

        assert_eq!(session.telemetry_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.machine_data_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatches_machine_data_plan_on_explicit_kind() {
        let key = DeviceKey::new("acme", "gw1", "PLC1", "plc-allen-bradley");
        let session = Arc::new(RecordingSession::new(key));
        let router = router_with(session.clone());

        router
            .handle_publish(
                "twinsync/acme/gw1/plan/plc-allen-bradley/PLC1/alice",
                br#"{"kind":"machineData","items":[{"path":"Tag1"}]}"#,
            )
            .await;

        assert_eq!(session.machine_data_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn heartbeat_and_leave_dispatch_to_touch_and_remove() {
        let key = DeviceKey::new("acme", "gw1", "R1", "robot-fanuc");
        let session = Arc::new(RecordingSession::new(key));
        let router = router_with(session.clone());

        router.handle_publish("twinsync/acme/gw1/hb/robot-fanuc/R1/alice", b"").await;
        assert!(session.touched.load(Ordering::SeqCst));

        router.handle_publish("twinsync/acme/gw1/leave/robot-fanuc/R1/alice", b"").await;
        assert!(session.removed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn non_matching_topics_are_dropped_silently() {
        let key = DeviceKey::new("acme", "gw1", "R1", "robot-fanuc");
        let session = Arc::new(RecordingSession::new(key));
        let router = router_with(session.clone());

        // Wrong tenant, too few segments, and a foreign root all drop with no calls made.
        router.handle_publish("twinsync/other/gw1/plan/robot-fanuc/R1/alice", b"{}").await;
        router.handle_publish("twinsync/acme/gw1/plan/robot-fanuc/R1", b"{}").await;
        router.handle_publish("somethingelse/acme/gw1/plan/robot-fanuc/R1/alice", b"{}").await;

        assert_eq!(session.telemetry_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_json_is_dropped_without_panicking() {
        let key = DeviceKey::new("acme", "gw1", "R1", "robot-fanuc");
        let session = Arc::new(RecordingSession::new(key));
        let router = router_with(session.clone());

        router
            .handle_publish("twinsync/acme/gw1/plan/robot-fanuc/R1/alice", b"{\":}")
            .await;

        assert_eq!(session.telemetry_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unresolved_target_is_dropped_without_panicking() {
        let table: Arc<SessionTable> = Arc::new(SessionTable::new());
        let router = IngressRouter::new("acme", "gw1", table);

        router
            .handle_publish("twinsync/acme/gw1/plan/robot-fanuc/R1/alice", br#"{}"#)
            .await;
        // No session registered - handle_publish must simply return, not panic.
    }
}
