// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The PLC device session: bounded-batch tag reads, plan union, and per-user lease tracking.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::config::PlcConfig;
use crate::error::{SessionError, TransportError};
use crate::model::{DeviceKey, DeviceStatus, Frame, MachineDataPlan, MachineDataPlanItem, PlcFrame, UserPlanState};
use crate::session::base::{DeviceSessionBase, SessionHooks};
use crate::transport::PlcTransport;

/// Floor every effective soft-pace period and the gate-empty idle are clamped to.
const MIN_PERIOD_MS: u64 = 50;
/// Floor the per-iteration read deadline is never allowed to fall below, regardless of
/// configured `timeout_ms` (`SPEC_FULL.md` §4.3).
const MIN_READ_DEADLINE_MS: u64 = 200;
/// How often the lease reaper sweeps for expired user plans.
const LEASE_REAP_INTERVAL: Duration = Duration::from_secs(5);
/// A user plan with no `apply`/heartbeat refresh within this window is dropped.
const LEASE_TIMEOUT: Duration = Duration::from_secs(60);

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Union every user's requested items, deduplicating on `(path, expand)` case-insensitively and
/// sorting by path then expand (both ordinal, ignore-case), then truncating to `max_items`.
/// Returns the item list alongside the fastest period override any user requested, if any.
fn compute_union(
    plans: &HashMap<String, UserPlanState<MachineDataPlan>>,
    max_items: usize,
) -> (Vec<MachineDataPlanItem>, Option<u64>) {
    let mut by_key: BTreeMap<(String, String), MachineDataPlanItem> = BTreeMap::new();
    let mut min_period: Option<u64> = None;
    for state in plans.values() {
        if let Some(p) = state.plan.period_ms {
            min_period = Some(min_period.map_or(p, |m| m.min(p)));
        }
        for item in &state.plan.items {
            let path = item.path.trim();
            if path.is_empty() {
                continue;
            }
            let key = (
                path.to_lowercase(),
                item.expand.as_deref().unwrap_or("").to_lowercase(),
            );
            by_key.entry(key).or_insert_with(|| MachineDataPlanItem {
                path: path.to_string(),
                expand: item.expand.clone(),
            });
        }
    }
    let items = by_key.into_values().take(max_items).collect();
    (items, min_period)
}

fn effective_period_ms(config: &PlcConfig, override_ms: Option<u64>) -> u64 {
    override_ms
        .unwrap_or(config.default_period_ms)
        .max(MIN_PERIOD_MS)
}

struct PlcHooks {
    transport: AsyncMutex<Box<dyn PlcTransport>>,
    plans: Arc<AsyncMutex<HashMap<String, UserPlanState<MachineDataPlan>>>>,
    config: PlcConfig,
}

#[async_trait]
impl SessionHooks for PlcHooks {
    async fn on_connect(&self) -> Result<(), TransportError> {
        self.transport.lock().await.connect().await
    }

    async fn on_disconnect(&self) {
        self.transport.lock().await.disconnect().await;
    }

    async fn read_frame(&self, cancel: &CancellationToken) -> Result<Frame, TransportError> {
        let (items, period_override) = {
            let plans = self.plans.lock().await;
            compute_union(&plans, self.config.max_items)
        };

        if items.is_empty() {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(Duration::from_millis(MIN_PERIOD_MS)) => {}
            }
            return Ok(Frame::Plc(PlcFrame {
                ts: now_unix_ms(),
                seq: 0,
                values: BTreeMap::new(),
            }));
        }

        let deadline = Duration::from_millis(self.config.timeout_ms.max(MIN_READ_DEADLINE_MS));
        let values = {
            let mut transport = self.transport.lock().await;
            transport.read(&items, deadline).await?
        };

        let period = Duration::from_millis(effective_period_ms(&self.config, period_override));
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(period) => {}
        }

        Ok(Frame::Plc(PlcFrame {
            ts: now_unix_ms(),
            seq: 0,
            values,
        }))
    }
}

/// A PLC device session: owns the bounded-batch tag-read poll loop (via [`DeviceSessionBase`])
/// and the per-user machine-data plan map that determines the streamed union and the
/// `publishAllowed` gate.
pub struct PlcSession {
    base: Arc<DeviceSessionBase<PlcHooks>>,
    plans: Arc<AsyncMutex<HashMap<String, UserPlanState<MachineDataPlan>>>>,
}

impl PlcSession {
    /// Create a new PLC session over `transport`, initially with no user plans (gate closed).
    #[must_use]
    pub fn new(key: DeviceKey, transport: Box<dyn PlcTransport>, config: &PlcConfig) -> Arc<Self> {
        let plans = Arc::new(AsyncMutex::new(HashMap::new()));
        let hooks = Arc::new(PlcHooks {
            transport: AsyncMutex::new(transport),
            plans: Arc::clone(&plans),
            config: config.clone(),
        });
        let base = DeviceSessionBase::new(key, hooks);

        Arc::new(Self { base, plans })
    }

    fn spawn_lease_reaper(self: &Arc<Self>, cancel: CancellationToken) {
        let plans = Arc::clone(&self.plans);
        let base = Arc::clone(&self.base);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(LEASE_REAP_INTERVAL) => {}
                }
                let mut guard = plans.lock().await;
                let before = guard.len();
                guard.retain(|user, state| {
                    let alive = state.last_seen.elapsed() < LEASE_TIMEOUT;
                    if !alive {
                        log::info!("{}: user {user} lease expired, dropping plan", base.key());
                    }
                    alive
                });
                if guard.len() != before {
                    let allowed = !guard.is_empty();
                    drop(guard);
                    base.set_publish_allowed(allowed);
                }
            }
        });
    }

    /// This session's routing address.
    #[must_use]
    pub fn key(&self) -> &DeviceKey {
        self.base.key()
    }

    /// The current lifecycle status.
    #[must_use]
    pub fn status(&self) -> DeviceStatus {
        self.base.status()
    }

    /// Whether upstream publishing is currently permitted for this device.
    #[must_use]
    pub fn is_publish_allowed(&self) -> bool {
        self.base.is_publish_allowed()
    }

    /// Subscribe to every frame this session reads, from this point forward.
    #[must_use]
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
        self.base.subscribe_frames()
    }

    /// Subscribe to `statusChanged` events, from this point forward.
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<(DeviceStatus, Option<String>)> {
        self.base.subscribe_status()
    }

    /// Subscribe to `publishAllowedChanged` events, from this point forward.
    #[must_use]
    pub fn subscribe_publish_allowed(&self) -> broadcast::Receiver<bool> {
        self.base.subscribe_publish_allowed()
    }

    /// Connect the underlying transport, start polling, and start the lease reaper.
    ///
    /// # Errors
    /// Propagates the first `on_connect` failure; see [`DeviceSessionBase::connect`].
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        self.base.connect().await?;
        self.spawn_lease_reaper(self.base.child_token().await);
        Ok(())
    }

    /// Disconnect the underlying transport, stop polling, and stop the lease reaper - all of
    /// which share `base`'s cancellation token for this connect cycle.
    pub async fn disconnect(self: &Arc<Self>) {
        self.base.disconnect().await;
    }

    /// Install or refresh `user`'s machine-data plan, opening the `publishAllowed` gate if this
    /// is the first active plan.
    pub async fn apply_machine_data_plan(&self, user: impl Into<String>, plan: MachineDataPlan) {
        let mut guard = self.plans.lock().await;
        guard.insert(user.into(), UserPlanState::new(plan));
        let allowed = !guard.is_empty();
        drop(guard);
        self.base.set_publish_allowed(allowed);
    }

    /// Refresh `user`'s lease without changing their plan (a heartbeat). Returns `false` if the
    /// user has no active plan to refresh.
    pub async fn touch_user(&self, user: &str) -> bool {
        let mut guard = self.plans.lock().await;
        if let Some(state) = guard.get_mut(user) {
            state.last_seen = Instant::now();
            true
        } else {
            false
        }
    }

    /// Remove `user`'s plan (an explicit leave), closing the gate if no users remain.
    pub async fn remove_user(&self, user: &str) {
        let mut guard = self.plans.lock().await;
        guard.remove(user);
        let allowed = !guard.is_empty();
        drop(guard);
        self.base.set_publish_allowed(allowed);
    }
}

#[async_trait]
impl crate::session::ManagedSession for PlcSession {
    fn key(&self) -> &DeviceKey {
        self.key()
    }

    fn status(&self) -> DeviceStatus {
        self.status()
    }

    fn is_publish_allowed(&self) -> bool {
        self.is_publish_allowed()
    }

    fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
        self.subscribe_frames()
    }

    fn subscribe_status(&self) -> broadcast::Receiver<(DeviceStatus, Option<String>)> {
        self.subscribe_status()
    }

    fn subscribe_publish_allowed(&self) -> broadcast::Receiver<bool> {
        self.subscribe_publish_allowed()
    }

    async fn apply_telemetry_plan(&self, user: &str, _plan: crate::model::TelemetryPlan) {
        log::debug!("{}: ignoring telemetry plan from {user}, this is a PLC session", self.key());
    }

    async fn apply_machine_data_plan(&self, user: &str, plan: MachineDataPlan) {
        self.apply_machine_data_plan(user, plan).await;
    }

    async fn touch_user(&self, user: &str) -> bool {
        self.touch_user(user).await
    }

    async fn remove_user(&self, user: &str) {
        self.remove_user(user).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::plc::SimulatedPlcTransport;

    fn key() -> DeviceKey {
        DeviceKey::new("acme", "gw1", "PLC1", "plc-allen-bradley")
    }

    #[test]
    fn union_dedups_case_insensitively_and_sorts() {
        let mut plans = HashMap::new();
        plans.insert(
            "alice".to_string(),
            UserPlanState::new(MachineDataPlan {
                items: vec![
                    MachineDataPlanItem { path: "Zeta.Tag".to_string(), expand: None },
                    MachineDataPlanItem { path: "Alpha.Tag".to_string(), expand: None },
                ],
                period_ms: None,
            }),
        );
        plans.insert(
            "bob".to_string(),
            UserPlanState::new(MachineDataPlan {
                items: vec![MachineDataPlanItem { path: "alpha.tag".to_string(), expand: None }],
                period_ms: None,
            }),
        );
        let (items, _) = compute_union(&plans, 50);
        assert_eq!(items.len(), 2, "alpha.tag/Alpha.Tag must dedupe");
        assert_eq!(items[0].path.to_lowercase(), "alpha.tag");
        assert_eq!(items[1].path.to_lowercase(), "zeta.tag");
    }

    #[test]
    fn union_trims_paths_and_drops_empty_ones() {
        let mut plans = HashMap::new();
        plans.insert(
            "alice".to_string(),
            UserPlanState::new(MachineDataPlan {
                items: vec![
                    MachineDataPlanItem { path: "  Tag1  ".to_string(), expand: None },
                    MachineDataPlanItem { path: "   ".to_string(), expand: None },
                    MachineDataPlanItem { path: String::new(), expand: None },
                ],
                period_ms: None,
            }),
        );
        let (items, _) = compute_union(&plans, 50);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, "Tag1");
    }

    #[test]
    fn union_is_truncated_to_max_items() {
        let mut plans = HashMap::new();
        let items = (0..10)
            .map(|i| MachineDataPlanItem { path: format!("Tag{i}"), expand: None })
            .collect();
        plans.insert(
            "alice".to_string(),
            UserPlanState::new(MachineDataPlan { items, period_ms: None }),
        );
        let (union, _) = compute_union(&plans, 3);
        assert_eq!(union.len(), 3);
    }

    #[tokio::test]
    async fn empty_union_keeps_gate_closed_and_skips_transport_reads() {
        let config = PlcConfig::new("plc1", "127.0.0.1", 44818);
        let transport = Box::new(SimulatedPlcTransport::new(&config));
        let session = PlcSession::new(key(), transport, &config);
        session.connect().await.unwrap();
        assert!(!session.is_publish_allowed());
        session.disconnect().await;
    }

    #[tokio::test]
    async fn plan_gates_publish_allowed_and_streams_requested_tags() {
        let config = PlcConfig::new("plc1", "127.0.0.1", 44818);
        let transport = Box::new(SimulatedPlcTransport::new(&config));
        let session = PlcSession::new(key(), transport, &config);
        session.connect().await.unwrap();

        session
            .apply_machine_data_plan(
                "alice",
                MachineDataPlan {
                    items: vec![MachineDataPlanItem { path: "Station1Status".to_string(), expand: Some("udt".to_string()) }],
                    period_ms: Some(50),
                },
            )
            .await;
        assert!(session.is_publish_allowed());

        let mut frames = session.subscribe_frames();
        let frame = tokio::time::timeout(Duration::from_millis(500), frames.recv())
            .await
            .expect("expected a frame while publishing is allowed")
            .unwrap();
        let Frame::Plc(p) = frame else {
            panic!("expected a plc frame");
        };
        assert!(p.values.contains_key("Station1Status"));

        session.disconnect().await;
    }
}
