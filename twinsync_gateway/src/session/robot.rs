// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The robot device session: `GET_FAST`/`END` line-protocol polling, plan union, and
//! per-user lease tracking.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::config::RobotConfig;
use crate::error::{SessionError, TransportError, TransportErrorKind};
use crate::model::{
    DeviceKey, DeviceStatus, Frame, RegisterValue, TelemetryFrame, TelemetryPlan, UserPlanState,
};
use crate::session::base::{DeviceSessionBase, SessionHooks};
use crate::transport::RobotTransport;

/// Per-category cap on the unioned set of requested indices/names (`SPEC_FULL.md` §4.2).
const MAX_PER_CATEGORY: usize = 10;
/// Stream-loop tick period used when no user plan requests an override.
const DEFAULT_PERIOD_MS: u64 = 30;
/// Floor every effective period is clamped to, default included.
const MIN_PERIOD_MS: u64 = 50;
/// How often the lease reaper sweeps for expired user plans.
const LEASE_REAP_INTERVAL: Duration = Duration::from_secs(5);
/// A user plan with no `apply`/heartbeat refresh within this window is dropped.
const LEASE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct PlanUnion {
    di: BTreeSet<i64>,
    gi: BTreeSet<i64>,
    go: BTreeSet<i64>,
    d_out: BTreeSet<i64>,
    r: BTreeSet<i64>,
    var: BTreeSet<String>,
    period_ms: Option<u64>,
}

fn capped<T: Ord>(set: BTreeSet<T>, max: usize) -> BTreeSet<T> {
    set.into_iter().take(max).collect()
}

fn compute_union(plans: &HashMap<String, UserPlanState<TelemetryPlan>>) -> PlanUnion {
    let mut u = PlanUnion::default();
    let mut min_period: Option<u64> = None;
    for state in plans.values() {
        u.di.extend(state.plan.di.iter().copied().filter(|v| *v > 0));
        u.gi.extend(state.plan.gi.iter().copied().filter(|v| *v > 0));
        u.go.extend(state.plan.go.iter().copied().filter(|v| *v > 0));
        u.d_out.extend(state.plan.d_out.iter().copied().filter(|v| *v > 0));
        u.r.extend(state.plan.r.iter().copied().filter(|v| *v > 0));
        u.var.extend(
            state
                .plan
                .var
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        );
        if let Some(p) = state.plan.period_ms {
            min_period = Some(min_period.map_or(p, |m| m.min(p)));
        }
    }
    u.di = capped(u.di, MAX_PER_CATEGORY);
    u.gi = capped(u.gi, MAX_PER_CATEGORY);
    u.go = capped(u.go, MAX_PER_CATEGORY);
    u.d_out = capped(u.d_out, MAX_PER_CATEGORY);
    u.r = capped(u.r, MAX_PER_CATEGORY);
    u.var = capped(u.var, MAX_PER_CATEGORY);
    u.period_ms = min_period;
    u
}

fn effective_period_ms(union: &PlanUnion) -> u64 {
    union
        .period_ms
        .unwrap_or(DEFAULT_PERIOD_MS)
        .max(MIN_PERIOD_MS)
}

fn filter_by_keys<V>(map: BTreeMap<i64, V>, keep: &BTreeSet<i64>) -> Option<BTreeMap<i64, V>> {
    if keep.is_empty() {
        return None;
    }
    let filtered: BTreeMap<i64, V> = map.into_iter().filter(|(k, _)| keep.contains(k)).collect();
    if filtered.is_empty() {
        None
    } else {
        Some(filtered)
    }
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn parse_joints(s: &str) -> Option<[f64; 6]> {
    let parts: Vec<f64> = s.split(',').filter_map(|p| p.trim().parse().ok()).collect();
    parts.try_into().ok()
}

fn parse_kv_i64(s: &str) -> BTreeMap<i64, i64> {
    s.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once(':')?;
            Some((k.trim().parse().ok()?, v.trim().parse().ok()?))
        })
        .collect()
}

fn parse_registers(s: &str) -> BTreeMap<i64, RegisterValue> {
    let mut map = BTreeMap::new();
    for pair in s.split(',') {
        let Some((k, rest)) = pair.split_once(':') else {
            continue;
        };
        if rest.trim() == "ERR" {
            continue;
        }
        let Some((i, r)) = rest.split_once('|') else {
            continue;
        };
        if let (Ok(k), Ok(i), Ok(r)) = (k.trim().parse(), i.trim().parse(), r.trim().parse()) {
            map.insert(k, RegisterValue { int_val: i, real_val: r });
        }
    }
    map
}

fn parse_vars(s: &str) -> BTreeMap<String, String> {
    s.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once(':')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Reads one `GET_FAST` response (a run of tagged lines terminated by `END`) off `transport`.
async fn read_get_fast_response(
    transport: &mut (dyn RobotTransport + '_),
    deadline: Duration,
) -> Result<TelemetryFrame, TransportError> {
    let mut frame = TelemetryFrame {
        ts: now_unix_ms(),
        seq: 0,
        joints_deg: None,
        di: None,
        gi: None,
        go: None,
        d_out: None,
        r: None,
        var: None,
    };
    loop {
        let line = transport.read_line(deadline).await?;
        if line == "END" {
            return Ok(frame);
        }
        if let Some(rest) = line.strip_prefix("J=") {
            frame.joints_deg = parse_joints(rest);
        } else if let Some(rest) = line.strip_prefix("DI=") {
            frame.di = Some(parse_kv_i64(rest));
        } else if let Some(rest) = line.strip_prefix("GI=") {
            frame.gi = Some(parse_kv_i64(rest));
        } else if let Some(rest) = line.strip_prefix("GO=") {
            frame.go = Some(parse_kv_i64(rest));
        } else if let Some(rest) = line.strip_prefix("DO=") {
            frame.d_out = Some(parse_kv_i64(rest));
        } else if let Some(rest) = line.strip_prefix("R=") {
            frame.r = Some(parse_registers(rest));
        } else if let Some(rest) = line.strip_prefix("VAR=") {
            frame.var = Some(parse_vars(rest));
        }
        // Unrecognized line prefixes are tolerated - a firmware revision may add fields we
        // don't yet know about.
    }
}

/// The last union actually acknowledged by the device, for change detection. Ignores
/// `period_ms` - a period-only change never needs a `PLAN_*` resend.
type PlanSignature = (
    BTreeSet<i64>,
    BTreeSet<i64>,
    BTreeSet<i64>,
    BTreeSet<i64>,
    BTreeSet<i64>,
    BTreeSet<String>,
);

fn plan_signature(union: &PlanUnion) -> PlanSignature {
    (
        union.di.clone(),
        union.gi.clone(),
        union.go.clone(),
        union.d_out.clone(),
        union.r.clone(),
        union.var.clone(),
    )
}

/// Send one `PLAN_{prefix}=v,v,...` command and require a literal `OK` acknowledgement.
async fn send_plan_command(
    transport: &mut dyn RobotTransport,
    prefix: &str,
    values: &BTreeSet<i64>,
    deadline: Duration,
) -> Result<(), TransportError> {
    let joined = values.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
    transport.send_line(&format!("PLAN_{prefix}={joined}")).await?;
    let ack = transport.read_line(deadline).await?;
    if ack != "OK" {
        return Err(TransportError::new(TransportErrorKind::Protocol(format!(
            "device rejected PLAN_{prefix}: {ack}"
        ))));
    }
    Ok(())
}

async fn send_plan_command_str(
    transport: &mut dyn RobotTransport,
    prefix: &str,
    values: &BTreeSet<String>,
    deadline: Duration,
) -> Result<(), TransportError> {
    let joined = values.iter().cloned().collect::<Vec<_>>().join(",");
    transport.send_line(&format!("PLAN_{prefix}={joined}")).await?;
    let ack = transport.read_line(deadline).await?;
    if ack != "OK" {
        return Err(TransportError::new(TransportErrorKind::Protocol(format!(
            "device rejected PLAN_{prefix}: {ack}"
        ))));
    }
    Ok(())
}

struct RobotHooks {
    transport: AsyncMutex<Box<dyn RobotTransport>>,
    plans: Arc<AsyncMutex<HashMap<String, UserPlanState<TelemetryPlan>>>>,
    read_timeout: Duration,
    /// The union last acknowledged by the device; `None` right after a (re)connect, so the
    /// first `read_frame` always re-applies it (SPEC_FULL.md §4.2: "device forgot its plan").
    applied: AsyncMutex<Option<PlanSignature>>,
}

impl RobotHooks {
    /// Send `PLAN_DI`/`PLAN_GI`/`PLAN_GO`/`PLAN_DO`/`PLAN_R`/`PLAN_VAR` for `union`, but only if
    /// it differs from what was last acknowledged.
    async fn apply_plan_if_changed(&self, union: &PlanUnion) -> Result<(), TransportError> {
        let signature = plan_signature(union);
        if self.applied.lock().await.as_ref() == Some(&signature) {
            return Ok(());
        }

        let mut transport = self.transport.lock().await;
        send_plan_command(&mut *transport, "DI", &union.di, self.read_timeout).await?;
        send_plan_command(&mut *transport, "GI", &union.gi, self.read_timeout).await?;
        send_plan_command(&mut *transport, "GO", &union.go, self.read_timeout).await?;
        send_plan_command(&mut *transport, "DO", &union.d_out, self.read_timeout).await?;
        send_plan_command(&mut *transport, "R", &union.r, self.read_timeout).await?;
        send_plan_command_str(&mut *transport, "VAR", &union.var, self.read_timeout).await?;
        drop(transport);

        *self.applied.lock().await = Some(signature);
        Ok(())
    }
}

#[async_trait]
impl SessionHooks for RobotHooks {
    async fn on_connect(&self) -> Result<(), TransportError> {
        self.transport.lock().await.connect().await?;
        // The device does not remember a prior session's plan across a reconnect.
        *self.applied.lock().await = None;
        Ok(())
    }

    async fn on_disconnect(&self) {
        self.transport.lock().await.disconnect().await;
    }

    async fn read_frame(&self, cancel: &CancellationToken) -> Result<Frame, TransportError> {
        let union = {
            let plans = self.plans.lock().await;
            compute_union(&plans)
        };
        self.apply_plan_if_changed(&union).await?;

        let mut transport = self.transport.lock().await;
        transport.send_line("GET_FAST").await?;
        let mut frame = read_get_fast_response(&mut *transport, self.read_timeout).await?;
        drop(transport);

        frame.di = frame.di.and_then(|m| filter_by_keys(m, &union.di));
        frame.gi = frame.gi.and_then(|m| filter_by_keys(m, &union.gi));
        frame.go = frame.go.and_then(|m| filter_by_keys(m, &union.go));
        frame.d_out = frame.d_out.and_then(|m| filter_by_keys(m, &union.d_out));
        frame.r = frame.r.and_then(|m| filter_by_keys(m, &union.r));
        frame.var = frame.var.and_then(|m| {
            if union.var.is_empty() {
                return None;
            }
            let filtered: BTreeMap<String, String> = m
                .into_iter()
                .filter(|(k, _)| union.var.contains(k))
                .collect();
            (!filtered.is_empty()).then_some(filtered)
        });

        let period = Duration::from_millis(effective_period_ms(&union));
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(period) => {}
        }

        Ok(Frame::Telemetry(frame))
    }
}

/// A robot device session: owns the `GET_FAST` poll loop (via [`DeviceSessionBase`]) and the
/// per-user telemetry plan map that determines the streamed union and the `publishAllowed` gate.
pub struct RobotSession {
    base: Arc<DeviceSessionBase<RobotHooks>>,
    plans: Arc<AsyncMutex<HashMap<String, UserPlanState<TelemetryPlan>>>>,
}

impl RobotSession {
    /// Create a new robot session over `transport`, initially with no user plans (gate closed).
    #[must_use]
    pub fn new(key: DeviceKey, transport: Box<dyn RobotTransport>, config: &RobotConfig) -> Arc<Self> {
        let plans = Arc::new(AsyncMutex::new(HashMap::new()));
        let hooks = Arc::new(RobotHooks {
            transport: AsyncMutex::new(transport),
            plans: Arc::clone(&plans),
            read_timeout: config.read_timeout,
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

    /// Install or refresh `user`'s telemetry plan, opening the `publishAllowed` gate if this is
    /// the first active plan.
    pub async fn apply_telemetry_plan(&self, user: impl Into<String>, plan: TelemetryPlan) {
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
impl crate::session::ManagedSession for RobotSession {
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

    async fn apply_telemetry_plan(&self, user: &str, plan: TelemetryPlan) {
        self.apply_telemetry_plan(user, plan).await;
    }

    async fn apply_machine_data_plan(&self, user: &str, _plan: crate::model::MachineDataPlan) {
        log::debug!("{}: ignoring machine-data plan from {user}, this is a robot session", self.key());
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
    use crate::transport::robot::SimulatedRobotTransport;

    fn key() -> DeviceKey {
        DeviceKey::new("acme", "gw1", "R1", "robot-fanuc")
    }

    #[test]
    fn registers_parse_and_drop_err_entries() {
        let regs = parse_registers("1:10|1.5,2:ERR,3:-4|0.25");
        assert_eq!(regs.len(), 2);
        assert_eq!(regs[&1].int_val, 10);
        assert!((regs[&1].real_val - 1.5).abs() < f64::EPSILON);
        assert!(!regs.contains_key(&2));
    }

    #[test]
    fn union_caps_each_category_independently() {
        let mut plans = HashMap::new();
        for i in 0..15 {
            plans.insert(
                format!("user{i}"),
                UserPlanState::new(TelemetryPlan {
                    di: vec![i],
                    ..Default::default()
                }),
            );
        }
        let union = compute_union(&plans);
        assert_eq!(union.di.len(), MAX_PER_CATEGORY);
    }

    #[test]
    fn effective_period_defaults_to_the_clamp_floor() {
        let union = PlanUnion::default();
        assert_eq!(effective_period_ms(&union), MIN_PERIOD_MS);
    }

    #[test]
    fn effective_period_honors_a_faster_user_override_but_still_clamps() {
        let mut union = PlanUnion::default();
        union.period_ms = Some(10);
        assert_eq!(effective_period_ms(&union), MIN_PERIOD_MS);
        union.period_ms = Some(200);
        assert_eq!(effective_period_ms(&union), 200);
    }

    #[tokio::test]
    async fn plan_gates_publish_allowed_and_reflects_filtered_frames() {
        let config = RobotConfig::new("R1", "127.0.0.1", 9000);
        let transport = Box::new(SimulatedRobotTransport::new());
        let session = RobotSession::new(key(), transport, &config);
        session.connect().await.unwrap();
        assert!(!session.is_publish_allowed());

        session
            .apply_telemetry_plan(
                "alice",
                TelemetryPlan {
                    di: vec![1],
                    ..Default::default()
                },
            )
            .await;
        assert!(session.is_publish_allowed());

        let mut frames = session.subscribe_frames();
        let frame = tokio::time::timeout(Duration::from_millis(500), frames.recv())
            .await
            .expect("expected a frame while publishing is allowed")
            .unwrap();
        let Frame::Telemetry(t) = frame else {
            panic!("expected a telemetry frame");
        };
        let di = t.di.expect("di=1 was requested");
        assert!(di.contains_key(&1));
        assert!(!di.contains_key(&2), "di=2 was never requested by any user");

        session.remove_user("alice").await;
        assert!(!session.is_publish_allowed());

        session.disconnect().await;
    }
}
