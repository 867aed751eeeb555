// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The periodic egress publisher.
//!
//! [`EgressPump`] holds the one piece of mutable state the data-plane side needs: which devices
//! are currently enabled (`publishAllowed`) and the latest frame each has produced. A background
//! tick publishes the latest frame for every enabled device at a fixed cadence; disabling a
//! device drops its cached frame in the same atomic step, so a late-arriving tick can never
//! publish a ghost frame for a device a user just left (`SPEC_FULL.md` §3 invariant I2).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use gateway_mqtt::control_packet::QoS;
use gateway_mqtt::MqttFacade;

use crate::model::{DeviceKey, Frame, PlcValue, RegisterValue, TelemetryFrame};
use crate::session::ManagedSession;

/// Default tick period between publish passes (`SPEC_FULL.md` §4.5).
pub const DEFAULT_PUMP_PERIOD_MS: u64 = 30;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DataEnvelope<'a> {
    pub_seq: u64,
    ts: i64,
    frame_seq: u64,
    device_type: &'a str,
    device_id: &'a str,
    payload: Payload<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Payload<'a> {
    Telemetry(TelemetryPayload<'a>),
    Plc(PlcPayload<'a>),
}

#[derive(Serialize)]
struct TelemetryPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    j: Option<[f64; 6]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    di: Option<&'a BTreeMap<i64, i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gi: Option<&'a BTreeMap<i64, i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    go: Option<&'a BTreeMap<i64, i64>>,
    #[serde(rename = "do", skip_serializing_if = "Option::is_none")]
    d_out: Option<&'a BTreeMap<i64, i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    r: Option<&'a BTreeMap<i64, RegisterValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    v: Option<&'a BTreeMap<String, String>>,
}

#[derive(Serialize)]
struct PlcPayload<'a> {
    values: &'a BTreeMap<String, PlcValue>,
}

fn telemetry_payload(f: &TelemetryFrame) -> TelemetryPayload<'_> {
    TelemetryPayload {
        j: f.joints_deg,
        di: f.di.as_ref(),
        gi: f.gi.as_ref(),
        go: f.go.as_ref(),
        d_out: f.d_out.as_ref(),
        r: f.r.as_ref(),
        v: f.var.as_ref(),
    }
}

fn build_envelope<'a>(key: &'a DeviceKey, frame: &'a Frame, pub_seq: u64) -> DataEnvelope<'a> {
    let (payload, ts, frame_seq) = match frame {
        Frame::Telemetry(f) => (Payload::Telemetry(telemetry_payload(f)), f.ts, f.seq),
        Frame::Plc(f) => (Payload::Plc(PlcPayload { values: &f.values }), f.ts, f.seq),
    };
    DataEnvelope {
        pub_seq,
        ts,
        frame_seq,
        device_type: &key.device_type,
        device_id: &key.device_id,
        payload,
    }
}

struct PumpState {
    enabled: HashSet<DeviceKey>,
    latest: HashMap<DeviceKey, Frame>,
}

/// The periodic egress publisher. `enabled` and `latest` live behind one `std::sync::Mutex`,
/// never held across an `.await` - gating and caching are one atomic step, never two.
pub struct EgressPump {
    tenant_id: String,
    gateway_id: String,
    facade: MqttFacade,
    state: StdMutex<PumpState>,
    pub_seq: AtomicU64,
    period: Duration,
    cancel: CancellationToken,
}

impl EgressPump {
    /// Create a pump publishing through `facade` at the default tick period, and start its
    /// background ticker.
    #[must_use]
    pub fn new(facade: MqttFacade, tenant_id: impl Into<String>, gateway_id: impl Into<String>) -> Arc<Self> {
        Self::with_period(facade, tenant_id, gateway_id, Duration::from_millis(DEFAULT_PUMP_PERIOD_MS))
    }

    /// Create a pump with an explicit tick period, and start its background ticker.
    #[must_use]
    pub fn with_period(
        facade: MqttFacade,
        tenant_id: impl Into<String>,
        gateway_id: impl Into<String>,
        period: Duration,
    ) -> Arc<Self> {
        let pump = Arc::new(Self {
            tenant_id: tenant_id.into(),
            gateway_id: gateway_id.into(),
            facade,
            state: StdMutex::new(PumpState {
                enabled: HashSet::new(),
                latest: HashMap::new(),
            }),
            pub_seq: AtomicU64::new(0),
            period,
            cancel: CancellationToken::new(),
        });
        pump.clone().spawn_ticker();
        pump
    }

    /// Gate `key` open or closed. Closing removes any cached frame in the same step (I2).
    pub fn set_publish_allowed(&self, key: DeviceKey, allowed: bool) {
        let mut state = self.state.lock().unwrap();
        if allowed {
            state.enabled.insert(key);
        } else {
            state.enabled.remove(&key);
            state.latest.remove(&key);
        }
    }

    /// Cache `frame` as the latest for `key`. Silently dropped if `key` is not currently enabled.
    pub fn enqueue(&self, key: DeviceKey, frame: Frame) {
        let mut state = self.state.lock().unwrap();
        if !state.enabled.contains(&key) {
            return;
        }
        state.latest.insert(key, frame);
    }

    /// Remove `key` from both the enabled set and the cache.
    pub fn clear_device(&self, key: &DeviceKey) {
        let mut state = self.state.lock().unwrap();
        state.enabled.remove(key);
        state.latest.remove(key);
    }

    /// Clear every device's gate and cache.
    pub fn clear_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.enabled.clear();
        state.latest.clear();
    }

    /// Whether `key` is currently enabled.
    #[must_use]
    pub fn is_enabled(&self, key: &DeviceKey) -> bool {
        self.state.lock().unwrap().enabled.contains(key)
    }

    /// Whether a frame is currently cached for `key`.
    #[must_use]
    pub fn has_cached_frame(&self, key: &DeviceKey) -> bool {
        self.state.lock().unwrap().latest.contains_key(key)
    }

    /// Subscribe this pump to a session's frame/publishAllowed events, so it enqueues and gates
    /// automatically. Spawns two forwarding tasks that exit once their broadcast channel closes
    /// (i.e. once the session is dropped).
    pub fn attach_session(self: &Arc<Self>, session: &Arc<dyn ManagedSession>) {
        let key = session.key().clone();

        let pump = Arc::clone(self);
        let key_for_frames = key.clone();
        let mut frame_rx = session.subscribe_frames();
        tokio::spawn(async move {
            loop {
                match frame_rx.recv().await {
                    Ok(frame) => pump.enqueue(key_for_frames.clone(), frame),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        let pump = Arc::clone(self);
        let mut allowed_rx = session.subscribe_publish_allowed();
        tokio::spawn(async move {
            loop {
                match allowed_rx.recv().await {
                    Ok(allowed) => pump.set_publish_allowed(key.clone(), allowed),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    fn spawn_ticker(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            loop {
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                self.publish_tick().await;
            }
        });
    }

    async fn publish_tick(&self) {
        let snapshot: Vec<(DeviceKey, Frame)> = {
            let state = self.state.lock().unwrap();
            state
                .enabled
                .iter()
                .filter_map(|k| state.latest.get(k).map(|f| (k.clone(), f.clone())))
                .collect()
        };
        for (key, frame) in snapshot {
            let pub_seq = self.pub_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let envelope = build_envelope(&key, &frame, pub_seq);
            let topic = format!(
                "twinsync/{}/{}/data/{}/{}",
                self.tenant_id, self.gateway_id, key.device_type, key.device_id
            );
            match serde_json::to_vec(&envelope) {
                Ok(bytes) => {
                    if let Err(e) = self.facade.publish(&topic, QoS::AtMostOnce, false, bytes).await {
                        log::warn!("egress: publish to {topic} failed: {e}");
                    }
                }
                Err(e) => log::warn!("egress: failed to serialize frame for {key}: {e}"),
            }
        }
    }

    /// Stop the background publish ticker. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EgressPump {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TelemetryFrame;
    use gateway_mqtt::{MqttConnectionSettingsBuilder, MqttFacade};

    fn key() -> DeviceKey {
        DeviceKey::new("acme", "gw1", "R1", "robot-fanuc")
    }

    fn frame(seq: u64) -> Frame {
        Frame::Telemetry(TelemetryFrame {
            ts: 0,
            seq,
            joints_deg: None,
            di: None,
            gi: None,
            go: None,
            d_out: None,
            r: None,
            var: None,
        })
    }

    fn test_facade() -> MqttFacade {
        let settings = MqttConnectionSettingsBuilder::default()
            .client_id("egress-test")
            .hostname("127.0.0.1")
            .tcp_port(1u16)
            .use_tls(false)
            .build()
            .unwrap();
        MqttFacade::connect(&settings).unwrap()
    }

    #[test]
    fn enqueue_before_enabled_is_dropped() {
        let pump = EgressPump::with_period(test_facade(), "acme", "gw1", Duration::from_secs(3600));
        pump.enqueue(key(), frame(1));
        assert!(!pump.has_cached_frame(&key()));
    }

    #[test]
    fn enabling_then_enqueueing_caches_the_frame() {
        let pump = EgressPump::with_period(test_facade(), "acme", "gw1", Duration::from_secs(3600));
        pump.set_publish_allowed(key(), true);
        pump.enqueue(key(), frame(1));
        assert!(pump.has_cached_frame(&key()));
    }

    #[test]
    fn disabling_drops_the_cached_frame_atomically() {
        let pump = EgressPump::with_period(test_facade(), "acme", "gw1", Duration::from_secs(3600));
        pump.set_publish_allowed(key(), true);
        pump.enqueue(key(), frame(1));
        assert!(pump.has_cached_frame(&key()));

        pump.set_publish_allowed(key(), false);
        assert!(!pump.is_enabled(&key()));
        assert!(!pump.has_cached_frame(&key()), "I2: disabling must drop the cached frame");
    }

    #[test]
    fn a_late_enqueue_after_disabling_is_dropped_not_resurrected() {
        let pump = EgressPump::with_period(test_facade(), "acme", "gw1", Duration::from_secs(3600));
        pump.set_publish_allowed(key(), true);
        pump.set_publish_allowed(key(), false);
        pump.enqueue(key(), frame(1));
        assert!(!pump.has_cached_frame(&key()), "no ghost republish after gate closes");
    }

    #[test]
    fn clear_device_removes_gate_and_cache_independent_of_others() {
        let other = DeviceKey::new("acme", "gw1", "PLC1", "plc-allen-bradley");
        let pump = EgressPump::with_period(test_facade(), "acme", "gw1", Duration::from_secs(3600));
        pump.set_publish_allowed(key(), true);
        pump.set_publish_allowed(other.clone(), true);
        pump.enqueue(key(), frame(1));
        pump.enqueue(other.clone(), frame(1));

        pump.clear_device(&key());
        assert!(!pump.is_enabled(&key()));
        assert!(pump.is_enabled(&other));
        assert!(pump.has_cached_frame(&other));
    }
}
