// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The retained fleet-roster publisher.
//!
//! [`RosterPublisher`] tracks every attached device's display name, connection type, lifecycle
//! status, and wall-clock age of its last data frame, and republishes the retained roster
//! document whenever the device set or any device's status changes. Unlike [`crate::egress`], it
//! never gates on `publishAllowed` - reporting a device as connected-but-idle is still useful.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::broadcast;

use gateway_mqtt::control_packet::QoS;
use gateway_mqtt::MqttFacade;

use crate::model::{DeviceKey, DeviceStatus};
use crate::session::ManagedSession;

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

struct DeviceEntry {
    display_name: String,
    connection_type: String,
    status: DeviceStatus,
    last_data: Option<Instant>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RosterDeviceJson {
    device_id: String,
    device_type: String,
    display_name: String,
    status: DeviceStatus,
    connection_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_data_ms: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RosterJson {
    ts: i64,
    tenant_id: String,
    gateway_id: String,
    devices: Vec<RosterDeviceJson>,
}

/// Maintains and republishes the retained fleet roster document (`SPEC_FULL.md` §4.5/§6).
pub struct RosterPublisher {
    tenant_id: String,
    gateway_id: String,
    facade: MqttFacade,
    devices: StdMutex<BTreeMap<DeviceKey, DeviceEntry>>,
}

impl RosterPublisher {
    /// Create an empty roster publisher for `tenant_id`/`gateway_id`, publishing through
    /// `facade`.
    #[must_use]
    pub fn new(facade: MqttFacade, tenant_id: impl Into<String>, gateway_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            tenant_id: tenant_id.into(),
            gateway_id: gateway_id.into(),
            facade,
            devices: StdMutex::new(BTreeMap::new()),
        })
    }

    /// The retained topic this roster document is published to.
    #[must_use]
    pub fn topic(&self) -> String {
        format!("twinsync/{}/{}/devices", self.tenant_id, self.gateway_id)
    }

    /// Register `session` in the roster and start tracking its status/frame events. Triggers an
    /// immediate republish, since the device set changed.
    pub fn attach_session(
        self: &Arc<Self>,
        session: &Arc<dyn ManagedSession>,
        display_name: impl Into<String>,
        connection_type: impl Into<String>,
    ) {
        let key = session.key().clone();
        {
            let mut devices = self.devices.lock().unwrap();
            devices.insert(
                key.clone(),
                DeviceEntry {
                    display_name: display_name.into(),
                    connection_type: connection_type.into(),
                    status: session.status(),
                    last_data: None,
                },
            );
        }
        self.spawn_publish();

        let this = Arc::clone(self);
        let key_for_status = key.clone();
        let mut status_rx = session.subscribe_status();
        tokio::spawn(async move {
            loop {
                match status_rx.recv().await {
                    Ok((status, _err)) => {
                        this.update_status(&key_for_status, status);
                        this.spawn_publish();
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        let this = Arc::clone(self);
        let mut frame_rx = session.subscribe_frames();
        tokio::spawn(async move {
            loop {
                match frame_rx.recv().await {
                    Ok(_frame) => this.touch_last_data(&key),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Remove `key` from the roster. Triggers an immediate republish.
    pub fn remove_device(self: &Arc<Self>, key: &DeviceKey) {
        self.devices.lock().unwrap().remove(key);
        self.spawn_publish();
    }

    fn update_status(&self, key: &DeviceKey, status: DeviceStatus) {
        if let Some(entry) = self.devices.lock().unwrap().get_mut(key) {
            entry.status = status;
        }
    }

    fn touch_last_data(&self, key: &DeviceKey) {
        if let Some(entry) = self.devices.lock().unwrap().get_mut(key) {
            entry.last_data = Some(Instant::now());
        }
    }

    /// A point-in-time snapshot of the roster document, for tests and for [`Self::publish_now`].
    fn snapshot(&self) -> RosterJson {
        let now = Instant::now();
        let devices = self.devices.lock().unwrap();
        RosterJson {
            ts: now_unix_ms(),
            tenant_id: self.tenant_id.clone(),
            gateway_id: self.gateway_id.clone(),
            devices: devices
                .iter()
                .map(|(key, entry)| RosterDeviceJson {
                    device_id: key.device_id.clone(),
                    device_type: key.device_type.clone(),
                    display_name: entry.display_name.clone(),
                    status: entry.status,
                    connection_type: entry.connection_type.clone(),
                    last_data_ms: entry
                        .last_data
                        .map(|t| i64::try_from(now.duration_since(t).as_millis()).unwrap_or(i64::MAX)),
                })
                .collect(),
        }
    }

    fn spawn_publish(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.publish_now().await;
        });
    }

    async fn publish_now(&self) {
        let roster = self.snapshot();
        let topic = self.topic();
        match serde_json::to_vec(&roster) {
            Ok(bytes) => {
                if let Err(e) = self.facade.publish(&topic, QoS::AtLeastOnce, true, bytes).await {
                    log::warn!("roster: publish to {topic} failed: {e}");
                }
            }
            Err(e) => log::warn!("roster: failed to serialize roster: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_mqtt::{MqttConnectionSettingsBuilder, MqttFacade};

    fn key(id: &str) -> DeviceKey {
        DeviceKey::new("acme", "gw1", id, "robot-fanuc")
    }

    fn test_facade() -> MqttFacade {
        let settings = MqttConnectionSettingsBuilder::default()
            .client_id("roster-test")
            .hostname("127.0.0.1")
            .tcp_port(1u16)
            .use_tls(false)
            .build()
            .unwrap();
        MqttFacade::connect(&settings).unwrap()
    }

    fn roster() -> Arc<RosterPublisher> {
        RosterPublisher::new(test_facade(), "acme", "gw1")
    }

    #[test]
    fn fresh_roster_has_no_devices() {
        let r = roster();
        assert!(r.snapshot().devices.is_empty());
    }

    #[test]
    fn inserting_a_device_directly_reflects_in_snapshot() {
        let r = roster();
        r.devices.lock().unwrap().insert(
            key("R1"),
            DeviceEntry {
                display_name: "Line 1 Robot".to_string(),
                connection_type: "robot".to_string(),
                status: DeviceStatus::Streaming,
                last_data: None,
            },
        );
        let snap = r.snapshot();
        assert_eq!(snap.devices.len(), 1);
        assert_eq!(snap.devices[0].device_id, "R1");
        assert_eq!(snap.devices[0].display_name, "Line 1 Robot");
        assert!(snap.devices[0].last_data_ms.is_none());
    }

    #[test]
    fn touch_last_data_populates_last_data_ms() {
        let r = roster();
        r.devices.lock().unwrap().insert(
            key("R1"),
            DeviceEntry {
                display_name: "Line 1 Robot".to_string(),
                connection_type: "robot".to_string(),
                status: DeviceStatus::Streaming,
                last_data: None,
            },
        );
        r.touch_last_data(&key("R1"));
        let snap = r.snapshot();
        assert!(snap.devices[0].last_data_ms.is_some());
    }

    #[test]
    fn update_status_changes_the_tracked_entry() {
        let r = roster();
        r.devices.lock().unwrap().insert(
            key("R1"),
            DeviceEntry {
                display_name: "Line 1 Robot".to_string(),
                connection_type: "robot".to_string(),
                status: DeviceStatus::Connecting,
                last_data: None,
            },
        );
        r.update_status(&key("R1"), DeviceStatus::Streaming);
        assert_eq!(r.snapshot().devices[0].status, DeviceStatus::Streaming);
    }

    #[test]
    fn remove_device_drops_it_from_the_snapshot() {
        let r = roster();
        r.devices.lock().unwrap().insert(
            key("R1"),
            DeviceEntry {
                display_name: "Line 1 Robot".to_string(),
                connection_type: "robot".to_string(),
                status: DeviceStatus::Streaming,
                last_data: None,
            },
        );
        r.remove_device(&key("R1"));
        assert!(r.snapshot().devices.is_empty());
    }
}
