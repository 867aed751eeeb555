// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use gateway_mqtt::control_packet::QoS;
use gateway_mqtt::{Handler, MqttConnectionSettingsBuilder, MqttFacade};

fn setup_test(client_id: &str) -> Option<gateway_mqtt::MqttConnectionSettings> {
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::max())
        .format_timestamp(None)
        .filter_module("rumqttc", log::LevelFilter::Warn)
        .try_init();
    if env::var("ENABLE_NETWORK_TESTS").is_err() {
        log::warn!("This test is skipped. Set ENABLE_NETWORK_TESTS to run.");
        return None;
    }

    Some(
        MqttConnectionSettingsBuilder::default()
            .client_id(client_id)
            .hostname("localhost")
            .tcp_port(1883u16)
            .keep_alive(Duration::from_secs(5))
            .clean_start(true)
            .use_tls(false)
            .build()
            .unwrap(),
    )
}

/// Requires a local unauthenticated broker on :1883. Skipped unless ENABLE_NETWORK_TESTS is set.
#[tokio::test]
async fn publish_is_observed_by_a_registered_handler() {
    let Some(settings) = setup_test("network_test_publish_roundtrip") else {
        return;
    };

    let facade = MqttFacade::connect(&settings).unwrap();
    let topic = "twinsync/acme/gw1/data/robot/R1";

    let notify = Arc::new(Notify::new());
    let notify_clone = notify.clone();
    let handler: Handler = Arc::new(move |_publish| {
        let notify = notify_clone.clone();
        Box::pin(async move {
            notify.notify_one();
            Ok(())
        })
    });
    facade.add_handler(handler).await;
    facade.subscribe(topic, QoS::AtMostOnce).await.unwrap();

    // give the broker a moment to process the SUBSCRIBE before publishing
    tokio::time::sleep(Duration::from_millis(200)).await;
    facade
        .publish(topic, QoS::AtMostOnce, false, b"hello".to_vec())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), notify.notified())
        .await
        .expect("handler was never invoked");
}
