// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use tokio::sync::Mutex;

use gateway_mqtt::control_packet::{Publish, QoS};
use gateway_mqtt::Handler;

fn sample_publish(topic: &str) -> Publish {
    Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: topic.as_bytes().to_vec().into(),
        pkid: 0,
        payload: b"hello".to_vec().into(),
        properties: None,
    }
}

#[tokio::test]
async fn handler_receives_the_publish_it_is_given() {
    let received: Arc<Mutex<Option<Publish>>> = Arc::new(Mutex::new(None));
    let received_clone = received.clone();

    let handler: Handler = Arc::new(move |publish| {
        let received = received_clone.clone();
        Box::pin(async move {
            *received.lock().await = Some(publish);
            Ok(())
        })
    });

    let publish = sample_publish("twinsync/acme/gw1/data/robot/R1");
    handler(publish.clone()).await.unwrap();

    let got = received.lock().await.take().unwrap();
    assert_eq!(got.topic, publish.topic);
}
