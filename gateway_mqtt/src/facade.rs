// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A thin facade over the underlying MQTT client.
//!
//! [`MqttFacade`] owns exactly one connection to the broker and fans inbound publishes out to a
//! list of registered handlers. It knows nothing about devices, plans, or the gateway's own
//! topic structure - only generic MQTT topic names (see [`crate::topic`]).

use std::fs;
use std::future::Future;
use std::io::BufReader;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rumqttc::v5::{AsyncClient, Event, EventLoop, Incoming, MqttOptions};
use rumqttc::{Transport, TlsConfiguration};
use tokio::sync::Mutex;

use crate::connection_settings::MqttConnectionSettings;
use crate::control_packet::{Publish, QoS};
use crate::error::{FacadeError, FacadeErrorKind};

/// A handler invoked for each inbound PUBLISH. Handlers must not block indefinitely; they
/// return a boxed future representing the (already-initiated) completion of their work. An `Err`
/// is logged and swallowed - one bad handler must not break the chain for the others.
pub type Handler = Arc<dyn Fn(Publish) -> BoxFuture + Send + Sync>;

/// Boxed, owned future returned by a [`Handler`].
pub type BoxFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// A thin facade over a single MQTT connection.
///
/// Cloning an [`MqttFacade`] shares the underlying client and handler list - clones are cheap
/// handles to the same connection, matching how the rest of the gateway passes this type around.
#[derive(Clone)]
pub struct MqttFacade {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    handlers: Arc<Mutex<Vec<Handler>>>,
}

impl MqttFacade {
    /// Establish a connection to `hostname:port` under `client_id`, using the TLS 1.2
    /// client-certificate material described by `settings`. Spawns a background task that
    /// drives the connection's event loop and dispatches inbound publishes to registered
    /// handlers; the task runs for the lifetime of the returned facade.
    ///
    /// # Errors
    /// Returns [`FacadeError`] if the TLS configuration cannot be assembled from the certificate
    /// paths in `settings`.
    pub fn connect(settings: &MqttConnectionSettings) -> Result<Self, FacadeError> {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.hostname.clone(),
            settings.tcp_port,
        );
        options.set_keep_alive(settings.keep_alive);
        options.set_connection_timeout(settings.connection_timeout.as_secs());
        options.set_clean_start(settings.clean_start);

        if settings.use_tls {
            let tls_config = build_tls_config(settings)?;
            options.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(
                tls_config,
            ))));
        }

        let (client, event_loop) = AsyncClient::new(options, 100);
        let connected = Arc::new(AtomicBool::new(false));
        let handlers: Arc<Mutex<Vec<Handler>>> = Arc::new(Mutex::new(Vec::new()));

        let facade = Self {
            client,
            connected,
            handlers,
        };
        facade.spawn_event_loop(event_loop);
        Ok(facade)
    }

    /// Register a handler for inbound publishes. Handlers run sequentially, in registration
    /// order, for each message - never in parallel - so per-topic ordering is preserved.
    pub async fn add_handler(&self, handler: Handler) {
        self.handlers.lock().await.push(handler);
    }

    /// Returns true if the facade believes it is currently connected to the broker.
    /// Best-effort: may lag the true socket state by up to one event loop iteration.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Subscribe to a topic filter at the given QoS.
    ///
    /// # Errors
    /// Returns [`FacadeError`] if the filter is not a valid MQTT topic filter, or the client has
    /// been detached from its connection.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), FacadeError> {
        crate::topic::TopicFilter::from_string(filter.to_string())
            .map_err(|e| FacadeError::new(FacadeErrorKind::InvalidTopic(e)))?;
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(|e| FacadeError::new(FacadeErrorKind::Subscribe(e)))
    }

    /// Publish a message.
    ///
    /// # Errors
    /// Returns [`FacadeError`] if the topic is not a valid MQTT topic name, or the client has
    /// been detached from its connection.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), FacadeError> {
        crate::topic::TopicName::from_string(topic.to_string())
            .map_err(|e| FacadeError::new(FacadeErrorKind::InvalidTopic(e)))?;
        self.client
            .publish(topic, qos, retain, payload.into())
            .await
            .map_err(|e| FacadeError::new(FacadeErrorKind::Publish(e)))
    }

    fn spawn_event_loop(&self, mut event_loop: EventLoop) {
        let connected = self.connected.clone();
        let handlers = self.handlers.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        connected.store(true, Ordering::Relaxed);
                        log::info!("MQTT facade connected");
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        dispatch(&handlers, publish).await;
                    }
                    Ok(Event::Incoming(Incoming::Disconnect(_))) => {
                        connected.store(false, Ordering::Relaxed);
                        log::warn!("MQTT facade received DISCONNECT from broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected.store(false, Ordering::Relaxed);
                        log::warn!("MQTT event loop error, reconnecting: {e}");
                    }
                }
            }
        });
    }
}

/// Snapshot the handler list and dispatch sequentially to each - a single bad handler logs and
/// is swallowed rather than stopping the chain for the others.
async fn dispatch(handlers: &Arc<Mutex<Vec<Handler>>>, publish: Publish) {
    let snapshot: Vec<Handler> = handlers.lock().await.clone();
    for handler in snapshot {
        if let Err(e) = handler(publish.clone()).await {
            let topic = String::from_utf8_lossy(&publish.topic);
            log::error!("MQTT handler for topic '{topic}' failed: {e}");
        }
    }
}

fn build_tls_config(
    settings: &MqttConnectionSettings,
) -> Result<rustls::ClientConfig, FacadeError> {
    let mut root_store = rustls::RootCertStore::empty();
    if let Some(ca_file) = &settings.ca_file {
        let mut reader = BufReader::new(
            fs::File::open(ca_file)
                .map_err(|e| FacadeError::new(FacadeErrorKind::Tls(format!("ca_file: {e}"))))?,
        );
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert =
                cert.map_err(|e| FacadeError::new(FacadeErrorKind::Tls(format!("ca_file: {e}"))))?;
            root_store
                .add(cert)
                .map_err(|e| FacadeError::new(FacadeErrorKind::Tls(format!("ca_file: {e}"))))?;
        }
    } else {
        for cert in rustls_native_certs::load_native_certs()
            .map_err(|e| FacadeError::new(FacadeErrorKind::Tls(format!("native roots: {e}"))))?
        {
            let _ = root_store.add(cert);
        }
    }

    let builder = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        .with_root_certificates(root_store);

    let config = match (&settings.cert_file, &settings.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let certs = load_certs(cert_file)?;
            let key = load_key(key_file)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| FacadeError::new(FacadeErrorKind::Tls(format!("client cert: {e}"))))?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(config)
}

fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, FacadeError> {
    let mut reader = BufReader::new(
        fs::File::open(path)
            .map_err(|e| FacadeError::new(FacadeErrorKind::Tls(format!("cert_file: {e}"))))?,
    );
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| FacadeError::new(FacadeErrorKind::Tls(format!("cert_file: {e}"))))
}

fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>, FacadeError> {
    let mut reader = BufReader::new(
        fs::File::open(path)
            .map_err(|e| FacadeError::new(FacadeErrorKind::Tls(format!("key_file: {e}"))))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| FacadeError::new(FacadeErrorKind::Tls(format!("key_file: {e}"))))?
        .ok_or_else(|| FacadeError::new(FacadeErrorKind::Tls("key_file: no key found".into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handlers_dispatch_sequentially_in_registration_order() {
        let handlers: Arc<Mutex<Vec<Handler>>> = Arc::new(Mutex::new(Vec::new()));
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3u32 {
            let order = order.clone();
            let handler: Handler = Arc::new(move |_publish| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().await.push(id);
                    Ok(())
                })
            });
            handlers.lock().await.push(handler);
        }

        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "twinsync/t/g/data/robot/R1".into(),
            pkid: 0,
            payload: vec![].into(),
            properties: None,
        };
        dispatch(&handlers, publish).await;

        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn a_bad_handler_does_not_block_the_rest() {
        let handlers: Arc<Mutex<Vec<Handler>>> = Arc::new(Mutex::new(Vec::new()));
        let ran: Arc<Mutex<bool>> = Arc::new(Mutex::new(false));

        let failing: Handler = Arc::new(|_publish| Box::pin(async { Err("boom".to_string()) }));
        handlers.lock().await.push(failing);

        let ran_clone = ran.clone();
        let ok: Handler = Arc::new(move |_publish| {
            let ran = ran_clone.clone();
            Box::pin(async move {
                *ran.lock().await = true;
                Ok(())
            })
        });
        handlers.lock().await.push(ok);

        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "twinsync/t/g/data/robot/R1".into(),
            pkid: 0,
            payload: vec![].into(),
            properties: None,
        };
        dispatch(&handlers, publish).await;

        assert!(*ran.lock().await);
    }
}
