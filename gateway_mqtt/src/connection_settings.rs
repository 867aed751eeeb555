// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Generic MQTT connection settings implementations

use std::env::{self, VarError};
use std::time::Duration;

/// All the settings required to establish an MQTT connection to the cloud broker.
#[derive(Builder, Clone)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct MqttConnectionSettings {
    /// Client identifier
    pub(crate) client_id: String,
    /// FQDN of the broker to connect to
    pub(crate) hostname: String,
    /// TCP port to connect to the broker on
    #[builder(default = "8883")]
    pub(crate) tcp_port: u16,
    /// Max time between communications
    #[builder(default = "Duration::from_secs(60)")]
    pub(crate) keep_alive: Duration,
    /// Connection timeout
    #[builder(default = "Duration::from_secs(30)")]
    pub(crate) connection_timeout: Duration,
    /// Clean start
    #[builder(default = "false")]
    pub(crate) clean_start: bool,
    /// TLS negotiation enabled
    #[builder(default = "true")]
    pub(crate) use_tls: bool,
    /// Path to a PEM file used to validate the broker's identity
    #[builder(default = "None")]
    pub(crate) ca_file: Option<String>,
    /// Path to a PEM file containing the client's X.509 certificate
    #[builder(default = "None")]
    pub(crate) cert_file: Option<String>,
    /// Path to a file containing the client's private key
    #[builder(default = "None")]
    pub(crate) key_file: Option<String>,
    /// Path to a file containing the password used to decrypt `key_file`
    #[builder(default = "None")]
    pub(crate) key_password_file: Option<String>,
}

impl MqttConnectionSettingsBuilder {
    /// Initialize the [`MqttConnectionSettingsBuilder`] from environment variables.
    ///
    /// Reads `GATEWAY_MQTT_CLIENT_ID`, `GATEWAY_MQTT_HOSTNAME`, `GATEWAY_MQTT_TCP_PORT`,
    /// `GATEWAY_MQTT_KEEP_ALIVE`, `GATEWAY_MQTT_CLEAN_START`, `GATEWAY_MQTT_USE_TLS`,
    /// `GATEWAY_MQTT_CA_FILE`, `GATEWAY_MQTT_CERT_FILE`, `GATEWAY_MQTT_KEY_FILE`, and
    /// `GATEWAY_MQTT_KEY_PASSWORD_FILE`.
    ///
    /// # Errors
    /// Returns a `String` describing the error if any of the environment variables are invalid.
    pub fn from_environment() -> Result<Self, String> {
        let client_id = string_from_environment("GATEWAY_MQTT_CLIENT_ID")?;
        let hostname = string_from_environment("GATEWAY_MQTT_HOSTNAME")?;
        let tcp_port = string_from_environment("GATEWAY_MQTT_TCP_PORT")?
            .map(|v| v.parse::<u16>())
            .transpose()
            .map_err(|e| format!("GATEWAY_MQTT_TCP_PORT: {e}"))?;
        let keep_alive = string_from_environment("GATEWAY_MQTT_KEEP_ALIVE")?
            .map(|v| v.parse::<u32>().map(u64::from).map(Duration::from_secs))
            .transpose()
            .map_err(|e| format!("GATEWAY_MQTT_KEEP_ALIVE: {e}"))?;
        let clean_start = string_from_environment("GATEWAY_MQTT_CLEAN_START")?
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| format!("GATEWAY_MQTT_CLEAN_START: {e}"))?;
        let use_tls = string_from_environment("GATEWAY_MQTT_USE_TLS")?
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| format!("GATEWAY_MQTT_USE_TLS: {e}"))?;
        let ca_file = Some(string_from_environment("GATEWAY_MQTT_CA_FILE")?);
        let cert_file = Some(string_from_environment("GATEWAY_MQTT_CERT_FILE")?);
        let key_file = Some(string_from_environment("GATEWAY_MQTT_KEY_FILE")?);
        let key_password_file = Some(string_from_environment(
            "GATEWAY_MQTT_KEY_PASSWORD_FILE",
        )?);

        // NOTE: Do not error. It is valid to have empty values if the user will be overriding
        // them, but it likely suggests a misconfiguration - the errors from .validate() will not
        // be particularly clear in this case, since it has no way of knowing whether the values
        // originally came from the environment or were set by the caller.
        if client_id.is_none() {
            log::warn!("GATEWAY_MQTT_CLIENT_ID is not set in environment");
        }
        if hostname.is_none() {
            log::warn!("GATEWAY_MQTT_HOSTNAME is not set in environment");
        }

        Ok(Self {
            client_id,
            hostname,
            tcp_port,
            keep_alive,
            connection_timeout: Some(Duration::from_secs(30)),
            clean_start,
            use_tls,
            ca_file,
            cert_file,
            key_file,
            key_password_file,
        })
    }

    /// Validate the MQTT Connection Settings.
    ///
    /// # Errors
    /// Returns a `String` describing the error if
    /// - `hostname` is empty
    /// - `client_id` is empty and `clean_start` is false
    /// - `key_file` is Some and `cert_file` is None or empty (and vice versa)
    fn validate(&self) -> Result<(), String> {
        if let Some(hostname) = &self.hostname {
            if hostname.is_empty() {
                return Err("Host name cannot be empty".to_string());
            }
        }
        if let Some(client_id) = &self.client_id {
            if client_id.is_empty() {
                let clean_start = self.clean_start.unwrap_or(false);
                if !clean_start {
                    return Err(
                        "client_id is mandatory when clean_start is set to false".to_string()
                    );
                }
            }
        }
        if let Some(Some(key_file)) = &self.key_file {
            if let Some(Some(cert_file)) = &self.cert_file {
                if cert_file.is_empty() || key_file.is_empty() {
                    return Err("key_file and cert_file need to be provided together.".to_string());
                }
            } else {
                return Err("key_file and cert_file need to be provided together.".to_string());
            }
        } else if let Some(Some(_)) = &self.cert_file {
            return Err("key_file and cert_file need to be provided together.".to_string());
        }
        Ok(())
    }
}

/// Helper function to get an environment variable as a string.
fn string_from_environment(key: &str) -> Result<Option<String>, String> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None), // Handled by the validate function if required
        Err(VarError::NotUnicode(_)) => {
            Err("Could not parse non-unicode environment variable".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_configuration() {
        let result = MqttConnectionSettingsBuilder::default()
            .client_id("test_client_id".to_string())
            .hostname("test_host".to_string())
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn hostname_cannot_be_empty() {
        let result = MqttConnectionSettingsBuilder::default()
            .client_id("test_client_id".to_string())
            .hostname(String::new())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn client_id_clean_start_combos() {
        // The client_id must be provided if clean_start is false
        let result = MqttConnectionSettingsBuilder::default()
            .hostname("test_host".to_string())
            .clean_start(false)
            .build();
        assert!(result.is_err());

        // An empty client_id is allowed if clean_start is true
        let result = MqttConnectionSettingsBuilder::default()
            .client_id(String::new())
            .hostname("test_host".to_string())
            .clean_start(true)
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn cert_and_key_must_be_paired() {
        let result = MqttConnectionSettingsBuilder::default()
            .client_id("test_client_id".to_string())
            .hostname("test_host".to_string())
            .cert_file(Some("cert.pem".to_string()))
            .build();
        assert!(result.is_err());

        let result = MqttConnectionSettingsBuilder::default()
            .client_id("test_client_id".to_string())
            .hostname("test_host".to_string())
            .cert_file(Some("cert.pem".to_string()))
            .key_file(Some("key.pem".to_string()))
            .build();
        assert!(result.is_ok());
    }
}
