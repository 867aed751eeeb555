// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Common error types for the MQTT facade.

use std::fmt;

use thiserror::Error;

use crate::topic::TopicParseError;

/// Error type for MQTT connection
pub type ConnectionError = rumqttc::v5::ConnectionError;
/// Error type for completion tokens
pub type CompletionError = rumqttc::NoticeError;
/// Error subtype for MQTT connection error caused by state
pub type StateError = rumqttc::v5::StateError;

/// Error returned by a [`crate::facade::MqttFacade`] operation.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct FacadeError {
    kind: FacadeErrorKind,
}

impl FacadeError {
    /// Create a new [`FacadeError`]
    #[must_use]
    pub fn new(kind: FacadeErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`FacadeErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &FacadeErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`FacadeError`]
#[derive(Debug, Error)]
pub enum FacadeErrorKind {
    /// An operation was attempted before a connection was established.
    NotConnected,
    /// The underlying client rejected the publish.
    Publish(#[source] ConnectionError),
    /// The underlying client rejected the subscribe.
    Subscribe(#[source] ConnectionError),
    /// TLS configuration could not be assembled (missing/unreadable cert material).
    Tls(String),
    /// The topic name or filter supplied by the caller is not a valid MQTT topic.
    InvalidTopic(#[from] TopicParseError),
}

impl fmt::Display for FacadeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacadeErrorKind::NotConnected => write!(f, "facade is not connected to a broker"),
            FacadeErrorKind::Publish(e) => write!(f, "publish failed: {e}"),
            FacadeErrorKind::Subscribe(e) => write!(f, "subscribe failed: {e}"),
            FacadeErrorKind::Tls(e) => write!(f, "TLS configuration error: {e}"),
            FacadeErrorKind::InvalidTopic(e) => write!(f, "invalid topic: {e}"),
        }
    }
}
