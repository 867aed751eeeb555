// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for the gateway's device transports, sessions, and ingress parsing.

use std::fmt;

use thiserror::Error;

/// Error produced by a [`crate::transport::RobotTransport`] or [`crate::transport::PlcTransport`].
#[derive(Debug, Error, Clone)]
#[error("{kind}")]
pub struct TransportError {
    kind: TransportErrorKind,
}

impl TransportError {
    /// Create a new [`TransportError`]
    #[must_use]
    pub fn new(kind: TransportErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`TransportErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`TransportError`]. Every variant is classified as a
/// connection-loss signal by the owning session - there is no "transient but not fault" tier.
#[derive(Debug, Clone)]
pub enum TransportErrorKind {
    /// The socket was closed, or a read/write syscall failed.
    Io(String),
    /// The read phase did not complete within its deadline.
    Timeout,
    /// The device responded, but not in the shape the protocol expects (e.g. a non-`OK` ack to
    /// a plan command, or an unparseable frame).
    Protocol(String),
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Io(e) => write!(f, "transport I/O error: {e}"),
            TransportErrorKind::Timeout => write!(f, "transport read timed out"),
            TransportErrorKind::Protocol(e) => write!(f, "device protocol error: {e}"),
        }
    }
}

/// Error returned synchronously from a session's public API.
#[derive(Debug, Error, Clone)]
#[error("{kind}")]
pub struct SessionError {
    kind: SessionErrorKind,
}

impl SessionError {
    /// Create a new [`SessionError`]
    #[must_use]
    pub fn new(kind: SessionErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`SessionErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &SessionErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`SessionError`].
#[derive(Debug, Clone)]
pub enum SessionErrorKind {
    /// A programmer error: an operation that requires a connection was attempted before one was
    /// established.
    NotConnected,
    /// A programmer error: `connect()` was called on a session that is already connected.
    AlreadyConnected,
    /// The very first connection attempt failed; propagated synchronously per `SPEC_FULL.md` §7
    /// (subsequent reconnect failures are only observable via `statusChanged`).
    Transport(TransportError),
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionErrorKind::NotConnected => write!(f, "session is not connected"),
            SessionErrorKind::AlreadyConnected => write!(f, "session is already connected"),
            SessionErrorKind::Transport(e) => write!(f, "initial connect failed: {e}"),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::new(SessionErrorKind::Transport(e))
    }
}
