// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The line-oriented robot transport: connect/disconnect and raw line send/receive.
//!
//! [`RobotSession`](crate::session::robot::RobotSession) owns the `GET_FAST`/`PLAN_*` protocol
//! and frame parsing on top of this; the transport only knows how to move lines of text over a
//! socket.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::RobotConfig;
use crate::error::{TransportError, TransportErrorKind};

/// A line-oriented socket transport to a robot controller.
#[async_trait]
pub trait RobotTransport: Send {
    /// Establish the underlying connection.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Tear down the underlying connection. Must not fail - cleanup is total.
    async fn disconnect(&mut self);

    /// Send one line (without a trailing newline; the transport appends it).
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Read one line (without its trailing newline), failing with
    /// [`TransportErrorKind::Timeout`] if `deadline` elapses first.
    async fn read_line(&mut self, deadline: Duration) -> Result<String, TransportError>;
}

/// A [`RobotTransport`] backed by a real TCP socket.
pub struct TcpRobotTransport {
    config: RobotConfig,
    stream: Option<BufReader<TcpStream>>,
}

impl TcpRobotTransport {
    /// Create a transport that will connect to `config.ip:config.port` on [`connect`](Self::connect).
    #[must_use]
    pub fn new(config: RobotConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }
}

#[async_trait]
impl RobotTransport for TcpRobotTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let addr = (self.config.ip.as_str(), self.config.port);
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::new(TransportErrorKind::Timeout))?
            .map_err(|e| TransportError::new(TransportErrorKind::Io(e.to_string())))?;
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.stream = None;
    }

    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::new(TransportErrorKind::Io("not connected".into())))?;
        stream
            .get_mut()
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Io(e.to_string())))
    }

    async fn read_line(&mut self, deadline: Duration) -> Result<String, TransportError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::new(TransportErrorKind::Io("not connected".into())))?;
        let mut line = String::new();
        let read = timeout(deadline, stream.read_line(&mut line))
            .await
            .map_err(|_| TransportError::new(TransportErrorKind::Timeout))?
            .map_err(|e| TransportError::new(TransportErrorKind::Io(e.to_string())))?;
        if read == 0 {
            return Err(TransportError::new(TransportErrorKind::Io(
                "connection closed".into(),
            )));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// An in-process [`RobotTransport`] double, used by tests and by the sample binary when no real
/// robot is available. Tracks a small amount of fake plant state so that a `J=` line's values
/// visibly change between polls.
pub struct SimulatedRobotTransport {
    connected: bool,
    tick: u64,
    pending: VecDeque<String>,
    last_plan: Option<String>,
    fail_next_read: bool,
}

impl SimulatedRobotTransport {
    /// Create a new simulator, disconnected.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: false,
            tick: 0,
            pending: VecDeque::new(),
            last_plan: None,
            fail_next_read: false,
        }
    }

    /// Force the next `read_line` call to fail, simulating a connection drop mid-iteration.
    pub fn fail_next_read(&mut self) {
        self.fail_next_read = true;
    }
}

impl Default for SimulatedRobotTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RobotTransport for SimulatedRobotTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
        self.pending.clear();
    }

    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::new(TransportErrorKind::Io(
                "not connected".into(),
            )));
        }
        if let Some(plan) = line.strip_prefix("PLAN_") {
            self.last_plan = Some(plan.to_string());
            self.pending.push_back("OK".to_string());
        } else if line == "GET_FAST" {
            self.tick += 1;
            let t = self.tick as f64;
            self.pending
                .push_back(format!("J={:.2},{:.2},{:.2},{:.2},{:.2},{:.2}", t, t * 2.0, 0.0, 0.0, 0.0, 0.0));
            self.pending.push_back("DI=1:1,2:0".to_string());
            self.pending.push_back("GI=1:7".to_string());
            self.pending.push_back("GO=1:0".to_string());
            self.pending.push_back("DO=1:1".to_string());
            self.pending.push_back("R=1:10|1.5,2:ERR".to_string());
            self.pending.push_back("VAR=PART_COUNT:42".to_string());
            self.pending.push_back("END".to_string());
        }
        Ok(())
    }

    async fn read_line(&mut self, _deadline: Duration) -> Result<String, TransportError> {
        if self.fail_next_read {
            self.fail_next_read = false;
            return Err(TransportError::new(TransportErrorKind::Io(
                "simulated connection loss".into(),
            )));
        }
        self.pending
            .pop_front()
            .ok_or_else(|| TransportError::new(TransportErrorKind::Timeout))
    }
}
