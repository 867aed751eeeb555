// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The generic device session supervisor.
//!
//! [`DeviceSessionBase`] owns the transport lifecycle (connect/disconnect/reconnect), runs one
//! polling iteration per tick under cancellation, and hosts the `publishAllowed` gate that keeps
//! a subclass's poll loop idle while no user is interested. Concrete sessions
//! ([`crate::session::robot::RobotSession`], [`crate::session::plc::PlcSession`]) implement
//! [`SessionHooks`] for their device-specific connect/disconnect/read-one-frame behavior; the
//! supervisor itself is concrete code parameterized by that hook object, not an inheritance
//! hierarchy.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{SessionError, SessionErrorKind, TransportError};
use crate::model::{DeviceKey, DeviceStatus, Frame};

/// How long the poll loop sleeps between gate checks while `publishAllowed` is false.
const GATE_CLOSED_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Reconnect backoff step: `min(RECONNECT_MAX_DELAY, RECONNECT_BASE_DELAY * attempt)`.
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

/// The device-specific half of a session: transport lifecycle and one frame read per poll.
///
/// Implementations are the "protected hooks" surface a concrete session provides; the
/// supervisor above never inherits from them, it just holds an `Arc<dyn SessionHooks>`-shaped
/// generic parameter and calls out to it.
#[async_trait]
pub trait SessionHooks: Send + Sync + 'static {
    /// Establish the transport connection. Called once per connect attempt (initial or
    /// reconnect).
    async fn on_connect(&self) -> Result<(), TransportError>;

    /// Tear down the transport connection. Must not fail - cleanup is total, per
    /// `SPEC_FULL.md` §7.
    async fn on_disconnect(&self);

    /// Perform one polling iteration: read and return the next [`Frame`].
    ///
    /// Implementations own their own pacing (sleeping until the next period boundary, or
    /// idling when there is nothing to read) and return once per iteration - the supervisor
    /// calls this in a tight loop whenever `publishAllowed` is set.
    async fn read_frame(&self, cancel: &CancellationToken) -> Result<Frame, TransportError>;
}

/// Tracks `DeviceStatus` transitions behind a single lock, broadcasting each change so the
/// egress/roster side and test harnesses can observe them independently - mirrors the
/// lock-then-log-then-notify shape of the MQTT session layer's lifecycle tracking.
struct StatusState {
    inner: RwLock<(DeviceStatus, Option<String>)>,
    tx: broadcast::Sender<(DeviceStatus, Option<String>)>,
}

impl StatusState {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self {
            inner: RwLock::new((DeviceStatus::Disconnected, None)),
            tx,
        }
    }

    fn get(&self) -> DeviceStatus {
        self.inner.read().unwrap().0
    }

    fn transition(&self, status: DeviceStatus, err: Option<String>) {
        *self.inner.write().unwrap() = (status, err.clone());
        match &err {
            Some(e) => log::warn!("status -> {status} ({e})"),
            None => log::info!("status -> {status}"),
        }
        // No subscribers is not an error - the roster/egress side may not have attached yet.
        let _ = self.tx.send((status, err));
    }

    fn subscribe(&self) -> broadcast::Receiver<(DeviceStatus, Option<String>)> {
        self.tx.subscribe()
    }
}

/// The generic, device-family-agnostic device session supervisor.
pub struct DeviceSessionBase<H: SessionHooks> {
    key: DeviceKey,
    hooks: Arc<H>,
    status: StatusState,
    publish_allowed: AtomicBool,
    publish_allowed_tx: broadcast::Sender<bool>,
    frame_tx: broadcast::Sender<Frame>,
    seq: AtomicU64,
    cancel: AsyncMutex<CancellationToken>,
    supervisor: AsyncMutex<Option<JoinHandle<()>>>,
    /// If true (the default), the poll loop is never invoked while `publishAllowed` is false.
    read_only_when_publish_allowed: bool,
}

impl<H: SessionHooks> DeviceSessionBase<H> {
    /// Create a new, disconnected session supervisor for `key`, delegating device-specific
    /// behavior to `hooks`.
    #[must_use]
    pub fn new(key: DeviceKey, hooks: Arc<H>) -> Arc<Self> {
        let (publish_allowed_tx, _) = broadcast::channel(64);
        let (frame_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            key,
            hooks,
            status: StatusState::new(),
            publish_allowed: AtomicBool::new(false),
            publish_allowed_tx,
            frame_tx,
            seq: AtomicU64::new(0),
            cancel: AsyncMutex::new(CancellationToken::new()),
            supervisor: AsyncMutex::new(None),
            read_only_when_publish_allowed: true,
        })
    }

    /// This session's routing address.
    #[must_use]
    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    /// The current lifecycle status.
    #[must_use]
    pub fn status(&self) -> DeviceStatus {
        self.status.get()
    }

    /// Whether upstream publishing is currently permitted for this device.
    #[must_use]
    pub fn is_publish_allowed(&self) -> bool {
        self.publish_allowed.load(Ordering::SeqCst)
    }

    /// Subscribe to every frame this session reads, from this point forward.
    #[must_use]
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
        self.frame_tx.subscribe()
    }

    /// Subscribe to `statusChanged` events, from this point forward.
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<(DeviceStatus, Option<String>)> {
        self.status.subscribe()
    }

    /// Subscribe to `publishAllowedChanged` events, from this point forward.
    #[must_use]
    pub fn subscribe_publish_allowed(&self) -> broadcast::Receiver<bool> {
        self.publish_allowed_tx.subscribe()
    }

    /// A token scoped to this session's current connect cycle: a child of the cancellation
    /// token `disconnect()` cancels. Lets a concrete session's own background tasks (e.g. a
    /// lease reaper) stop together with the poll loop on `disconnect()`, without an
    /// independent token of their own (`SPEC_FULL.md` §5's cancellation-is-hierarchical rule).
    pub async fn child_token(&self) -> CancellationToken {
        self.cancel.lock().await.child_token()
    }

    /// Allocate the next per-session frame sequence number. Starts at 1; strictly monotonic
    /// even under racing callers (atomic increment).
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Set the `publishAllowed` gate. Edge-triggered: fires `publishAllowedChanged(new)` only on
    /// an actual transition.
    pub fn set_publish_allowed(&self, allowed: bool) {
        let prev = self.publish_allowed.swap(allowed, Ordering::SeqCst);
        if prev != allowed {
            let _ = self.publish_allowed_tx.send(allowed);
        }
    }

    /// Connect: `Disconnected -> Connecting`, invoke `on_connect`. On success, transition through
    /// `Connected` to `Streaming` and launch the supervised poll loop (which reconnects with
    /// backoff on subsequent faults, invisibly to this caller). On failure, set
    /// `publishAllowed=false`, transition to `Faulted` then `Disconnected`, and propagate the
    /// original error - this is the one point after which transport faults are only observable
    /// via `statusChanged`.
    ///
    /// # Errors
    /// Returns [`SessionError::AlreadyConnected`] if a connect/disconnect cycle is already in
    /// progress, or the wrapped [`TransportError`] if the first connect attempt fails.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            return Err(SessionError::new(SessionErrorKind::AlreadyConnected));
        }
        *self.cancel.lock().await = CancellationToken::new();

        self.status.transition(DeviceStatus::Connecting, None);
        if let Err(e) = self.hooks.on_connect().await {
            self.set_publish_allowed(false);
            self.status
                .transition(DeviceStatus::Faulted, Some(e.to_string()));
            self.status.transition(DeviceStatus::Disconnected, None);
            return Err(SessionError::from(e));
        }
        self.status.transition(DeviceStatus::Connected, None);
        self.status.transition(DeviceStatus::Streaming, None);

        let this = Arc::clone(self);
        *supervisor = Some(tokio::spawn(async move { this.supervisor_loop().await }));
        Ok(())
    }

    /// Disconnect. Idempotent: sets `publishAllowed=false`, cancels the poll loop and awaits its
    /// completion (a join error here is logged and swallowed, never propagated - cleanup is
    /// total), and transitions to `Disconnected`.
    pub async fn disconnect(self: &Arc<Self>) {
        self.set_publish_allowed(false);
        let cancel = self.cancel.lock().await.clone();
        cancel.cancel();
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("{}: supervisor task join error (swallowed): {e}", self.key);
            }
        }
        self.status.transition(DeviceStatus::Disconnected, None);
    }

    /// Runs the poll loop, then - unless cancelled - reconnects with backoff indefinitely.
    /// Returns once the session has been cancelled via `disconnect()`.
    async fn supervisor_loop(self: Arc<Self>) {
        let cancel = self.cancel.lock().await.clone();
        loop {
            match self.poll_loop(&cancel).await {
                Ok(()) => {
                    // Normal stop: cancellation requested, not a fault.
                    self.hooks.on_disconnect().await;
                    return;
                }
                Err(e) => {
                    self.set_publish_allowed(false);
                    self.status
                        .transition(DeviceStatus::Faulted, Some(e.to_string()));
                    self.hooks.on_disconnect().await;
                    self.status.transition(DeviceStatus::Disconnected, None);
                }
            }

            if cancel.is_cancelled() {
                return;
            }
            if !self.reconnect_with_backoff(&cancel).await {
                return;
            }
        }
    }

    /// Retries `on_connect` with capped exponential-ish backoff (`min(10s, 500ms * attempt)`)
    /// until it succeeds or `cancel` fires. Returns `true` on a successful reconnect (having
    /// transitioned through `Connecting -> Connected -> Streaming`), `false` if cancelled first.
    async fn reconnect_with_backoff(&self, cancel: &CancellationToken) -> bool {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let delay = RECONNECT_BASE_DELAY
                .saturating_mul(attempt)
                .min(RECONNECT_MAX_DELAY);
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(delay) => {}
            }

            self.status.transition(DeviceStatus::Connecting, None);
            let connect_result = tokio::select! {
                () = cancel.cancelled() => return false,
                res = self.hooks.on_connect() => res,
            };
            match connect_result {
                Ok(()) => {
                    self.status.transition(DeviceStatus::Connected, None);
                    self.status.transition(DeviceStatus::Streaming, None);
                    return true;
                }
                Err(e) => {
                    self.set_publish_allowed(false);
                    self.status
                        .transition(DeviceStatus::Faulted, Some(e.to_string()));
                    self.status.transition(DeviceStatus::Disconnected, None);
                    if cancel.is_cancelled() {
                        return false;
                    }
                }
            }
        }
    }

    async fn poll_loop(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if self.read_only_when_publish_allowed && !self.is_publish_allowed() {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = tokio::time::sleep(GATE_CLOSED_POLL_INTERVAL) => continue,
                }
            }
            match self.hooks.read_frame(cancel).await {
                Ok(mut frame) => {
                    frame.set_seq(self.next_seq());
                    // No subscribers yet (egress pump not wired up) is not an error.
                    let _ = self.frame_tx.send(frame);
                }
                Err(e) => {
                    // A timeout/error observed after cancellation was requested is the caller
                    // stopping us, not a transport fault - SPEC_FULL.md §5.
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    struct CountingHooks {
        connect_calls: AtomicU32,
        connect_fails_first_n: u32,
        frames_before_fault: u32,
        frames_emitted: AtomicU32,
        faulted_once: AtomicBool,
        disconnect_calls: AtomicU32,
    }

    #[async_trait]
    impl SessionHooks for CountingHooks {
        async fn on_connect(&self) -> Result<(), TransportError> {
            let n = self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if n < self.connect_fails_first_n {
                return Err(TransportError::new(
                    crate::error::TransportErrorKind::Io("simulated".into()),
                ));
            }
            Ok(())
        }

        async fn on_disconnect(&self) {
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        }

        async fn read_frame(&self, _cancel: &CancellationToken) -> Result<Frame, TransportError> {
            let emitted = self.frames_emitted.fetch_add(1, Ordering::SeqCst);
            if emitted >= self.frames_before_fault && !self.faulted_once.swap(true, Ordering::SeqCst) {
                return Err(TransportError::new(
                    crate::error::TransportErrorKind::Timeout,
                ));
            }
            Ok(Frame::Telemetry(crate::model::TelemetryFrame {
                ts: 0,
                seq: 0,
                joints_deg: None,
                di: None,
                gi: None,
                go: None,
                d_out: None,
                r: None,
                var: None,
            }))
        }
    }

    fn key() -> DeviceKey {
        DeviceKey::new("acme", "gw1", "R1", "robot-fanuc")
    }

    #[tokio::test]
    async fn initial_connect_failure_propagates_to_caller() {
        let hooks = Arc::new(CountingHooks {
            connect_calls: AtomicU32::new(0),
            connect_fails_first_n: 100,
            frames_before_fault: u32::MAX,
            frames_emitted: AtomicU32::new(0),
            faulted_once: AtomicBool::new(false),
            disconnect_calls: AtomicU32::new(0),
        });
        let session = DeviceSessionBase::new(key(), hooks);
        let err = session.connect().await.unwrap_err();
        assert!(matches!(
            err.kind(),
            SessionErrorKind::Transport(_)
        ));
        assert_eq!(session.status(), DeviceStatus::Disconnected);
    }

    #[tokio::test]
    async fn publish_allowed_gates_read_frame() {
        let hooks = Arc::new(CountingHooks {
            connect_calls: AtomicU32::new(0),
            connect_fails_first_n: 0,
            frames_before_fault: u32::MAX,
            frames_emitted: AtomicU32::new(0),
            faulted_once: AtomicBool::new(false),
            disconnect_calls: AtomicU32::new(0),
        });
        let session = DeviceSessionBase::new(key(), hooks.clone());
        session.connect().await.unwrap();

        // Gate stays closed: give the loop a chance to spin, frames must stay at zero.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(hooks.frames_emitted.load(Ordering::SeqCst), 0);

        session.set_publish_allowed(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(hooks.frames_emitted.load(Ordering::SeqCst) > 0);

        session.disconnect().await;
    }

    #[tokio::test]
    async fn fault_triggers_reconnect_and_resumes_streaming() {
        let hooks = Arc::new(CountingHooks {
            connect_calls: AtomicU32::new(0),
            connect_fails_first_n: 0,
            frames_before_fault: 1,
            frames_emitted: AtomicU32::new(0),
            faulted_once: AtomicBool::new(false),
            disconnect_calls: AtomicU32::new(0),
        });
        let session = DeviceSessionBase::new(key(), hooks.clone());
        session.connect().await.unwrap();
        session.set_publish_allowed(true);

        let mut status_rx = session.subscribe_status();
        let saw_faulted = Arc::new(Notify::new());
        let saw_faulted_clone = saw_faulted.clone();
        tokio::spawn(async move {
            while let Ok((status, _)) = status_rx.recv().await {
                if status == DeviceStatus::Faulted {
                    saw_faulted_clone.notify_one();
                }
            }
        });

        tokio::time::timeout(Duration::from_secs(2), saw_faulted.notified())
            .await
            .expect("expected a Faulted transition after the injected read error");

        // After backoff (>= 500ms), the session should have reconnected and resumed streaming.
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(session.status(), DeviceStatus::Streaming);
        assert!(hooks.connect_calls.load(Ordering::SeqCst) >= 2);

        session.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_invokes_cleanup() {
        let hooks = Arc::new(CountingHooks {
            connect_calls: AtomicU32::new(0),
            connect_fails_first_n: 0,
            frames_before_fault: u32::MAX,
            frames_emitted: AtomicU32::new(0),
            faulted_once: AtomicBool::new(false),
            disconnect_calls: AtomicU32::new(0),
        });
        let session = DeviceSessionBase::new(key(), hooks.clone());
        session.connect().await.unwrap();
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.status(), DeviceStatus::Disconnected);
        assert_eq!(hooks.disconnect_calls.load(Ordering::SeqCst), 1);
    }
}
