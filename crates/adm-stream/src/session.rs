//! Connection manager: one persistent link to the gateway, retried forever
//! at a fixed interval until the owning [`Session`] is closed.
//!
//! All store mutation and status changes go through [`Shared`], which checks
//! the session's liveness flag under the state lock first. Once `close`
//! returns, a frame or status change that was already in flight is dropped.

use crate::config::StreamConfig;
use crate::dispatch::{dispatch_with_limit, DispatchOutcome};
use crate::store::Stores;
use crate::transport::{Link, Transport, TransportError, WsTransport};
use adm_core::{ApprovalRequest, ConnectionStatus, StreamEvent};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Status(ConnectionStatus),
    Dispatched(DispatchOutcome),
    EventsCleared,
    ApprovalsCleared,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    pub events: Vec<StreamEvent>,
    pub approvals: Vec<ApprovalRequest>,
}

struct SessionState {
    status: ConnectionStatus,
    stores: Stores,
}

struct Shared {
    live: AtomicBool,
    state: Mutex<SessionState>,
    updates: broadcast::Sender<SessionUpdate>,
    max_frame_bytes: usize,
}

impl Shared {
    fn new(config: &StreamConfig) -> Self {
        let (updates, _) = broadcast::channel(config.update_buffer.max(1));
        Self {
            live: AtomicBool::new(true),
            state: Mutex::new(SessionState {
                status: ConnectionStatus::Connecting,
                stores: Stores::with_event_capacity(config.event_capacity),
            }),
            updates,
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Returns `false` once the session is dead; callers stop on that.
    fn set_status(&self, status: ConnectionStatus) -> bool {
        let mut state = self.lock();
        if !self.is_live() {
            return false;
        }
        if state.status != status {
            state.status = status;
            let _ = self.updates.send(SessionUpdate::Status(status));
        }
        true
    }

    /// Subscribers only hear about frames that changed a store; malformed,
    /// unknown and duplicate frames leave no trace.
    fn deliver(&self, frame: &[u8]) -> bool {
        let mut state = self.lock();
        if !self.is_live() {
            return false;
        }
        let outcome = dispatch_with_limit(frame, self.max_frame_bytes, &mut state.stores);
        if outcome.changed_events() || outcome.changed_approvals() {
            let _ = self.updates.send(SessionUpdate::Dispatched(outcome));
        }
        true
    }

    /// Flips the liveness flag; `true` only for the call that killed it.
    fn kill(&self) -> bool {
        let _state = self.lock();
        self.live.swap(false, Ordering::SeqCst)
    }
}

/// Owns the connection task and both stores. Dropping it closes it.
pub struct Session {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    /// Starts connecting over WebSocket. Must be called inside a tokio runtime.
    pub fn open(config: StreamConfig) -> Self {
        Self::open_with(config, WsTransport)
    }

    pub fn open_with<T: Transport>(config: StreamConfig, transport: T) -> Self {
        let shared = Arc::new(Shared::new(&config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(event = "stream_session_open", endpoint = %config.endpoint);
        let task = tokio::spawn(run_connection(
            shared.clone(),
            Arc::new(transport),
            config,
            shutdown_rx,
        ));
        Self {
            shared,
            shutdown_tx,
            task: Some(task),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.lock().status
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_live()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.shared.updates.subscribe()
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.shared.lock().stores.events.snapshot()
    }

    pub fn approvals(&self) -> Vec<ApprovalRequest> {
        self.shared.lock().stores.approvals.snapshot()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.shared.lock();
        SessionSnapshot {
            status: state.status,
            events: state.stores.events.snapshot(),
            approvals: state.stores.approvals.snapshot(),
        }
    }

    pub fn clear_events(&self) {
        let mut state = self.shared.lock();
        if !self.shared.is_live() {
            return;
        }
        state.stores.events.clear();
        let _ = self.shared.updates.send(SessionUpdate::EventsCleared);
    }

    pub fn clear_approvals(&self) {
        let mut state = self.shared.lock();
        if !self.shared.is_live() {
            return;
        }
        state.stores.approvals.clear();
        let _ = self.shared.updates.send(SessionUpdate::ApprovalsCleared);
    }

    /// Stops the retry loop: cancels a pending reconnect, closes the live
    /// link, and freezes status and stores. Safe to call more than once.
    pub fn close(&self) {
        if !self.shared.kill() {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        info!(event = "stream_session_closed");
    }

    /// `close` and wait for the connection task to finish closing its link.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(event = "stream_task_join_error", error = %err);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

enum LinkEnd {
    Shutdown,
    Closed,
    Failed(TransportError),
}

async fn run_connection(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    config: StreamConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if !shared.set_status(ConnectionStatus::Connecting) {
            break;
        }
        let connect = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            connect = transport.connect(&config.endpoint) => connect,
        };
        match connect {
            Ok(mut link) => {
                if !shared.set_status(ConnectionStatus::Connected) {
                    link.close().await;
                    break;
                }
                info!(event = "stream_connected", endpoint = %config.endpoint);
                match pump_frames(&shared, link.as_mut(), &mut shutdown).await {
                    LinkEnd::Shutdown => {
                        link.close().await;
                        break;
                    }
                    LinkEnd::Closed => {
                        info!(event = "stream_link_closed", endpoint = %config.endpoint);
                    }
                    LinkEnd::Failed(err) => {
                        // Abort without reading further; dropping the link tears it down.
                        warn!(event = "stream_link_error", endpoint = %config.endpoint, error = %err);
                    }
                }
            }
            Err(err) => {
                warn!(event = "stream_connect_error", endpoint = %config.endpoint, error = %err);
            }
        }

        if !shared.set_status(ConnectionStatus::Disconnected) {
            break;
        }
        debug!(
            event = "stream_reconnect_scheduled",
            delay_ms = config.reconnect_delay.as_millis() as u64
        );
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }
    debug!(event = "stream_session_stopped", endpoint = %config.endpoint);
}

async fn pump_frames(
    shared: &Shared,
    link: &mut dyn Link,
    shutdown: &mut watch::Receiver<bool>,
) -> LinkEnd {
    loop {
        tokio::select! {
            _ = shutdown_requested(shutdown) => return LinkEnd::Shutdown,
            frame = link.next_frame() => match frame {
                Some(Ok(frame)) => {
                    if !shared.deliver(&frame) {
                        return LinkEnd::Shutdown;
                    }
                }
                Some(Err(err)) => return LinkEnd::Failed(err),
                None => return LinkEnd::Closed,
            },
        }
    }
}

/// Resolves once shutdown is signalled or the session handle is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
