//! Connection Supervisor - Live Connection Management
//!
//! This module owns every live streaming connection. The supervisor:
//!
//! - Assigns identities on accept
//! - Sends frames and converts transport failures into a `false` result
//! - Tracks liveness, emits heartbeats and closes idle connections
//! - Enforces a per-connection budget of consecutive send failures
//! - Tracks in-flight request tasks so closing a connection cancels them
//!
//! # Architecture
//!
//! ```text
//!                     ConnectionSupervisor
//!          ┌───────────────────────────────────────────────┐
//!          │ DashMap<ConnectionId, Arc<ConnectionEntry>>   │
//!          │   entry: transport, Mutex<state>, tasks       │
//!          └───────────────┬───────────────────────────────┘
//!                          │
//!        ┌─────────────────┼──────────────────┐
//!        │                 │                  │
//!  receive loop      request tasks        sweeper
//!  record_activity   send(event)          sweep() every heartbeat/2
//! ```
//!
//! # Lifecycle
//!
//! `Connecting` (transport handshake, owned by the caller) → `Connected` →
//! `IdleWarned` (a heartbeat went out) → closed. A connection is in the live
//! set iff its transport is usable. Removal from the map is the single point
//! where a connection dies, so closing is idempotent: only the caller that
//! actually removed the entry runs the teardown.
//!
//! # Thread Safety
//!
//! The live set is a sharded [`DashMap`], never a single global lock. Per
//! connection state sits behind a small `parking_lot::Mutex` that is never
//! held across an await point.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{ConfigError, TransportError};
use crate::events::{ConnectionId, RequestId, StreamEvent};

/// Fraction of the heartbeat interval after which an idle connection is probed
const HEARTBEAT_THRESHOLD: f64 = 0.8;

// =============================================================================
// Transport
// =============================================================================

/// The send side of a client connection
///
/// Implemented by the daemon over a WebSocket sink and by tests over
/// in-memory recorders.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver one text frame
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Close the underlying connection (best effort)
    async fn close(&self);
}

// =============================================================================
// Configuration
// =============================================================================

/// Liveness and error budget settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Heartbeat period in seconds
    pub heartbeat_interval_secs: u64,

    /// Idle time after which a connection is closed, in seconds
    pub connection_timeout_secs: u64,

    /// Consecutive failed sends that close a connection
    pub max_send_failures: u32,

    /// Upper bound on a single transport write or close, in seconds
    pub send_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            connection_timeout_secs: 120,
            max_send_failures: 10,
            send_timeout_secs: 10,
        }
    }
}

impl SupervisorConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat period
    #[must_use]
    pub fn with_heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    /// Set the idle timeout
    #[must_use]
    pub fn with_connection_timeout_secs(mut self, secs: u64) -> Self {
        self.connection_timeout_secs = secs;
        self
    }

    /// Set the send failure budget
    #[must_use]
    pub fn with_max_send_failures(mut self, max: u32) -> Self {
        self.max_send_failures = max;
        self
    }

    /// Set the transport write timeout
    #[must_use]
    pub fn with_send_timeout_secs(mut self, secs: u64) -> Self {
        self.send_timeout_secs = secs;
        self
    }

    /// Heartbeat period
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Idle timeout
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Bound on one transport write or close
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Idle time after which a heartbeat is due
    #[must_use]
    pub fn heartbeat_threshold(&self) -> Duration {
        self.heartbeat_interval().mul_f64(HEARTBEAT_THRESHOLD)
    }

    /// Period of the background sweep
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        (self.heartbeat_interval() / 2).max(Duration::from_millis(100))
    }

    /// Reject zero values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Zero {
                field: "supervisor.heartbeat_interval_secs",
            });
        }
        if self.connection_timeout_secs == 0 {
            return Err(ConfigError::Zero {
                field: "supervisor.connection_timeout_secs",
            });
        }
        if self.max_send_failures == 0 {
            return Err(ConfigError::Zero {
                field: "supervisor.max_send_failures",
            });
        }
        if self.send_timeout_secs == 0 {
            return Err(ConfigError::Zero {
                field: "supervisor.send_timeout_secs",
            });
        }
        Ok(())
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Liveness phase of a live connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Traffic seen recently
    Connected,
    /// Idle long enough that a heartbeat was sent
    IdleWarned,
}

/// Why a connection was closed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The client went away or sent a close frame
    ClientDisconnect,
    /// No traffic for longer than the connection timeout
    Timeout,
    /// A heartbeat could not be delivered
    HeartbeatFailed,
    /// The transport reported itself closed
    TransportClosed,
    /// Too many consecutive send failures
    ErrorBudget,
    /// The gateway is shutting down
    Shutdown,
}

impl CloseReason {
    /// Stable lowercase name used in logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientDisconnect => "client_disconnect",
            Self::Timeout => "timeout",
            Self::HeartbeatFailed => "heartbeat_failed",
            Self::TransportClosed => "transport_closed",
            Self::ErrorBudget => "error_budget",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct ConnectionState {
    last_activity: Instant,
    last_heartbeat: Option<Instant>,
    consecutive_failures: u32,
    phase: ConnectionPhase,
}

struct ConnectionEntry {
    transport: Arc<dyn Transport>,
    peer: Option<SocketAddr>,
    connected_at: Instant,
    state: Mutex<ConnectionState>,
    tasks: Mutex<HashMap<RequestId, AbortHandle>>,
}

/// What one sweep did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections closed for inactivity
    pub timed_out: Vec<ConnectionId>,
    /// Heartbeats delivered
    pub heartbeats_sent: usize,
    /// Connections closed because a heartbeat failed
    pub heartbeat_failures: Vec<ConnectionId>,
}

impl SweepReport {
    /// Whether the sweep changed anything
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.heartbeats_sent == 0 && self.heartbeat_failures.is_empty()
    }
}

#[derive(Clone, Copy)]
enum SweepAction {
    Close,
    Heartbeat,
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owner of all live connections
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    connections: DashMap<ConnectionId, Arc<ConnectionEntry>>,
}

impl ConnectionSupervisor {
    /// Create an empty supervisor
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            connections: DashMap::new(),
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn entry(&self, id: &ConnectionId) -> Option<Arc<ConnectionEntry>> {
        self.connections.get(id).map(|e| Arc::clone(e.value()))
    }

    /// One transport write, bounded by the send timeout
    ///
    /// A peer that stopped reading shows up as an `Io` failure instead of a
    /// write that never completes.
    async fn write(&self, entry: &ConnectionEntry, text: String) -> Result<(), TransportError> {
        let limit = self.config.send_timeout();
        match tokio::time::timeout(limit, entry.transport.send_text(text)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Io(format!(
                "write timed out after {}s",
                limit.as_secs()
            ))),
        }
    }

    /// Register a freshly handshaken transport
    pub fn accept(&self, transport: Arc<dyn Transport>, peer: Option<SocketAddr>) -> ConnectionId {
        let id = ConnectionId::new();
        let now = Instant::now();
        let entry = ConnectionEntry {
            transport,
            peer,
            connected_at: now,
            state: Mutex::new(ConnectionState {
                last_activity: now,
                last_heartbeat: None,
                consecutive_failures: 0,
                phase: ConnectionPhase::Connected,
            }),
            tasks: Mutex::new(HashMap::new()),
        };
        self.connections.insert(id, Arc::new(entry));
        tracing::info!(
            connection_id = %id,
            peer = ?peer,
            live = self.connections.len(),
            "Connection accepted"
        );
        id
    }

    /// Send one event
    ///
    /// Returns `false` if the connection is unknown, already closed, or the
    /// send failed. Never panics and never propagates transport errors.
    pub async fn send(&self, id: &ConnectionId, event: &StreamEvent) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };

        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(connection_id = %id, error = %e, "Failed to encode event");
                return false;
            }
        };

        match self.write(&entry, text).await {
            Ok(()) => {
                let mut state = entry.state.lock();
                state.last_activity = Instant::now();
                state.consecutive_failures = 0;
                state.phase = ConnectionPhase::Connected;
                true
            }
            Err(TransportError::Closed) => {
                tracing::debug!(connection_id = %id, "Transport closed during send");
                self.close(id, CloseReason::TransportClosed).await;
                false
            }
            Err(TransportError::Io(message)) => {
                let failures = {
                    let mut state = entry.state.lock();
                    state.consecutive_failures += 1;
                    state.consecutive_failures
                };
                tracing::warn!(
                    connection_id = %id,
                    failures = failures,
                    budget = self.config.max_send_failures,
                    error = %message,
                    "Send failed"
                );
                if failures >= self.config.max_send_failures {
                    self.close(id, CloseReason::ErrorBudget).await;
                }
                false
            }
        }
    }

    /// Note inbound traffic on a connection
    pub fn record_activity(&self, id: &ConnectionId) -> bool {
        self.record_activity_at(id, Instant::now())
    }

    /// [`record_activity`](Self::record_activity) with an explicit clock
    pub fn record_activity_at(&self, id: &ConnectionId, now: Instant) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let mut state = entry.state.lock();
        if now > state.last_activity {
            state.last_activity = now;
        }
        state.phase = ConnectionPhase::Connected;
        true
    }

    /// Close a connection
    ///
    /// Returns `true` for the call that actually closed it; later calls are
    /// no-ops returning `false`.
    pub async fn close(&self, id: &ConnectionId, reason: CloseReason) -> bool {
        let Some((_, entry)) = self.connections.remove(id) else {
            return false;
        };

        if tokio::time::timeout(self.config.send_timeout(), entry.transport.close())
            .await
            .is_err()
        {
            tracing::warn!(connection_id = %id, reason = %reason, "Transport close timed out");
        }

        // Abort last: the caller may itself be one of these tasks
        let tasks: Vec<AbortHandle> = entry.tasks.lock().drain().map(|(_, h)| h).collect();
        let aborted = tasks.len();
        for task in tasks {
            task.abort();
        }

        tracing::info!(
            connection_id = %id,
            reason = %reason,
            aborted_requests = aborted,
            uptime_secs = entry.connected_at.elapsed().as_secs(),
            live = self.connections.len(),
            "Connection closed"
        );
        true
    }

    /// Run one liveness pass now
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    /// Run one liveness pass as of `now`
    ///
    /// Connections idle longer than the timeout are closed. Connections idle
    /// past the heartbeat threshold get a heartbeat unless one went out
    /// within the threshold. Heartbeats do not count as activity.
    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let timeout = self.config.connection_timeout();
        let threshold = self.config.heartbeat_threshold();
        let mut report = SweepReport::default();

        // Snapshot first so no shard lock is held while acting
        let snapshot: Vec<(ConnectionId, Arc<ConnectionEntry>)> = self
            .connections
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();

        let mut due = Vec::new();
        for (id, entry) in snapshot {
            let action = {
                let state = entry.state.lock();
                let idle = now.saturating_duration_since(state.last_activity);
                let heartbeat_due = state
                    .last_heartbeat
                    .map_or(true, |at| now.saturating_duration_since(at) > threshold);

                if idle > timeout {
                    Some(SweepAction::Close)
                } else if idle > threshold && heartbeat_due {
                    Some(SweepAction::Heartbeat)
                } else {
                    None
                }
            };

            if let Some(action) = action {
                due.push((id, entry, action));
            }
        }

        // Acted on concurrently so one slow peer cannot hold up the rest
        let outcomes = join_all(due.into_iter().map(|(id, entry, action)| async move {
            let done = match action {
                SweepAction::Close => {
                    tracing::info!(connection_id = %id, "Connection idle past timeout");
                    self.close(&id, CloseReason::Timeout).await
                }
                SweepAction::Heartbeat => self.heartbeat(&id, &entry, now).await,
            };
            (id, action, done)
        }))
        .await;

        for (id, action, done) in outcomes {
            match (action, done) {
                (SweepAction::Close, true) => report.timed_out.push(id),
                (SweepAction::Close, false) => {}
                (SweepAction::Heartbeat, true) => report.heartbeats_sent += 1,
                (SweepAction::Heartbeat, false) => report.heartbeat_failures.push(id),
            }
        }

        report
    }

    async fn heartbeat(&self, id: &ConnectionId, entry: &ConnectionEntry, now: Instant) -> bool {
        entry.state.lock().phase = ConnectionPhase::IdleWarned;

        let text = match StreamEvent::heartbeat().to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(connection_id = %id, error = %e, "Failed to encode heartbeat");
                return false;
            }
        };

        match self.write(entry, text).await {
            Ok(()) => {
                let mut state = entry.state.lock();
                state.last_heartbeat = Some(now);
                state.consecutive_failures = 0;
                tracing::trace!(connection_id = %id, "Heartbeat sent");
                true
            }
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "Heartbeat failed");
                self.close(id, CloseReason::HeartbeatFailed).await;
                false
            }
        }
    }

    /// Start the background sweep, running every half heartbeat interval
    ///
    /// The sweep stops when the returned handle is stopped or dropped.
    #[must_use = "dropping the handle stops the sweeper"]
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let supervisor = Arc::clone(self);
        let period = self.config.sweep_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let report = supervisor.sweep().await;
                if !report.is_empty() {
                    tracing::debug!(
                        timed_out = report.timed_out.len(),
                        heartbeats = report.heartbeats_sent,
                        heartbeat_failures = report.heartbeat_failures.len(),
                        live = supervisor.count(),
                        "Liveness sweep"
                    );
                }
            }
        });

        tracing::debug!(period_ms = period.as_millis() as u64, "Sweeper started");
        SweeperHandle { handle }
    }

    /// Run a request as a task owned by the connection
    ///
    /// `make` receives the new request id. The task is aborted if the
    /// connection closes first and forgets itself when it finishes. Returns
    /// `None` (without running anything) if the connection is not live.
    pub fn spawn_request<F, Fut>(&self, id: &ConnectionId, make: F) -> Option<RequestId>
    where
        F: FnOnce(RequestId) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let entry = self.entry(id)?;
        let request_id = RequestId::new();
        let future = make(request_id);
        let owner = Arc::downgrade(&entry);

        {
            let mut tasks = entry.tasks.lock();
            // Registered before the task can observe the map
            let handle = tokio::spawn(async move {
                future.await;
                if let Some(entry) = owner.upgrade() {
                    entry.tasks.lock().remove(&request_id);
                }
            });
            tasks.insert(request_id, handle.abort_handle());
        }

        // Lost a race with close(): nobody else will abort it
        if !self.connections.contains_key(id) {
            if let Some(handle) = entry.tasks.lock().remove(&request_id) {
                handle.abort();
            }
            return None;
        }

        tracing::debug!(connection_id = %id, request_id = %request_id, "Request task spawned");
        Some(request_id)
    }

    /// Close every connection
    pub async fn shutdown(&self) -> usize {
        let ids = self.connection_ids();
        let closed = join_all(ids.iter().map(|id| self.close(id, CloseReason::Shutdown)))
            .await
            .into_iter()
            .filter(|closed| *closed)
            .count();
        tracing::info!(closed = closed, "Supervisor shut down");
        closed
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Number of live connections
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Whether a connection is live
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Liveness phase of a live connection
    #[must_use]
    pub fn phase(&self, id: &ConnectionId) -> Option<ConnectionPhase> {
        self.entry(id).map(|e| e.state.lock().phase)
    }

    /// In-flight request tasks of a live connection
    #[must_use]
    pub fn in_flight(&self, id: &ConnectionId) -> usize {
        self.entry(id).map_or(0, |e| e.tasks.lock().len())
    }

    /// Peer address recorded on accept
    #[must_use]
    pub fn peer(&self, id: &ConnectionId) -> Option<SocketAddr> {
        self.entry(id).and_then(|e| e.peer)
    }

    /// Consecutive failed sends of a live connection
    #[must_use]
    pub fn consecutive_failures(&self, id: &ConnectionId) -> Option<u32> {
        self.entry(id).map(|e| e.state.lock().consecutive_failures)
    }

    /// IDs of all live connections
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| *e.key()).collect()
    }
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("config", &self.config)
            .field("live", &self.count())
            .finish()
    }
}

/// Handle to the background sweeper; stops it when dropped
#[derive(Debug)]
pub struct SweeperHandle {
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper
    pub fn stop(self) {
        self.handle.abort();
    }

    /// Whether the sweeper task has ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// =============================================================================
// Tests
// =============================================================================
