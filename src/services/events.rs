//! Sync lifecycle events
//!
//! The orchestrator reports through an [EventSink]. Emission is fire-and-forget: a
//! sink must never block the sync loop.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;

/// Progress and terminal notifications for a library sync
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    Started { integration_id: String },
    #[serde(rename_all = "camelCase")]
    Progress {
        integration_id: String,
        indexed: u64,
        total: u64,
        section: String,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        integration_id: String,
        indexed: u64,
        total: u64,
        error_message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Cancelled {
        integration_id: String,
        indexed: u64,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        integration_id: String,
        error: String,
    },
}

impl SyncEvent {
    /// Broadcast event name, e.g. `library_sync:progress`
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Started { .. } => "library_sync:started",
            SyncEvent::Progress { .. } => "library_sync:progress",
            SyncEvent::Completed { .. } => "library_sync:completed",
            SyncEvent::Cancelled { .. } => "library_sync:cancelled",
            SyncEvent::Failed { .. } => "library_sync:failed",
        }
    }

    pub fn integration_id(&self) -> &str {
        match self {
            SyncEvent::Started { integration_id }
            | SyncEvent::Progress { integration_id, .. }
            | SyncEvent::Completed { integration_id, .. }
            | SyncEvent::Cancelled { integration_id, .. }
            | SyncEvent::Failed { integration_id, .. } => integration_id,
        }
    }
}

/// Receives sync events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// Sink backed by a tokio broadcast channel. Events sent with no subscriber are dropped.
#[derive(Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<SyncEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: SyncEvent) {
        // lagging or absent receivers are not our problem
        let _ = self.sender.send(event);
    }
}

/// Time-based limiter for progress events. The first check always passes.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True when enough time has passed since the last accepted emission
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
