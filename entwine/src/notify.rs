//! Post-commit notifications for cache invalidation.
//!
//! Notifiers run after the transaction has committed and must not fail the call.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Emitted once per committed root record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphCommitted {
    pub kind: String,
    pub id: String,
    /// Number of records created or updated by the commit.
    pub records: usize,
    pub committed_at: DateTime<Utc>,
}

pub trait CommitNotifier {
    fn graph_committed(&self, event: GraphCommitted);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl CommitNotifier for NoopNotifier {
    fn graph_committed(&self, _event: GraphCommitted) {}
}

/// Writes each event to the log at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl CommitNotifier for LogNotifier {
    fn graph_committed(&self, event: GraphCommitted) {
        log::info!(
            "graph committed: {}/{} ({} records) at {}",
            event.kind,
            event.id,
            event.records,
            event.committed_at.to_rfc3339()
        );
    }
}

/// Forwards events to an unbounded channel consumed by an invalidation task.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: UnboundedSender<GraphCommitted>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, UnboundedReceiver<GraphCommitted>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl CommitNotifier for ChannelNotifier {
    fn graph_committed(&self, event: GraphCommitted) {
        if let Err(err) = self.sender.send(event) {
            log::warn!("dropping graph committed event for {}/{}: receiver closed", err.0.kind, err.0.id);
        }
    }
}
