//! Run event system for observability.
//!
//! Emits [`RunEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, a polling UI bridge, tests) can follow run
//! progress without coupling to the executor internals.

use serde::{Deserialize, Serialize};

use cairn_types::RunState;

/// Events emitted while a run executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    RunSubmitted {
        workspace_id: String,
        run_id: String,
        node_count: usize,
        invalidated: Vec<String>,
    },
    NodeStarted {
        run_id: String,
        node_id: String,
    },
    NodeCached {
        run_id: String,
        node_id: String,
    },
    NodeSucceeded {
        run_id: String,
        node_id: String,
        duration_ms: u64,
    },
    NodeFailed {
        run_id: String,
        node_id: String,
        error: String,
    },
    RunCancelled {
        run_id: String,
    },
    RunFinished {
        run_id: String,
        state: RunState,
        duration_ms: u64,
    },
}

/// Fan-out of [`RunEvent`]s to any number of observers.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    /// `capacity` bounds how far a slow observer may lag before it misses events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _initial_rx) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish `event`. Never blocks; with no observers the event is discarded.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
