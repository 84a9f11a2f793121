//! Lifecycle events emitted by the function registries.
//!
//! Every event is logged through `tracing` at a level matching its severity and
//! published on a broadcast channel so embedders can follow reloads.

use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// What happened to a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BuildError,
    Extracted,
    Loaded,
    Reloaded,
    Reloading,
    Removed,
}

/// A registry lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Function the event is about, if any.
    pub subject: Option<String>,
    /// Error or detail message.
    pub message: Option<String>,
    /// Advisory warnings attached to a load.
    pub warnings: Vec<String>,
}

impl LifecycleEvent {
    /// Create an event of the given kind.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            subject: None,
            message: None,
            warnings: Vec::new(),
        }
    }

    /// Set the function the event is about.
    pub fn subject(mut self, name: impl Into<String>) -> Self {
        self.subject = Some(name.into());
        self
    }

    /// Attach a message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach warnings.
    pub fn warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    fn log(&self, scope: &str) {
        let subject = self
            .subject
            .as_deref()
            .map(|s| format!("{} {}", scope, s))
            .unwrap_or_else(|| format!("{}s", scope));
        let detail = self.message.as_deref().unwrap_or_default();

        match self.kind {
            EventKind::BuildError => error!("Failed to load {}: {}", subject, detail),
            EventKind::Extracted => info!("Extracted {} from archive", subject),
            EventKind::Loaded => info!("Loaded {}", subject),
            EventKind::Reloaded => info!("Reloaded {}", subject),
            EventKind::Reloading => info!("Reloading {}...", subject),
            EventKind::Removed => info!("Removed {}", subject),
        }

        for warning in &self.warnings {
            warn!("{}: {}", subject, warning);
        }
    }
}

/// Broadcast channel of lifecycle events for one registry.
#[derive(Debug, Clone)]
pub struct EventBus {
    scope: &'static str,
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    /// Create a bus; `scope` prefixes log lines ("function", "edge function").
    pub fn new(scope: &'static str) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { scope, sender }
    }

    /// Log and publish an event.
    pub fn emit(&self, event: LifecycleEvent) {
        event.log(self.scope);
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}
