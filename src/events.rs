use tokio::sync::broadcast;

use crate::model::{Build, BuildStatus, ProjectId};

const DEFAULT_CAPACITY: usize = 1024;

/// Build lifecycle notifications.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    Submitted(Build),
    Pending(Build),
    Running(Build),
    Retrying(Build),
    Finished(Build),
    Updated(Build),
    ScheduleFired { project_id: ProjectId, job_name: String },
}

impl BuildEvent {
    pub fn build(&self) -> Option<&Build> {
        match self {
            BuildEvent::Submitted(b)
            | BuildEvent::Pending(b)
            | BuildEvent::Running(b)
            | BuildEvent::Retrying(b)
            | BuildEvent::Finished(b)
            | BuildEvent::Updated(b) => Some(b),
            BuildEvent::ScheduleFired { .. } => None,
        }
    }

    pub fn finished_status(&self) -> Option<BuildStatus> {
        match self {
            BuildEvent::Finished(b) => Some(b.status),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuildEvent::Submitted(_) => "submitted",
            BuildEvent::Pending(_) => "pending",
            BuildEvent::Running(_) => "running",
            BuildEvent::Retrying(_) => "retrying",
            BuildEvent::Finished(_) => "finished",
            BuildEvent::Updated(_) => "updated",
            BuildEvent::ScheduleFired { .. } => "schedule_fired",
        }
    }
}

/// Broadcast bus for [`BuildEvent`]s. Slow subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BuildEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: BuildEvent) {
        tracing::trace!(event = event.name(), "Publishing build event");
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.tx.subscribe()
    }
}
