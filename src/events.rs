//! Typed publish/subscribe channel for model and retrieve notifications.

use tokio::sync::broadcast;

use crate::scheduler::{Progress, TaskId};
use crate::task::TaskState;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    SeriesAdded {
        study_uid: String,
        series_uid: String,
    },
    StudyRemoved {
        study_uid: String,
    },
    PatientRemoved {
        patient_key: String,
    },
    ProgressUpdated {
        task: TaskId,
        progress: Progress,
    },
    RetrieveCompleted {
        task_id: String,
        state: TaskState,
    },
}

/// Cloneable handle on a broadcast channel.
///
/// Publishing never blocks. Slow subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ModelEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ModelEvent) {
        // No receiver is not an error
        if self.sender.send(event).is_err() {
            tracing::trace!("event dropped, no subscriber");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
