use eventsense_common::{ErrorKind, Run, RunId, RunStatus, StepStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Notification published after every committed run store update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RunEvent {
    RunCreated {
        run_id: RunId,
        ticker: String,
    },
    RunStarted {
        run_id: RunId,
    },
    StepStarted {
        run_id: RunId,
        step: u32,
        label: String,
    },
    StepFinished {
        run_id: RunId,
        step: u32,
        status: StepStatus,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        error_kind: Option<ErrorKind>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunCreated { run_id, .. }
            | Self::RunStarted { run_id }
            | Self::StepStarted { run_id, .. }
            | Self::StepFinished { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }

    /// Derive the events implied by moving from `before` to `after`.
    pub fn diff(before: Option<&Run>, after: &Run) -> Vec<RunEvent> {
        let run_id = after.run_id.clone();
        let Some(before) = before else {
            return vec![RunEvent::RunCreated {
                run_id,
                ticker: after.params.ticker.clone(),
            }];
        };

        let mut events = Vec::new();
        if before.status == RunStatus::Queued && after.status == RunStatus::Running {
            events.push(RunEvent::RunStarted {
                run_id: run_id.clone(),
            });
        }
        for (old, new) in before.steps.iter().zip(&after.steps) {
            if old.status == new.status {
                continue;
            }
            if new.status == StepStatus::Running {
                events.push(RunEvent::StepStarted {
                    run_id: run_id.clone(),
                    step: new.id,
                    label: new.label.clone(),
                });
            } else if new.status.is_settled() {
                events.push(RunEvent::StepFinished {
                    run_id: run_id.clone(),
                    step: new.id,
                    status: new.status,
                });
            }
        }
        if !before.is_terminal() && after.is_terminal() {
            events.push(RunEvent::RunFinished {
                run_id,
                status: after.status,
                error_kind: after.error.as_ref().map(|e| e.kind),
            });
        }
        events
    }
}

/// Publish events to all subscribers. Returns silently with no receivers.
pub fn publish(tx: &broadcast::Sender<RunEvent>, events: Vec<RunEvent>) {
    for event in events {
        let _ = tx.send(event);
    }
}
