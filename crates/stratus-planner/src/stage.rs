//! Event log for named stages and their tasks.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info};

use crate::error::PlanResult;

pub trait EventLog: Send + Sync {
    fn stage_started(&self, stage: &str, total_tasks: usize);
    fn task_started(&self, stage: &str, task: &str);
    fn task_finished(&self, stage: &str, task: &str, elapsed_ms: u64);
    fn task_failed(&self, stage: &str, task: &str, error: &str);
}

/// Emits stage events through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingEventLog;

impl EventLog for TracingEventLog {
    fn stage_started(&self, stage: &str, total_tasks: usize) {
        info!(%stage, total_tasks, "stage started");
    }

    fn task_started(&self, stage: &str, task: &str) {
        info!(%stage, %task, "task started");
    }

    fn task_finished(&self, stage: &str, task: &str, elapsed_ms: u64) {
        info!(%stage, %task, elapsed_ms, "task finished");
    }

    fn task_failed(&self, stage: &str, task: &str, error: &str) {
        error!(%stage, %task, %error, "task failed");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StageEvent {
    StageStarted { stage: String, total_tasks: usize },
    TaskStarted { stage: String, task: String },
    TaskFinished { stage: String, task: String },
    TaskFailed { stage: String, task: String, error: String },
}

/// Keeps every event in memory, in order.
#[derive(Debug, Default)]
pub struct RecordingEventLog {
    events: Mutex<Vec<StageEvent>>,
}

impl RecordingEventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<StageEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn push(&self, event: StageEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl EventLog for RecordingEventLog {
    fn stage_started(&self, stage: &str, total_tasks: usize) {
        self.push(StageEvent::StageStarted {
            stage: stage.to_string(),
            total_tasks,
        });
    }

    fn task_started(&self, stage: &str, task: &str) {
        self.push(StageEvent::TaskStarted {
            stage: stage.to_string(),
            task: task.to_string(),
        });
    }

    fn task_finished(&self, stage: &str, task: &str, _elapsed_ms: u64) {
        self.push(StageEvent::TaskFinished {
            stage: stage.to_string(),
            task: task.to_string(),
        });
    }

    fn task_failed(&self, stage: &str, task: &str, error: &str) {
        self.push(StageEvent::TaskFailed {
            stage: stage.to_string(),
            task: task.to_string(),
            error: error.to_string(),
        });
    }
}

/// Run `work` as task `task` of `stage`, reporting start and outcome.
pub async fn track<T, F>(log: &dyn EventLog, stage: &str, task: &str, work: F) -> PlanResult<T>
where
    F: Future<Output = PlanResult<T>>,
{
    log.task_started(stage, task);
    let started = Instant::now();
    let result = work.await;
    match &result {
        Ok(_) => log.task_finished(stage, task, started.elapsed().as_millis() as u64),
        Err(e) => log.task_failed(stage, task, &e.to_string()),
    }
    result
}
