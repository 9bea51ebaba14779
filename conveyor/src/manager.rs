//! The stage manager.
//!
//! Owns the full set of stages for a run, dispatches each stage's run loop
//! as an independent task, and waits for the whole graph to drain. The
//! manager executes no stage logic itself; it only observes completion.

use crate::config::ManagerConfig;
use crate::errors::panic_message;
use crate::result::StageResult;
use crate::stage::{Stage, StageHandle, StageId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error};

/// The wake handshake between stages and their manager.
///
/// A finishing stage notifies the board; the waiting manager wakes and
/// re-checks whether every registered stage reports finished. Waits are
/// bounded by the manager's re-check interval, so a missed notification can
/// delay completion detection but never lose it.
pub(crate) struct CompletionBoard {
    notify: Notify,
}

impl CompletionBoard {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
        }
    }

    pub(crate) fn stage_finished(&self) {
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Type-erased handle on a registered stage's run future.
trait StageTask: Send {
    fn into_future(self: Box<Self>) -> BoxFuture<'static, StageResult>;
}

impl<In, Out> StageTask for Stage<In, Out>
where
    In: Send + 'static,
    Out: Clone + Send + 'static,
{
    fn into_future(self: Box<Self>) -> BoxFuture<'static, StageResult> {
        (*self).run().boxed()
    }
}

struct Registered {
    name: Arc<str>,
    id: StageId,
    finished: Arc<AtomicBool>,
    task: Box<dyn StageTask>,
}

/// The outcome of one stage within a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    /// The stage's name.
    pub stage: String,
    /// The stage's identity.
    pub id: StageId,
    /// The stage's terminal result.
    pub result: StageResult,
}

/// The harvested outcome of a whole pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    /// When dispatch began.
    pub started_at: DateTime<Utc>,
    /// When the last stage finished.
    pub ended_at: DateTime<Utc>,
    /// Per-stage outcomes, in registration order.
    pub stages: Vec<StageOutcome>,
}

impl RunOutcome {
    /// Wall-clock duration of the run in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> f64 {
        (self.ended_at - self.started_at).num_milliseconds() as f64
    }

    /// True if no stage ended fatally.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.stages.iter().all(|s| s.result.is_success())
    }

    /// The result of the named stage, if it was registered.
    #[must_use]
    pub fn result_of(&self, stage: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage).map(|s| &s.result)
    }

    /// All stage results merged into one.
    #[must_use]
    pub fn combined(&self) -> StageResult {
        self.stages
            .iter()
            .fold(StageResult::Empty, |acc, s| acc.merge(s.result.clone()))
    }

    /// Total successfully processed elements across all stages.
    #[must_use]
    pub fn processed_total(&self) -> u64 {
        self.stages.iter().map(|s| s.result.processed()).sum()
    }
}

/// Coordinates the stages of one pipeline run.
///
/// Stages are registered before dispatch; [`StageManager::run`] spawns one
/// task per stage and returns once every stage reports finished and every
/// queue has drained. Stages may finish in any order; a stage that panics is
/// reported as finished-with-error rather than stalling the run.
pub struct StageManager {
    config: ManagerConfig,
    board: Arc<CompletionBoard>,
    stages: Vec<Registered>,
}

impl StageManager {
    /// Creates a manager with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    /// Creates a manager with an explicit configuration.
    #[must_use]
    pub fn with_config(config: ManagerConfig) -> Self {
        Self {
            config,
            board: Arc::new(CompletionBoard::new()),
            stages: Vec::new(),
        }
    }

    /// Registers a stage for this run, taking ownership of it.
    ///
    /// The returned handle remains valid for observing and feeding the stage
    /// after dispatch.
    pub fn register<In, Out>(&mut self, mut stage: Stage<In, Out>) -> StageHandle<In, Out>
    where
        In: Send + 'static,
        Out: Clone + Send + 'static,
    {
        stage.bind_completion(Arc::clone(&self.board));
        let handle = stage.handle();
        debug!(stage = %stage.name(), id = %stage.id(), "stage registered");
        self.stages.push(Registered {
            name: stage.name_arc(),
            id: stage.id(),
            finished: stage.finished_flag(),
            task: Box::new(stage),
        });
        handle
    }

    /// Number of registered stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// True if every registered stage reports finished.
    #[must_use]
    pub fn all_finished(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.finished.load(Ordering::Acquire))
    }

    /// Dispatches every registered stage and waits for the run to drain.
    ///
    /// Returns only once every stage reports `finished`. A stage whose task
    /// panics is harvested as [`StageResult::Fatal`]; its siblings keep
    /// running to their own completion.
    pub async fn run(self) -> RunOutcome {
        let Self {
            config,
            board,
            stages,
        } = self;
        let started_at = Utc::now();
        debug!(stages = stages.len(), "dispatching pipeline");

        let mut flags = Vec::with_capacity(stages.len());
        let mut handles = Vec::with_capacity(stages.len());
        for entry in stages {
            let Registered {
                name,
                id,
                finished,
                task,
            } = entry;
            flags.push(Arc::clone(&finished));

            let stage_board = Arc::clone(&board);
            let stage_name = Arc::clone(&name);
            let future = task.into_future();
            let handle = tokio::spawn(async move {
                let outcome = AssertUnwindSafe(future).catch_unwind().await;
                // The stage's own run loop normally flips this; doing it here
                // again covers a panicking stage so the wait below cannot hang.
                finished.store(true, Ordering::Release);
                stage_board.stage_finished();
                match outcome {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = panic_message(payload);
                        error!(stage = %stage_name, error = %message, "stage task panicked");
                        StageResult::fatal(message)
                    }
                }
            });
            handles.push((name, id, handle));
        }

        loop {
            if flags.iter().all(|f| f.load(Ordering::Acquire)) {
                break;
            }
            let _ = tokio::time::timeout(config.recheck_interval, board.wait()).await;
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!(stage = %name, error = %join_error, "stage task aborted");
                    StageResult::fatal(format!("stage task aborted: {join_error}"))
                }
            };
            outcomes.push(StageOutcome {
                stage: name.to_string(),
                id,
                result,
            });
        }

        let outcome = RunOutcome {
            started_at,
            ended_at: Utc::now(),
            stages: outcomes,
        };
        debug!(
            duration_ms = outcome.duration_ms(),
            success = outcome.is_success(),
            "pipeline finished"
        );
        outcome
    }
}

impl Default for StageManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_run_completes_immediately() {
        let manager = StageManager::new();
        let outcome = manager.run().await;
        assert!(outcome.is_success());
        assert!(outcome.stages.is_empty());
        assert_eq!(outcome.processed_total(), 0);
    }

    #[tokio::test]
    async fn test_single_stage_run() {
        let stage: Stage<i32, i32> = Stage::from_fn("double", |n: i32| Ok(n * 2));
        let feed = stage.inlet();

        let mut manager = StageManager::new();
        let handle = manager.register(stage);
        assert_eq!(manager.stage_count(), 1);
        assert!(!manager.all_finished());

        let run = tokio::spawn(manager.run());
        for n in [1, 2, 3] {
            feed.send(n).await.unwrap();
        }
        feed.close();

        let outcome = run.await.unwrap();
        assert!(outcome.is_success());
        assert!(handle.is_finished());
        assert_eq!(outcome.processed_total(), 3);
        assert_eq!(
            outcome.result_of("double").map(StageResult::processed),
            Some(3)
        );
    }

    #[tokio::test]
    async fn test_outcome_serializes() {
        let manager = StageManager::new();
        let outcome = manager.run().await;
        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json.get("stages").is_some());
    }
}
