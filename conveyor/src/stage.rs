//! The stage abstraction.
//!
//! A [`Stage`] repeatedly takes the next queued element in arrival order,
//! applies its [`Processor`] transform, and broadcasts the output to every
//! registered consumer, until its input queue reports that no further
//! elements can arrive and everything already queued has been drained.
//!
//! A stage moves through three states: *active* (polling its queue with a
//! bounded wait), *draining* (queue closed, still holding elements), and
//! *finished* (closed and empty, terminal). On entering the finished state
//! the stage releases its grip on every consumer's queue, which cascades the
//! no-more-input signal downstream, and notifies its manager.

use crate::config::StageConfig;
use crate::errors::{panic_message, PipelineError};
use crate::manager::CompletionBoard;
use crate::queue::{InputQueue, StageInlet};
use crate::result::{ProcessTally, StageResult};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Unique identity of a stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageId(Uuid);

impl StageId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The per-element transform a concrete stage supplies.
///
/// `process_element` is invoked once per queued element, in arrival order,
/// never concurrently with itself. A failure for one element does not stop
/// the stage; it is recorded in the tally and the stage continues with the
/// next element.
#[async_trait]
pub trait Processor<In, Out>: Send {
    /// Transforms one input element into one output element.
    async fn process_element(&mut self, element: In) -> Result<Out, PipelineError>;

    /// Turns the accumulated tally into the stage's terminal result.
    ///
    /// Called exactly once, after the stage has drained. The default reports
    /// the tally as-is, or [`StageResult::Empty`] when nothing was seen.
    fn finish(&mut self, tally: ProcessTally) -> StageResult {
        if tally.is_empty() {
            StageResult::Empty
        } else {
            StageResult::Tally(tally)
        }
    }
}

/// A closure-backed processor for simple transforms.
pub struct FnProcessor<F> {
    func: F,
}

impl<F> FnProcessor<F> {
    /// Wraps a closure as a processor.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<In, Out, F> Processor<In, Out> for FnProcessor<F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: FnMut(In) -> Result<Out, PipelineError> + Send,
{
    async fn process_element(&mut self, element: In) -> Result<Out, PipelineError> {
        (self.func)(element)
    }
}

/// Shared state of a stage, visible through [`StageHandle`]s.
struct StageCore<In, Out> {
    name: Arc<str>,
    id: StageId,
    queue: Arc<InputQueue<In>>,
    consumers: Mutex<Vec<(StageId, StageInlet<Out>)>>,
    producers: Mutex<HashSet<StageId>>,
    running: AtomicBool,
    finished: Arc<AtomicBool>,
}

/// Registers a producer/consumer edge between two stages.
///
/// Set semantics: re-registering an existing edge is a no-op. Edges added
/// after the producer finished are ignored, since the producer can no longer
/// deliver anything or release the consumer.
fn wire<A, T, B>(up: &StageCore<A, T>, down: &StageCore<T, B>) {
    let mut consumers = up.consumers.lock();
    if up.finished.load(Ordering::Acquire) {
        warn!(
            producer = %up.name,
            consumer = %down.name,
            "producer already finished, edge ignored"
        );
        return;
    }
    if consumers.iter().any(|(id, _)| *id == down.id) {
        debug!(producer = %up.name, consumer = %down.name, "edge already registered");
        return;
    }
    consumers.push((down.id, StageInlet::new(Arc::clone(&down.queue))));
    drop(consumers);

    down.producers.lock().insert(up.id);
    debug!(producer = %up.name, consumer = %down.name, "edge registered");
}

/// A processing unit in the stage graph.
///
/// Generic over its input element type `In` and output element type `Out`,
/// so only type-compatible stages can be wired together. Each stage runs as
/// one independently scheduled task; [`Stage::run`] consumes the stage, so a
/// stage executes at most once per run.
pub struct Stage<In, Out> {
    core: Arc<StageCore<In, Out>>,
    config: StageConfig,
    processor: Box<dyn Processor<In, Out>>,
    completion: Option<Arc<CompletionBoard>>,
}

impl<In, Out> Stage<In, Out>
where
    In: Send + 'static,
    Out: Clone + Send + 'static,
{
    /// Creates a stage with the default configuration.
    pub fn new(name: impl Into<String>, processor: impl Processor<In, Out> + 'static) -> Self {
        Self::with_config(name, processor, StageConfig::default())
    }

    /// Creates a stage with an explicit configuration.
    pub fn with_config(
        name: impl Into<String>,
        processor: impl Processor<In, Out> + 'static,
        config: StageConfig,
    ) -> Self {
        let name: Arc<str> = name.into().into();
        let queue = Arc::new(InputQueue::new(
            Arc::clone(&name),
            config.capacity,
            config.overflow,
        ));
        Self {
            core: Arc::new(StageCore {
                name,
                id: StageId::new(),
                queue,
                consumers: Mutex::new(Vec::new()),
                producers: Mutex::new(HashSet::new()),
                running: AtomicBool::new(true),
                finished: Arc::new(AtomicBool::new(false)),
            }),
            config,
            processor: Box::new(processor),
            completion: None,
        }
    }

    /// Creates a stage from a plain transform closure.
    pub fn from_fn<F>(name: impl Into<String>, func: F) -> Self
    where
        F: FnMut(In) -> Result<Out, PipelineError> + Send + 'static,
    {
        Self::new(name, FnProcessor::new(func))
    }

    /// The stage's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The stage's identity.
    #[must_use]
    pub fn id(&self) -> StageId {
        self.core.id
    }

    /// Returns a cloneable handle for observing and wiring this stage.
    #[must_use]
    pub fn handle(&self) -> StageHandle<In, Out> {
        StageHandle {
            core: Arc::clone(&self.core),
        }
    }

    /// Returns a feed handle into this stage's input queue.
    ///
    /// Take every inlet before the stage is dispatched: a stage whose queue
    /// has no open feeders at all considers its input closed and finishes
    /// immediately.
    #[must_use]
    pub fn inlet(&self) -> StageInlet<In> {
        StageInlet::new(Arc::clone(&self.core.queue))
    }

    /// Registers `consumer` as a downstream recipient of this stage's output.
    pub fn add_consumer<Next>(&self, consumer: &Stage<Out, Next>) {
        wire(&self.core, &consumer.core);
    }

    /// Registers `producer` as an upstream source feeding this stage.
    pub fn add_producer<Prev>(&self, producer: &Stage<Prev, In>) {
        wire(&producer.core, &self.core);
    }

    /// True once the stage has drained and produced its result.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.core.finished.load(Ordering::Acquire)
    }

    pub(crate) fn bind_completion(&mut self, board: Arc<CompletionBoard>) {
        self.completion = Some(board);
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.core.name)
    }

    pub(crate) fn finished_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.core.finished)
    }

    /// Drives the stage to completion and returns its terminal result.
    ///
    /// This is the unit of concurrent scheduling: the manager dispatches one
    /// task per stage running this future. Element-level failures are caught
    /// and tallied; a panic escaping the loop itself yields a
    /// [`StageResult::Fatal`], and in either case the stage still closes its
    /// queue, releases its consumers, and notifies its manager, so the run
    /// never hangs on a broken stage.
    pub async fn run(mut self) -> StageResult {
        debug!(stage = %self.core.name, id = %self.core.id, "stage started");
        let mut tally = ProcessTally::default();

        let loop_outcome = {
            let run = Self::run_loop(
                &self.core,
                &self.config,
                self.processor.as_mut(),
                &mut tally,
            );
            AssertUnwindSafe(run).catch_unwind().await
        };

        let result = match loop_outcome {
            Ok(()) => self.processor.finish(tally),
            Err(payload) => {
                let message = panic_message(payload);
                error!(stage = %self.core.name, error = %message, "stage failed");
                StageResult::fatal(message)
            }
        };

        self.core.queue.close();
        self.core.running.store(false, Ordering::Release);
        self.core.finished.store(true, Ordering::Release);
        self.core.consumers.lock().clear();

        debug!(
            stage = %self.core.name,
            processed = result.processed(),
            failed = result.failed(),
            "stage finished"
        );
        if let Some(board) = &self.completion {
            board.stage_finished();
        }
        result
    }

    async fn run_loop(
        core: &StageCore<In, Out>,
        config: &StageConfig,
        processor: &mut dyn Processor<In, Out>,
        tally: &mut ProcessTally,
    ) {
        let mut index: u64 = 0;
        loop {
            // Snapshot before popping: if the queue was already closed when
            // we look and the pop comes up empty, nothing can arrive anymore.
            let closing = core.queue.is_closed();
            if closing {
                core.running.store(false, Ordering::Release);
            }

            if let Some(element) = core.queue.pop() {
                match processor.process_element(element).await {
                    Ok(output) => {
                        tally.record_success();
                        Self::distribute(core, output).await;
                    }
                    Err(error) => {
                        warn!(
                            stage = %core.name,
                            index,
                            %error,
                            "element processing failed"
                        );
                        tally.record_failure(index, error.to_string());
                    }
                }
                index += 1;
            } else if closing {
                break;
            } else {
                let _ = tokio::time::timeout(config.poll_interval, core.queue.wait_readable()).await;
            }
        }
    }

    /// Broadcasts one output element to every registered consumer.
    ///
    /// The consumer list is snapshotted first, so distribution never races
    /// with concurrent edge registration. The value is cloned once per extra
    /// consumer; the last send moves it.
    async fn distribute(core: &StageCore<In, Out>, output: Out) {
        let mut targets: Vec<StageInlet<Out>> = core
            .consumers
            .lock()
            .iter()
            .map(|(_, inlet)| inlet.clone())
            .collect();

        let Some(last) = targets.pop() else {
            return;
        };
        for inlet in &targets {
            if let Err(error) = inlet.send(output.clone()).await {
                warn!(stage = %core.name, consumer = inlet.stage(), %error, "distribution failed");
            }
        }
        if let Err(error) = last.send(output).await {
            warn!(stage = %core.name, consumer = last.stage(), %error, "distribution failed");
        }
    }
}

impl<In, Out> fmt::Debug for Stage<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.core.name)
            .field("id", &self.core.id)
            .field("finished", &self.core.finished.load(Ordering::Acquire))
            .finish()
    }
}

/// A cloneable, non-owning view of a stage.
///
/// Handles outlive the stage's move into its run task and expose completion
/// state, feeding, and best-effort mid-run wiring.
pub struct StageHandle<In, Out> {
    core: Arc<StageCore<In, Out>>,
}

impl<In, Out> StageHandle<In, Out> {
    /// The stage's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The stage's identity.
    #[must_use]
    pub fn id(&self) -> StageId {
        self.core.id
    }

    /// True once the stage has drained and produced its result. Lock-free;
    /// stays true forever after the transition.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.core.finished.load(Ordering::Acquire)
    }

    /// True while the stage is still accepting the possibility of new input.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Returns a feed handle into the stage's input queue.
    #[must_use]
    pub fn inlet(&self) -> StageInlet<In> {
        StageInlet::new(Arc::clone(&self.core.queue))
    }

    /// Registers a consumer edge mid-run.
    ///
    /// Best-effort: elements distributed before registration are not
    /// replayed, and the edge is ignored if this stage already finished.
    pub fn add_consumer<Next>(&self, consumer: &StageHandle<Out, Next>) {
        wire(&self.core, &consumer.core);
    }

    /// Registers a producer edge mid-run. Best-effort, like
    /// [`add_consumer`](Self::add_consumer).
    pub fn add_producer<Prev>(&self, producer: &StageHandle<Prev, In>) {
        wire(&producer.core, &self.core);
    }

    /// Number of elements currently queued.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.core.queue.len()
    }

    /// Number of inputs discarded so far (overflow drops and input after
    /// close).
    #[must_use]
    pub fn dropped_inputs(&self) -> u64 {
        self.core.queue.dropped()
    }

    /// Number of registered upstream producers.
    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.core.producers.lock().len()
    }

    /// Number of registered downstream consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.core.consumers.lock().len()
    }
}

impl<In, Out> Clone for StageHandle<In, Out> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<In, Out> fmt::Debug for StageHandle<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageHandle")
            .field("name", &self.core.name)
            .field("id", &self.core.id)
            .field("finished", &self.core.finished.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_stage_finishes_with_empty_result() {
        let stage: Stage<i32, i32> = Stage::from_fn("noop", Ok);
        let feed = stage.inlet();
        let handle = stage.handle();
        feed.close();

        let result = stage.run().await;
        assert_eq!(result, StageResult::Empty);
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_duplicate_edge_is_noop() {
        let a: Stage<i32, i32> = Stage::from_fn("a", Ok);
        let b: Stage<i32, i32> = Stage::from_fn("b", Ok);

        a.add_consumer(&b);
        a.add_consumer(&b);
        b.add_producer(&a);

        assert_eq!(a.handle().consumer_count(), 1);
        assert_eq!(b.handle().producer_count(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_tallied_with_arrival_index() {
        let stage: Stage<i32, i32> = Stage::from_fn("picky", |n: i32| {
            if n % 2 == 0 {
                Ok(n)
            } else {
                Err(PipelineError::process(format!("odd input {n}")))
            }
        });
        let feed = stage.inlet();
        let task = tokio::spawn(stage.run());

        for n in [2, 5, 4] {
            feed.send(n).await.unwrap();
        }
        feed.close();

        let result = task.await.unwrap();
        match result {
            StageResult::Tally(tally) => {
                assert_eq!(tally.processed, 2);
                assert_eq!(tally.failed, 1);
                assert_eq!(tally.failures[0].index, 1);
            }
            other => panic!("expected tally, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_custom_finish_result() {
        struct Summarizer {
            seen: Vec<i32>,
        }

        #[async_trait]
        impl Processor<i32, i32> for Summarizer {
            async fn process_element(&mut self, element: i32) -> Result<i32, PipelineError> {
                self.seen.push(element);
                Ok(element)
            }

            fn finish(&mut self, _tally: ProcessTally) -> StageResult {
                StageResult::report("seen", serde_json::json!(self.seen))
            }
        }

        let stage = Stage::new("summarize", Summarizer { seen: Vec::new() });
        let feed = stage.inlet();
        let task = tokio::spawn(stage.run());

        feed.send(1).await.unwrap();
        feed.send(2).await.unwrap();
        feed.close();

        let result = task.await.unwrap();
        assert_eq!(
            result,
            StageResult::report("seen", serde_json::json!([1, 2]))
        );
    }

    #[tokio::test]
    async fn test_wiring_after_finish_is_ignored() {
        let a: Stage<i32, i32> = Stage::from_fn("a", Ok);
        let a_handle = a.handle();
        let b: Stage<i32, i32> = Stage::from_fn("b", Ok);

        a.inlet().close();
        let _ = a.run().await;

        a_handle.add_consumer(&b.handle());
        assert_eq!(a_handle.consumer_count(), 0);
    }
}
