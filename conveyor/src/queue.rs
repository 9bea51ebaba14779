//! Per-stage input queues.
//!
//! Each stage owns one multi-producer/single-consumer queue. Producers are
//! upstream stages and external feeders, each holding a [`StageInlet`]; only
//! the stage's own task dequeues. The queue closes once every inlet has been
//! dropped or [`StageInlet::shutdown`] force-closed it, which is the signal
//! that no further input will arrive.

use crate::errors::PipelineError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

/// What a bounded queue does with new input once it is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Suspend the sender until space is available.
    #[default]
    Block,
    /// Discard the incoming element and count it as dropped.
    DropNewest,
    /// Fail the send with [`PipelineError::QueueFull`].
    Reject,
}

/// The input queue backing a stage.
///
/// FIFO per sender; elements are never reordered, lost, or duplicated once
/// accepted. Input arriving after the queue has closed is discarded and
/// counted, never re-queued for a later run.
pub(crate) struct InputQueue<T> {
    stage: Arc<str>,
    items: Mutex<VecDeque<T>>,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
    readable: Notify,
    writable: Notify,
    feeders: AtomicUsize,
    force_closed: AtomicBool,
    dropped: AtomicU64,
}

impl<T> InputQueue<T> {
    pub(crate) fn new(stage: Arc<str>, capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        Self {
            stage,
            items: Mutex::new(VecDeque::new()),
            capacity,
            overflow,
            readable: Notify::new(),
            writable: Notify::new(),
            feeders: AtomicUsize::new(0),
            force_closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// True once no further input can arrive: every feeder handle is gone or
    /// the queue was force-closed.
    pub(crate) fn is_closed(&self) -> bool {
        self.force_closed.load(Ordering::Acquire) || self.feeders.load(Ordering::Acquire) == 0
    }

    /// Appends an element at the tail, honoring the overflow policy.
    pub(crate) async fn push(&self, element: T) -> Result<(), PipelineError> {
        loop {
            if self.is_closed() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(stage = %self.stage, "input after close discarded");
                return Ok(());
            }

            {
                let mut items = self.items.lock();
                let full = self.capacity.is_some_and(|cap| items.len() >= cap);
                if !full {
                    items.push_back(element);
                    drop(items);
                    self.readable.notify_one();
                    return Ok(());
                }
            }

            match self.overflow {
                OverflowPolicy::Block => self.writable.notified().await,
                OverflowPolicy::DropNewest => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(stage = %self.stage, "input queue full, element dropped");
                    return Ok(());
                }
                OverflowPolicy::Reject => {
                    return Err(PipelineError::QueueFull {
                        stage: self.stage.to_string(),
                    });
                }
            }
        }
    }

    /// Removes the element at the head, if any.
    pub(crate) fn pop(&self) -> Option<T> {
        let element = self.items.lock().pop_front();
        if element.is_some() && self.capacity.is_some() {
            self.writable.notify_one();
        }
        element
    }

    /// Suspends until a producer signals new input or the queue closes.
    pub(crate) async fn wait_readable(&self) {
        self.readable.notified().await;
    }

    /// Force-closes the queue regardless of open feeders.
    pub(crate) fn close(&self) {
        self.force_closed.store(true, Ordering::Release);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub(crate) fn feeder_added(&self) {
        self.feeders.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn feeder_dropped(&self) {
        if self.feeders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.readable.notify_waiters();
            self.writable.notify_waiters();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A cloneable feed handle into a stage's input queue.
///
/// Each live inlet counts as one open producer. Dropping or [`close`]-ing the
/// last inlet tells the stage that no further input will arrive, after which
/// it drains its queue and finishes.
///
/// [`close`]: StageInlet::close
pub struct StageInlet<T> {
    queue: Arc<InputQueue<T>>,
}

impl<T> StageInlet<T> {
    pub(crate) fn new(queue: Arc<InputQueue<T>>) -> Self {
        queue.feeder_added();
        Self { queue }
    }

    /// Appends `element` to the tail of the stage's input queue.
    ///
    /// With the default unbounded queue this never suspends and never fails.
    /// Under a bounded queue the configured [`OverflowPolicy`] decides
    /// whether the sender waits, the element is dropped, or an error is
    /// returned. Input sent after the stage finished is discarded with a
    /// warning and counted.
    pub async fn send(&self, element: T) -> Result<(), PipelineError> {
        self.queue.push(element).await
    }

    /// Announces that this feeder will send no further input.
    ///
    /// Equivalent to dropping the inlet; spelled out for call sites where the
    /// intent should be visible.
    pub fn close(self) {
        drop(self);
    }

    /// Force-closes the stage's input queue, ignoring other open feeders.
    ///
    /// The stage stops waiting for new input, drains what is already queued,
    /// and finishes.
    pub fn shutdown(&self) {
        self.queue.close();
    }

    /// The name of the stage this inlet feeds.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.queue.stage
    }
}

impl<T> Clone for StageInlet<T> {
    fn clone(&self) -> Self {
        self.queue.feeder_added();
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T> Drop for StageInlet<T> {
    fn drop(&mut self) {
        self.queue.feeder_dropped();
    }
}

impl<T> fmt::Debug for StageInlet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageInlet")
            .field("stage", &self.queue.stage)
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: Option<usize>, overflow: OverflowPolicy) -> Arc<InputQueue<i32>> {
        Arc::new(InputQueue::new("test".into(), capacity, overflow))
    }

    #[test]
    fn test_fifo_order() {
        let q = queue(None, OverflowPolicy::Block);
        let inlet = StageInlet::new(Arc::clone(&q));

        tokio_test::block_on(async {
            for n in 1..=3 {
                inlet.send(n).await.unwrap();
            }
        });

        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_closes_when_last_inlet_drops() {
        let q = queue(None, OverflowPolicy::Block);
        assert!(q.is_closed());

        let first = StageInlet::new(Arc::clone(&q));
        let second = first.clone();
        assert!(!q.is_closed());

        drop(first);
        assert!(!q.is_closed());
        second.close();
        assert!(q.is_closed());
    }

    #[test]
    fn test_input_after_close_discarded() {
        let q = queue(None, OverflowPolicy::Block);
        let inlet = StageInlet::new(Arc::clone(&q));
        inlet.shutdown();

        tokio_test::block_on(async {
            inlet.send(7).await.unwrap();
        });

        assert_eq!(q.len(), 0);
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn test_drop_newest_counts_drops() {
        let q = queue(Some(1), OverflowPolicy::DropNewest);
        let inlet = StageInlet::new(Arc::clone(&q));

        tokio_test::block_on(async {
            inlet.send(1).await.unwrap();
            inlet.send(2).await.unwrap();
        });

        assert_eq!(q.len(), 1);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.pop(), Some(1));
    }

    #[test]
    fn test_reject_fails_the_send() {
        let q = queue(Some(1), OverflowPolicy::Reject);
        let inlet = StageInlet::new(Arc::clone(&q));

        tokio_test::block_on(async {
            inlet.send(1).await.unwrap();
            let rejected = inlet.send(2).await;
            assert!(matches!(
                rejected,
                Err(PipelineError::QueueFull { .. })
            ));
        });
    }

    #[tokio::test]
    async fn test_block_resumes_after_pop() {
        let q = queue(Some(1), OverflowPolicy::Block);
        let inlet = StageInlet::new(Arc::clone(&q));
        inlet.send(1).await.unwrap();

        let sender = {
            let inlet = inlet.clone();
            tokio::spawn(async move { inlet.send(2).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(q.pop(), Some(1));

        sender.await.unwrap().unwrap();
        assert_eq!(q.pop(), Some(2));
    }
}
