//! Per-stage priority queues with cross-stage deduplication.
//!
//! All three lanes sit behind one lock so "is this episode queued or being
//! worked on anywhere" is answered atomically with the insert. An episode
//! id is tracked from `push` until the matching `finish`.

use crate::database::Stage;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy)]
pub struct QueueItem {
    pub priority: f64,
    pub episode_id: i64,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Lower priority first, ties broken by episode id.
impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then(self.episode_id.cmp(&other.episode_id))
    }
}

#[derive(Debug, Default)]
struct Lane {
    heap: BinaryHeap<Reverse<QueueItem>>,
    queued: HashSet<i64>,
    active: HashSet<i64>,
}

impl Lane {
    fn tracks(&self, episode_id: i64) -> bool {
        self.queued.contains(&episode_id) || self.active.contains(&episode_id)
    }

    fn unfinished(&self) -> usize {
        self.heap.len() + self.active.len()
    }
}

/// Whether an episode is waiting in a queue or held by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracked {
    Queued(Stage),
    Active(Stage),
}

#[derive(Debug)]
pub struct WorkQueues {
    lanes: Mutex<[Lane; 3]>,
    available: [Notify; 3],
    drained: Notify,
}

impl WorkQueues {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(Default::default()),
            available: [Notify::new(), Notify::new(), Notify::new()],
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, [Lane; 3]> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `episode_id` for `stage` unless it is already queued or active
    /// in any stage. Returns whether it was added.
    pub fn push(&self, stage: Stage, priority: f64, episode_id: i64) -> bool {
        {
            let mut lanes = self.lock();
            if lanes.iter().any(|lane| lane.tracks(episode_id)) {
                return false;
            }
            let lane = &mut lanes[stage.index()];
            lane.heap.push(Reverse(QueueItem {
                priority,
                episode_id,
            }));
            lane.queued.insert(episode_id);
        }
        self.available[stage.index()].notify_one();
        true
    }

    /// Take the lowest-priority item, marking it active.
    pub fn try_pop(&self, stage: Stage) -> Option<QueueItem> {
        let mut lanes = self.lock();
        let lane = &mut lanes[stage.index()];
        let Reverse(item) = lane.heap.pop()?;
        lane.queued.remove(&item.episode_id);
        lane.active.insert(item.episode_id);
        Some(item)
    }

    /// Wait for an item. Cancel-safe: nothing is taken unless it is returned.
    pub async fn pop(&self, stage: Stage) -> QueueItem {
        loop {
            let notified = self.available[stage.index()].notified();
            if let Some(item) = self.try_pop(stage) {
                return item;
            }
            notified.await;
        }
    }

    /// Mark a popped item done. Must be called once per successful pop.
    pub fn finish(&self, stage: Stage, episode_id: i64) {
        let all_done = {
            let mut lanes = self.lock();
            if !lanes[stage.index()].active.remove(&episode_id) {
                log::warn!(
                    "finish() for episode {} which is not active in {}",
                    episode_id,
                    stage
                );
            }
            lanes.iter().all(|lane| lane.unfinished() == 0)
        };
        if all_done {
            self.drained.notify_waiters();
        }
    }

    /// Wait until every pushed item has been finished.
    pub async fn join(&self) {
        loop {
            let drained = self.drained.notified();
            if self.total_unfinished() == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Items waiting in `stage`, not counting active ones.
    pub fn depth(&self, stage: Stage) -> usize {
        self.lock()[stage.index()].heap.len()
    }

    pub fn active_count(&self, stage: Stage) -> usize {
        self.lock()[stage.index()].active.len()
    }

    pub fn total_unfinished(&self) -> usize {
        self.lock().iter().map(Lane::unfinished).sum()
    }

    pub fn tracked(&self, episode_id: i64) -> Option<Tracked> {
        let lanes = self.lock();
        Stage::ALL.into_iter().find_map(|stage| {
            let lane = &lanes[stage.index()];
            if lane.queued.contains(&episode_id) {
                Some(Tracked::Queued(stage))
            } else if lane.active.contains(&episode_id) {
                Some(Tracked::Active(stage))
            } else {
                None
            }
        })
    }
}

impl Default for WorkQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_lowest_priority_first() {
        let queues = WorkQueues::new();
        assert!(queues.push(Stage::Download, 25.0, 2));
        assert!(queues.push(Stage::Download, 10.0, 1));
        assert!(queues.push(Stage::Download, 10.0, 0));

        let order: Vec<i64> = std::iter::from_fn(|| queues.try_pop(Stage::Download))
            .map(|item| item.episode_id)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_negative_priority_sorts_first() {
        let queues = WorkQueues::new();
        queues.push(Stage::Analyze, 0.5, 1);
        queues.push(Stage::Analyze, -3.0, 2);
        assert_eq!(queues.try_pop(Stage::Analyze).unwrap().episode_id, 2);
    }

    #[test]
    fn test_duplicate_rejected_across_stages() {
        let queues = WorkQueues::new();
        assert!(queues.push(Stage::Download, 1.0, 7));
        assert!(!queues.push(Stage::Download, 0.0, 7));
        assert!(!queues.push(Stage::Transcribe, 0.0, 7));
        assert_eq!(queues.depth(Stage::Download), 1);
        assert_eq!(queues.depth(Stage::Transcribe), 0);

        // Still tracked while a worker holds it
        queues.try_pop(Stage::Download).unwrap();
        assert_eq!(queues.tracked(7), Some(Tracked::Active(Stage::Download)));
        assert!(!queues.push(Stage::Transcribe, 0.0, 7));

        queues.finish(Stage::Download, 7);
        assert_eq!(queues.tracked(7), None);
        assert!(queues.push(Stage::Transcribe, 0.0, 7));
        assert_eq!(queues.tracked(7), Some(Tracked::Queued(Stage::Transcribe)));
    }

    #[test]
    fn test_counts() {
        let queues = WorkQueues::new();
        queues.push(Stage::Download, 1.0, 1);
        queues.push(Stage::Download, 2.0, 2);
        queues.push(Stage::Analyze, 1.0, 3);
        queues.try_pop(Stage::Download);

        assert_eq!(queues.depth(Stage::Download), 1);
        assert_eq!(queues.active_count(Stage::Download), 1);
        assert_eq!(queues.depth(Stage::Analyze), 1);
        assert_eq!(queues.total_unfinished(), 3);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queues = Arc::new(WorkQueues::new());
        let waiter = {
            let queues = queues.clone();
            tokio::spawn(async move { queues.pop(Stage::Transcribe).await })
        };
        tokio::task::yield_now().await;
        queues.push(Stage::Transcribe, 3.0, 42);

        let item = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.episode_id, 42);
    }

    #[tokio::test]
    async fn test_join_returns_when_everything_finished() {
        let queues = Arc::new(WorkQueues::new());
        queues.push(Stage::Download, 1.0, 1);
        queues.push(Stage::Analyze, 1.0, 2);

        let joiner = {
            let queues = queues.clone();
            tokio::spawn(async move { queues.join().await })
        };

        let a = queues.pop(Stage::Download).await;
        queues.finish(Stage::Download, a.episode_id);
        tokio::task::yield_now().await;
        assert!(!joiner.is_finished());

        let b = queues.pop(Stage::Analyze).await;
        queues.finish(Stage::Analyze, b.episode_id);
        tokio::time::timeout(Duration::from_secs(5), joiner)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_join_on_empty_queues_is_immediate() {
        WorkQueues::new().join().await;
    }
}
