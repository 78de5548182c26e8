//! The four scheduling strategies, behind one `pick_candidate` interface.
//!
//! New strategies (fair-share, rate-limited, deadline) are new
//! implementations of [`Scheduler`] — the claim protocol never changes.

use crate::error::QueueError;
use crate::store::{CandidateOrder, CandidateSource};
use crate::task::TaskId;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Advisory only — does not lock. The claim protocol (`TaskStore::claim`)
    /// is what makes the transition atomic; a candidate returned here may
    /// already be gone by the time the caller attempts to claim it.
    async fn pick_candidate(
        &self,
        source: &dyn CandidateSource,
        capabilities: &Value,
    ) -> Result<Option<TaskId>, QueueError>;

    fn name(&self) -> &'static str;
}

/// Order by `created_at_utc` ascending, `id` ascending as tie-break.
#[derive(Debug, Default)]
pub struct FifoScheduler;

#[async_trait]
impl Scheduler for FifoScheduler {
    async fn pick_candidate(
        &self,
        source: &dyn CandidateSource,
        capabilities: &Value,
    ) -> Result<Option<TaskId>, QueueError> {
        source.top_candidate(CandidateOrder::Fifo, capabilities).await
    }

    fn name(&self) -> &'static str {
        "fifo"
    }
}

/// Order by `created_at_utc` descending, `id` descending.
#[derive(Debug, Default)]
pub struct LifoScheduler;

#[async_trait]
impl Scheduler for LifoScheduler {
    async fn pick_candidate(
        &self,
        source: &dyn CandidateSource,
        capabilities: &Value,
    ) -> Result<Option<TaskId>, QueueError> {
        source.top_candidate(CandidateOrder::Lifo, capabilities).await
    }

    fn name(&self) -> &'static str {
        "lifo"
    }
}

/// Order by `priority` ascending (lower number = higher priority), then
/// `created_at_utc` ascending for ties. Not a global guarantee: two workers
/// can each read the current top of the eligible set before either commits
/// a claim and so receive different tasks (see spec §5).
#[derive(Debug, Default)]
pub struct PriorityScheduler;

#[async_trait]
impl Scheduler for PriorityScheduler {
    async fn pick_candidate(
        &self,
        source: &dyn CandidateSource,
        capabilities: &Value,
    ) -> Result<Option<TaskId>, QueueError> {
        source
            .top_candidate(CandidateOrder::Priority, capabilities)
            .await
    }

    fn name(&self) -> &'static str {
        "priority"
    }
}

/// Each eligible task gets weight `1 / priority`; a candidate is drawn with
/// probability proportional to its weight. Seedable for deterministic
/// tests (see [`WeightedRandomScheduler::with_seed`]).
pub struct WeightedRandomScheduler {
    rng: Mutex<fastrand::Rng>,
    candidate_limit: usize,
}

impl Default for WeightedRandomScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightedRandomScheduler {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::new()),
            candidate_limit: 1000,
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
            candidate_limit: 1000,
        }
    }

    pub fn with_candidate_limit(mut self, limit: usize) -> Self {
        self.candidate_limit = limit;
        self
    }
}

#[async_trait]
impl Scheduler for WeightedRandomScheduler {
    async fn pick_candidate(
        &self,
        source: &dyn CandidateSource,
        capabilities: &Value,
    ) -> Result<Option<TaskId>, QueueError> {
        let candidates = source
            .eligible_candidates(capabilities, self.candidate_limit)
            .await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let weights: Vec<f64> = candidates
            .iter()
            .map(|c| 1.0 / c.priority.max(1) as f64)
            .collect();
        let total: f64 = weights.iter().sum();

        let draw = {
            let mut rng = self.rng.lock().expect("scheduler rng poisoned");
            rng.f64() * total
        };

        let mut cumulative = 0.0;
        for (candidate, weight) in candidates.iter().zip(weights.iter()) {
            cumulative += weight;
            if draw < cumulative {
                return Ok(Some(candidate.id));
            }
        }
        // Floating-point rounding can leave `draw` fractionally past the
        // last boundary; fall back to the last candidate rather than None.
        Ok(candidates.last().map(|c| c.id))
    }

    fn name(&self) -> &'static str {
        "weighted_random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CandidateTask;
    use std::sync::Mutex as StdMutex;

    struct FixedSource {
        candidates: Vec<CandidateTask>,
        top: StdMutex<Option<TaskId>>,
    }

    #[async_trait]
    impl CandidateSource for FixedSource {
        async fn top_candidate(
            &self,
            _order: CandidateOrder,
            _capabilities: &Value,
        ) -> Result<Option<TaskId>, QueueError> {
            Ok(*self.top.lock().unwrap())
        }

        async fn eligible_candidates(
            &self,
            _capabilities: &Value,
            _limit: usize,
        ) -> Result<Vec<CandidateTask>, QueueError> {
            Ok(self.candidates.clone())
        }
    }

    #[tokio::test]
    async fn weighted_random_is_deterministic_given_a_seed() {
        let source = FixedSource {
            candidates: vec![
                CandidateTask { id: 1, priority: 1 },
                CandidateTask { id: 2, priority: 100 },
            ],
            top: StdMutex::new(None),
        };

        let a = WeightedRandomScheduler::with_seed(42);
        let b = WeightedRandomScheduler::with_seed(42);

        let picked_a = a.pick_candidate(&source, &Value::Null).await.unwrap();
        let picked_b = b.pick_candidate(&source, &Value::Null).await.unwrap();
        assert_eq!(picked_a, picked_b);
    }

    #[tokio::test]
    async fn weighted_random_favors_lower_priority_number() {
        let source = FixedSource {
            candidates: (0..10)
                .map(|i| CandidateTask {
                    id: i,
                    priority: if i < 5 { 1 } else { 100 },
                })
                .collect(),
            top: StdMutex::new(None),
        };
        let scheduler = WeightedRandomScheduler::with_seed(7);

        let mut high_priority_wins = 0;
        for _ in 0..200 {
            if let Some(id) = scheduler.pick_candidate(&source, &Value::Null).await.unwrap() {
                if id < 5 {
                    high_priority_wins += 1;
                }
            }
        }
        assert!(high_priority_wins > 150, "got {high_priority_wins}/200");
    }

    #[tokio::test]
    async fn empty_candidate_set_yields_none() {
        let source = FixedSource {
            candidates: vec![],
            top: StdMutex::new(None),
        };
        let scheduler = WeightedRandomScheduler::with_seed(1);
        assert!(scheduler
            .pick_candidate(&source, &Value::Null)
            .await
            .unwrap()
            .is_none());
    }
}
