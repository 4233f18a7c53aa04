use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::optimizer::{SearchOutcome, SearchParams, TrimOptimizer};
use crate::registry::CancellationRegistry;
use crate::types::{GradeId, OrderLine, OrderSet, TrimPlan};

/// Errors surfaced by the order/plan stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("grade {0} not found")]
    GradeNotFound(GradeId),
    #[error("width {width} not on order for grade {grade}")]
    WidthNotFound { grade: GradeId, width: u32 },
    #[error("insufficient quantity for width {width}: have {have}, need {need}")]
    InsufficientQuantity { width: u32, have: u32, need: u32 },
    #[error("database error: {0}")]
    Database(String),
    #[error("plan encoding error: {0}")]
    Encoding(String),
}

/// Read access to outstanding orders, implemented by the persistence layer.
pub trait OrderStore: Send + Sync {
    /// Order lines for one grade, ascending by width.
    fn orders(&self, grade: GradeId) -> Result<Vec<OrderLine>, StoreError>;

    /// Every grade with at least one outstanding order.
    fn grades_with_orders(&self) -> Result<Vec<GradeId>, StoreError>;
}

/// Write access to persisted trim plans.
pub trait PlanStore: Send + Sync {
    /// Atomically replaces the previous plan for the grade.
    fn replace(&self, grade: GradeId, plan: &TrimPlan) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("optimizer worker failed: {0}")]
    Worker(String),
}

/// What one `run_one` invocation did.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// No outstanding orders; nothing computed or persisted.
    NoOrders,
    /// Cancelled mid-search; the previously persisted plan is untouched.
    Interrupted,
    /// A completed plan, already persisted.
    Planned(TrimPlan),
}

/// Tally of one full sweep across all grades.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub planned: usize,
    pub interrupted: usize,
    pub skipped: usize,
    pub failures: Vec<(GradeId, ScheduleError)>,
}

impl SweepReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Clears the registry entry on every exit path out of `run_one`.
struct ActiveGuard {
    registry: CancellationRegistry,
    grade: GradeId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.registry.end(self.grade);
    }
}

/// Runs one optimizer pass per grade, fanning independent grades out across
/// a bounded worker pool. Workers share nothing but the cancellation
/// registry.
#[derive(Clone)]
pub struct GradeScheduler {
    orders: Arc<dyn OrderStore>,
    plans: Arc<dyn PlanStore>,
    registry: CancellationRegistry,
    params: SearchParams,
}

impl GradeScheduler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        plans: Arc<dyn PlanStore>,
        registry: CancellationRegistry,
        params: SearchParams,
    ) -> Self {
        Self {
            orders,
            plans,
            registry,
            params,
        }
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    /// Recomputes the trim plan for one grade. Empty order sets are a no-op;
    /// interrupted searches leave the persisted plan untouched. The grade is
    /// deregistered from the cancellation registry on every exit path.
    pub async fn run_one(&self, grade: GradeId) -> Result<RunOutcome, ScheduleError> {
        let lines = {
            let store = Arc::clone(&self.orders);
            spawn_store(move || store.orders(grade)).await??
        };
        if lines.is_empty() {
            tracing::debug!(grade, "no outstanding orders");
            return Ok(RunOutcome::NoOrders);
        }
        let order_set = OrderSet::new(lines);

        self.registry.begin(grade);
        let _guard = ActiveGuard {
            registry: self.registry.clone(),
            grade,
        };

        let registry = self.registry.clone();
        let params = self.params.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let optimizer = TrimOptimizer::new(&order_set, params);
            let mut rng = rand::rng();
            optimizer.search(&mut rng, || registry.should_stop(grade))
        })
        .await
        .map_err(|e| ScheduleError::Worker(e.to_string()))?;

        match outcome {
            SearchOutcome::Interrupted => {
                tracing::info!(grade, "search interrupted, previous plan kept");
                Ok(RunOutcome::Interrupted)
            }
            SearchOutcome::Plan(plan) => {
                let store = Arc::clone(&self.plans);
                let persisted = plan.clone();
                spawn_store(move || store.replace(grade, &persisted)).await??;
                tracing::info!(
                    grade,
                    leftover_weight = plan.leftover_weight,
                    actions = plan.actions.len(),
                    "trim plan replaced"
                );
                Ok(RunOutcome::Planned(plan))
            }
        }
    }

    /// Recomputes plans for every grade with outstanding orders, bounded by
    /// available hardware parallelism. One grade's failure is logged and
    /// reported; it never cancels or fails the sibling grades.
    pub async fn run_all(&self) -> Result<SweepReport, ScheduleError> {
        let grades = {
            let store = Arc::clone(&self.orders);
            spawn_store(move || store.grades_with_orders()).await??
        };
        let mut report = SweepReport::default();
        if grades.is_empty() {
            return Ok(report);
        }

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(grades.len());
        tracing::info!(grades = grades.len(), workers, "starting full sweep");

        let permits = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        for grade in grades {
            let scheduler = self.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore closed");
                (grade, scheduler.run_one(grade).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(RunOutcome::Planned(_)))) => report.planned += 1,
                Ok((_, Ok(RunOutcome::Interrupted))) => report.interrupted += 1,
                Ok((_, Ok(RunOutcome::NoOrders))) => report.skipped += 1,
                Ok((grade, Err(err))) => {
                    tracing::error!(grade, error = %err, "grade sweep failed");
                    report.failures.push((grade, err));
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "sweep worker panicked");
                }
            }
        }
        Ok(report)
    }
}

async fn spawn_store<T, F>(call: F) -> Result<Result<T, StoreError>, ScheduleError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| ScheduleError::Worker(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory stand-in for both stores, with optional injected failures.
    #[derive(Default)]
    struct MemoryStore {
        orders: Mutex<HashMap<GradeId, Vec<OrderLine>>>,
        plans: Mutex<HashMap<GradeId, TrimPlan>>,
        fail_replace_for: Mutex<Option<GradeId>>,
    }

    impl MemoryStore {
        fn with_orders(entries: &[(GradeId, &[(u32, u32)])]) -> Arc<Self> {
            let store = Self::default();
            {
                let mut orders = store.orders.lock().unwrap();
                for (grade, lines) in entries {
                    orders.insert(
                        *grade,
                        lines
                            .iter()
                            .map(|&(width, quantity)| OrderLine { width, quantity })
                            .collect(),
                    );
                }
            }
            Arc::new(store)
        }

        fn plan(&self, grade: GradeId) -> Option<TrimPlan> {
            self.plans.lock().unwrap().get(&grade).cloned()
        }

        fn plan_count(&self) -> usize {
            self.plans.lock().unwrap().len()
        }
    }

    impl OrderStore for MemoryStore {
        fn orders(&self, grade: GradeId) -> Result<Vec<OrderLine>, StoreError> {
            Ok(self
                .orders
                .lock()
                .unwrap()
                .get(&grade)
                .cloned()
                .unwrap_or_default())
        }

        fn grades_with_orders(&self) -> Result<Vec<GradeId>, StoreError> {
            let mut grades: Vec<GradeId> = self
                .orders
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, lines)| !lines.is_empty())
                .map(|(grade, _)| *grade)
                .collect();
            grades.sort_unstable();
            Ok(grades)
        }
    }

    impl PlanStore for MemoryStore {
        fn replace(&self, grade: GradeId, plan: &TrimPlan) -> Result<(), StoreError> {
            if *self.fail_replace_for.lock().unwrap() == Some(grade) {
                return Err(StoreError::Database("disk full".into()));
            }
            self.plans.lock().unwrap().insert(grade, plan.clone());
            Ok(())
        }
    }

    fn scheduler(store: &Arc<MemoryStore>) -> GradeScheduler {
        GradeScheduler::new(
            Arc::clone(store) as Arc<dyn OrderStore>,
            Arc::clone(store) as Arc<dyn PlanStore>,
            CancellationRegistry::new(),
            SearchParams::with_stage_width(312),
        )
    }

    #[tokio::test]
    async fn test_run_one_persists_plan_and_cleans_up() {
        let store = MemoryStore::with_orders(&[(1, &[(150, 10), (162, 10)])]);
        let scheduler = scheduler(&store);

        let outcome = scheduler.run_one(1).await.unwrap();
        match outcome {
            RunOutcome::Planned(plan) => {
                assert_eq!(plan.leftover_weight, 0.0);
                assert_eq!(store.plan(1), Some(plan));
            }
            other => panic!("expected a plan, got {other:?}"),
        }
        assert!(!scheduler.registry().is_active(1));
    }

    #[tokio::test]
    async fn test_run_one_without_orders_is_a_noop() {
        let store = MemoryStore::with_orders(&[]);
        let scheduler = scheduler(&store);

        let outcome = scheduler.run_one(9).await.unwrap();
        assert_eq!(outcome, RunOutcome::NoOrders);
        assert_eq!(store.plan_count(), 0);
        assert!(!scheduler.registry().is_active(9));
    }

    #[tokio::test]
    async fn test_suspended_registry_interrupts_without_persisting() {
        let store = MemoryStore::with_orders(&[(1, &[(150, 10), (162, 10)])]);
        let scheduler = scheduler(&store);

        scheduler.registry().suspend_all();
        let outcome = scheduler.run_one(1).await.unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted);
        assert_eq!(store.plan_count(), 0);
        assert!(!scheduler.registry().is_active(1));
    }

    #[tokio::test]
    async fn test_run_all_covers_every_grade() {
        let store = MemoryStore::with_orders(&[
            (1, &[(150, 10), (162, 10)]),
            (2, &[(104, 9)]),
            (3, &[(156, 8)]),
        ]);
        let scheduler = scheduler(&store);

        let report = scheduler.run_all().await.unwrap();
        assert_eq!(report.planned, 3);
        assert_eq!(report.failed(), 0);
        assert_eq!(store.plan_count(), 3);
    }

    #[tokio::test]
    async fn test_run_all_isolates_a_failing_grade() {
        let store = MemoryStore::with_orders(&[
            (1, &[(150, 10), (162, 10)]),
            (2, &[(104, 9)]),
        ]);
        *store.fail_replace_for.lock().unwrap() = Some(1);
        let scheduler = scheduler(&store);

        let report = scheduler.run_all().await.unwrap();
        assert_eq!(report.planned, 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.failures[0].0, 1);
        assert!(store.plan(2).is_some());
        assert!(store.plan(1).is_none());
        // Failure paths still clear the registry.
        assert!(!scheduler.registry().is_active(1));
        assert!(!scheduler.registry().is_active(2));
    }

    #[tokio::test]
    async fn test_cancelling_one_grade_leaves_siblings_untouched() {
        let store = MemoryStore::with_orders(&[
            (1, &[(97, 13), (104, 9), (150, 11), (162, 10)]),
            (2, &[(150, 10), (162, 10)]),
        ]);
        let scheduler = scheduler(&store);

        let run_a = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_one(1).await })
        };
        let run_b = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_one(2).await })
        };
        // Fire targeted cancellations at grade 1 while both runs are in
        // flight. Grade 2's predicate never observes them.
        let registry = scheduler.registry().clone();
        let canceller = tokio::spawn(async move {
            for _ in 0..100 {
                registry.end(1);
                tokio::task::yield_now().await;
            }
        });

        let outcome_a = run_a.await.unwrap().unwrap();
        let outcome_b = run_b.await.unwrap().unwrap();
        canceller.await.unwrap();

        // Depending on timing, grade 1 either finished first or got caught
        // mid-search. Grade 2 must complete and persist regardless.
        assert!(matches!(
            outcome_a,
            RunOutcome::Planned(_) | RunOutcome::Interrupted
        ));
        match outcome_b {
            RunOutcome::Planned(plan) => {
                assert_eq!(plan.leftover_weight, 0.0);
                assert_eq!(store.plan(2), Some(plan));
            }
            other => panic!("expected grade 2 to plan, got {other:?}"),
        }
        assert!(!scheduler.registry().is_active(1));
        assert!(!scheduler.registry().is_active(2));
    }

    #[tokio::test]
    async fn test_run_all_with_no_grades() {
        let store = MemoryStore::with_orders(&[]);
        let scheduler = scheduler(&store);
        let report = scheduler.run_all().await.unwrap();
        assert_eq!(report.planned + report.interrupted + report.skipped, 0);
    }
}
