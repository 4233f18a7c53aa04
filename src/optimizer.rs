use rand::Rng;

use crate::types::{AREAL_WEIGHT, OrderSet, StageResidual, TrimAction, TrimPlan};

/// Tunable knobs of the randomized trim search. Defaults match the
/// production machine: a 312-unit target on both stages, a 12-unit kerf
/// tolerance, and a 30000-iteration budget.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Target widths: stage-1 passes use `[0]`, the stage-2 2-way pass
    /// uses `[1]` and the stage-2 3-way pass uses `[2]`. Current callers
    /// pass the same value for all three.
    pub stage_widths: [u32; 3],
    /// Allowed shortfall below the target still accepted as a valid cut.
    pub tolerance: u32,
    pub iteration_cap: u32,
    /// Random pairing trials per pass (four passes per iteration).
    pub trials_per_pass: u32,
    /// Iterations per plateau-detection window; zero disables plateau
    /// detection entirely.
    pub checkpoint_interval: u32,
    /// Two window-best weights closer than this count as a plateau.
    pub plateau_epsilon: f64,
    /// Consecutive identical best-weight ties before stopping early.
    pub repeat_limit: u32,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            stage_widths: [312; 3],
            tolerance: 12,
            iteration_cap: 30_000,
            trials_per_pass: 1_000,
            checkpoint_interval: 2_000,
            plateau_epsilon: 1e-4,
            repeat_limit: 5,
        }
    }
}

impl SearchParams {
    pub fn with_stage_width(width: u32) -> Self {
        Self {
            stage_widths: [width; 3],
            ..Self::default()
        }
    }
}

/// Result of one optimizer invocation. `Interrupted` is distinct from a
/// completed plan with zero actions: nothing may be persisted for it.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Plan(TrimPlan),
    Interrupted,
}

/// Which sampled indices of a 3-way trial coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coincidence {
    Distinct,
    /// One width drawn twice (`doubled`), one once (`single`).
    Doubled { doubled: usize, single: usize },
    Identical,
}

fn coincidence(i: usize, j: usize, k: usize) -> Coincidence {
    if i == j && j == k {
        Coincidence::Identical
    } else if i == j {
        Coincidence::Doubled { doubled: i, single: k }
    } else if i == k {
        Coincidence::Doubled { doubled: i, single: j }
    } else if j == k {
        Coincidence::Doubled { doubled: j, single: i }
    } else {
        Coincidence::Distinct
    }
}

/// One full iteration's outcome: residuals after each stage, the recorded
/// actions and the stage-1 pair/triple counter.
struct Attempt {
    stage1_residuals: Vec<u32>,
    stage2_residuals: Vec<u32>,
    actions: Vec<TrimAction>,
    stage1_cuts: f64,
    weight: f64,
}

impl Attempt {
    fn fully_trimmed(&self) -> bool {
        self.stage2_residuals.iter().all(|&r| r == 0)
    }
}

fn leftover_weight(widths: &[u32], residuals: &[u32]) -> f64 {
    widths
        .iter()
        .zip(residuals)
        .map(|(&w, &r)| w as f64 * r as f64)
        .sum::<f64>()
        * AREAL_WEIGHT
}

/// Randomized trial-and-accept search for one grade's trim plan.
///
/// Every iteration is an independent pass over a fresh copy of the order
/// quantities: four random pairing passes (2-way and 3-way per stage),
/// then leftover weight from the stage-2 residuals. The best attempt by
/// lowest weight (ties broken by higher stage-1 pair count) is returned
/// when the budget runs out or an early-stop rule fires.
pub struct TrimOptimizer<'a> {
    orders: &'a OrderSet,
    params: SearchParams,
}

impl<'a> TrimOptimizer<'a> {
    pub fn new(orders: &'a OrderSet, params: SearchParams) -> Self {
        Self { orders, params }
    }

    /// Runs the search. `should_stop` is polled at the top of every outer
    /// iteration and at the entry of each of the four inner trial passes,
    /// never inside a trial body, so cancellation latency is bounded by one
    /// trial batch. On stop all progress is discarded.
    pub fn search<R, F>(&self, rng: &mut R, should_stop: F) -> SearchOutcome
    where
        R: Rng,
        F: Fn() -> bool,
    {
        let widths = self.orders.widths();
        let original = self.orders.quantities();
        if widths.is_empty() {
            return SearchOutcome::Plan(TrimPlan {
                residuals: vec![],
                leftover_weight: 0.0,
                actions: vec![],
                stage1_pair_count: 0.0,
            });
        }

        let mut best: Option<Attempt> = None;
        let mut last_tied_actions: Option<Vec<TrimAction>> = None;
        let mut repeated_ties = 0u32;
        let mut window_best = f64::INFINITY;
        let mut checkpoints: Vec<f64> = Vec::new();

        for iteration in 0..self.params.iteration_cap {
            if should_stop() {
                return SearchOutcome::Interrupted;
            }

            let attempt = match self.attempt(&widths, &original, rng, &should_stop) {
                Some(attempt) => attempt,
                None => return SearchOutcome::Interrupted,
            };

            if attempt.fully_trimmed() {
                tracing::debug!(iteration, "all orders trimmed");
                return SearchOutcome::Plan(self.build_plan(&widths, &original, attempt));
            }

            window_best = window_best.min(attempt.weight);

            let improved = best.as_ref().is_none_or(|b| attempt.weight < b.weight);
            if improved {
                best = Some(attempt);
                repeated_ties = 0;
                last_tied_actions = None;
            } else if let Some(current_best) = best.as_mut()
                && attempt.weight == current_best.weight
            {
                if last_tied_actions.as_deref() == Some(attempt.actions.as_slice()) {
                    repeated_ties += 1;
                } else {
                    repeated_ties = 1;
                }
                last_tied_actions = Some(attempt.actions.clone());
                if attempt.stage1_cuts > current_best.stage1_cuts {
                    *current_best = attempt;
                }
                if repeated_ties >= self.params.repeat_limit {
                    tracing::debug!(iteration, "stopping after repeated identical results");
                    break;
                }
            }

            if self.params.checkpoint_interval > 0
                && (iteration + 1) % self.params.checkpoint_interval == 0
            {
                checkpoints.push(window_best);
                if checkpoints.len() >= 3 {
                    let earlier = &checkpoints[..checkpoints.len() - 1];
                    if earlier
                        .iter()
                        .any(|&w| (w - window_best).abs() < self.params.plateau_epsilon)
                    {
                        tracing::debug!(iteration, best = window_best, "search plateau detected");
                        break;
                    }
                }
                window_best = f64::INFINITY;
            }
        }

        let plan = match best {
            Some(attempt) => self.build_plan(&widths, &original, attempt),
            // Zero-iteration budget: report the orders untouched.
            None => self.build_plan(
                &widths,
                &original,
                Attempt {
                    stage1_residuals: original.clone(),
                    stage2_residuals: original.clone(),
                    actions: vec![],
                    stage1_cuts: 0.0,
                    weight: leftover_weight(&widths, &original),
                },
            ),
        };
        SearchOutcome::Plan(plan)
    }

    /// One independent iteration over a fresh copy of the quantities.
    /// Returns `None` if the cancellation predicate fired between passes.
    fn attempt<R, F>(
        &self,
        widths: &[u32],
        original: &[u32],
        rng: &mut R,
        should_stop: &F,
    ) -> Option<Attempt>
    where
        R: Rng,
        F: Fn() -> bool,
    {
        let mut remaining = original.to_vec();
        let mut actions = Vec::new();
        let mut stage1_cuts = 0.0;

        if should_stop() {
            return None;
        }
        self.two_way_pass(
            widths,
            &mut remaining,
            &mut actions,
            &mut stage1_cuts,
            self.params.stage_widths[0],
            rng,
        );
        if should_stop() {
            return None;
        }
        self.three_way_pass(
            widths,
            &mut remaining,
            &mut actions,
            &mut stage1_cuts,
            self.params.stage_widths[0],
            rng,
        );
        let stage1_residuals = remaining.clone();

        // Stage 2 trims the residuals left by stage 1, not the originals.
        let mut stage2_cuts = 0.0;
        if should_stop() {
            return None;
        }
        self.two_way_pass(
            widths,
            &mut remaining,
            &mut actions,
            &mut stage2_cuts,
            self.params.stage_widths[1],
            rng,
        );
        if should_stop() {
            return None;
        }
        self.three_way_pass(
            widths,
            &mut remaining,
            &mut actions,
            &mut stage2_cuts,
            self.params.stage_widths[2],
            rng,
        );

        let weight = leftover_weight(widths, &remaining);
        Some(Attempt {
            stage1_residuals,
            stage2_residuals: remaining,
            actions,
            stage1_cuts,
            weight,
        })
    }

    // Widths come straight from order intake, so sums are widened before
    // the comparison instead of trusting them to fit in u32.
    fn in_band(&self, combined: u64, target: u32) -> bool {
        u64::from(target.saturating_sub(self.params.tolerance)) <= combined
            && combined <= u64::from(target)
    }

    fn two_way_pass<R: Rng>(
        &self,
        widths: &[u32],
        remaining: &mut [u32],
        actions: &mut Vec<TrimAction>,
        cuts: &mut f64,
        target: u32,
        rng: &mut R,
    ) {
        for _ in 0..self.params.trials_per_pass {
            let i = rng.random_range(0..widths.len());
            let j = rng.random_range(0..widths.len());
            if !self.in_band(u64::from(widths[i]) + u64::from(widths[j]), target) {
                continue;
            }
            if i != j {
                let take = remaining[i].min(remaining[j]);
                if take == 0 {
                    continue;
                }
                remaining[i] -= take;
                remaining[j] -= take;
                actions.push(TrimAction::pair(widths[i], take, widths[j], take));
                *cuts += take as f64;
            } else {
                // Self-pairing: split the remainder into matched halves.
                // An odd remainder leaves one unit that cannot self-pair.
                let pairs = remaining[i] / 2;
                if pairs == 0 {
                    continue;
                }
                remaining[i] -= pairs * 2;
                actions.push(TrimAction::pair(widths[i], pairs, widths[i], pairs));
                *cuts += pairs as f64;
            }
        }
    }

    fn three_way_pass<R: Rng>(
        &self,
        widths: &[u32],
        remaining: &mut [u32],
        actions: &mut Vec<TrimAction>,
        cuts: &mut f64,
        target: u32,
        rng: &mut R,
    ) {
        for _ in 0..self.params.trials_per_pass {
            let i = rng.random_range(0..widths.len());
            let j = rng.random_range(0..widths.len());
            let k = rng.random_range(0..widths.len());
            let combined = u64::from(widths[i]) + u64::from(widths[j]) + u64::from(widths[k]);
            if !self.in_band(combined, target) {
                continue;
            }
            if remaining[i] == 0 || remaining[j] == 0 || remaining[k] == 0 {
                continue;
            }

            let trims = match coincidence(i, j, k) {
                Coincidence::Distinct => {
                    let take = remaining[i].min(remaining[j]).min(remaining[k]);
                    remaining[i] -= take;
                    remaining[j] -= take;
                    remaining[k] -= take;
                    take
                }
                Coincidence::Doubled { doubled, single } => {
                    // Each cut takes two rolls of the doubled width and one
                    // of the singleton; the shorter side's odd unit is left.
                    let take = remaining[single].min(remaining[doubled] / 2);
                    remaining[doubled] -= take * 2;
                    remaining[single] -= take;
                    take
                }
                Coincidence::Identical => {
                    // Consume in units of three; a remainder mod 3 stays.
                    let take = remaining[i] / 3;
                    remaining[i] -= take * 3;
                    take
                }
            };

            if trims > 0 {
                actions.push(TrimAction::triple(widths[i], widths[j], widths[k], trims));
                *cuts += trims as f64;
            }
        }
    }

    fn build_plan(&self, widths: &[u32], original: &[u32], attempt: Attempt) -> TrimPlan {
        let residuals = widths
            .iter()
            .zip(original)
            .zip(attempt.stage1_residuals.iter().zip(&attempt.stage2_residuals))
            .map(|((&width, &ordered), (&after1, &after2))| StageResidual {
                width,
                original: ordered,
                consumed_stage1: ordered - after1,
                residual_stage1: after1,
                consumed_stage2: after1 - after2,
                residual_stage2: after2,
            })
            .collect();

        TrimPlan {
            residuals,
            leftover_weight: attempt.weight,
            actions: attempt.actions,
            stage1_pair_count: attempt.stage1_cuts,
        }
    }
}
