use rand::{prelude::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::debug;

use crate::job::Job;

const STARTING_TEMPERATURE: f64 = 1.0;
const COOLING_RATE: f64 = 0.95;

/// Order in which queued jobs are handed to workers
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChunkOrdering {
    #[default]
    Sequential,
    Random,
    LengthAsc,
    LengthDesc,
    /// Reordered so every worker ends up with a similar total duration
    Even,
    Reverse,
}

impl ChunkOrdering {
    #[inline]
    pub fn apply<J: Job, R: Rng + ?Sized>(
        self,
        jobs: &mut Vec<J>,
        slots: usize,
        iterations: usize,
        rng: &mut R,
    ) {
        match self {
            Self::Sequential => {
                // Already in order
            },
            Self::Random => {
                jobs.shuffle(rng);
            },
            Self::LengthAsc => {
                jobs.sort_by(|a, b| a.length().total_cmp(&b.length()));
            },
            Self::LengthDesc => {
                jobs.sort_by(|a, b| b.length().total_cmp(&a.length()));
            },
            Self::Even => {
                let balancer = Balancer::new(iterations, slots);
                let taken = std::mem::take(jobs);
                *jobs = balancer.balance(taken, J::length, rng);
            },
            Self::Reverse => {
                jobs.reverse();
            },
        }
    }
}

/// Simulated annealing over job permutations.
///
/// The cost of a permutation is the variance of the per-worker total length
/// when jobs are handed, in order, to whichever of `slots` workers frees up
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balancer {
    pub iterations: usize,
    pub slots:      usize,
}

impl Balancer {
    #[inline]
    pub fn new(iterations: usize, slots: usize) -> Self {
        Self {
            iterations,
            slots: slots.max(1),
        }
    }

    /// Returns the best permutation of `lengths` found, as indices into it.
    /// Its cost is never higher than that of the identity order.
    #[inline]
    pub fn order<R: Rng + ?Sized>(&self, lengths: &[f64], rng: &mut R) -> Vec<usize> {
        let mut current: Vec<usize> = (0..lengths.len()).collect();
        if lengths.len() < 2 {
            return current;
        }

        let cost = |order: &[usize]| {
            variance(&simulate_worker_loads(order.iter().map(|&i| lengths[i]), self.slots))
        };

        let mut current_cost = cost(&current);
        let mut best = current.clone();
        let mut best_cost = current_cost;
        let initial_cost = current_cost;
        let mut temperature = STARTING_TEMPERATURE;

        for _ in 0..self.iterations {
            let a = rng.random_range(0..current.len());
            let b = rng.random_range(0..current.len());
            if a != b {
                current.swap(a, b);
                let candidate_cost = cost(&current);
                let delta = candidate_cost - current_cost;
                if delta <= 0.0 || rng.random::<f64>() < (-delta / temperature).exp() {
                    current_cost = candidate_cost;
                    if current_cost < best_cost {
                        best_cost = current_cost;
                        best.clone_from(&current);
                    }
                } else {
                    current.swap(a, b);
                }
            }
            temperature *= COOLING_RATE;
        }

        debug!(
            "balanced {} jobs over {} slots, load variance {initial_cost:.2} -> {best_cost:.2}",
            lengths.len(),
            self.slots
        );
        best
    }

    #[inline]
    pub fn balance<T, R: Rng + ?Sized>(
        &self,
        items: Vec<T>,
        length: impl Fn(&T) -> f64,
        rng: &mut R,
    ) -> Vec<T> {
        let lengths: Vec<f64> = items.iter().map(length).collect();
        let order = self.order(&lengths, rng);

        let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
        order.into_iter().filter_map(|i| slots[i].take()).collect()
    }
}

/// Total length handed to each of `slots` workers when every job goes to
/// the worker that becomes free first.
#[inline]
pub fn simulate_worker_loads(lengths: impl IntoIterator<Item = f64>, slots: usize) -> Vec<f64> {
    let mut loads = vec![0.0_f64; slots.max(1)];
    for length in lengths {
        if let Some(earliest) = loads.iter_mut().min_by(|a, b| a.total_cmp(b)) {
            *earliest += length;
        }
    }
    loads
}

/// Spread between the busiest and the idlest worker
#[inline]
pub fn imbalance(loads: &[f64]) -> f64 {
    if loads.is_empty() {
        return 0.0;
    }
    let max = loads.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = loads.iter().copied().fold(f64::INFINITY, f64::min);
    max - min
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / n
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::job::{JobContext, JobError};

    struct Timed {
        index:  usize,
        length: f64,
    }

    impl Job for Timed {
        type Output = ();

        fn index(&self) -> usize {
            self.index
        }

        fn frames(&self) -> usize {
            (self.length * 24.0) as usize
        }

        fn length(&self) -> f64 {
            self.length
        }

        fn run(&mut self, _context: &JobContext<'_>) -> Result<(), JobError> {
            Ok(())
        }
    }

    fn jobs(lengths: &[f64]) -> Vec<Timed> {
        lengths
            .iter()
            .enumerate()
            .map(|(index, &length)| Timed {
                index,
                length,
            })
            .collect()
    }

    fn indices(jobs: &[Timed]) -> Vec<usize> {
        jobs.iter().map(|job| job.index).collect()
    }

    #[test]
    fn long_outlier_is_moved_forward() {
        let mut lengths = vec![4.0; 22];
        lengths.push(40.0);
        let sequential = imbalance(&simulate_worker_loads(lengths.iter().copied(), 4));

        let mut queue = jobs(&lengths);
        let mut rng = StdRng::seed_from_u64(7);
        ChunkOrdering::Even.apply(&mut queue, 4, 1000, &mut rng);

        let balanced = imbalance(&simulate_worker_loads(queue.iter().map(|job| job.length), 4));
        assert_eq!(queue.len(), 23);
        assert!(
            balanced < sequential,
            "balanced {balanced} vs sequential {sequential}"
        );
    }

    #[test]
    fn annealing_never_regresses() {
        let mut rng = StdRng::seed_from_u64(42);
        for slots in 1..=6 {
            let lengths: Vec<f64> = (0..30).map(|_| rng.random_range(0.5..20.0)).collect();
            let initial = variance(&simulate_worker_loads(lengths.iter().copied(), slots));

            let order = Balancer::new(200, slots).order(&lengths, &mut rng);
            let balanced = variance(&simulate_worker_loads(order.iter().map(|&i| lengths[i]), slots));

            assert!(balanced <= initial);
            let mut sorted = order.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..30).collect::<Vec<_>>());
        }
    }

    #[test]
    fn zero_iterations_keep_the_input_order() {
        let mut rng = StdRng::seed_from_u64(1);
        let order = Balancer::new(0, 4).order(&[3.0, 1.0, 2.0], &mut rng);
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn simple_orderings() {
        let lengths = [2.0, 5.0, 1.0, 3.0];
        let mut rng = StdRng::seed_from_u64(0);

        let mut queue = jobs(&lengths);
        ChunkOrdering::LengthAsc.apply(&mut queue, 2, 0, &mut rng);
        assert_eq!(indices(&queue), vec![2, 0, 3, 1]);

        let mut queue = jobs(&lengths);
        ChunkOrdering::LengthDesc.apply(&mut queue, 2, 0, &mut rng);
        assert_eq!(indices(&queue), vec![1, 3, 0, 2]);

        let mut queue = jobs(&lengths);
        ChunkOrdering::Reverse.apply(&mut queue, 2, 0, &mut rng);
        assert_eq!(indices(&queue), vec![3, 2, 1, 0]);

        let mut queue = jobs(&lengths);
        ChunkOrdering::Sequential.apply(&mut queue, 2, 0, &mut rng);
        assert_eq!(indices(&queue), vec![0, 1, 2, 3]);

        let mut queue = jobs(&lengths);
        ChunkOrdering::Random.apply(&mut queue, 2, 0, &mut rng);
        let mut shuffled = indices(&queue);
        shuffled.sort_unstable();
        assert_eq!(shuffled, vec![0, 1, 2, 3]);
    }

    #[test]
    fn worker_loads_follow_earliest_free_slot() {
        let loads = simulate_worker_loads([5.0, 1.0, 1.0, 1.0], 2);
        assert_eq!(loads, vec![5.0, 3.0]);
        assert!((imbalance(&loads) - 2.0).abs() < f64::EPSILON);
        assert!(imbalance(&[]).abs() < f64::EPSILON);
    }

    #[test]
    fn orderings_parse_from_snake_case() {
        assert_eq!(ChunkOrdering::from_str("length_desc").unwrap(), ChunkOrdering::LengthDesc);
        assert_eq!(ChunkOrdering::from_str("even").unwrap(), ChunkOrdering::Even);
        assert_eq!(ChunkOrdering::LengthAsc.to_string(), "length_asc");
        assert!(ChunkOrdering::from_str("longest").is_err());
    }
}
