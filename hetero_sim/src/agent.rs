//! Simulated collaborators.
//!
//! Lightweight stand-ins for a real coordinator and real devices, enough to
//! drive the engine end to end:
//! - `SimulatedParticipant` "trains" by emitting an update whose size
//!   grows with the steps it performed
//! - `SimulatedCoordinator` samples a fixed proportion of the idle set with
//!   its own seeded RNG

use crate::world::SimConfig;

use hetero_env::{Coordinator, Participant, ParticipantId, Payload, PayloadValue, Tick};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Update values emitted per local step.
pub const UPDATE_WIDTH: usize = 16;

/// Number of label classes in the synthetic task.
pub const NUM_CLASSES: u32 = 10;

/// A simulated participant.
#[derive(Debug, Clone)]
pub struct SimulatedParticipant {
    /// Participant index
    pub id: ParticipantId,

    /// Current local workload
    num_steps: u64,

    steps_per_epoch: u64,
    data_volume: usize,
    labels: Vec<u32>,

    /// Last availability flag pushed by the engine
    available: bool,

    /// Steps performed in each training call, oldest first
    history: Vec<(u64, u64)>,
}

impl SimulatedParticipant {
    /// Creates a participant with a fixed workload and data profile.
    pub fn new(id: ParticipantId, num_steps: u64, steps_per_epoch: u64, data_volume: usize, labels: Vec<u32>) -> Self {
        Self {
            id,
            num_steps,
            steps_per_epoch: steps_per_epoch.max(1),
            data_volume,
            labels,
            available: true,
            history: Vec::new(),
        }
    }

    /// Builds a population of `config.num_participants` with random data
    /// volumes in `[50, 500]` and two to five distinct labels each.
    pub fn population(config: &SimConfig, rng: &mut ChaCha8Rng) -> Vec<Self> {
        let classes: Vec<u32> = (0..NUM_CLASSES).collect();
        (0..config.num_participants)
            .map(|i| {
                let volume = rng.gen_range(50..=500);
                let count = rng.gen_range(2..=5);
                let mut labels: Vec<u32> = classes.choose_multiple(rng, count).copied().collect();
                labels.sort_unstable();
                Self::new(ParticipantId(i), config.num_steps, config.steps_per_epoch, volume, labels)
            })
            .collect()
    }

    /// Returns the availability flag last pushed by the engine.
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Returns `(round, steps)` for every training call so far.
    pub fn history(&self) -> &[(u64, u64)] {
        &self.history
    }
}

impl Participant for SimulatedParticipant {
    fn num_steps(&self) -> u64 {
        self.num_steps
    }

    fn set_num_steps(&mut self, steps: u64) {
        self.num_steps = steps;
    }

    fn steps_per_epoch(&self) -> u64 {
        self.steps_per_epoch
    }

    fn data_volume(&self) -> usize {
        self.data_volume
    }

    fn labels(&self) -> Vec<u32> {
        self.labels.clone()
    }

    fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    fn train(&mut self, round: u64) -> Payload {
        self.history.push((round, self.num_steps));
        let width = self.num_steps as usize * UPDATE_WIDTH;
        Payload::new()
            .with("round", PayloadValue::Scalar(round as f64))
            .with("steps", PayloadValue::Scalar(self.num_steps as f64))
            .with("update", PayloadValue::Vector(vec![self.id.0 as f32; width]))
    }
}

/// A simulated coordinator.
#[derive(Debug, Clone)]
pub struct SimulatedCoordinator {
    round: u64,
    tolerance_for_latency: Tick,

    /// Fraction of the population sampled per round
    proportion: f64,

    /// Population size the proportion applies to
    num_participants: usize,

    /// Private sampling stream
    rng: ChaCha8Rng,
}

impl SimulatedCoordinator {
    /// Creates a coordinator at round 0.
    pub fn new(config: &SimConfig, rng: ChaCha8Rng) -> Self {
        Self {
            round: 0,
            tolerance_for_latency: config.tolerance_for_latency,
            proportion: config.proportion.clamp(0.0, 1.0),
            num_participants: config.num_participants,
            rng,
        }
    }

    /// Participants requested per round, at least one.
    pub fn clients_per_round(&self) -> usize {
        ((self.proportion * self.num_participants as f64).round() as usize).max(1)
    }

    /// Advances to the next round.
    pub fn next_round(&mut self) {
        self.round += 1;
    }
}

impl Coordinator for SimulatedCoordinator {
    fn current_round(&self) -> u64 {
        self.round
    }

    fn tolerance_for_latency(&self) -> Tick {
        self.tolerance_for_latency
    }

    fn set_tolerance_for_latency(&mut self, tolerance: Tick) {
        self.tolerance_for_latency = tolerance;
    }

    fn test_labels(&self) -> Vec<u32> {
        (0..NUM_CLASSES).collect()
    }

    fn sample(&mut self, idle: &[ParticipantId]) -> Vec<ParticipantId> {
        let k = self.clients_per_round().min(idle.len());
        let mut picked: Vec<ParticipantId> = idle.choose_multiple(&mut self.rng, k).copied().collect();
        picked.sort_unstable();
        picked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn config(n: usize, proportion: f64) -> SimConfig {
        SimConfig {
            num_participants: n,
            proportion,
            ..Default::default()
        }
    }

    #[test]
    fn test_population_is_deterministic() {
        let config = config(8, 0.5);
        let a = SimulatedParticipant::population(&config, &mut ChaCha8Rng::seed_from_u64(1));
        let b = SimulatedParticipant::population(&config, &mut ChaCha8Rng::seed_from_u64(1));

        assert_eq!(a.len(), 8);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.data_volume(), y.data_volume());
            assert_eq!(x.labels(), y.labels());
            assert!((2..=5).contains(&x.labels().len()));
            assert!((50..=500).contains(&x.data_volume()));
        }
    }

    #[test]
    fn test_payload_size_grows_with_steps() {
        let mut p = SimulatedParticipant::new(ParticipantId(3), 4, 2, 100, vec![1, 2]);
        let full = p.train(0).size();
        p.set_num_steps(1);
        let small = p.train(1).size();

        assert!(full > small);
        assert_eq!(p.history(), &[(0, 4), (1, 1)]);
    }

    #[test]
    fn test_coordinator_samples_from_idle_only() {
        let mut c = SimulatedCoordinator::new(&config(10, 0.3), ChaCha8Rng::seed_from_u64(4));
        assert_eq!(c.clients_per_round(), 3);

        let idle = vec![ParticipantId(1), ParticipantId(4), ParticipantId(6), ParticipantId(9)];
        let picked = c.sample(&idle);
        assert_eq!(picked.len(), 3);
        assert!(picked.iter().all(|id| idle.contains(id)));

        let fewer = c.sample(&idle[..2]);
        assert_eq!(fewer.len(), 2);
    }

    #[test]
    fn test_coordinator_samples_at_least_one() {
        let c = SimulatedCoordinator::new(&config(10, 0.0), ChaCha8Rng::seed_from_u64(4));
        assert_eq!(c.clients_per_round(), 1);
    }

    #[test]
    fn test_coordinator_rounds() {
        let mut c = SimulatedCoordinator::new(&config(2, 1.0), ChaCha8Rng::seed_from_u64(4));
        assert_eq!(c.current_round(), 0);
        c.next_round();
        c.next_round();
        assert_eq!(c.current_round(), 2);
    }
}
