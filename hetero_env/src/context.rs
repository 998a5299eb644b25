//! Collaborator interfaces the simulator is embedded in.
//!
//! The simulator never trains models or loads data itself. It drives a
//! coordinator and a population of participants through these traits, so
//! the same engine can sit under a real federated-learning loop or under
//! the lightweight stand-ins shipped with `hetero_sim`.

use crate::types::{ParticipantId, Payload, Tick};

/// The central coordinator whose rounds the simulator paces.
pub trait Coordinator {
    /// Returns the current round number.
    ///
    /// Round-fixed availability profiles re-evaluate participants only
    /// when this value advances.
    fn current_round(&self) -> u64;

    /// Maximum ticks a synchronous round waits before declaring
    /// participants overdue.
    fn tolerance_for_latency(&self) -> Tick;

    /// Overrides the tolerance.
    ///
    /// Called once at initialization when the configured tolerance is 0,
    /// with the largest participant latency.
    fn set_tolerance_for_latency(&mut self, tolerance: Tick);

    /// Labels of the coordinator's held-out data.
    ///
    /// Only consulted by label-distribution availability profiles.
    fn test_labels(&self) -> Vec<u32> {
        Vec::new()
    }

    /// Picks this round's participants from the idle set.
    ///
    /// Picks outside `idle` are reported as unavailable and skipped.
    fn sample(&mut self, idle: &[ParticipantId]) -> Vec<ParticipantId> {
        idle.to_vec()
    }
}

/// A simulated remote compute unit.
pub trait Participant {
    /// Configured local workload, in optimization steps.
    fn num_steps(&self) -> u64;

    /// Replaces the local workload.
    ///
    /// The completeness stage uses this to throttle one training call and
    /// then restores the previous value.
    fn set_num_steps(&mut self, steps: u64);

    /// Steps making up one local epoch.
    fn steps_per_epoch(&self) -> u64 {
        1
    }

    /// Number of local samples.
    fn data_volume(&self) -> usize {
        0
    }

    /// Labels held by the participant (training and validation data).
    fn labels(&self) -> Vec<u32> {
        Vec::new()
    }

    /// Receives the availability flag mirrored from the state machine.
    fn set_available(&mut self, _available: bool) {}

    /// Runs local work for `round` and returns the response body.
    fn train(&mut self, round: u64) -> Payload;
}
