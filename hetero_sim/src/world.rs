//! SimWorld - The simulation context object.
//!
//! Owns the clock (and through it the participant state machine), the
//! coordinator and the participants. There is no process-wide state: every
//! operation goes through a `&mut SimWorld`.

use crate::clock::VirtualClock;
use crate::context::SimContext;
use crate::profiles::{HeterogeneityProfiles, ProfileEnv};
use crate::protocol::{self, CommMode, Collected, Package, Selection, SimClock};
use crate::state::{ParticipantStates, ParticipantTable, ParticipantTraits};

use hetero_env::{Coordinator, Participant, ParticipantId, SimError, Tick};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Configuration for a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of participants to simulate
    pub num_participants: usize,

    /// Availability mode string, e.g. `HOMO-0.2`
    pub availability: String,

    /// Connectivity mode string
    pub connectivity: String,

    /// Completeness mode string
    pub completeness: String,

    /// Responsiveness mode string
    pub responsiveness: String,

    /// Synchronous wait bound in ticks (0 = largest participant latency)
    pub tolerance_for_latency: Tick,

    /// Configured local steps per participant
    pub num_steps: u64,

    /// Local steps per epoch
    pub steps_per_epoch: u64,

    /// Fraction of the population sampled per round
    pub proportion: f64,

    /// Rounds to run
    pub num_rounds: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_participants: 10,
            availability: "IDL".to_string(),
            connectivity: "IDL".to_string(),
            completeness: "IDL".to_string(),
            responsiveness: "IDL".to_string(),
            tolerance_for_latency: 0,
            num_steps: 10,
            steps_per_epoch: 5,
            proportion: 0.2,
            num_rounds: 20,
        }
    }
}

/// Failure to load a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl SimConfig {
    /// Parses a JSON configuration; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values no run can use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tolerance_for_latency < 0 {
            return Err(ConfigError::Invalid(format!(
                "tolerance_for_latency must be non-negative, got {}",
                self.tolerance_for_latency
            )));
        }
        if !(0.0..=1.0).contains(&self.proportion) {
            return Err(ConfigError::Invalid(format!(
                "proportion must lie in [0, 1], got {}",
                self.proportion
            )));
        }
        Ok(())
    }

    /// Loads a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Sets all four mode strings.
    pub fn with_modes(mut self, availability: &str, connectivity: &str, completeness: &str, responsiveness: &str) -> Self {
        self.availability = availability.to_string();
        self.connectivity = connectivity.to_string();
        self.completeness = completeness.to_string();
        self.responsiveness = responsiveness.to_string();
        self
    }
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld<C, P> {
    /// Configuration
    pub config: SimConfig,

    /// Profiles in effect after installation
    profiles: HeterogeneityProfiles,

    /// Virtual clock owning the participant states
    clock: SimClock,

    coordinator: C,
    participants: Vec<P>,
}

impl<C: Coordinator, P: Participant> SimWorld<C, P> {
    /// Creates a world, installing the configured heterogeneity profiles.
    ///
    /// Takes two seeds from `context`: the first drives every state
    /// transition draw, the second one-shot profile initialization. A
    /// coordinator tolerance of 0 is replaced by the largest latency, and so
    /// is a negative one, with a warning.
    pub fn new(config: SimConfig, context: &mut SimContext, mut coordinator: C, participants: Vec<P>) -> Self {
        let traits: Vec<ParticipantTraits> = participants.iter().map(ParticipantTraits::of).collect();
        let mut table = ParticipantTable::new(traits, context.next_rng(), coordinator.tolerance_for_latency());
        table.set_current_round(coordinator.current_round());

        let mut env = ProfileEnv {
            global_labels: coordinator.test_labels().into_iter().collect(),
            rng: context.next_rng(),
        };
        let profiles = HeterogeneityProfiles::parse(
            &config.availability,
            &config.connectivity,
            &config.completeness,
            &config.responsiveness,
        );
        let (profiles, strategy) = profiles.install(&mut table, &mut env);

        if coordinator.tolerance_for_latency() < 0 {
            warn!(
                "Negative tolerance for latency ({}) ignored",
                coordinator.tolerance_for_latency()
            );
        }
        if coordinator.tolerance_for_latency() <= 0 {
            let tolerance = table.max_latency();
            coordinator.set_tolerance_for_latency(tolerance);
            table.set_tolerance_for_latency(tolerance);
            info!("Tolerance for latency derived from participants: {} ticks", tolerance);
        }

        let clock = VirtualClock::new().register_state_updater(ParticipantStates::new(table, strategy));
        let mut world = Self {
            config,
            profiles,
            clock,
            coordinator,
            participants,
        };
        world.publish_availability();
        world
    }

    /// Mirrors the coordinator's round and tolerance into the state table.
    fn sync_coordinator(&mut self) {
        let round = self.coordinator.current_round();
        let tolerance = self.coordinator.tolerance_for_latency();
        let states = self.clock.state_updater_mut();
        states.set_current_round(round);
        states.set_tolerance_for_latency(tolerance);
    }

    /// Pushes every participant's availability flag.
    fn publish_availability(&mut self) {
        let states = self.clock.state_updater();
        for (i, participant) in self.participants.iter_mut().enumerate() {
            participant.set_available(states.is_available(ParticipantId(i)));
        }
    }

    /// Availability stage with the coordinator's own sampler.
    pub fn select(&mut self) -> Result<Selection, SimError> {
        self.sync_coordinator();
        let coordinator = &mut self.coordinator;
        let selection = protocol::select(&mut self.clock, |idle| coordinator.sample(idle));
        self.publish_availability();
        selection
    }

    /// Runs a full exchange with `candidates`.
    ///
    /// Non-idle candidates are reported unavailable. An empty candidate
    /// list skips the availability stage, so an asynchronous call with no
    /// candidates only drains arrivals.
    pub fn communicate(&mut self, candidates: &[ParticipantId], mode: CommMode) -> Result<Collected, SimError> {
        self.sync_coordinator();
        let selection = if candidates.is_empty() {
            Selection::empty()
        } else {
            protocol::select(&mut self.clock, |_| candidates.to_vec())?
        };
        self.communicate_selection(selection, mode)
    }

    /// Runs dropout, completeness and collection for an existing selection.
    pub fn communicate_selection(&mut self, selection: Selection, mode: CommMode) -> Result<Collected, SimError> {
        self.sync_coordinator();
        let round = self.coordinator.current_round();
        let collected = protocol::communicate(&mut self.clock, &mut self.participants, selection, mode, round);
        self.publish_availability();
        collected
    }

    /// Advances virtual time by `delta` ticks.
    pub fn step(&mut self, delta: Tick) -> Result<(), SimError> {
        self.sync_coordinator();
        self.clock.step(delta)?;
        self.publish_availability();
        Ok(())
    }

    /// Drains packages due by now without sampling anyone.
    pub fn drain_arrivals(&mut self) -> Vec<Package> {
        self.clock.get_sofar()
    }

    /// Returns the current tick.
    pub fn current_time(&self) -> Tick {
        self.clock.current_time()
    }

    /// Returns the participant state machine.
    pub fn states(&self) -> &ParticipantStates {
        self.clock.state_updater()
    }

    /// Returns the participant state machine mutably.
    pub fn states_mut(&mut self) -> &mut ParticipantStates {
        self.clock.state_updater_mut()
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut SimClock {
        &mut self.clock
    }

    pub fn coordinator(&self) -> &C {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut C {
        &mut self.coordinator
    }

    pub fn participants(&self) -> &[P] {
        &self.participants
    }

    /// Returns the resolved heterogeneity profiles.
    pub fn profiles(&self) -> &HeterogeneityProfiles {
        &self.profiles
    }

    /// Returns the number of participants.
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{SimulatedCoordinator, SimulatedParticipant};
    use crate::profiles::{AvailabilityMode, ConnectivityMode, ResponsivenessMode};
    use crate::state::Variable;
    use hetero_env::ClientState;

    type TestWorld = SimWorld<SimulatedCoordinator, SimulatedParticipant>;

    fn build(config: SimConfig) -> TestWorld {
        let mut context = SimContext::new(config.seed);
        let coordinator = SimulatedCoordinator::new(&config, context.next_rng());
        let participants = SimulatedParticipant::population(&config, &mut context.next_rng());
        SimWorld::new(config, &mut context, coordinator, participants)
    }

    #[test]
    fn test_sim_world_creation() {
        let world = build(SimConfig {
            num_participants: 3,
            ..Default::default()
        });

        assert_eq!(world.participant_count(), 3);
        assert_eq!(world.current_time(), 0);
        assert_eq!(world.states().idle_clients().len(), 3);
        assert_eq!(world.profiles(), &HeterogeneityProfiles::default());
    }

    #[test]
    fn test_zero_tolerance_derives_from_latency() {
        let config = SimConfig::default().with_modes("IDL", "IDL", "IDL", "UNI-5-6");
        let world = build(config);

        assert_eq!(
            world.profiles().responsiveness,
            ResponsivenessMode::Uniform { min: 5.0, max: 6.0 }
        );
        assert_eq!(world.coordinator().tolerance_for_latency(), 5);
        assert_eq!(world.states().tolerance_for_latency(), 5);
    }

    #[test]
    fn test_explicit_tolerance_is_kept() {
        let config = SimConfig {
            tolerance_for_latency: 3,
            ..SimConfig::default().with_modes("IDL", "IDL", "IDL", "UNI-5-6")
        };
        let world = build(config);
        assert_eq!(world.coordinator().tolerance_for_latency(), 3);
    }

    #[test]
    fn test_sim_world_determinism() {
        let config = SimConfig::default().with_modes("LN-0.5", "HOMO-0.3", "PDU", "LN-50-20");
        let mut a = build(config.clone());
        let mut b = build(config);

        for _ in 0..5 {
            let sa = a.select().unwrap();
            let sb = b.select().unwrap();
            assert_eq!(sa, sb);

            let ca = a.communicate_selection(sa, CommMode::Synchronous).unwrap();
            let cb = b.communicate_selection(sb, CommMode::Synchronous).unwrap();
            assert_eq!(ca, cb);
            assert_eq!(a.current_time(), b.current_time());

            a.coordinator_mut().next_round();
            b.coordinator_mut().next_round();
        }
    }

    #[test]
    fn test_out_of_range_mode_reports_ideal() {
        let world = build(SimConfig {
            num_participants: 1,
            ..SimConfig::default().with_modes("IDL", "HOMO-2", "IDL", "IDL")
        });

        assert_eq!(world.profiles().connectivity, ConnectivityMode::Ideal);
        assert_eq!(
            world
                .states()
                .get_variable(&[ParticipantId(0)], Variable::ProbDrop)
                .unwrap(),
            vec![0.0]
        );
    }

    #[test]
    fn test_negative_tolerance_is_derived_from_latency() {
        let config = SimConfig {
            tolerance_for_latency: -5,
            ..SimConfig::default().with_modes("IDL", "HOMO-1.0", "IDL", "UNI-5-6")
        };
        let mut world = build(config);
        assert_eq!(world.coordinator().tolerance_for_latency(), 5);

        let collected = world.communicate(&[ParticipantId(1)], CommMode::Synchronous).unwrap();
        assert_eq!(collected.dropped, vec![ParticipantId(1)]);
        assert_eq!(world.current_time(), 5);
    }

    #[test]
    fn test_bad_modes_fall_back_to_ideal() {
        let world = build(SimConfig::default().with_modes("NOPE", "HOMO-2", "", "UNI-a"));
        assert_eq!(world.profiles(), &HeterogeneityProfiles::default());
    }

    #[test]
    fn test_availability_is_published_to_participants() {
        let mut world = build(SimConfig {
            num_participants: 4,
            ..Default::default()
        });
        world
            .states_mut()
            .set_client_state(&[ParticipantId(1)], ClientState::Offline)
            .unwrap();
        world.states_mut().set_availability(&[1.0, 0.0, 1.0, 1.0]);

        world.step(1).unwrap();

        assert!(!world.participants()[1].is_available());
        assert!(world.participants()[0].is_available());
    }

    #[test]
    fn test_communicate_filters_unavailable_candidates() {
        let mut world = build(SimConfig {
            num_participants: 3,
            tolerance_for_latency: 4,
            ..Default::default()
        });
        world
            .states_mut()
            .set_client_state(&[ParticipantId(2)], ClientState::Offline)
            .unwrap();

        let collected = world
            .communicate(&ParticipantId::range(3), CommMode::Synchronous)
            .unwrap();
        assert_eq!(collected.unavailable, vec![ParticipantId(2)]);
        assert_eq!(collected.received(), vec![ParticipantId(0), ParticipantId(1)]);
    }

    #[test]
    fn test_round_fixed_profiles_follow_coordinator_round() {
        let mut world = build(SimConfig::default().with_modes("YC-1.0", "IDL", "IDL", "IDL"));
        assert_eq!(world.profiles().availability, AvailabilityMode::YCycle { beta: 1.0 });
        assert!(world.states().round_fixed_availability());

        world.coordinator_mut().next_round();
        world.step(1).unwrap();
        assert_eq!(world.states().current_round(), 1);
    }

    #[test]
    fn test_config_from_json() {
        let config = SimConfig::from_json_str(r#"{"seed": 7, "availability": "HOMO-0.5"}"#).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.availability, "HOMO-0.5");
        assert_eq!(config.num_participants, SimConfig::default().num_participants);

        assert!(matches!(
            SimConfig::from_json_str("{"),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            SimConfig::from_json_str(r#"{"tolerance_for_latency": -5}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SimConfig::from_json_str(r#"{"proportion": 1.5}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SimConfig::from_json_file("/nonexistent/config.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
