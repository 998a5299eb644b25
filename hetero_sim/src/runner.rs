//! Scenario runner - executes heterogeneity scenarios end to end.
//!
//! Each run builds a fresh [`SimWorld`] from the scenario preset, drives it
//! for the configured number of rounds and checks the engine's invariants
//! after every exchange.

use crate::agent::{SimulatedCoordinator, SimulatedParticipant};
use crate::context::SimContext;
use crate::exporter::{RoundRecord, RunExport};
use crate::profiles::Axis;
use crate::protocol::{Collected, CommMode};
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};

use hetero_env::{ClientState, Coordinator, ParticipantId, SimError, Tick};
use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

type ScenarioWorld = SimWorld<SimulatedCoordinator, SimulatedParticipant>;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether every round kept the engine's invariants
    pub passed: bool,

    /// Rounds completed
    pub rounds: u64,

    /// Final virtual time
    pub final_time: Tick,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    /// Participants that entered a round
    pub selected: u64,

    /// Sampled participants that were not idle
    pub unavailable: u64,

    /// Participants that dropped out
    pub dropped: u64,

    /// Participants that missed a synchronous deadline
    pub overdue: u64,

    /// Packages delivered to the coordinator
    pub packages_received: u64,

    /// Ticks spent collecting, summed over rounds
    pub total_wait: Tick,

    /// Longest single collection wait
    pub max_wait: Tick,
}

impl ScenarioMetrics {
    fn record(&mut self, selected: usize, collected: &Collected) {
        self.selected += selected as u64;
        self.unavailable += collected.unavailable.len() as u64;
        self.dropped += collected.dropped.len() as u64;
        self.overdue += collected.overdue.len() as u64;
        self.packages_received += collected.packages.len() as u64;
        self.total_wait += collected.waited;
        self.max_wait = self.max_wait.max(collected.waited);
    }

    /// Fraction of selected participants whose package arrived.
    pub fn delivery_rate(&self) -> f64 {
        if self.selected == 0 {
            return 0.0;
        }
        self.packages_received as f64 / self.selected as f64
    }
}

/// Why a run stopped early.
#[derive(Debug, Error)]
enum RunFailure {
    #[error(transparent)]
    Sim(#[from] SimError),

    #[error("round {round}: {message}")]
    Invariant { round: u64, message: String },
}

fn ensure(condition: bool, round: u64, message: impl FnOnce() -> String) -> Result<(), RunFailure> {
    if condition {
        Ok(())
    } else {
        Err(RunFailure::Invariant {
            round,
            message: message(),
        })
    }
}

/// Runs heterogeneity scenarios.
pub struct ScenarioRunner {
    /// Base configuration each scenario preset is applied to
    base: SimConfig,

    /// Mode strings that replace the scenario's own
    overrides: Vec<(Axis, String)>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_participants: usize) -> Self {
        Self {
            base: SimConfig {
                seed,
                num_participants,
                ..Default::default()
            },
            overrides: Vec::new(),
        }
    }

    /// Starts from a full base configuration.
    pub fn from_config(base: SimConfig) -> Self {
        Self {
            base,
            overrides: Vec::new(),
        }
    }

    /// Sets the number of rounds.
    pub fn with_rounds(mut self, rounds: u64) -> Self {
        self.base.num_rounds = rounds;
        self
    }

    /// Replaces one axis' mode string in every scenario.
    pub fn with_override(mut self, axis: Axis, mode: impl Into<String>) -> Self {
        self.overrides.push((axis, mode.into()));
        self
    }

    /// Returns the effective configuration of `scenario`.
    pub fn config_for(&self, scenario: ScenarioId) -> SimConfig {
        let mut config = scenario.configure(&self.base);
        for (axis, mode) in &self.overrides {
            let slot = match axis {
                Axis::Availability => &mut config.availability,
                Axis::Connectivity => &mut config.connectivity,
                Axis::Completeness => &mut config.completeness,
                Axis::Responsiveness => &mut config.responsiveness,
            };
            *slot = mode.clone();
        }
        config
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, None)
    }

    /// Runs a scenario and records every round for export.
    pub fn run_with_export(&self, scenario: ScenarioId) -> (ScenarioResult, RunExport) {
        let mut export = RunExport::new(scenario.name(), &self.config_for(scenario));
        let result = self.execute(scenario, Some(&mut export));
        export.finalize(result.passed, result.final_time, result.failure_reason.clone());
        (result, export)
    }

    fn execute(&self, scenario: ScenarioId, mut export: Option<&mut RunExport>) -> ScenarioResult {
        let config = self.config_for(scenario);
        info!("Starting scenario: {} (seed={})", scenario.name(), config.seed);
        debug!("  {}", scenario.description());

        let mut context = SimContext::new(config.seed);
        let coordinator = SimulatedCoordinator::new(&config, context.next_rng());
        let participants = SimulatedParticipant::population(&config, &mut context.next_rng());
        let mut world = SimWorld::new(config.clone(), &mut context, coordinator, participants);

        let mut metrics = ScenarioMetrics::default();
        let outcome = match scenario.mode() {
            CommMode::Synchronous => drive_synchronous(&mut world, &mut metrics, &mut export),
            CommMode::Asynchronous => drive_periodic(&mut world, scenario.period(), &mut metrics, &mut export),
        };

        let rounds = world.coordinator().current_round();
        let failure_reason = outcome.err().map(|e| e.to_string());
        match &failure_reason {
            None => info!(
                "✓ {} complete: {} rounds, {} packages, delivery rate {:.2}, t={}",
                scenario.name(),
                rounds,
                metrics.packages_received,
                metrics.delivery_rate(),
                world.current_time()
            ),
            Some(reason) => warn!("✗ {} stopped: {}", scenario.name(), reason),
        }

        ScenarioResult {
            scenario,
            seed: config.seed,
            passed: failure_reason.is_none(),
            rounds,
            final_time: world.current_time(),
            failure_reason,
            metrics,
        }
    }
}

/// One synchronous exchange per round.
fn drive_synchronous(
    world: &mut ScenarioWorld,
    metrics: &mut ScenarioMetrics,
    export: &mut Option<&mut RunExport>,
) -> Result<(), RunFailure> {
    for _ in 0..world.config.num_rounds {
        let round = world.coordinator().current_round();
        let before = world.current_time();

        let selection = world.select()?;
        let selected = selection.selected.clone();
        check_selection(world, round, &selected)?;

        let collected = world.communicate_selection(selection, CommMode::Synchronous)?;
        let tolerance = world.coordinator().tolerance_for_latency();

        ensure(world.current_time() >= before, round, || "clock moved backwards".to_string())?;
        ensure(collected.waited <= tolerance, round, || {
            format!("waited {} ticks with tolerance {}", collected.waited, tolerance)
        })?;
        check_received(round, &selected, &collected)?;
        check_population(world, round)?;

        debug!(
            "round {} t={} | selected={} received={} dropped={} overdue={}",
            round,
            world.current_time(),
            selected.len(),
            collected.packages.len(),
            collected.dropped.len(),
            collected.overdue.len()
        );
        metrics.record(selected.len(), &collected);
        record_round(world, export, round, &selected, &collected);
        world.coordinator_mut().next_round();
    }
    Ok(())
}

/// Asynchronous pattern: one tick per iteration, sampling every `period`
/// ticks, draining arrivals every tick.
fn drive_periodic(
    world: &mut ScenarioWorld,
    period: u64,
    metrics: &mut ScenarioMetrics,
    export: &mut Option<&mut RunExport>,
) -> Result<(), RunFailure> {
    let period = period.max(1);
    let ticks = world.config.num_rounds * period;

    for tick in 0..ticks {
        let round = world.coordinator().current_round();
        let sampling = tick % period == 0;

        let selection = if sampling {
            world.select()?
        } else {
            Default::default()
        };
        let selected = selection.selected.clone();
        check_selection(world, round, &selected)?;

        let before = world.current_time();
        let collected = world.communicate_selection(selection, CommMode::Asynchronous)?;
        let now = world.current_time();

        ensure(now == before, round, || {
            format!("asynchronous exchange moved the clock from {} to {}", before, now)
        })?;
        ensure(collected.packages.iter().all(|p| p.arrival <= now), round, || {
            "asynchronous exchange returned a package from the future".to_string()
        })?;
        check_population(world, round)?;

        metrics.record(selected.len(), &collected);
        if sampling {
            record_round(world, export, round, &selected, &collected);
            world.coordinator_mut().next_round();
        }
        world.step(1)?;
    }
    Ok(())
}

fn check_selection(world: &ScenarioWorld, round: u64, selected: &[ParticipantId]) -> Result<(), RunFailure> {
    let states = world.states();
    ensure(
        selected.iter().all(|id| states.state(*id) == Some(ClientState::Selected)),
        round,
        || format!("selection {:?} is not entirely in the selected state", selected),
    )
}

fn check_received(round: u64, selected: &[ParticipantId], collected: &Collected) -> Result<(), RunFailure> {
    let effective: BTreeSet<ParticipantId> = selected.iter().copied().collect();
    let received = collected.received();
    ensure(received.iter().all(|id| effective.contains(id)), round, || {
        format!("received {:?} outside the selection {:?}", received, selected)
    })?;

    let order: Vec<ParticipantId> = selected.iter().filter(|id| received.contains(id)).copied().collect();
    ensure(order == received, round, || {
        format!("packages {:?} out of selection order {:?}", received, selected)
    })
}

fn check_population(world: &ScenarioWorld, round: u64) -> Result<(), RunFailure> {
    let states = world.states();
    let counted: usize = ClientState::ALL
        .iter()
        .map(|state| states.get_client_with_state(*state).len())
        .sum();
    ensure(counted == world.participant_count(), round, || {
        format!("{} state memberships for {} participants", counted, world.participant_count())
    })
}

fn record_round(
    world: &ScenarioWorld,
    export: &mut Option<&mut RunExport>,
    round: u64,
    selected: &[ParticipantId],
    collected: &Collected,
) {
    if let Some(export) = export.as_deref_mut() {
        let states = world.states();
        let record = RoundRecord::from_collected(round, world.current_time(), selected, collected)
            .with_population(states.idle_clients().len(), states.offline_clients().len());
        export.add_round(record);
    }
}
