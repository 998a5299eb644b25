//! Per-participant state machine.
//!
//! Every participant is in exactly one [`ClientState`] and carries a small
//! set of variables written by the heterogeneity profiles. Once per tick
//! the clock flushes [`ParticipantStates`], which resolves availability
//! churn, drop expiry and work completion from a single snapshot of the
//! previous tick.

use crate::clock::StateUpdater;
use crate::profiles::HeterogeneityStrategy;

use hetero_env::{ClientState, Participant, ParticipantId, SimError, Tick};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use tracing::{debug, info};

/// Named per-participant variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variable {
    /// Chance an offline participant comes back each evaluation
    ProbAvailable,

    /// Chance an idle participant goes offline each evaluation
    ProbUnavailable,

    /// Chance a selected participant drops out of the round
    ProbDrop,

    /// Local steps the participant performs when selected
    WorkingAmount,

    /// Ticks between starting work and the response arriving
    Latency,

    /// Size in bytes of the participant's latest response
    PackageSize,
}

impl Variable {
    /// All variables.
    pub const ALL: [Variable; 6] = [
        Variable::ProbAvailable,
        Variable::ProbUnavailable,
        Variable::ProbDrop,
        Variable::WorkingAmount,
        Variable::Latency,
        Variable::PackageSize,
    ];

    /// Returns the variable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Variable::ProbAvailable => "prob_available",
            Variable::ProbUnavailable => "prob_unavailable",
            Variable::ProbDrop => "prob_drop",
            Variable::WorkingAmount => "working_amount",
            Variable::Latency => "latency",
            Variable::PackageSize => "package_size",
        }
    }
}

impl std::fmt::Display for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Variable {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Variable::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| SimError::UnknownVariable(s.to_string()))
    }
}

/// Variable values of one participant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientVariables {
    pub prob_available: f64,
    pub prob_unavailable: f64,
    pub prob_drop: f64,
    pub working_amount: u64,
    pub latency: Tick,
    pub package_size: u64,
}

impl ClientVariables {
    fn new(num_steps: u64) -> Self {
        Self {
            prob_available: 1.0,
            prob_unavailable: 0.0,
            prob_drop: 0.0,
            working_amount: num_steps,
            latency: 0,
            package_size: 0,
        }
    }

    /// Reads a variable as a float.
    pub fn get(&self, var: Variable) -> f64 {
        match var {
            Variable::ProbAvailable => self.prob_available,
            Variable::ProbUnavailable => self.prob_unavailable,
            Variable::ProbDrop => self.prob_drop,
            Variable::WorkingAmount => self.working_amount as f64,
            Variable::Latency => self.latency as f64,
            Variable::PackageSize => self.package_size as f64,
        }
    }

    /// Writes a variable. Integer variables truncate toward zero and
    /// clamp at zero.
    pub fn set(&mut self, var: Variable, value: f64) {
        match var {
            Variable::ProbAvailable => self.prob_available = value,
            Variable::ProbUnavailable => self.prob_unavailable = value,
            Variable::ProbDrop => self.prob_drop = value,
            Variable::WorkingAmount => self.working_amount = value.max(0.0) as u64,
            Variable::Latency => self.latency = value.max(0.0) as Tick,
            Variable::PackageSize => self.package_size = value.max(0.0) as u64,
        }
    }
}

/// Countdown counters armed on state entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounter {
    /// Ticks left before a dropped participant re-enters the availability model
    pub dropped_counter: Tick,

    /// Ticks left before a working participant finishes
    pub latency_counter: Tick,
}

/// Static facts about a participant captured at construction.
///
/// Profiles read these instead of the live participant, so workload
/// overrides never compound across rounds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticipantTraits {
    /// Configured local workload
    pub num_steps: u64,

    /// Steps per local epoch
    pub steps_per_epoch: u64,

    /// Number of local samples
    pub data_volume: usize,

    /// Distinct labels held locally
    pub labels: BTreeSet<u32>,
}

impl ParticipantTraits {
    /// Snapshots a participant.
    pub fn of<P: Participant + ?Sized>(participant: &P) -> Self {
        Self {
            num_steps: participant.num_steps(),
            steps_per_epoch: participant.steps_per_epoch().max(1),
            data_volume: participant.data_volume(),
            labels: participant.labels().into_iter().collect(),
        }
    }

    /// Traits of a participant with a fixed workload and no data.
    pub fn with_steps(num_steps: u64) -> Self {
        Self {
            num_steps,
            steps_per_epoch: 1,
            ..Default::default()
        }
    }
}

/// States, variables and counters of the whole population.
///
/// Profile update functions receive this table mutably; it also owns the
/// private RNG behind every stochastic draw.
#[derive(Debug)]
pub struct ParticipantTable {
    states: Vec<ClientState>,
    variables: Vec<ClientVariables>,
    counters: Vec<StateCounter>,
    available: Vec<bool>,
    traits: Vec<ParticipantTraits>,

    /// Private deterministic random source
    rng: ChaCha8Rng,

    /// Re-evaluate idle/offline only once per coordinator round
    round_fixed_availability: bool,

    /// Round of the last idle/offline evaluation
    availability_latest_round: Option<u64>,

    /// Mirrors the coordinator's round
    current_round: u64,

    /// Mirrors the coordinator's tolerance, arms drop counters
    tolerance_for_latency: Tick,
}

impl ParticipantTable {
    /// Creates a table with every participant idle and ideal variables.
    pub fn new(traits: Vec<ParticipantTraits>, rng: ChaCha8Rng, tolerance_for_latency: Tick) -> Self {
        let n = traits.len();
        Self {
            states: vec![ClientState::Idle; n],
            variables: traits.iter().map(|t| ClientVariables::new(t.num_steps)).collect(),
            counters: vec![StateCounter::default(); n],
            available: vec![true; n],
            traits,
            rng,
            round_fixed_availability: false,
            availability_latest_round: None,
            current_round: 0,
            tolerance_for_latency,
        }
    }

    /// Number of participants.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true if there are no participants.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// All participant IDs.
    pub fn all_clients(&self) -> Vec<ParticipantId> {
        ParticipantId::range(self.len())
    }

    fn check(&self, id: ParticipantId) -> Result<usize, SimError> {
        if id.index() < self.len() {
            Ok(id.index())
        } else {
            Err(SimError::UnknownParticipant(id))
        }
    }

    fn check_all(&self, ids: &[ParticipantId]) -> Result<(), SimError> {
        ids.iter().try_for_each(|id| self.check(*id).map(|_| ()))
    }

    /// Participants currently in `state`, ascending by ID.
    pub fn get_client_with_state(&self, state: ClientState) -> Vec<ParticipantId> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == state)
            .map(|(i, _)| ParticipantId(i))
            .collect()
    }

    pub fn idle_clients(&self) -> Vec<ParticipantId> {
        self.get_client_with_state(ClientState::Idle)
    }

    pub fn working_clients(&self) -> Vec<ParticipantId> {
        self.get_client_with_state(ClientState::Working)
    }

    pub fn offline_clients(&self) -> Vec<ParticipantId> {
        self.get_client_with_state(ClientState::Offline)
    }

    pub fn selected_clients(&self) -> Vec<ParticipantId> {
        self.get_client_with_state(ClientState::Selected)
    }

    pub fn dropped_clients(&self) -> Vec<ParticipantId> {
        self.get_client_with_state(ClientState::Dropped)
    }

    /// Returns the state of one participant.
    pub fn state(&self, id: ParticipantId) -> Option<ClientState> {
        self.states.get(id.index()).copied()
    }

    /// Returns the counters of one participant.
    pub fn counter(&self, id: ParticipantId) -> Option<StateCounter> {
        self.counters.get(id.index()).copied()
    }

    /// Returns the variables of one participant.
    pub fn variables(&self, id: ParticipantId) -> Option<&ClientVariables> {
        self.variables.get(id.index())
    }

    /// Returns the construction-time traits of one participant.
    pub fn traits(&self, id: ParticipantId) -> Option<&ParticipantTraits> {
        self.traits.get(id.index())
    }

    /// Returns the availability flag mirrored from idle/offline transitions.
    pub fn is_available(&self, id: ParticipantId) -> bool {
        self.available.get(id.index()).copied().unwrap_or(false)
    }

    /// Moves `ids` into `state`, arming counters on entry.
    ///
    /// - `dropped`: drop counter = tolerance, latency counter = 0
    /// - `working`: latency counter = current latency, drop counter = 0
    /// - `idle`: both counters = 0
    ///
    /// # Errors
    ///
    /// - `SimError::UnknownParticipant` - If any ID is out of range; no
    ///   participant is changed in that case
    pub fn set_client_state(&mut self, ids: &[ParticipantId], state: ClientState) -> Result<(), SimError> {
        self.check_all(ids)?;
        for id in ids {
            self.apply_state(id.index(), state);
        }
        Ok(())
    }

    /// Like [`set_client_state`](Self::set_client_state) with a state name.
    ///
    /// # Errors
    ///
    /// - `SimError::InvalidState` - If `state` is not one of the five state names
    pub fn set_client_state_named(&mut self, ids: &[ParticipantId], state: &str) -> Result<(), SimError> {
        let state: ClientState = state.parse()?;
        self.set_client_state(ids, state)
    }

    fn apply_state(&mut self, i: usize, state: ClientState) {
        self.states[i] = state;
        let counter = &mut self.counters[i];
        match state {
            ClientState::Dropped => {
                counter.latency_counter = 0;
                counter.dropped_counter = self.tolerance_for_latency;
            }
            ClientState::Working => {
                counter.dropped_counter = 0;
                counter.latency_counter = self.variables[i].latency;
            }
            ClientState::Idle => {
                *counter = StateCounter::default();
                self.available[i] = true;
            }
            ClientState::Offline => {
                self.available[i] = false;
            }
            ClientState::Selected => {}
        }
    }

    /// Reads `var` for each of `ids`.
    pub fn get_variable(&self, ids: &[ParticipantId], var: Variable) -> Result<Vec<f64>, SimError> {
        ids.iter()
            .map(|id| self.check(*id).map(|i| self.variables[i].get(var)))
            .collect()
    }

    /// Writes `values[k]` into `var` of `ids[k]`.
    ///
    /// # Errors
    ///
    /// - `SimError::LengthMismatch` - If `ids` and `values` differ in length
    /// - `SimError::UnknownParticipant` - If any ID is out of range
    pub fn set_variable(&mut self, ids: &[ParticipantId], var: Variable, values: &[f64]) -> Result<(), SimError> {
        if ids.len() != values.len() {
            return Err(SimError::LengthMismatch {
                ids: ids.len(),
                values: values.len(),
            });
        }
        self.check_all(ids)?;
        for (id, value) in ids.iter().zip(values) {
            self.variables[id.index()].set(var, *value);
        }
        Ok(())
    }

    /// Writes the same value into `var` for every participant.
    pub fn fill_variable(&mut self, var: Variable, value: f64) {
        for vars in &mut self.variables {
            vars.set(var, value);
        }
    }

    /// Writes one variable of one participant, ignoring unknown IDs.
    pub fn assign(&mut self, id: ParticipantId, var: Variable, value: f64) {
        if let Some(vars) = self.variables.get_mut(id.index()) {
            vars.set(var, value);
        }
    }

    /// Sets `prob_available = p[k]` and `prob_unavailable = 1 - p[k]` for
    /// participant `k`. Extra entries are ignored.
    pub fn set_availability(&mut self, probs: &[f64]) {
        for (vars, p) in self.variables.iter_mut().zip(probs) {
            vars.prob_available = *p;
            vars.prob_unavailable = 1.0 - *p;
        }
    }

    /// Returns the current latency of one participant (0 if unknown).
    pub fn latency(&self, id: ParticipantId) -> Tick {
        self.variables.get(id.index()).map_or(0, |v| v.latency)
    }

    /// Returns the current working amount of one participant.
    pub fn working_amount(&self, id: ParticipantId) -> Option<u64> {
        self.variables.get(id.index()).map(|v| v.working_amount)
    }

    /// Largest latency across the population.
    pub fn max_latency(&self) -> Tick {
        self.variables.iter().map(|v| v.latency).max().unwrap_or(0)
    }

    /// Uniform draw in `(0, 1]`.
    pub fn draw(&mut self) -> f64 {
        1.0 - self.rng.gen::<f64>()
    }

    /// Returns true with probability `p`; `p <= 0` never fires, `p >= 1` always does.
    pub fn chance(&mut self, p: f64) -> bool {
        self.draw() <= p
    }

    /// The private RNG.
    pub fn rng_mut(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Marks availability as evaluated once per coordinator round.
    pub fn set_round_fixed_availability(&mut self, fixed: bool) {
        self.round_fixed_availability = fixed;
    }

    pub fn round_fixed_availability(&self) -> bool {
        self.round_fixed_availability
    }

    pub fn current_round(&self) -> u64 {
        self.current_round
    }

    /// Mirrors the coordinator's round.
    pub fn set_current_round(&mut self, round: u64) {
        self.current_round = round;
    }

    pub fn tolerance_for_latency(&self) -> Tick {
        self.tolerance_for_latency
    }

    /// Mirrors the coordinator's tolerance.
    pub fn set_tolerance_for_latency(&mut self, tolerance: Tick) {
        self.tolerance_for_latency = tolerance;
    }

    /// Resolves one tick of transitions. Every list is taken before any
    /// change is applied.
    fn resolve_tick(&mut self, now: Tick) {
        let offline = self.offline_clients();
        let idle = self.idle_clients();
        let dropped = self.dropped_clients();
        let working = self.working_clients();

        let round_advanced = self
            .availability_latest_round
            .map_or(true, |latest| self.current_round > latest);
        if idle.is_empty() || !self.round_fixed_availability || round_advanced {
            self.availability_latest_round = Some(self.current_round);

            let mut new_idle = Vec::new();
            for id in &offline {
                let p = self.variables[id.index()].prob_available;
                if self.chance(p) {
                    new_idle.push(*id);
                }
            }
            let mut new_offline = Vec::new();
            for id in &idle {
                let p = self.variables[id.index()].prob_unavailable;
                if self.chance(p) {
                    new_offline.push(*id);
                }
            }
            for id in &new_idle {
                self.apply_state(id.index(), ClientState::Idle);
            }
            for id in &new_offline {
                self.apply_state(id.index(), ClientState::Offline);
            }
            if !new_idle.is_empty() || !new_offline.is_empty() {
                debug!(
                    "t={}: {} participants came online, {} went offline",
                    now,
                    new_idle.len(),
                    new_offline.len()
                );
            }
        }

        for id in dropped {
            let i = id.index();
            self.counters[i].dropped_counter -= 1;
            if self.counters[i].dropped_counter < 0 {
                self.counters[i].dropped_counter = 0;
                self.apply_state(i, ClientState::Offline);
                let p = self.variables[i].prob_unavailable;
                if self.chance(p) {
                    info!("Client {} had just dropped out and is currently offline.", id);
                } else {
                    info!("Client {} had just dropped out and is currently available.", id);
                    self.apply_state(i, ClientState::Idle);
                }
            }
        }

        for id in working {
            let i = id.index();
            self.counters[i].latency_counter -= 1;
            if self.counters[i].latency_counter < 0 {
                self.counters[i].latency_counter = 0;
                let p = self.variables[i].prob_available;
                let next = if self.chance(p) {
                    ClientState::Idle
                } else {
                    ClientState::Offline
                };
                self.apply_state(i, next);
                debug!("t={}: client {} finished working and is {}", now, id, next);
            }
        }
    }
}

/// The state updater registered with the clock: the participant table
/// plus the strategy that evolves it.
pub struct ParticipantStates {
    table: ParticipantTable,
    strategy: HeterogeneityStrategy,
}

impl ParticipantStates {
    /// Binds a table to its heterogeneity strategy.
    pub fn new(table: ParticipantTable, strategy: HeterogeneityStrategy) -> Self {
        Self { table, strategy }
    }

    /// Runs the connectivity update for `ids`.
    pub fn update_client_connectivity(&mut self, ids: &[ParticipantId]) {
        (self.strategy.connectivity)(&mut self.table, ids);
    }

    /// Runs the completeness update for `ids`.
    pub fn update_client_completeness(&mut self, ids: &[ParticipantId]) {
        (self.strategy.completeness)(&mut self.table, ids);
    }

    /// Runs the responsiveness update for `ids`.
    pub fn update_client_responsiveness(&mut self, ids: &[ParticipantId]) {
        (self.strategy.responsiveness)(&mut self.table, ids);
    }

    /// Runs the availability update.
    pub fn update_client_availability(&mut self) {
        (self.strategy.availability)(&mut self.table);
    }
}

impl Deref for ParticipantStates {
    type Target = ParticipantTable;

    fn deref(&self) -> &Self::Target {
        &self.table
    }
}

impl DerefMut for ParticipantStates {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.table
    }
}

impl StateUpdater for ParticipantStates {
    fn flush(&mut self, now: Tick) {
        self.update_client_availability();
        self.table.resolve_tick(now);
    }
}

impl std::fmt::Debug for ParticipantStates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantStates")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}
