//! Participant communication pipeline.
//!
//! One coordinator round runs four typed stages in order:
//!
//! ```text
//! select ──> Selection ──dropout──> Survivors ──complete──> Responses ──collect──> Collected
//! ```
//!
//! - availability: wait until someone is idle, sample, keep only idle picks
//! - dropout: selected participants may drop out of the round
//! - completeness: survivors perform a possibly reduced workload
//! - clock: responses are queued at `now + latency` and collected, either
//!   immediately (asynchronous) or after a bounded wait (synchronous)
//!
//! Every stage consumes the previous one, so a round cannot skip or repeat
//! a stage.

use crate::clock::VirtualClock;
use crate::state::{ParticipantStates, Variable};

use hetero_env::{ClientState, Participant, ParticipantId, Payload, SimError, Tick};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Upper bound on ticks spent waiting for anyone to become idle.
pub const MAX_IDLE_WAIT: Tick = 1_000_000;

/// The clock type driving the pipeline.
pub type SimClock = VirtualClock<Package, ParticipantStates>;

/// How the coordinator waits for responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommMode {
    /// Wait up to the tolerance for the selected participants
    Synchronous,

    /// Take whatever has arrived by now and return
    Asynchronous,
}

impl CommMode {
    pub fn is_asynchronous(&self) -> bool {
        matches!(self, CommMode::Asynchronous)
    }
}

/// A participant response in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    /// Responding participant
    pub participant: ParticipantId,

    /// Tick at which the response reaches the coordinator
    pub arrival: Tick,

    /// Response body
    pub payload: Payload,
}

/// Output of the availability stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    /// Sampled participants that were idle, now `selected`
    pub selected: Vec<ParticipantId>,

    /// Sampled participants that were not idle
    pub unavailable: Vec<ParticipantId>,
}

/// Output of the dropout stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Survivors {
    /// Selected participants that stayed connected
    pub survivors: Vec<ParticipantId>,

    /// Selected participants that dropped out
    pub dropped: Vec<ParticipantId>,

    pub unavailable: Vec<ParticipantId>,
}

/// Output of the completeness stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Responses {
    /// Survivor responses, in selection order
    pub responses: Vec<(ParticipantId, Payload)>,

    pub dropped: Vec<ParticipantId>,
    pub unavailable: Vec<ParticipantId>,
}

/// Result of one `communicate` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collected {
    /// Packages received, in selection order for synchronous rounds and
    /// arrival order for asynchronous ones
    pub packages: Vec<Package>,

    /// Sampled but not idle
    pub unavailable: Vec<ParticipantId>,

    /// Dropped out this round
    pub dropped: Vec<ParticipantId>,

    /// Survivors whose response missed the synchronous deadline
    pub overdue: Vec<ParticipantId>,

    /// Ticks the clock advanced while collecting
    pub waited: Tick,
}

impl Collected {
    /// IDs of the participants whose packages were received.
    pub fn received(&self) -> Vec<ParticipantId> {
        self.packages.iter().map(|p| p.participant).collect()
    }
}

/// Availability stage.
///
/// Steps the clock one tick at a time until someone is idle, hands the idle
/// set to `sampler`, and marks the sampled idle participants `selected`.
/// Duplicate picks are kept once.
///
/// # Errors
///
/// - `SimError::NoneAvailable` - If nobody became idle within [`MAX_IDLE_WAIT`] ticks
pub fn select<F>(clock: &mut SimClock, sampler: F) -> Result<Selection, SimError>
where
    F: FnOnce(&[ParticipantId]) -> Vec<ParticipantId>,
{
    let mut waited = 0;
    while clock.state_updater().idle_clients().is_empty() {
        if waited >= MAX_IDLE_WAIT {
            return Err(SimError::NoneAvailable(waited));
        }
        clock.step(1)?;
        waited += 1;
    }
    if waited > 0 {
        debug!("Waited {} ticks for an idle participant", waited);
    }

    let idle = clock.state_updater().idle_clients();
    let idle_set: BTreeSet<ParticipantId> = idle.iter().copied().collect();
    let picked = sampler(&idle);

    let mut seen = BTreeSet::new();
    let mut selection = Selection::default();
    for id in picked {
        if !seen.insert(id) {
            continue;
        }
        if idle_set.contains(&id) {
            selection.selected.push(id);
        } else {
            selection.unavailable.push(id);
        }
    }
    if !selection.unavailable.is_empty() {
        info!(
            "The selected clients {:?} are not currently available.",
            selection.unavailable
        );
    }

    clock
        .state_updater_mut()
        .set_client_state(&selection.selected, ClientState::Selected)?;
    Ok(selection)
}

impl Selection {
    /// An empty selection, used to drain asynchronous arrivals.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Dropout stage: runs the connectivity profile and draws against
    /// `prob_drop` for every selected participant.
    ///
    /// # Errors
    ///
    /// - `SimError::NegativeStep` - If the tolerance is negative; no state is touched
    pub fn dropout(self, clock: &mut SimClock) -> Result<Survivors, SimError> {
        let tolerance = clock.state_updater().tolerance_for_latency();
        if tolerance < 0 {
            return Err(SimError::NegativeStep(tolerance));
        }
        let Selection { selected, unavailable } = self;
        if selected.is_empty() {
            return Ok(Survivors {
                unavailable,
                ..Default::default()
            });
        }

        let states = clock.state_updater_mut();
        states.update_client_connectivity(&selected);
        let probs = states.get_variable(&selected, Variable::ProbDrop)?;

        let mut survivors = Vec::with_capacity(selected.len());
        let mut dropped = Vec::new();
        for (id, p) in selected.into_iter().zip(probs) {
            if states.chance(p) {
                dropped.push(id);
            } else {
                survivors.push(id);
            }
        }
        states.set_client_state(&dropped, ClientState::Dropped)?;
        if !dropped.is_empty() {
            debug!("Clients {:?} dropped out", dropped);
        }

        Ok(Survivors {
            survivors,
            dropped,
            unavailable,
        })
    }
}

impl Survivors {
    /// Completeness stage: runs the completeness profile, then lets every
    /// survivor train with its `num_steps` temporarily replaced by its
    /// `working_amount`.
    ///
    /// # Errors
    ///
    /// - `SimError::UnknownParticipant` - If a survivor has no participant in `participants`
    pub fn complete<P: Participant>(
        self,
        clock: &mut SimClock,
        participants: &mut [P],
        round: u64,
    ) -> Result<Responses, SimError> {
        let states = clock.state_updater_mut();
        states.update_client_completeness(&self.survivors);

        let mut responses = Vec::with_capacity(self.survivors.len());
        for id in &self.survivors {
            let amount = states
                .working_amount(*id)
                .ok_or(SimError::UnknownParticipant(*id))?;
            let participant = participants
                .get_mut(id.index())
                .ok_or(SimError::UnknownParticipant(*id))?;

            let configured = participant.num_steps();
            participant.set_num_steps(amount);
            let payload = participant.train(round);
            participant.set_num_steps(configured);

            responses.push((*id, payload));
        }

        Ok(Responses {
            responses,
            dropped: self.dropped,
            unavailable: self.unavailable,
        })
    }
}

impl Responses {
    /// Clock stage: queues every response at `now + latency` and collects.
    ///
    /// Asynchronous collection returns what is due now and never advances
    /// the clock. Synchronous collection waits `tolerance` if anyone dropped
    /// out or would be late, otherwise the largest latency; late survivors
    /// are reset to idle and their queued packages discarded.
    pub fn collect(self, clock: &mut SimClock, mode: CommMode) -> Result<Collected, SimError> {
        let Responses {
            responses,
            dropped,
            unavailable,
        } = self;
        let tolerance = clock.state_updater().tolerance_for_latency();

        if !mode.is_asynchronous() && responses.is_empty() {
            let mut waited = 0;
            if !dropped.is_empty() {
                clock.step(tolerance)?;
                rearm_dropped(clock, &dropped)?;
                waited = tolerance;
            }
            return Ok(Collected {
                unavailable,
                dropped,
                waited,
                ..Default::default()
            });
        }

        let ids: Vec<ParticipantId> = responses.iter().map(|(id, _)| *id).collect();
        let sizes: Vec<f64> = responses.iter().map(|(_, p)| p.size() as f64).collect();
        {
            let states = clock.state_updater_mut();
            states.set_variable(&ids, Variable::PackageSize, &sizes)?;
            states.update_client_responsiveness(&ids);
            states.set_client_state(&ids, ClientState::Working)?;
        }

        let now = clock.current_time();
        for (id, payload) in responses {
            let arrival = now.saturating_add(clock.state_updater().latency(id));
            clock.put(
                Package {
                    participant: id,
                    arrival,
                    payload,
                },
                arrival,
            );
        }

        if mode.is_asynchronous() {
            return Ok(Collected {
                packages: clock.get_until(now),
                unavailable,
                dropped,
                ..Default::default()
            });
        }

        let max_latency = ids
            .iter()
            .map(|id| clock.state_updater().latency(*id))
            .max()
            .unwrap_or(0);
        let window = if !dropped.is_empty() || max_latency > tolerance {
            tolerance
        } else {
            max_latency
        };

        let due = clock.get_until(now.saturating_add(window));
        clock.step(window)?;

        let received: BTreeSet<ParticipantId> = due.iter().map(|p| p.participant).collect();
        let overdue: Vec<ParticipantId> = ids.iter().filter(|id| !received.contains(id)).copied().collect();
        if !overdue.is_empty() {
            let late: BTreeSet<ParticipantId> = overdue.iter().copied().collect();
            let purged = clock.conditionally_clear(|p| late.contains(&p.participant));
            clock
                .state_updater_mut()
                .set_client_state(&overdue, ClientState::Idle)?;
            info!(
                "Clients {:?} missed the deadline; {} queued packages discarded",
                overdue, purged
            );
        }
        rearm_dropped(clock, &dropped)?;

        let mut by_participant: BTreeMap<ParticipantId, Package> =
            due.into_iter().map(|p| (p.participant, p)).collect();
        let packages = ids.iter().filter_map(|id| by_participant.remove(id)).collect();

        Ok(Collected {
            packages,
            unavailable,
            dropped,
            overdue,
            waited: window,
        })
    }
}

/// Restarts the drop counter of participants still dropped once the
/// synchronous wait closes.
fn rearm_dropped(clock: &mut SimClock, dropped: &[ParticipantId]) -> Result<(), SimError> {
    let states = clock.state_updater_mut();
    let still: Vec<ParticipantId> = dropped
        .iter()
        .filter(|id| states.state(**id) == Some(ClientState::Dropped))
        .copied()
        .collect();
    states.set_client_state(&still, ClientState::Dropped)
}

/// Runs dropout, completeness and collection for an existing selection.
pub fn communicate<P: Participant>(
    clock: &mut SimClock,
    participants: &mut [P],
    selection: Selection,
    mode: CommMode,
    round: u64,
) -> Result<Collected, SimError> {
    selection
        .dropout(clock)?
        .complete(clock, participants, round)?
        .collect(clock, mode)
}
