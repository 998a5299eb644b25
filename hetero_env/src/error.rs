//! Error types for the heterogeneity simulator.

use crate::types::{ParticipantId, Tick};
use thiserror::Error;

/// Errors that abort a simulation run.
///
/// Every variant is a programmer error or an invariant violation; nothing
/// here is expected to be recovered from mid-run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    /// Attempted to move the virtual clock backwards
    #[error("Cannot inverse time: current tick is {current}, requested {requested}")]
    TimeInversion { current: Tick, requested: Tick },

    /// Attempted to step the clock by a negative amount
    #[error("Cannot step time by a negative delta ({0})")]
    NegativeStep(Tick),

    /// State name outside the five participant states
    #[error("{0} not in the default states")]
    InvalidState(String),

    /// Variable name not tracked per participant
    #[error("Unknown participant variable: {0}")]
    UnknownVariable(String),

    /// Participant ID outside the simulated population
    #[error("Unknown participant: {0}")]
    UnknownParticipant(ParticipantId),

    /// `set_variable` called with mismatched lengths
    #[error("Length mismatch: {ids} participant ids but {values} values")]
    LengthMismatch { ids: usize, values: usize },

    /// Nobody became available within the idle wait bound
    #[error("No participant became available after waiting {0} ticks")]
    NoneAvailable(Tick),
}

impl SimError {
    /// Creates a time inversion error.
    pub fn inversion(current: Tick, requested: Tick) -> Self {
        Self::TimeInversion { current, requested }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(name: impl Into<String>) -> Self {
        Self::InvalidState(name.into())
    }
}
