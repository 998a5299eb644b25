//! Common types for the heterogeneity simulator.

use crate::error::SimError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One unit of virtual time.
///
/// Signed so that callers can express (and be rejected for) negative deltas.
pub type Tick = i64;

/// Stable identifier of a simulated participant.
///
/// IDs are dense indices `0..n` into the participant population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub usize);

impl ParticipantId {
    /// Returns the index of this participant in the population.
    pub fn index(&self) -> usize {
        self.0
    }

    /// Returns the IDs `0..n`.
    pub fn range(n: usize) -> Vec<ParticipantId> {
        (0..n).map(ParticipantId).collect()
    }
}

impl From<usize> for ParticipantId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The state of a participant at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    /// Not reachable; may come back through an availability draw
    Offline,

    /// Reachable and free to be selected
    Idle,

    /// Picked by the coordinator for the current round
    Selected,

    /// Computing or uploading a response
    Working,

    /// Lost connection mid-round; unreachable until the drop counter expires
    Dropped,
}

impl ClientState {
    /// All states, in declaration order.
    pub const ALL: [ClientState; 5] = [
        ClientState::Offline,
        ClientState::Idle,
        ClientState::Selected,
        ClientState::Working,
        ClientState::Dropped,
    ];

    /// Returns the lowercase state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Offline => "offline",
            ClientState::Idle => "idle",
            ClientState::Selected => "selected",
            ClientState::Working => "working",
            ClientState::Dropped => "dropped",
        }
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClientState {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(ClientState::Offline),
            "idle" => Ok(ClientState::Idle),
            "selected" => Ok(ClientState::Selected),
            "working" => Ok(ClientState::Working),
            "dropped" => Ok(ClientState::Dropped),
            other => Err(SimError::invalid_state(other)),
        }
    }
}

/// A single named value inside a participant response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Scalar(f64),
    Vector(Vec<f32>),
    Text(String),
}

impl PayloadValue {
    /// Approximate in-memory size of the value in bytes.
    pub fn size(&self) -> usize {
        match self {
            PayloadValue::Scalar(_) => std::mem::size_of::<f64>(),
            PayloadValue::Vector(v) => v.len() * std::mem::size_of::<f32>(),
            PayloadValue::Text(s) => s.len(),
        }
    }
}

/// The body of a participant response: named values produced by local work.
///
/// Opaque to the simulator except for its size, which feeds
/// size-sensitive responsiveness profiles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub values: BTreeMap<String, PayloadValue>,
}

impl Payload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named value, builder style.
    pub fn with(mut self, name: impl Into<String>, value: PayloadValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Inserts a named value.
    pub fn insert(&mut self, name: impl Into<String>, value: PayloadValue) {
        self.values.insert(name.into(), value);
    }

    /// Looks up a named value.
    pub fn get(&self, name: &str) -> Option<&PayloadValue> {
        self.values.get(name)
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.values.values().map(PayloadValue::size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_state_round_trips_names() {
        for state in ClientState::ALL {
            let parsed: ClientState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        let err = "sleeping".parse::<ClientState>().unwrap_err();
        assert_eq!(err, SimError::InvalidState("sleeping".to_string()));
    }

    #[test]
    fn test_payload_size() {
        let payload = Payload::new()
            .with("model", PayloadValue::Vector(vec![0.0; 10]))
            .with("loss", PayloadValue::Scalar(0.5));

        assert_eq!(payload.size(), 10 * 4 + 8);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&ClientState::Dropped).unwrap();
        assert_eq!(json, "\"dropped\"");
    }
}
