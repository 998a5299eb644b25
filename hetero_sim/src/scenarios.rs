//! Heterogeneity scenarios.
//!
//! Each scenario is a preset on top of a base [`SimConfig`]: the four
//! profile mode strings, a tolerance and a communication mode.

use crate::protocol::CommMode;
use crate::world::SimConfig;

use hetero_env::Tick;
use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// Every participant always available, connected and instant
    Ideal,

    /// Homogeneous dropout with uniform latencies
    Dropout,

    /// Heavy-tailed latencies against a tight deadline
    Stragglers,

    /// Log-normal availability churn
    Churn,

    /// Availability following a day-like cycle over rounds
    Diurnal,

    /// Partial local work in most rounds
    Incomplete,

    /// Latency proportional to response size
    Bandwidth,

    /// Asynchronous coordinator draining every tick, sampling periodically
    AsyncPeriodic,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Ideal,
            ScenarioId::Dropout,
            ScenarioId::Stragglers,
            ScenarioId::Churn,
            ScenarioId::Diurnal,
            ScenarioId::Incomplete,
            ScenarioId::Bandwidth,
            ScenarioId::AsyncPeriodic,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Ideal => "ideal",
            ScenarioId::Dropout => "dropout",
            ScenarioId::Stragglers => "stragglers",
            ScenarioId::Churn => "churn",
            ScenarioId::Diurnal => "diurnal",
            ScenarioId::Incomplete => "incomplete",
            ScenarioId::Bandwidth => "bandwidth",
            ScenarioId::AsyncPeriodic => "async_periodic",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Ideal => "No heterogeneity: every round collects every selected participant instantly",
            ScenarioId::Dropout => "30% of selected participants drop out, latencies uniform in [0, 8)",
            ScenarioId::Stragglers => "Log-normal latencies (mean 20, var 200) against a 25-tick deadline",
            ScenarioId::Churn => "Log-normal active rates, re-evaluated once per round",
            ScenarioId::Diurnal => "Sine-modulated availability over a 24-round cycle",
            ScenarioId::Incomplete => "70% of rounds run a uniformly reduced workload",
            ScenarioId::Bandwidth => "Latency is response size over 512 bytes per tick",
            ScenarioId::AsyncPeriodic => "Asynchronous collection every tick, sampling every 3 ticks",
        }
    }

    /// Mode strings as `(availability, connectivity, completeness, responsiveness)`.
    pub fn modes(&self) -> (&'static str, &'static str, &'static str, &'static str) {
        match self {
            ScenarioId::Ideal => ("IDL", "IDL", "IDL", "IDL"),
            ScenarioId::Dropout => ("IDL", "HOMO-0.3", "IDL", "UNI-0-8"),
            ScenarioId::Stragglers => ("IDL", "IDL", "IDL", "LN-20-200"),
            ScenarioId::Churn => ("LN-0.5", "IDL", "IDL", "UNI-0-4"),
            ScenarioId::Diurnal => ("SLN-0.2", "IDL", "IDL", "UNI-0-4"),
            ScenarioId::Incomplete => ("IDL", "IDL", "PDU-0.7", "UNI-0-4"),
            ScenarioId::Bandwidth => ("IDL", "IDL", "ADU-1-3", "BW-512"),
            ScenarioId::AsyncPeriodic => ("HOMO-0.1", "HOMO-0.05", "IDL", "UNI-0-12"),
        }
    }

    /// Synchronous wait bound; 0 derives it from the slowest participant.
    pub fn tolerance(&self) -> Tick {
        match self {
            ScenarioId::Ideal => 10,
            ScenarioId::Dropout => 10,
            ScenarioId::Stragglers => 25,
            ScenarioId::Churn | ScenarioId::Diurnal | ScenarioId::Incomplete => 0,
            ScenarioId::Bandwidth => 12,
            ScenarioId::AsyncPeriodic => 0,
        }
    }

    /// How the coordinator collects responses.
    pub fn mode(&self) -> CommMode {
        match self {
            ScenarioId::AsyncPeriodic => CommMode::Asynchronous,
            _ => CommMode::Synchronous,
        }
    }

    /// Ticks between samplings for asynchronous scenarios.
    pub fn period(&self) -> u64 {
        match self {
            ScenarioId::AsyncPeriodic => 3,
            _ => 1,
        }
    }

    /// Applies this scenario's preset to `base`.
    pub fn configure(&self, base: &SimConfig) -> SimConfig {
        let (availability, connectivity, completeness, responsiveness) = self.modes();
        SimConfig {
            tolerance_for_latency: self.tolerance(),
            ..base.clone()
        }
        .with_modes(availability, connectivity, completeness, responsiveness)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "ideal" | "idl" => Ok(ScenarioId::Ideal),
            "dropout" => Ok(ScenarioId::Dropout),
            "stragglers" | "straggler" => Ok(ScenarioId::Stragglers),
            "churn" => Ok(ScenarioId::Churn),
            "diurnal" => Ok(ScenarioId::Diurnal),
            "incomplete" => Ok(ScenarioId::Incomplete),
            "bandwidth" | "bw" => Ok(ScenarioId::Bandwidth),
            "async_periodic" | "asyncperiodic" | "async" => Ok(ScenarioId::AsyncPeriodic),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert_eq!("async-periodic".parse::<ScenarioId>(), Ok(ScenarioId::AsyncPeriodic));
        assert!("everything".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_configure_keeps_base_fields() {
        let base = SimConfig {
            seed: 9,
            num_participants: 33,
            ..Default::default()
        };
        let config = ScenarioId::Dropout.configure(&base);

        assert_eq!(config.seed, 9);
        assert_eq!(config.num_participants, 33);
        assert_eq!(config.connectivity, "HOMO-0.3");
        assert_eq!(config.tolerance_for_latency, 10);
    }

    #[test]
    fn test_only_async_periodic_is_asynchronous() {
        for scenario in ScenarioId::all() {
            assert_eq!(
                scenario.mode() == CommMode::Asynchronous,
                scenario == ScenarioId::AsyncPeriodic
            );
        }
    }
}
