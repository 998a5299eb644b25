//! Heterogeneity profiles.
//!
//! A profile is a stochastic model for one axis of participant behavior:
//! availability, connectivity, completeness or responsiveness. Profiles
//! are selected with mode strings of the form `NAME-param1-param2...`
//! (for example `HOMO-0.3` or `LN-100-10`) and resolved once at
//! construction into a [`HeterogeneityStrategy`]: initial variable values
//! plus at most one per-round update closure per axis.
//!
//! Unknown modes and bad parameters never abort a run. They are logged and
//! the axis falls back to the ideal (`IDL`) profile.

use crate::state::{ParticipantTable, Variable};

use hetero_env::{ParticipantId, SimError, Tick};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, LogNormal};
use std::collections::BTreeSet;
use std::f64::consts::PI;
use thiserror::Error;
use tracing::{info, warn};

/// Period, in rounds, of the cyclic availability profiles.
const CYCLE_ROUNDS: u64 = 24;

/// Keeps `-ln(1 - beta)` finite in the log-normal availability profiles.
const LOGNORMAL_EPSILON: f64 = 0.000001;

/// Per-round availability update.
pub type AvailabilityUpdate = Box<dyn FnMut(&mut ParticipantTable)>;

/// Update applied to the participants of the current round.
pub type ParticipantUpdate = Box<dyn FnMut(&mut ParticipantTable, &[ParticipantId])>;

/// The live behavior of every axis, fixed at construction.
pub struct HeterogeneityStrategy {
    /// Runs at the start of every flush
    pub availability: AvailabilityUpdate,

    /// Runs for the selected participants before dropout draws
    pub connectivity: ParticipantUpdate,

    /// Runs for the surviving participants before local work
    pub completeness: ParticipantUpdate,

    /// Runs for the surviving participants once their responses are sized
    pub responsiveness: ParticipantUpdate,
}

impl HeterogeneityStrategy {
    /// A strategy in which no axis changes between rounds.
    pub fn ideal() -> Self {
        Self {
            availability: Box::new(|_| {}),
            connectivity: Box::new(|_, _| {}),
            completeness: Box::new(|_, _| {}),
            responsiveness: Box::new(|_, _| {}),
        }
    }
}

impl Default for HeterogeneityStrategy {
    fn default() -> Self {
        Self::ideal()
    }
}

/// One axis of heterogeneity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Availability,
    Connectivity,
    Completeness,
    Responsiveness,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Axis::Availability => "Availability",
            Axis::Connectivity => "Connectivity",
            Axis::Completeness => "Completeness",
            Axis::Responsiveness => "Responsiveness",
        };
        f.write_str(name)
    }
}

/// Reasons a profile could not be resolved or installed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProfileError {
    #[error("unknown {axis} mode {name:?}")]
    UnknownMode { axis: Axis, name: String },

    #[error("{mode}: cannot parse parameter {raw:?}")]
    BadParameter { mode: String, raw: String },

    #[error("{mode}: expected at most {max} parameters, got {got}")]
    TooManyParameters { mode: String, max: usize, got: usize },

    #[error("{mode}: parameter {name}={value} is out of range")]
    OutOfRange {
        mode: &'static str,
        name: &'static str,
        value: f64,
    },

    #[error("{mode}: {reason}")]
    Distribution { mode: &'static str, reason: String },

    #[error(transparent)]
    Sim(#[from] SimError),
}

/// A parsed `NAME-param1-param2...` mode string.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeString {
    pub name: String,
    pub params: Vec<f64>,
}

impl ModeString {
    /// Splits a mode string on `-`. An empty string means `IDL`.
    pub fn parse(raw: &str) -> Result<Self, ProfileError> {
        let mut parts = raw.trim().split('-');
        let name = match parts.next().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => "IDL".to_string(),
        };
        let params = parts
            .map(|p| {
                p.trim().parse::<f64>().map_err(|_| ProfileError::BadParameter {
                    mode: name.clone(),
                    raw: p.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { name, params })
    }

    /// Returns parameter `idx`, or `default` when absent.
    fn param(&self, idx: usize, default: f64) -> f64 {
        self.params.get(idx).copied().unwrap_or(default)
    }

    fn expect_at_most(&self, max: usize) -> Result<(), ProfileError> {
        if self.params.len() > max {
            return Err(ProfileError::TooManyParameters {
                mode: self.name.clone(),
                max,
                got: self.params.len(),
            });
        }
        Ok(())
    }
}

fn unit_interval(mode: &'static str, name: &'static str, value: f64) -> Result<f64, ProfileError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ProfileError::OutOfRange { mode, name, value })
    }
}

fn non_negative(mode: &'static str, name: &'static str, value: f64) -> Result<f64, ProfileError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ProfileError::OutOfRange { mode, name, value })
    }
}

fn positive(mode: &'static str, name: &'static str, value: f64) -> Result<f64, ProfileError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ProfileError::OutOfRange { mode, name, value })
    }
}

/// Resources available to profile initializers.
pub struct ProfileEnv {
    /// Labels of the coordinator's held-out data
    pub global_labels: BTreeSet<u32>,

    /// RNG for one-shot draws made at initialization
    pub rng: ChaCha8Rng,
}

/// Log-normal weights `T_i ~ LogNormal(0, -ln(1 - beta))`, scaled so the largest is 1.
fn lognormal_weights(mode: &'static str, beta: f64, n: usize, rng: &mut ChaCha8Rng) -> Result<Vec<f64>, ProfileError> {
    if !(0.0..1.0).contains(&beta) {
        return Err(ProfileError::OutOfRange { mode, name: "beta", value: beta });
    }
    let sigma = -(1.0 - beta - LOGNORMAL_EPSILON).ln();
    let dist = LogNormal::new(0.0, sigma).map_err(|e| ProfileError::Distribution {
        mode,
        reason: e.to_string(),
    })?;
    let samples: Vec<f64> = (0..n).map(|_| dist.sample(rng)).collect();
    let max = samples.iter().copied().fold(f64::MIN_POSITIVE, f64::max);
    Ok(samples.into_iter().map(|t| t / max).collect())
}

/// Parses a mode for `axis`, falling back to the ideal profile with a warning.
pub fn parse_or_ideal<M>(axis: Axis, raw: &str) -> M
where
    M: std::str::FromStr<Err = ProfileError> + Default,
{
    raw.parse().unwrap_or_else(|e| {
        warn!("{} mode {:?} rejected ({}); falling back to IDL", axis, raw, e);
        M::default()
    })
}

// ── Availability ──────────────────────────────────────────────────────

/// How participants come and go.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum AvailabilityMode {
    /// Always available
    #[default]
    Ideal,

    /// Participants whose smallest label is larger show up more often
    YMaxFirst { beta: f64 },

    /// Participants with more data show up more often
    MoreDataFirst { beta: f64 },

    /// Participants with less data show up more often
    LessDataFirst { beta: f64 },

    /// Participants holding fewer label classes show up less often
    YFewerFirst { beta: f64 },

    /// Everyone shares the active rate `1 - beta`
    Homogeneous { beta: f64 },

    /// Active rates drawn from a log-normal distribution
    LogNormal { beta: f64 },

    /// Log-normal active rates modulated by a sine wave over rounds
    SinLogNormal { beta: f64 },

    /// Participants are favored while the round phase covers their label range
    YCycle { beta: f64 },
}

impl AvailabilityMode {
    /// Resolves a parsed mode string.
    pub fn from_mode(mode: &ModeString) -> Result<Self, ProfileError> {
        mode.expect_at_most(1)?;
        let parsed = match mode.name.as_str() {
            "IDL" => AvailabilityMode::Ideal,
            "YMF" => AvailabilityMode::YMaxFirst { beta: mode.param(0, 0.1) },
            "MDF" => AvailabilityMode::MoreDataFirst { beta: mode.param(0, 0.0001) },
            "LDF" => AvailabilityMode::LessDataFirst { beta: mode.param(0, 0.5) },
            "YFF" => AvailabilityMode::YFewerFirst { beta: mode.param(0, 0.2) },
            "HOMO" => AvailabilityMode::Homogeneous { beta: mode.param(0, 0.2) },
            "LN" => AvailabilityMode::LogNormal { beta: mode.param(0, 0.1) },
            "SLN" => AvailabilityMode::SinLogNormal { beta: mode.param(0, 0.1) },
            "YC" => AvailabilityMode::YCycle { beta: mode.param(0, 0.5) },
            other => {
                return Err(ProfileError::UnknownMode {
                    axis: Axis::Availability,
                    name: other.to_string(),
                })
            }
        };
        Ok(parsed)
    }

    /// Sets initial probabilities and returns the per-round update, if any.
    pub fn install(
        &self,
        table: &mut ParticipantTable,
        env: &mut ProfileEnv,
    ) -> Result<Option<AvailabilityUpdate>, ProfileError> {
        let n = table.len();
        let traits: Vec<_> = table
            .all_clients()
            .into_iter()
            .filter_map(|id| table.traits(id).cloned())
            .collect();
        let label_num = env.global_labels.len();

        let probs: Vec<f64> = match *self {
            AvailabilityMode::Ideal => {
                table.set_availability(&vec![1.0; n]);
                return Ok(None);
            }
            AvailabilityMode::YMaxFirst { beta } => {
                let beta = unit_interval("YMF", "beta", beta)?;
                let denom = label_num.saturating_sub(1).max(1) as f64;
                traits
                    .iter()
                    .map(|t| {
                        let min_label = t.labels.iter().next().copied().unwrap_or(0) as f64;
                        beta * min_label / denom + (1.0 - beta)
                    })
                    .collect()
            }
            AvailabilityMode::MoreDataFirst { beta } => {
                let beta = non_negative("MDF", "beta", beta)?;
                normalize(traits.iter().map(|t| (t.data_volume.max(1) as f64).powf(beta)))
            }
            AvailabilityMode::LessDataFirst { beta } => {
                let beta = non_negative("LDF", "beta", beta)?;
                normalize(traits.iter().map(|t| (t.data_volume.max(1) as f64).powf(-beta)))
            }
            AvailabilityMode::YFewerFirst { beta } => {
                let beta = unit_interval("YFF", "beta", beta)?;
                let denom = label_num.max(1) as f64;
                traits
                    .iter()
                    .map(|t| beta * t.labels.len() as f64 / denom + (1.0 - beta))
                    .collect()
            }
            AvailabilityMode::Homogeneous { beta } => {
                let beta = unit_interval("HOMO", "beta", beta)?;
                vec![1.0 - beta; n]
            }
            AvailabilityMode::LogNormal { beta } => lognormal_weights("LN", beta, n, &mut env.rng)?,
            AvailabilityMode::SinLogNormal { beta } => {
                let q = lognormal_weights("SLN", beta, n, &mut env.rng)?;
                let mut update: AvailabilityUpdate = Box::new(move |table: &mut ParticipantTable| {
                    let t = (table.current_round() % CYCLE_ROUNDS) as f64;
                    let phase = 2.0 * PI * t / (CYCLE_ROUNDS - 1) as f64;
                    let scale = 0.4 * phase.sin() + 0.5;
                    let probs: Vec<f64> = q.iter().map(|qi| scale * qi).collect();
                    table.set_availability(&probs);
                });
                update(table);
                table.set_round_fixed_availability(true);
                return Ok(Some(update));
            }
            AvailabilityMode::YCycle { beta } => {
                let beta = unit_interval("YC", "beta", beta)?;
                let max_label = env.global_labels.iter().next_back().copied().unwrap_or(1).max(1) as f64;
                let windows: Vec<(f64, f64)> = traits
                    .iter()
                    .map(|t| {
                        let lo = t.labels.iter().next().copied().unwrap_or(0) as f64;
                        let hi = t.labels.iter().next_back().copied().unwrap_or(0) as f64;
                        (lo / max_label, hi / max_label)
                    })
                    .collect();
                let mut update: AvailabilityUpdate = Box::new(move |table: &mut ParticipantTable| {
                    let r = (1 + table.current_round() % CYCLE_ROUNDS) as f64 / CYCLE_ROUNDS as f64;
                    let probs: Vec<f64> = windows
                        .iter()
                        .map(|(lo, hi)| {
                            let inside = if r >= *lo && r <= *hi { 1.0 } else { 0.0 };
                            beta * inside + (1.0 - beta)
                        })
                        .collect();
                    table.set_availability(&probs);
                });
                update(table);
                table.set_round_fixed_availability(true);
                return Ok(Some(update));
            }
        };

        table.set_availability(&probs);
        table.set_round_fixed_availability(true);
        Ok(None)
    }
}

/// Scales positive weights so the largest is 1.
fn normalize(weights: impl Iterator<Item = f64>) -> Vec<f64> {
    let weights: Vec<f64> = weights.collect();
    let max = weights.iter().copied().fold(f64::MIN_POSITIVE, f64::max);
    weights.into_iter().map(|w| w / max).collect()
}

impl std::str::FromStr for AvailabilityMode {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_mode(&ModeString::parse(s)?)
    }
}

// ── Connectivity ──────────────────────────────────────────────────────

/// How likely selected participants are to drop out.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum ConnectivityMode {
    /// Nobody drops
    #[default]
    Ideal,

    /// Everyone drops with probability `gamma`
    Homogeneous { gamma: f64 },
}

impl ConnectivityMode {
    pub fn from_mode(mode: &ModeString) -> Result<Self, ProfileError> {
        mode.expect_at_most(1)?;
        match mode.name.as_str() {
            "IDL" => Ok(ConnectivityMode::Ideal),
            "HOMO" => Ok(ConnectivityMode::Homogeneous { gamma: mode.param(0, 0.05) }),
            other => Err(ProfileError::UnknownMode {
                axis: Axis::Connectivity,
                name: other.to_string(),
            }),
        }
    }

    pub fn install(
        &self,
        table: &mut ParticipantTable,
        _env: &mut ProfileEnv,
    ) -> Result<Option<ParticipantUpdate>, ProfileError> {
        let gamma = match *self {
            ConnectivityMode::Ideal => 0.0,
            ConnectivityMode::Homogeneous { gamma } => unit_interval("HOMO", "gamma", gamma)?,
        };
        table.fill_variable(Variable::ProbDrop, gamma);
        Ok(None)
    }
}

impl std::str::FromStr for ConnectivityMode {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_mode(&ModeString::parse(s)?)
    }
}

// ── Completeness ──────────────────────────────────────────────────────

/// How much of its configured workload a participant performs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum CompletenessMode {
    /// Full workload
    #[default]
    Ideal,

    /// Each round, with probability `p`, a uniformly reduced workload
    PartDynamicUniform { p: f64 },

    /// A uniformly reduced workload drawn once per participant
    FullStaticUniform,

    /// Each round, a uniform number of epochs in `[a, b]`
    ArbitraryDynamicUniform { a: f64, b: f64 },

    /// A uniform number of epochs in `[a, b]` drawn once per participant
    ArbitraryStaticUniform { a: f64, b: f64 },
}

/// Normalizes an epoch range to `1 <= a <= b`.
fn epoch_range(mode: &'static str, a: f64, b: f64) -> Result<(u64, u64), ProfileError> {
    let a = non_negative(mode, "a", a)?.max(1.0) as u64;
    let b = (non_negative(mode, "b", b)? as u64).max(a);
    Ok((a, b))
}

impl CompletenessMode {
    pub fn from_mode(mode: &ModeString) -> Result<Self, ProfileError> {
        let parsed = match mode.name.as_str() {
            "IDL" => CompletenessMode::Ideal,
            "PDU" => {
                mode.expect_at_most(1)?;
                CompletenessMode::PartDynamicUniform { p: mode.param(0, 0.5) }
            }
            "FSU" => {
                mode.expect_at_most(0)?;
                CompletenessMode::FullStaticUniform
            }
            "ADU" => {
                mode.expect_at_most(2)?;
                CompletenessMode::ArbitraryDynamicUniform {
                    a: mode.param(0, 1.0),
                    b: mode.param(1, 1.0),
                }
            }
            "ASU" => {
                mode.expect_at_most(2)?;
                CompletenessMode::ArbitraryStaticUniform {
                    a: mode.param(0, 1.0),
                    b: mode.param(1, 1.0),
                }
            }
            other => {
                return Err(ProfileError::UnknownMode {
                    axis: Axis::Completeness,
                    name: other.to_string(),
                })
            }
        };
        Ok(parsed)
    }

    pub fn install(
        &self,
        table: &mut ParticipantTable,
        env: &mut ProfileEnv,
    ) -> Result<Option<ParticipantUpdate>, ProfileError> {
        let ids = table.all_clients();
        match *self {
            CompletenessMode::Ideal => {
                for id in ids {
                    let steps = table.traits(id).map_or(0, |t| t.num_steps);
                    table.assign(id, Variable::WorkingAmount, steps as f64);
                }
                Ok(None)
            }
            CompletenessMode::PartDynamicUniform { p } => {
                let p = unit_interval("PDU", "p", p)?;
                Ok(Some(Box::new(move |table: &mut ParticipantTable, ids: &[ParticipantId]| {
                    for id in ids {
                        let full = table.traits(*id).map_or(0, |t| t.num_steps);
                        let rng = table.rng_mut();
                        let amount = if rng.gen::<f64>() < p && full > 0 {
                            rng.gen_range(0..full)
                        } else {
                            full
                        };
                        table.assign(*id, Variable::WorkingAmount, amount.max(1) as f64);
                    }
                })))
            }
            CompletenessMode::FullStaticUniform => {
                for id in ids {
                    let full = table.traits(id).map_or(0, |t| t.num_steps);
                    let amount = ((full as f64 * env.rng.gen::<f64>()) as u64).max(1);
                    table.assign(id, Variable::WorkingAmount, amount as f64);
                }
                Ok(None)
            }
            CompletenessMode::ArbitraryDynamicUniform { a, b } => {
                let (a, b) = epoch_range("ADU", a, b)?;
                Ok(Some(Box::new(move |table: &mut ParticipantTable, ids: &[ParticipantId]| {
                    for id in ids {
                        let per_epoch = table.traits(*id).map_or(1, |t| t.steps_per_epoch);
                        let epochs = table.rng_mut().gen_range(a..=b);
                        table.assign(*id, Variable::WorkingAmount, (epochs * per_epoch) as f64);
                    }
                })))
            }
            CompletenessMode::ArbitraryStaticUniform { a, b } => {
                let (a, b) = epoch_range("ASU", a, b)?;
                for id in ids {
                    let per_epoch = table.traits(id).map_or(1, |t| t.steps_per_epoch);
                    let epochs = env.rng.gen_range(a..=b);
                    table.assign(id, Variable::WorkingAmount, (epochs * per_epoch) as f64);
                }
                Ok(None)
            }
        }
    }
}

impl std::str::FromStr for CompletenessMode {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_mode(&ModeString::parse(s)?)
    }
}

// ── Responsiveness ────────────────────────────────────────────────────

/// How long responses take to arrive.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum ResponsivenessMode {
    /// Responses arrive instantly
    #[default]
    Ideal,

    /// Fixed per-participant latency drawn from a log-normal with this mean and variance
    LogNormal { mean: f64, var: f64 },

    /// Fixed per-participant latency drawn uniformly from `[min, max)`
    Uniform { min: f64, max: f64 },

    /// Latency proportional to the response size, `rate` bytes per tick
    Bandwidth { rate: f64 },
}

impl ResponsivenessMode {
    pub fn from_mode(mode: &ModeString) -> Result<Self, ProfileError> {
        let parsed = match mode.name.as_str() {
            "IDL" => ResponsivenessMode::Ideal,
            "LN" => {
                mode.expect_at_most(2)?;
                ResponsivenessMode::LogNormal {
                    mean: mode.param(0, 100.0),
                    var: mode.param(1, 10.0),
                }
            }
            "UNI" => {
                mode.expect_at_most(2)?;
                ResponsivenessMode::Uniform {
                    min: mode.param(0, 0.0),
                    max: mode.param(1, 1.0),
                }
            }
            "BW" => {
                mode.expect_at_most(1)?;
                ResponsivenessMode::Bandwidth { rate: mode.param(0, 1024.0) }
            }
            other => {
                return Err(ProfileError::UnknownMode {
                    axis: Axis::Responsiveness,
                    name: other.to_string(),
                })
            }
        };
        Ok(parsed)
    }

    pub fn install(
        &self,
        table: &mut ParticipantTable,
        env: &mut ProfileEnv,
    ) -> Result<Option<ParticipantUpdate>, ProfileError> {
        let n = table.len();
        let latencies: Vec<Tick> = match *self {
            ResponsivenessMode::Ideal => vec![0; n],
            ResponsivenessMode::LogNormal { mean, var } => {
                let mean = positive("LN", "mean", mean)?;
                let var = non_negative("LN", "var", var)?;
                let spread = (1.0 + var / mean / mean).ln();
                let mu = mean.ln() - 0.5 * spread;
                let dist = LogNormal::new(mu, spread.sqrt()).map_err(|e| ProfileError::Distribution {
                    mode: "LN",
                    reason: e.to_string(),
                })?;
                (0..n).map(|_| dist.sample(&mut env.rng) as Tick).collect()
            }
            ResponsivenessMode::Uniform { min, max } => {
                let lo = non_negative("UNI", "min", min)? as Tick;
                let hi = non_negative("UNI", "max", max)? as Tick;
                (0..n)
                    .map(|_| if hi > lo { env.rng.gen_range(lo..hi) } else { lo })
                    .collect()
            }
            ResponsivenessMode::Bandwidth { rate } => {
                let rate = positive("BW", "rate", rate)?;
                table.fill_variable(Variable::Latency, 0.0);
                return Ok(Some(Box::new(move |table: &mut ParticipantTable, ids: &[ParticipantId]| {
                    for id in ids {
                        let size = table.variables(*id).map_or(0, |v| v.package_size);
                        let latency = (size as f64 / rate).ceil();
                        table.assign(*id, Variable::Latency, latency);
                    }
                })));
            }
        };

        for (id, latency) in table.all_clients().into_iter().zip(latencies) {
            table.assign(id, Variable::Latency, latency as f64);
        }
        Ok(None)
    }
}

impl std::str::FromStr for ResponsivenessMode {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_mode(&ModeString::parse(s)?)
    }
}

// ── Profile selection ─────────────────────────────────────────────────

/// The profile chosen for each axis.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeterogeneityProfiles {
    pub availability: AvailabilityMode,
    pub connectivity: ConnectivityMode,
    pub completeness: CompletenessMode,
    pub responsiveness: ResponsivenessMode,
}

impl HeterogeneityProfiles {
    /// Resolves the four mode strings, falling back to `IDL` per axis.
    pub fn parse(availability: &str, connectivity: &str, completeness: &str, responsiveness: &str) -> Self {
        info!("Initializing Systemic Heterogeneity: Availability {}", availability);
        info!("Initializing Systemic Heterogeneity: Connectivity {}", connectivity);
        info!("Initializing Systemic Heterogeneity: Completeness {}", completeness);
        info!("Initializing Systemic Heterogeneity: Responsiveness {}", responsiveness);
        Self {
            availability: parse_or_ideal(Axis::Availability, availability),
            connectivity: parse_or_ideal(Axis::Connectivity, connectivity),
            completeness: parse_or_ideal(Axis::Completeness, completeness),
            responsiveness: parse_or_ideal(Axis::Responsiveness, responsiveness),
        }
    }

    /// Writes initial variables into `table` and assembles the strategy.
    ///
    /// An axis whose installation fails is logged and installed as `IDL`.
    /// Returns the profiles actually in effect alongside the strategy.
    pub fn install(&self, table: &mut ParticipantTable, env: &mut ProfileEnv) -> (Self, HeterogeneityStrategy) {
        let mut effective = *self;
        let mut strategy = HeterogeneityStrategy::ideal();

        match self.availability.install(table, env) {
            Ok(update) => {
                if let Some(update) = update {
                    strategy.availability = update;
                }
            }
            Err(e) => {
                warn!("{} profile failed ({}); falling back to IDL", Axis::Availability, e);
                table.set_round_fixed_availability(false);
                table.set_availability(&vec![1.0; table.len()]);
                effective.availability = AvailabilityMode::Ideal;
            }
        }

        strategy.connectivity = match installed(Axis::Connectivity, self.connectivity.install(table, env)) {
            Some(update) => update,
            None => {
                effective.connectivity = ConnectivityMode::Ideal;
                or_noop(ConnectivityMode::Ideal.install(table, env))
            }
        };
        strategy.completeness = match installed(Axis::Completeness, self.completeness.install(table, env)) {
            Some(update) => update,
            None => {
                effective.completeness = CompletenessMode::Ideal;
                or_noop(CompletenessMode::Ideal.install(table, env))
            }
        };
        strategy.responsiveness = match installed(Axis::Responsiveness, self.responsiveness.install(table, env)) {
            Some(update) => update,
            None => {
                effective.responsiveness = ResponsivenessMode::Ideal;
                or_noop(ResponsivenessMode::Ideal.install(table, env))
            }
        };

        (effective, strategy)
    }
}

/// `None` when installation failed.
fn installed(axis: Axis, result: Result<Option<ParticipantUpdate>, ProfileError>) -> Option<ParticipantUpdate> {
    match result {
        Ok(update) => Some(or_noop(Ok(update))),
        Err(e) => {
            warn!("{} profile failed ({}); falling back to IDL", axis, e);
            None
        }
    }
}

fn or_noop(result: Result<Option<ParticipantUpdate>, ProfileError>) -> ParticipantUpdate {
    result.ok().flatten().unwrap_or_else(|| Box::new(|_, _| {}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ParticipantTraits;
    use rand::SeedableRng;

    fn env(labels: &[u32]) -> ProfileEnv {
        ProfileEnv {
            global_labels: labels.iter().copied().collect(),
            rng: ChaCha8Rng::seed_from_u64(3),
        }
    }

    fn table_with(traits: Vec<ParticipantTraits>) -> ParticipantTable {
        ParticipantTable::new(traits, ChaCha8Rng::seed_from_u64(9), 10)
    }

    fn plain_table(n: usize, steps: u64) -> ParticipantTable {
        table_with((0..n).map(|_| ParticipantTraits::with_steps(steps)).collect())
    }

    fn labelled(labels: &[u32], volume: usize) -> ParticipantTraits {
        ParticipantTraits {
            num_steps: 10,
            steps_per_epoch: 5,
            data_volume: volume,
            labels: labels.iter().copied().collect(),
        }
    }

    fn probs(table: &ParticipantTable) -> Vec<f64> {
        table
            .get_variable(&table.all_clients(), Variable::ProbAvailable)
            .unwrap()
    }

    #[test]
    fn test_mode_string_parsing() {
        let mode = ModeString::parse("LN-100-10").unwrap();
        assert_eq!(mode.name, "LN");
        assert_eq!(mode.params, vec![100.0, 10.0]);

        assert_eq!(ModeString::parse("").unwrap().name, "IDL");
        assert!(matches!(
            ModeString::parse("HOMO-abc"),
            Err(ProfileError::BadParameter { .. })
        ));
    }

    #[test]
    fn test_modes_resolve_with_defaults() {
        assert_eq!(
            "HOMO".parse::<AvailabilityMode>().unwrap(),
            AvailabilityMode::Homogeneous { beta: 0.2 }
        );
        assert_eq!(
            "HOMO-0.3".parse::<ConnectivityMode>().unwrap(),
            ConnectivityMode::Homogeneous { gamma: 0.3 }
        );
        assert_eq!(
            "ADU-2".parse::<CompletenessMode>().unwrap(),
            CompletenessMode::ArbitraryDynamicUniform { a: 2.0, b: 1.0 }
        );
        assert_eq!(
            "LN".parse::<ResponsivenessMode>().unwrap(),
            ResponsivenessMode::LogNormal { mean: 100.0, var: 10.0 }
        );
    }

    #[test]
    fn test_unknown_mode_falls_back_to_ideal() {
        let profiles = HeterogeneityProfiles::parse("WHAT-1", "HOMO-1-2-3", "PDU-x", "NOPE");
        assert_eq!(profiles, HeterogeneityProfiles::default());
    }

    #[test]
    fn test_homogeneous_availability() {
        let mut table = plain_table(4, 10);
        let mut env = env(&[]);
        let update = AvailabilityMode::Homogeneous { beta: 0.25 }
            .install(&mut table, &mut env)
            .unwrap();

        assert!(update.is_none());
        assert!(table.round_fixed_availability());
        assert_eq!(probs(&table), vec![0.75; 4]);
        assert_eq!(
            table.get_variable(&table.all_clients(), Variable::ProbUnavailable).unwrap(),
            vec![0.25; 4]
        );
    }

    #[test]
    fn test_label_driven_availability() {
        let mut table = table_with(vec![labelled(&[0, 1], 10), labelled(&[4, 9], 10)]);
        let mut env = env(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        AvailabilityMode::YMaxFirst { beta: 0.9 }
            .install(&mut table, &mut env)
            .unwrap();
        let p = probs(&table);
        assert!((p[0] - 0.1).abs() < 1e-12);
        assert!((p[1] - (0.9 * 4.0 / 9.0 + 0.1)).abs() < 1e-12);

        AvailabilityMode::YFewerFirst { beta: 0.5 }
            .install(&mut table, &mut env)
            .unwrap();
        let p = probs(&table);
        assert!((p[0] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_data_volume_availability() {
        let mut table = table_with(vec![labelled(&[], 10), labelled(&[], 40)]);
        let mut env = env(&[]);

        AvailabilityMode::MoreDataFirst { beta: 1.0 }
            .install(&mut table, &mut env)
            .unwrap();
        assert_eq!(probs(&table), vec![0.25, 1.0]);

        AvailabilityMode::LessDataFirst { beta: 1.0 }
            .install(&mut table, &mut env)
            .unwrap();
        let p = probs(&table);
        assert!((p[0] - 1.0).abs() < 1e-12);
        assert!((p[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_lognormal_availability_is_normalized() {
        let mut table = plain_table(20, 10);
        let mut env = env(&[]);
        AvailabilityMode::LogNormal { beta: 0.3 }
            .install(&mut table, &mut env)
            .unwrap();

        let p = probs(&table);
        assert!(p.iter().all(|x| *x > 0.0 && *x <= 1.0));
        assert!(p.iter().any(|x| (*x - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_sin_lognormal_follows_rounds() {
        let mut table = plain_table(3, 10);
        let mut env = env(&[]);
        let mut update = AvailabilityMode::SinLogNormal { beta: 0.1 }
            .install(&mut table, &mut env)
            .unwrap()
            .expect("per-round update");

        // Round 0: sin(0) = 0, scale 0.5.
        let at_zero = probs(&table);
        assert!(at_zero.iter().all(|p| *p <= 0.5 + 1e-12));

        table.set_current_round(6);
        update(&mut table);
        let scale = 0.4 * (2.0 * PI * 6.0 / 23.0).sin() + 0.5;
        for (now, before) in probs(&table).iter().zip(&at_zero) {
            assert!((now - before / 0.5 * scale).abs() < 1e-9);
        }
    }

    #[test]
    fn test_y_cycle_windows() {
        let mut table = table_with(vec![labelled(&[0, 2], 1), labelled(&[8, 10], 1)]);
        let mut env = env(&[0, 10]);
        let mut update = AvailabilityMode::YCycle { beta: 1.0 }
            .install(&mut table, &mut env)
            .unwrap()
            .expect("per-round update");

        // Round 0: r = 1/24, inside [0, 0.2] only.
        assert_eq!(probs(&table), vec![1.0, 0.0]);

        // Round 21: r = 22/24, inside [0.8, 1.0] only.
        table.set_current_round(21);
        update(&mut table);
        assert_eq!(probs(&table), vec![0.0, 1.0]);
    }

    #[test]
    fn test_out_of_range_parameter_is_rejected() {
        let mut table = plain_table(2, 10);
        let mut env = env(&[]);
        let err = AvailabilityMode::Homogeneous { beta: 1.5 }
            .install(&mut table, &mut env)
            .err()
            .expect("beta above 1");
        assert!(matches!(err, ProfileError::OutOfRange { name: "beta", .. }));
    }

    #[test]
    fn test_failed_install_falls_back_to_ideal() {
        let mut table = plain_table(2, 10);
        let mut env = env(&[]);
        let profiles = HeterogeneityProfiles {
            availability: AvailabilityMode::LogNormal { beta: 2.0 },
            connectivity: ConnectivityMode::Homogeneous { gamma: -1.0 },
            completeness: CompletenessMode::PartDynamicUniform { p: 0.5 },
            ..Default::default()
        };
        let (effective, _) = profiles.install(&mut table, &mut env);

        assert_eq!(effective.availability, AvailabilityMode::Ideal);
        assert_eq!(effective.connectivity, ConnectivityMode::Ideal);
        assert_eq!(effective.completeness, CompletenessMode::PartDynamicUniform { p: 0.5 });
        assert_eq!(probs(&table), vec![1.0, 1.0]);
        assert!(!table.round_fixed_availability());
        assert_eq!(
            table.get_variable(&table.all_clients(), Variable::ProbDrop).unwrap(),
            vec![0.0, 0.0]
        );
    }

    #[test]
    fn test_part_dynamic_completeness_bounds() {
        let mut table = plain_table(5, 8);
        let mut env = env(&[]);
        let mut update = CompletenessMode::PartDynamicUniform { p: 1.0 }
            .install(&mut table, &mut env)
            .unwrap()
            .expect("per-round update");

        let ids = table.all_clients();
        for _ in 0..20 {
            update(&mut table, &ids);
            for id in &ids {
                let amount = table.working_amount(*id).unwrap();
                assert!((1..8).contains(&amount));
            }
        }
    }

    #[test]
    fn test_part_dynamic_never_compounds() {
        let mut table = plain_table(1, 8);
        let mut env = env(&[]);
        let mut update = CompletenessMode::PartDynamicUniform { p: 0.0 }
            .install(&mut table, &mut env)
            .unwrap()
            .expect("per-round update");

        let ids = table.all_clients();
        update(&mut table, &ids);
        assert_eq!(table.working_amount(ids[0]), Some(8));
    }

    #[test]
    fn test_arbitrary_epoch_completeness() {
        let mut table = table_with(vec![labelled(&[], 1); 4]);
        let mut env = env(&[]);
        CompletenessMode::ArbitraryStaticUniform { a: 2.0, b: 3.0 }
            .install(&mut table, &mut env)
            .unwrap();

        for id in table.all_clients() {
            let amount = table.working_amount(id).unwrap();
            assert!(amount == 10 || amount == 15);
        }
    }

    #[test]
    fn test_full_static_completeness() {
        let mut table = plain_table(6, 20);
        let mut env = env(&[]);
        CompletenessMode::FullStaticUniform
            .install(&mut table, &mut env)
            .unwrap();
        for id in table.all_clients() {
            assert!((1..=20).contains(&table.working_amount(id).unwrap()));
        }
    }

    #[test]
    fn test_uniform_responsiveness() {
        let mut table = plain_table(10, 1);
        let mut env = env(&[]);
        ResponsivenessMode::Uniform { min: 3.0, max: 7.0 }
            .install(&mut table, &mut env)
            .unwrap();
        for id in table.all_clients() {
            assert!((3..7).contains(&table.latency(id)));
        }
    }

    #[test]
    fn test_lognormal_responsiveness_is_near_mean() {
        let mut table = plain_table(200, 1);
        let mut env = env(&[]);
        ResponsivenessMode::LogNormal { mean: 100.0, var: 10.0 }
            .install(&mut table, &mut env)
            .unwrap();
        let mean = table
            .all_clients()
            .iter()
            .map(|id| table.latency(*id) as f64)
            .sum::<f64>()
            / 200.0;
        assert!((90.0..=101.0).contains(&mean));
    }

    #[test]
    fn test_bandwidth_responsiveness_scales_with_size() {
        let mut table = plain_table(2, 1);
        let mut env = env(&[]);
        let mut update = ResponsivenessMode::Bandwidth { rate: 100.0 }
            .install(&mut table, &mut env)
            .unwrap()
            .expect("per-round update");

        let ids = table.all_clients();
        table.set_variable(&ids, Variable::PackageSize, &[250.0, 100.0]).unwrap();
        update(&mut table, &ids);
        assert_eq!(table.latency(ids[0]), 3);
        assert_eq!(table.latency(ids[1]), 1);
    }
}
