//! Heterogeneous Participant Runtime Simulator
//!
//! This crate reproduces the runtime conditions of a population of remote
//! participants talking to a central coordinator: intermittent
//! availability, dropout, partial local work and variable response
//! latency. Everything is deterministic given a seed and nothing touches a
//! real network.
//!
//! # Core Principle: Virtual Time
//!
//! All waiting is expressed in ticks of a virtual clock:
//! - **Time**: advances only through `VirtualClock::step`, never backwards
//! - **State**: every tick flushes the participant state machine once
//! - **Randomness**: every draw comes from streams derived from one seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          SimWorld                            │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ VirtualClock<Package, ParticipantStates>               │  │
//! │  │   event queue ── flush per tick ──> state machine      │  │
//! │  │                      (driven by HeterogeneityStrategy) │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │        ▲                                   ▲                 │
//! │   select / communicate                 set_available         │
//! │        │                                   │                 │
//! │  ┌─────┴───────┐                   ┌───────┴───────┐         │
//! │  │ Coordinator │                   │ Participants  │  ...    │
//! │  └─────────────┘                   └───────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use hetero_sim::{CommMode, SimConfig, SimContext, SimWorld};
//! use hetero_sim::{SimulatedCoordinator, SimulatedParticipant};
//!
//! let config = SimConfig::default().with_modes("HOMO-0.2", "HOMO-0.05", "PDU", "LN");
//! let mut context = SimContext::new(config.seed);
//! let coordinator = SimulatedCoordinator::new(&config, context.next_rng());
//! let participants = SimulatedParticipant::population(&config, &mut context.next_rng());
//! let mut world = SimWorld::new(config, &mut context, coordinator, participants);
//!
//! let selection = world.select()?;
//! let collected = world.communicate_selection(selection, CommMode::Synchronous)?;
//! ```

mod agent;
mod clock;
mod context;
mod exporter;
mod protocol;
mod runner;
mod state;
mod world;
pub mod profiles;
pub mod scenarios;

pub use agent::{SimulatedCoordinator, SimulatedParticipant};
pub use clock::{Scheduled, StateUpdater, VirtualClock};
pub use context::{SeedSequence, SimContext};
pub use exporter::{RoundRecord, RunExport};
pub use profiles::{Axis, HeterogeneityProfiles, HeterogeneityStrategy, ProfileError};
pub use protocol::{
    communicate, select, Collected, CommMode, Package, Responses, Selection, SimClock, Survivors, MAX_IDLE_WAIT,
};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use state::{ClientVariables, ParticipantStates, ParticipantTable, ParticipantTraits, StateCounter, Variable};
pub use world::{ConfigError, SimConfig, SimWorld};
