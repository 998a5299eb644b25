//! Heterogeneity Simulator Environment Layer
//!
//! This crate holds the vocabulary shared by the simulation engine and the
//! systems it is embedded in:
//! - Identity and time (`ParticipantId`, `Tick`)
//! - Participant lifecycle (`ClientState`)
//! - Response bodies (`Payload`)
//! - Collaborator seams (`Coordinator`, `Participant`)
//!
//! Nothing in here performs I/O. All waiting in the system is expressed in
//! virtual ticks by `hetero_sim`.
//!
//! # Example
//!
//! ```ignore
//! use hetero_env::{Participant, Payload, PayloadValue};
//!
//! struct Device { steps: u64 }
//!
//! impl Participant for Device {
//!     fn num_steps(&self) -> u64 { self.steps }
//!     fn set_num_steps(&mut self, steps: u64) { self.steps = steps; }
//!     fn train(&mut self, _round: u64) -> Payload {
//!         Payload::new().with("steps", PayloadValue::Scalar(self.steps as f64))
//!     }
//! }
//! ```

mod context;
mod error;
mod types;

pub use context::{Coordinator, Participant};
pub use error::SimError;
pub use types::{ClientState, ParticipantId, Payload, PayloadValue, Tick};
