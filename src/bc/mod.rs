//! Behavioral cloning
//!
//! ```text
//!   reset ──► expert states ──► ExpertBuffer ◄── expert actions (next step)
//!                                   │
//!                          shuffled mini-batches
//!                                   ▼
//!   learner states ──► Policy ──► actions ──► Environment::step
//! ```
//!
//! The learner never sees a reward: its network is fit to reproduce the expert's
//! action for the same state, one round of updates per environment step.

pub mod buffer;
pub mod metrics;
pub mod policy;
pub mod trainer;

pub use buffer::{ExpertBuffer, MiniBatch, ShuffledBatches};
pub use metrics::{MovingAverage, SummaryWriter, TrainingStats};
pub use policy::{
    ContinuousPolicy, DiscretePolicy, ImitationPolicy, NetworkConfig, Policy, PolicyNet,
};
pub use trainer::{RunReport, Trainer};
