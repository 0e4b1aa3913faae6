//! Environment adapter - the simulation as seen by the imitation loop
//!
//! The simulation is a black box that hosts named brains. One brain is driven by
//! an expert (the ground truth we clone), the other by the learner policy.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

pub mod unity;

pub use unity::UnityEnvironment;

/// Whether a brain acts with category indices or real-valued vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Discrete,
    Continuous,
}

/// A single agent's action
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Discrete(usize),
    Continuous(Vec<f32>),
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Discrete(_) => ActionKind::Discrete,
            Action::Continuous(_) => ActionKind::Continuous,
        }
    }

    /// Flat float encoding used on the wire
    pub fn to_floats(&self) -> Vec<f32> {
        match self {
            Action::Discrete(index) => vec![*index as f32],
            Action::Continuous(values) => values.clone(),
        }
    }
}

/// Static description of a brain
#[derive(Debug, Clone, PartialEq)]
pub struct BrainParameters {
    pub name: String,
    pub state_space_size: usize,
    pub stacked_states: usize,
    pub action_space_size: usize,
    pub action_kind: ActionKind,
}

impl BrainParameters {
    /// Width of one observed state row
    pub fn state_size(&self) -> usize {
        self.state_space_size * self.stacked_states
    }

    /// Number of floats one action occupies on the wire
    pub fn action_width(&self) -> usize {
        match self.action_kind {
            ActionKind::Discrete => 1,
            ActionKind::Continuous => self.action_space_size,
        }
    }
}

/// Everything a brain observed during one environment transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentBatch {
    /// State rows [agents, state_size]
    pub states: Vec<Vec<f32>>,
    /// Actions that produced this transition [agents]
    pub previous_actions: Vec<Action>,
    /// Rewards [agents]
    pub rewards: Vec<f32>,
    /// Per-agent episode termination [agents]
    pub local_done: Vec<bool>,
}

impl AgentBatch {
    pub fn agents(&self) -> usize {
        self.states.len()
    }
}

/// Batches keyed by brain name
pub type BrainInfos = HashMap<String, AgentBatch>;

/// Remove a named brain from a step result, failing if the simulation omitted it
pub fn take_brain(infos: &mut BrainInfos, name: &str) -> Result<AgentBatch> {
    infos
        .remove(name)
        .ok_or_else(|| Error::MissingBrain(name.to_string()))
}

/// The simulation, as far as the training loop is concerned
pub trait Environment {
    /// Identifying name (typically the binary path)
    fn name(&self) -> &str;

    fn brain_parameters(&self, brain: &str) -> Option<&BrainParameters>;

    /// Start a new episode; `fast` runs the simulation at training speed
    fn reset(&mut self, fast: bool) -> Result<BrainInfos>;

    /// Advance the simulation with actions for the given brain's agents
    fn step(&mut self, brain: &str, actions: &[Action]) -> Result<BrainInfos>;

    fn close(&mut self) -> Result<()>;
}

/// Exclusive, scoped ownership of an environment connection.
///
/// `close` releases it explicitly; dropping an open session closes it too, so an
/// error anywhere in the loop cannot leave the simulation running.
pub struct EnvSession<E: Environment> {
    env: E,
    open: bool,
}

impl<E: Environment> EnvSession<E> {
    pub fn new(env: E) -> Self {
        Self { env, open: true }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        tracing::info!("Closing environment {}", self.env.name());
        self.env.close()
    }
}

impl<E: Environment> Drop for EnvSession<E> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.close() {
                tracing::warn!("Failed to close environment: {}", e);
            }
        }
    }
}

/// Name the exported graph after the environment binary: whitespace trimmed,
/// platform suffixes removed, directories dropped.
pub fn graph_name(env_name: &str) -> String {
    let stripped = [".app", ".exe", ".x86_64", ".x86"]
        .iter()
        .fold(env_name.trim().to_string(), |name, suffix| {
            name.replace(suffix, "")
        });

    Path::new(&stripped)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_name_strips_path_and_suffix() {
        assert_eq!(graph_name("envs/Crowd.x86_64"), "Crowd");
        assert_eq!(graph_name("  /opt/builds/Bees.exe "), "Bees");
        assert_eq!(graph_name("Hive.app/"), "Hive");
        assert_eq!(graph_name("builds/Tennis.x86"), "Tennis");
        assert_eq!(graph_name("Ball3D"), "Ball3D");
    }

    #[test]
    fn test_brain_parameters_sizes() {
        let brain = BrainParameters {
            name: "BrainP".to_string(),
            state_space_size: 8,
            stacked_states: 3,
            action_space_size: 4,
            action_kind: ActionKind::Discrete,
        };
        assert_eq!(brain.state_size(), 24);
        assert_eq!(brain.action_width(), 1);

        let brain = BrainParameters {
            action_kind: ActionKind::Continuous,
            ..brain
        };
        assert_eq!(brain.action_width(), 4);
    }

    #[test]
    fn test_action_floats() {
        assert_eq!(Action::Discrete(3).to_floats(), vec![3.0]);
        assert_eq!(Action::Continuous(vec![0.5, -1.0]).to_floats(), vec![0.5, -1.0]);
        assert_eq!(Action::Discrete(0).kind(), ActionKind::Discrete);
    }

    #[test]
    fn test_take_brain_missing() {
        let mut infos = BrainInfos::new();
        infos.insert("BrainE".to_string(), AgentBatch::default());
        assert!(take_brain(&mut infos, "BrainE").is_ok());
        assert!(matches!(
            take_brain(&mut infos, "BrainE"),
            Err(Error::MissingBrain(_))
        ));
    }
}
