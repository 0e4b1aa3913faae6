//! Model persistence: checkpoints during a run, a frozen graph at the end

pub mod checkpoint;
pub mod export;

use std::path::{Path, PathBuf};

use burn::tensor::backend::AutodiffBackend;

pub use checkpoint::{CheckpointInfo, Checkpointer, CheckpointerConfig, list_checkpoints};
pub use export::{FrozenPolicy, TARGET_NODE, export_graph};

use crate::bc::policy::Policy;
use crate::error::Result;

/// Where the training loop sends policy snapshots
pub trait ModelSink<B: AutodiffBackend> {
    /// Replace the policy parameters with the latest checkpoint; returns its step
    fn restore(&mut self, policy: &mut Policy<B>) -> Result<usize>;

    /// Checkpoint the policy as of `step`
    fn save(&mut self, policy: &Policy<B>, step: usize) -> Result<PathBuf>;

    /// Write the inference-only graph named `graph_name`
    fn export(&mut self, policy: &Policy<B>, graph_name: &str) -> Result<PathBuf>;
}

/// Run directory on disk: rotated checkpoints and the exported graph side by side
pub struct RunStore {
    checkpointer: Checkpointer,
    model_dir: PathBuf,
}

impl RunStore {
    pub fn new(model_dir: impl Into<PathBuf>, keep_checkpoints: usize) -> Result<Self> {
        let model_dir = model_dir.into();
        let config = CheckpointerConfig::new(&model_dir).with_keep_last_n(keep_checkpoints);

        Ok(Self {
            checkpointer: Checkpointer::new(config)?,
            model_dir,
        })
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }
}

impl<B: AutodiffBackend> ModelSink<B> for RunStore {
    fn restore(&mut self, policy: &mut Policy<B>) -> Result<usize> {
        let (net, step) = self
            .checkpointer
            .load_latest(policy.network().clone(), policy.device())?;
        policy.set_network(net);
        tracing::info!("Restored policy from step {}", step);
        Ok(step)
    }

    fn save(&mut self, policy: &Policy<B>, step: usize) -> Result<PathBuf> {
        self.checkpointer.save(policy.network(), step)
    }

    fn export(&mut self, policy: &Policy<B>, graph_name: &str) -> Result<PathBuf> {
        export_graph(policy, &self.model_dir, graph_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bc::policy::{ImitationPolicy, NetworkConfig};
    use crate::env::{Action, ActionKind};
    use burn::backend::{Autodiff, NdArray};
    use tempfile::tempdir;

    type TestBackend = Autodiff<NdArray>;

    fn policy() -> Policy<TestBackend> {
        let config = NetworkConfig::new(2, 2)
            .with_hidden_units(8)
            .with_num_layers(1);
        Policy::new(&config, ActionKind::Continuous, 1e-3, &Default::default())
    }

    #[test]
    fn test_save_then_restore_into_fresh_policy() {
        let dir = tempdir().unwrap();
        let mut store = RunStore::new(dir.path().join("run"), 5).unwrap();
        let states = vec![vec![0.3, -0.7]];

        let trained = policy();
        ModelSink::save(&mut store, &trained, 10).unwrap();

        let mut restored = policy();
        let step = store.restore(&mut restored).unwrap();
        assert_eq!(step, 10);

        let expected = trained.sample(&states).unwrap();
        let actual = restored.sample(&states).unwrap();
        match (&expected[0], &actual[0]) {
            (Action::Continuous(e), Action::Continuous(a)) => {
                for (x, y) in e.iter().zip(a) {
                    assert!((x - y).abs() < 1e-6);
                }
            }
            other => panic!("unexpected actions {:?}", other),
        }
    }

    #[test]
    fn test_restore_without_checkpoint_fails() {
        let dir = tempdir().unwrap();
        let mut store = RunStore::new(dir.path(), 5).unwrap();
        let mut fresh = policy();

        assert!(store.restore(&mut fresh).is_err());
    }

    #[test]
    fn test_export_lands_in_model_dir() {
        let dir = tempdir().unwrap();
        let mut store = RunStore::new(dir.path(), 5).unwrap();

        let path = store.export(&policy(), "Arena").unwrap();
        assert_eq!(path, store.model_dir().join("Arena.bytes"));
        assert!(path.exists());
    }
}
