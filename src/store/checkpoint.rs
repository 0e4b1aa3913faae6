//! Periodic policy checkpoints with rotation of old files

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;

use crate::error::{Error, Result};

const PREFIX: &str = "checkpoint_";
const EXTENSION: &str = "mpk";

/// Where checkpoints go and how many survive
#[derive(Debug, Clone)]
pub struct CheckpointerConfig {
    pub checkpoint_dir: PathBuf,
    /// Number of recent checkpoints to keep (0 = keep all)
    pub keep_last_n: usize,
}

impl CheckpointerConfig {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            keep_last_n: 5,
        }
    }

    pub fn with_keep_last_n(mut self, n: usize) -> Self {
        self.keep_last_n = n;
        self
    }
}

/// A checkpoint file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub path: PathBuf,
    /// Step at which the checkpoint was written
    pub step: usize,
}

pub struct Checkpointer {
    config: CheckpointerConfig,
    history: Vec<CheckpointInfo>,
}

impl Checkpointer {
    /// Creates the checkpoint directory and picks up checkpoints left by earlier runs
    pub fn new(config: CheckpointerConfig) -> Result<Self> {
        fs::create_dir_all(&config.checkpoint_dir)?;
        let history = list_checkpoints(&config.checkpoint_dir)?;

        Ok(Self { config, history })
    }

    pub fn config(&self) -> &CheckpointerConfig {
        &self.config
    }

    pub fn history(&self) -> &[CheckpointInfo] {
        &self.history
    }

    pub fn path_for(&self, step: usize) -> PathBuf {
        self.config
            .checkpoint_dir
            .join(format!("{}{:08}.{}", PREFIX, step, EXTENSION))
    }

    /// Write `model` as the checkpoint for `step`, then drop the oldest beyond the limit
    pub fn save<B: Backend, M: Module<B>>(&mut self, model: &M, step: usize) -> Result<PathBuf> {
        let path = self.path_for(step);
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        model.clone().save_file(&path, &recorder)?;

        self.history.retain(|c| c.step != step);
        self.history.push(CheckpointInfo {
            path: path.clone(),
            step,
        });
        self.history.sort_by_key(|c| c.step);
        self.cleanup_old_checkpoints();

        tracing::info!("Saved checkpoint to {}", path.display());
        Ok(path)
    }

    /// Load parameters from `path` into `template`
    pub fn load<B: Backend, M: Module<B>>(
        &self,
        template: M,
        path: &Path,
        device: &B::Device,
    ) -> Result<M> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let model = template.load_file(path.to_path_buf(), &recorder, device)?;
        tracing::info!("Loaded checkpoint from {}", path.display());
        Ok(model)
    }

    /// Load the highest-step checkpoint; returns the model and its step
    pub fn load_latest<B: Backend, M: Module<B>>(
        &self,
        template: M,
        device: &B::Device,
    ) -> Result<(M, usize)> {
        let latest = list_checkpoints(&self.config.checkpoint_dir)?
            .pop()
            .ok_or_else(|| Error::NoCheckpoints(self.config.checkpoint_dir.clone()))?;
        let model = self.load(template, &latest.path, device)?;
        Ok((model, latest.step))
    }

    fn cleanup_old_checkpoints(&mut self) {
        if self.config.keep_last_n == 0 {
            return;
        }

        while self.history.len() > self.config.keep_last_n {
            let old = self.history.remove(0);
            if let Err(e) = fs::remove_file(&old.path) {
                tracing::warn!("Could not remove {}: {}", old.path.display(), e);
            }
        }
    }
}

/// All checkpoints in `dir`, oldest first
pub fn list_checkpoints(dir: &Path) -> Result<Vec<CheckpointInfo>> {
    let mut checkpoints: Vec<CheckpointInfo> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            let step = path
                .file_name()?
                .to_str()?
                .strip_prefix(PREFIX)?
                .strip_suffix(EXTENSION)?
                .strip_suffix('.')?
                .parse()
                .ok()?;
            Some(CheckpointInfo { path, step })
        })
        .collect();

    checkpoints.sort_by_key(|c| c.step);
    Ok(checkpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bc::policy::{NetworkConfig, PolicyNet};
    use burn::backend::NdArray;
    use burn::prelude::*;
    use tempfile::tempdir;

    type TestBackend = NdArray;

    fn net() -> PolicyNet<TestBackend> {
        NetworkConfig::new(3, 2)
            .with_hidden_units(8)
            .with_num_layers(1)
            .init(&Default::default())
    }

    #[test]
    fn test_checkpoint_dir_creation() {
        let dir = tempdir().unwrap();
        let subdir = dir.path().join("nested/checkpoints");

        let _checkpointer = Checkpointer::new(CheckpointerConfig::new(&subdir)).unwrap();
        assert!(subdir.exists());
    }

    #[test]
    fn test_file_names_sort_by_step() {
        let dir = tempdir().unwrap();
        let checkpointer = Checkpointer::new(CheckpointerConfig::new(dir.path())).unwrap();

        let path = checkpointer.path_for(50);
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "checkpoint_00000050.mpk"
        );
    }

    #[test]
    fn test_rotation_keeps_last_n() {
        let dir = tempdir().unwrap();
        let config = CheckpointerConfig::new(dir.path()).with_keep_last_n(2);
        let mut checkpointer = Checkpointer::new(config).unwrap();
        let net = net();

        for step in [10, 20, 30] {
            checkpointer.save(&net, step).unwrap();
        }

        let steps: Vec<_> = list_checkpoints(dir.path())
            .unwrap()
            .into_iter()
            .map(|c| c.step)
            .collect();
        assert_eq!(steps, vec![20, 30]);
        assert_eq!(checkpointer.history().len(), 2);
    }

    #[test]
    fn test_load_latest_restores_parameters() {
        let dir = tempdir().unwrap();
        let mut checkpointer = Checkpointer::new(CheckpointerConfig::new(dir.path())).unwrap();
        let device = Default::default();
        let saved = net();
        checkpointer.save(&net(), 5).unwrap();
        checkpointer.save(&saved, 7).unwrap();

        let (loaded, step) = checkpointer.load_latest(net(), &device).unwrap();
        assert_eq!(step, 7);

        let input = Tensor::<TestBackend, 2>::from_floats([[0.5, -1.0, 2.0]], &device);
        let expected = saved.forward(input.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = loaded.forward(input).into_data().to_vec::<f32>().unwrap();
        for (e, a) in expected.iter().zip(&actual) {
            assert!((e - a).abs() < 1e-6);
        }
    }

    #[test]
    fn test_load_latest_without_checkpoints() {
        let dir = tempdir().unwrap();
        let checkpointer = Checkpointer::new(CheckpointerConfig::new(dir.path())).unwrap();

        let result = checkpointer.load_latest(net(), &Default::default());
        assert!(matches!(result, Err(Error::NoCheckpoints(_))));
    }

    #[test]
    fn test_existing_checkpoints_are_picked_up() {
        let dir = tempdir().unwrap();
        {
            let mut first = Checkpointer::new(CheckpointerConfig::new(dir.path())).unwrap();
            first.save(&net(), 100).unwrap();
        }

        let second = Checkpointer::new(CheckpointerConfig::new(dir.path())).unwrap();
        assert_eq!(second.history().len(), 1);
        assert_eq!(second.history()[0].step, 100);
    }
}
