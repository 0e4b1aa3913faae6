//! Online behavioral cloning loop
//!
//! Every step the learner acts, the simulation advances, and the expert's
//! response to the previous states is added to the buffer before a round of
//! mini-batch updates.

use std::path::PathBuf;

use burn::tensor::backend::AutodiffBackend;
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::buffer::ExpertBuffer;
use super::metrics::{SummaryWriter, TrainingStats};
use super::policy::{ImitationPolicy, NetworkConfig, Policy};
use crate::config::RunConfig;
use crate::env::{BrainParameters, EnvSession, Environment, graph_name, take_brain};
use crate::error::{Error, Result};
use crate::store::ModelSink;

/// Minimum buffered expert actions before a training round is attempted
const MIN_ACTIONS_TO_TRAIN: usize = 2;

/// Outcome of a finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub steps: usize,
    /// One entry per step when training, empty otherwise
    pub losses: Vec<f32>,
    pub updates: Vec<usize>,
    pub cumulative_reward: f32,
    pub expert_pairs: usize,
    pub checkpoints: Vec<PathBuf>,
    pub export_path: Option<PathBuf>,
}

pub struct Trainer<B: AutodiffBackend, S: ModelSink<B>> {
    config: RunConfig,
    sink: S,
    device: B::Device,
    rng: StdRng,
}

impl<B: AutodiffBackend, S: ModelSink<B>> Trainer<B, S> {
    pub fn new(config: RunConfig, sink: S, device: B::Device) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            config,
            sink,
            device,
            rng,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Run the loop to the step budget, close the environment, then export the graph
    pub fn run<E: Environment>(&mut self, env: E) -> Result<RunReport> {
        let graph = graph_name(env.name());
        let mut session = EnvSession::new(env);

        let outcome = self.train_loop(session.env_mut());
        let closed = session.close();

        let (policy, mut report) = outcome?;
        closed?;

        report.export_path = Some(self.sink.export(&policy, &graph)?);
        Ok(report)
    }

    fn train_loop<E: Environment>(&mut self, env: &mut E) -> Result<(Policy<B>, RunReport)> {
        let config = self.config.clone();
        let expert_params = brain(env, &config.expert_brain)?;
        let learner_params = brain(env, &config.learner_brain)?;
        check_compatible(&expert_params, &learner_params)?;

        let network = NetworkConfig::new(expert_params.state_size(), expert_params.action_space_size)
            .with_hidden_units(config.hidden_units)
            .with_num_layers(config.num_layers);
        let mut policy = Policy::<B>::new(
            &network,
            expert_params.action_kind,
            config.learning_rate,
            &self.device,
        );
        if config.load {
            self.sink.restore(&mut policy)?;
        }

        let mut infos = env.reset(config.fast)?;
        let expert = take_brain(&mut infos, &config.expert_brain)?;
        let mut learner = take_brain(&mut infos, &config.learner_brain)?;

        let mut buffer = ExpertBuffer::new(expert_params.state_size());
        buffer.append_states(&expert.states)?;

        let mut stats = TrainingStats::new(config.log_freq);
        let mut summary = SummaryWriter::create(&config.model_dir)?;
        let mut checkpoints = Vec::new();
        let mut last_saved = None;

        tracing::info!(
            "Cloning {} into {} for {} steps (train: {})",
            config.expert_brain,
            config.learner_brain,
            config.max_steps,
            config.train
        );

        while stats.steps < config.max_steps {
            let actions = policy.sample(&learner.states)?;
            let mut infos = env.step(&config.learner_brain, &actions)?;
            let expert = take_brain(&mut infos, &config.expert_brain)?;
            learner = take_brain(&mut infos, &config.learner_brain)?;

            buffer.append_actions(&expert.previous_actions)?;
            let reward: f32 = learner.rewards.iter().sum();

            let round = if config.train {
                Some(self.training_round(&mut policy, &buffer)?)
            } else {
                None
            };
            stats.record_step(reward, round);

            // States the expert will answer in the next step
            buffer.append_states(&expert.states)?;
            summary.write_step(&stats, buffer.len())?;

            let step = stats.steps;
            if config.train && step % config.save_freq == 0 {
                checkpoints.push(self.sink.save(&policy, step)?);
                last_saved = Some(step);
            }
            if step % config.log_freq == 0 {
                stats.log_to_console(buffer.len());
            }
        }

        if config.train && stats.steps > 0 && last_saved != Some(stats.steps) {
            checkpoints.push(self.sink.save(&policy, stats.steps)?);
        }
        summary.flush()?;

        let report = RunReport {
            steps: stats.steps,
            losses: stats.losses,
            updates: stats.updates,
            cumulative_reward: stats.cumulative_reward,
            expert_pairs: buffer.len(),
            checkpoints,
            export_path: None,
        };
        Ok((policy, report))
    }

    /// Mean batch loss and number of updates; (0, 0) when there is not enough data
    fn training_round(
        &mut self,
        policy: &mut Policy<B>,
        buffer: &ExpertBuffer,
    ) -> Result<(f32, usize)> {
        if buffer.len() < MIN_ACTIONS_TO_TRAIN {
            return Ok((0.0, 0));
        }

        let mut total = 0.0;
        let mut updates = 0;
        let batches =
            buffer.shuffled_batches(self.config.batch_size, self.config.epoch_batches, &mut self.rng);
        for batch in batches {
            total += policy.update(&batch.states, &batch.actions)?;
            updates += 1;
        }

        if updates == 0 {
            return Ok((0.0, 0));
        }
        Ok((total / updates as f32, updates))
    }
}

fn brain<E: Environment>(env: &E, name: &str) -> Result<BrainParameters> {
    env.brain_parameters(name)
        .cloned()
        .ok_or_else(|| Error::MissingBrain(name.to_string()))
}

/// The learner plays with the expert's network, so both brains must look alike
fn check_compatible(expert: &BrainParameters, learner: &BrainParameters) -> Result<()> {
    if expert.state_size() != learner.state_size()
        || expert.action_space_size != learner.action_space_size
        || expert.action_kind != learner.action_kind
    {
        return Err(Error::Config(format!(
            "learner brain {} ({} states, {} {:?} actions) does not match expert brain {} ({} states, {} {:?} actions)",
            learner.name,
            learner.state_size(),
            learner.action_space_size,
            learner.action_kind,
            expert.name,
            expert.state_size(),
            expert.action_space_size,
            expert.action_kind
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Action, ActionKind, AgentBatch, BrainInfos};
    use burn::backend::{Autodiff, NdArray};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;
    use tempfile::{TempDir, tempdir};

    type TestBackend = Autodiff<NdArray>;
    type EventLog = Rc<RefCell<Vec<String>>>;

    const EXPERT: &str = "BrainP";
    const LEARNER: &str = "BrainE";

    /// Two-brain simulation with one agent each; the expert alternates actions 0 and 1
    struct ScriptedEnv {
        name: String,
        brains: HashMap<String, BrainParameters>,
        steps: usize,
        drop_expert_at: Option<usize>,
        silent_expert_at: Option<usize>,
        log: EventLog,
    }

    impl ScriptedEnv {
        fn new(log: &EventLog) -> Self {
            let brains = [EXPERT, LEARNER]
                .into_iter()
                .map(|name| {
                    let params = BrainParameters {
                        name: name.to_string(),
                        state_space_size: 2,
                        stacked_states: 1,
                        action_space_size: 2,
                        action_kind: ActionKind::Discrete,
                    };
                    (name.to_string(), params)
                })
                .collect();

            Self {
                name: "builds/Tag.x86_64".to_string(),
                brains,
                steps: 0,
                drop_expert_at: None,
                silent_expert_at: None,
                log: log.clone(),
            }
        }

        fn infos(&self, expert_action: Option<Action>) -> BrainInfos {
            let t = self.steps as f32;
            let mut infos = BrainInfos::new();
            if self.drop_expert_at != Some(self.steps) {
                infos.insert(
                    EXPERT.to_string(),
                    AgentBatch {
                        states: vec![vec![t, 1.0]],
                        previous_actions: expert_action.into_iter().collect(),
                        rewards: vec![0.0],
                        local_done: vec![false],
                    },
                );
            }
            infos.insert(
                LEARNER.to_string(),
                AgentBatch {
                    states: vec![vec![t, -1.0]],
                    previous_actions: Vec::new(),
                    rewards: vec![0.5],
                    local_done: vec![false],
                },
            );
            infos
        }
    }

    impl Environment for ScriptedEnv {
        fn name(&self) -> &str {
            &self.name
        }

        fn brain_parameters(&self, brain: &str) -> Option<&BrainParameters> {
            self.brains.get(brain)
        }

        fn reset(&mut self, _fast: bool) -> Result<BrainInfos> {
            self.log.borrow_mut().push("reset".to_string());
            Ok(self.infos(None))
        }

        fn step(&mut self, brain: &str, actions: &[Action]) -> Result<BrainInfos> {
            assert_eq!(brain, LEARNER);
            assert_eq!(actions.len(), 1);
            self.steps += 1;
            self.log.borrow_mut().push(format!("step {}", self.steps));
            if self.silent_expert_at == Some(self.steps) {
                return Ok(self.infos(None));
            }
            Ok(self.infos(Some(Action::Discrete(self.steps % 2))))
        }

        fn close(&mut self) -> Result<()> {
            self.log.borrow_mut().push("close".to_string());
            Ok(())
        }
    }

    struct RecordingSink {
        log: EventLog,
    }

    impl<B: AutodiffBackend> ModelSink<B> for RecordingSink {
        fn restore(&mut self, _policy: &mut Policy<B>) -> Result<usize> {
            self.log.borrow_mut().push("restore".to_string());
            Ok(0)
        }

        fn save(&mut self, _policy: &Policy<B>, step: usize) -> Result<PathBuf> {
            self.log.borrow_mut().push(format!("save {}", step));
            Ok(PathBuf::from(format!("checkpoint_{:08}.mpk", step)))
        }

        fn export(&mut self, _policy: &Policy<B>, graph_name: &str) -> Result<PathBuf> {
            self.log.borrow_mut().push(format!("export {}", graph_name));
            Ok(PathBuf::from(format!("{}.bytes", graph_name)))
        }
    }

    fn config(dir: &TempDir) -> RunConfig {
        RunConfig {
            batch_size: 2,
            max_steps: 3,
            hidden_units: 8,
            num_layers: 1,
            learning_rate: 1e-2,
            train: true,
            model_dir: dir.path().to_path_buf(),
            seed: Some(3),
            ..RunConfig::default()
        }
    }

    fn trainer(config: RunConfig, log: &EventLog) -> Trainer<TestBackend, RecordingSink> {
        let sink = RecordingSink { log: log.clone() };
        Trainer::new(config, sink, Default::default())
    }

    fn events(log: &EventLog, prefix: &str) -> Vec<String> {
        log.borrow()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    #[test]
    fn test_three_step_run() {
        let dir = tempdir().unwrap();
        let log = EventLog::default();
        let report = trainer(config(&dir), &log)
            .run(ScriptedEnv::new(&log))
            .unwrap();

        assert_eq!(report.steps, 3);
        assert_eq!(report.losses.len(), 3);
        assert_eq!(report.losses[0], 0.0);
        assert_eq!(report.updates, vec![0, 1, 1]);
        assert!(report.losses[1] > 0.0 && report.losses[2] > 0.0);
        assert_eq!(report.expert_pairs, 3);
        assert!((report.cumulative_reward - 1.5).abs() < 1e-6);
        assert_eq!(report.export_path, Some(PathBuf::from("Tag.bytes")));
    }

    #[test]
    fn test_export_once_after_close() {
        let dir = tempdir().unwrap();
        let log = EventLog::default();
        trainer(config(&dir), &log)
            .run(ScriptedEnv::new(&log))
            .unwrap();

        let log = log.borrow();
        let close = log.iter().position(|e| e == "close").unwrap();
        let exports: Vec<_> = log
            .iter()
            .enumerate()
            .filter(|(_, e)| e.starts_with("export"))
            .collect();
        assert_eq!(exports.len(), 1);
        assert!(exports[0].0 > close);
        assert_eq!(exports[0].1, "export Tag");
        assert_eq!(log.iter().filter(|e| *e == "close").count(), 1);
    }

    #[test]
    fn test_checkpoint_cadence_with_final_save() {
        let dir = tempdir().unwrap();
        let log = EventLog::default();
        let config = RunConfig {
            max_steps: 7,
            save_freq: 3,
            ..config(&dir)
        };
        let report = trainer(config, &log).run(ScriptedEnv::new(&log)).unwrap();

        assert_eq!(events(&log, "save"), vec!["save 3", "save 6", "save 7"]);
        assert_eq!(report.checkpoints.len(), 3);
    }

    #[test]
    fn test_final_step_not_saved_twice() {
        let dir = tempdir().unwrap();
        let log = EventLog::default();
        let config = RunConfig {
            max_steps: 6,
            save_freq: 3,
            ..config(&dir)
        };
        trainer(config, &log).run(ScriptedEnv::new(&log)).unwrap();

        assert_eq!(events(&log, "save"), vec!["save 3", "save 6"]);
    }

    #[test]
    fn test_inference_only_run() {
        let dir = tempdir().unwrap();
        let log = EventLog::default();
        let config = RunConfig {
            train: false,
            save_freq: 1,
            ..config(&dir)
        };
        let report = trainer(config, &log).run(ScriptedEnv::new(&log)).unwrap();

        assert_eq!(report.steps, 3);
        assert!(report.losses.is_empty());
        assert!(events(&log, "save").is_empty());
        assert_eq!(events(&log, "export").len(), 1);
    }

    #[test]
    fn test_zero_steps() {
        let dir = tempdir().unwrap();
        let log = EventLog::default();
        let config = RunConfig {
            max_steps: 0,
            ..config(&dir)
        };
        let report = trainer(config, &log).run(ScriptedEnv::new(&log)).unwrap();

        assert_eq!(report.steps, 0);
        assert!(events(&log, "step").is_empty());
        assert!(events(&log, "save").is_empty());
        assert_eq!(events(&log, "export").len(), 1);
    }

    #[test]
    fn test_load_restores_before_reset() {
        let dir = tempdir().unwrap();
        let log = EventLog::default();
        let config = RunConfig {
            load: true,
            ..config(&dir)
        };
        trainer(config, &log).run(ScriptedEnv::new(&log)).unwrap();

        let log = log.borrow();
        assert_eq!(log[0], "restore");
        assert_eq!(log[1], "reset");
    }

    #[test]
    fn test_environment_closed_on_error() {
        let dir = tempdir().unwrap();
        let log = EventLog::default();
        let mut env = ScriptedEnv::new(&log);
        env.drop_expert_at = Some(2);

        let result = trainer(config(&dir), &log).run(env);
        assert!(matches!(result, Err(Error::MissingBrain(ref name)) if name == EXPERT));
        assert_eq!(events(&log, "close").len(), 1);
        assert!(events(&log, "export").is_empty());
    }

    #[test]
    fn test_step_without_expert_actions_aborts() {
        let dir = tempdir().unwrap();
        let log = EventLog::default();
        let mut env = ScriptedEnv::new(&log);
        env.silent_expert_at = Some(2);

        let result = trainer(config(&dir), &log).run(env);
        assert!(matches!(
            result,
            Err(Error::BufferMisaligned {
                states: 2,
                actions: 1
            })
        ));
        assert_eq!(events(&log, "step").len(), 2);
        assert_eq!(events(&log, "close").len(), 1);
        assert!(events(&log, "export").is_empty());
    }

    #[test]
    fn test_buffer_smaller_than_batch_records_zero_loss() {
        let dir = tempdir().unwrap();
        let log = EventLog::default();
        let config = RunConfig {
            batch_size: 8,
            ..config(&dir)
        };
        let report = trainer(config, &log).run(ScriptedEnv::new(&log)).unwrap();

        assert_eq!(report.steps, 3);
        assert_eq!(report.expert_pairs, 3);
        assert_eq!(report.losses, vec![0.0, 0.0, 0.0]);
        assert_eq!(report.updates, vec![0, 0, 0]);
    }

    #[test]
    fn test_step_budget_is_a_ceiling() {
        let dir = tempdir().unwrap();
        let log = EventLog::default();
        let config = RunConfig {
            max_steps: 5,
            ..config(&dir)
        };
        trainer(config, &log).run(ScriptedEnv::new(&log)).unwrap();

        assert_eq!(events(&log, "step").len(), 5);
    }

    #[test]
    fn test_mismatched_brains_rejected() {
        let dir = tempdir().unwrap();
        let log = EventLog::default();
        let mut env = ScriptedEnv::new(&log);
        if let Some(learner) = env.brains.get_mut(LEARNER) {
            learner.action_space_size = 5;
        }

        let result = trainer(config(&dir), &log).run(env);
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(events(&log, "close").len(), 1);
    }

    #[test]
    fn test_summary_rows_written() {
        let dir = tempdir().unwrap();
        let log = EventLog::default();
        trainer(config(&dir), &log)
            .run(ScriptedEnv::new(&log))
            .unwrap();

        let summary = std::fs::read_to_string(dir.path().join("summary.csv")).unwrap();
        assert_eq!(summary.lines().count(), 4);
    }
}
