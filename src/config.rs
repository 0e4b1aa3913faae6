//! Run configuration - parsed once from the command line and environment

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::env::unity::port_for;
use crate::error::{Error, Result};

/// Directory that holds one sub-directory per run
pub const MODELS_DIR: &str = "./models";

/// Command line interface; every option can also come from an `IMITATE_*` variable
#[derive(Parser, Debug, Clone)]
#[command(
    name = "imitate",
    version,
    about = "Online behavioral cloning of an expert brain inside a simulation"
)]
pub struct Args {
    /// Path to the simulation binary
    #[arg(value_name = "ENV", env = "IMITATE_ENV")]
    pub env: PathBuf,

    /// How many experiences per gradient descent update step
    #[arg(long, env = "IMITATE_BATCH_SIZE", default_value_t = 64)]
    pub batch_size: usize,

    /// How many batches per epoch
    #[arg(long, env = "IMITATE_EPOCH_BATCHES", default_value_t = 25)]
    pub epoch_batches: usize,

    /// Run the simulation at training speed
    #[arg(long, env = "IMITATE_FAST")]
    pub fast: bool,

    /// Number of units in each hidden layer
    #[arg(long, env = "IMITATE_HIDDEN_UNITS", default_value_t = 128)]
    pub hidden_units: usize,

    /// How many model checkpoints to keep
    #[arg(long, env = "IMITATE_KEEP_CHECKPOINTS", default_value_t = 5)]
    pub keep_checkpoints: usize,

    #[arg(long, env = "IMITATE_LEARNING_RATE", default_value_t = 1e-4)]
    pub learning_rate: f64,

    /// Restore the latest checkpoint instead of initializing randomly
    #[arg(long, env = "IMITATE_LOAD")]
    pub load: bool,

    /// Maximum number of environment steps
    #[arg(long, env = "IMITATE_MAX_STEPS", default_value = "5e3", value_parser = parse_count)]
    pub max_steps: usize,

    /// Number of hidden layers between the input layer and the output
    #[arg(long, env = "IMITATE_NUM_LAYERS", default_value_t = 2)]
    pub num_layers: usize,

    /// Sub-directory of ./models for checkpoints, summaries and the exported graph
    #[arg(long, env = "IMITATE_RUN_PATH", default_value = "ppo")]
    pub run_path: String,

    /// Steps between checkpoints
    #[arg(long, env = "IMITATE_SAVE_FREQ", default_value = "50000", value_parser = parse_count)]
    pub save_freq: usize,

    /// Train the model; without this flag the policy only runs inference
    #[arg(long, env = "IMITATE_TRAIN")]
    pub train: bool,

    /// Added to the base port (5005); lets several environments run side by side
    #[arg(long, env = "IMITATE_WORKER_ID", default_value_t = 0)]
    pub worker_id: u16,

    /// Brain whose actions are cloned
    #[arg(long, env = "IMITATE_EXPERT_BRAIN", default_value = "BrainP")]
    pub expert_brain: String,

    /// Brain driven by the learned policy
    #[arg(long, env = "IMITATE_LEARNER_BRAIN", default_value = "BrainE")]
    pub learner_brain: String,

    /// Steps between progress log lines
    #[arg(long, env = "IMITATE_LOG_FREQ", default_value_t = 100)]
    pub log_freq: usize,

    /// Seed for mini-batch shuffling
    #[arg(long, env = "IMITATE_SEED")]
    pub seed: Option<u64>,

    /// Seconds to wait for the simulation to accept connections
    #[arg(long, env = "IMITATE_TIMEOUT_WAIT", default_value_t = 60)]
    pub timeout_wait: u64,
}

/// Accepts plain integers and whole numbers in scientific notation ("5e3")
pub fn parse_count(value: &str) -> std::result::Result<usize, String> {
    if let Ok(n) = value.parse::<usize>() {
        return Ok(n);
    }
    match value.parse::<f64>() {
        Ok(n) if n.is_finite() && n >= 0.0 && n.fract() == 0.0 && n <= usize::MAX as f64 => {
            Ok(n as usize)
        }
        _ => Err(format!("{} is not a whole non-negative number", value)),
    }
}

/// Immutable hyperparameters and paths for one run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub env_path: PathBuf,
    pub batch_size: usize,
    pub epoch_batches: usize,
    pub fast: bool,
    pub hidden_units: usize,
    pub keep_checkpoints: usize,
    pub learning_rate: f64,
    pub load: bool,
    pub max_steps: usize,
    pub num_layers: usize,
    /// Where checkpoints, summaries and the exported graph go
    pub model_dir: PathBuf,
    pub save_freq: usize,
    pub train: bool,
    pub worker_id: u16,
    pub expert_brain: String,
    pub learner_brain: String,
    pub log_freq: usize,
    pub seed: Option<u64>,
    pub timeout_wait: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            env_path: PathBuf::from("environment"),
            batch_size: 64,
            epoch_batches: 25,
            fast: false,
            hidden_units: 128,
            keep_checkpoints: 5,
            learning_rate: 1e-4,
            load: false,
            max_steps: 5000,
            num_layers: 2,
            model_dir: PathBuf::from(MODELS_DIR).join("ppo"),
            save_freq: 50000,
            train: false,
            worker_id: 0,
            expert_brain: "BrainP".to_string(),
            learner_brain: "BrainE".to_string(),
            log_freq: 100,
            seed: None,
            timeout_wait: Duration::from_secs(60),
        }
    }
}

impl RunConfig {
    /// Reject values the training loop cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));

        if self.batch_size == 0 {
            return fail("batch size must be at least 1");
        }
        if self.save_freq == 0 {
            return fail("save frequency must be at least 1");
        }
        if self.log_freq == 0 {
            return fail("log frequency must be at least 1");
        }
        if self.hidden_units == 0 {
            return fail("hidden units must be at least 1");
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return fail("learning rate must be a positive number");
        }
        if self.expert_brain == self.learner_brain {
            return fail("expert and learner brains must differ");
        }
        port_for(self.worker_id)?;
        Ok(())
    }
}

impl TryFrom<Args> for RunConfig {
    type Error = Error;

    fn try_from(args: Args) -> Result<Self> {
        let config = RunConfig {
            env_path: args.env,
            batch_size: args.batch_size,
            epoch_batches: args.epoch_batches,
            fast: args.fast,
            hidden_units: args.hidden_units,
            keep_checkpoints: args.keep_checkpoints,
            learning_rate: args.learning_rate,
            load: args.load,
            max_steps: args.max_steps,
            num_layers: args.num_layers,
            model_dir: PathBuf::from(MODELS_DIR).join(&args.run_path),
            save_freq: args.save_freq,
            train: args.train,
            worker_id: args.worker_id,
            expert_brain: args.expert_brain,
            learner_brain: args.learner_brain,
            log_freq: args.log_freq,
            seed: args.seed,
            timeout_wait: Duration::from_secs(args.timeout_wait),
        };
        config.validate()?;
        Ok(config)
    }
}
