//! Run statistics and CSV summaries for imitation training

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::Result;

/// Moving average calculator
#[derive(Debug, Clone)]
pub struct MovingAverage {
    values: VecDeque<f32>,
    window_size: usize,
    sum: f32,
}

impl MovingAverage {
    pub fn new(window_size: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(window_size),
            window_size,
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f32) {
        if self.values.len() >= self.window_size {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
        self.values.push_back(value);
        self.sum += value;
    }

    pub fn average(&self) -> f32 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f32
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Per-step training history
#[derive(Debug)]
pub struct TrainingStats {
    /// Mean batch loss of each step's training round (0 when the round was skipped)
    pub losses: Vec<f32>,
    /// Gradient updates performed at each step
    pub updates: Vec<usize>,
    /// Sum of all learner rewards (diagnostic only)
    pub cumulative_reward: f32,
    /// Steps taken so far
    pub steps: usize,
    recent_loss: MovingAverage,
    start_time: Instant,
}

impl TrainingStats {
    pub fn new(window_size: usize) -> Self {
        Self {
            losses: Vec::new(),
            updates: Vec::new(),
            cumulative_reward: 0.0,
            steps: 0,
            recent_loss: MovingAverage::new(window_size.max(1)),
            start_time: Instant::now(),
        }
    }

    /// Record one environment step; `round` is (mean loss, updates) when training is on
    pub fn record_step(&mut self, reward: f32, round: Option<(f32, usize)>) {
        self.steps += 1;
        self.cumulative_reward += reward;

        if let Some((loss, updates)) = round {
            self.losses.push(loss);
            self.updates.push(updates);
            self.recent_loss.push(loss);
        }
    }

    pub fn total_updates(&self) -> usize {
        self.updates.iter().sum()
    }

    pub fn recent_loss(&self) -> f32 {
        self.recent_loss.average()
    }

    pub fn steps_per_second(&self) -> f64 {
        let duration = self.start_time.elapsed().as_secs_f64();
        if duration > 0.0 {
            self.steps as f64 / duration
        } else {
            0.0
        }
    }

    /// Log current metrics to console
    pub fn log_to_console(&self, buffer_len: usize) {
        tracing::info!(
            "Step {} | SPS {:.1} | loss={:.4} | reward={:.2} | expert pairs={}",
            self.steps,
            self.steps_per_second(),
            self.recent_loss(),
            self.cumulative_reward,
            buffer_len
        );
    }
}

impl Default for TrainingStats {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Appends one row per step to `summary.csv` in the run directory
pub struct SummaryWriter {
    path: PathBuf,
    file: File,
}

impl SummaryWriter {
    pub fn create(run_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(run_dir)?;
        let path = run_dir.join("summary.csv");

        let file_exists = path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if !file_exists {
            writeln!(file, "step,loss,updates,cumulative_reward,expert_pairs")?;
        }

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_step(&mut self, stats: &TrainingStats, buffer_len: usize) -> Result<()> {
        let (loss, updates) = match (stats.losses.last(), stats.updates.last()) {
            (Some(loss), Some(updates)) => (loss.to_string(), updates.to_string()),
            _ => (String::new(), String::new()),
        };
        writeln!(
            self.file,
            "{},{},{},{},{}",
            stats.steps, loss, updates, stats.cumulative_reward, buffer_len
        )?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        tracing::info!("Run summary saved to {}", self.path.display());
        Ok(())
    }
}
