//! Training configuration and its YAML loader.
//!
//! A [`TrainConfig`] is built once (defaults, then an optional YAML file, then
//! command-line overrides), validated, and passed by reference to the
//! synthesizer and the training loop.

use crate::{Result, VerifierError, VAD_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What to do when a randomly drawn partner clip is shorter than one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortClipPolicy {
    /// Exclude the short clip and draw another partner; skip the anchor when
    /// no eligible partner remains.
    #[default]
    Redraw,
    /// Skip the anchor window.
    SkipAnchor,
    /// Abort synthesis with [`VerifierError::ShapeMismatch`].
    Fail,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `text` (human-readable) or `json` (structured).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Training run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Fixed SGD learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Number of epochs to run.
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    /// Examples per minibatch (a batch may hold one more, see the assembler).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Corpus read during TRAIN.
    #[serde(default = "default_train_dir")]
    pub train_dir: PathBuf,
    /// Corpus read during VALIDATE.
    #[serde(default = "default_valid_dir")]
    pub valid_dir: PathBuf,
    /// Corpus read during TEST (final epoch only).
    #[serde(default = "default_test_dir")]
    pub test_dir: PathBuf,
    /// Base seed for file shuffles, partner draws and batch permutations.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Directory receiving checkpoints and metric logs.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Prefix of every artifact name; derived from the learning rate and
    /// epoch count when absent.
    #[serde(default)]
    pub run_name: Option<String>,
    /// Emit a progress line every this many batches.
    #[serde(default = "default_log_every")]
    pub log_every: usize,
    /// RMS threshold for anchor windows.
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,
    /// Handling of partner clips shorter than one window.
    #[serde(default)]
    pub short_clip_policy: ShortClipPolicy,
    /// Batches synthesized ahead on a loader thread; 0 synthesizes inline.
    #[serde(default)]
    pub prefetch_batches: usize,
    /// Logging setup for the binary.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_learning_rate() -> f64 {
    0.01
}

fn default_num_epochs() -> usize {
    10
}

fn default_batch_size() -> usize {
    10
}

fn default_train_dir() -> PathBuf {
    PathBuf::from("data/train")
}

fn default_valid_dir() -> PathBuf {
    PathBuf::from("data/valid")
}

fn default_test_dir() -> PathBuf {
    PathBuf::from("data/test")
}

fn default_seed() -> u64 {
    42
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_log_every() -> usize {
    100
}

fn default_vad_threshold() -> f32 {
    VAD_THRESHOLD
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            num_epochs: default_num_epochs(),
            batch_size: default_batch_size(),
            train_dir: default_train_dir(),
            valid_dir: default_valid_dir(),
            test_dir: default_test_dir(),
            seed: default_seed(),
            output_dir: default_output_dir(),
            run_name: None,
            log_every: default_log_every(),
            vad_threshold: default_vad_threshold(),
            short_clip_policy: ShortClipPolicy::default(),
            prefetch_batches: 0,
            logging: LoggingConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Load a [`TrainConfig`] from a YAML file at `path`.
    ///
    /// Fields missing from the file take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the YAML is invalid.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            VerifierError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parse a [`TrainConfig`] from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| VerifierError::Config(format!("Failed to parse config YAML: {e}")))
    }

    /// Reject settings the training loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(VerifierError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(VerifierError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.log_every == 0 {
            return Err(VerifierError::Config(
                "log_every must be at least 1".to_string(),
            ));
        }
        if !(self.vad_threshold.is_finite() && self.vad_threshold >= 0.0) {
            return Err(VerifierError::Config(format!(
                "vad_threshold must be non-negative, got {}",
                self.vad_threshold
            )));
        }
        Ok(())
    }

    /// Artifact prefix: the configured run name or `verifier_<lr>_<epochs>`.
    pub fn run_name(&self) -> String {
        self.run_name
            .clone()
            .unwrap_or_else(|| format!("verifier_{}_{}", self.learning_rate, self.num_epochs))
    }

    /// Corpus directory read during `phase`.
    pub fn corpus_dir(&self, phase: crate::Phase) -> &Path {
        match phase {
            crate::Phase::Train => &self.train_dir,
            crate::Phase::Validate => &self.valid_dir,
            crate::Phase::Test => &self.test_dir,
        }
    }

    /// Directory holding the per-epoch checkpoints.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.output_dir.join(self.run_name())
    }

    /// Append-only progress log.
    pub fn results_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}_results.txt", self.run_name()))
    }

    /// JSON-lines scalar stream.
    pub fn scalars_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}_scalars.jsonl", self.run_name()))
    }
}
