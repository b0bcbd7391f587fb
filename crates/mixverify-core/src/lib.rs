//! Core types for mixverify.
//!
//! Shared by the training crate and the `train-verifier` binary:
//!
//! - signal-processing and architecture constants
//! - [`FrameGeometry`], the window / segment sizes derived from a sample rate
//! - [`Phase`], the TRAIN / VALIDATE / TEST selector
//! - [`TrainConfig`] and its YAML loader ([`config`])
//! - [`VerifierError`] and the crate-wide [`Result`] alias

pub mod config;

pub use config::{LoggingConfig, ShortClipPolicy, TrainConfig};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Sample rate the corpus is recorded at.
pub const SAMPLE_RATE: u32 = 48_000;

/// Length of one analysis window in seconds.
pub const WINDOW_SECONDS: f64 = 0.05;

/// Length of one STFT segment in seconds.
pub const SEGMENT_SECONDS: f64 = 0.005;

/// Overlap between consecutive STFT segments in seconds.
pub const OVERLAP_SECONDS: f64 = 0.003;

/// Number of frequency rows kept from each spectrogram.
pub const SIZE_FFT: usize = 64;

/// RMS energy a window must exceed to be used as an anchor.
pub const VAD_THRESHOLD: f32 = 0.05;

/// Output classes: `[distinct, contains]`.
pub const NUM_CLASSES: usize = 2;

/// Batch-norm running-average decay, TensorFlow convention.
pub const BATCH_NORM_DECAY: f64 = 0.997;

/// Batch-norm variance epsilon.
pub const BATCH_NORM_EPSILON: f64 = 1e-5;

/// L2 coefficient on the first dense layer.
pub const WEIGHT_DECAY: f64 = 0.01;

/// Hidden width of the classification head.
pub const HIDDEN_DIM: usize = 2048;

// ---------------------------------------------------------------------------
// Frame geometry
// ---------------------------------------------------------------------------

/// Window and STFT sizes derived from a sample rate.
///
/// At 48 kHz: 2400-sample windows, 240-sample segments with 144 samples of
/// overlap, giving 23 spectrogram columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub sample_rate: u32,
    /// Samples per analysis window.
    pub window_len: usize,
    /// Samples per STFT segment.
    pub nperseg: usize,
    /// Overlapping samples between segments.
    pub noverlap: usize,
    /// FFT length (equal to `nperseg`).
    pub nfft: usize,
    /// Spectrogram columns per window.
    pub size_cols: usize,
}

impl FrameGeometry {
    pub fn for_sample_rate(sample_rate: u32) -> Self {
        let sr = f64::from(sample_rate);
        let window_len = (WINDOW_SECONDS * sr).round() as usize;
        let nperseg = (SEGMENT_SECONDS * sr).round() as usize;
        let noverlap = (OVERLAP_SECONDS * sr).round() as usize;
        let hop = nperseg - noverlap;
        let size_cols = (window_len - nperseg).div_ceil(hop);
        Self {
            sample_rate,
            window_len,
            nperseg,
            noverlap,
            nfft: nperseg,
            size_cols,
        }
    }

    /// Distance between the starts of consecutive STFT segments.
    pub fn hop(&self) -> usize {
        self.nperseg - self.noverlap
    }

    /// Spectrogram image size `(rows, cols)` fed to the network.
    pub fn image_size(&self) -> (usize, usize) {
        (SIZE_FFT, self.size_cols)
    }
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self::for_sample_rate(SAMPLE_RATE)
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Which corpus a pass reads and whether parameters may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Train,
    Validate,
    Test,
}

impl Phase {
    /// Batch-norm uses batch statistics and the optimizer steps only in TRAIN.
    pub fn is_training(self) -> bool {
        matches!(self, Phase::Train)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Validate => "val",
            Phase::Test => "test",
        }
    }

    /// Stable index used when deriving per-pass RNG seeds.
    pub fn index(self) -> u64 {
        match self {
            Phase::Train => 0,
            Phase::Validate => 1,
            Phase::Test => 2,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error types.
#[derive(thiserror::Error, Debug)]
pub enum VerifierError {
    /// A corpus file or directory could not be read or decoded.
    #[error("Corpus read error for {path}: {reason}")]
    CorpusRead {
        /// Offending file or directory.
        path: PathBuf,
        /// Underlying cause.
        reason: String,
    },

    /// A waveform or window does not have the length an operation needs.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A checkpoint could not be written or loaded.
    #[error("Checkpoint error for {path}: {reason}")]
    CheckpointIo {
        /// Checkpoint file.
        path: PathBuf,
        /// Underlying cause.
        reason: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The background batch producer stopped unexpectedly.
    #[error("Data pipeline error: {0}")]
    Pipeline(String),

    /// Tensor runtime failure.
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Results or scalar log write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Scalar stream serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for `std::result::Result<T, VerifierError>`.
pub type Result<T> = std::result::Result<T, VerifierError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
