//! Training pipeline for the two-tower audio mixture verifier.
//!
//! Clips are decoded ([`audio`]), cut into voiced windows and paired into
//! positive / negative examples ([`synth`]), converted to spectrograms
//! ([`features`]), shuffled into minibatches ([`batch`], [`loader`]) and fed to
//! the [`model`] by the [`trainer`], which sequences epochs with
//! [`phase::RunState`] and persists parameters through [`checkpoint`].

pub mod audio;
pub mod batch;
pub mod checkpoint;
pub mod device;
pub mod features;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod phase;
pub mod synth;
pub mod trainer;

pub use audio::{list_corpus, ClipReader, MemoryReader, SymphoniaReader, Waveform};
pub use batch::{BatchAssembler, HostBatch, Minibatch};
pub use features::{Spectrogram, SpectrogramExtractor};
pub use model::{NetworkConfig, StageSpec, TowerConfig, VerificationNetwork};
pub use phase::RunState;
pub use synth::{Example, ExamplePair, ExampleSynthesizer, Label, PassStats};
pub use trainer::{train, EpochSummary, PhaseSummary, Trainer};
