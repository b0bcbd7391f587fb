//! Online training-example synthesis.
//!
//! One pass walks a shuffled corpus, cuts each clip into disjoint windows,
//! keeps the windows whose RMS clears the VAD threshold as anchors, and for
//! every anchor mixes in a random window from a different clip:
//!
//! ```text
//! positive: (spec(a1), spec(a1 + a2), Contains)
//! negative: (spec(a1), spec(a2),      Distinct)
//! ```

use crate::audio::ClipReader;
use crate::features::{Spectrogram, SpectrogramExtractor};
use mixverify_core::{
    FrameGeometry, Phase, Result, ShortClipPolicy, TrainConfig, VerifierError,
};
use rand::seq::SliceRandom;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Ground truth for one example.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    /// B does not contain A. One-hot `[1, 0]`.
    Distinct,
    /// B is a mixture containing A. One-hot `[0, 1]`.
    Contains,
}

impl Label {
    pub fn one_hot(self) -> [f32; 2] {
        match self {
            Label::Distinct => [1.0, 0.0],
            Label::Contains => [0.0, 1.0],
        }
    }

    /// Index of the hot entry.
    pub fn class_index(self) -> usize {
        match self {
            Label::Distinct => 0,
            Label::Contains => 1,
        }
    }
}

/// One labeled spectrogram pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub a: Spectrogram,
    pub b: Spectrogram,
    pub label: Label,
}

/// The two examples produced by one anchor window.
#[derive(Debug, Clone, PartialEq)]
pub struct ExamplePair {
    pub positive: Example,
    pub negative: Example,
}

/// Counters for one synthesis pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub files: usize,
    pub windows: usize,
    pub anchors: usize,
    pub positives: usize,
    pub negatives: usize,
    pub skipped_anchors: usize,
}

/// Root-mean-square amplitude.
pub fn rms(window: &[f32]) -> f32 {
    if window.is_empty() {
        return 0.0;
    }
    let energy: f64 = window.iter().map(|&x| f64::from(x) * f64::from(x)).sum();
    (energy / window.len() as f64).sqrt() as f32
}

/// Seed for the pass over `phase` in `epoch`.
pub fn pass_seed(seed: u64, epoch: usize, phase: Phase) -> u64 {
    seed.wrapping_add((epoch as u64).wrapping_mul(3))
        .wrapping_add(phase.index())
}

/// RNG for one pass; the batch assembler uses a different stream of the
/// same seed.
pub fn pass_rng(seed: u64, epoch: usize, phase: Phase) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(pass_seed(seed, epoch, phase))
}

/// Builds example pairs from a corpus.
pub struct ExampleSynthesizer {
    reader: Arc<dyn ClipReader>,
    extractor: SpectrogramExtractor,
    vad_threshold: f32,
    policy: ShortClipPolicy,
}

impl ExampleSynthesizer {
    pub fn new(
        reader: Arc<dyn ClipReader>,
        geometry: FrameGeometry,
        vad_threshold: f32,
        policy: ShortClipPolicy,
    ) -> Self {
        Self {
            reader,
            extractor: SpectrogramExtractor::new(geometry),
            vad_threshold,
            policy,
        }
    }

    pub fn from_config(reader: Arc<dyn ClipReader>, config: &TrainConfig) -> Self {
        Self::new(
            reader,
            FrameGeometry::default(),
            config.vad_threshold,
            config.short_clip_policy,
        )
    }

    pub fn geometry(&self) -> &FrameGeometry {
        self.extractor.geometry()
    }

    /// Start offsets of the full windows in `clip` that pass the VAD gate.
    ///
    /// Windows are disjoint; a trailing partial window is never visited.
    pub fn anchor_starts<'a>(&'a self, clip: &'a [f32]) -> impl Iterator<Item = usize> + 'a {
        let len = self.geometry().window_len;
        (0..clip.len() / len)
            .map(move |i| i * len)
            .filter(move |&start| rms(&clip[start..start + len]) > self.vad_threshold)
    }

    /// Run one pass over `files`, handing every pair to `emit`.
    ///
    /// The file order is shuffled with `rng`, which also drives partner
    /// selection.
    pub fn run<F>(&self, files: &[PathBuf], rng: &mut ChaCha8Rng, mut emit: F) -> Result<PassStats>
    where
        F: FnMut(ExamplePair) -> Result<()>,
    {
        let window_len = self.geometry().window_len;
        let mut order: Vec<PathBuf> = files.to_vec();
        order.shuffle(rng);

        let mut stats = PassStats::default();
        let mut short_clips: HashSet<PathBuf> = HashSet::new();

        for anchor_path in &order {
            let clip = self.reader.read(anchor_path)?;
            stats.files += 1;
            stats.windows += clip.len() / window_len;
            if clip.sample_rate != self.geometry().sample_rate {
                tracing::warn!(
                    path = %anchor_path.display(),
                    sample_rate = clip.sample_rate,
                    expected = self.geometry().sample_rate,
                    "Clip sample rate differs from the configured rate"
                );
            }

            let starts: Vec<usize> = self.anchor_starts(&clip.samples).collect();
            for start in starts {
                let a1 = &clip.samples[start..start + window_len];
                let Some(a2) = self.draw_partner(&order, anchor_path, &mut short_clips, rng)?
                else {
                    stats.skipped_anchors += 1;
                    continue;
                };
                stats.anchors += 1;

                let pair = self.build_pair(a1, &a2)?;
                stats.positives += 1;
                stats.negatives += 1;
                emit(pair)?;
            }
        }

        tracing::debug!(
            files = stats.files,
            anchors = stats.anchors,
            skipped = stats.skipped_anchors,
            "Synthesis pass finished"
        );
        Ok(stats)
    }

    /// Positive and negative example for one anchor / partner window pair.
    pub fn build_pair(&self, a1: &[f32], a2: &[f32]) -> Result<ExamplePair> {
        let mixed: Vec<f32> = a1.iter().zip(a2.iter()).map(|(x, y)| x + y).collect();
        let spec_a1 = self.extractor.extract(a1)?;
        let spec_mixed = self.extractor.extract(&mixed)?;
        let spec_a2 = self.extractor.extract(a2)?;

        Ok(ExamplePair {
            positive: Example {
                a: spec_a1.clone(),
                b: spec_mixed,
                label: Label::Contains,
            },
            negative: Example {
                a: spec_a1,
                b: spec_a2,
                label: Label::Distinct,
            },
        })
    }

    /// A random window from a random clip other than `anchor`.
    ///
    /// Returns `None` when the anchor should be skipped.
    fn draw_partner(
        &self,
        files: &[PathBuf],
        anchor: &Path,
        short_clips: &mut HashSet<PathBuf>,
        rng: &mut ChaCha8Rng,
    ) -> Result<Option<Vec<f32>>> {
        let window_len = self.geometry().window_len;
        let mut candidates: Vec<&PathBuf> = files
            .iter()
            .filter(|p| p.as_path() != anchor)
            .filter(|p| self.policy != ShortClipPolicy::Redraw || !short_clips.contains(*p))
            .collect();

        while !candidates.is_empty() {
            let pick = rng.gen_range(0..candidates.len());
            let path = candidates[pick];
            let clip = self.reader.read(path)?;

            if clip.len() >= window_len {
                let start = rng.gen_range(0..=clip.len() - window_len);
                return Ok(Some(clip.samples[start..start + window_len].to_vec()));
            }

            match self.policy {
                ShortClipPolicy::Redraw => {
                    tracing::warn!(
                        path = %path.display(),
                        samples = clip.len(),
                        "Partner clip shorter than one window, drawing another"
                    );
                    short_clips.insert(path.clone());
                    candidates.swap_remove(pick);
                }
                ShortClipPolicy::SkipAnchor => {
                    tracing::warn!(
                        path = %path.display(),
                        samples = clip.len(),
                        "Partner clip shorter than one window, skipping anchor"
                    );
                    return Ok(None);
                }
                ShortClipPolicy::Fail => {
                    return Err(VerifierError::ShapeMismatch(format!(
                        "partner clip {} has {} samples, shorter than one {}-sample window",
                        path.display(),
                        clip.len(),
                        window_len
                    )));
                }
            }
        }

        match self.policy {
            ShortClipPolicy::Fail => Err(VerifierError::ShapeMismatch(format!(
                "no partner clip of at least {window_len} samples for {}",
                anchor.display()
            ))),
            _ => {
                tracing::warn!(
                    anchor = %anchor.display(),
                    "No eligible partner clip, skipping anchor"
                );
                Ok(None)
            }
        }
    }
}
