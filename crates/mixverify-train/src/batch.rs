//! Minibatch assembly.
//!
//! Example pairs accumulate in three parallel arrays. Once at least
//! `batch_size` examples are pending the arrays are co-permuted with one
//! random permutation and handed out as a [`HostBatch`]. Because examples
//! arrive in pairs a batch can hold `batch_size + 1` rows. Whatever is pending
//! when a pass ends is dropped.

use crate::features::Spectrogram;
use crate::synth::{ExamplePair, Label};
use candle_core::{Device, Tensor};
use mixverify_core::{Result, VerifierError, NUM_CLASSES};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

/// Shuffled batch still in host memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostBatch {
    pub a: Vec<Spectrogram>,
    pub b: Vec<Spectrogram>,
    pub labels: Vec<Label>,
}

/// Batch on the compute device.
#[derive(Debug, Clone)]
pub struct Minibatch {
    /// `[n, 1, rows, cols]`
    pub a: Tensor,
    /// `[n, 1, rows, cols]`
    pub b: Tensor,
    /// One-hot `[n, 2]`
    pub labels: Tensor,
}

impl Minibatch {
    pub fn rows(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }
}

impl HostBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Stack into NCHW tensors on `device`.
    pub fn to_device(&self, device: &Device) -> Result<Minibatch> {
        let n = self.len();
        let (rows, cols) = match self.a.first() {
            Some(first) => (first.shape()[0], first.shape()[1]),
            None => {
                return Err(VerifierError::ShapeMismatch(
                    "cannot stack an empty batch".to_string(),
                ))
            }
        };

        let a = stack_images(&self.a, rows, cols, device)?;
        let b = stack_images(&self.b, rows, cols, device)?;
        let one_hot: Vec<f32> = self.labels.iter().flat_map(|l| l.one_hot()).collect();
        let labels = Tensor::from_vec(one_hot, (n, NUM_CLASSES), device)?;

        Ok(Minibatch { a, b, labels })
    }
}

fn stack_images(
    images: &[Spectrogram],
    rows: usize,
    cols: usize,
    device: &Device,
) -> Result<Tensor> {
    let mut data = Vec::with_capacity(images.len() * rows * cols);
    for image in images {
        if image.shape() != [rows, cols, 1] {
            return Err(VerifierError::ShapeMismatch(format!(
                "spectrogram shape {:?} in a batch of {:?}",
                image.shape(),
                [rows, cols, 1]
            )));
        }
        data.extend(image.iter().copied());
    }
    Ok(Tensor::from_vec(data, (images.len(), 1, rows, cols), device)?)
}

/// Collects example pairs into shuffled batches.
pub struct BatchAssembler {
    batch_size: usize,
    pending: HostBatch,
    rng: ChaCha8Rng,
}

impl BatchAssembler {
    pub fn new(batch_size: usize, rng: ChaCha8Rng) -> Self {
        Self {
            batch_size,
            pending: HostBatch::default(),
            rng,
        }
    }

    /// Examples waiting for the next batch.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Add both examples of a pair; returns a batch once the threshold is met.
    pub fn push_pair(&mut self, pair: ExamplePair) -> Option<HostBatch> {
        for example in [pair.positive, pair.negative] {
            self.pending.a.push(example.a);
            self.pending.b.push(example.b);
            self.pending.labels.push(example.label);
        }

        if self.pending.len() >= self.batch_size {
            let full = std::mem::take(&mut self.pending);
            Some(self.shuffle(full))
        } else {
            None
        }
    }

    /// Drop the partial batch left at the end of a pass, returning its size.
    pub fn discard_remainder(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending = HostBatch::default();
        dropped
    }

    fn shuffle(&mut self, batch: HostBatch) -> HostBatch {
        let mut order: Vec<usize> = (0..batch.len()).collect();
        order.shuffle(&mut self.rng);

        let HostBatch { a, b, labels } = batch;
        let mut a: Vec<Option<Spectrogram>> = a.into_iter().map(Some).collect();
        let mut b: Vec<Option<Spectrogram>> = b.into_iter().map(Some).collect();

        let mut out = HostBatch {
            a: Vec::with_capacity(order.len()),
            b: Vec::with_capacity(order.len()),
            labels: Vec::with_capacity(order.len()),
        };
        for &i in &order {
            if let (Some(sa), Some(sb)) = (a[i].take(), b[i].take()) {
                out.a.push(sa);
                out.b.push(sb);
                out.labels.push(labels[i]);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::Example;
    use ndarray::Array3;
    use rand::SeedableRng;

    fn image(value: f32) -> Spectrogram {
        Array3::from_elem((4, 3, 1), value)
    }

    /// Pair whose images encode the pair index so rows can be matched back.
    fn tagged_pair(i: usize) -> ExamplePair {
        let tag = i as f32;
        ExamplePair {
            positive: Example {
                a: image(tag),
                b: image(tag + 0.25),
                label: Label::Contains,
            },
            negative: Example {
                a: image(tag),
                b: image(tag + 0.75),
                label: Label::Distinct,
            },
        }
    }

    fn assembler(batch_size: usize) -> BatchAssembler {
        BatchAssembler::new(batch_size, ChaCha8Rng::seed_from_u64(7))
    }

    #[test]
    fn test_batch_released_at_threshold() {
        let mut asm = assembler(4);
        assert!(asm.push_pair(tagged_pair(0)).is_none());
        assert_eq!(asm.pending(), 2);
        let batch = asm.push_pair(tagged_pair(1)).unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn test_odd_batch_size_overshoots_by_one() {
        let mut asm = assembler(3);
        assert!(asm.push_pair(tagged_pair(0)).is_none());
        let batch = asm.push_pair(tagged_pair(1)).unwrap();
        assert_eq!(batch.len(), 4);
    }

    #[test]
    fn test_co_permutation_keeps_rows_aligned() {
        let mut asm = assembler(16);
        let mut batch = None;
        for i in 0..8 {
            batch = asm.push_pair(tagged_pair(i));
        }
        let batch = batch.unwrap();
        assert_eq!(batch.len(), 16);

        let mut seen = std::collections::HashSet::new();
        for i in 0..batch.len() {
            let tag = batch.a[i][[0, 0, 0]];
            let offset = batch.b[i][[0, 0, 0]] - tag;
            match batch.labels[i] {
                Label::Contains => assert!((offset - 0.25).abs() < 1e-6),
                Label::Distinct => assert!((offset - 0.75).abs() < 1e-6),
            }
            assert!(seen.insert((tag as usize, batch.labels[i])));
        }
        assert_eq!(seen.len(), 16);

        let original_order: Vec<f32> = (0..8).flat_map(|i| [i as f32, i as f32]).collect();
        let shuffled_order: Vec<f32> = batch.a.iter().map(|s| s[[0, 0, 0]]).collect();
        assert_ne!(original_order, shuffled_order);
    }

    #[test]
    fn test_remainder_is_discarded() {
        let mut asm = assembler(10);
        for i in 0..3 {
            assert!(asm.push_pair(tagged_pair(i)).is_none());
        }
        assert_eq!(asm.discard_remainder(), 6);
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn test_to_device_layout() {
        let device = Device::Cpu;
        let batch = HostBatch {
            a: vec![image(1.0), image(2.0)],
            b: vec![image(3.0), image(4.0)],
            labels: vec![Label::Contains, Label::Distinct],
        };
        let mb = batch.to_device(&device).unwrap();
        assert_eq!(mb.a.dims(), &[2, 1, 4, 3]);
        assert_eq!(mb.b.dims(), &[2, 1, 4, 3]);
        assert_eq!(mb.rows(), 2);

        let labels: Vec<Vec<f32>> = mb.labels.to_vec2().unwrap();
        assert_eq!(labels, vec![vec![0.0, 1.0], vec![1.0, 0.0]]);

        let second: Vec<f32> = mb.b.get(1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(second.iter().all(|v| *v == 4.0));
    }

    #[test]
    fn test_to_device_rejects_mixed_shapes() {
        let batch = HostBatch {
            a: vec![image(1.0), Array3::zeros((4, 2, 1))],
            b: vec![image(1.0), image(1.0)],
            labels: vec![Label::Contains, Label::Distinct],
        };
        assert!(batch.to_device(&Device::Cpu).is_err());
        assert!(HostBatch::default().to_device(&Device::Cpu).is_err());
    }
}
