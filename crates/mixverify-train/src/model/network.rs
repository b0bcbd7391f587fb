//! Verification head over two tower outputs.

use super::layers::glorot_uniform;
use super::tower::{ResidualTower, TowerNorms};
use super::TowerConfig;
use candle_core::{Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use mixverify_core::{
    FrameGeometry, Phase, Result, VerifierError, HIDDEN_DIM, NUM_CLASSES, WEIGHT_DECAY,
};

/// Which input a tower pass belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    A,
    B,
}

/// Full network topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub tower: TowerConfig,
    /// `(rows, cols)` of each input spectrogram.
    pub input_size: (usize, usize),
    pub hidden_dim: usize,
}

impl NetworkConfig {
    /// 50-layer towers over 64x23 spectrograms.
    pub fn production() -> Self {
        Self {
            tower: TowerConfig::resnet50(),
            input_size: FrameGeometry::default().image_size(),
            hidden_dim: HIDDEN_DIM,
        }
    }

    /// Width of the concatenated, flattened tower outputs.
    pub fn flat_dim(&self) -> usize {
        let (h, w) = self.tower.output_size(self.input_size);
        2 * self.tower.out_channels() * h * w
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::production()
    }
}

/// Two-tower verifier.
///
/// Parameters are registered under `tower.*` (shared kernels), `norm_a.*`,
/// `norm_b.*` and `head.fc1` / `head.fc2`.
pub struct VerificationNetwork {
    config: NetworkConfig,
    tower: ResidualTower,
    norms_a: TowerNorms,
    norms_b: TowerNorms,
    fc1: Linear,
    fc2: Linear,
}

impl VerificationNetwork {
    pub fn new(config: NetworkConfig, vb: VarBuilder) -> Result<Self> {
        let tower = ResidualTower::new(config.tower.clone(), vb.pp("tower"))?;
        let norms_a = TowerNorms::new(&config.tower, vb.pp("norm_a"))?;
        let norms_b = TowerNorms::new(&config.tower, vb.pp("norm_b"))?;

        let head = vb.pp("head");
        let flat = config.flat_dim();
        let fc1 = head.pp("fc1").get_with_hints(
            (config.hidden_dim, flat),
            "weight",
            glorot_uniform(flat, config.hidden_dim),
        )?;
        let fc2 = head.pp("fc2").get_with_hints(
            (NUM_CLASSES, config.hidden_dim),
            "weight",
            glorot_uniform(config.hidden_dim, NUM_CLASSES),
        )?;

        Ok(Self {
            config,
            tower,
            norms_a,
            norms_b,
            fc1: Linear::new(fc1, None),
            fc2: Linear::new(fc2, None),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn tower(&self) -> &ResidualTower {
        &self.tower
    }

    pub fn fc1_weight(&self) -> &Tensor {
        self.fc1.weight()
    }

    /// Tower output for one input.
    pub fn features(&self, x: &Tensor, branch: Branch, phase: Phase) -> Result<Tensor> {
        let norms = match branch {
            Branch::A => &self.norms_a,
            Branch::B => &self.norms_b,
        };
        self.tower.forward(x, norms, phase)
    }

    /// Unnormalized class scores `[n, 2]`.
    pub fn forward(&self, a: &Tensor, b: &Tensor, phase: Phase) -> Result<Tensor> {
        if a.dims() != b.dims() {
            return Err(VerifierError::ShapeMismatch(format!(
                "input A {:?} vs input B {:?}",
                a.dims(),
                b.dims()
            )));
        }
        let fa = self.features(a, Branch::A, phase)?;
        let fb = self.features(b, Branch::B, phase)?;
        let joined = Tensor::cat(&[&fa, &fb], 1)?.flatten_from(1)?;
        if joined.dim(1)? != self.config.flat_dim() {
            return Err(VerifierError::ShapeMismatch(format!(
                "flattened features have width {}, head expects {}",
                joined.dim(1)?,
                self.config.flat_dim()
            )));
        }
        let hidden = self.fc1.forward(&joined)?.relu()?;
        Ok(self.fc2.forward(&hidden)?)
    }

    /// Cross-entropy against one-hot `labels` plus `0.01 * ||W_fc1||^2 / 2`.
    pub fn loss(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
        let cross_entropy = (labels * &log_probs)?.sum(D::Minus1)?.neg()?.mean_all()?;
        let l2 = (self.fc1.weight().sqr()?.sum_all()? * 0.5)?;
        Ok((cross_entropy + (l2 * WEIGHT_DECAY)?)?)
    }
}

/// Class probabilities from logits.
pub fn probabilities(logits: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::ops::softmax(logits, D::Minus1)?)
}

/// Rows whose predicted class matches the one-hot label.
pub fn correct_predictions(logits: &Tensor, labels: &Tensor) -> Result<usize> {
    let predicted: Vec<u32> = logits.argmax(D::Minus1)?.to_vec1()?;
    let expected: Vec<u32> = labels.argmax(D::Minus1)?.to_vec1()?;
    Ok(predicted
        .iter()
        .zip(&expected)
        .filter(|(p, e)| p == e)
        .count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StageSpec;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> NetworkConfig {
        NetworkConfig {
            tower: TowerConfig {
                in_channels: 1,
                stem_channels: 4,
                stages: vec![StageSpec::new(4, 2, 8, 1)],
            },
            input_size: (16, 12),
            hidden_dim: 6,
        }
    }

    fn build(config: NetworkConfig) -> (VarMap, VerificationNetwork) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = VerificationNetwork::new(config, vb).unwrap();
        (varmap, net)
    }

    #[test]
    fn test_production_flat_dim() {
        assert_eq!(NetworkConfig::production().flat_dim(), 98_304);
        assert_eq!(NetworkConfig::production().input_size, (64, 23));
    }

    #[test]
    fn test_forward_shape_and_probabilities() {
        let (_, net) = build(tiny_config());
        let a = Tensor::randn(0f32, 1.0, (3, 1, 16, 12), &Device::Cpu).unwrap();
        let b = Tensor::randn(0f32, 1.0, (3, 1, 16, 12), &Device::Cpu).unwrap();
        let logits = net.forward(&a, &b, Phase::Train).unwrap();
        assert_eq!(logits.dims(), &[3, 2]);

        let probs: Vec<Vec<f32>> = probabilities(&logits).unwrap().to_vec2().unwrap();
        for row in probs {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_forward_rejects_mismatched_inputs() {
        let (_, net) = build(tiny_config());
        let a = Tensor::zeros((2, 1, 16, 12), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 1, 16, 12), DType::F32, &Device::Cpu).unwrap();
        assert!(net.forward(&a, &b, Phase::Validate).is_err());

        let wrong = Tensor::zeros((2, 1, 32, 12), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            net.forward(&wrong, &wrong, Phase::Validate),
            Err(VerifierError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_loss_includes_fc1_decay() {
        let (_, net) = build(tiny_config());
        let logits = Tensor::new(&[[0.0f32, 0.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        let loss: f32 = net.loss(&logits, &labels).unwrap().to_scalar().unwrap();

        let sq: f32 = net
            .fc1_weight()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        let expected = std::f32::consts::LN_2 + 0.01 * sq / 2.0;
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_correct_predictions() {
        let logits = Tensor::new(&[[2.0f32, 1.0], [0.0, 3.0], [5.0, -1.0]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[1.0f32, 0.0], [1.0, 0.0], [1.0, 0.0]], &Device::Cpu).unwrap();
        assert_eq!(correct_predictions(&logits, &labels).unwrap(), 2);
    }

    #[test]
    fn test_kernels_registered_once() {
        let (varmap, net) = build(tiny_config());
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        let kernels = names
            .iter()
            .filter(|n| n.starts_with("tower.") && n.ends_with(".weight"))
            .count();
        assert_eq!(kernels, net.tower().kernels().len());
        assert!(names.iter().all(|n| !n.starts_with("tower_b")));
        assert!(names.iter().any(|n| n.starts_with("norm_a.stem.")));
        assert!(names.iter().any(|n| n.starts_with("norm_b.stem.")));
        assert!(names.contains(&"head.fc1.weight".to_string()));
        assert!(names.contains(&"head.fc2.weight".to_string()));

        // Per-branch state is normalization only: no kernels outside the tower.
        let data = varmap.data().lock().unwrap();
        for (name, var) in data.iter() {
            if var.as_tensor().rank() == 4 {
                assert!(name.starts_with("tower."), "{name}");
            }
            if name.starts_with("norm_") {
                assert_eq!(var.as_tensor().rank(), 1, "{name}");
            }
        }
    }
}
