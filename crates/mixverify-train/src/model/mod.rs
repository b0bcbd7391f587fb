//! Two-tower residual verification network.
//!
//! # Architecture
//!
//! ```text
//! A ─┐                                   ┌─ tower(A; norms_a) ─┐
//!    ├─ shared kernels (ResidualTower) ──┤                     ├─ concat ─ flatten ─ fc1(2048) ─ ReLU ─ fc2(2) ─ softmax
//! B ─┘                                   └─ tower(B; norms_b) ─┘
//!
//! tower: 7x7/2 conv ─ BN ─ ReLU ─ 2x2/2 max pool
//!        ─ stage1 (3 units, 64→256) ─ stage2 (4, 256→512)
//!        ─ stage3 (6, 512→1024)     ─ stage4 (3, 1024→2048)
//!        ─ 7x7/2 avg pool
//! ```
//!
//! Every stage convolution has stride 1, so the spatial size set by the stem
//! is kept through all four stages.

pub mod layers;
pub mod network;
pub mod tower;

pub use network::{correct_predictions, Branch, NetworkConfig, VerificationNetwork};
pub use tower::{BottleneckUnit, ResidualTower, Shortcut, TowerNorms, UnitNorms, UnitSpec};

use mixverify_core::{Result, VerifierError};

/// Stem convolution kernel and stride.
pub const STEM_KERNEL: usize = 7;
pub const STEM_STRIDE: usize = 2;

/// Max pool after the stem.
pub const STEM_POOL: usize = 2;

/// Average pool closing the tower.
pub const TAIL_POOL_KERNEL: usize = 7;
pub const TAIL_POOL_STRIDE: usize = 2;

/// One stage of bottleneck units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub in_channels: usize,
    pub mid_channels: usize,
    pub out_channels: usize,
    pub units: usize,
}

impl StageSpec {
    pub const fn new(
        in_channels: usize,
        mid_channels: usize,
        out_channels: usize,
        units: usize,
    ) -> Self {
        Self {
            in_channels,
            mid_channels,
            out_channels,
            units,
        }
    }

    /// Per-unit layout: the first unit projects when the width changes, the
    /// rest map `out_channels` to itself.
    pub fn unit_specs(&self) -> Vec<UnitSpec> {
        (0..self.units)
            .map(|i| {
                let in_channels = if i == 0 {
                    self.in_channels
                } else {
                    self.out_channels
                };
                let shortcut = if in_channels == self.out_channels {
                    Shortcut::Identity
                } else {
                    Shortcut::Projection
                };
                UnitSpec {
                    in_channels,
                    mid_channels: self.mid_channels,
                    out_channels: self.out_channels,
                    shortcut,
                }
            })
            .collect()
    }
}

/// Layer topology of one tower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TowerConfig {
    pub in_channels: usize,
    pub stem_channels: usize,
    pub stages: Vec<StageSpec>,
}

impl TowerConfig {
    /// 50-layer bottleneck topology.
    pub fn resnet50() -> Self {
        Self {
            in_channels: 1,
            stem_channels: 64,
            stages: vec![
                StageSpec::new(64, 64, 256, 3),
                StageSpec::new(256, 128, 512, 4),
                StageSpec::new(512, 256, 1024, 6),
                StageSpec::new(1024, 512, 2048, 3),
            ],
        }
    }

    /// Channels of the tower output.
    pub fn out_channels(&self) -> usize {
        self.stages
            .last()
            .map(|s| s.out_channels)
            .unwrap_or(self.stem_channels)
    }

    /// Spatial size of the tower output for an `(h, w)` input.
    pub fn output_size(&self, (h, w): (usize, usize)) -> (usize, usize) {
        let down = |x: usize| {
            let x = x.div_ceil(STEM_STRIDE);
            let x = x.div_ceil(STEM_POOL);
            x.div_ceil(TAIL_POOL_STRIDE)
        };
        (down(h), down(w))
    }

    /// Channel counts must chain from the stem through every stage.
    pub fn validate(&self) -> Result<()> {
        let mut channels = self.stem_channels;
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.units == 0 {
                return Err(VerifierError::Config(format!("stage{} has no units", i + 1)));
            }
            if stage.in_channels != channels {
                return Err(VerifierError::Config(format!(
                    "stage{} expects {} input channels, previous layer yields {}",
                    i + 1,
                    stage.in_channels,
                    channels
                )));
            }
            channels = stage.out_channels;
        }
        Ok(())
    }
}
