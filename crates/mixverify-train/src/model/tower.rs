//! Residual tower: stem, bottleneck stages and the closing average pool.
//!
//! Convolution kernels live in [`ResidualTower`] and are shared by both
//! inputs. Batch-norm scale, shift and running statistics live in a
//! [`TowerNorms`] per input.

use super::layers::{avg_pool_same, batch_norm, max_pool_same, normalize, SameConv};
use super::{
    StageSpec, TowerConfig, STEM_KERNEL, STEM_POOL, STEM_STRIDE, TAIL_POOL_KERNEL,
    TAIL_POOL_STRIDE,
};
use candle_core::{Module, Tensor};
use candle_nn::{BatchNorm, VarBuilder};
use mixverify_core::{Phase, Result, VerifierError};

/// How a unit's input reaches the residual sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shortcut {
    /// Input added unchanged; requires `in_channels == out_channels`.
    Identity,
    /// 1x1 convolution + batch norm to `out_channels`.
    Projection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitSpec {
    pub in_channels: usize,
    pub mid_channels: usize,
    pub out_channels: usize,
    pub shortcut: Shortcut,
}

impl UnitSpec {
    fn check(&self) -> Result<()> {
        if self.shortcut == Shortcut::Identity && self.in_channels != self.out_channels {
            return Err(VerifierError::Config(format!(
                "identity shortcut needs equal widths, got {} -> {}",
                self.in_channels, self.out_channels
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bottleneck unit
// ---------------------------------------------------------------------------

/// 1x1 reduce, 3x3, 1x1 expand, plus shortcut.
#[derive(Debug, Clone)]
pub struct BottleneckUnit {
    spec: UnitSpec,
    conv1: SameConv,
    conv2: SameConv,
    conv3: SameConv,
    projection: Option<SameConv>,
}

/// Batch norms of one bottleneck unit.
#[derive(Debug, Clone)]
pub struct UnitNorms {
    bn1: BatchNorm,
    bn2: BatchNorm,
    bn3: BatchNorm,
    projection: Option<BatchNorm>,
}

impl BottleneckUnit {
    pub fn new(spec: UnitSpec, vb: VarBuilder) -> Result<Self> {
        spec.check()?;
        let UnitSpec {
            in_channels: c_in,
            mid_channels: mid,
            out_channels: c_out,
            shortcut,
        } = spec;
        let projection = match shortcut {
            Shortcut::Projection => Some(SameConv::new(c_in, c_out, 1, 1, vb.pp("shortcut"))?),
            Shortcut::Identity => None,
        };
        Ok(Self {
            spec,
            conv1: SameConv::new(c_in, mid, 1, 1, vb.pp("conv1"))?,
            conv2: SameConv::new(mid, mid, 3, 1, vb.pp("conv2"))?,
            conv3: SameConv::new(mid, c_out, 1, 1, vb.pp("conv3"))?,
            projection,
        })
    }

    pub fn spec(&self) -> &UnitSpec {
        &self.spec
    }

    /// Kernels in layer order, shortcut last.
    pub fn kernels(&self) -> Vec<&Tensor> {
        let mut out = vec![self.conv1.weight(), self.conv2.weight(), self.conv3.weight()];
        if let Some(p) = &self.projection {
            out.push(p.weight());
        }
        out
    }

    pub fn forward(&self, x: &Tensor, norms: &UnitNorms, phase: Phase) -> Result<Tensor> {
        let channels = x.dim(1)?;
        if channels != self.spec.in_channels {
            return Err(VerifierError::ShapeMismatch(format!(
                "unit expects {} channels, got {}",
                self.spec.in_channels, channels
            )));
        }

        let shortcut = match (&self.projection, &norms.projection) {
            (Some(conv), Some(bn)) => normalize(bn, &conv.forward(x)?, phase)?,
            (None, None) => x.clone(),
            _ => {
                return Err(VerifierError::ShapeMismatch(
                    "unit norms do not match the shortcut kind".to_string(),
                ))
            }
        };

        let h = normalize(&norms.bn1, &self.conv1.forward(x)?, phase)?.relu()?;
        let h = normalize(&norms.bn2, &self.conv2.forward(&h)?, phase)?.relu()?;
        let h = normalize(&norms.bn3, &self.conv3.forward(&h)?, phase)?;
        Ok((h + shortcut)?.relu()?)
    }
}

impl UnitNorms {
    pub fn new(spec: UnitSpec, vb: VarBuilder) -> Result<Self> {
        spec.check()?;
        let projection = match spec.shortcut {
            Shortcut::Projection => Some(batch_norm(spec.out_channels, vb.pp("shortcut_bn"))?),
            Shortcut::Identity => None,
        };
        Ok(Self {
            bn1: batch_norm(spec.mid_channels, vb.pp("bn1"))?,
            bn2: batch_norm(spec.mid_channels, vb.pp("bn2"))?,
            bn3: batch_norm(spec.out_channels, vb.pp("bn3"))?,
            projection,
        })
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

fn build_stage(spec: &StageSpec, vb: VarBuilder) -> Result<Vec<BottleneckUnit>> {
    spec.unit_specs()
        .into_iter()
        .enumerate()
        .map(|(i, unit)| BottleneckUnit::new(unit, vb.pp(format!("unit{}", i + 1))))
        .collect()
}

fn build_stage_norms(spec: &StageSpec, vb: VarBuilder) -> Result<Vec<UnitNorms>> {
    spec.unit_specs()
        .into_iter()
        .enumerate()
        .map(|(i, unit)| UnitNorms::new(unit, vb.pp(format!("unit{}", i + 1))))
        .collect()
}

// ---------------------------------------------------------------------------
// Tower
// ---------------------------------------------------------------------------

/// Shared convolution kernels of one tower.
#[derive(Debug, Clone)]
pub struct ResidualTower {
    config: TowerConfig,
    stem: SameConv,
    stages: Vec<Vec<BottleneckUnit>>,
}

/// Per-input batch norms matching a [`ResidualTower`].
#[derive(Debug, Clone)]
pub struct TowerNorms {
    stem: BatchNorm,
    stages: Vec<Vec<UnitNorms>>,
}

impl ResidualTower {
    pub fn new(config: TowerConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let stem = SameConv::new(
            config.in_channels,
            config.stem_channels,
            STEM_KERNEL,
            STEM_STRIDE,
            vb.pp("stem"),
        )?;
        let stages = config
            .stages
            .iter()
            .enumerate()
            .map(|(i, spec)| build_stage(spec, vb.pp(format!("stage{}", i + 1))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            stem,
            stages,
        })
    }

    pub fn config(&self) -> &TowerConfig {
        &self.config
    }

    /// Every convolution kernel, stem first.
    pub fn kernels(&self) -> Vec<&Tensor> {
        let mut out = vec![self.stem.weight()];
        for unit in self.stages.iter().flatten() {
            out.extend(unit.kernels());
        }
        out
    }

    /// `[n, C_in, H, W]` to `[n, C_out, h, w]`.
    pub fn forward(&self, x: &Tensor, norms: &TowerNorms, phase: Phase) -> Result<Tensor> {
        if norms.stages.len() != self.stages.len()
            || norms
                .stages
                .iter()
                .zip(&self.stages)
                .any(|(n, s)| n.len() != s.len())
        {
            return Err(VerifierError::ShapeMismatch(
                "tower norms do not match the tower topology".to_string(),
            ));
        }

        let h = normalize(&norms.stem, &self.stem.forward(x)?, phase)?.relu()?;
        let mut h = max_pool_same(&h, STEM_POOL, STEM_POOL)?;
        for (units, unit_norms) in self.stages.iter().zip(&norms.stages) {
            for (unit, n) in units.iter().zip(unit_norms) {
                h = unit.forward(&h, n, phase)?;
            }
        }
        Ok(avg_pool_same(&h, TAIL_POOL_KERNEL, TAIL_POOL_STRIDE)?)
    }
}

impl TowerNorms {
    pub fn new(config: &TowerConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let stem = batch_norm(config.stem_channels, vb.pp("stem"))?;
        let stages = config
            .stages
            .iter()
            .enumerate()
            .map(|(i, spec)| build_stage_norms(spec, vb.pp(format!("stage{}", i + 1))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { stem, stages })
    }
}
