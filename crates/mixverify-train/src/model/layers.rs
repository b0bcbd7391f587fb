//! Convolution, normalization and pooling with TensorFlow `SAME` padding.
//!
//! Candle pads symmetrically, so `SAME` padding is applied explicitly with
//! zero padding split `floor/ceil` between the two sides.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Init, VarBuilder};
use mixverify_core::{Phase, BATCH_NORM_DECAY, BATCH_NORM_EPSILON};

/// `(before, after)` padding for one spatial dimension.
pub fn same_padding(input: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let out = input.div_ceil(stride);
    let total = ((out.max(1) - 1) * stride + kernel).saturating_sub(input);
    (total / 2, total - total / 2)
}

/// Zero-pad an NCHW tensor so a `kernel`/`stride` window yields
/// `ceil(size / stride)` outputs per spatial dimension.
pub fn pad_same(x: &Tensor, kernel: usize, stride: usize) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    let (top, bottom) = same_padding(h, kernel, stride);
    let (left, right) = same_padding(w, kernel, stride);
    let x = if top + bottom > 0 {
        x.pad_with_zeros(2, top, bottom)?
    } else {
        x.clone()
    };
    if left + right > 0 {
        x.pad_with_zeros(3, left, right)
    } else {
        Ok(x)
    }
}

/// Glorot / Xavier uniform initializer.
pub fn glorot_uniform(fan_in: usize, fan_out: usize) -> Init {
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -limit,
        up: limit,
    }
}

/// Bias-free square convolution with `SAME` padding.
#[derive(Debug, Clone)]
pub struct SameConv {
    conv: Conv2d,
    kernel: usize,
    stride: usize,
}

impl SameConv {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let receptive = kernel * kernel;
        let weight = vb.get_with_hints(
            (out_channels, in_channels, kernel, kernel),
            "weight",
            glorot_uniform(receptive * in_channels, receptive * out_channels),
        )?;
        let config = Conv2dConfig {
            padding: 0,
            stride,
            ..Default::default()
        };
        Ok(Self {
            conv: Conv2d::new(weight, None, config),
            kernel,
            stride,
        })
    }

    pub fn weight(&self) -> &Tensor {
        self.conv.weight()
    }
}

impl Module for SameConv {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = pad_same(x, self.kernel, self.stride)?;
        self.conv.forward(&x)
    }
}

/// Per-channel batch norm with learned scale and shift.
///
/// Candle blends running statistics as `(1 - m) * running + m * batch`, the
/// complement of the TensorFlow decay.
pub fn batch_norm(channels: usize, vb: VarBuilder) -> Result<BatchNorm> {
    let config = BatchNormConfig {
        eps: BATCH_NORM_EPSILON,
        remove_mean: true,
        affine: true,
        momentum: 1.0 - BATCH_NORM_DECAY,
    };
    candle_nn::batch_norm(channels, config, vb)
}

/// Batch statistics in TRAIN (running averages refreshed), running
/// statistics otherwise.
pub fn normalize(bn: &BatchNorm, x: &Tensor, phase: Phase) -> Result<Tensor> {
    bn.forward_t(x, phase.is_training())
}

/// `SAME` max pool for non-negative inputs.
///
/// Inputs come straight from a ReLU, so zero padding never wins the max.
pub fn max_pool_same(x: &Tensor, kernel: usize, stride: usize) -> Result<Tensor> {
    pad_same(x, kernel, stride)?.max_pool2d_with_stride(kernel, stride)
}

/// `SAME` average pool; padded cells do not count toward the mean.
///
/// Window sums come from a stride-`stride` convolution with an all-ones
/// kernel over each channel plane, which stays differentiable for any
/// kernel/stride pair. Each sum is divided by the number of real cells the
/// window covered.
pub fn avg_pool_same(x: &Tensor, kernel: usize, stride: usize) -> Result<Tensor> {
    let (n, c, h, w) = x.dims4()?;
    let ones = Tensor::ones((1, 1, kernel, kernel), x.dtype(), x.device())?;
    let window_sum = |t: &Tensor| -> Result<Tensor> {
        pad_same(t, kernel, stride)?.conv2d(&ones, 0, stride, 1, 1)
    };

    let summed = window_sum(&x.reshape((n * c, 1, h, w))?)?;
    let coverage = window_sum(&Tensor::ones((1, 1, h, w), x.dtype(), x.device())?)?;
    let (_, _, out_h, out_w) = summed.dims4()?;
    summed.broadcast_div(&coverage)?.reshape((n, c, out_h, out_w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    #[test]
    fn test_same_padding() {
        assert_eq!(same_padding(64, 7, 2), (2, 3));
        assert_eq!(same_padding(23, 7, 2), (3, 3));
        assert_eq!(same_padding(16, 3, 1), (1, 1));
        assert_eq!(same_padding(16, 1, 1), (0, 0));
        assert_eq!(same_padding(32, 2, 2), (0, 0));
        assert_eq!(same_padding(16, 7, 2), (2, 3));
        assert_eq!(same_padding(6, 7, 2), (2, 3));
    }

    #[test]
    fn test_same_conv_output_size() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let conv = SameConv::new(1, 4, 7, 2, vb.pp("stem")).unwrap();
        let x = Tensor::zeros((2, 1, 64, 23), DType::F32, &device).unwrap();
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 4, 32, 12]);
        assert_eq!(conv.weight().dims(), &[4, 1, 7, 7]);
    }

    #[test]
    fn test_glorot_limits() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let conv = SameConv::new(8, 16, 3, 1, vb).unwrap();
        let limit = (6.0f32 / (9.0 * 8.0 + 9.0 * 16.0)).sqrt();
        let values: Vec<f32> = conv.weight().flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.abs() <= limit));
        assert!(values.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_avg_pool_excludes_padding() {
        let device = Device::Cpu;
        let x = Tensor::ones((1, 2, 6, 5), DType::F32, &device).unwrap();
        let y = avg_pool_same(&x, 7, 2).unwrap();
        assert_eq!(y.dims(), &[1, 2, 3, 3]);
        let values: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_avg_pool_window_means() {
        let device = Device::Cpu;
        let data: Vec<f32> = (0..9).map(|v| v as f32).collect();
        let x = Tensor::from_vec(data, (1, 1, 3, 3), &device).unwrap();
        let y = avg_pool_same(&x, 3, 2).unwrap();
        assert_eq!(y.dims(), &[1, 1, 2, 2]);
        let values: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        for (got, want) in values.iter().zip([2.0f32, 3.0, 5.0, 6.0]) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
    }

    #[test]
    fn test_avg_pool_backward() {
        let device = Device::Cpu;
        let x = Var::ones((1, 2, 16, 6), DType::F32, &device).unwrap();
        let y = avg_pool_same(x.as_tensor(), 7, 2).unwrap();
        assert_eq!(y.dims(), &[1, 2, 8, 3]);

        let grads = y.sum_all().unwrap().backward().unwrap();
        let grad = grads.get(x.as_tensor()).unwrap();
        assert_eq!(grad.dims(), &[1, 2, 16, 6]);
        // Each output is a mean, so its gradients sum to one.
        let total: f32 = grad.sum_all().unwrap().to_scalar().unwrap();
        assert!((total - 48.0).abs() < 1e-4, "{total}");
        let values: Vec<f32> = grad.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| *v > 0.0));
    }

    #[test]
    fn test_max_pool_same_odd_width() {
        let device = Device::Cpu;
        let data: Vec<f32> = (0..15).map(|v| v as f32).collect();
        let x = Tensor::from_vec(data, (1, 1, 3, 5), &device).unwrap();
        let y = max_pool_same(&x, 2, 2).unwrap();
        assert_eq!(y.dims(), &[1, 1, 2, 3]);
        let values: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![6.0, 8.0, 9.0, 11.0, 13.0, 14.0]);
    }

    #[test]
    fn test_batch_norm_train_refreshes_running_mean() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let bn = batch_norm(1, vb.pp("bn")).unwrap();
        let x = Tensor::full(2.0f32, (4, 1, 2, 2), &device).unwrap();

        normalize(&bn, &x, Phase::Validate).unwrap();
        let before: Vec<f32> = bn.running_mean().to_vec1().unwrap();
        assert_eq!(before, vec![0.0]);

        normalize(&bn, &x, Phase::Train).unwrap();
        let after: Vec<f32> = bn.running_mean().to_vec1().unwrap();
        assert!((after[0] - 2.0 * (1.0 - BATCH_NORM_DECAY as f32)).abs() < 1e-6);
    }
}
