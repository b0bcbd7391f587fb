//! Spectrogram feature extraction.
//!
//! Turns one fixed-length window into the `(64, SIZE_COLS, 1)` image the
//! towers consume:
//!
//! 1. Split into overlapping segments, remove each segment's mean
//! 2. Periodic Hamming window, two-sided FFT, power spectral density scaling
//! 3. Standardize every time column over all frequency rows
//! 4. Keep the first [`SIZE_FFT`] rows

use mixverify_core::{FrameGeometry, Result, VerifierError, SIZE_FFT};
use ndarray::{s, Array2, Array3, Axis};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

/// Standardized spectrogram, shape `(SIZE_FFT, size_cols, 1)`.
pub type Spectrogram = Array3<f32>;

/// Scales below this are treated as zero variance.
const MIN_SCALE: f64 = 10.0 * f64::EPSILON;

/// Periodic Hamming window of length `n`.
pub fn hamming_window(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.54 - 0.46 * ((2.0 * PI * i as f64) / n as f64).cos())
        .collect()
}

/// Reusable STFT plan for one [`FrameGeometry`].
pub struct SpectrogramExtractor {
    geometry: FrameGeometry,
    window: Vec<f64>,
    density_scale: f64,
    fft: Arc<dyn Fft<f64>>,
}

impl SpectrogramExtractor {
    pub fn new(geometry: FrameGeometry) -> Self {
        let window = hamming_window(geometry.nperseg);
        let window_power: f64 = window.iter().map(|w| w * w).sum();
        let density_scale = 1.0 / (f64::from(geometry.sample_rate) * window_power);
        let fft = FftPlanner::<f64>::new().plan_fft_forward(geometry.nfft);
        Self {
            geometry,
            window,
            density_scale,
            fft,
        }
    }

    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    /// Two-sided power spectral density, shape `(nfft, segments)`.
    pub fn power_spectrum(&self, window: &[f32]) -> Result<Array2<f64>> {
        let g = &self.geometry;
        if window.len() != g.window_len {
            return Err(VerifierError::ShapeMismatch(format!(
                "spectrogram input has {} samples, expected {}",
                window.len(),
                g.window_len
            )));
        }

        let segments = (g.window_len - g.nperseg) / g.hop() + 1;
        let mut psd = Array2::<f64>::zeros((g.nfft, segments));
        let mut buffer = vec![Complex::new(0.0, 0.0); g.nfft];

        for seg in 0..segments {
            let start = seg * g.hop();
            let frame = &window[start..start + g.nperseg];
            let mean = frame.iter().map(|&x| f64::from(x)).sum::<f64>() / g.nperseg as f64;

            buffer.fill(Complex::new(0.0, 0.0));
            for (i, (&x, &w)) in frame.iter().zip(self.window.iter()).enumerate() {
                buffer[i] = Complex::new((f64::from(x) - mean) * w, 0.0);
            }
            self.fft.process(&mut buffer);

            for (k, bin) in buffer.iter().enumerate() {
                psd[[k, seg]] = bin.norm_sqr() * self.density_scale;
            }
        }

        Ok(psd)
    }

    /// Full feature pipeline for one window.
    pub fn extract(&self, window: &[f32]) -> Result<Spectrogram> {
        let mut psd = self.power_spectrum(window)?;
        if psd.ncols() != self.geometry.size_cols {
            return Err(VerifierError::ShapeMismatch(format!(
                "window yields {} spectrogram columns, network expects {}",
                psd.ncols(),
                self.geometry.size_cols
            )));
        }
        standardize_columns(&mut psd);

        let rows = SIZE_FFT.min(psd.nrows());
        let image = psd
            .slice(s![..rows, ..])
            .mapv(|v| v as f32)
            .insert_axis(Axis(2));
        Ok(image)
    }
}

impl Default for SpectrogramExtractor {
    fn default() -> Self {
        Self::new(FrameGeometry::default())
    }
}

/// Zero mean, unit population variance per column, fit on this array only.
pub(crate) fn standardize_columns(data: &mut Array2<f64>) {
    let rows = data.nrows() as f64;
    if rows == 0.0 {
        return;
    }
    for mut col in data.axis_iter_mut(Axis(1)) {
        let mean = col.sum() / rows;
        let var = col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / rows;
        let std = var.sqrt();
        let scale = if std < MIN_SCALE { 1.0 } else { std };
        col.mapv_inplace(|v| (v - mean) / scale);
    }
}
