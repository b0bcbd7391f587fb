//! Compute device selection: CUDA, then Metal, then CPU.

use candle_core::Device;

/// Pick the device for training.
///
/// `force_cpu` skips accelerator probing. Accelerators are only tried when the
/// crate is built with the `cuda` or `metal` feature.
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        tracing::info!("CPU requested");
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(device) => {
                tracing::info!("Using CUDA device 0");
                return device;
            }
            Err(e) => tracing::warn!(error = %e, "CUDA unavailable, falling back"),
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => {
                tracing::info!("Using Metal device 0");
                return device;
            }
            Err(e) => tracing::warn!(error = %e, "Metal unavailable, falling back"),
        }
    }

    tracing::info!("Using CPU");
    Device::Cpu
}

/// Short device label for logs.
pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}
