//! Target device selection.

use nvml_wrapper::Nvml;
use tch::{Cuda, Device};

/// CUDA device `index`, or the CPU when CUDA is unavailable.
pub fn select_device(index: usize) -> Device {
    if Cuda::is_available() {
        let count = Cuda::device_count() as usize;
        if index < count {
            return Device::Cuda(index);
        }
        tracing::warn!(index, count, "requested CUDA device does not exist, using CPU");
    } else {
        tracing::warn!("CUDA not available, batches stay in host memory");
    }
    Device::Cpu
}

/// Marketing name of CUDA device `index` as reported by NVML.
pub fn device_name(index: usize) -> Option<String> {
    let nvml = Nvml::init().ok()?;
    let device = nvml.device_by_index(index as u32).ok()?;
    device.name().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_index_falls_back_to_cpu() {
        assert_eq!(select_device(usize::MAX), Device::Cpu);
    }
}
