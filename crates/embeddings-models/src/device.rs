//! Compute device selection.

use candle_core::Device;
use tracing::info;

use crate::error::EmbeddingError;

/// Resolve a device selector (`cpu`, `cuda`, `cuda:N`, `metal`, `auto`).
///
/// `auto` picks the first CUDA device when candle was built with CUDA
/// support and falls back to CPU otherwise.
pub fn select_device(selector: &str) -> Result<Device, EmbeddingError> {
    let device = match selector {
        "cpu" => Device::Cpu,
        "auto" => Device::cuda_if_available(0)?,
        "cuda" => Device::new_cuda(0)?,
        "metal" => Device::new_metal(0)?,
        other => match other
            .strip_prefix("cuda:")
            .and_then(|n| n.parse::<usize>().ok())
        {
            Some(ordinal) => Device::new_cuda(ordinal)?,
            None => {
                return Err(EmbeddingError::InvalidInput(format!(
                    "unknown device selector '{}'",
                    other
                )))
            }
        },
    };
    info!(selector, cuda = device.is_cuda(), "Selected compute device");
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_and_auto() {
        assert!(matches!(select_device("cpu").unwrap(), Device::Cpu));
        // Without CUDA support auto falls back to CPU; with it, any device is fine.
        assert!(select_device("auto").is_ok());
    }

    #[test]
    fn test_unknown_selector() {
        assert!(matches!(
            select_device("tpu"),
            Err(EmbeddingError::InvalidInput(_))
        ));
        assert!(select_device("cuda:x").is_err());
    }
}
