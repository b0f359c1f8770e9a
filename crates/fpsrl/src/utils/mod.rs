//! Utility functions.

use std::process::Command;
use tch::Device;

/// Seed libtorch's global generator
pub fn set_seed(seed: u64) {
    tch::manual_seed(seed as i64);
}

/// Toggle reproducible cuDNN kernels
pub fn set_deterministic(deterministic: bool) {
    tch::Cuda::cudnn_set_benchmark(!deterministic);
}

/// Pick the training device: the accelerator with the most free memory, or
/// the CPU when accelerators are disabled, absent, or cannot be queried.
pub fn select_device(use_cuda: bool) -> Device {
    if !use_cuda {
        tracing::info!("Accelerator disabled, using CPU");
        return Device::Cpu;
    }
    if !tch::Cuda::is_available() {
        tracing::warn!("No CUDA device available, falling back to CPU");
        return Device::Cpu;
    }

    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
        .output();
    let free = match output {
        Ok(out) if out.status.success() => parse_free_memory(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            tracing::warn!(status = %out.status, "nvidia-smi failed, falling back to CPU");
            return Device::Cpu;
        }
        Err(err) => {
            tracing::warn!(error = %err, "Could not run nvidia-smi, falling back to CPU");
            return Device::Cpu;
        }
    };

    match best_device(&free) {
        Some(index) if (index as i64) < tch::Cuda::device_count() => {
            tracing::info!(device = index, free_mib = free[index], "Selected CUDA device");
            Device::Cuda(index)
        }
        _ => {
            tracing::warn!("Could not read free GPU memory, falling back to CPU");
            Device::Cpu
        }
    }
}

/// Free memory per GPU in MiB, one line per device
pub fn parse_free_memory(output: &str) -> Vec<u64> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map_while(|line| line.parse().ok())
        .collect()
}

/// Index of the device with the most free memory; the first wins ties
fn best_device(free: &[u64]) -> Option<usize> {
    free.iter()
        .enumerate()
        .rev()
        .max_by_key(|(_, &mib)| mib)
        .map(|(i, _)| i)
}

/// Abbreviate large numbers for display
pub fn abbreviate(num: u64) -> String {
    if num < 1_000 {
        format!("{}", num)
    } else if num < 1_000_000 {
        format!("{:.1}K", num as f64 / 1_000.0)
    } else if num < 1_000_000_000 {
        format!("{:.1}M", num as f64 / 1_000_000.0)
    } else {
        format!("{:.1}B", num as f64 / 1_000_000_000.0)
    }
}

/// Format duration in human-readable form
pub fn format_duration(seconds: f64) -> String {
    if seconds < 0.0 {
        return "0s".to_string();
    }

    let secs = seconds as u64;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;

    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abbreviate() {
        assert_eq!(abbreviate(500), "500");
        assert_eq!(abbreviate(1500), "1.5K");
        assert_eq!(abbreviate(1_500_000), "1.5M");
        assert_eq!(abbreviate(1_500_000_000), "1.5B");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.0), "30s");
        assert_eq!(format_duration(90.0), "1m 30s");
        assert_eq!(format_duration(3661.0), "1h 1m 1s");
    }

    #[test]
    fn test_parse_free_memory() {
        assert_eq!(parse_free_memory("1024\n 8000 \n\n512\n"), [1024, 8000, 512]);
        assert!(parse_free_memory("").is_empty());
        assert_eq!(parse_free_memory("100\nN/A\n300"), [100]);
    }

    #[test]
    fn test_best_device() {
        assert_eq!(best_device(&[1024, 8000, 512]), Some(1));
        assert_eq!(best_device(&[700, 700]), Some(0));
        assert_eq!(best_device(&[]), None);
    }

    #[test]
    fn test_cpu_when_disabled() {
        assert_eq!(select_device(false), Device::Cpu);
    }
}
