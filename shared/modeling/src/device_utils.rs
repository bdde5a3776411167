use std::{fmt, str::FromStr};

use tch::{utils::has_mps, Device};
use thiserror::Error;

fn get_cuda_devices() -> Vec<usize> {
    (0..tch::Cuda::device_count() as usize).collect()
}

/// MPS on macOS if available, then every CUDA device, then CPU.
pub fn get_optimal_devices() -> Devices {
    #[cfg(target_os = "macos")]
    {
        if has_mps() {
            return Devices::Mps;
        }
    }

    let cuda_device_indices = get_cuda_devices();
    if !cuda_device_indices.is_empty() {
        return Devices::Cuda(cuda_device_indices);
    }

    Devices::Cpu
}

/// The devices replicas are placed on.
#[derive(Clone, Debug, PartialEq)]
pub enum Devices {
    Cpu,
    Mps,
    Cuda(Vec<usize>),
}

impl Default for Devices {
    fn default() -> Self {
        get_optimal_devices()
    }
}

impl fmt::Display for Devices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Devices::Cpu => write!(f, "CPU"),
            Devices::Mps => write!(f, "MPS"),
            Devices::Cuda(device_ids) => write!(f, "CUDA({})", join_ids(device_ids)),
        }
    }
}

fn join_ids(ids: &[usize]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl Devices {
    /// How many replicas can be placed without sharing a GPU. CPU and MPS replicas all
    /// share the one device, so any count fits.
    pub fn max_replicas(&self) -> Option<usize> {
        match self {
            Devices::Cpu | Devices::Mps => None,
            Devices::Cuda(device_indices) => Some(device_indices.len()),
        }
    }

    /// Device for replica `rank`: the shared CPU/MPS device, or the `rank`-th listed GPU.
    pub fn device_for_rank(&self, rank: usize) -> Option<Device> {
        match self {
            Devices::Cpu => Some(Device::Cpu),
            Devices::Mps => Some(Device::Mps),
            Devices::Cuda(device_indices) => {
                device_indices.get(rank).map(|idx| Device::Cuda(*idx))
            }
        }
    }
}

fn get_all_device_strings() -> String {
    let mut strings = vec!["auto".to_string(), "cpu".to_string()];
    if has_mps() {
        strings.push("mps".to_owned());
    }
    let cuda = get_cuda_devices();
    if !cuda.is_empty() {
        strings.push("cuda".to_string());
        strings.push(format!("cuda:{}", join_ids(&cuda)));
    }
    strings.join(", ")
}

#[derive(Error, Debug)]
pub enum DevicesParseError {
    #[error("device {0} is not available on this system. Available devices are: {1}")]
    DeviceNotAvailable(String, String),

    #[error("invalid format for device(s) {0}: '{1}'")]
    InvalidDeviceFormat(String, String),

    #[error("invalid device '{0}'. Available devices are: {1}")]
    InvalidDevicesString(String, String),
}

impl FromStr for Devices {
    type Err = DevicesParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cuda_unavailable =
            || DevicesParseError::DeviceNotAvailable("CUDA".to_owned(), get_all_device_strings());
        match s.to_lowercase().as_str() {
            "auto" => Ok(get_optimal_devices()),
            "cpu" => Ok(Devices::Cpu),
            "mps" => {
                if !has_mps() {
                    return Err(DevicesParseError::DeviceNotAvailable(
                        "MPS".to_owned(),
                        get_all_device_strings(),
                    ));
                }
                Ok(Devices::Mps)
            }
            "cuda" => {
                let available = get_cuda_devices();
                if available.is_empty() {
                    return Err(cuda_unavailable());
                }
                Ok(Devices::Cuda(available))
            }
            lowered => {
                let Some(devices_str) = lowered.strip_prefix("cuda:") else {
                    return Err(DevicesParseError::InvalidDevicesString(
                        lowered.to_string(),
                        get_all_device_strings(),
                    ));
                };
                let available = get_cuda_devices();
                if available.is_empty() {
                    return Err(cuda_unavailable());
                }
                let device_ids = devices_str
                    .split(',')
                    .map(|id_str| {
                        let id = id_str.trim().parse::<usize>().map_err(|_| {
                            DevicesParseError::InvalidDeviceFormat(
                                lowered.to_owned(),
                                id_str.to_owned(),
                            )
                        })?;
                        if !available.contains(&id) {
                            return Err(DevicesParseError::DeviceNotAvailable(
                                format!("cuda:{id}"),
                                get_all_device_strings(),
                            ));
                        }
                        Ok(id)
                    })
                    .collect::<Result<Vec<usize>, _>>()?;
                Ok(Devices::Cuda(device_ids))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_device() {
        assert!("auto".parse::<Devices>().is_ok());
        assert!("".parse::<Devices>().is_err());
        assert!("banana".parse::<Devices>().is_err());
        assert_eq!("CPU".parse::<Devices>().unwrap(), Devices::Cpu);
        if tch::Cuda::device_count() == 0 {
            assert!(matches!(
                "cuda:0".parse::<Devices>(),
                Err(DevicesParseError::DeviceNotAvailable(_, _))
            ));
        } else {
            assert!("cuda:abc".parse::<Devices>().is_err());
            assert_eq!(
                "cuda:0".parse::<Devices>().unwrap(),
                Devices::Cuda(vec![0])
            );
        }
    }

    #[test]
    fn test_cpu_replicas_share_the_device() {
        assert_eq!(Devices::Cpu.device_for_rank(3), Some(Device::Cpu));
        assert_eq!(Devices::Cpu.max_replicas(), None);
        let cuda = Devices::Cuda(vec![2, 5]);
        assert_eq!(cuda.device_for_rank(1), Some(Device::Cuda(5)));
        assert_eq!(cuda.device_for_rank(2), None);
        assert_eq!(cuda.to_string(), "CUDA(2,5)");
    }
}
