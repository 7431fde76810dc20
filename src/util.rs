use candle_core::Device;

use crate::{config::DeviceTarget, error::Result};

/// Install an `env_logger` writing `info` and above unless `RUST_LOG`
/// says otherwise. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

pub fn select_device(target: DeviceTarget) -> Result<Device> {
    let device = match target {
        DeviceTarget::Cpu => Device::Cpu,
        DeviceTarget::Cuda(ordinal) => Device::new_cuda(ordinal)?,
        DeviceTarget::Auto => Device::cuda_if_available(0)?,
    };
    log::info!("using device {device:?}");
    Ok(device)
}
