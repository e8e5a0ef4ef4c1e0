/*!
Miscellaneous utilities for `stockformer`
*/

use crate::{Error, Result};
use tch::Device;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a `tracing` subscriber printing to stderr at the given level. `RUST_LOG` takes precedence.
///
/// Only the first call in a process installs anything; later calls are no-ops.
pub fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .ok();
}

/// Map a verbosity count to a log level
pub fn verbosity_level(verbosity: usize) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Parse a device name: `cuda` (falling back to the CPU if CUDA is unavailable) or `cpu`
pub fn parse_device(name: &str) -> Result<Device> {
    match name {
        "cuda" => Ok(Device::cuda_if_available()),
        "cpu" => Ok(Device::Cpu),
        device => Err(Error::Config(format!("invalid device: {:?}", device))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_parse() {
        assert_eq!(parse_device("cpu").unwrap(), Device::Cpu);
        assert!(parse_device("cuda").is_ok());
        assert!(matches!(parse_device("tpu"), Err(Error::Config(_))));
    }

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(verbosity_level(0), "warn");
        assert_eq!(verbosity_level(1), "info");
        assert_eq!(verbosity_level(7), "trace");
    }
}
