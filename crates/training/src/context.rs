use std::sync::Arc;

use candle_core::Device;

use crate::{
    config::ExperimentConfig,
    error::Result,
    logging::{Logger, LoggingSettings},
};

/// Per-worker state handed to every component: the log sink, whether this
/// worker owns filesystem side effects, and the tensor device.
#[derive(Clone)]
pub struct RunContext {
    logger: Arc<Logger>,
    device: Device,
    is_writer: bool,
}

impl RunContext {
    pub fn new(logger: Logger, device: Device, is_writer: bool) -> Self {
        Self {
            logger: Arc::new(logger),
            device,
            is_writer,
        }
    }

    pub fn from_config(config: &ExperimentConfig, device: Device, is_writer: bool) -> Result<Self> {
        let logger = Logger::new(LoggingSettings::from_config(&config.logging), is_writer)?;
        Ok(Self::new(logger, device, is_writer))
    }

    /// Single-process context on the CPU that writes files but logs nothing
    /// beyond the `log` facade.
    pub fn local() -> Self {
        let logger = Logger::new(LoggingSettings::quiet(), true).unwrap_or_else(|_| Logger::muted());
        Self::new(logger, Device::Cpu, true)
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_writer(&self) -> bool {
        self.is_writer
    }
}
