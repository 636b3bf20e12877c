//! Logger installation.
//!
//! After VM launch the kernel debug-print path cannot be used from VMX root, so the hypervisor
//! logs to a serial port (which VMware Workstation and most virtual machines expose to the host).

use log::LevelFilter;

/// Serial logger settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggerConfig {
    /// I/O port base of the UART.
    pub port: u16,
    pub level: LevelFilter,
}

impl Default for LoggerConfig {
    /// COM2 at Info.
    fn default() -> Self {
        Self {
            port: 0x2f8,
            level: LevelFilter::Info,
        }
    }
}

/// Installs the serial port logger as the `log` backend.
pub fn init_serial_logger(config: LoggerConfig) {
    com_logger::builder()
        .base(config.port)
        .filter(config.level)
        .setup();
}

/// Installs the kernel debugger logger. Only usable before VM launch.
#[cfg(feature = "nt")]
pub fn init_kernel_logger(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    kernel_log::KernelLogger::init(level)
}
