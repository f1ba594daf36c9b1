use flexi_logger::{colored_default_format, FlexiLoggerError, Logger, LoggerHandle};

/// Initialize process-wide logging. Call once, before anything else logs.
///
/// The level comes from `RUST_LOG` when set, otherwise `info`.
pub fn setup_logging() -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::try_with_env_or_str("info")?
        .format(colored_default_format)
        .start()
}
