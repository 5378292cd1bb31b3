use std::path::PathBuf;

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(clap::Parser)]
#[command(version, about = "MediaTek BROM bootloader unlock tool")]
pub struct CliArgs {
    /// Optional log level, can also be set by the "MTKHAX_TRACE" environment variable. If both are specified, the environment variable is preferred.
    #[arg(long)]
    pub log_level: Option<LogLevel>,

    /// BROM exploit payload binary
    pub payload: PathBuf,

    /// Stage-1 Download Agent binary
    pub da1: PathBuf,

    /// Stage-2 Download Agent binary
    pub da2: PathBuf,
}
