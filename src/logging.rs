use anyhow::anyhow;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter};

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl LogSettings {
    /// CLI override first, then `[logging]`, then `info` as JSON.
    pub fn resolve(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<Self> {
        let logging = config.logging.as_ref();
        let level = match cli_level_override.or_else(|| logging?.level.as_deref()) {
            Some(raw) => parse_level(raw)?,
            None => DEFAULT_LOG_LEVEL,
        };
        let format = logging
            .and_then(|logging| logging.format)
            .unwrap_or(LogFormat::Json);
        Ok(Self { level, format })
    }
}

/// Installs the global subscriber on stderr. stdout belongs to the native messaging
/// channel and must never see a log line.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let settings = LogSettings::resolve(config, cli_level_override)?;
    tracing::subscriber::set_global_default(subscriber(settings, std::io::stderr))
        .map_err(|err| anyhow!("install tracing subscriber: {err}"))
}

fn subscriber<W>(settings: LogSettings, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_max_level(settings.level)
        .with_target(true)
        .with_writer(writer);
    match settings.format {
        LogFormat::Json => Box::new(builder.json().finish()),
        LogFormat::Pretty => Box::new(builder.with_ansi(false).pretty().finish()),
    }
}

fn parse_level(raw: &str) -> anyhow::Result<LevelFilter> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        "off" => Ok(LevelFilter::OFF),
        _ => Err(anyhow!(
            "invalid log level `{raw}`; expected one of trace, debug, info, warn, error, off"
        )),
    }
}
