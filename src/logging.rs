//! Subscriber setup and the spans that tie a capture or export run's log
//! lines to its session.

use anyhow::anyhow;
use tracing::{Span, Subscriber};
use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter};

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Installs the global subscriber. Logs go to stderr so command output on
/// stdout stays machine readable.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let level = resolve_log_level(config, cli_level_override)?;
    let subscriber = build_subscriber(resolve_log_format(config), level, std::io::stderr);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}

/// Span a capture session's consumer and writer run in. Every line they log
/// carries the session id.
pub fn capture_span(session_id: &str) -> Span {
    tracing::info_span!("capture", session = %session_id)
}

pub fn export_span(session_id: &str) -> Span {
    tracing::info_span!("export", session = %session_id)
}

fn build_subscriber<W>(
    format: LogFormat,
    level: LevelFilter,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_writer(writer);
    match format {
        LogFormat::Json => Box::new(builder.json().finish()),
        LogFormat::Pretty => Box::new(builder.pretty().finish()),
    }
}

fn resolve_log_level(
    config: &Config,
    cli_level_override: Option<&str>,
) -> anyhow::Result<LevelFilter> {
    let raw_level = cli_level_override
        .or_else(|| {
            config
                .logging
                .as_ref()
                .and_then(|logging| logging.level.as_deref())
        })
        .unwrap_or(DEFAULT_LOG_LEVEL);

    raw_level
        .trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!(
                "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
            )
        })
}

fn resolve_log_format(config: &Config) -> LogFormat {
    config
        .logging
        .as_ref()
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json)
}
