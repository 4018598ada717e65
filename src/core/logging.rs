use crate::{
    config::LoggingConfig,
    error::{AppError, Result},
};
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Initialize structured logging system
pub fn init_structured_logging() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,bpm_event_core=info"));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| AppError::ConfigurationError(format!("Logging already initialized: {}", e)))?;

    Ok(())
}

/// Initialize logging with custom configuration
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    let level = normalize_level(&config.level);
    let env_filter = EnvFilter::new(level);

    let fmt_layer = match config.format.as_str() {
        "json" => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .json()
            .boxed(),
        "pretty" => fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .pretty()
            .boxed(),
        "compact" => fmt::layer()
            .with_target(false)
            .with_span_events(FmtSpan::NONE)
            .compact()
            .boxed(),
        _ => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| AppError::ConfigurationError(format!("Logging already initialized: {}", e)))?;

    info!(
        level = level,
        format = %config.format,
        "📝 Structured logging initialized with custom configuration"
    );
    Ok(())
}

/// `RUST_LOG` wins over the configured logging section when it is set
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    if env_filter_requested(rust_log.as_deref()) {
        init_structured_logging()
    } else {
        init_logging_with_config(config)
    }
}

fn env_filter_requested(rust_log: Option<&str>) -> bool {
    rust_log.map(|value| !value.trim().is_empty()).unwrap_or(false)
}

fn normalize_level(level: &str) -> &'static str {
    match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}
