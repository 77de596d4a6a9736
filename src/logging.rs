use tracing_subscriber::{
    EnvFilter, FmtSubscriber,
    fmt::{format::FmtSpan, time::LocalTime},
};

/// Log filter applied when neither `RUST_LOG` nor the config set one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Builds the filter from `RUST_LOG`, falling back to `fallback`.
pub fn env_filter(fallback: Option<&str>) -> Result<EnvFilter, Box<dyn std::error::Error>> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    Ok(EnvFilter::try_new(fallback.unwrap_or(DEFAULT_LOG_LEVEL))?)
}

/// Initialize logging from `RUST_LOG`, or from the config's level when unset
pub fn init_logging_from_env(fallback: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = env_filter(fallback)?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(LocalTime::rfc_3339())
        .with_ansi(true)
        .pretty()
        .with_level(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    tracing::info!("Logging system initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_fallback_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(env_filter(Some("reroute=verbose")).is_err());
        assert!(env_filter(Some("reroute_core=debug,warn")).is_ok());
        assert!(env_filter(None).is_ok());
    }
}
