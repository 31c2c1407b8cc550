use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

use crate::errors::{LogScopeError, Result};

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "LOGSCOPE_LOG";

/// Installs the fmt subscriber that receives LogScope's own diagnostics
/// (persistence failures, isolated subscriber panics and the like).
///
/// `LOGSCOPE_LOG` wins over `RUST_LOG`, which wins over `level`. Calling
/// this twice returns an error instead of replacing the first subscriber.
pub fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = resolve_filter(level);

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .try_init()
        .map_err(|err| LogScopeError::Tracing(err.to_string()))?;

    Ok(())
}

fn resolve_filter(level: Option<&str>) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV_VAR) {
        return filter;
    }
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("logscope_store=warn,info")))
}
