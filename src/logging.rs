//! Subscriber setup for the crate's `tracing` events.
//!
//! The allocators only emit events; installing a subscriber is left to the
//! embedding application. [`init`] is a convenience for binaries, tests
//! and benches that want the output on stderr.

use once_cell::sync::OnceCell;
use tracing_subscriber::{
  EnvFilter, filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::LogConfig;

static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Initialize logging from [`LogConfig::from_env`].
pub fn init() {
  init_with_config(LogConfig::from_env());
}

/// Initialize logging with an explicit configuration. Only the first call
/// has any effect; a subscriber installed elsewhere is left in place.
pub fn init_with_config(config: LogConfig) {
  LOGGER_INITIALIZED.get_or_init(|| {
    let filter = EnvFilter::builder()
      .with_default_directive(LevelFilter::from_level(config.level).into())
      .parse_lossy(config.filter.as_deref().unwrap_or_default());

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json_format {
      registry
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .try_init()
    } else {
      registry
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
    };

    if result.is_err() {
      tracing::debug!("global subscriber already installed");
    }
  });
}
