//! Runtime configuration, read from the environment.

use std::{env, time::Duration};

use tracing::Level;

/// Memory tracker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
  /// Minimum time between two sampling passes.
  pub sample_period: Duration,
  /// Number of samples (sentinels included) kept in the history ring.
  pub history_capacity: usize,
  /// Nodes deeper than this are not sampled.
  pub max_depth: usize,
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      sample_period: Duration::from_millis(100),
      history_capacity: 4096,
      max_depth: 10,
    }
  }
}

impl TrackerConfig {
  /// Defaults overridden by `SPHALLOC_TRACK_PERIOD_MS`,
  /// `SPHALLOC_TRACK_HISTORY` and `SPHALLOC_TRACK_DEPTH`.
  pub fn from_env() -> Self {
    let mut config = Self::default();

    if let Some(ms) = env_parse::<u64>("SPHALLOC_TRACK_PERIOD_MS") {
      config.sample_period = Duration::from_millis(ms);
    }
    if let Some(capacity) = env_parse::<usize>("SPHALLOC_TRACK_HISTORY") {
      config.history_capacity = capacity.max(2);
    }
    if let Some(depth) = env_parse::<usize>("SPHALLOC_TRACK_DEPTH") {
      config.max_depth = depth.max(1);
    }

    config
  }
}

/// Logging settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
  /// Level used when no filter directive is given.
  pub level: Level,
  /// `EnvFilter` directives, e.g. `sphalloc::node=debug`.
  pub filter: Option<String>,
  /// Emit JSON lines instead of human-readable output.
  pub json_format: bool,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: Level::WARN,
      filter: None,
      json_format: false,
    }
  }
}

impl LogConfig {
  /// `SPHALLOC_LOG` holds either a bare level or filter directives;
  /// `SPHALLOC_LOG_JSON` switches to JSON output.
  pub fn from_env() -> Self {
    let mut config = Self::default();

    if let Ok(value) = env::var("SPHALLOC_LOG") {
      match parse_level(&value) {
        Some(level) => config.level = level,
        None => config.filter = Some(value),
      }
    }

    config.json_format = env::var("SPHALLOC_LOG_JSON").is_ok();

    config
  }

  /// Verbose config for debugging allocator behaviour.
  pub fn debug() -> Self {
    Self {
      level: Level::TRACE,
      filter: None,
      json_format: false,
    }
  }
}

fn parse_level(value: &str) -> Option<Level> {
  match value.trim().to_lowercase().as_str() {
    "trace" => Some(Level::TRACE),
    "debug" => Some(Level::DEBUG),
    "info" => Some(Level::INFO),
    "warn" => Some(Level::WARN),
    "error" => Some(Level::ERROR),
    _ => None,
  }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
  env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_tracker_defaults() {
    let config = TrackerConfig::default();
    assert_eq!(config.sample_period, Duration::from_millis(100));
    assert_eq!(config.max_depth, 10);
  }

  #[test]
  fn test_parse_level() {
    assert_eq!(parse_level("DEBUG"), Some(Level::DEBUG));
    assert_eq!(parse_level(" warn "), Some(Level::WARN));
    assert_eq!(parse_level("sphalloc=trace"), None);
  }
}
