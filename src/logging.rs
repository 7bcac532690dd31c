//! Tracing setup for hosts embedding the engine.
//!
//! The engine itself only emits `tracing` spans and events; installing a
//! subscriber is left to the host. [`init`] installs the default one: pretty
//! console output, or JSON lines for log aggregation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Target prefix of every event the engine emits.
pub const LOG_TARGET: &str = "data_transfer";

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per line instead of pretty output.
    pub json: bool,
    /// Default to DEBUG instead of INFO.
    pub verbose: bool,
}

/// Filter from `RUST_LOG` when set, otherwise the engine's target at the
/// level picked by `verbose`.
pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose))
}

fn default_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    EnvFilter::new(format!("{}={}", LOG_TARGET, level.as_str().to_lowercase()))
}

/// Install the global subscriber. Fails if one is already installed.
///
/// ```ignore
/// data_transfer::logging::init(LogConfig { json: true, ..Default::default() })?;
/// ```
pub fn init(config: LogConfig) -> Result<(), TryInitError> {
    let filter = env_filter(config.verbose);

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
    }
}

/// Rate limiter for log lines emitted per item, such as stage progress.
pub struct LogThrottle {
    interval_ms: u64,
    /// Last log time in ms since `start`, or `NEVER_LOGGED`.
    last_log_ms: AtomicU64,
    start: Instant,
}

const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            start: Instant::now(),
        }
    }

    /// True on the first call and then at most once per interval.
    pub fn should_log(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);

        let due = last == NEVER_LOGGED || now_ms.saturating_sub(last) >= self.interval_ms;
        // Losing the race means another caller just logged.
        due && self
            .last_log_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_targets_engine() {
        assert_eq!(default_filter(false).to_string(), "data_transfer=info");
        assert_eq!(default_filter(true).to_string(), "data_transfer=debug");
    }

    #[test]
    fn throttle_allows_first_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
    }

    #[test]
    fn throttle_blocks_immediate_second_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn zero_interval_never_throttles() {
        let throttle = LogThrottle::new(Duration::ZERO);
        assert!(throttle.should_log());
        assert!(throttle.should_log());
    }
}
