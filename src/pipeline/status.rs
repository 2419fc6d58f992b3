//! Failure indicator pulsed on every failed tick.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::StatusConfig;

#[async_trait]
pub trait StatusIndicator: Send + Sync {
    /// Signal one failure
    async fn pulse(&self);
}

/// Indicator that only logs
#[derive(Debug, Default)]
pub struct LogIndicator;

#[async_trait]
impl StatusIndicator for LogIndicator {
    async fn pulse(&self) {
        error!("Camera node malfunctioning");
    }
}

/// Status LED behind a sysfs `brightness` file
#[derive(Debug)]
pub struct LedIndicator {
    brightness: PathBuf,
    pulse: Duration,
}

impl LedIndicator {
    /// `led_path` is the LED class directory, e.g. `/sys/class/leds/status`
    pub fn new(led_path: impl Into<PathBuf>, pulse: Duration) -> Self {
        Self {
            brightness: led_path.into().join("brightness"),
            pulse,
        }
    }

    async fn set(&self, on: bool) {
        let value = if on { "1" } else { "0" };
        if let Err(e) = tokio::fs::write(&self.brightness, value).await {
            warn!("Cannot drive status LED {}: {}", self.brightness.display(), e);
        }
    }
}

#[async_trait]
impl StatusIndicator for LedIndicator {
    async fn pulse(&self) {
        self.set(true).await;
        tokio::time::sleep(self.pulse).await;
        self.set(false).await;
    }
}

/// LED indicator when a path is configured, log-only otherwise
pub fn from_config(config: &StatusConfig) -> Arc<dyn StatusIndicator> {
    if config.led_path.is_empty() {
        Arc::new(LogIndicator)
    } else {
        Arc::new(LedIndicator::new(&config.led_path, Duration::from_millis(config.pulse_ms)))
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts pulses
    #[derive(Debug, Default)]
    pub struct CountingIndicator {
        pulses: AtomicUsize,
    }

    impl CountingIndicator {
        pub fn count(&self) -> usize {
            self.pulses.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusIndicator for CountingIndicator {
        async fn pulse(&self) {
            self.pulses.fetch_add(1, Ordering::SeqCst);
        }
    }
}
