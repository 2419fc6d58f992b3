//! Rate governor.
//!
//! Each tick measures the time spent since the previous tick ended and sleeps
//! off whatever is left of the frame budget. A tick that overran its budget
//! proceeds immediately; there is no catch-up and no frame skipping.

use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Throughput over one report window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateReport {
    pub ticks: u32,
    pub fps: f64,
    pub avg_elapsed: Duration,
    pub avg_delay: Duration,
}

/// Paces a periodic loop to a target rate
#[derive(Debug)]
pub struct RateGovernor {
    name: String,
    budget: Duration,
    report_every: Duration,
    last: Instant,
    window_start: Instant,
    ticks: u32,
    elapsed_sum: Duration,
    delay_sum: Duration,
}

impl RateGovernor {
    /// # Arguments
    ///
    /// * `name` - Loop name used in report lines
    /// * `target_fps` - Ticks per second; must be positive
    /// * `report_every` - Report window length
    pub fn new(name: impl Into<String>, target_fps: f64, report_every: Duration) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            budget: Duration::from_micros((1_000_000.0 / target_fps) as u64),
            report_every,
            last: now,
            window_start: now,
            ticks: 0,
            elapsed_sum: Duration::ZERO,
            delay_sum: Duration::ZERO,
        }
    }

    /// Per-tick time budget
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Account for a tick that finished at `now` and return how long to sleep
    pub fn tick(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last);
        let sleep = self.budget.saturating_sub(elapsed);

        self.ticks += 1;
        self.elapsed_sum += elapsed;
        self.delay_sum += sleep;
        self.last = now + sleep;

        sleep
    }

    /// Close the report window if it has run its course
    pub fn report(&mut self, now: Instant) -> Option<RateReport> {
        let window = now.saturating_duration_since(self.window_start);
        if window < self.report_every {
            return None;
        }

        let ticks = self.ticks;
        let report = (ticks > 0).then(|| RateReport {
            ticks,
            fps: f64::from(ticks) / window.as_secs_f64(),
            avg_elapsed: self.elapsed_sum / ticks,
            avg_delay: self.delay_sum / ticks,
        });

        self.window_start = now;
        self.ticks = 0;
        self.elapsed_sum = Duration::ZERO;
        self.delay_sum = Duration::ZERO;

        report
    }

    /// End the current tick: sleep off the budget and log a report when due
    pub async fn pace(&mut self) {
        let now = Instant::now();
        let sleep = self.tick(now);
        if !sleep.is_zero() {
            tokio::time::sleep_until(now + sleep).await;
        }
        self.last = Instant::now();

        if let Some(report) = self.report(self.last) {
            info!(
                "{}: {:.1} fps, avg elapsed {:.1} ms, avg delay {:.1} ms",
                self.name,
                report.fps,
                report.avg_elapsed.as_secs_f64() * 1000.0,
                report.avg_delay.as_secs_f64() * 1000.0
            );
        }
    }
}
