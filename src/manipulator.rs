//! # Manipulator Module
//!
//! Gripper servo driven through the Linux sysfs PWM interface.
//!
//! The last commanded angle doubles as the gripper state reported in
//! telemetry, since the hobby servo has no position feedback.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

use crate::config::ManipulatorConfig;
use crate::error::{NodeError, Result};

/// Lowest commandable angle in degrees
pub const MIN_ANGLE: f32 = 0.0;

/// Highest commandable angle in degrees
pub const MAX_ANGLE: f32 = 180.0;

/// Gripper actuator
#[cfg_attr(test, mockall::automock)]
pub trait Manipulator: Send + Sync {
    /// Move to `angle` degrees; values outside [0, 180] are clamped
    fn set_angle(&self, angle: f32) -> Result<()>;

    /// Last commanded angle
    fn angle(&self) -> f32;
}

/// Clamp an angle into the servo's range, mapping NaN to the lower bound
pub fn clamp_angle(angle: f32) -> f32 {
    if angle.is_nan() {
        return MIN_ANGLE;
    }
    angle.clamp(MIN_ANGLE, MAX_ANGLE)
}

/// Servo on a sysfs PWM channel (e.g. `/sys/class/pwm/pwmchip0/pwm0`)
#[derive(Debug)]
pub struct PwmServo {
    channel: PathBuf,
    min_pulse_ns: u64,
    max_pulse_ns: u64,
    angle_bits: AtomicU32,
}

impl PwmServo {
    /// Configure the channel period, enable output and move to the initial angle
    ///
    /// # Arguments
    ///
    /// * `config` - Channel path, period and pulse range
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::ConfigurationFatal`] if the channel files cannot be
    /// written; a gripper that cannot be driven has no degraded mode.
    pub fn open(config: &ManipulatorConfig) -> Result<Self> {
        let channel = PathBuf::from(&config.pwm_path);

        write_attr(&channel, "period", config.period_ns)?;

        let servo = Self {
            channel,
            min_pulse_ns: config.min_pulse_us * 1000,
            max_pulse_ns: config.max_pulse_us * 1000,
            angle_bits: AtomicU32::new(MIN_ANGLE.to_bits()),
        };
        servo.set_angle(config.initial_angle)?;
        write_attr(&servo.channel, "enable", 1)?;

        info!(
            "Servo ready on {} (period {} ns, pulse {}-{} us)",
            config.pwm_path, config.period_ns, config.min_pulse_us, config.max_pulse_us
        );
        Ok(servo)
    }

    /// Pulse width in nanoseconds for an angle
    pub fn pulse_ns(&self, angle: f32) -> u64 {
        let span = (self.max_pulse_ns - self.min_pulse_ns) as f64;
        let fraction = f64::from(clamp_angle(angle)) / f64::from(MAX_ANGLE);
        self.min_pulse_ns + (span * fraction).round() as u64
    }
}

impl Manipulator for PwmServo {
    fn set_angle(&self, angle: f32) -> Result<()> {
        let angle = clamp_angle(angle);
        let pulse = self.pulse_ns(angle);

        write_attr(&self.channel, "duty_cycle", pulse)?;
        self.angle_bits.store(angle.to_bits(), Ordering::Relaxed);

        debug!("Servo angle {:.2} (duty {} ns)", angle, pulse);
        Ok(())
    }

    fn angle(&self) -> f32 {
        f32::from_bits(self.angle_bits.load(Ordering::Relaxed))
    }
}

fn write_attr(channel: &Path, attr: &str, value: u64) -> Result<()> {
    let path = channel.join(attr);
    fs::write(&path, value.to_string()).map_err(|e| {
        NodeError::ConfigurationFatal(format!("Failed to write {}: {}", path.display(), e))
    })
}
