//! # Pipeline Module
//!
//! The periodic producers and everything they deliver through.
//!
//! - [`governor`] - frame budget pacing and throughput reports
//! - [`sink`] - batching sink over an HTTP push transport
//! - [`spool`] - on-disk staging and the background drainer
//! - [`capture`] - the frame + telemetry producer
//! - [`gripper`] - the gripper state producer
//! - [`status`] - failure indicator (LED or log)

pub mod capture;
pub mod governor;
pub mod gripper;
pub mod sink;
pub mod spool;
pub mod status;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Boolean shared between tasks
///
/// Readers may observe a write one tick late; nothing orders around it.
#[derive(Debug, Clone, Default)]
pub struct SharedFlag(Arc<AtomicBool>);

impl SharedFlag {
    pub fn new(value: bool) -> Self {
        Self(Arc::new(AtomicBool::new(value)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::Relaxed);
    }
}
