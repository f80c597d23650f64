// Reset Scheduler Module
// Deferred one-shot device restart after a committed firmware update
// The delay lets the HTTP response reach the client before the device goes down

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerError(pub String);

impl std::fmt::Display for TimerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timer error: {}", self.0)
    }
}

impl std::error::Error for TimerError {}

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Source of one-shot timers. The returned handle keeps the timer alive;
/// dropping it cancels a timer that has not fired yet.
pub trait TimerFactory: Send {
    type Handle: Send;

    fn schedule(&self, delay: Duration, callback: TimerCallback) -> Result<Self::Handle, TimerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    Armed,
    AlreadyArmed,
}

pub struct ResetScheduler<F: TimerFactory> {
    factory: F,
    delay: Duration,
    armed: Option<F::Handle>,
    fired: Arc<AtomicBool>,
    restart: Arc<dyn Fn() + Send + Sync>,
}

impl<F: TimerFactory> ResetScheduler<F> {
    pub fn new(factory: F, delay: Duration, restart: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            factory,
            delay,
            armed: None,
            fired: Arc::new(AtomicBool::new(false)),
            restart: Arc::new(restart),
        }
    }

    /// Arm the restart timer. A second call while armed is ignored so the
    /// restart time is fixed by the first successful update.
    pub fn arm(&mut self) -> Result<ArmOutcome, TimerError> {
        if self.armed.is_some() {
            warn!("⚠️ Restart already scheduled, ignoring re-arm");
            return Ok(ArmOutcome::AlreadyArmed);
        }

        let fired = self.fired.clone();
        let restart = self.restart.clone();
        let handle = self.factory.schedule(
            self.delay,
            Box::new(move || {
                if !fired.swap(true, Ordering::AcqRel) {
                    info!("🔄 Restart timer expired, restarting device");
                    restart();
                }
            }),
        )?;

        info!("⏲️ Device restart scheduled in {:?}", self.delay);
        self.armed = Some(handle);
        Ok(ArmOutcome::Armed)
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    #[cfg(test)]
    pub(crate) fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
