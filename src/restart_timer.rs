// Restart Timer Module
// One-shot timers on the ESP-IDF task timer service, plus the device restart itself

use std::time::Duration;

use esp_idf_svc::timer::{EspTaskTimerService, EspTimer};
use log::info;

use crate::reset_scheduler::{TimerCallback, TimerError, TimerFactory};

pub struct TaskTimerFactory {
    service: EspTaskTimerService,
}

impl TaskTimerFactory {
    pub fn new(service: EspTaskTimerService) -> Self {
        Self { service }
    }
}

impl TimerFactory for TaskTimerFactory {
    type Handle = EspTimer<'static>;

    fn schedule(&self, delay: Duration, callback: TimerCallback) -> Result<Self::Handle, TimerError> {
        let mut callback = Some(callback);
        let timer = self
            .service
            .timer(move || {
                if let Some(cb) = callback.take() {
                    cb();
                }
            })
            .map_err(|e| TimerError(format!("create timer: {}", e)))?;

        timer
            .after(delay)
            .map_err(|e| TimerError(format!("arm timer: {}", e)))?;

        Ok(timer)
    }
}

/// Unconditional software reset
pub fn restart_device() {
    info!("🔄 Restarting device");
    esp_idf_hal::reset::restart();
}
