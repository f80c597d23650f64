// Status Monitor Module
// Single consumer of the status queue and sole writer of the device status
// Arms the deferred restart once a firmware update has been committed

use std::sync::Arc;

use log::{error, info, warn};

use crate::reset_scheduler::{ArmOutcome, ResetScheduler, TimerFactory};
use crate::status_queue::StatusQueue;
use crate::system_state::{DeviceStatusWriter, StatusMessage, UpdateResult};

pub struct StatusMonitor<F: TimerFactory> {
    queue: Arc<StatusQueue>,
    status: DeviceStatusWriter,
    reset: ResetScheduler<F>,
}

impl<F: TimerFactory> StatusMonitor<F> {
    pub fn new(queue: Arc<StatusQueue>, status: DeviceStatusWriter, reset: ResetScheduler<F>) -> Self {
        Self {
            queue,
            status,
            reset,
        }
    }

    /// Apply one status message
    pub fn dispatch(&mut self, msg: StatusMessage) {
        match msg {
            StatusMessage::WifiInitializing => info!("📶 WiFi initializing"),
            StatusMessage::WifiConnected => info!("✅ WiFi connected"),
            StatusMessage::WifiFailed => warn!("❌ WiFi connection failed"),
            StatusMessage::UpdateInitialized => {
                info!("📦 Firmware update started");
                self.status.record_update(UpdateResult::Pending);
            }
            StatusMessage::UpdateSucceeded => {
                info!("🎉 Firmware update committed");
                self.status.record_update(UpdateResult::Succeeded);
                match self.reset.arm() {
                    Ok(ArmOutcome::Armed) => {}
                    Ok(ArmOutcome::AlreadyArmed) => info!("Restart already pending"),
                    Err(e) => error!("❌ Failed to schedule restart: {}", e),
                }
            }
            StatusMessage::UpdateFailed => {
                error!("❌ Firmware update failed");
                self.status.record_update(UpdateResult::Failed);
            }
        }
    }

    /// Drain whatever is queued right now without waiting
    #[cfg(test)]
    pub(crate) fn drain_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(msg) = self.queue.try_receive() {
            self.dispatch(msg);
            handled += 1;
        }
        handled
    }

    #[cfg(test)]
    pub(crate) fn reset_scheduler(&self) -> &ResetScheduler<F> {
        &self.reset
    }

    pub async fn run(mut self) -> ! {
        info!("🔄 Status monitor started");
        loop {
            let msg = self.queue.receive().await;
            self.dispatch(msg);
        }
    }
}
