use core::sync::atomic::{AtomicI8, Ordering};
use std::sync::Arc;

// Control-plane events consumed by the status monitor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusMessage {
    WifiInitializing,  // Station started, first connect issued
    WifiConnected,     // Station obtained an IP address
    WifiFailed,        // Disconnected or connect timed out
    UpdateInitialized, // Firmware update session opened
    UpdateSucceeded,   // New image committed as boot target
    UpdateFailed,      // Update session terminated without commit
}

impl StatusMessage {
    /// Terminal outcome of an update session
    pub fn is_update_outcome(&self) -> bool {
        matches!(self, Self::UpdateSucceeded | Self::UpdateFailed)
    }
}

/// Result of the most recent firmware update, as reported by `/OTAstatus`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum UpdateResult {
    Pending = 0,
    Succeeded = 1,
    Failed = -1,
}

impl UpdateResult {
    pub fn code(self) -> i8 {
        self as i8
    }

    fn from_code(code: i8) -> Self {
        match code {
            1 => Self::Succeeded,
            -1 => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Build identifier embedded by build.rs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildInfo {
    pub compile_date: &'static str,
    pub compile_time: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            compile_date: env!("BUILD_DATE"),
            compile_time: env!("BUILD_TIME"),
        }
    }
}

// WiFi station lifecycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,       // Not started, or retry budget exhausted
    Connecting, // Station started, first attempt in flight
    Connected,  // IP assigned
    Retrying,   // Reconnecting after a disconnect
}

/// Point-in-time copy of the device status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceStatus {
    pub last_update_result: UpdateResult,
    pub build: BuildInfo,
}

struct StatusCell {
    last_update_result: AtomicI8,
    build: BuildInfo,
}

/// Sole writer of the device status, owned by the status monitor task
pub struct DeviceStatusWriter {
    cell: Arc<StatusCell>,
}

/// Read handle for HTTP handlers; may lag the writer by one dispatch
#[derive(Clone)]
pub struct DeviceStatusReader {
    cell: Arc<StatusCell>,
}

/// Create the process-wide status pair. The writer is not `Clone`, so the
/// single-writer rule is enforced by ownership.
pub fn device_status(build: BuildInfo) -> (DeviceStatusWriter, DeviceStatusReader) {
    let cell = Arc::new(StatusCell {
        last_update_result: AtomicI8::new(UpdateResult::Pending.code()),
        build,
    });

    (
        DeviceStatusWriter { cell: cell.clone() },
        DeviceStatusReader { cell },
    )
}

impl DeviceStatusWriter {
    pub fn record_update(&self, result: UpdateResult) {
        self.cell
            .last_update_result
            .store(result.code(), Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn reader(&self) -> DeviceStatusReader {
        DeviceStatusReader {
            cell: self.cell.clone(),
        }
    }
}

impl DeviceStatusReader {
    pub fn snapshot(&self) -> DeviceStatus {
        DeviceStatus {
            last_update_result: UpdateResult::from_code(
                self.cell.last_update_result.load(Ordering::Acquire),
            ),
            build: self.cell.build,
        }
    }
}
