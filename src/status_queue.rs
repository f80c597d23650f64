// Status Queue Module
// Bounded FIFO carrying control-plane events to the status monitor
// Producers never block indefinitely: a full queue is resolved by an explicit overflow policy

use std::time::{Duration, Instant};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::with_timeout;
use log::warn;

use crate::system_state::StatusMessage;

pub const STATUS_QUEUE_CAPACITY: usize = 3;

// Sleep between retries of a blocking send; yields the core to the consumer
const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What a producer does when the queue is still full after its send timeout
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Give up and hand the message back to the caller
    Reject,
    /// Evict the oldest queued message to make room; used for update outcomes
    DropOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    Full(StatusMessage),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Full(msg) => write!(f, "Status queue full, dropped {:?}", msg),
        }
    }
}

impl std::error::Error for QueueError {}

pub struct StatusQueue {
    channel: Channel<CriticalSectionRawMutex, StatusMessage, STATUS_QUEUE_CAPACITY>,
    send_timeout: Duration,
}

impl StatusQueue {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            channel: Channel::new(),
            send_timeout,
        }
    }

    /// Non-blocking enqueue for event-loop callbacks
    pub fn try_send(&self, msg: StatusMessage) -> Result<(), QueueError> {
        self.channel.try_send(msg).map_err(|_| {
            warn!("⚠️ Status queue full, dropping {:?}", msg);
            QueueError::Full(msg)
        })
    }

    pub async fn send(&self, msg: StatusMessage, policy: OverflowPolicy) -> Result<(), QueueError> {
        if self.channel.try_send(msg).is_ok() {
            return Ok(());
        }

        if !self.send_timeout.is_zero() {
            let timeout = embassy_time::Duration::from_micros(self.send_timeout.as_micros() as u64);
            if with_timeout(timeout, self.channel.send(msg)).await.is_ok() {
                return Ok(());
            }
        }

        self.overflow(msg, policy)
    }

    /// Enqueue from a plain thread such as an HTTP handler.
    /// Sleeps between attempts until the send timeout runs out.
    pub fn send_blocking(&self, msg: StatusMessage, policy: OverflowPolicy) -> Result<(), QueueError> {
        let deadline = Instant::now() + self.send_timeout;
        loop {
            if self.channel.try_send(msg).is_ok() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return self.overflow(msg, policy);
            }
            std::thread::sleep(BLOCKING_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn overflow(&self, msg: StatusMessage, policy: OverflowPolicy) -> Result<(), QueueError> {
        match policy {
            OverflowPolicy::Reject => {
                warn!("⚠️ Status queue full after {:?}, rejecting {:?}", self.send_timeout, msg);
                Err(QueueError::Full(msg))
            }
            OverflowPolicy::DropOldest => {
                if let Ok(evicted) = self.channel.try_receive() {
                    warn!("⚠️ Status queue full, evicting {:?} for {:?}", evicted, msg);
                }
                self.channel.try_send(msg).map_err(|_| QueueError::Full(msg))
            }
        }
    }

    pub async fn receive(&self) -> StatusMessage {
        self.channel.receive().await
    }

    pub fn try_receive(&self) -> Option<StatusMessage> {
        self.channel.try_receive().ok()
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }
}
