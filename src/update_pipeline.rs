// Update Pipeline Module
// Streams a firmware image from an HTTP body into the inactive flash partition
// Exactly one session at a time; every begun session ends in exactly one terminal status message

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};

use crate::config::UpdateConfig;
use crate::status_queue::{OverflowPolicy, StatusQueue};
use crate::system_state::StatusMessage;

// Separator between multipart part headers and the part body
const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    NoTarget,
    Begin(String),
    Write(String),
    Finalize(String),
    Commit(String),
}

impl std::fmt::Display for FlashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlashError::NoTarget => write!(f, "No inactive firmware partition available"),
            FlashError::Begin(msg) => write!(f, "Failed to open update partition: {}", msg),
            FlashError::Write(msg) => write!(f, "Flash write failed: {}", msg),
            FlashError::Finalize(msg) => write!(f, "Image validation failed: {}", msg),
            FlashError::Commit(msg) => write!(f, "Failed to set boot partition: {}", msg),
        }
    }
}

impl std::error::Error for FlashError {}

/// Write target resolved when a session opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPartition {
    pub label: String,
    pub address: u32,
}

/// Raw flash primitives for the spare firmware slot
pub trait FlashPartition: Send {
    /// Resolve the inactive partition and open it for writing
    fn begin(&mut self) -> Result<TargetPartition, FlashError>;

    fn write(&mut self, data: &[u8]) -> Result<(), FlashError>;

    /// Close the image and validate it. Does not change the boot target.
    fn finalize(&mut self) -> Result<(), FlashError>;

    /// Select the finalized image as the next boot target
    fn set_boot(&mut self) -> Result<(), FlashError>;

    /// Release an open write handle. Must be a no-op when nothing is open.
    fn abort(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvError {
    Timeout,
    Io(String),
}

/// Blocking byte source for the request body
pub trait BodySource {
    /// `Ok(0)` means the peer closed the connection
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, RecvError>;
}

/// How the image is wrapped on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// Browser form upload: part headers precede the image
    Multipart,
    /// Body is the image itself
    Raw,
}

impl BodyFraming {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) if ct.trim_start().to_ascii_lowercase().starts_with("multipart/") => Self::Multipart,
            _ => Self::Raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Receiving,
    Finalizing,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    Conflict,
    RestartPending,
    InvalidLength,
    Framing,
    Flash(FlashError),
    Receive(String),
    ConnectionClosed { received: u32, declared: u32 },
    TimedOut(u32),
    Incomplete { received: u32, declared: u32 },
    NotReceiving(UpdateState),
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateError::Conflict => write!(f, "Another firmware update is already in progress"),
            UpdateError::RestartPending => write!(f, "Firmware already committed, restart pending"),
            UpdateError::InvalidLength => write!(f, "Missing or zero Content-Length"),
            UpdateError::Framing => write!(f, "Upload framing header not terminated"),
            UpdateError::Flash(e) => write!(f, "{}", e),
            UpdateError::Receive(msg) => write!(f, "Receive failed: {}", msg),
            UpdateError::ConnectionClosed { received, declared } => write!(
                f,
                "Connection closed after {} of {} bytes",
                received, declared
            ),
            UpdateError::TimedOut(n) => write!(f, "Gave up after {} consecutive receive timeouts", n),
            UpdateError::Incomplete { received, declared } => {
                write!(f, "Image incomplete: {} of {} bytes", received, declared)
            }
            UpdateError::NotReceiving(state) => write!(f, "Session is not receiving ({:?})", state),
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<FlashError> for UpdateError {
    fn from(e: FlashError) -> Self {
        UpdateError::Flash(e)
    }
}

/// Proof that a new image has been committed as the boot target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootCommitted {
    pub partition: TargetPartition,
    pub image_len: u32,
    pub sha256: String,
}

pub struct UpdatePipeline<P: FlashPartition> {
    flash: Mutex<P>,
    status: Arc<StatusQueue>,
    config: UpdateConfig,
    // Set once an image is committed; the spare slot is then the next boot target
    committed: AtomicBool,
}

impl<P: FlashPartition> UpdatePipeline<P> {
    pub fn new(flash: P, status: Arc<StatusQueue>, config: UpdateConfig) -> Self {
        Self {
            flash: Mutex::new(flash),
            status,
            config,
            committed: AtomicBool::new(false),
        }
    }

    /// Open a session for a body of `declared_len` transport bytes.
    /// A second caller gets `Conflict` while a session is alive, and
    /// `RestartPending` once an image has been committed this boot.
    pub fn begin_update(
        &self,
        declared_len: u32,
        framing: BodyFraming,
    ) -> Result<UpdateSession<'_, P>, UpdateError> {
        if declared_len == 0 {
            return Err(UpdateError::InvalidLength);
        }

        let flash = match self.flash.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                warn!("⚠️ Rejecting firmware update: session already active");
                return Err(UpdateError::Conflict);
            }
            // Previous handler panicked mid-session
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        if self.committed.load(Ordering::Acquire) {
            warn!("⚠️ Rejecting firmware update: restart pending");
            return Err(UpdateError::RestartPending);
        }

        let mut session = UpdateSession {
            flash,
            pipeline: self,
            target: None,
            declared_len,
            received: 0,
            bytes_written: 0,
            awaiting_header: framing == BodyFraming::Multipart,
            state: UpdateState::Idle,
            digest: Sha256::new(),
            last_progress: 0,
            terminal_sent: false,
        };

        session.start()?;
        Ok(session)
    }

    /// Drive a whole update from `source`: begin, receive, finalize
    pub fn run_update<S: BodySource>(
        &self,
        declared_len: u32,
        framing: BodyFraming,
        source: &mut S,
    ) -> Result<BootCommitted, UpdateError> {
        let mut session = self.begin_update(declared_len, framing)?;
        session.receive_from(source)?;
        session.finalize()
    }

    #[cfg(test)]
    pub(crate) fn is_busy(&self) -> bool {
        matches!(self.flash.try_lock(), Err(TryLockError::WouldBlock))
    }

    fn notify(&self, msg: StatusMessage) {
        let policy = if msg.is_update_outcome() {
            OverflowPolicy::DropOldest
        } else {
            OverflowPolicy::Reject
        };

        if let Err(e) = self.status.send_blocking(msg, policy) {
            error!("❌ Failed to report {:?}: {}", msg, e);
        }
    }
}

/// One in-flight update. Holds the flash exclusively until dropped.
pub struct UpdateSession<'a, P: FlashPartition> {
    flash: MutexGuard<'a, P>,
    pipeline: &'a UpdatePipeline<P>,
    target: Option<TargetPartition>,
    declared_len: u32,
    received: u32,      // transport bytes consumed, framing included
    bytes_written: u32, // firmware bytes handed to flash
    awaiting_header: bool,
    state: UpdateState,
    digest: Sha256,
    last_progress: u32,
    terminal_sent: bool,
}

impl<'a, P: FlashPartition> UpdateSession<'a, P> {
    fn start(&mut self) -> Result<(), UpdateError> {
        info!("📦 Starting firmware update ({} bytes declared)", self.declared_len);
        self.pipeline.notify(StatusMessage::UpdateInitialized);

        match self.flash.begin() {
            Ok(target) => {
                info!(
                    "📝 Writing to partition '{}' at 0x{:x}",
                    target.label, target.address
                );
                self.target = Some(target);
                self.state = UpdateState::Receiving;
                Ok(())
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    pub fn bytes_received(&self) -> u32 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.declared_len
    }

    /// Feed body bytes. Returns the number of firmware bytes written to flash.
    /// Bytes beyond the declared length are ignored.
    pub fn write_chunk(&mut self, bytes: &[u8]) -> Result<u32, UpdateError> {
        if self.state != UpdateState::Receiving {
            return Err(UpdateError::NotReceiving(self.state));
        }

        let remaining = (self.declared_len - self.received) as usize;
        let chunk = &bytes[..bytes.len().min(remaining)];
        self.received += chunk.len() as u32;

        let payload = if self.awaiting_header {
            match find_separator(chunk) {
                Some(end) => {
                    debug!("Skipped {} bytes of upload framing", end);
                    self.awaiting_header = false;
                    &chunk[end..]
                }
                None => {
                    error!("❌ No header separator in first upload chunk");
                    return Err(self.fail(UpdateError::Framing));
                }
            }
        } else {
            chunk
        };

        if !payload.is_empty() {
            if let Err(e) = self.flash.write(payload) {
                return Err(self.fail(e.into()));
            }
            self.digest.update(payload);
            self.bytes_written += payload.len() as u32;
        }

        self.log_progress();
        Ok(payload.len() as u32)
    }

    /// Pull the body from `source` until the declared length is consumed.
    /// Receive timeouts are retried; anything else fails the session.
    pub fn receive_from<S: BodySource>(&mut self, source: &mut S) -> Result<(), UpdateError> {
        let mut buf = vec![0u8; self.pipeline.config.recv_buffer_size.max(1)];
        let mut timeouts = 0u32;

        while !self.is_complete() {
            let want = buf.len().min((self.declared_len - self.received) as usize);

            match source.recv(&mut buf[..want]) {
                Ok(0) => {
                    let err = UpdateError::ConnectionClosed {
                        received: self.received,
                        declared: self.declared_len,
                    };
                    return Err(self.fail(err));
                }
                Ok(n) => {
                    timeouts = 0;
                    self.write_chunk(&buf[..n])?;
                }
                Err(RecvError::Timeout) => {
                    timeouts += 1;
                    if timeouts >= self.pipeline.config.max_consecutive_timeouts {
                        return Err(self.fail(UpdateError::TimedOut(timeouts)));
                    }
                    debug!("Receive timeout {}, retrying", timeouts);
                }
                Err(RecvError::Io(msg)) => return Err(self.fail(UpdateError::Receive(msg))),
            }
        }

        Ok(())
    }

    /// Validate the image and switch the boot target. Only runs once the
    /// full declared length has been consumed.
    pub fn finalize(&mut self) -> Result<BootCommitted, UpdateError> {
        if self.state != UpdateState::Receiving {
            return Err(UpdateError::NotReceiving(self.state));
        }

        if !self.is_complete() {
            let err = UpdateError::Incomplete {
                received: self.received,
                declared: self.declared_len,
            };
            return Err(self.fail(err));
        }

        self.state = UpdateState::Finalizing;
        info!("🔍 Validating firmware image ({} bytes)", self.bytes_written);

        if let Err(e) = self.flash.finalize() {
            return Err(self.fail(e.into()));
        }
        if let Err(e) = self.flash.set_boot() {
            return Err(self.fail(e.into()));
        }

        self.state = UpdateState::Success;
        self.terminal_sent = true;
        self.pipeline.committed.store(true, Ordering::Release);
        self.pipeline.notify(StatusMessage::UpdateSucceeded);

        let sha256 = self
            .digest
            .clone()
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();

        info!("✅ Firmware committed, sha256 {}", sha256);

        Ok(BootCommitted {
            partition: self.target.clone().ok_or(UpdateError::Flash(FlashError::NoTarget))?,
            image_len: self.bytes_written,
            sha256,
        })
    }

    fn fail(&mut self, err: UpdateError) -> UpdateError {
        error!("❌ Firmware update failed: {}", err);
        self.flash.abort();
        self.state = UpdateState::Failed;

        if !self.terminal_sent {
            self.terminal_sent = true;
            self.pipeline.notify(StatusMessage::UpdateFailed);
        }

        err
    }

    fn log_progress(&mut self) {
        let progress = (self.received as u64 * 100 / self.declared_len as u64) as u32;
        if progress / 10 > self.last_progress / 10 {
            info!("📊 Update progress: {}% ({} bytes)", progress, self.bytes_written);
        }
        self.last_progress = progress;
    }
}

impl<P: FlashPartition> Drop for UpdateSession<'_, P> {
    fn drop(&mut self) {
        if !self.terminal_sent {
            warn!("⚠️ Update session dropped before completion");
            let _ = self.fail(UpdateError::Incomplete {
                received: self.received,
                declared: self.declared_len,
            });
        }
    }
}

// Offset just past the first blank line
fn find_separator(chunk: &[u8]) -> Option<usize> {
    chunk
        .windows(HEADER_SEPARATOR.len())
        .position(|w| w == HEADER_SEPARATOR)
        .map(|pos| pos + HEADER_SEPARATOR.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Default)]
    struct FlashLog {
        written: Vec<u8>,
        began: usize,
        aborted: usize,
        finalized: bool,
        boot_set: bool,
        fail_begin: bool,
        fail_write: bool,
        fail_finalize: bool,
    }

    #[derive(Clone, Default)]
    struct FakeFlash {
        log: Arc<Mutex<FlashLog>>,
    }

    impl FlashPartition for FakeFlash {
        fn begin(&mut self) -> Result<TargetPartition, FlashError> {
            let mut log = self.log.lock().unwrap();
            if log.fail_begin {
                return Err(FlashError::NoTarget);
            }
            log.began += 1;
            Ok(TargetPartition {
                label: "ota_1".to_string(),
                address: 0x1d0000,
            })
        }

        fn write(&mut self, data: &[u8]) -> Result<(), FlashError> {
            let mut log = self.log.lock().unwrap();
            if log.fail_write {
                return Err(FlashError::Write("flash fault".to_string()));
            }
            log.written.extend_from_slice(data);
            Ok(())
        }

        fn finalize(&mut self) -> Result<(), FlashError> {
            let mut log = self.log.lock().unwrap();
            if log.fail_finalize {
                return Err(FlashError::Finalize("bad image".to_string()));
            }
            log.finalized = true;
            Ok(())
        }

        fn set_boot(&mut self) -> Result<(), FlashError> {
            self.log.lock().unwrap().boot_set = true;
            Ok(())
        }

        fn abort(&mut self) {
            self.log.lock().unwrap().aborted += 1;
        }
    }

    struct ScriptedBody {
        steps: VecDeque<Result<Vec<u8>, RecvError>>,
    }

    impl ScriptedBody {
        fn new(steps: Vec<Result<Vec<u8>, RecvError>>) -> Self {
            Self {
                steps: steps.into(),
            }
        }
    }

    impl BodySource for ScriptedBody {
        fn recv(&mut self, buf: &mut [u8]) -> Result<usize, RecvError> {
            match self.steps.pop_front() {
                None => Ok(0),
                Some(Err(e)) => Err(e),
                Some(Ok(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.steps.push_front(Ok(data.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    fn pipeline() -> (UpdatePipeline<FakeFlash>, Arc<Mutex<FlashLog>>, Arc<StatusQueue>) {
        let flash = FakeFlash::default();
        let log = flash.log.clone();
        let queue = Arc::new(StatusQueue::new(Duration::ZERO));
        let config = UpdateConfig {
            recv_buffer_size: 16,
            max_consecutive_timeouts: 3,
        };
        (UpdatePipeline::new(flash, queue.clone(), config), log, queue)
    }

    fn drain(queue: &StatusQueue) -> Vec<StatusMessage> {
        std::iter::from_fn(|| queue.try_receive()).collect()
    }

    fn terminal_count(messages: &[StatusMessage]) -> usize {
        messages.iter().filter(|m| m.is_update_outcome()).count()
    }

    #[test]
    fn raw_image_is_written_and_committed() {
        let (pipeline, log, queue) = pipeline();
        let image: Vec<u8> = (0..100u8).collect();
        let mut body = ScriptedBody::new(vec![Ok(image.clone())]);

        let committed = pipeline
            .run_update(image.len() as u32, BodyFraming::Raw, &mut body)
            .unwrap();

        assert_eq!(committed.image_len, 100);
        assert_eq!(committed.partition.label, "ota_1");
        assert_eq!(committed.sha256.len(), 64);

        let log = log.lock().unwrap();
        assert_eq!(log.written, image);
        assert!(log.finalized && log.boot_set);
        assert_eq!(
            drain(&queue),
            vec![StatusMessage::UpdateInitialized, StatusMessage::UpdateSucceeded]
        );
    }

    #[test]
    fn multipart_headers_are_stripped() {
        let (pipeline, log, _queue) = pipeline();
        let mut body = b"------boundary\r\nContent-Disposition: form-data; name=\"f\"\r\n\r\n".to_vec();
        body.extend_from_slice(b"FIRMWARE");
        let declared = body.len() as u32;

        let mut session = pipeline.begin_update(declared, BodyFraming::Multipart).unwrap();
        assert_eq!(session.write_chunk(&body).unwrap(), 8);
        session.finalize().unwrap();

        assert_eq!(log.lock().unwrap().written, b"FIRMWARE");
    }

    #[test]
    fn missing_separator_fails_without_writing() {
        let (pipeline, log, queue) = pipeline();
        let mut session = pipeline.begin_update(32, BodyFraming::Multipart).unwrap();

        assert_eq!(
            session.write_chunk(b"no blank line in here"),
            Err(UpdateError::Framing)
        );
        assert_eq!(session.state(), UpdateState::Failed);
        drop(session);

        let log = log.lock().unwrap();
        assert!(log.written.is_empty());
        assert!(!log.boot_set);
        assert_eq!(terminal_count(&drain(&queue)), 1);
    }

    #[test]
    fn connection_drop_fails_and_keeps_boot_partition() {
        let (pipeline, log, queue) = pipeline();
        let mut body = ScriptedBody::new(vec![Ok(vec![0xAA; 40])]);

        let result = pipeline.run_update(100, BodyFraming::Raw, &mut body);

        assert_eq!(
            result,
            Err(UpdateError::ConnectionClosed {
                received: 40,
                declared: 100
            })
        );
        let log = log.lock().unwrap();
        assert!(!log.finalized);
        assert!(!log.boot_set);
        assert_eq!(log.aborted, 1);
        assert_eq!(drain(&queue), vec![StatusMessage::UpdateInitialized, StatusMessage::UpdateFailed]);
    }

    #[test]
    fn finalize_before_full_length_is_refused() {
        let (pipeline, log, queue) = pipeline();
        let mut session = pipeline.begin_update(10, BodyFraming::Raw).unwrap();
        session.write_chunk(&[1, 2, 3]).unwrap();

        assert_eq!(
            session.finalize(),
            Err(UpdateError::Incomplete {
                received: 3,
                declared: 10
            })
        );
        drop(session);

        assert!(!log.lock().unwrap().finalized);
        assert_eq!(terminal_count(&drain(&queue)), 1);
    }

    #[test]
    fn timeouts_are_retried() {
        let (pipeline, log, _queue) = pipeline();
        let mut body = ScriptedBody::new(vec![
            Err(RecvError::Timeout),
            Ok(vec![7; 5]),
            Err(RecvError::Timeout),
            Err(RecvError::Timeout),
            Ok(vec![8; 5]),
        ]);

        pipeline.run_update(10, BodyFraming::Raw, &mut body).unwrap();
        assert_eq!(log.lock().unwrap().written.len(), 10);
    }

    #[test]
    fn persistent_timeouts_abandon_the_session() {
        let (pipeline, _log, queue) = pipeline();
        let mut body = ScriptedBody::new(vec![Err(RecvError::Timeout); 3]);

        assert_eq!(
            pipeline.run_update(10, BodyFraming::Raw, &mut body),
            Err(UpdateError::TimedOut(3))
        );
        assert_eq!(terminal_count(&drain(&queue)), 1);
    }

    #[test]
    fn receive_error_aborts_immediately() {
        let (pipeline, log, queue) = pipeline();
        let mut body = ScriptedBody::new(vec![
            Ok(vec![1; 4]),
            Err(RecvError::Io("socket reset".to_string())),
            Ok(vec![2; 6]),
        ]);

        assert_eq!(
            pipeline.run_update(10, BodyFraming::Raw, &mut body),
            Err(UpdateError::Receive("socket reset".to_string()))
        );
        assert_eq!(log.lock().unwrap().written.len(), 4);
        assert_eq!(drain(&queue), vec![StatusMessage::UpdateInitialized, StatusMessage::UpdateFailed]);
    }

    #[test]
    fn failed_validation_leaves_boot_target_untouched() {
        let (pipeline, log, queue) = pipeline();
        log.lock().unwrap().fail_finalize = true;
        let mut body = ScriptedBody::new(vec![Ok(vec![0; 10])]);

        assert!(matches!(
            pipeline.run_update(10, BodyFraming::Raw, &mut body),
            Err(UpdateError::Flash(FlashError::Finalize(_)))
        ));
        assert!(!log.lock().unwrap().boot_set);
        assert_eq!(terminal_count(&drain(&queue)), 1);
    }

    #[test]
    fn write_failure_reports_once() {
        let (pipeline, log, queue) = pipeline();
        log.lock().unwrap().fail_write = true;

        let mut session = pipeline.begin_update(10, BodyFraming::Raw).unwrap();
        assert!(session.write_chunk(&[0; 4]).is_err());
        assert_eq!(
            session.write_chunk(&[0; 4]),
            Err(UpdateError::NotReceiving(UpdateState::Failed))
        );
        drop(session);

        assert_eq!(terminal_count(&drain(&queue)), 1);
    }

    #[test]
    fn unavailable_partition_fails_session() {
        let (pipeline, log, queue) = pipeline();
        log.lock().unwrap().fail_begin = true;

        assert!(matches!(
            pipeline.begin_update(10, BodyFraming::Raw),
            Err(UpdateError::Flash(FlashError::NoTarget))
        ));
        assert_eq!(drain(&queue), vec![StatusMessage::UpdateInitialized, StatusMessage::UpdateFailed]);
        assert!(!pipeline.is_busy());
    }

    #[test]
    fn committed_image_blocks_further_sessions() {
        let (pipeline, log, queue) = pipeline();
        let mut body = ScriptedBody::new(vec![Ok(vec![0x5A; 10])]);
        pipeline.run_update(10, BodyFraming::Raw, &mut body).unwrap();

        assert!(matches!(
            pipeline.begin_update(10, BodyFraming::Raw),
            Err(UpdateError::RestartPending)
        ));

        let log = log.lock().unwrap();
        assert_eq!(log.began, 1);
        assert_eq!(log.aborted, 0);
        assert_eq!(log.written, vec![0x5A; 10]);
        assert_eq!(
            drain(&queue),
            vec![StatusMessage::UpdateInitialized, StatusMessage::UpdateSucceeded]
        );
    }

    #[test]
    fn failed_session_allows_retry() {
        let (pipeline, log, queue) = pipeline();
        let mut short = ScriptedBody::new(vec![Ok(vec![1; 4])]);
        assert!(pipeline.run_update(10, BodyFraming::Raw, &mut short).is_err());

        let mut full = ScriptedBody::new(vec![Ok(vec![2; 10])]);
        pipeline.run_update(10, BodyFraming::Raw, &mut full).unwrap();

        assert_eq!(log.lock().unwrap().began, 2);
        assert_eq!(
            drain(&queue),
            vec![
                StatusMessage::UpdateInitialized,
                StatusMessage::UpdateFailed,
                StatusMessage::UpdateInitialized,
                StatusMessage::UpdateSucceeded,
            ]
        );
    }

    #[test]
    fn concurrent_session_is_rejected() {
        let (pipeline, log, queue) = pipeline();
        let first = pipeline.begin_update(10, BodyFraming::Raw).unwrap();

        assert!(pipeline.is_busy());
        assert!(matches!(
            pipeline.begin_update(10, BodyFraming::Raw),
            Err(UpdateError::Conflict)
        ));
        assert_eq!(log.lock().unwrap().began, 1);

        drop(first);
        assert!(!pipeline.is_busy());
        // Abandoned first session still reports exactly once
        assert_eq!(terminal_count(&drain(&queue)), 1);
    }

    #[test]
    fn excess_bytes_are_ignored() {
        let (pipeline, log, _queue) = pipeline();
        let mut session = pipeline.begin_update(4, BodyFraming::Raw).unwrap();

        assert_eq!(session.write_chunk(&[1, 2, 3, 4, 5, 6]).unwrap(), 4);
        assert!(session.is_complete());
        session.finalize().unwrap();

        assert_eq!(log.lock().unwrap().written, vec![1, 2, 3, 4]);
    }

    #[test]
    fn zero_length_is_rejected_without_session() {
        let (pipeline, _log, queue) = pipeline();
        assert!(matches!(
            pipeline.begin_update(0, BodyFraming::Raw),
            Err(UpdateError::InvalidLength)
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn framing_is_detected_from_content_type() {
        assert_eq!(
            BodyFraming::from_content_type(Some("multipart/form-data; boundary=x")),
            BodyFraming::Multipart
        );
        assert_eq!(
            BodyFraming::from_content_type(Some("application/octet-stream")),
            BodyFraming::Raw
        );
        assert_eq!(BodyFraming::from_content_type(None), BodyFraming::Raw);
    }
}
