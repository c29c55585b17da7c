//! Camera scanning.
//!
//! A scan session owns one camera ([`FrameSource`]) and one worker task. The worker pulls
//! frames, runs QR detection on the blocking pool and pushes each newly seen payload into
//! a single-producer channel. The consumer awaits payloads with
//! [`ScanSession::next_payload`] or straight to a resolved record with
//! [`ScanSession::next_record`]. The camera is released when the worker exits, which
//! happens on a successful resolution, on [`ScanSession::stop`], on drop, or when the
//! camera runs dry.
//!
//! A code is reported when it enters the view, not again while it is held there. A
//! lookup that failed transiently is kept and retried by the next
//! [`ScanSession::next_record`] call, so a code still held in view is never lost.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    codec::{CodecError, GreyFrame, decode_payload},
    error::AppError,
    models::MaterialRecord,
    repository::Repository,
    resolve::{ResolveError, resolve},
};

/// Payloads buffered between the worker and the consumer.
const PAYLOAD_BUFFER: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("camera permission was denied; allow camera access and try again")]
    PermissionDenied,
    #[error("no usable camera: {0}")]
    Unavailable(String),
    #[error("the camera is only available over HTTPS")]
    InsecureContext,
    #[error("camera did not start within {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug, Clone)]
pub enum ScanError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Payload(#[from] CodecError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("the scanner has stopped")]
    Closed,
}

impl From<ScanError> for AppError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::Device(e) => AppError::DeviceAccess(e.to_string()),
            ScanError::Payload(e) => e.into(),
            ScanError::Resolve(e) => e.into(),
            ScanError::Closed => AppError::DeviceAccess(ScanError::Closed.to_string()),
        }
    }
}

/// FrameSource
///
/// A camera. `next_frame` returns `None` once the device has nothing more to give.
#[async_trait]
pub trait FrameSource: Send + 'static {
    async fn acquire(&mut self) -> Result<(), DeviceError>;
    async fn next_frame(&mut self) -> Option<GreyFrame>;
    async fn release(&mut self);
}

/// Runs QR detection on one frame and returns every payload that decoded.
pub fn detect_payloads(frame: &GreyFrame) -> Vec<String> {
    if frame.width == 0 || frame.height == 0 || frame.pixels.len() < frame.width * frame.height
    {
        return Vec::new();
    }

    let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
        frame.width,
        frame.height,
        |x, y| frame.pixel(x, y),
    );
    prepared
        .detect_grids()
        .into_iter()
        .filter_map(|grid| match grid.decode() {
            Ok((_, content)) => Some(content),
            Err(e) => {
                tracing::debug!(error = %e, "qr grid found but not decodable");
                None
            }
        })
        .collect()
}

/// ScanSession
pub struct ScanSession {
    payloads: mpsc::Receiver<String>,
    stop: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
    /// Payload whose lookup failed transiently, retried before waiting for a new one.
    retry: Option<String>,
}

impl ScanSession {
    /// start
    ///
    /// Acquires the camera and starts the worker. Acquisition that does not finish within
    /// `camera_timeout` fails with [`DeviceError::Timeout`] instead of hanging, and
    /// whatever the device managed to open is released again.
    pub async fn start<S: FrameSource>(
        mut source: S,
        camera_timeout: Duration,
    ) -> Result<Self, ScanError> {
        match tokio::time::timeout(camera_timeout, source.acquire()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "camera acquisition failed");
                source.release().await;
                return Err(e.into());
            }
            Err(_) => {
                tracing::warn!(timeout = ?camera_timeout, "camera acquisition timed out");
                source.release().await;
                return Err(DeviceError::Timeout(camera_timeout).into());
            }
        }

        let (tx, rx) = mpsc::channel(PAYLOAD_BUFFER);
        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = tokio::spawn(run_worker(source, tx, stop_rx));
        tracing::debug!("scan session started");

        Ok(Self {
            payloads: rx,
            stop: Some(stop_tx),
            worker: Some(worker),
            retry: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.stop.is_some()
    }

    /// Awaits the next payload the worker has not reported before.
    pub async fn next_payload(&mut self) -> Result<String, ScanError> {
        if !self.is_active() {
            return Err(ScanError::Closed);
        }
        self.payloads.recv().await.ok_or(ScanError::Closed)
    }

    /// next_record
    ///
    /// Awaits the next payload, decodes it and resolves the record. A resolved record
    /// stops the session. Any other outcome leaves it running so the operator can
    /// correct the aim and try again. After a transient failure the same payload is
    /// looked up again on the next call without waiting for the camera.
    pub async fn next_record(
        &mut self,
        repo: &dyn Repository,
        store_timeout: Duration,
    ) -> Result<MaterialRecord, ScanError> {
        if !self.is_active() {
            return Err(ScanError::Closed);
        }
        let payload = match self.retry.take() {
            Some(payload) => payload,
            None => self.next_payload().await?,
        };
        let id = decode_payload(&payload)?;
        match resolve(repo, &id, store_timeout).await {
            Ok(record) => {
                tracing::info!(material_id = %id, "scan resolved");
                self.halt();
                Ok(record)
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::info!(material_id = %id, error = %e, "lookup failed, kept for retry");
                    self.retry = Some(payload);
                }
                Err(e.into())
            }
        }
    }

    /// Stops the worker and waits until the camera has been released.
    pub async fn stop(mut self) {
        self.halt();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "scan worker panicked");
            }
        }
    }

    fn halt(&mut self) {
        self.retry = None;
        if let Some(stop) = self.stop.take() {
            // The worker may already be gone; that is fine.
            let _ = stop.send(());
            self.payloads.close();
        }
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.halt();
    }
}

async fn run_worker<S: FrameSource>(
    mut source: S,
    tx: mpsc::Sender<String>,
    mut stop: oneshot::Receiver<()>,
) {
    // Payloads decoded from the most recent frame.
    let mut in_view: HashSet<String> = HashSet::new();

    'frames: loop {
        let frame = tokio::select! {
            _ = &mut stop => break 'frames,
            frame = source.next_frame() => frame,
        };
        let Some(frame) = frame else {
            tracing::debug!("camera stream ended");
            break;
        };

        let payloads = match tokio::task::spawn_blocking(move || detect_payloads(&frame)).await {
            Ok(payloads) => payloads,
            Err(e) => {
                tracing::error!(error = %e, "qr detection task failed");
                break;
            }
        };

        let previous = std::mem::take(&mut in_view);
        for payload in payloads {
            // A code held in front of the camera shows up in every frame.
            if !in_view.insert(payload.clone()) || previous.contains(&payload) {
                continue;
            }
            if tx.send(payload).await.is_err() {
                break 'frames;
            }
        }
    }

    source.release().await;
    tracing::debug!("scan worker stopped, camera released");
}

/// MockCamera
///
/// A scripted camera for tests: yields its frames in order, then idles without ending
/// the stream (like a real camera pointed at nothing). Records whether it was released.
pub struct MockCamera {
    frames: VecDeque<GreyFrame>,
    deny: Option<DeviceError>,
    acquire_delay: Duration,
    released: Arc<AtomicBool>,
}

impl MockCamera {
    pub fn new(frames: Vec<GreyFrame>) -> Self {
        Self {
            frames: frames.into(),
            deny: None,
            acquire_delay: Duration::ZERO,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Acquisition fails with `error`.
    pub fn denying(mut self, error: DeviceError) -> Self {
        self.deny = Some(error);
        self
    }

    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = delay;
        self
    }

    /// Shared flag, set once the camera has been released.
    pub fn released_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.released)
    }
}

#[async_trait]
impl FrameSource for MockCamera {
    async fn acquire(&mut self) -> Result<(), DeviceError> {
        if !self.acquire_delay.is_zero() {
            tokio::time::sleep(self.acquire_delay).await;
        }
        match &self.deny {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn next_frame(&mut self) -> Option<GreyFrame> {
        match self.frames.pop_front() {
            Some(frame) => Some(frame),
            None => std::future::pending().await,
        }
    }

    async fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}
