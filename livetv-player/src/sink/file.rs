use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn, Instrument};

use super::{Capabilities, ControlState, MediaSink, SinkError};
use crate::adapter::AdapterKind;

enum WriteOp {
    /// Truncate the file and start a new recording
    Start(AdapterKind),
    Data(Bytes),
    Finish,
    Flush(oneshot::Sender<()>),
}

/// Records the demuxed stream to a file.
///
/// Each attachment starts a fresh recording: binding truncates the file, so a
/// failed adapter never leaves partial output in front of the one that works.
/// Disk access happens on a background task; the sink itself never blocks.
pub struct FileSink {
    path: PathBuf,
    capabilities: Capabilities,
    controls: Mutex<ControlState>,
    ops: mpsc::UnboundedSender<WriteOp>,
    recorder: Arc<RecorderState>,
}

#[derive(Default)]
struct RecorderState {
    bytes_written: AtomicU64,
    failed: AtomicBool,
}

impl FileSink {
    /// Create the sink and its writer task. Fails early if `path` cannot be
    /// created.
    pub async fn create(
        path: impl AsRef<Path>,
        capabilities: Capabilities,
    ) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        File::create(&path).await?;

        let (ops, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(RecorderState::default());
        let span = tracing::debug_span!("recorder", path = %path.display());
        tokio::spawn(record(path.clone(), rx, recorder.clone()).instrument(span));

        Ok(Self {
            path,
            capabilities,
            controls: Mutex::new(ControlState::default()),
            ops,
            recorder,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of the current recording that have reached the writer.
    pub fn bytes_written(&self) -> u64 {
        self.recorder.bytes_written.load(Ordering::Relaxed)
    }

    /// Resolves once everything written so far is on disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.ops.send(WriteOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn queue(&self, op: WriteOp) -> Result<(), SinkError> {
        self.ops
            .send(op)
            .map_err(|_| std::io::Error::other("recording writer has stopped").into())
    }
}

async fn record(
    path: PathBuf,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
    state: Arc<RecorderState>,
) {
    let mut writer: Option<BufWriter<File>> = None;

    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Start(kind) => {
                writer = match File::create(&path).await {
                    Ok(file) => {
                        state.bytes_written.store(0, Ordering::Relaxed);
                        state.failed.store(false, Ordering::Relaxed);
                        debug!(adapter = %kind, "Recording started");
                        Some(BufWriter::new(file))
                    }
                    Err(e) => {
                        warn!("Failed to open recording file: {e}");
                        state.failed.store(true, Ordering::Relaxed);
                        None
                    }
                };
            }
            WriteOp::Data(data) => {
                let Some(file) = writer.as_mut() else {
                    continue;
                };
                match file.write_all(&data).await {
                    Ok(()) => {
                        state
                            .bytes_written
                            .fetch_add(data.len() as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!("Failed to write recording: {e}");
                        state.failed.store(true, Ordering::Relaxed);
                        writer = None;
                    }
                }
            }
            WriteOp::Finish => finish(writer.take()).await,
            WriteOp::Flush(ack) => {
                if let Some(file) = writer.as_mut() {
                    if let Err(e) = file.flush().await {
                        warn!("Failed to flush recording: {e}");
                    }
                }
                let _ = ack.send(());
            }
        }
    }

    finish(writer.take()).await;
    trace!("Recorder stopped");
}

async fn finish(writer: Option<BufWriter<File>>) {
    let Some(mut writer) = writer else {
        return;
    };
    if let Err(e) = writer.shutdown().await {
        warn!("Failed to flush recording: {e}");
    }
}

#[async_trait]
impl MediaSink for FileSink {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn bind(&self, kind: AdapterKind) {
        self.controls.lock().bind(kind);
        self.recorder.failed.store(false, Ordering::Relaxed);
        if self.queue(WriteOp::Start(kind)).is_err() {
            warn!(path = %self.path.display(), "Recording writer has stopped");
        }
    }

    fn release(&self, kind: AdapterKind) {
        if self.controls.lock().release(kind) {
            let _ = self.queue(WriteOp::Finish);
        }
    }

    fn write(&self, data: Bytes) -> Result<(), SinkError> {
        if self.controls.lock().bound.is_none() {
            return Err(SinkError::NotReady);
        }
        if self.recorder.failed.load(Ordering::Relaxed) {
            return Err(std::io::Error::other("recording failed, see earlier warnings").into());
        }
        self.queue(WriteOp::Data(data))
    }

    fn is_ready(&self) -> bool {
        self.controls.lock().bound.is_some()
    }

    fn play(&self) -> Result<(), SinkError> {
        self.controls.lock().play()
    }

    fn pause(&self) {
        self.controls.lock().pause();
    }

    fn set_muted(&self, muted: bool) {
        self.controls.lock().muted = muted;
    }

    fn position(&self) -> f64 {
        self.controls.lock().playhead.position()
    }

    fn set_position(&self, seconds: f64) {
        self.controls.lock().playhead.seek(seconds);
    }
}
