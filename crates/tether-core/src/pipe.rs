//! Pipes: one-directional byte channels between peers, named by the oid of
//! the reader-side sink object, with window-based flow control and error
//! propagation in both directions.
//!
//! The writer may have at most `window` unacknowledged bytes in flight;
//! the receiver returns credit with an ack after each applied local write.
//! To avoid pathological fragmentation at high latency the writer never
//! sends less than a tenth of the window (unless the tail is smaller) and
//! prefers chunks of about half the window, so data and acks overlap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::debug;

use crate::channel::ChannelCore;
use crate::error::{well_known, PipeError, RemoteError};
use crate::marshal::Oid;
use crate::object::{CallArgs, InvokeContext, Proxy, RemoteObject, ReturnValue};

pub const SINK_INTERFACE: &str = "tether.PipeSink";
pub const SOURCE_INTERFACE: &str = "tether.PipeSource";

/// Writer-side credit state for one outbound pipe.
pub struct PipeWindow {
    max: usize,
    state: Mutex<WindowState>,
    notify: Notify,
}

struct WindowState {
    available: isize,
    dead: Option<RemoteError>,
}

impl PipeWindow {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        PipeWindow {
            max,
            state: Mutex::new(WindowState { available: max as isize, dead: None }),
            notify: Notify::new(),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn available(&self) -> isize {
        self.state.lock().available
    }

    /// Credit returned by the peer's ack.
    pub fn grant(&self, n: usize) {
        let mut state = self.state.lock();
        state.available += n as isize;
        drop(state);
        self.notify.notify_waiters();
    }

    /// The peer reader is gone. The first recorded cause wins; later ones
    /// are ignored (a `Dead` can race a local close).
    pub fn kill(&self, cause: RemoteError) {
        let mut state = self.state.lock();
        if state.dead.is_none() {
            state.dead = Some(cause);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn death(&self) -> Option<RemoteError> {
        self.state.lock().dead.clone()
    }

    fn min_send(&self, remaining: usize) -> usize {
        remaining.min((self.max / 10).max(1))
    }

    pub fn preferred_chunk(&self) -> usize {
        (self.max / 2).max(1)
    }

    /// Block until enough credit is available, then take a chunk's worth.
    /// Returns how many bytes the caller may send.
    pub async fn acquire(&self, remaining: usize) -> Result<usize, PipeError> {
        let min_needed = self.min_send(remaining);
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(cause) = &state.dead {
                    return Err(PipeError::Dead(cause.clone()));
                }
                if state.available >= min_needed as isize {
                    let take = remaining
                        .min(state.available as usize)
                        .min(self.preferred_chunk());
                    state.available -= take as isize;
                    return Ok(take);
                }
            }
            notified.await;
        }
    }

    /// Wait until all in-flight bytes are acked (or the pipe died).
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock();
                if state.dead.is_some() || state.available >= self.max as isize {
                    return;
                }
            }
            notified.await;
        }
    }
}

/// Where received pipe bytes land on the reader side.
#[async_trait]
pub trait PipeSink: Send + Sync {
    async fn write(&self, data: &[u8]) -> std::io::Result<()>;

    async fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }

    /// Called once when the writer sends EOF. Implementations should be
    /// tolerant of a second call anyway.
    async fn close(&self) -> std::io::Result<()>;

    /// The channel is going away with `cause`; pending readers should fail.
    fn error(&self, cause: &RemoteError) {
        let _ = cause;
    }
}

/// Export-table face of a sink: not invocable, only reachable through pipe
/// commands.
pub(crate) struct SinkExport {
    sink: Arc<dyn PipeSink>,
}

impl SinkExport {
    pub(crate) fn new(sink: Arc<dyn PipeSink>) -> Self {
        SinkExport { sink }
    }
}

#[async_trait]
impl RemoteObject for SinkExport {
    fn interfaces(&self) -> Vec<String> {
        vec![SINK_INTERFACE.to_string()]
    }

    async fn invoke(
        &self,
        _cx: InvokeContext,
        method: &str,
        _args: CallArgs,
    ) -> Result<ReturnValue, RemoteError> {
        Err(RemoteError::new(
            well_known::UNKNOWN_METHOD,
            format!("pipe sinks are driven by pipe commands, not calls ('{}')", method),
        ))
    }

    fn as_pipe_sink(&self) -> Option<Arc<dyn PipeSink>> {
        Some(self.sink.clone())
    }
}

/// Writable end of a pipe whose sink lives on the peer. Obtained by
/// materializing an output-pipe argument, or internally by the greedy pump.
pub struct PipeSender {
    channel: Weak<ChannelCore>,
    oid: Oid,
    window: Arc<PipeWindow>,
    throttled: bool,
    state: Mutex<SenderState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SenderState {
    Open,
    Draining,
    Closed,
}

impl PipeSender {
    pub(crate) fn new(
        channel: Weak<ChannelCore>,
        oid: Oid,
        window: Arc<PipeWindow>,
        throttled: bool,
    ) -> Self {
        PipeSender {
            channel,
            oid,
            window,
            throttled,
            state: Mutex::new(SenderState::Open),
        }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    fn channel(&self) -> Result<Arc<ChannelCore>, PipeError> {
        self.channel.upgrade().ok_or(PipeError::ChannelClosed)
    }

    /// Write all of `buf`, blocking whenever window credit runs short.
    pub async fn write(&self, buf: &[u8]) -> Result<(), PipeError> {
        if *self.state.lock() != SenderState::Open {
            return Err(PipeError::Closed);
        }
        let mut offset = 0;
        while offset < buf.len() {
            let remaining = buf.len() - offset;
            let take = if self.throttled {
                self.window.acquire(remaining).await?
            } else {
                // Legacy unthrottled path: no acks will come; just prefer
                // sensible chunk sizes.
                if let Some(cause) = self.window.death() {
                    return Err(PipeError::Dead(cause));
                }
                remaining.min(self.window.preferred_chunk())
            };
            let channel = self.channel()?;
            channel
                .send_pipe_chunk(self.oid, &buf[offset..offset + take])
                .await
                .map_err(|_| PipeError::ChannelClosed)?;
            offset += take;
        }
        Ok(())
    }

    /// Ask the peer to flush its local sink.
    pub async fn flush(&self) -> Result<(), PipeError> {
        if *self.state.lock() != SenderState::Open {
            return Err(PipeError::Closed);
        }
        let channel = self.channel()?;
        channel.send_pipe_flush(self.oid).await.map_err(|_| PipeError::ChannelClosed)
    }

    /// Close the pipe: exactly one EOF goes out, then the sender drains
    /// outstanding acks. Closing an already-dead pipe succeeds, since the
    /// missing bytes can never be observed anyway.
    pub async fn close(&self) -> Result<(), PipeError> {
        {
            let mut state = self.state.lock();
            match *state {
                SenderState::Open => *state = SenderState::Draining,
                SenderState::Draining | SenderState::Closed => return Ok(()),
            }
        }
        if let Ok(channel) = self.channel() {
            let _ = channel.send_pipe_eof(self.oid).await;
            if self.throttled {
                self.window.wait_drained().await;
            }
            channel.remove_window(self.oid);
        }
        *self.state.lock() = SenderState::Closed;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        *self.state.lock() == SenderState::Open
    }
}

/// In-memory pipe sink with an async read side. Used for greedy input
/// streams and anywhere the reader is local code rather than a file or
/// socket.
pub struct PipeBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
}

struct BufferState {
    data: std::collections::VecDeque<u8>,
    eof: bool,
    dead: Option<RemoteError>,
    closed_by_reader: bool,
}

impl PipeBuffer {
    pub fn new() -> Self {
        PipeBuffer {
            state: Mutex::new(BufferState {
                data: std::collections::VecDeque::new(),
                eof: false,
                dead: None,
                closed_by_reader: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Read up to `max` bytes. An empty result means EOF.
    pub async fn read_chunk(&self, max: usize) -> std::io::Result<Vec<u8>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if !state.data.is_empty() {
                    let take = state.data.len().min(max.max(1));
                    let chunk: Vec<u8> = state.data.drain(..take).collect();
                    return Ok(chunk);
                }
                if let Some(cause) = &state.dead {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        cause.to_string(),
                    ));
                }
                if state.eof || state.closed_by_reader {
                    return Ok(Vec::new());
                }
            }
            notified.await;
        }
    }

    pub async fn read_to_end(&self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read_chunk(64 * 1024).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// The local reader is done; subsequent writer chunks fail, which
    /// propagates a `Pipe.Dead` back to the writer.
    pub fn close_reader(&self) {
        self.state.lock().closed_by_reader = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PipeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipeSink for PipeBuffer {
    async fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut state = self.state.lock();
        if state.closed_by_reader {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "reader closed this pipe",
            ));
        }
        state.data.extend(data);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> std::io::Result<()> {
        self.state.lock().eof = true;
        self.notify.notify_waiters();
        Ok(())
    }

    fn error(&self, cause: &RemoteError) {
        let mut state = self.state.lock();
        if state.dead.is_none() {
            state.dead = Some(cause.clone());
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

/// Adapter: any `AsyncWrite` as a pipe sink.
pub struct WriterSink<W> {
    writer: AsyncMutex<W>,
    closed: AtomicBool,
}

impl<W: AsyncWrite + Send + Unpin> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        WriterSink { writer: AsyncMutex::new(writer), closed: AtomicBool::new(false) }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> PipeSink for WriterSink<W> {
    async fn write(&self, data: &[u8]) -> std::io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "sink already closed",
            ));
        }
        self.writer.lock().await.write_all(data).await
    }

    async fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().await.flush().await
    }

    async fn close(&self) -> std::io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.writer.lock().await.shutdown().await
    }
}

/// Readable end of a stream the peer offered as a call argument.
pub struct RemoteInput {
    inner: InputInner,
}

enum InputInner {
    /// Every read is a round trip to the source object.
    Pull { proxy: Proxy, closed: AtomicBool },
    /// The source side pumps proactively into a local buffer.
    Greedy {
        buffer: Arc<PipeBuffer>,
        sink_oid: Oid,
        channel: Weak<ChannelCore>,
        closed: AtomicBool,
    },
}

impl RemoteInput {
    pub(crate) fn pull(proxy: Proxy) -> Self {
        RemoteInput { inner: InputInner::Pull { proxy, closed: AtomicBool::new(false) } }
    }

    pub(crate) fn greedy(
        buffer: Arc<PipeBuffer>,
        sink_oid: Oid,
        channel: Weak<ChannelCore>,
    ) -> Self {
        RemoteInput {
            inner: InputInner::Greedy { buffer, sink_oid, channel, closed: AtomicBool::new(false) },
        }
    }

    /// Read up to `max` bytes; empty means EOF.
    pub async fn read_chunk(&self, max: usize) -> std::io::Result<Vec<u8>> {
        match &self.inner {
            InputInner::Pull { proxy, closed } => {
                if closed.load(Ordering::Acquire) {
                    return Ok(Vec::new());
                }
                proxy
                    .invoke("read")
                    .internal()
                    .arg(&(max as u32))
                    .call::<Vec<u8>>()
                    .await
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            }
            InputInner::Greedy { buffer, .. } => buffer.read_chunk(max).await,
        }
    }

    pub async fn read_to_end(&self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read_chunk(64 * 1024).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Stop reading. The source side closes its local stream exactly once;
    /// in greedy mode any prefetched-but-unread bytes are discarded.
    pub async fn close(&self) -> std::io::Result<()> {
        match &self.inner {
            InputInner::Pull { proxy, closed } => {
                if closed.swap(true, Ordering::AcqRel) {
                    return Ok(());
                }
                proxy
                    .invoke("close")
                    .internal()
                    .call_unit()
                    .await
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            }
            InputInner::Greedy { buffer, sink_oid, channel, closed } => {
                if closed.swap(true, Ordering::AcqRel) {
                    return Ok(());
                }
                buffer.close_reader();
                if let Some(core) = channel.upgrade() {
                    let cause =
                        RemoteError::new(well_known::READER_CLOSED, "reader closed the pipe");
                    let _ = core.send_pipe_dead(*sink_oid, cause).await;
                    core.unexport_local(*sink_oid, "greedy reader closed");
                }
                Ok(())
            }
        }
    }
}

type SharedReader = Arc<AsyncMutex<Option<Box<dyn AsyncRead + Send + Unpin>>>>;

/// Read up to `max` bytes from the shared slot. EOF drops the stream,
/// which closes it exactly once; later reads just report EOF again.
async fn read_some(slot: &SharedReader, max: usize) -> std::io::Result<Vec<u8>> {
    let mut guard = slot.lock().await;
    let Some(reader) = guard.as_mut() else {
        return Ok(Vec::new());
    };
    let mut buf = vec![0u8; max.clamp(1, 64 * 1024)];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        guard.take();
        return Ok(Vec::new());
    }
    buf.truncate(n);
    Ok(buf)
}

async fn close_once(slot: &SharedReader) {
    slot.lock().await.take();
}

/// The exported face of a local readable stream offered to the peer as a
/// call argument. Serves demand reads, a single close, and the greedy pump.
pub(crate) struct SourceExport {
    reader: SharedReader,
}

impl SourceExport {
    pub(crate) fn new(reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        SourceExport { reader: Arc::new(AsyncMutex::new(Some(reader))) }
    }
}

#[async_trait]
impl RemoteObject for SourceExport {
    fn interfaces(&self) -> Vec<String> {
        vec![SOURCE_INTERFACE.to_string()]
    }

    async fn invoke(
        &self,
        cx: InvokeContext,
        method: &str,
        args: CallArgs,
    ) -> Result<ReturnValue, RemoteError> {
        match method {
            "read" => {
                let max: u32 = args.value(0)?;
                let chunk = read_some(&self.reader, max as usize)
                    .await
                    .map_err(|e| RemoteError::from_display("std.io.Error", &e))?;
                ReturnValue::of(&chunk)
            }
            "close" => {
                close_once(&self.reader).await;
                ReturnValue::unit()
            }
            "pump_to" => {
                // Greedy mode: the reader side tells us which sink to fill;
                // we drain the local stream through the window until EOF or
                // the reader gives up.
                let sink_oid: Oid = args.value(0)?;
                let slot = self.reader.clone();
                let sender = cx.channel_core().pipe_sender(sink_oid);
                tokio::spawn(async move {
                    loop {
                        let want = sender.window.preferred_chunk();
                        let chunk = match read_some(&slot, want).await {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                debug!(error = %e, "greedy pump read failed");
                                break;
                            }
                        };
                        if chunk.is_empty() {
                            let _ = sender.close().await;
                            return;
                        }
                        if let Err(e) = sender.write(&chunk).await {
                            debug!(error = %e, "greedy pump stopped");
                            break;
                        }
                    }
                    // Reader went away or the write path failed: close the
                    // local stream exactly once and stop.
                    close_once(&slot).await;
                });
                ReturnValue::unit()
            }
            other => Err(RemoteError::new(
                well_known::UNKNOWN_METHOD,
                format!("unknown stream method '{}'", other),
            )),
        }
    }
}
