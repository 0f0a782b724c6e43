//! Pull-style transport over any `AsyncRead + AsyncWrite`: performs the
//! preamble handshake on construction, then runs one reader task that
//! decodes framed commands and feeds them to the receiver in order, while
//! writes serialize through an async mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::capability::{
    decode_capability_payload, encode_capability_payload, Capability, PreambleScanner,
    PreambleToken, WireMode, PREAMBLE_BINARY, PREAMBLE_CAPACITY, PREAMBLE_TEXT,
};
use crate::command::{decode_command, encode_command, Command};
use crate::error::{DecodeError, HandshakeError, TransportError};
use crate::frame::{chunk_header, chunks, frame_payload, FrameDecoder};
use crate::options::ChannelOptions;
use crate::transport::{CommandReceiver, Transport};

pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Longest Base64 capability line we are willing to read before deciding
/// the peer is not speaking this protocol.
const MAX_CAPABILITY_LINE: usize = 1024;

pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    writer: AsyncMutex<ByteWriter>,
    /// Taken by the pump at `setup`.
    reader: parking_lot::Mutex<Option<ByteReader>>,
    pump: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    remote_capability: Capability,
    mode: WireMode,
    frame_size: usize,
    read_timeout: Option<Duration>,
    read_timeout_fatal: bool,
    write_closed: AtomicBool,
    read_closed: AtomicBool,
    /// Bytes discarded ahead of the peer's preamble, kept for diagnostics.
    header_noise: Vec<u8>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("mode", &self.inner.mode)
            .field("remote_capability", &self.inner.remote_capability)
            .finish_non_exhaustive()
    }
}

impl StreamTransport {
    /// Handshake over a duplex stream and wrap it.
    pub async fn connect<S>(stream: S, options: &ChannelOptions) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_split(Box::new(reader), Box::new(writer), options).await
    }

    /// Handshake over separate read and write halves (stdio, split TCP).
    pub async fn from_split(
        mut reader: ByteReader,
        mut writer: ByteWriter,
        options: &ChannelOptions,
    ) -> Result<Self, TransportError> {
        // Announce ourselves first; the peer scans past anything earlier
        // processes may have written onto the stream.
        writer.write_all(PREAMBLE_CAPACITY).await?;
        writer.write_all(&encode_capability_payload(options.capability)?).await?;
        let emitted = options.mode.emitted();
        writer
            .write_all(match emitted {
                WireMode::Binary => PREAMBLE_BINARY,
                WireMode::Text => PREAMBLE_TEXT,
            })
            .await?;
        writer.flush().await?;

        let (remote_capability, peer_mode, header_noise) = scan_peer(&mut reader).await?;

        let mode = match options.mode.pinned() {
            Some(pinned) if pinned != peer_mode => {
                return Err(HandshakeError::ModeMismatch { ours: pinned, theirs: peer_mode }.into());
            }
            Some(pinned) => pinned,
            None => peer_mode,
        };
        if !header_noise.is_empty() {
            debug!(bytes = header_noise.len(), "discarded noise ahead of peer preamble");
        }

        Ok(StreamTransport {
            inner: Arc::new(StreamInner {
                writer: AsyncMutex::new(writer),
                reader: parking_lot::Mutex::new(Some(reader)),
                pump: parking_lot::Mutex::new(None),
                remote_capability,
                mode,
                frame_size: options.effective_frame_size(),
                read_timeout: options.read_timeout,
                read_timeout_fatal: options.transport_read_timeout_fatal,
                write_closed: AtomicBool::new(false),
                read_closed: AtomicBool::new(false),
                header_noise,
            }),
        })
    }

    /// An in-memory connected pair, handshaken and ready. Test plumbing.
    pub async fn pair(
        a_options: &ChannelOptions,
        b_options: &ChannelOptions,
    ) -> Result<(Self, Self), TransportError> {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (ta, tb) = tokio::join!(Self::connect(a, a_options), Self::connect(b, b_options));
        Ok((ta?, tb?))
    }

    pub fn mode(&self) -> WireMode {
        self.inner.mode
    }

    /// Bytes the peer's launcher wrote ahead of the preamble.
    pub fn header_noise(&self) -> &[u8] {
        &self.inner.header_noise
    }

    /// Send a keepalive chunk between commands.
    pub async fn keepalive(&self) -> Result<(), TransportError> {
        if self.inner.write_closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut writer = self.inner.writer.lock().await;
        write_block(&mut writer, self.inner.mode, &crate::frame::keepalive_chunk()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Scan the incoming stream for the peer's preambles, discarding noise.
async fn scan_peer(
    reader: &mut ByteReader,
) -> Result<(Capability, WireMode, Vec<u8>), TransportError> {
    let mut scanner = PreambleScanner::new();
    let mut capability = Capability::empty();
    loop {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(HandshakeError::Eof.into());
            }
            Err(e) => return Err(e.into()),
        }
        match scanner.push(byte[0]) {
            Some(PreambleToken::Capacity) => {
                capability = read_capability_line(reader).await?;
            }
            Some(PreambleToken::Mode(mode)) => {
                return Ok((capability, mode, scanner.take_noise()));
            }
            None => {}
        }
    }
}

/// Read the newline-terminated Base64 capability payload.
async fn read_capability_line(reader: &mut ByteReader) -> Result<Capability, TransportError> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(HandshakeError::Eof.into());
            }
            Err(e) => return Err(e.into()),
        }
        if byte[0] == b'\n' {
            return Ok(decode_capability_payload(&line)?);
        }
        line.push(byte[0]);
        if line.len() > MAX_CAPABILITY_LINE {
            return Err(HandshakeError::BadCapability("capability line never terminated".into())
                .into());
        }
    }
}

/// Write raw frame bytes in the negotiated mode. Text mode carries each
/// block as one Base64 line.
async fn write_block(
    writer: &mut ByteWriter,
    mode: WireMode,
    block: &[u8],
) -> Result<(), TransportError> {
    match mode {
        WireMode::Binary => writer.write_all(block).await?,
        WireMode::Text => {
            let mut line = base64::encode(block).into_bytes();
            line.push(b'\n');
            writer.write_all(&line).await?;
        }
    }
    Ok(())
}

async fn run_pump(
    inner: Arc<StreamInner>,
    mut reader: ByteReader,
    receiver: Arc<dyn CommandReceiver>,
) {
    let mut decoder = FrameDecoder::new();
    let mut line: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    let mut commands: Vec<Vec<u8>> = Vec::new();

    loop {
        if inner.read_closed.load(Ordering::Acquire) {
            return;
        }
        let read = match inner.read_timeout {
            Some(t) => match tokio::time::timeout(t, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => {
                    if inner.read_timeout_fatal {
                        receiver.terminate(TransportError::ReadTimeout);
                        return;
                    }
                    // Transient; keep pumping.
                    continue;
                }
            },
            None => reader.read(&mut buf).await,
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                receiver.terminate(e.into());
                return;
            }
        };
        if n == 0 {
            let clean = decoder.at_boundary() && line.is_empty();
            receiver.terminate(if clean {
                TransportError::Closed
            } else {
                TransportError::Decode(DecodeError::InvalidData(
                    "stream ended in the middle of a command".into(),
                ))
            });
            return;
        }

        match inner.mode {
            WireMode::Binary => decoder.push(&buf[..n], &mut commands),
            WireMode::Text => {
                for &b in &buf[..n] {
                    if b == b'\n' {
                        match base64::decode(&line) {
                            Ok(bytes) => decoder.push(&bytes, &mut commands),
                            Err(e) => {
                                receiver.terminate(TransportError::Decode(
                                    DecodeError::InvalidData(format!("bad text-mode line: {}", e)),
                                ));
                                return;
                            }
                        }
                        line.clear();
                    } else {
                        line.push(b);
                    }
                }
            }
        }

        for payload in commands.drain(..) {
            match decode_command(&payload) {
                Ok(cmd) => receiver.handle(cmd).await,
                Err(e) => {
                    receiver.terminate(e.into());
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn write(&self, cmd: Command, _last: bool) -> Result<(), TransportError> {
        if self.inner.write_closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let payload = encode_command(&cmd)?;
        let mut writer = self.inner.writer.lock().await;
        match self.inner.mode {
            WireMode::Binary => {
                for (body, more) in chunks(&payload, self.inner.frame_size) {
                    writer.write_all(&chunk_header(body.len(), more)).await?;
                    if !body.is_empty() {
                        writer.write_all(body).await?;
                    }
                }
            }
            WireMode::Text => {
                let framed = frame_payload(&payload, self.inner.frame_size);
                write_block(&mut writer, WireMode::Text, &framed).await?;
            }
        }
        writer.flush().await?;
        Ok(())
    }

    fn close_write(&self) {
        if self.inner.write_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Propagate EOF to the peer so its reader can wind down; reads on
        // this side continue.
        let inner = self.inner.clone();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                let mut writer = inner.writer.lock().await;
                let _ = writer.shutdown().await;
            });
        }
    }

    fn close_read(&self) {
        if self.inner.read_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.reader.lock().take();
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
    }

    fn remote_capability(&self) -> Capability {
        self.inner.remote_capability
    }

    fn setup(&self, receiver: Arc<dyn CommandReceiver>) {
        let Some(reader) = self.inner.reader.lock().take() else {
            warn!("stream transport setup called twice; ignoring");
            return;
        };
        let inner = self.inner.clone();
        let handle = tokio::spawn(run_pump(inner, reader, receiver));
        *self.inner.pump.lock() = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ModePreference;
    use crate::command::CommandBody;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    struct Collector {
        tx: mpsc::UnboundedSender<Command>,
        terminated: Arc<Mutex<Option<TransportError>>>,
    }

    #[async_trait]
    impl CommandReceiver for Collector {
        async fn handle(&self, cmd: Command) {
            let _ = self.tx.send(cmd);
        }

        fn terminate(&self, err: TransportError) {
            *self.terminated.lock() = Some(err);
        }
    }

    fn collector() -> (Arc<Collector>, mpsc::UnboundedReceiver<Command>, Arc<Mutex<Option<TransportError>>>)
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let terminated = Arc::new(Mutex::new(None));
        (Arc::new(Collector { tx, terminated: terminated.clone() }), rx, terminated)
    }

    #[tokio::test]
    async fn handshake_exchanges_capabilities() {
        let opts = ChannelOptions::default();
        let limited = ChannelOptions::default()
            .capability(Capability::CHUNKED_FRAMING | Capability::PIPE_THROTTLING);
        let (a, b) = StreamTransport::pair(&opts, &limited).await.unwrap();
        assert_eq!(a.remote_capability(), Capability::CHUNKED_FRAMING | Capability::PIPE_THROTTLING);
        assert_eq!(b.remote_capability(), Capability::current());
        assert_eq!(a.mode(), WireMode::Binary);
    }

    #[tokio::test]
    async fn commands_arrive_in_order() {
        let opts = ChannelOptions::default();
        let (a, b) = StreamTransport::pair(&opts, &opts).await.unwrap();
        let (recv, mut rx, _) = collector();
        b.setup(recv);

        for i in 0..10u32 {
            a.write(Command::from(CommandBody::Cancel { id: i }), false).await.unwrap();
        }
        for i in 0..10u32 {
            let cmd = rx.recv().await.unwrap();
            match cmd.body {
                CommandBody::Cancel { id } => assert_eq!(id, i),
                other => panic!("unexpected {}", other.kind()),
            }
        }
    }

    #[tokio::test]
    async fn large_command_crosses_many_chunks() {
        let opts = ChannelOptions::default().frame_size(512);
        let (a, b) = StreamTransport::pair(&opts, &opts).await.unwrap();
        let (recv, mut rx, _) = collector();
        b.setup(recv);

        let data = vec![0xA5u8; 100_000];
        a.write(
            Command::from(CommandBody::PipeChunk { oid: 1, io_id: 1, data: data.clone() }),
            false,
        )
        .await
        .unwrap();

        match rx.recv().await.unwrap().body {
            CommandBody::PipeChunk { data: got, .. } => assert_eq!(got, data),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn text_mode_round_trip() {
        let opts = ChannelOptions::default().mode(ModePreference::Text);
        let (a, b) = StreamTransport::pair(&opts, &opts).await.unwrap();
        assert_eq!(a.mode(), WireMode::Text);
        let (recv, mut rx, _) = collector();
        b.setup(recv);

        a.write(Command::from(CommandBody::Unexport { oid: 7 }), false).await.unwrap();
        match rx.recv().await.unwrap().body {
            CommandBody::Unexport { oid } => assert_eq!(oid, 7),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn pinned_modes_must_agree() {
        let binary = ChannelOptions::default().mode(ModePreference::Binary);
        let text = ChannelOptions::default().mode(ModePreference::Text);
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ra, rb) = tokio::join!(
            StreamTransport::connect(a, &binary),
            StreamTransport::connect(b, &text)
        );
        assert!(matches!(
            ra,
            Err(TransportError::Handshake(HandshakeError::ModeMismatch { .. }))
        ));
        assert!(matches!(
            rb,
            Err(TransportError::Handshake(HandshakeError::ModeMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn noise_before_preamble_is_discarded() {
        let opts = ChannelOptions::default();
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (mut their_read, mut their_write) = tokio::io::split(theirs);

        // The "peer" writes a shell banner, then a real handshake.
        their_write.write_all(b"bash: warning: locale junk\r\n").await.unwrap();
        their_write.write_all(PREAMBLE_CAPACITY).await.unwrap();
        their_write
            .write_all(&encode_capability_payload(Capability::current()).unwrap())
            .await
            .unwrap();
        their_write.write_all(PREAMBLE_BINARY).await.unwrap();
        their_write.flush().await.unwrap();

        let transport = StreamTransport::connect(ours, &opts).await.unwrap();
        assert_eq!(transport.header_noise(), b"bash: warning: locale junk\r\n");
        assert_eq!(transport.remote_capability(), Capability::current());

        // Drain our own preamble so the halves stay balanced.
        let mut sink = vec![0u8; 256];
        let _ = their_read.read(&mut sink).await.unwrap();
    }

    #[tokio::test]
    async fn eof_at_command_boundary_terminates_cleanly() {
        let opts = ChannelOptions::default();
        let (a, b) = StreamTransport::pair(&opts, &opts).await.unwrap();
        let (recv, _rx, terminated) = collector();
        b.setup(recv);

        a.write(Command::from(CommandBody::Close), true).await.unwrap();
        a.close_write();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let guard = terminated.lock();
        match guard.as_ref() {
            Some(TransportError::Closed) => {}
            other => panic!("expected clean close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_write_leaves_reads_running() {
        let opts = ChannelOptions::default();
        let (a, b) = StreamTransport::pair(&opts, &opts).await.unwrap();
        let (recv, mut rx, _) = collector();
        a.setup(recv);

        a.close_write();
        assert!(matches!(
            a.write(Command::from(CommandBody::Close), false).await,
            Err(TransportError::Closed)
        ));

        // The other side can still reach us.
        b.write(Command::from(CommandBody::Cancel { id: 3 }), false).await.unwrap();
        match rx.recv().await.unwrap().body {
            CommandBody::Cancel { id } => assert_eq!(id, 3),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn nonfatal_read_timeout_keeps_pumping() {
        let opts =
            ChannelOptions::default().read_timeout(Some(Duration::from_millis(10)), false);
        let (a, b) = StreamTransport::pair(&opts, &opts).await.unwrap();
        let (recv, mut rx, terminated) = collector();
        b.setup(recv);

        // Let several timeouts elapse before anything is sent.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(terminated.lock().is_none());

        a.write(Command::from(CommandBody::Cancel { id: 1 }), false).await.unwrap();
        match rx.recv().await.unwrap().body {
            CommandBody::Cancel { id } => assert_eq!(id, 1),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn keepalives_are_invisible_to_the_receiver() {
        let opts = ChannelOptions::default();
        let (a, b) = StreamTransport::pair(&opts, &opts).await.unwrap();
        let (recv, mut rx, terminated) = collector();
        b.setup(recv);

        a.keepalive().await.unwrap();
        a.keepalive().await.unwrap();
        a.write(Command::from(CommandBody::Cancel { id: 9 }), false).await.unwrap();
        a.keepalive().await.unwrap();

        // Only the real command comes out.
        match rx.recv().await.unwrap().body {
            CommandBody::Cancel { id } => assert_eq!(id, 9),
            other => panic!("unexpected {}", other.kind()),
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
        assert!(terminated.lock().is_none());
    }

    #[tokio::test]
    async fn fatal_read_timeout_terminates() {
        let quiet = ChannelOptions::default().read_timeout(Some(Duration::from_millis(10)), true);
        let opts = ChannelOptions::default();
        // Keep the peer alive so EOF is not what ends the pump.
        let (a, _peer) = StreamTransport::pair(&quiet, &opts).await.unwrap();
        let (recv, _rx, terminated) = collector();
        a.setup(recv);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(terminated.lock().as_ref(), Some(TransportError::ReadTimeout)));
    }
}
