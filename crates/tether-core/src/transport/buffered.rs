//! Push-style transport for event-driven embedders: the owner of the real
//! I/O feeds received byte slices in (any slicing), whole commands come out
//! to the receiver in order, and outgoing frames are surfaced through a
//! queue the embedder drains into its own sink.
//!
//! Commands can arrive before `setup`; they are queued and drained, still
//! in order, once the receiver is bound. The preamble handshake happens in
//! the embedder's hands before this transport is constructed, so the peer
//! capability is passed in.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::warn;

use crate::capability::Capability;
use crate::command::{decode_command, encode_command, Command};
use crate::error::TransportError;
use crate::frame::{frame_payload, FrameDecoder};
use crate::transport::{CommandReceiver, Transport};

pub struct BufferedTransport {
    inner: Arc<BufferedInner>,
}

struct RecvState {
    decoder: FrameDecoder,
    queued: VecDeque<Command>,
    receiver: Option<Arc<dyn CommandReceiver>>,
}

struct BufferedInner {
    state: AsyncMutex<RecvState>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    remote_capability: Capability,
    frame_size: usize,
    write_closed: AtomicBool,
    read_closed: AtomicBool,
}

impl BufferedTransport {
    /// Returns the transport and the queue of outgoing byte blocks the
    /// embedder must deliver to the peer, in order.
    pub fn new(
        remote_capability: Capability,
        frame_size: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            BufferedTransport {
                inner: Arc::new(BufferedInner {
                    state: AsyncMutex::new(RecvState {
                        decoder: FrameDecoder::new(),
                        queued: VecDeque::new(),
                        receiver: None,
                    }),
                    out_tx,
                    remote_capability,
                    frame_size,
                    write_closed: AtomicBool::new(false),
                    read_closed: AtomicBool::new(false),
                }),
            },
            out_rx,
        )
    }

    /// Feed received bytes. Whole commands are delivered to the receiver
    /// (or queued, before `setup`) as they complete. Any slicing is fine.
    pub async fn receive(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.inner.read_closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut state = self.inner.state.lock().await;
        let mut payloads = Vec::new();
        state.decoder.push(data, &mut payloads);
        let receiver = state.receiver.clone();
        for payload in payloads {
            let cmd = match decode_command(&payload) {
                Ok(cmd) => cmd,
                Err(e) => {
                    let err = TransportError::from(e);
                    match &receiver {
                        Some(receiver) => {
                            receiver.terminate(err);
                            return Ok(());
                        }
                        None => return Err(err),
                    }
                }
            };
            match &receiver {
                Some(receiver) => receiver.handle(cmd).await,
                None => state.queued.push_back(cmd),
            }
        }
        Ok(())
    }

    /// Tell the receiver the embedder's byte source died.
    pub async fn report_error(&self, err: TransportError) {
        let state = self.inner.state.lock().await;
        if let Some(receiver) = &state.receiver {
            receiver.terminate(err);
        }
    }
}

#[async_trait]
impl Transport for BufferedTransport {
    async fn write(&self, cmd: Command, _last: bool) -> Result<(), TransportError> {
        if self.inner.write_closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let payload = encode_command(&cmd)?;
        let framed = frame_payload(&payload, self.inner.frame_size);
        self.inner.out_tx.send(framed).map_err(|_| TransportError::Closed)
    }

    fn close_write(&self) {
        self.inner.write_closed.store(true, Ordering::Release);
    }

    fn close_read(&self) {
        self.inner.read_closed.store(true, Ordering::Release);
    }

    fn remote_capability(&self) -> Capability {
        self.inner.remote_capability
    }

    fn setup(&self, receiver: Arc<dyn CommandReceiver>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut state = inner.state.lock().await;
            if state.receiver.is_some() {
                warn!("buffered transport setup called twice; ignoring");
                return;
            }
            while let Some(cmd) = state.queued.pop_front() {
                receiver.handle(cmd).await;
            }
            state.receiver = Some(receiver);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBody;
    use parking_lot::Mutex;

    struct Collector {
        seen: Arc<Mutex<Vec<Command>>>,
        terminated: Arc<Mutex<Option<TransportError>>>,
    }

    #[async_trait]
    impl CommandReceiver for Collector {
        async fn handle(&self, cmd: Command) {
            self.seen.lock().push(cmd);
        }

        fn terminate(&self, err: TransportError) {
            *self.terminated.lock() = Some(err);
        }
    }

    fn collector() -> (Arc<Collector>, Arc<Mutex<Vec<Command>>>, Arc<Mutex<Option<TransportError>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let terminated = Arc::new(Mutex::new(None));
        (
            Arc::new(Collector { seen: seen.clone(), terminated: terminated.clone() }),
            seen,
            terminated,
        )
    }

    fn framed(cmd: CommandBody) -> Vec<u8> {
        frame_payload(&encode_command(&Command::from(cmd)).unwrap(), 8192)
    }

    #[tokio::test]
    async fn commands_flow_through_any_slicing() {
        let (t, _out) = BufferedTransport::new(Capability::current(), 8192);
        let (recv, seen, _) = collector();
        t.setup(recv);
        tokio::task::yield_now().await;

        let mut bytes = framed(CommandBody::Cancel { id: 1 });
        bytes.extend(framed(CommandBody::Cancel { id: 2 }));

        // One byte at a time.
        for b in &bytes {
            t.receive(std::slice::from_ref(b)).await.unwrap();
        }
        let ids: Vec<u32> = seen
            .lock()
            .iter()
            .map(|c| match c.body {
                CommandBody::Cancel { id } => id,
                _ => panic!("unexpected command"),
            })
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn commands_before_setup_are_queued_in_order() {
        let (t, _out) = BufferedTransport::new(Capability::current(), 8192);
        t.receive(&framed(CommandBody::Cancel { id: 1 })).await.unwrap();
        t.receive(&framed(CommandBody::Cancel { id: 2 })).await.unwrap();

        let (recv, seen, _) = collector();
        t.setup(recv);
        tokio::task::yield_now().await;

        // A command arriving right after setup lands behind the backlog.
        t.receive(&framed(CommandBody::Cancel { id: 3 })).await.unwrap();

        let ids: Vec<u32> = seen
            .lock()
            .iter()
            .map(|c| match c.body {
                CommandBody::Cancel { id } => id,
                _ => panic!("unexpected command"),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn written_commands_surface_as_decodable_frames() {
        let (t, mut out) = BufferedTransport::new(Capability::current(), 64);
        t.write(Command::from(CommandBody::Unexport { oid: 9 }), false).await.unwrap();

        let block = out.recv().await.unwrap();
        let mut decoder = FrameDecoder::new();
        let mut payloads = Vec::new();
        decoder.push(&block, &mut payloads);
        assert_eq!(payloads.len(), 1);
        match decode_command(&payloads[0]).unwrap().body {
            CommandBody::Unexport { oid } => assert_eq!(oid, 9),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn corrupt_command_reports_to_receiver() {
        let (t, _out) = BufferedTransport::new(Capability::current(), 8192);
        let (recv, _seen, terminated) = collector();
        t.setup(recv);
        tokio::task::yield_now().await;

        // A well-framed chunk whose payload is not a command.
        let garbage = frame_payload(&[0xFF; 16], 8192);
        t.receive(&garbage).await.unwrap();
        assert!(matches!(terminated.lock().as_ref(), Some(TransportError::Decode(_))));
    }

    #[tokio::test]
    async fn corrupt_command_before_setup_errors_to_embedder() {
        let (t, _out) = BufferedTransport::new(Capability::current(), 8192);
        let garbage = frame_payload(&[0xFF; 16], 8192);
        assert!(t.receive(&garbage).await.is_err());
    }

    #[tokio::test]
    async fn embedder_reported_errors_reach_the_receiver() {
        let (t, _out) = BufferedTransport::new(Capability::current(), 8192);
        let (recv, _seen, terminated) = collector();
        t.setup(recv);
        tokio::task::yield_now().await;

        t.report_error(TransportError::Closed).await;
        assert!(matches!(terminated.lock().as_ref(), Some(TransportError::Closed)));
    }

    #[tokio::test]
    async fn close_write_refuses_further_commands() {
        let (t, _out) = BufferedTransport::new(Capability::current(), 8192);
        t.close_write();
        assert!(matches!(
            t.write(Command::from(CommandBody::Close), true).await,
            Err(TransportError::Closed)
        ));
    }
}
