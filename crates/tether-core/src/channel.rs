//! The channel: one peer-to-peer session bound to one transport.
//!
//! The channel owns the export table, the pending- and executing-call maps,
//! the pipe windows, the I/O lane, and the lifecycle state machine
//! (`Opening → Open → Closing → Closed`, one-way). It is also the command
//! dispatcher: the transport pumps decoded commands into
//! [`CommandReceiver::handle`] in strict receive order, and each command is
//! routed from there.
//!
//! A broken transport terminates the channel; there is no reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

use crate::call::{CallHandle, PendingCalls};
use crate::capability::Capability;
use crate::command::{Command, CommandBody, RequestCmd, ResponseCmd, WireArg};
use crate::domain::{ArtifactResolver, DomainExport, DomainRegistry, DOMAIN_INTERFACE};
use crate::error::{well_known, CallError, ChannelError, RemoteError, TransportError};
use crate::export::ExportTable;
use crate::lane::{IoIdGen, PipeLane};
use crate::marshal::{
    Marshaller, MarshalError, Oid, OpenedPayload, SourceDomain, Unmarshaller, WirePayload,
};
use crate::object::{
    CallArg, CallArgs, DispatchTable, InvokeContext, Proxy, RemoteObject, ReturnValue,
};
use crate::options::{CallContext, ChannelOptions, PingOptions};
use crate::pipe::{PipeBuffer, PipeSender, PipeWindow, RemoteInput, SinkExport, SINK_INTERFACE};
use crate::pipe::SOURCE_INTERFACE;
use crate::transport::{CommandReceiver, StreamTransport, Transport};

/// Every channel exports its builtin control object here.
pub const CONTROL_OID: Oid = 1;
/// The user root object, when one is registered.
pub const ROOT_OID: Oid = 2;

pub const CONTROL_INTERFACE: &str = "tether.Control";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifeState {
    Open,
    Closing,
    Closed,
}

struct SendGate {
    /// Once a `Close` has been queued, no further outgoing commands are
    /// accepted.
    closed: bool,
}

type PingFailureHandler = Arc<dyn Fn(Channel, CallError) + Send + Sync>;

pub(crate) struct ChannelCore {
    name: String,
    options: ChannelOptions,
    transport: Arc<dyn Transport>,
    remote_capability: Capability,
    weak_self: Weak<ChannelCore>,
    state: Mutex<LifeState>,
    send_gate: AsyncMutex<SendGate>,
    exports: ExportTable,
    pending: PendingCalls,
    executing: Mutex<HashMap<u32, tokio::task::AbortHandle>>,
    windows: Mutex<HashMap<Oid, Arc<PipeWindow>>>,
    io_gen: IoIdGen,
    lane: PipeLane,
    domains: DomainRegistry,
    marshaller: Mutex<Marshaller>,
    unmarshaller: Mutex<Unmarshaller>,
    properties: Mutex<HashMap<String, String>>,
    close_cause: Mutex<Option<Arc<ChannelError>>>,
    closed_notify: Notify,
    cleanup_tx: mpsc::UnboundedSender<Oid>,
    aux_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    calls_started: AtomicU64,
}

impl ChannelCore {
    // ---- send path -----------------------------------------------------

    /// Queue one command. Fails once a close has been queued.
    pub(crate) async fn send_cmd(&self, body: CommandBody) -> Result<(), ChannelError> {
        let gate = self.send_gate.lock().await;
        if gate.closed {
            return Err(ChannelError::Closing);
        }
        self.write_with_gate(&gate, body, false).await
    }

    /// Queue one pipe command stamped with a fresh I/O id, atomically with
    /// the write so ids hit the wire in order.
    async fn send_io(
        &self,
        make: impl FnOnce(u64) -> CommandBody,
    ) -> Result<u64, ChannelError> {
        let gate = self.send_gate.lock().await;
        if gate.closed {
            return Err(ChannelError::Closing);
        }
        let io_id = self.io_gen.fresh();
        self.write_with_gate(&gate, make(io_id), false).await?;
        Ok(io_id)
    }

    async fn write_with_gate(
        &self,
        _gate: &SendGate,
        body: CommandBody,
        last: bool,
    ) -> Result<(), ChannelError> {
        let cmd = Command::new(body, self.options.chain_cause);
        match self.transport.write(cmd, last).await {
            Ok(()) => {
                if !last {
                    // Keep the per-stream domain table in lockstep with the
                    // peer's decoder, which resets per command as well.
                    self.marshaller.lock().reset();
                }
                Ok(())
            }
            Err(e) => {
                // A failed write means the transport is gone.
                let cause = Arc::new(ChannelError::Transport(e));
                self.begin_terminate(cause.clone());
                Err(ChannelError::Closed { cause: Some(cause) })
            }
        }
    }

    pub(crate) async fn send_pipe_chunk(&self, oid: Oid, data: &[u8]) -> Result<u64, ChannelError> {
        self.send_io(|io_id| CommandBody::PipeChunk { oid, io_id, data: data.to_vec() }).await
    }

    pub(crate) async fn send_pipe_flush(&self, oid: Oid) -> Result<(), ChannelError> {
        self.send_io(|io_id| CommandBody::PipeFlush { oid, io_id }).await.map(|_| ())
    }

    pub(crate) async fn send_pipe_eof(&self, oid: Oid) -> Result<(), ChannelError> {
        self.send_io(|io_id| CommandBody::PipeEof { oid, io_id }).await.map(|_| ())
    }

    pub(crate) async fn send_pipe_dead(&self, oid: Oid, cause: RemoteError) -> Result<(), ChannelError> {
        self.send_cmd(CommandBody::PipeDead { oid, cause }).await
    }

    // ---- calls ---------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn start_call(
        self: &Arc<Self>,
        oid: Oid,
        method: String,
        arg_types: Vec<String>,
        args: Vec<WireArg>,
        user_call: bool,
        release_on_return: Vec<Oid>,
        declared: Vec<String>,
    ) -> Result<CallHandle, CallError> {
        if *self.state.lock() != LifeState::Open {
            return Err(CallError::ChannelClosed(self.close_cause.lock().clone()));
        }
        // Registration, the last_io_id snapshot and the write happen under
        // the send gate so a response can never overtake its registration.
        let gate = self.send_gate.lock().await;
        if gate.closed {
            return Err(CallError::ChannelClosed(self.close_cause.lock().clone()));
        }
        let pending = self.pending.register(release_on_return);
        let req = RequestCmd {
            id: pending.id,
            last_io_id: self.io_gen.last(),
            oid,
            method,
            arg_types,
            args,
            user_call,
        };
        self.calls_started.fetch_add(1, Ordering::Relaxed);
        match self.write_with_gate(&gate, CommandBody::Request(req), false).await {
            Ok(()) => Ok(CallHandle {
                id: pending.id,
                pending,
                channel: Arc::downgrade(self),
                declared,
            }),
            Err(e) => {
                self.pending.remove(pending.id);
                self.exports.release_all(&pending.release_on_return, "call never sent");
                Err(CallError::ChannelClosed(Some(Arc::new(e))))
            }
        }
    }

    /// Wait for the local pipe lane to pass the peer-stamped id.
    pub(crate) async fn await_io(&self, io_id: u64) -> Result<(), CallError> {
        self.lane
            .await_done(io_id)
            .await
            .map_err(|_| CallError::ChannelClosed(self.close_cause.lock().clone()))
    }

    /// Validate and open one received payload envelope. A name-filter
    /// rejection is serialization-fatal: the channel goes down.
    pub(crate) fn open_payload(&self, payload: &WirePayload) -> Result<OpenedPayload, MarshalError> {
        let result = self.unmarshaller.lock().open(payload);
        if let Err(MarshalError::Rejected { type_name }) = &result {
            let cause = Arc::new(ChannelError::Protocol(format!(
                "type '{}' rejected by the name filter",
                type_name
            )));
            self.begin_terminate(cause);
        }
        result
    }

    /// Marshal a value under a non-system source domain, using this
    /// channel's per-stream back-reference table.
    pub(crate) fn marshal_in_domain<T: Serialize>(
        &self,
        domain: SourceDomain,
        type_name: &str,
        value: &T,
    ) -> Result<WirePayload, MarshalError> {
        self.marshaller.lock().encode(domain, type_name, value)
    }

    // ---- exports, pipes, domains ---------------------------------------

    pub(crate) fn export_object(
        &self,
        obj: &Arc<dyn RemoteObject>,
        interfaces: &[String],
        recorder: Option<&mut crate::export::ExportRecorder>,
    ) -> Oid {
        self.exports.export(obj, interfaces, recorder)
    }

    pub(crate) fn unexport_local(&self, oid: Oid, reason: &str) {
        self.exports.unexport(oid, reason);
    }

    pub(crate) fn release_exports(&self, oids: &[Oid], reason: &str) {
        self.exports.release_all(oids, reason);
    }

    /// Queue an `Unexport` toward the peer. Never blocks; used from proxy
    /// drops. Cleanup is voided when the channel closes.
    pub(crate) fn schedule_unexport(&self, oid: Oid) {
        let _ = self.cleanup_tx.send(oid);
    }

    /// The writer-side window for the pipe whose sink is `oid`.
    pub(crate) fn pipe_sender(self: &Arc<Self>, oid: Oid) -> PipeSender {
        let window = self
            .windows
            .lock()
            .entry(oid)
            .or_insert_with(|| Arc::new(PipeWindow::new(self.options.pipe_window)))
            .clone();
        PipeSender::new(Arc::downgrade(self), oid, window, self.throttled())
    }

    pub(crate) fn remove_window(&self, oid: Oid) {
        self.windows.lock().remove(&oid);
    }

    fn window(&self, oid: Oid) -> Option<Arc<PipeWindow>> {
        self.windows.lock().get(&oid).cloned()
    }

    pub(crate) fn throttled(&self) -> bool {
        self.options.capability.contains(Capability::PIPE_THROTTLING)
            && self.remote_capability.contains(Capability::PIPE_THROTTLING)
    }

    pub(crate) fn greedy_pipes(&self) -> bool {
        self.options.greedy_pipes
            && self.options.capability.contains(Capability::GREEDY_PIPES)
            && self.remote_capability.contains(Capability::GREEDY_PIPES)
    }

    fn control_proxy(&self) -> Proxy {
        Proxy::new(
            self.weak_self.clone(),
            CONTROL_OID,
            vec![CONTROL_INTERFACE.to_string()],
            false,
            false,
        )
    }

    // ---- dispatch ------------------------------------------------------

    /// Turn wire arguments into live values, proxies and streams.
    fn materialize_args(
        self: &Arc<Self>,
        req: &RequestCmd,
    ) -> Result<CallArgs, RemoteError> {
        let mut out = Vec::with_capacity(req.args.len());
        for arg in &req.args {
            match arg {
                WireArg::Value(payload) => {
                    let opened = self.open_payload(payload).map_err(|e| {
                        RemoteError::new(well_known::MARSHAL, e.to_string())
                    })?;
                    if let SourceDomain::Exported(domain_oid) = opened.domain {
                        // First sighting of a peer domain: remember how to
                        // reach it for artifact fetches.
                        self.domains.record(domain_oid, || {
                            Proxy::new(
                                self.weak_self.clone(),
                                domain_oid,
                                vec![DOMAIN_INTERFACE.to_string()],
                                false,
                                false,
                            )
                        });
                    }
                    out.push(CallArg::Value(opened));
                }
                WireArg::Object { oid, interfaces } => {
                    out.push(CallArg::Object(Proxy::new(
                        self.weak_self.clone(),
                        *oid,
                        interfaces.clone(),
                        true,
                        true,
                    )));
                }
                WireArg::InputPipe { source_oid, greedy } => {
                    let source_proxy = Proxy::new(
                        self.weak_self.clone(),
                        *source_oid,
                        vec![SOURCE_INTERFACE.to_string()],
                        false,
                        false,
                    );
                    if *greedy && self.greedy_pipes() {
                        let buffer = Arc::new(PipeBuffer::new());
                        let sink: Arc<dyn RemoteObject> =
                            Arc::new(SinkExport::new(buffer.clone()));
                        let sink_oid = self.exports.export(
                            &sink,
                            &[SINK_INTERFACE.to_string()],
                            None,
                        );
                        // Ask the source side to start draining into our
                        // sink; round trips stop here.
                        let pump = source_proxy.invoke("pump_to").internal().arg(&sink_oid);
                        tokio::spawn(async move {
                            if let Err(e) = pump.call_unit().await {
                                debug!(error = %e, "greedy pump start failed");
                            }
                        });
                        out.push(CallArg::Input(RemoteInput::greedy(
                            buffer,
                            sink_oid,
                            self.weak_self.clone(),
                        )));
                    } else {
                        out.push(CallArg::Input(RemoteInput::pull(source_proxy)));
                    }
                }
                WireArg::OutputPipe { sink_oid } => {
                    out.push(CallArg::Output(self.pipe_sender(*sink_oid)));
                }
                WireArg::Null => out.push(CallArg::Null),
            }
        }
        Ok(CallArgs::new(out))
    }

    async fn handle_request(self: Arc<Self>, req: RequestCmd) {
        if *self.state.lock() != LifeState::Open {
            let resp = ResponseCmd {
                id: req.id,
                last_io_id: 0,
                result: Err(RemoteError::channel_closed()),
            };
            let _ = self.send_cmd(CommandBody::Response(resp)).await;
            return;
        }

        let id = req.id;
        let args = match self.materialize_args(&req) {
            Ok(args) => args,
            Err(e) => {
                // Serialization trouble: answer, then treat it as fatal.
                let resp = ResponseCmd { id, last_io_id: 0, result: Err(e.clone()) };
                let _ = self.send_cmd(CommandBody::Response(resp)).await;
                self.begin_terminate(Arc::new(ChannelError::Protocol(format!(
                    "undecodable request {}: {}",
                    id, e
                ))));
                return;
            }
        };

        let start_io = self.io_gen.last();
        let core = self.clone();
        let barrier = req.last_io_id;
        let oid = req.oid;
        let method = req.method;
        let user_call = req.user_call;

        let work = tokio::spawn(async move {
            // I/O the caller issued before this request must be applied
            // before user code runs.
            if core.lane.await_done(barrier).await.is_err() {
                return Err(RemoteError::channel_closed());
            }
            let target = core.exports.get(oid)?;
            let interfaces = target.interfaces();
            core.options.role_checker.check(&CallContext {
                oid,
                method: &method,
                interfaces: &interfaces,
                user_call,
            })?;
            let cx = InvokeContext { core: core.clone() };
            target.invoke(cx, &method, args).await
        });
        self.executing.lock().insert(id, work.abort_handle());

        let core = self.clone();
        tokio::spawn(async move {
            let result = match work.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_cancelled() => Err(RemoteError::cancelled()),
                Err(join_err) => {
                    Err(RemoteError::new("tether.Panic", join_err.to_string()))
                }
            };
            core.executing.lock().remove(&id);
            let end_io = core.io_gen.last();
            let resp = ResponseCmd {
                id,
                last_io_id: if end_io == start_io { 0 } else { end_io },
                result: result.map(|rv| rv.payload),
            };
            if let Err(e) = core.send_cmd(CommandBody::Response(resp)).await {
                debug!(id, error = %e, "response could not be sent");
            }
        });
    }

    fn handle_pipe_chunk(self: &Arc<Self>, oid: Oid, io_id: u64, data: Vec<u8>) {
        let core = self.clone();
        let submitted = self.lane.submit(io_id, async move {
            let sink = match core.exports.get(oid).map(|obj| obj.as_pipe_sink()) {
                Ok(Some(sink)) => sink,
                Ok(None) => {
                    let cause = RemoteError::new(
                        well_known::PIPE_DEAD,
                        format!("object {} is not a pipe sink", oid),
                    );
                    let _ = core.send_pipe_dead(oid, cause).await;
                    return;
                }
                Err(e) => {
                    let _ = core.send_pipe_dead(oid, e).await;
                    return;
                }
            };
            let len = data.len();
            match sink.write(&data).await {
                Ok(()) => {
                    if core.throttled() {
                        let _ = core
                            .send_cmd(CommandBody::PipeAck { oid, len: len as u32 })
                            .await;
                    }
                }
                Err(e) => {
                    let cause = RemoteError::from_display("std.io.Error", &e);
                    let _ = core.send_pipe_dead(oid, cause).await;
                }
            }
        });
        if submitted.is_err() {
            debug!(oid, io_id, "pipe chunk after lane shutdown");
        }
    }

    fn handle_pipe_flush(self: &Arc<Self>, oid: Oid, io_id: u64) {
        let core = self.clone();
        let _ = self.lane.submit(io_id, async move {
            if let Ok(Some(sink)) = core.exports.get(oid).map(|obj| obj.as_pipe_sink()) {
                if let Err(e) = sink.flush().await {
                    let _ = core
                        .send_pipe_dead(oid, RemoteError::from_display("std.io.Error", &e))
                        .await;
                }
            }
        });
    }

    fn handle_pipe_eof(self: &Arc<Self>, oid: Oid, io_id: u64) {
        let core = self.clone();
        let _ = self.lane.submit(io_id, async move {
            // A second EOF finds the oid already gone and does nothing.
            match core.exports.get(oid).map(|obj| obj.as_pipe_sink()) {
                Ok(Some(sink)) => {
                    if let Err(e) = sink.close().await {
                        debug!(oid, error = %e, "pipe sink close failed");
                    }
                    core.exports.unexport(oid, "pipe eof");
                }
                _ => debug!(oid, "eof for a pipe that is already gone"),
            }
        });
    }

    async fn handle_close_command(self: &Arc<Self>) {
        debug!(channel = %self.name, "peer requested close");
        let core = self.clone();
        // Run the teardown off the pump task: closing the read side aborts
        // the pump, which must not abort the teardown itself.
        tokio::spawn(async move {
            core.do_close(None, true).await;
        });
    }

    // ---- lifecycle -----------------------------------------------------

    fn begin_terminate(&self, cause: Arc<ChannelError>) {
        let Some(core) = self.weak_self.upgrade() else { return };
        let Ok(rt) = tokio::runtime::Handle::try_current() else { return };
        rt.spawn(async move {
            core.do_close(Some(cause), false).await;
        });
    }

    /// Idempotent teardown. `cause` present means abnormal termination;
    /// `notify_peer` queues a final `Close` command first.
    async fn do_close(&self, cause: Option<Arc<ChannelError>>, notify_peer: bool) {
        {
            let mut state = self.state.lock();
            if *state != LifeState::Open {
                return;
            }
            *state = LifeState::Closing;
        }
        if let Some(cause) = &cause {
            warn!(channel = %self.name, cause = %cause, "channel terminating");
        } else {
            debug!(channel = %self.name, "channel closing");
        }
        *self.close_cause.lock() = cause.clone();

        // Close the send half: one final Close command, then nothing.
        {
            let mut gate = self.send_gate.lock().await;
            if !gate.closed {
                if notify_peer {
                    let _ = self.write_with_gate(&gate, CommandBody::Close, true).await;
                }
                gate.closed = true;
            }
        }

        // In-flight invocations observe an interrupt.
        for (_, abort) in self.executing.lock().drain() {
            abort.abort();
        }

        // Pipe work: drain on an orderly close, drop on termination.
        if cause.is_some() {
            self.lane.abort();
        } else {
            self.lane.shutdown();
        }

        // Waiting callers observe the closure (recoverable error).
        self.pending.abort_all(cause.clone());

        // Blocked pipe writers observe the closure.
        for (_, window) in self.windows.lock().drain() {
            window.kill(RemoteError::channel_closed());
        }

        // Exports: propagate to sinks, then clear. Pending proxy cleanups
        // are voided with the aux tasks below.
        self.exports.abort(&RemoteError::channel_closed());
        self.domains.clear();

        self.transport.close_write();
        self.transport.close_read();

        for task in self.aux_tasks.lock().drain(..) {
            task.abort();
        }

        *self.state.lock() = LifeState::Closed;
        self.closed_notify.notify_waiters();
    }
}

#[async_trait]
impl CommandReceiver for ChannelCore {
    async fn handle(&self, cmd: Command) {
        let Some(core) = self.weak_self.upgrade() else { return };
        let is_close = matches!(cmd.body, CommandBody::Close);
        match cmd.body {
            CommandBody::Request(req) => core.handle_request(req).await,
            CommandBody::Response(resp) => {
                if let Some(call) = self.pending.take(resp.id) {
                    // Stream arguments of that call are done with their
                    // wire lifetime. Release before waking the caller so
                    // the table is settled when the call returns.
                    self.exports.release_all(&call.release_on_return, "call returned");
                    call.respond(resp);
                }
            }
            CommandBody::Cancel { id } => {
                if let Some(abort) = self.executing.lock().get(&id) {
                    abort.abort();
                } else {
                    debug!(id, "cancel for a request that already completed");
                }
            }
            CommandBody::PipeChunk { oid, io_id, data } => {
                core.handle_pipe_chunk(oid, io_id, data)
            }
            CommandBody::PipeFlush { oid, io_id } => core.handle_pipe_flush(oid, io_id),
            CommandBody::PipeAck { oid, len } => match self.window(oid) {
                Some(window) => window.grant(len as usize),
                None => debug!(oid, "ack for an unknown pipe window"),
            },
            CommandBody::PipeDead { oid, cause } => match self.window(oid) {
                Some(window) => window.kill(cause),
                None => debug!(oid, "death notice for an unknown pipe window"),
            },
            CommandBody::PipeEof { oid, io_id } => core.handle_pipe_eof(oid, io_id),
            CommandBody::Unexport { oid } => {
                // Behind the lane so it cannot overtake earlier pipe writes
                // that still reference the oid.
                let core = core.clone();
                let _ = self.lane.submit(0, async move {
                    core.exports.unexport(oid, "remote unexport");
                });
            }
            CommandBody::Close => core.handle_close_command().await,
        }
        if !is_close {
            // Mirror of the sender-side per-command marshaller reset.
            self.unmarshaller.lock().reset();
        }
    }

    fn terminate(&self, err: TransportError) {
        match (&err, *self.state.lock()) {
            // A clean EOF after we are already down is the normal end.
            (TransportError::Closed, LifeState::Closing | LifeState::Closed) => {}
            _ => self.begin_terminate(Arc::new(err.into())),
        }
    }
}

/// Builds a [`Channel`] over a transport.
pub struct ChannelBuilder {
    name: String,
    options: ChannelOptions,
    root: Option<Arc<dyn RemoteObject>>,
    on_ping_failure: Option<PingFailureHandler>,
}

impl ChannelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ChannelBuilder {
            name: name.into(),
            options: ChannelOptions::default(),
            root: None,
            on_ping_failure: None,
        }
    }

    pub fn options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }

    /// The object the peer reaches through `Channel::root`.
    pub fn root(mut self, root: impl RemoteObject + 'static) -> Self {
        self.root = Some(Arc::new(root));
        self
    }

    pub fn root_arc(mut self, root: Arc<dyn RemoteObject>) -> Self {
        self.root = Some(root);
        self
    }

    /// Invoked when the ping task declares the channel dead, just before
    /// it is closed.
    pub fn on_ping_failure(
        mut self,
        handler: impl Fn(Channel, CallError) + Send + Sync + 'static,
    ) -> Self {
        self.on_ping_failure = Some(Arc::new(handler));
        self
    }

    /// Handshake over a duplex byte stream and start the channel.
    pub async fn connect<S>(self, stream: S) -> Result<Channel, ChannelError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let transport = StreamTransport::connect(stream, &self.options).await?;
        Ok(self.over(Arc::new(transport)))
    }

    /// Start the channel over an already-negotiated transport.
    pub fn over(self, transport: Arc<dyn Transport>) -> Channel {
        let remote_capability = transport.remote_capability();
        let multi_domain = self.options.capability.contains(Capability::MULTI_DOMAIN)
            && remote_capability.contains(Capability::MULTI_DOMAIN);
        let (cleanup_tx, mut cleanup_rx) = mpsc::unbounded_channel::<Oid>();

        let core = Arc::new_cyclic(|weak_self| ChannelCore {
            name: self.name,
            exports: ExportTable::new(
                CONTROL_OID,
                self.options.record_unexport_origin_trace,
                self.options.unexport_log_size,
            ),
            marshaller: Mutex::new(Marshaller::new(multi_domain)),
            unmarshaller: Mutex::new(Unmarshaller::new(self.options.name_filter.clone())),
            options: self.options,
            transport,
            remote_capability,
            weak_self: weak_self.clone(),
            state: Mutex::new(LifeState::Open),
            send_gate: AsyncMutex::new(SendGate { closed: false }),
            pending: PendingCalls::new(),
            executing: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
            io_gen: IoIdGen::new(),
            lane: PipeLane::start(),
            domains: DomainRegistry::new(),
            properties: Mutex::new(HashMap::new()),
            close_cause: Mutex::new(None),
            closed_notify: Notify::new(),
            cleanup_tx,
            aux_tasks: Mutex::new(Vec::new()),
            calls_started: AtomicU64::new(0),
        });

        // Builtin exports: the control object, then the root. Both pinned,
        // so stray unexports can never reclaim them.
        let control: Arc<dyn RemoteObject> =
            Arc::new(ControlObject { core: Arc::downgrade(&core) });
        let control_oid =
            core.exports.export(&control, &[CONTROL_INTERFACE.to_string()], None);
        debug_assert_eq!(control_oid, CONTROL_OID);
        core.exports.pin(control_oid);

        let root = self
            .root
            .unwrap_or_else(|| Arc::new(DispatchTable::new("tether.NoRoot")) as Arc<dyn RemoteObject>);
        let interfaces = root.interfaces();
        let root_oid = core.exports.export(&root, &interfaces, None);
        debug_assert_eq!(root_oid, ROOT_OID);
        core.exports.pin(root_oid);

        // Drains Unexport requests queued by dropped proxies. Voided (with
        // the other aux tasks) when the channel closes.
        let cleanup_core = Arc::downgrade(&core);
        let cleanup = tokio::spawn(async move {
            while let Some(oid) = cleanup_rx.recv().await {
                let Some(core) = cleanup_core.upgrade() else { return };
                if core.send_cmd(CommandBody::Unexport { oid }).await.is_err() {
                    return;
                }
            }
        });
        core.aux_tasks.lock().push(cleanup);

        if let Some(ping) = core.options.ping.clone() {
            let ping_core = Arc::downgrade(&core);
            let handler = self.on_ping_failure.clone();
            let task = tokio::spawn(ping_loop(ping_core, ping, handler));
            core.aux_tasks.lock().push(task);
        }

        core.transport.clone().setup(core.clone());
        Channel { core }
    }
}

/// Periodic no-op RPC against the peer's control object. Consecutive
/// timeouts beyond the limit invoke the failure handler and close the
/// channel. Internal calls, so the peer's role checker is bypassed.
async fn ping_loop(
    weak: Weak<ChannelCore>,
    ping: PingOptions,
    handler: Option<PingFailureHandler>,
) {
    let mut failures = 0u32;
    let mut ticker = tokio::time::interval(ping.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick
    loop {
        ticker.tick().await;
        let Some(core) = weak.upgrade() else { return };
        if *core.state.lock() != LifeState::Open {
            return;
        }
        let probe = core.control_proxy().invoke("ping").internal().call_unit();
        match tokio::time::timeout(ping.timeout, probe).await {
            Ok(Ok(())) => failures = 0,
            Ok(Err(CallError::ChannelClosed(_))) => return,
            Ok(Err(e)) => {
                warn!(error = %e, "ping failed");
                failures += 1;
            }
            Err(_) => {
                warn!(timeout = ?ping.timeout, "ping timed out");
                failures += 1;
            }
        }
        if failures >= ping.max_timeouts {
            let err = CallError::System(RemoteError::new(
                "tether.PingTimeout",
                format!("{} consecutive ping failures", failures),
            ));
            if let Some(handler) = &handler {
                handler(Channel { core: core.clone() }, err);
            }
            core.do_close(
                Some(Arc::new(ChannelError::Protocol("ping timeout".into()))),
                true,
            )
            .await;
            return;
        }
    }
}

/// The builtin object every channel exports at oid 1: liveness probes and
/// channel properties.
struct ControlObject {
    core: Weak<ChannelCore>,
}

#[async_trait]
impl RemoteObject for ControlObject {
    fn interfaces(&self) -> Vec<String> {
        vec![CONTROL_INTERFACE.to_string()]
    }

    async fn invoke(
        &self,
        _cx: InvokeContext,
        method: &str,
        args: CallArgs,
    ) -> Result<ReturnValue, RemoteError> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(RemoteError::channel_closed)?;
        match method {
            "ping" => ReturnValue::unit(),
            "get_property" => {
                let name: String = args.value(0)?;
                let value = core.properties.lock().get(&name).cloned();
                ReturnValue::of(&value)
            }
            "set_property" => {
                let name: String = args.value(0)?;
                let value: Option<String> = args.value(1)?;
                let mut properties = core.properties.lock();
                match value {
                    Some(value) => {
                        properties.insert(name, value);
                    }
                    None => {
                        properties.remove(&name);
                    }
                }
                ReturnValue::unit()
            }
            other => Err(RemoteError::new(
                well_known::UNKNOWN_METHOD,
                format!("control object has no method '{}'", other),
            )),
        }
    }
}

/// A live session with a peer. Cheap to clone; the session closes when
/// `close` is called, the peer closes, or the transport dies — never
/// because handles were dropped.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl Channel {
    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Self {
        Channel { core }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn remote_capability(&self) -> Capability {
        self.core.remote_capability
    }

    pub fn is_open(&self) -> bool {
        *self.core.state.lock() == LifeState::Open
    }

    /// Proxy for the object the peer registered as its root.
    pub fn root(&self) -> Result<Proxy, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed { cause: self.core.close_cause.lock().clone() });
        }
        Ok(Proxy::new(Arc::downgrade(&self.core), ROOT_OID, Vec::new(), true, true))
    }

    /// Proxy for the peer's builtin control object.
    pub fn control(&self) -> Proxy {
        self.core.control_proxy()
    }

    /// Publish an object so it can be passed to the peer by reference
    /// (field semantics: released only by the peer dropping its proxy or
    /// an explicit unexport).
    pub fn export(&self, obj: Arc<dyn RemoteObject>) -> Oid {
        let interfaces = obj.interfaces();
        self.core.exports.export(&obj, &interfaces, None)
    }

    /// Publish a source domain backed by an artifact resolver; payloads can
    /// then be marshalled under `SourceDomain::Exported(oid)`.
    pub fn export_domain(&self, resolver: Arc<dyn ArtifactResolver>) -> Oid {
        let table = DomainExport::table(resolver);
        self.core.exports.export(&table, &[DOMAIN_INTERFACE.to_string()], None)
    }

    /// Marshal a value under a non-system domain for use with
    /// `CallBuilder::arg_payload`.
    pub fn marshal_in_domain<T: Serialize>(
        &self,
        domain: SourceDomain,
        type_name: &str,
        value: &T,
    ) -> Result<WirePayload, MarshalError> {
        self.core.marshal_in_domain(domain, type_name, value)
    }

    /// A peer domain seen on this channel, for explicit artifact fetches.
    pub fn imported_domain(&self, oid: Oid) -> Option<crate::domain::ImportedDomain> {
        self.core.domains.lookup(oid)
    }

    pub fn set_property(&self, name: impl Into<String>, value: impl Into<String>) {
        self.core.properties.lock().insert(name.into(), value.into());
    }

    pub fn property(&self, name: &str) -> Option<String> {
        self.core.properties.lock().get(name).cloned()
    }

    /// Read a property from the peer's table.
    pub async fn remote_property(&self, name: &str) -> Result<Option<String>, CallError> {
        self.control()
            .invoke("get_property")
            .internal()
            .arg(&name.to_string())
            .call()
            .await
    }

    /// One manual liveness probe.
    pub async fn ping(&self) -> Result<(), CallError> {
        self.control().invoke("ping").internal().call_unit().await
    }

    /// Orderly shutdown: queue a final `Close`, abort in-flight work,
    /// release exports. Idempotent.
    pub async fn close(&self) {
        self.core.do_close(None, true).await;
    }

    /// Wait until the channel is fully closed.
    pub async fn join(&self) {
        loop {
            let notified = self.core.closed_notify.notified();
            if *self.core.state.lock() == LifeState::Closed {
                return;
            }
            notified.await;
        }
    }

    /// Why the channel went down, if it terminated abnormally.
    pub fn close_cause(&self) -> Option<Arc<ChannelError>> {
        self.core.close_cause.lock().clone()
    }

    /// Number of live entries in the export table (diagnostics).
    pub fn exported_count(&self) -> usize {
        self.core.exports.len()
    }

    /// Number of calls this side has started (diagnostics).
    pub fn calls_started(&self) -> u64 {
        self.core.calls_started.load(Ordering::Relaxed)
    }

    /// Number of calls awaiting responses (diagnostics).
    pub fn pending_calls(&self) -> usize {
        self.core.pending.len()
    }

    /// Human-readable diagnostic summary: lifecycle state, table sizes,
    /// the I/O watermark and the tail of the unexport ring. Meant for
    /// support bundles, not for parsing.
    pub fn diagnostics(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "channel '{}'", self.core.name);
        let _ = writeln!(out, "  state: {:?}", *self.core.state.lock());
        let _ = writeln!(out, "  remote capability: {:?}", self.core.remote_capability);
        let _ = writeln!(
            out,
            "  calls: {} started, {} pending, {} executing",
            self.calls_started(),
            self.pending_calls(),
            self.core.executing.lock().len()
        );
        let _ = writeln!(
            out,
            "  exports: {} live, windows: {}, io sent {} / applied {}",
            self.core.exports.len(),
            self.core.windows.lock().len(),
            self.core.io_gen.last(),
            self.core.lane.watermark()
        );
        let recent = self.core.exports.recent_unexports();
        if !recent.is_empty() {
            let _ = writeln!(out, "  recent unexports:");
            for record in recent.iter().rev().take(16) {
                let _ = writeln!(
                    out,
                    "    #{} [{}] ({})",
                    record.oid,
                    record.interfaces.join(", "),
                    record.reason
                );
            }
        }
        out
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.core.name)
            .field("state", &*self.core.state.lock())
            .field("exports", &self.core.exports.len())
            .finish()
    }
}
