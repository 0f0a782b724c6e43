//! Remote objects and their stand-ins.
//!
//! An exported object is a capability set: named methods behind a generic
//! invoke-by-name. [`DispatchTable`] is the convenient way to build one
//! from closures; anything implementing [`RemoteObject`] can be exported.
//! On the other side a [`Proxy`] turns `invoke("name")` into a matched
//! request/response exchange.
//!
//! Proxies hold the channel weakly. Dropping the last handle of a proxy
//! still bound to a live channel releases the peer's reference by queueing
//! an `Unexport`; channel closure voids that cleanup so it never fires
//! against an unusable transport.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncRead;

use crate::call::CallHandle;
use crate::channel::{Channel, ChannelCore};
use crate::command::WireArg;
use crate::error::{well_known, CallError, RemoteError};
use crate::export::ExportRecorder;
use crate::marshal::{encode_value, OpenedPayload, Oid, WirePayload};
use crate::pipe::{PipeSender, PipeSink, RemoteInput, SinkExport, SourceExport, SOURCE_INTERFACE};

/// Context handed to every invocation on the executing side.
pub struct InvokeContext {
    pub(crate) core: Arc<ChannelCore>,
}

impl InvokeContext {
    /// The channel this invocation arrived on.
    pub fn channel(&self) -> Channel {
        Channel::from_core(self.core.clone())
    }

    pub(crate) fn channel_core(&self) -> Arc<ChannelCore> {
        self.core.clone()
    }
}

/// What a method hands back to the wire.
pub struct ReturnValue {
    pub(crate) payload: Option<WirePayload>,
}

impl ReturnValue {
    /// No return value.
    pub fn unit() -> Result<ReturnValue, RemoteError> {
        Ok(ReturnValue { payload: None })
    }

    /// Marshal `value` as the return payload.
    pub fn of<T: Serialize>(value: &T) -> Result<ReturnValue, RemoteError> {
        let payload = encode_value(value)
            .map_err(|e| RemoteError::new(well_known::MARSHAL, e.to_string()))?;
        Ok(ReturnValue { payload: Some(payload) })
    }
}

/// An object reachable from the peer: an interface set plus invoke-by-name.
#[async_trait]
pub trait RemoteObject: Send + Sync {
    /// The advertised interface names.
    fn interfaces(&self) -> Vec<String>;

    async fn invoke(
        &self,
        cx: InvokeContext,
        method: &str,
        args: CallArgs,
    ) -> Result<ReturnValue, RemoteError>;

    /// Present when this export is the reader-side sink of a pipe.
    fn as_pipe_sink(&self) -> Option<Arc<dyn PipeSink>> {
        None
    }
}

/// One materialized argument of an incoming invocation.
pub enum CallArg {
    Value(OpenedPayload),
    Object(Proxy),
    Input(RemoteInput),
    Output(PipeSender),
    Null,
}

/// The materialized argument list. Values can be decoded repeatedly;
/// streams are taken out exactly once.
pub struct CallArgs {
    args: Mutex<Vec<Option<CallArg>>>,
}

impl CallArgs {
    pub(crate) fn new(args: Vec<CallArg>) -> Self {
        CallArgs { args: Mutex::new(args.into_iter().map(Some).collect()) }
    }

    pub fn len(&self) -> usize {
        self.args.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bad_arg(&self, index: usize, wanted: &str) -> RemoteError {
        RemoteError::new(
            well_known::MARSHAL,
            format!("argument {} is not {} (or was already taken)", index, wanted),
        )
    }

    /// Decode the value argument at `index`.
    pub fn value<T: DeserializeOwned>(&self, index: usize) -> Result<T, RemoteError> {
        let args = self.args.lock();
        match args.get(index) {
            Some(Some(CallArg::Value(opened))) => opened
                .decode()
                .map_err(|e| RemoteError::new(well_known::MARSHAL, e.to_string())),
            _ => Err(self.bad_arg(index, "a value")),
        }
    }

    /// The opened envelope of the value argument at `index`, with its
    /// source domain and type name.
    pub fn payload(&self, index: usize) -> Result<OpenedPayload, RemoteError> {
        let args = self.args.lock();
        match args.get(index) {
            Some(Some(CallArg::Value(opened))) => Ok(opened.clone()),
            _ => Err(self.bad_arg(index, "a value")),
        }
    }

    /// The proxy for an object-reference argument.
    pub fn object(&self, index: usize) -> Result<Proxy, RemoteError> {
        let args = self.args.lock();
        match args.get(index) {
            Some(Some(CallArg::Object(proxy))) => Ok(proxy.clone()),
            _ => Err(self.bad_arg(index, "an object reference")),
        }
    }

    /// Take the readable stream at `index`. Consuming.
    pub fn take_input(&self, index: usize) -> Result<RemoteInput, RemoteError> {
        let mut args = self.args.lock();
        let Some(slot) = args.get_mut(index) else {
            return Err(self.bad_arg(index, "an input stream"));
        };
        match slot.take() {
            Some(CallArg::Input(input)) => Ok(input),
            other => {
                *slot = other;
                Err(self.bad_arg(index, "an input stream"))
            }
        }
    }

    /// Take the writable stream at `index`. Consuming.
    pub fn take_output(&self, index: usize) -> Result<PipeSender, RemoteError> {
        let mut args = self.args.lock();
        let Some(slot) = args.get_mut(index) else {
            return Err(self.bad_arg(index, "an output stream"));
        };
        match slot.take() {
            Some(CallArg::Output(output)) => Ok(output),
            other => {
                *slot = other;
                Err(self.bad_arg(index, "an output stream"))
            }
        }
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.args.lock().get(index), Some(Some(CallArg::Null)))
    }
}

type BoxInvokeFuture = Pin<Box<dyn Future<Output = Result<ReturnValue, RemoteError>> + Send>>;
type MethodFn = Box<dyn Fn(InvokeContext, CallArgs) -> BoxInvokeFuture + Send + Sync>;

/// A capability set built from closures: the usual way to describe an
/// exported object.
pub struct DispatchTable {
    interface: String,
    methods: HashMap<String, MethodFn>,
}

impl DispatchTable {
    pub fn new(interface: impl Into<String>) -> Self {
        DispatchTable { interface: interface.into(), methods: HashMap::new() }
    }

    /// Register a method. Later registrations under the same name replace
    /// earlier ones.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(InvokeContext, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReturnValue, RemoteError>> + Send + 'static,
    {
        self.methods.insert(name.into(), Box::new(move |cx, args| Box::pin(f(cx, args))));
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(|s| s.as_str())
    }
}

#[async_trait]
impl RemoteObject for DispatchTable {
    fn interfaces(&self) -> Vec<String> {
        vec![self.interface.clone()]
    }

    async fn invoke(
        &self,
        cx: InvokeContext,
        method: &str,
        args: CallArgs,
    ) -> Result<ReturnValue, RemoteError> {
        match self.methods.get(method) {
            Some(f) => f(cx, args).await,
            None => Err(RemoteError::new(
                well_known::UNKNOWN_METHOD,
                format!("'{}' has no method '{}'", self.interface, method),
            )),
        }
    }
}

/// Client-side stand-in for an object exported by the peer.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    channel: Weak<ChannelCore>,
    oid: Oid,
    interfaces: Vec<String>,
    user_proxy: bool,
    /// Queue an `Unexport` when the last handle drops. Off for stream
    /// proxies materialized from call arguments, whose lifetime is tied to
    /// the call instead.
    auto_unexport: bool,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        if !self.auto_unexport {
            return;
        }
        if let Some(core) = self.channel.upgrade() {
            core.schedule_unexport(self.oid);
        }
    }
}

impl Proxy {
    pub(crate) fn new(
        channel: Weak<ChannelCore>,
        oid: Oid,
        interfaces: Vec<String>,
        user_proxy: bool,
        auto_unexport: bool,
    ) -> Self {
        Proxy {
            inner: Arc::new(ProxyInner { channel, oid, interfaces, user_proxy, auto_unexport }),
        }
    }

    pub fn oid(&self) -> Oid {
        self.inner.oid
    }

    pub fn interfaces(&self) -> &[String] {
        &self.inner.interfaces
    }

    pub fn is_user_proxy(&self) -> bool {
        self.inner.user_proxy
    }

    pub(crate) fn channel(&self) -> Result<Arc<ChannelCore>, CallError> {
        self.inner.channel.upgrade().ok_or(CallError::ChannelClosed(None))
    }

    /// Start building an invocation of `method` on the remote object.
    pub fn invoke(&self, method: impl Into<String>) -> CallBuilder {
        CallBuilder {
            proxy: self.clone(),
            method: method.into(),
            args: Vec::new(),
            arg_types: Vec::new(),
            declared: Vec::new(),
            recorder: ExportRecorder::new(),
            user_call: true,
            deferred_error: None,
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("oid", &self.inner.oid)
            .field("interfaces", &self.inner.interfaces)
            .field("user_proxy", &self.inner.user_proxy)
            .finish()
    }
}

/// Accumulates arguments for one invocation, then dispatches it.
///
/// Argument marshalling failures are deferred: the builder keeps chaining
/// and the first error surfaces at `call`.
pub struct CallBuilder {
    proxy: Proxy,
    method: String,
    args: Vec<WireArg>,
    arg_types: Vec<String>,
    declared: Vec<String>,
    /// Collects exports made for stream arguments, released together when
    /// the call returns.
    recorder: ExportRecorder,
    user_call: bool,
    deferred_error: Option<CallError>,
}

impl CallBuilder {
    /// Add a marshalled value argument.
    pub fn arg<T: Serialize>(mut self, value: &T) -> Self {
        if self.deferred_error.is_some() {
            return self;
        }
        match encode_value(value) {
            Ok(payload) => {
                self.arg_types.push(std::any::type_name::<T>().to_string());
                self.args.push(WireArg::Value(payload));
            }
            Err(e) => self.deferred_error = Some(e.into()),
        }
        self
    }

    pub fn arg_null(mut self) -> Self {
        self.arg_types.push("null".into());
        self.args.push(WireArg::Null);
        self
    }

    /// Export `obj` and pass a reference to it. The peer gets a proxy and
    /// owns one reference until it drops it.
    pub fn arg_object(mut self, obj: Arc<dyn RemoteObject>) -> Self {
        if self.deferred_error.is_some() {
            return self;
        }
        match self.proxy.channel() {
            Ok(core) => {
                let interfaces = obj.interfaces();
                let oid = core.export_object(&obj, &interfaces, None);
                self.arg_types.push(interfaces.first().cloned().unwrap_or_default());
                self.args.push(WireArg::Object { oid, interfaces });
            }
            Err(e) => self.deferred_error = Some(e),
        }
        self
    }

    /// Pass a readable stream. The export is released automatically when
    /// the call returns; greedy draining is used when both sides support
    /// it and this channel opted in.
    pub fn arg_input(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        if self.deferred_error.is_some() {
            return self;
        }
        match self.proxy.channel() {
            Ok(core) => {
                let source: Arc<dyn RemoteObject> =
                    Arc::new(SourceExport::new(Box::new(reader)));
                let interfaces = vec![SOURCE_INTERFACE.to_string()];
                let oid = core.export_object(&source, &interfaces, Some(&mut self.recorder));
                self.arg_types.push(SOURCE_INTERFACE.to_string());
                self.args.push(WireArg::InputPipe { source_oid: oid, greedy: core.greedy_pipes() });
            }
            Err(e) => self.deferred_error = Some(e),
        }
        self
    }

    /// Pass a writable sink the peer can stream bytes into. Also released
    /// automatically when the call returns.
    pub fn arg_output(mut self, sink: Arc<dyn PipeSink>) -> Self {
        if self.deferred_error.is_some() {
            return self;
        }
        match self.proxy.channel() {
            Ok(core) => {
                let export: Arc<dyn RemoteObject> = Arc::new(SinkExport::new(sink));
                let interfaces = export.interfaces();
                let oid = core.export_object(&export, &interfaces, Some(&mut self.recorder));
                self.arg_types.push(interfaces[0].clone());
                self.args.push(WireArg::OutputPipe { sink_oid: oid });
            }
            Err(e) => self.deferred_error = Some(e),
        }
        self
    }

    /// Declare an error type the caller expects. Remote errors outside the
    /// declared set surface as [`CallError::System`] instead of
    /// [`CallError::Remote`].
    pub fn declared(mut self, type_name: impl Into<String>) -> Self {
        self.declared.push(type_name.into());
        self
    }

    /// Mark this as a remoting-internal call: bypasses the peer's role
    /// checker.
    pub fn internal(mut self) -> Self {
        self.user_call = false;
        self
    }

    /// Add a pre-marshalled payload (e.g. one produced under a non-system
    /// source domain with `Channel::marshal_in_domain`).
    pub fn arg_payload(mut self, type_name: impl Into<String>, payload: WirePayload) -> Self {
        self.arg_types.push(type_name.into());
        self.args.push(WireArg::Value(payload));
        self
    }

    /// Dispatch and return a handle to await or cancel.
    pub async fn call_async(mut self) -> Result<CallHandle, CallError> {
        if let Some(e) = self.deferred_error.take() {
            // Release anything exported before the builder hit trouble.
            if let Ok(core) = self.proxy.channel() {
                core.release_exports(&self.recorder.take(), "call never sent");
            }
            return Err(e);
        }
        let core = self.proxy.channel()?;
        core.start_call(
            self.proxy.oid(),
            self.method,
            self.arg_types,
            self.args,
            self.user_call,
            self.recorder.take(),
            self.declared,
        )
        .await
    }

    /// Dispatch and block until the result arrives, honoring the I/O
    /// barrier before returning.
    pub async fn call<R: DeserializeOwned>(self) -> Result<R, CallError> {
        let handle = self.call_async().await?;
        handle.join().await
    }

    /// Dispatch a call whose result carries no value.
    pub async fn call_unit(self) -> Result<(), CallError> {
        let handle = self.call_async().await?;
        handle.join_unit().await
    }
}
