//! Request/response matching: the pending-call table, the waiting
//! discipline (with its defensive 30-second re-check), the I/O barrier on
//! response arrival, and cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::debug;

use crate::channel::ChannelCore;
use crate::command::{CommandBody, ResponseCmd};
use crate::error::{well_known, CallError, ChannelError, RemoteError};
use crate::marshal::Oid;

/// Defensive wake against lost notifications while waiting for a response.
const DEFENSIVE_WAKE: Duration = Duration::from_secs(30);

enum PendingState {
    Waiting,
    Responded(ResponseCmd),
    Aborted(Option<Arc<ChannelError>>),
}

/// One outstanding request, registered until its response arrives or the
/// channel goes away.
pub(crate) struct PendingCall {
    pub(crate) id: u32,
    state: Mutex<PendingState>,
    notify: Notify,
    /// Oids exported for this call's stream arguments, released when the
    /// call returns.
    pub(crate) release_on_return: Vec<Oid>,
}

impl PendingCall {
    pub(crate) fn is_waiting(&self) -> bool {
        matches!(*self.state.lock(), PendingState::Waiting)
    }

    pub(crate) fn respond(&self, resp: ResponseCmd) {
        let mut state = self.state.lock();
        if matches!(*state, PendingState::Waiting) {
            *state = PendingState::Responded(resp);
        }
        drop(state);
        self.notify.notify_one();
    }

    fn abort(&self, cause: Option<Arc<ChannelError>>) {
        let mut state = self.state.lock();
        if matches!(*state, PendingState::Waiting) {
            *state = PendingState::Aborted(cause);
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Block until the response arrives or the channel closes underneath.
    pub(crate) async fn wait(&self) -> Result<ResponseCmd, CallError> {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock();
                match &*state {
                    PendingState::Responded(resp) => return Ok(resp.clone()),
                    PendingState::Aborted(cause) => {
                        return Err(CallError::ChannelClosed(cause.clone()));
                    }
                    PendingState::Waiting => {}
                }
            }
            // The notify is the fast path; the timeout is a safety net
            // against a lost wakeup.
            let _ = tokio::time::timeout(DEFENSIVE_WAKE, notified).await;
        }
    }
}

/// The id → outstanding-request map. Ids are unique while a call is live
/// and may be reused after it completes.
pub(crate) struct PendingCalls {
    inner: Mutex<PendingInner>,
}

struct PendingInner {
    map: HashMap<u32, Arc<PendingCall>>,
    next_id: u32,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        PendingCalls { inner: Mutex::new(PendingInner { map: HashMap::new(), next_id: 1 }) }
    }

    /// Allocate an unused id and register the call.
    pub(crate) fn register(&self, release_on_return: Vec<Oid>) -> Arc<PendingCall> {
        let mut inner = self.inner.lock();
        let mut id = inner.next_id;
        while inner.map.contains_key(&id) || id == 0 {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);
        let call = Arc::new(PendingCall {
            id,
            state: Mutex::new(PendingState::Waiting),
            notify: Notify::new(),
            release_on_return,
        });
        inner.map.insert(id, call.clone());
        call
    }

    /// Deregister the call for an arriving response, without waking the
    /// waiter yet. `None` for an unmatched response.
    pub(crate) fn take(&self, id: u32) -> Option<Arc<PendingCall>> {
        let call = self.inner.lock().map.remove(&id);
        if call.is_none() {
            debug!(id, "response for a request that is no longer pending");
        }
        call
    }

    /// Store the response and wake the waiter. Returns the call so its
    /// recorded exports can be released; `None` for an unmatched response.
    pub(crate) fn complete(&self, resp: ResponseCmd) -> Option<Arc<PendingCall>> {
        let call = self.take(resp.id);
        if let Some(call) = &call {
            call.respond(resp);
        }
        call
    }

    /// Drop a registration that never made it onto the wire.
    pub(crate) fn remove(&self, id: u32) {
        self.inner.lock().map.remove(&id);
    }

    /// Channel teardown: every waiter observes the cause.
    pub(crate) fn abort_all(&self, cause: Option<Arc<ChannelError>>) {
        let calls: Vec<Arc<PendingCall>> =
            self.inner.lock().map.drain().map(|(_, c)| c).collect();
        for call in calls {
            call.abort(cause.clone());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().map.len()
    }
}

/// A dispatched call: await the result, or cancel it.
///
/// Dropping the handle while the call is still in flight sends a
/// best-effort `Cancel` to the peer, mirroring interrupt-during-wait
/// semantics for callers that give up on a call.
pub struct CallHandle {
    pub(crate) id: u32,
    pub(crate) pending: Arc<PendingCall>,
    pub(crate) channel: Weak<ChannelCore>,
    pub(crate) declared: Vec<String>,
}

impl CallHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Ask the peer to interrupt the executing callable. Cooperative and
    /// best-effort; the call still completes with whatever the peer sends.
    pub async fn cancel(&self) {
        if let Some(core) = self.channel.upgrade() {
            let _ = core.send_cmd(CommandBody::Cancel { id: self.id }).await;
        }
    }

    async fn join_raw(&self) -> Result<ResponseCmd, CallError> {
        let resp = self.pending.wait().await?;
        // I/O barrier: everything the responder wrote up to its last_io_id
        // must be applied locally before the caller proceeds.
        if let Some(core) = self.channel.upgrade() {
            core.await_io(resp.last_io_id).await?;
        }
        Ok(resp)
    }

    fn classify(&self, err: RemoteError) -> CallError {
        if err.is(well_known::CANCELLED) {
            return CallError::Cancelled;
        }
        let err = err.observed_here();
        if self.declared.iter().any(|d| err.is(d)) {
            CallError::Remote(err)
        } else {
            // Outside the declared set: the caller gets a system-level
            // error instead of an undeclared one.
            CallError::System(err)
        }
    }

    /// Wait for the response and decode the return value.
    pub async fn join<R: DeserializeOwned>(self) -> Result<R, CallError> {
        let resp = self.join_raw().await?;
        match resp.result {
            Ok(Some(payload)) => {
                let core = self.channel.upgrade().ok_or(CallError::ChannelClosed(None))?;
                let opened = core.open_payload(&payload).map_err(CallError::Marshal)?;
                opened.decode().map_err(CallError::Marshal)
            }
            // A void response decodes only into `()`-shaped types.
            Ok(None) => postcard::from_bytes::<R>(&[]).map_err(|e| CallError::Marshal(e.into())),
            Err(err) => Err(self.classify(err)),
        }
    }

    /// Wait for the response, discarding any return value.
    pub async fn join_unit(self) -> Result<(), CallError> {
        let resp = self.join_raw().await?;
        match resp.result {
            Ok(_) => Ok(()),
            Err(err) => Err(self.classify(err)),
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if !self.pending.is_waiting() {
            return;
        }
        let Some(core) = self.channel.upgrade() else { return };
        let Ok(rt) = tokio::runtime::Handle::try_current() else { return };
        let id = self.id;
        rt.spawn(async move {
            let _ = core.send_cmd(CommandBody::Cancel { id }).await;
        });
    }
}
