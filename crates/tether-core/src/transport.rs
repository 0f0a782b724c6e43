//! The transport contract: point-to-point, packet-oriented, reliable,
//! in-order delivery of serialized commands.
//!
//! Two interchangeable implementations live underneath:
//! - [`stream::StreamTransport`] pulls from any `AsyncRead + AsyncWrite`
//!   with its own reader task;
//! - [`buffered::BufferedTransport`] is pushed byte slices by an embedding
//!   event loop and surfaces outgoing bytes through a queue.

use std::sync::Arc;

use async_trait::async_trait;

use crate::capability::Capability;
use crate::command::Command;
use crate::error::TransportError;

/// Where received commands go. `handle` is called in exact receive order;
/// `terminate` is called at most once, on a fatal read-side error.
#[async_trait]
pub trait CommandReceiver: Send + Sync {
    async fn handle(&self, cmd: Command);
    fn terminate(&self, err: TransportError);
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Serialize `cmd` and hand the bytes to the lower stream, flushing on
    /// the command boundary. `last` marks the final command of the
    /// connection; implementations may vary flush or shutdown behavior on
    /// it but have no other obligations. Per-stream marshalling state
    /// (domain back-references) is owned and reset by the channel, not by
    /// transports.
    async fn write(&self, cmd: Command, last: bool) -> Result<(), TransportError>;

    /// Shut down the outgoing half. Idempotent; reads continue.
    fn close_write(&self);

    /// Shut down the incoming half. Idempotent; stops the pump.
    fn close_read(&self);

    /// The capability bits obtained from the peer during negotiation.
    fn remote_capability(&self) -> Capability;

    /// Bind the receiver and start delivering commands. Commands that
    /// arrived before `setup` are delivered first, in order.
    fn setup(&self, receiver: Arc<dyn CommandReceiver>);
}

pub mod buffered;
pub mod stream;

pub use buffered::BufferedTransport;
pub use stream::StreamTransport;
