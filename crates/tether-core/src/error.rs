//! Error taxonomy for the channel engine.
//!
//! Four families of failure exist and must not be conflated:
//! - [`TransportError`]: the byte stream itself failed (EOF, corruption,
//!   handshake). Always fatal to the channel.
//! - [`ChannelError`]: the channel refused or abandoned an operation
//!   (closing, closed, protocol violation).
//! - [`RemoteError`]: an error raised on the peer and carried over the wire,
//!   preserving type name, message and both stacks.
//! - [`CallError`] / [`PipeError`]: what callers of the high-level call and
//!   pipe APIs observe.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capability::WireMode;
use crate::marshal::MarshalError;

/// Type names used for errors minted by the runtime itself, so the peer can
/// recognize them without decoding a payload.
pub mod well_known {
    pub const CANCELLED: &str = "tether.Cancelled";
    pub const CHANNEL_CLOSED: &str = "tether.ChannelClosed";
    pub const ROLE_DENIED: &str = "tether.RoleDenied";
    pub const UNKNOWN_OBJECT: &str = "tether.UnknownObject";
    pub const UNKNOWN_METHOD: &str = "tether.UnknownMethod";
    pub const MARSHAL: &str = "tether.Marshal";
    pub const PROXY: &str = "tether.Proxy";
    pub const READER_CLOSED: &str = "tether.ReaderClosed";
    pub const PIPE_DEAD: &str = "tether.PipeDead";
}

/// Render the current backtrace as a plain string, one frame per line.
///
/// Used for the optional creation/release traces carried by commands and
/// export-table entries. Capturing is not cheap, so every capture site is
/// gated by an option.
pub(crate) fn capture_trace() -> String {
    std::backtrace::Backtrace::force_capture().to_string()
}

/// Failure while turning received bytes back into a command.
#[derive(Debug)]
pub enum DecodeError {
    /// The command body did not parse.
    Postcard(postcard::Error),
    /// The bytes were structurally wrong in a way the parser cannot name.
    InvalidData(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Postcard(e) => write!(f, "command decode failed: {}", e),
            DecodeError::InvalidData(msg) => write!(f, "invalid command data: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<postcard::Error> for DecodeError {
    fn from(e: postcard::Error) -> Self {
        DecodeError::Postcard(e)
    }
}

/// Failure during the startup preamble exchange.
#[derive(Debug)]
pub enum HandshakeError {
    /// The stream ended before the peer's preamble appeared.
    Eof,
    /// Both sides are pinned to different wire modes.
    ModeMismatch { ours: WireMode, theirs: WireMode },
    /// The capability payload after the preamble was unreadable.
    BadCapability(String),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Eof => write!(f, "stream ended during handshake"),
            HandshakeError::ModeMismatch { ours, theirs } => {
                write!(f, "wire mode mismatch: we require {}, peer sent {}", ours, theirs)
            }
            HandshakeError::BadCapability(msg) => {
                write!(f, "unreadable capability payload: {}", msg)
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

/// A fatal condition on the underlying byte stream.
#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    Decode(DecodeError),
    Handshake(HandshakeError),
    /// The transport (or the relevant half) was already closed.
    Closed,
    /// A read timed out and the channel is configured to treat that as fatal.
    ReadTimeout,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "transport I/O error: {}", e),
            TransportError::Decode(e) => write!(f, "{}", e),
            TransportError::Handshake(e) => write!(f, "handshake failed: {}", e),
            TransportError::Closed => write!(f, "transport is closed"),
            TransportError::ReadTimeout => write!(f, "transport read timed out"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Decode(e) => Some(e),
            TransportError::Handshake(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<DecodeError> for TransportError {
    fn from(e: DecodeError) -> Self {
        TransportError::Decode(e)
    }
}

impl From<HandshakeError> for TransportError {
    fn from(e: HandshakeError) -> Self {
        TransportError::Handshake(e)
    }
}

/// The channel refused or abandoned an operation.
#[derive(Debug)]
pub enum ChannelError {
    /// A close has been queued; no further outgoing commands are accepted.
    Closing,
    /// The channel is fully closed. The cause, if any, is the error that
    /// tore it down.
    Closed { cause: Option<Arc<ChannelError>> },
    /// The transport failed underneath the channel.
    Transport(TransportError),
    /// The peer violated the protocol.
    Protocol(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Closing => write!(f, "channel is closing"),
            ChannelError::Closed { cause: None } => write!(f, "channel is closed"),
            ChannelError::Closed { cause: Some(c) } => write!(f, "channel is closed: {}", c),
            ChannelError::Transport(e) => write!(f, "{}", e),
            ChannelError::Protocol(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Transport(e) => Some(e),
            ChannelError::Closed { cause: Some(c) } => Some(c.as_ref()),
            _ => None,
        }
    }
}

impl From<TransportError> for ChannelError {
    fn from(e: TransportError) -> Self {
        ChannelError::Transport(e)
    }
}

/// An error raised on the peer, carried across the wire.
///
/// `type_name` and `message` always survive; `payload` holds the original
/// error value in serialized form when the thrower provided one, so the
/// caller can recover the concrete type with [`RemoteError::decode`]. When
/// the payload is absent or undecodable the caller still gets the proxy
/// form: name, message and the remote stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub type_name: String,
    pub message: String,
    /// Stack frames captured where the error was raised, one per entry.
    pub remote_trace: Vec<String>,
    pub cause: Option<Box<RemoteError>>,
    /// Serialized form of the original error value, if it was serializable.
    pub payload: Option<Vec<u8>>,
    /// Where this side observed the error. Never crosses the wire; merged
    /// into the rendered trace so both sides of the call show up.
    #[serde(skip)]
    pub local_trace: Option<String>,
}

impl RemoteError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError {
            type_name: type_name.into(),
            message: message.into(),
            remote_trace: Vec::new(),
            cause: None,
            payload: None,
            local_trace: None,
        }
    }

    /// Build an error that carries the serialized original value, so the
    /// peer can decode it back to the concrete type.
    pub fn typed<T: Serialize + fmt::Display>(type_name: impl Into<String>, value: &T) -> Self {
        let payload = postcard::to_allocvec(value).ok();
        RemoteError {
            type_name: type_name.into(),
            message: value.to_string(),
            remote_trace: Vec::new(),
            cause: None,
            payload,
            local_trace: None,
        }
    }

    /// Wrap an arbitrary error by name and message only (the proxy form).
    pub fn from_display(type_name: impl Into<String>, err: &dyn fmt::Display) -> Self {
        RemoteError::new(type_name, err.to_string())
    }

    pub fn cancelled() -> Self {
        RemoteError::new(well_known::CANCELLED, "call was cancelled")
    }

    pub fn channel_closed() -> Self {
        RemoteError::new(well_known::CHANNEL_CLOSED, "channel closed while call was in flight")
    }

    pub fn with_cause(mut self, cause: RemoteError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_trace(mut self, trace: String) -> Self {
        self.remote_trace = trace.lines().map(|l| l.to_string()).collect();
        self
    }

    /// Record where this side observed the error, merging local frames into
    /// the trace a caller will eventually see.
    pub fn observed_here(mut self) -> Self {
        self.local_trace = Some(capture_trace());
        self
    }

    /// Recover the original error value, if its serialized form crossed the
    /// wire and decodes as `T`.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        let bytes = self.payload.as_deref()?;
        postcard::from_bytes(bytes).ok()
    }

    pub fn is(&self, type_name: &str) -> bool {
        self.type_name == type_name
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// What the caller of a remote invocation observes.
#[derive(Debug)]
pub enum CallError {
    /// The peer raised an error whose type is in the call's declared set.
    Remote(RemoteError),
    /// The peer raised an error outside the declared set, or the runtime
    /// itself failed on the far side. The original error is preserved.
    System(RemoteError),
    /// The call was cancelled before a result arrived.
    Cancelled,
    /// The channel closed (or was already closed) while the call was
    /// pending.
    ChannelClosed(Option<Arc<ChannelError>>),
    /// Arguments or the return value could not be marshalled.
    Marshal(MarshalError),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Remote(e) => write!(f, "remote call failed: {}", e),
            CallError::System(e) => write!(f, "remote system error: {}", e),
            CallError::Cancelled => write!(f, "call was cancelled"),
            CallError::ChannelClosed(None) => write!(f, "channel closed during call"),
            CallError::ChannelClosed(Some(c)) => {
                write!(f, "channel closed during call: {}", c)
            }
            CallError::Marshal(e) => write!(f, "marshalling failed: {}", e),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Remote(e) | CallError::System(e) => Some(e),
            CallError::ChannelClosed(Some(c)) => Some(c.as_ref()),
            CallError::Marshal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MarshalError> for CallError {
    fn from(e: MarshalError) -> Self {
        CallError::Marshal(e)
    }
}

/// What pipe writers and readers observe.
#[derive(Debug, Clone)]
pub enum PipeError {
    /// The peer reader is gone; the recorded cause explains why.
    Dead(RemoteError),
    /// This end of the pipe was already closed locally.
    Closed,
    /// The channel went away underneath the pipe.
    ChannelClosed,
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeError::Dead(cause) => write!(f, "pipe is dead: {}", cause),
            PipeError::Closed => write!(f, "pipe is closed"),
            PipeError::ChannelClosed => write!(f, "channel closed underneath the pipe"),
        }
    }
}

impl std::error::Error for PipeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipeError::Dead(cause) => Some(cause),
            _ => None,
        }
    }
}

impl From<PipeError> for std::io::Error {
    fn from(e: PipeError) -> Self {
        let kind = match &e {
            PipeError::Dead(_) => std::io::ErrorKind::BrokenPipe,
            PipeError::Closed => std::io::ErrorKind::NotConnected,
            PipeError::ChannelClosed => std::io::ErrorKind::ConnectionAborted,
        };
        std::io::Error::new(kind, e.to_string())
    }
}
