//! The command vocabulary: one tagged record per unit of protocol traffic,
//! plus the wire forms of requests, responses and call arguments.

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, RemoteError};
use crate::marshal::{Oid, WirePayload};

/// One unit of protocol traffic, as serialized onto the transport.
///
/// `origin` optionally records where the command was created (rendered
/// backtrace) so a distributed failure can be traced to its sending call
/// site. Capturing is gated by the `chain_cause` option since it is
/// expensive and almost always off in production.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub body: CommandBody,
    pub origin: Option<String>,
}

impl Command {
    pub fn new(body: CommandBody, chain_cause: bool) -> Self {
        let origin = if chain_cause { Some(crate::error::capture_trace()) } else { None };
        Command { body, origin }
    }
}

impl From<CommandBody> for Command {
    fn from(body: CommandBody) -> Self {
        Command { body, origin: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandBody {
    /// An RPC invocation.
    Request(RequestCmd),
    /// Return value or error for a request.
    Response(ResponseCmd),
    /// Best-effort interrupt of a running request.
    Cancel { id: u32 },
    /// Data bytes for the pipe whose sink is `oid`.
    PipeChunk { oid: Oid, io_id: u64, data: Vec<u8> },
    /// Flush the local sink behind `oid`.
    PipeFlush { oid: Oid, io_id: u64 },
    /// Window credit returned by the receiving side.
    PipeAck { oid: Oid, len: u32 },
    /// Writer-side close of the pipe.
    PipeEof { oid: Oid, io_id: u64 },
    /// The reader behind `oid` is gone; carries why.
    PipeDead { oid: Oid, cause: RemoteError },
    /// Release one reference to an object exported by the receiving side.
    Unexport { oid: Oid },
    /// Terminate the channel.
    Close,
}

impl CommandBody {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandBody::Request(_) => "Request",
            CommandBody::Response(_) => "Response",
            CommandBody::Cancel { .. } => "Cancel",
            CommandBody::PipeChunk { .. } => "Pipe.Chunk",
            CommandBody::PipeFlush { .. } => "Pipe.Flush",
            CommandBody::PipeAck { .. } => "Pipe.Ack",
            CommandBody::PipeEof { .. } => "Pipe.EOF",
            CommandBody::PipeDead { .. } => "Pipe.Dead",
            CommandBody::Unexport { .. } => "Unexport",
            CommandBody::Close => "Close",
        }
    }
}

/// An RPC invocation as it crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCmd {
    /// Locally-unique within the channel for the lifetime of the call; may
    /// be reused after completion.
    pub id: u32,
    /// The sender's last issued I/O id when this request was sent. The
    /// executor waits for that I/O to be applied locally before running
    /// user code.
    pub last_io_id: u64,
    /// Target object in the receiver's export table.
    pub oid: Oid,
    pub method: String,
    /// Type names of the value arguments, for diagnostics and filtering.
    pub arg_types: Vec<String>,
    pub args: Vec<WireArg>,
    /// False for remoting-internal calls, which bypass the role checker.
    pub user_call: bool,
}

/// The matched answer to a [`RequestCmd`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCmd {
    pub id: u32,
    /// The responder's last issued I/O id at the end of execution, or 0 if
    /// it issued none. The requester waits for its own pipe lane to reach
    /// this id before returning to the caller.
    pub last_io_id: u64,
    pub result: Result<Option<WirePayload>, RemoteError>,
}

/// One argument of a remote invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireArg {
    /// A marshalled value.
    Value(WirePayload),
    /// A reference to an object the sender exported; the receiver gets a
    /// proxy.
    Object { oid: Oid, interfaces: Vec<String> },
    /// A readable stream offered by the sender; `source_oid` is the
    /// sender-side source object. With `greedy` the sender pushes bytes
    /// proactively once the receiver asks it to.
    InputPipe { source_oid: Oid, greedy: bool },
    /// A writable sink: bytes the receiver writes flow back to the
    /// sender-side sink exported under `sink_oid`.
    OutputPipe { sink_oid: Oid },
    Null,
}

/// Serialize a command for the transport.
pub fn encode_command(cmd: &Command) -> Result<Vec<u8>, DecodeError> {
    postcard::to_allocvec(cmd).map_err(DecodeError::Postcard)
}

/// Decode a command payload received from the transport.
pub fn decode_command(bytes: &[u8]) -> Result<Command, DecodeError> {
    postcard::from_bytes(bytes).map_err(DecodeError::Postcard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::encode_value;

    #[test]
    fn command_round_trip_preserves_observable_fields() {
        let req = RequestCmd {
            id: 7,
            last_io_id: 42,
            oid: 2,
            method: "add".into(),
            arg_types: vec!["i32".into(), "i32".into()],
            args: vec![
                WireArg::Value(encode_value(&2i32).unwrap()),
                WireArg::Value(encode_value(&3i32).unwrap()),
            ],
            user_call: true,
        };
        let cmd = Command::from(CommandBody::Request(req));
        let bytes = encode_command(&cmd).unwrap();
        let back = decode_command(&bytes).unwrap();
        match back.body {
            CommandBody::Request(r) => {
                assert_eq!(r.id, 7);
                assert_eq!(r.last_io_id, 42);
                assert_eq!(r.method, "add");
                assert_eq!(r.arg_types.len(), 2);
                assert!(r.user_call);
            }
            other => panic!("expected Request, got {}", other.kind()),
        }
    }

    #[test]
    fn response_carries_errors() {
        let resp = ResponseCmd {
            id: 9,
            last_io_id: 0,
            result: Err(RemoteError::new("acme.Boom", "boom")),
        };
        let cmd = Command::from(CommandBody::Response(resp));
        let back = decode_command(&encode_command(&cmd).unwrap()).unwrap();
        match back.body {
            CommandBody::Response(r) => {
                let err = r.result.unwrap_err();
                assert_eq!(err.type_name, "acme.Boom");
                assert_eq!(err.message, "boom");
            }
            other => panic!("expected Response, got {}", other.kind()),
        }
    }

    #[test]
    fn origin_is_captured_only_when_asked() {
        let plain = Command::new(CommandBody::Close, false);
        assert!(plain.origin.is_none());
        let traced = Command::new(CommandBody::Close, true);
        assert!(traced.origin.is_some());
    }

    #[test]
    fn pipe_commands_round_trip() {
        for body in [
            CommandBody::PipeChunk { oid: 5, io_id: 3, data: b"abc".to_vec() },
            CommandBody::PipeAck { oid: 5, len: 3 },
            CommandBody::PipeEof { oid: 5, io_id: 4 },
            CommandBody::PipeDead { oid: 5, cause: RemoteError::cancelled() },
            CommandBody::Unexport { oid: 5 },
            CommandBody::Close,
        ] {
            let kind = body.kind();
            let back = decode_command(&encode_command(&Command::from(body)).unwrap()).unwrap();
            assert_eq!(back.body.kind(), kind);
        }
    }
}
