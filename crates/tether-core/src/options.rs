//! Per-channel configuration: an immutable options record plus the hook
//! traits the engine consumes but does not implement (name filtering, role
//! checks, artifact resolution).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::{Capability, ModePreference};
use crate::domain::ArtifactResolver;
use crate::error::RemoteError;
use crate::frame::{DEFAULT_FRAME_SIZE, MAX_CHUNK_SIZE};
use crate::marshal::Oid;

/// Predicate consulted on every type name resolved during decode. A
/// rejection aborts the deserialization and is fatal to the channel.
pub trait NameFilter: Send + Sync {
    fn accept(&self, type_name: &str) -> bool;
}

/// The default filter: everything passes.
pub struct AcceptAll;

impl NameFilter for AcceptAll {
    fn accept(&self, _type_name: &str) -> bool {
        true
    }
}

/// What a role checker sees before a user callable runs.
#[derive(Debug)]
pub struct CallContext<'a> {
    pub oid: Oid,
    pub method: &'a str,
    pub interfaces: &'a [String],
    /// False for remoting-internal calls (ping, artifact fetch), which
    /// bypass user security checks.
    pub user_call: bool,
}

/// Security predicate evaluated before invoking any user callable.
pub trait RoleChecker: Send + Sync {
    fn check(&self, ctx: &CallContext<'_>) -> Result<(), RemoteError>;
}

/// The default checker: everything is allowed.
pub struct AllowAll;

impl RoleChecker for AllowAll {
    fn check(&self, _ctx: &CallContext<'_>) -> Result<(), RemoteError> {
        Ok(())
    }
}

/// Liveness probing. Two peers with very different idle patterns may want
/// different intervals; the defaults match the classic 4-minute cadence.
#[derive(Debug, Clone)]
pub struct PingOptions {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive timeouts before the channel is declared dead.
    pub max_timeouts: u32,
}

impl Default for PingOptions {
    fn default() -> Self {
        PingOptions {
            interval: Duration::from_secs(240),
            timeout: Duration::from_secs(240),
            max_timeouts: 4,
        }
    }
}

/// Immutable per-channel options record.
#[derive(Clone)]
pub struct ChannelOptions {
    /// Send-side chunk size, 1..=32767.
    pub frame_size: usize,
    pub mode: ModePreference,
    /// Capability bits advertised at handshake.
    pub capability: Capability,
    /// Record a creation stack on every command for diagnostics.
    pub chain_cause: bool,
    /// Record creation/release stacks in the export table. Turning this
    /// off saves a lot of memory on busy channels.
    pub record_unexport_origin_trace: bool,
    /// How many recently-unexported entries to keep for diagnostics.
    pub unexport_log_size: usize,
    /// Read-side inactivity timeout for the stream transport.
    pub read_timeout: Option<Duration>,
    /// Whether a read timeout tears the channel down or is ignored.
    pub transport_read_timeout_fatal: bool,
    /// Initial credit window per outbound pipe, in bytes.
    pub pipe_window: usize,
    /// Opt in to proactive draining of input streams crossed to the peer.
    pub greedy_pipes: bool,
    /// Periodic liveness probing; `None` disables the ping task.
    pub ping: Option<PingOptions>,
    pub name_filter: Arc<dyn NameFilter>,
    pub role_checker: Arc<dyn RoleChecker>,
    pub artifact_resolver: Option<Arc<dyn ArtifactResolver>>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            frame_size: DEFAULT_FRAME_SIZE,
            mode: ModePreference::Negotiate,
            capability: Capability::current(),
            chain_cause: false,
            record_unexport_origin_trace: true,
            unexport_log_size: 1024,
            read_timeout: None,
            transport_read_timeout_fatal: false,
            pipe_window: 128 * 1024,
            greedy_pipes: false,
            ping: None,
            name_filter: Arc::new(AcceptAll),
            role_checker: Arc::new(AllowAll),
            artifact_resolver: None,
        }
    }
}

impl ChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_size(mut self, size: usize) -> Self {
        self.frame_size = size;
        self
    }

    pub fn mode(mut self, mode: ModePreference) -> Self {
        self.mode = mode;
        self
    }

    pub fn capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    pub fn chain_cause(mut self, enabled: bool) -> Self {
        self.chain_cause = enabled;
        self
    }

    pub fn record_unexport_origin_trace(mut self, enabled: bool) -> Self {
        self.record_unexport_origin_trace = enabled;
        self
    }

    pub fn unexport_log_size(mut self, size: usize) -> Self {
        self.unexport_log_size = size;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>, fatal: bool) -> Self {
        self.read_timeout = timeout;
        self.transport_read_timeout_fatal = fatal;
        self
    }

    pub fn pipe_window(mut self, bytes: usize) -> Self {
        self.pipe_window = bytes;
        self
    }

    pub fn greedy_pipes(mut self, enabled: bool) -> Self {
        self.greedy_pipes = enabled;
        self
    }

    pub fn ping(mut self, ping: PingOptions) -> Self {
        self.ping = Some(ping);
        self
    }

    pub fn name_filter(mut self, filter: Arc<dyn NameFilter>) -> Self {
        self.name_filter = filter;
        self
    }

    pub fn role_checker(mut self, checker: Arc<dyn RoleChecker>) -> Self {
        self.role_checker = checker;
        self
    }

    pub fn artifact_resolver(mut self, resolver: Arc<dyn ArtifactResolver>) -> Self {
        self.artifact_resolver = Some(resolver);
        self
    }

    /// The configured frame size clamped into the protocol's valid range.
    pub fn effective_frame_size(&self) -> usize {
        self.frame_size.clamp(1, MAX_CHUNK_SIZE)
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("frame_size", &self.frame_size)
            .field("mode", &self.mode)
            .field("capability", &self.capability)
            .field("chain_cause", &self.chain_cause)
            .field("record_unexport_origin_trace", &self.record_unexport_origin_trace)
            .field("unexport_log_size", &self.unexport_log_size)
            .field("read_timeout", &self.read_timeout)
            .field("transport_read_timeout_fatal", &self.transport_read_timeout_fatal)
            .field("pipe_window", &self.pipe_window)
            .field("greedy_pipes", &self.greedy_pipes)
            .field("ping", &self.ping)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let opts = ChannelOptions::default();
        assert_eq!(opts.frame_size, 8192);
        assert!(!opts.chain_cause);
        assert!(opts.record_unexport_origin_trace);
        assert_eq!(opts.unexport_log_size, 1024);
        assert!(!opts.transport_read_timeout_fatal);
        assert_eq!(opts.pipe_window, 128 * 1024);
        assert!(opts.ping.is_none());
    }

    #[test]
    fn frame_size_is_clamped_to_protocol_range() {
        assert_eq!(ChannelOptions::new().frame_size(0).effective_frame_size(), 1);
        assert_eq!(ChannelOptions::new().frame_size(100_000).effective_frame_size(), 32767);
        assert_eq!(ChannelOptions::new().frame_size(8192).effective_frame_size(), 8192);
    }

    #[test]
    fn ping_defaults() {
        let ping = PingOptions::default();
        assert_eq!(ping.interval, Duration::from_secs(240));
        assert_eq!(ping.max_timeouts, 4);
    }
}
