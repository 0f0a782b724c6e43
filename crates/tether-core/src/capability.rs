//! Capability negotiation: feature bits, the startup preamble, and the
//! scanner that finds a peer's preamble in a possibly noisy stream.
//!
//! Before any command is exchanged, each side writes the capacity preamble
//! followed by its capability bits (postcard-encoded `u64` in Base64,
//! newline-terminated), then a mode preamble. Some launchers emit banner or
//! warning bytes before the remoting process takes over the stream, so the
//! scanner discards leading noise until a preamble appears.

use std::fmt;

use bitflags::bitflags;

use crate::error::HandshakeError;

bitflags! {
    /// Optional protocol features agreed at handshake. The absence of a bit
    /// means the conservative legacy path is taken for that concern.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capability: u64 {
        /// Payloads may carry non-system source-domain tags.
        const MULTI_DOMAIN = 1 << 0;
        /// Pipe chunks are windowed and acked.
        const PIPE_THROTTLING = 1 << 1;
        /// Commands are carried in continuation-bit chunk framing.
        const CHUNKED_FRAMING = 1 << 2;
        /// The peer may prefetch artifacts ahead of demand.
        const PREFETCH = 1 << 3;
        /// Remote input streams may be drained proactively by the sender.
        const GREEDY_PIPES = 1 << 4;
        /// Pipe writers use the ordered I/O lane with barrier ids.
        const PROXY_WRITER_2 = 1 << 5;
        /// Undecodable error payloads degrade to a proxy error instead of
        /// failing the response.
        const PROXY_EXCEPTION_FALLBACK = 1 << 6;
    }
}

impl Capability {
    /// Everything this implementation supports.
    pub fn current() -> Self {
        Capability::MULTI_DOMAIN
            | Capability::PIPE_THROTTLING
            | Capability::CHUNKED_FRAMING
            | Capability::PREFETCH
            | Capability::GREEDY_PIPES
            | Capability::PROXY_WRITER_2
            | Capability::PROXY_EXCEPTION_FALLBACK
    }
}

/// How command bytes travel once the handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMode {
    /// Frames go over the stream as raw bytes.
    Binary,
    /// Frames are Base64-encoded, one line per write, for transports that
    /// mangle binary data.
    Text,
}

impl fmt::Display for WireMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireMode::Binary => write!(f, "binary"),
            WireMode::Text => write!(f, "text"),
        }
    }
}

/// What a side is willing to speak. A pinned side fails the handshake if
/// the peer lands on the other mode; a negotiating side emits binary but
/// adopts whatever the peer insists on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModePreference {
    Negotiate,
    Binary,
    Text,
}

impl ModePreference {
    pub(crate) fn emitted(self) -> WireMode {
        match self {
            ModePreference::Negotiate | ModePreference::Binary => WireMode::Binary,
            ModePreference::Text => WireMode::Text,
        }
    }

    pub(crate) fn pinned(self) -> Option<WireMode> {
        match self {
            ModePreference::Negotiate => None,
            ModePreference::Binary => Some(WireMode::Binary),
            ModePreference::Text => Some(WireMode::Text),
        }
    }
}

pub const PREAMBLE_CAPACITY: &[u8] = b"<===[TETHER REMOTING CAPACITY]===>";
pub const PREAMBLE_BINARY: &[u8] = b"<===[TETHER REMOTING BINARY]===>";
pub const PREAMBLE_TEXT: &[u8] = b"<===[TETHER REMOTING TEXT]===>";

/// Encode the capability payload that follows [`PREAMBLE_CAPACITY`]:
/// Base64 of the postcard-encoded bits, newline-terminated.
pub fn encode_capability_payload(cap: Capability) -> Result<Vec<u8>, HandshakeError> {
    let bits = postcard::to_allocvec(&cap.bits())
        .map_err(|e| HandshakeError::BadCapability(e.to_string()))?;
    let mut out = base64::encode(bits).into_bytes();
    out.push(b'\n');
    Ok(out)
}

/// Decode the Base64 capability payload (without the trailing newline).
/// Unknown bits are preserved so a newer peer's extras survive a round
/// trip, even though this side ignores them.
pub fn decode_capability_payload(line: &[u8]) -> Result<Capability, HandshakeError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| HandshakeError::BadCapability("payload is not ASCII".into()))?;
    let bytes = base64::decode(text.trim())
        .map_err(|e| HandshakeError::BadCapability(e.to_string()))?;
    let bits: u64 =
        postcard::from_bytes(&bytes).map_err(|e| HandshakeError::BadCapability(e.to_string()))?;
    Ok(Capability::from_bits_retain(bits))
}

/// A preamble the scanner can recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreambleToken {
    Capacity,
    Mode(WireMode),
}

/// Incremental multi-pattern matcher over the incoming handshake bytes.
///
/// Bytes that can no longer be part of any preamble are treated as noise
/// and collected for diagnostics (launchers and shells are fond of writing
/// banners onto the stream before handing it over).
pub struct PreambleScanner {
    window: Vec<u8>,
    noise: Vec<u8>,
}

const PATTERNS: &[(&[u8], PreambleToken)] = &[
    (PREAMBLE_CAPACITY, PreambleToken::Capacity),
    (PREAMBLE_BINARY, PreambleToken::Mode(WireMode::Binary)),
    (PREAMBLE_TEXT, PreambleToken::Mode(WireMode::Text)),
];

impl PreambleScanner {
    pub fn new() -> Self {
        PreambleScanner { window: Vec::new(), noise: Vec::new() }
    }

    /// Feed one byte. Returns the recognized preamble, if this byte
    /// completed one.
    pub fn push(&mut self, byte: u8) -> Option<PreambleToken> {
        self.window.push(byte);
        for (pattern, token) in PATTERNS {
            if self.window.ends_with(pattern) {
                // Everything before the match was noise.
                let noise_len = self.window.len() - pattern.len();
                self.noise.extend_from_slice(&self.window[..noise_len]);
                self.window.clear();
                return Some(*token);
            }
        }
        let max_len = PATTERNS.iter().map(|(p, _)| p.len()).max().unwrap_or(0);
        if self.window.len() > max_len {
            let overflow = self.window.len() - max_len;
            self.noise.extend(self.window.drain(..overflow));
        }
        None
    }

    /// Bytes discarded so far while hunting for a preamble.
    pub fn noise(&self) -> &[u8] {
        &self.noise
    }

    /// Hand back the discarded bytes, e.g. to tee into a diagnostic sink.
    pub fn take_noise(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.noise)
    }
}

impl Default for PreambleScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(scanner: &mut PreambleScanner, data: &[u8]) -> Vec<PreambleToken> {
        data.iter().filter_map(|&b| scanner.push(b)).collect()
    }

    #[test]
    fn capability_payload_round_trip() {
        let cap = Capability::current();
        let payload = encode_capability_payload(cap).unwrap();
        assert_eq!(*payload.last().unwrap(), b'\n');
        let back = decode_capability_payload(&payload[..payload.len() - 1]).unwrap();
        assert_eq!(back, cap);
    }

    #[test]
    fn unknown_bits_survive_decode() {
        let raw = Capability::from_bits_retain(Capability::current().bits() | (1 << 40));
        let payload = encode_capability_payload(raw).unwrap();
        let back = decode_capability_payload(&payload[..payload.len() - 1]).unwrap();
        assert!(back.contains(Capability::MULTI_DOMAIN));
        assert_eq!(back.bits() & (1 << 40), 1 << 40);
    }

    #[test]
    fn garbage_payload_is_rejected() {
        assert!(decode_capability_payload(b"!!not-base64!!").is_err());
        assert!(decode_capability_payload(&[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn scanner_finds_clean_preamble() {
        let mut scanner = PreambleScanner::new();
        let tokens = scan(&mut scanner, PREAMBLE_CAPACITY);
        assert_eq!(tokens, vec![PreambleToken::Capacity]);
        assert!(scanner.noise().is_empty());
    }

    #[test]
    fn scanner_discards_leading_banner() {
        let mut data = b"Warning: your shell printed this\r\n".to_vec();
        data.extend_from_slice(PREAMBLE_BINARY);

        let mut scanner = PreambleScanner::new();
        let tokens = scan(&mut scanner, &data);
        assert_eq!(tokens, vec![PreambleToken::Mode(WireMode::Binary)]);
        assert_eq!(scanner.noise(), b"Warning: your shell printed this\r\n");
    }

    #[test]
    fn scanner_survives_near_miss_prefixes() {
        // A truncated preamble followed by the real thing.
        let mut data = b"<===[TETHER REMO".to_vec();
        data.extend_from_slice(PREAMBLE_TEXT);

        let mut scanner = PreambleScanner::new();
        let tokens = scan(&mut scanner, &data);
        assert_eq!(tokens, vec![PreambleToken::Mode(WireMode::Text)]);
        assert_eq!(scanner.take_noise(), b"<===[TETHER REMO".to_vec());
    }

    #[test]
    fn scanner_finds_both_preambles_in_sequence() {
        let mut data = Vec::new();
        data.extend_from_slice(PREAMBLE_CAPACITY);
        data.extend_from_slice(b"AAAA\n");
        data.extend_from_slice(PREAMBLE_BINARY);

        let mut scanner = PreambleScanner::new();
        let mut tokens = Vec::new();
        for &b in &data {
            if let Some(t) = scanner.push(b) {
                tokens.push(t);
            }
        }
        // The Base64 line between the preambles is consumed by the
        // handshake, not the scanner, but the scanner must still not choke
        // on it.
        assert_eq!(tokens, vec![PreambleToken::Capacity, PreambleToken::Mode(WireMode::Binary)]);
    }

    #[test]
    fn mode_preference_pinning() {
        assert_eq!(ModePreference::Negotiate.pinned(), None);
        assert_eq!(ModePreference::Binary.pinned(), Some(WireMode::Binary));
        assert_eq!(ModePreference::Text.pinned(), Some(WireMode::Text));
        assert_eq!(ModePreference::Negotiate.emitted(), WireMode::Binary);
        assert_eq!(ModePreference::Text.emitted(), WireMode::Text);
    }
}
