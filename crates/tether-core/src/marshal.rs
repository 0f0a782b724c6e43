//! Payload marshalling: value bytes wrapped in an envelope that names the
//! value's type and the source domain it belongs to.
//!
//! Envelope layout: a one-byte domain tag, an oid varint for exported/local
//! domains, the type name (varint length + UTF-8), then the postcard body.
//! Tag bytes are negative so they cannot collide with back-reference
//! indexes in legacy streams:
//!
//! - `-3` system domain
//! - `-2` exported domain (sender publishes its domain via the export table)
//! - `-1` local domain (the receiver's own domain, previously exported from
//!   this side)
//! - `0..=127` back-reference to a domain already seen in this stream
//!
//! The back-reference table is forgotten on [`Marshaller::reset`]; the
//! channel resets after every command except the final one, and the
//! receiving side mirrors that, so the two tables stay in lockstep and
//! memory does not grow with the stream.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::options::NameFilter;

pub type Oid = u32;

const TAG_SYSTEM: i8 = -3;
const TAG_EXPORTED: i8 = -2;
const TAG_LOCAL: i8 = -1;
const MAX_BACKREFS: usize = 128;

/// Identifies whose type namespace a payload was produced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceDomain {
    /// Types both sides know statically.
    System,
    /// A domain the sender has published through its export table; the
    /// receiver can fetch unknown artifacts from it on demand.
    Exported(Oid),
    /// A domain the receiver itself exported earlier; resolve with local
    /// types.
    Local(Oid),
}

/// One marshalled value as it travels inside a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePayload {
    pub bytes: Vec<u8>,
}

/// A payload whose envelope has been validated and opened.
#[derive(Debug, Clone)]
pub struct OpenedPayload {
    pub domain: SourceDomain,
    pub type_name: String,
    body: Vec<u8>,
}

impl OpenedPayload {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MarshalError> {
        postcard::from_bytes(&self.body).map_err(MarshalError::Postcard)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

#[derive(Debug)]
pub enum MarshalError {
    Postcard(postcard::Error),
    /// The name filter refused a type during decode. Serialization-fatal.
    Rejected { type_name: String },
    /// Unrecognized domain tag byte.
    BadTag(i8),
    /// Back-reference index past the end of the seen-domain table.
    BackrefOutOfRange(u8),
    /// The envelope ended mid-field.
    Truncated,
    /// The embedded type name was not UTF-8.
    NameEncoding,
    /// A non-system domain was used while the peer only speaks
    /// single-domain payloads.
    DomainUnsupported,
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalError::Postcard(e) => write!(f, "payload body: {}", e),
            MarshalError::Rejected { type_name } => {
                write!(f, "type '{}' rejected by the name filter", type_name)
            }
            MarshalError::BadTag(tag) => write!(f, "unrecognized domain tag {}", tag),
            MarshalError::BackrefOutOfRange(idx) => {
                write!(f, "domain back-reference {} out of range", idx)
            }
            MarshalError::Truncated => write!(f, "payload envelope truncated"),
            MarshalError::NameEncoding => write!(f, "type name is not UTF-8"),
            MarshalError::DomainUnsupported => {
                write!(f, "peer does not support multi-domain payloads")
            }
        }
    }
}

impl std::error::Error for MarshalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MarshalError::Postcard(e) => Some(e),
            _ => None,
        }
    }
}

impl From<postcard::Error> for MarshalError {
    fn from(e: postcard::Error) -> Self {
        MarshalError::Postcard(e)
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(data: &[u8]) -> Result<(u32, usize), MarshalError> {
    let mut value: u32 = 0;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate().take(5) {
        value |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(MarshalError::Truncated)
}

fn envelope(tag: i8, oid: Option<Oid>, type_name: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 5 + type_name.len() + body.len());
    out.push(tag as u8);
    if let Some(oid) = oid {
        write_varint(&mut out, oid);
    }
    write_varint(&mut out, type_name.len() as u32);
    out.extend_from_slice(type_name.as_bytes());
    out.extend_from_slice(body);
    out
}

/// Marshal a value in the system domain. System payloads never touch the
/// back-reference table, so this needs no marshaller state.
pub fn encode_value<T: Serialize>(value: &T) -> Result<WirePayload, MarshalError> {
    encode_named(std::any::type_name::<T>(), value)
}

/// Marshal a value in the system domain under an explicit type name.
pub fn encode_named<T: Serialize>(type_name: &str, value: &T) -> Result<WirePayload, MarshalError> {
    let body = postcard::to_allocvec(value)?;
    Ok(WirePayload { bytes: envelope(TAG_SYSTEM, None, type_name, &body) })
}

/// Send-side state for non-system domains: the per-stream table of domains
/// already written, enabling back-references.
pub struct Marshaller {
    multi_domain: bool,
    seen: Vec<SourceDomain>,
}

impl Marshaller {
    pub fn new(multi_domain: bool) -> Self {
        Marshaller { multi_domain, seen: Vec::new() }
    }

    pub fn encode<T: Serialize>(
        &mut self,
        domain: SourceDomain,
        type_name: &str,
        value: &T,
    ) -> Result<WirePayload, MarshalError> {
        let body = postcard::to_allocvec(value)?;
        match domain {
            SourceDomain::System => {
                Ok(WirePayload { bytes: envelope(TAG_SYSTEM, None, type_name, &body) })
            }
            _ if !self.multi_domain => Err(MarshalError::DomainUnsupported),
            _ => {
                if let Some(idx) = self.seen.iter().position(|d| *d == domain) {
                    return Ok(WirePayload {
                        bytes: envelope(idx as i8, None, type_name, &body),
                    });
                }
                if self.seen.len() < MAX_BACKREFS {
                    self.seen.push(domain);
                }
                let (tag, oid) = match domain {
                    SourceDomain::Exported(oid) => (TAG_EXPORTED, oid),
                    SourceDomain::Local(oid) => (TAG_LOCAL, oid),
                    SourceDomain::System => unreachable!(),
                };
                Ok(WirePayload { bytes: envelope(tag, Some(oid), type_name, &body) })
            }
        }
    }

    /// Forget per-stream back-references. Driven after every command except
    /// the final one, mirrored on the receiving side.
    pub fn reset(&mut self) {
        self.seen.clear();
    }
}

/// Receive-side envelope opener: validates the domain tag, maintains the
/// mirrored back-reference table, and consults the name filter on every
/// type name it resolves.
pub struct Unmarshaller {
    filter: Arc<dyn NameFilter>,
    seen: Vec<SourceDomain>,
}

impl Unmarshaller {
    pub fn new(filter: Arc<dyn NameFilter>) -> Self {
        Unmarshaller { filter, seen: Vec::new() }
    }

    pub fn open(&mut self, payload: &WirePayload) -> Result<OpenedPayload, MarshalError> {
        let data = &payload.bytes;
        if data.is_empty() {
            return Err(MarshalError::Truncated);
        }
        let tag = data[0] as i8;
        let mut pos = 1usize;
        let domain = match tag {
            TAG_SYSTEM => SourceDomain::System,
            TAG_EXPORTED | TAG_LOCAL => {
                let (oid, used) = read_varint(&data[pos..])?;
                pos += used;
                let domain = if tag == TAG_EXPORTED {
                    SourceDomain::Exported(oid)
                } else {
                    SourceDomain::Local(oid)
                };
                if self.seen.len() < MAX_BACKREFS {
                    self.seen.push(domain);
                }
                domain
            }
            idx if idx >= 0 => *self
                .seen
                .get(idx as usize)
                .ok_or(MarshalError::BackrefOutOfRange(idx as u8))?,
            bad => return Err(MarshalError::BadTag(bad)),
        };

        let (name_len, used) = read_varint(&data[pos..])?;
        pos += used;
        let name_end = pos.checked_add(name_len as usize).ok_or(MarshalError::Truncated)?;
        if name_end > data.len() {
            return Err(MarshalError::Truncated);
        }
        let type_name = std::str::from_utf8(&data[pos..name_end])
            .map_err(|_| MarshalError::NameEncoding)?
            .to_string();

        if !self.filter.accept(&type_name) {
            return Err(MarshalError::Rejected { type_name });
        }

        Ok(OpenedPayload { domain, type_name, body: data[name_end..].to_vec() })
    }

    /// Mirror of [`Marshaller::reset`].
    pub fn reset(&mut self) {
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::AcceptAll;

    fn unmarshaller() -> Unmarshaller {
        Unmarshaller::new(Arc::new(AcceptAll))
    }

    #[test]
    fn system_payload_round_trip() {
        let payload = encode_value(&42i32).unwrap();
        assert_eq!(payload.bytes[0] as i8, TAG_SYSTEM);

        let mut u = unmarshaller();
        let opened = u.open(&payload).unwrap();
        assert_eq!(opened.domain, SourceDomain::System);
        assert_eq!(opened.type_name, "i32");
        assert_eq!(opened.decode::<i32>().unwrap(), 42);
    }

    #[test]
    fn tag_bytes_are_the_specified_values() {
        let system = encode_value(&0u8).unwrap();
        assert_eq!(system.bytes[0], 0xFD); // -3

        let mut m = Marshaller::new(true);
        let exported = m.encode(SourceDomain::Exported(9), "x", &0u8).unwrap();
        assert_eq!(exported.bytes[0], 0xFE); // -2
        m.reset();
        let local = m.encode(SourceDomain::Local(9), "x", &0u8).unwrap();
        assert_eq!(local.bytes[0], 0xFF); // -1
    }

    #[test]
    fn second_use_of_a_domain_becomes_a_backref() {
        let mut m = Marshaller::new(true);
        let first = m.encode(SourceDomain::Exported(7), "a", &1u8).unwrap();
        let second = m.encode(SourceDomain::Exported(7), "b", &2u8).unwrap();
        assert_eq!(first.bytes[0], 0xFE);
        assert_eq!(second.bytes[0], 0x00); // index 0

        let mut u = unmarshaller();
        let a = u.open(&first).unwrap();
        let b = u.open(&second).unwrap();
        assert_eq!(a.domain, SourceDomain::Exported(7));
        assert_eq!(b.domain, SourceDomain::Exported(7));
        assert_eq!(b.type_name, "b");
    }

    #[test]
    fn reset_forgets_backrefs_on_both_sides() {
        let mut m = Marshaller::new(true);
        let _ = m.encode(SourceDomain::Exported(7), "a", &1u8).unwrap();
        m.reset();
        let after = m.encode(SourceDomain::Exported(7), "a", &1u8).unwrap();
        // Written in full again, not as a backref.
        assert_eq!(after.bytes[0], 0xFE);

        let mut u = unmarshaller();
        let _ = u.open(&after).unwrap();
        u.reset();
        // A backref now dangles: the mirrored table was cleared.
        let dangling = WirePayload { bytes: envelope(0, None, "a", &[1]) };
        assert!(matches!(u.open(&dangling), Err(MarshalError::BackrefOutOfRange(0))));
    }

    #[test]
    fn single_domain_mode_refuses_foreign_domains() {
        let mut m = Marshaller::new(false);
        let err = m.encode(SourceDomain::Exported(3), "x", &0u8).unwrap_err();
        assert!(matches!(err, MarshalError::DomainUnsupported));
        // System still works.
        assert!(m.encode(SourceDomain::System, "x", &0u8).is_ok());
    }

    #[test]
    fn name_filter_rejection_aborts_decode() {
        struct DenyStrings;
        impl NameFilter for DenyStrings {
            fn accept(&self, type_name: &str) -> bool {
                !type_name.contains("String")
            }
        }

        let payload = encode_value(&String::from("nope")).unwrap();
        let mut u = Unmarshaller::new(Arc::new(DenyStrings));
        match u.open(&payload) {
            Err(MarshalError::Rejected { type_name }) => {
                assert!(type_name.contains("String"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn truncated_envelopes_are_detected() {
        let mut u = unmarshaller();
        assert!(matches!(u.open(&WirePayload { bytes: vec![] }), Err(MarshalError::Truncated)));
        // Tag says exported but the oid varint never terminates.
        assert!(u.open(&WirePayload { bytes: vec![0xFE, 0x80] }).is_err());
        // Name length runs past the end.
        assert!(u.open(&WirePayload { bytes: vec![0xFD, 10, b'a'] }).is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut u = unmarshaller();
        let err = u.open(&WirePayload { bytes: vec![(-7i8) as u8, 0] }).unwrap_err();
        assert!(matches!(err, MarshalError::BadTag(-7)));
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u32, 1, 127, 128, 300, 16_384, u32::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let (back, used) = read_varint(&buf).unwrap();
            assert_eq!(back, value);
            assert_eq!(used, buf.len());
        }
    }
}
