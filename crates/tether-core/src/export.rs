//! The export table: oid → local object, with reference-counted lifetimes
//! and enough diagnostics to explain a dangling reference after the fact.
//!
//! Ids are assigned monotonically from 1 and never reused; id 0 is reserved
//! and never appears in the table. Re-exporting an object already present
//! bumps its reference count and merges the advertised interface set.
//! Unexporting an absent oid is logged and tolerated, because reordered
//! teardown legitimately produces double-unexports.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{capture_trace, well_known, RemoteError};
use crate::marshal::Oid;
use crate::object::RemoteObject;
use crate::pipe::PipeSink;

/// Refcount used by [`ExportTable::pin`]: high enough that accidental
/// over-release cannot reclaim the entry.
const PINNED: u32 = u32::MAX / 2;

struct Entry {
    object: Arc<dyn RemoteObject>,
    interfaces: BTreeSet<String>,
    ref_count: u32,
    created_at: Option<String>,
}

/// A recently evicted entry, kept in a bounded ring for diagnostics.
#[derive(Debug, Clone)]
pub struct UnexportRecord {
    pub oid: Oid,
    pub interfaces: Vec<String>,
    pub created_at: Option<String>,
    pub released_at: Option<String>,
    pub reason: String,
}

/// Collects the oids exported while encoding one request's arguments, so
/// they can be released together when the call returns.
#[derive(Debug, Default)]
pub struct ExportRecorder {
    oids: Vec<Oid>,
}

impl ExportRecorder {
    pub fn new() -> Self {
        ExportRecorder::default()
    }

    pub fn record(&mut self, oid: Oid) {
        self.oids.push(oid);
    }

    pub fn take(&mut self) -> Vec<Oid> {
        std::mem::take(&mut self.oids)
    }

    pub fn is_empty(&self) -> bool {
        self.oids.is_empty()
    }
}

struct Inner {
    next_oid: Oid,
    entries: HashMap<Oid, Entry>,
    /// Reverse map from object identity (pointer) to oid, for reuse.
    by_identity: HashMap<usize, Oid>,
    unexport_log: VecDeque<UnexportRecord>,
}

pub struct ExportTable {
    record_origin: bool,
    log_size: usize,
    inner: Mutex<Inner>,
}

fn identity(obj: &Arc<dyn RemoteObject>) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

impl ExportTable {
    pub fn new(first_oid: Oid, record_origin: bool, log_size: usize) -> Self {
        ExportTable {
            record_origin,
            log_size,
            inner: Mutex::new(Inner {
                next_oid: first_oid.max(1),
                entries: HashMap::new(),
                by_identity: HashMap::new(),
                unexport_log: VecDeque::new(),
            }),
        }
    }

    /// Publish `obj` (or add a reference to its existing entry) and return
    /// its oid. O(1).
    pub fn export(
        &self,
        obj: &Arc<dyn RemoteObject>,
        interfaces: &[String],
        recorder: Option<&mut ExportRecorder>,
    ) -> Oid {
        let mut inner = self.inner.lock();
        let key = identity(obj);
        let oid = match inner.by_identity.get(&key).copied() {
            Some(oid) => {
                let entry = inner.entries.get_mut(&oid).expect("identity map out of sync");
                entry.ref_count = entry.ref_count.saturating_add(1);
                entry.interfaces.extend(interfaces.iter().cloned());
                oid
            }
            None => {
                let oid = inner.next_oid;
                inner.next_oid += 1;
                let created_at = self.record_origin.then(capture_trace);
                inner.entries.insert(
                    oid,
                    Entry {
                        object: obj.clone(),
                        interfaces: interfaces.iter().cloned().collect(),
                        ref_count: 1,
                        created_at,
                    },
                );
                inner.by_identity.insert(key, oid);
                oid
            }
        };
        if let Some(rec) = recorder {
            rec.record(oid);
        }
        oid
    }

    /// Look up an exported object. Failure carries a diagnostic that names
    /// the most recent release of the oid, if it happened within the ring.
    pub fn get(&self, oid: Oid) -> Result<Arc<dyn RemoteObject>, RemoteError> {
        let inner = self.inner.lock();
        if let Some(entry) = inner.entries.get(&oid) {
            return Ok(entry.object.clone());
        }
        let mut message = format!("object {} is not exported", oid);
        if let Some(record) = inner.unexport_log.iter().rev().find(|r| r.oid == oid) {
            message.push_str(&format!(
                "; it was unexported ({}) with interfaces [{}]",
                record.reason,
                record.interfaces.join(", ")
            ));
            if let Some(released_at) = &record.released_at {
                message.push_str("\nreleased at:\n");
                message.push_str(released_at);
            }
        }
        Err(RemoteError::new(well_known::UNKNOWN_OBJECT, message))
    }

    /// Drop one reference; evict when the count reaches zero. Returns true
    /// if the oid was present. Unexport of an absent oid logs and returns
    /// false.
    pub fn unexport(&self, oid: Oid, reason: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&oid) else {
            warn!(oid, reason, "unexport of an oid that is not in the table");
            return false;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return true;
        }
        let entry = inner.entries.remove(&oid).expect("entry vanished under the lock");
        inner.by_identity.remove(&identity(&entry.object));
        let record = UnexportRecord {
            oid,
            interfaces: entry.interfaces.into_iter().collect(),
            created_at: entry.created_at,
            released_at: self.record_origin.then(capture_trace),
            reason: reason.to_string(),
        };
        inner.unexport_log.push_back(record);
        while inner.unexport_log.len() > self.log_size {
            inner.unexport_log.pop_front();
        }
        debug!(oid, reason, "unexported");
        true
    }

    /// Release each recorded oid once. Used when a call returns to drop the
    /// references taken for its stream arguments.
    pub fn release_all(&self, oids: &[Oid], reason: &str) {
        for &oid in oids {
            self.unexport(oid, reason);
        }
    }

    /// Force the refcount far above 1 so accidental over-release cannot
    /// reclaim the entry.
    pub fn pin(&self, oid: Oid) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&oid) {
            entry.ref_count = PINNED;
        }
    }

    /// Tear the table down: every exported pipe sink learns `cause` so its
    /// pending readers fail, then everything is dropped.
    pub fn abort(&self, cause: &RemoteError) {
        let sinks: Vec<Arc<dyn PipeSink>> = {
            let mut inner = self.inner.lock();
            let sinks =
                inner.entries.values().filter_map(|e| e.object.as_pipe_sink()).collect();
            inner.entries.clear();
            inner.by_identity.clear();
            sinks
        };
        for sink in sinks {
            sink.error(cause);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.inner.lock().entries.contains_key(&oid)
    }

    pub fn ref_count(&self, oid: Oid) -> Option<u32> {
        self.inner.lock().entries.get(&oid).map(|e| e.ref_count)
    }

    pub fn recent_unexports(&self) -> Vec<UnexportRecord> {
        self.inner.lock().unexport_log.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::object::{CallArgs, InvokeContext, ReturnValue};
    use async_trait::async_trait;

    struct Dummy;

    #[async_trait]
    impl RemoteObject for Dummy {
        fn interfaces(&self) -> Vec<String> {
            vec!["Dummy".into()]
        }

        async fn invoke(
            &self,
            _cx: InvokeContext,
            _method: &str,
            _args: CallArgs,
        ) -> Result<ReturnValue, RemoteError> {
            ReturnValue::unit()
        }
    }

    fn obj() -> Arc<dyn RemoteObject> {
        Arc::new(Dummy)
    }

    fn table() -> ExportTable {
        ExportTable::new(1, true, 16)
    }

    #[test]
    fn export_assigns_monotone_ids_from_one() {
        let t = table();
        let a = t.export(&obj(), &["A".into()], None);
        let b = t.export(&obj(), &["B".into()], None);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn re_export_of_same_object_reuses_oid_and_bumps_refcount() {
        let t = table();
        let o = obj();
        let a = t.export(&o, &["A".into()], None);
        let b = t.export(&o, &["B".into()], None);
        assert_eq!(a, b);
        assert_eq!(t.ref_count(a), Some(2));

        // One unexport keeps it alive, the second evicts.
        assert!(t.unexport(a, "test"));
        assert!(t.contains(a));
        assert!(t.unexport(a, "test"));
        assert!(!t.contains(a));
    }

    #[test]
    fn refcount_zero_means_out_of_table_and_in_the_ring() {
        let t = table();
        let oid = t.export(&obj(), &["A".into()], None);
        t.unexport(oid, "done");
        assert!(!t.contains(oid));
        let log = t.recent_unexports();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].oid, oid);
        assert_eq!(log[0].reason, "done");
        assert!(log[0].released_at.is_some());
    }

    #[test]
    fn unexport_of_missing_oid_is_a_logged_no_op() {
        let t = table();
        assert!(!t.unexport(99, "spurious"));
        // And again, still a no-op.
        assert!(!t.unexport(99, "spurious"));
    }

    #[test]
    fn re_export_after_release_gets_a_fresh_oid() {
        let t = table();
        let o = obj();
        let first = t.export(&o, &["A".into()], None);
        t.unexport(first, "test");
        let second = t.export(&o, &["A".into()], None);
        assert_ne!(first, second);
        assert!(second > first);
    }

    #[test]
    fn get_unknown_oid_names_the_recent_release() {
        let t = table();
        let oid = t.export(&obj(), &["Acme".into()], None);
        t.unexport(oid, "call returned");
        let err = match t.get(oid) {
            Err(e) => e,
            Ok(_) => panic!("expected get() to return an error"),
        };
        assert_eq!(err.type_name, well_known::UNKNOWN_OBJECT);
        assert!(err.message.contains("call returned"));
        assert!(err.message.contains("Acme"));
    }

    #[test]
    fn pin_survives_over_release() {
        let t = table();
        let oid = t.export(&obj(), &["A".into()], None);
        t.pin(oid);
        for _ in 0..64 {
            t.unexport(oid, "over-release");
        }
        assert!(t.contains(oid));
    }

    #[test]
    fn recorder_collects_for_release_all() {
        let t = table();
        let mut rec = ExportRecorder::new();
        let a = t.export(&obj(), &["A".into()], Some(&mut rec));
        let b = t.export(&obj(), &["B".into()], Some(&mut rec));
        assert_eq!(t.len(), 2);

        t.release_all(&rec.take(), "call returned");
        assert!(!t.contains(a));
        assert!(!t.contains(b));
        assert!(t.is_empty());
    }

    #[test]
    fn ring_is_bounded() {
        let t = ExportTable::new(1, false, 4);
        for _ in 0..10 {
            let oid = t.export(&obj(), &["A".into()], None);
            t.unexport(oid, "churn");
        }
        assert_eq!(t.recent_unexports().len(), 4);
    }

    #[test]
    fn origin_traces_are_optional() {
        let t = ExportTable::new(1, false, 4);
        let oid = t.export(&obj(), &["A".into()], None);
        t.unexport(oid, "test");
        let log = t.recent_unexports();
        assert!(log[0].created_at.is_none());
        assert!(log[0].released_at.is_none());
    }

    #[test]
    fn abort_clears_the_table() {
        let t = table();
        t.export(&obj(), &["A".into()], None);
        t.export(&obj(), &["B".into()], None);
        t.abort(&RemoteError::channel_closed());
        assert!(t.is_empty());
    }
}
