//! Source domains: the per-peer type namespaces payloads are tagged with.
//!
//! A domain is an opaque integer id plus a way to fetch artifacts by name
//! from whoever owns it. A peer publishes a domain by exporting a
//! [`DomainExport`] object; the other side reaches it through an ordinary
//! proxy and the `fetch` method, backed by the embedder's
//! [`ArtifactResolver`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{well_known, CallError, RemoteError};
use crate::marshal::Oid;
use crate::object::{CallArgs, DispatchTable, Proxy, RemoteObject, ReturnValue};

/// External cache interface for on-demand artifact fetch. The engine never
/// interprets the bytes; it only moves them.
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<Vec<u8>, RemoteError>;
}

pub const DOMAIN_INTERFACE: &str = "tether.Domain";

/// The exported face of a local domain.
pub struct DomainExport;

impl DomainExport {
    /// Build the dispatch table serving `fetch` from `resolver`.
    pub fn table(resolver: Arc<dyn ArtifactResolver>) -> Arc<dyn RemoteObject> {
        Arc::new(DispatchTable::new(DOMAIN_INTERFACE).method("fetch", move |_cx, args: CallArgs| {
            let resolver = resolver.clone();
            async move {
                let name: String = args.value(0)?;
                let bytes = resolver.fetch(&name).await?;
                ReturnValue::of(&bytes)
            }
        }))
    }
}

/// A peer domain this side has seen in payload tags, reachable through its
/// proxy.
#[derive(Clone)]
pub struct ImportedDomain {
    proxy: Proxy,
}

impl ImportedDomain {
    pub fn new(proxy: Proxy) -> Self {
        ImportedDomain { proxy }
    }

    /// Fetch an artifact by name from the owning peer.
    pub async fn fetch(&self, name: &str) -> Result<Vec<u8>, CallError> {
        self.proxy.invoke("fetch").internal().arg(&name.to_string()).call().await
    }

    pub fn oid(&self) -> Oid {
        self.proxy.oid()
    }
}

/// Table of peer domains observed on this channel, keyed by the oid in
/// their payload tags. Proxies are created lazily, once per domain.
pub struct DomainRegistry {
    imported: Mutex<HashMap<Oid, ImportedDomain>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        DomainRegistry { imported: Mutex::new(HashMap::new()) }
    }

    pub fn lookup(&self, oid: Oid) -> Option<ImportedDomain> {
        self.imported.lock().get(&oid).cloned()
    }

    pub fn record(&self, oid: Oid, make_proxy: impl FnOnce() -> Proxy) -> ImportedDomain {
        let mut imported = self.imported.lock();
        imported
            .entry(oid)
            .or_insert_with(|| ImportedDomain::new(make_proxy()))
            .clone()
    }

    pub fn clear(&self) {
        self.imported.lock().clear();
    }
}

impl Default for DomainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolver that refuses everything; the default when the embedder wires no
/// cache in.
pub struct NoArtifacts;

#[async_trait]
impl ArtifactResolver for NoArtifacts {
    async fn fetch(&self, name: &str) -> Result<Vec<u8>, RemoteError> {
        Err(RemoteError::new(
            well_known::UNKNOWN_OBJECT,
            format!("no artifact resolver configured, cannot serve '{}'", name),
        ))
    }
}
