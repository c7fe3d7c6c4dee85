use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::trace;
use crate::daemon::DtpcHandle;
use crate::endpoint::EndpointId;
use crate::transport::{BundleTransport, OutboundBundle, ReceivedBundle};

/// Records all submitted bundles for later verification
#[derive(Debug, Default)]
pub struct TrackingTransport {
    tracker: RwLock<Vec<OutboundBundle>>,
    rejecting: AtomicBool,
}
impl TrackingTransport {
    pub fn new() -> TrackingTransport {
        TrackingTransport::default()
    }

    /// While set, all submissions are refused
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::Release);
    }

    /// Removes the oldest recorded bundle, verifying its destination and payload
    pub async fn assert_bundle_sent(&self, dest: &EndpointId, payload: &[u8]) -> OutboundBundle {
        let mut lock = self.tracker.write().await;
        if lock.is_empty() {
            panic!("no bundle was sent");
        }

        let actual = lock.remove(0);
        assert_eq!(&actual.dest, dest);
        assert_eq!(actual.payload.as_ref(), payload);
        actual
    }

    pub async fn assert_no_remaining_bundles(&self) {
        let lock = self.tracker.read().await;
        assert!(lock.is_empty(), "unexpected bundles: {:?}", lock);
    }

    pub async fn sent_count(&self) -> usize {
        self.tracker.read().await.len()
    }
}

#[async_trait]
impl BundleTransport for TrackingTransport {
    async fn submit_for_delivery(&self, bundle: OutboundBundle) -> anyhow::Result<()> {
        if self.rejecting.load(Ordering::Acquire) {
            bail!("transport refused bundle for {:?}", bundle.dest);
        }
        self.tracker.write().await.push(bundle);
        Ok(())
    }
}

pub type DropFilter = Box<dyn Fn(&OutboundBundle) -> bool + Send + Sync>;

/// Delivers bundles directly to other in-process daemons. Routes are matched on the exact
///  endpoint first, and on the node number for `ipn` endpoints.
#[derive(Default)]
pub struct LoopbackTransport {
    routes: RwLock<FxHashMap<EndpointId, DtpcHandle>>,
    drop_filter: RwLock<Option<DropFilter>>,
}
impl LoopbackTransport {
    pub fn new() -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport::default())
    }

    pub async fn add_route(&self, eid: EndpointId, handle: DtpcHandle) {
        self.routes.write().await.insert(eid, handle);
    }

    /// Bundles matching the filter are silently lost
    pub async fn set_drop_filter(&self, filter: Option<DropFilter>) {
        *self.drop_filter.write().await = filter;
    }

    async fn route(&self, dest: &EndpointId) -> Option<DtpcHandle> {
        let routes = self.routes.read().await;
        if let Some(handle) = routes.get(dest) {
            return Some(handle.clone());
        }
        let (node, _) = dest.ipn_parts()?;
        routes.iter()
            .find(|(eid, _)| eid.ipn_parts().map(|(n, _)| n) == Some(node))
            .map(|(_, handle)| handle.clone())
    }
}

#[async_trait]
impl BundleTransport for LoopbackTransport {
    async fn submit_for_delivery(&self, bundle: OutboundBundle) -> anyhow::Result<()> {
        if let Some(filter) = self.drop_filter.read().await.as_ref() {
            if filter(&bundle) {
                trace!("loopback: dropping bundle for {:?}", bundle.dest);
                return Ok(());
            }
        }

        let Some(handle) = self.route(&bundle.dest).await else {
            bail!("no route to {:?}", bundle.dest);
        };
        handle.bundle_received(ReceivedBundle {
            source: bundle.source,
            creation_ts: bundle.creation_ts,
            expiration_secs: bundle.expiration_secs,
            payload: bundle.payload,
        }).await?;
        Ok(())
    }
}
