use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;
use crate::daemon::{DaemonEvent, DtpcStats};
use crate::endpoint::EndpointId;
use crate::error::{DtpcError, DtpcResult};
use crate::profile::Profile;
use crate::topic::{DataItem, TopicRegistration};
use crate::transport::ReceivedBundle;

/// The application and bundle layer's way into a running daemon. Handles are cheap to clone, and
///  all of them refer to the same daemon.
///
/// Requests are refused with [DtpcError::QueueFull] rather than waiting if the daemon is
///  overloaded. Received bundles are the exception: the bundle layer is slowed down instead.
#[derive(Clone, Debug)]
pub struct DtpcHandle {
    events: mpsc::Sender<DaemonEvent>,
}

impl DtpcHandle {
    pub(crate) fn new(events: mpsc::Sender<DaemonEvent>) -> DtpcHandle {
        DtpcHandle { events }
    }

    /// Registers the application as the consumer of a topic's data items. If `has_elision_func`
    ///  is set, the returned registration also receives elision requests that must be answered
    ///  through [DtpcHandle::elision_func_response].
    pub async fn register_topic(&self, topic_id: u32, has_elision_func: bool) -> DtpcResult<TopicRegistration> {
        self.request(|reply| DaemonEvent::RegisterTopic { topic_id, has_elision_func, reply }).await
    }

    pub async fn unregister_topic(&self, topic_id: u32) -> DtpcResult<()> {
        self.request(|reply| DaemonEvent::UnregisterTopic { topic_id, reply }).await
    }

    /// Completes when the data item was queued (or sent, if that was triggered by this item).
    pub async fn send_data_item(&self, topic_id: u32, dest_eid: EndpointId, profile_id: u32, data: impl Into<Bytes>) -> DtpcResult<()> {
        let data = data.into();
        trace!("send_data_item: topic {} to {:?}, {} bytes", topic_id, dest_eid, data.len());
        self.request(|reply| DaemonEvent::SendDataItem { topic_id, dest_eid, profile_id, data, reply }).await
    }

    /// Answers an elision request. `items` replaces the queued data items if `modified` is set,
    ///  and is ignored otherwise.
    pub async fn elision_func_response(&self, topic_id: u32, dest_eid: EndpointId, profile_id: u32, modified: bool, items: Vec<DataItem>) -> DtpcResult<()> {
        self.post(DaemonEvent::ElisionFuncResponse { topic_id, dest_eid, profile_id, modified, items })
    }

    pub async fn add_profile(&self, profile: Profile) -> DtpcResult<()> {
        self.request(|reply| DaemonEvent::AddProfile { profile, reply }).await
    }

    pub async fn delete_profile(&self, profile_id: u32) -> DtpcResult<()> {
        self.request(|reply| DaemonEvent::DeleteProfile { profile_id, reply }).await
    }

    pub async fn add_topic(&self, topic_id: u32, description: impl Into<String>) -> DtpcResult<()> {
        let description = description.into();
        self.request(|reply| DaemonEvent::AddTopic { topic_id, description, reply }).await
    }

    pub async fn delete_topic(&self, topic_id: u32) -> DtpcResult<()> {
        self.request(|reply| DaemonEvent::DeleteTopic { topic_id, reply }).await
    }

    /// Entry point for the bundle layer
    pub async fn bundle_received(&self, bundle: ReceivedBundle) -> DtpcResult<()> {
        self.events.send(DaemonEvent::BundleReceived(bundle)).await
            .map_err(|_| DtpcError::ShuttingDown)
    }

    pub async fn stats(&self) -> DtpcResult<DtpcStats> {
        self.request(|reply| DaemonEvent::Stats { reply }).await
    }

    /// Stops the daemon and all its aggregators. Durable state is kept for the next start.
    pub async fn shutdown(&self) -> DtpcResult<()> {
        let (reply, result) = oneshot::channel();
        self.events.send(DaemonEvent::Shutdown { reply }).await
            .map_err(|_| DtpcError::ShuttingDown)?;
        result.await
            .map_err(|_| DtpcError::ShuttingDown)
    }

    fn post(&self, event: DaemonEvent) -> DtpcResult<()> {
        self.events.try_send(event)
            .map_err(|e| match e {
                TrySendError::Full(_) => DtpcError::QueueFull,
                TrySendError::Closed(_) => DtpcError::ShuttingDown,
            })
    }

    async fn request<T>(&self, event: impl FnOnce(oneshot::Sender<DtpcResult<T>>) -> DaemonEvent) -> DtpcResult<T> {
        let (reply, result) = oneshot::channel();
        self.post(event(reply))?;
        result.await
            .unwrap_or(Err(DtpcError::ShuttingDown))
    }
}
