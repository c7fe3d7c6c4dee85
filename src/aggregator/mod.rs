//! Send side of the engine: one [PayloadAggregator] per `(destination, profile)`, each running as
//!  its own task and fed through an [AggregatorHandle].
//!
//! An aggregator collects data items per topic until its profile's size or time limit triggers a
//!  flush, and then sends all of them as a single data PDU:
//!
//! ```ascii
//! +--------+----------------+----------------+-----
//! | header | topic block 7  | topic block 9  | ...
//! +--------+----------------+----------------+-----
//! ```
//!
//! While a topic's elision function is working on a snapshot of its queue, the aggregator does
//!  not accept new data items or flush. Such events are deferred and replayed in order once the
//!  response arrived.

pub mod payload_aggregator;
pub mod topic_aggregator;

use std::collections::VecDeque;
use std::sync::Arc;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use crate::aggregator::payload_aggregator::{AggregatorContext, PayloadAggregator};
use crate::endpoint::AggregationKey;
use crate::error::{DtpcError, DtpcResult};
use crate::pdu::ProtocolDataUnit;
use crate::profile::{Profile, ProfileTable};
use crate::topic::{DataItem, ElisionRequest};

#[derive(Debug)]
pub enum AggregatorEvent {
    SendDataItem {
        item: DataItem,
        profile: Arc<Profile>,
        elision: Option<mpsc::UnboundedSender<ElisionRequest>>,
        reply: oneshot::Sender<DtpcResult<()>>,
    },
    ElisionResponse {
        topic_id: u32,
        modified: bool,
        items: Vec<DataItem>,
    },
    TimerExpired {
        seq_ctr: u64,
        generation: u64,
    },
    Retransmit {
        pdu: ProtocolDataUnit,
        profile: Arc<Profile>,
    },
    Shutdown,
}

pub struct AggregatorHandle {
    key: AggregationKey,
    events: mpsc::UnboundedSender<AggregatorEvent>,
    task: JoinHandle<()>,
}

impl AggregatorHandle {
    pub fn spawn(key: AggregationKey, profile: Arc<Profile>, ctx: Arc<AggregatorContext>) -> AggregatorHandle {
        let (send, recv) = mpsc::unbounded_channel();
        let aggregator = PayloadAggregator::new(key, profile, send.clone(), ctx);
        Self::start(aggregator, send, recv)
    }

    /// Restores an aggregator from its durable record and starts it
    pub fn spawn_reloaded(record: &Bytes, profiles: &ProfileTable, ctx: Arc<AggregatorContext>) -> anyhow::Result<AggregatorHandle> {
        let (send, recv) = mpsc::unbounded_channel();
        let aggregator = PayloadAggregator::reload(record, profiles, send.clone(), ctx)?;
        Ok(Self::start(aggregator, send, recv))
    }

    fn start(aggregator: PayloadAggregator, send: mpsc::UnboundedSender<AggregatorEvent>, recv: mpsc::UnboundedReceiver<AggregatorEvent>) -> AggregatorHandle {
        let key = aggregator.key().clone();
        let task = tokio::spawn(run_payload_aggregator(aggregator, recv));
        AggregatorHandle { key, events: send, task }
    }

    pub fn key(&self) -> &AggregationKey {
        &self.key
    }

    pub fn post(&self, event: AggregatorEvent) {
        if let Err(e) = self.events.send(event) {
            warn!("payload aggregator {} has terminated - dropping event", self.key);
            if let AggregatorEvent::SendDataItem { reply, .. } = e.0 {
                let _ = reply.send(Err(DtpcError::ShuttingDown));
            }
        }
    }

    /// Stops the aggregator, waiting for it to finish the event it is currently processing
    pub async fn shutdown(self) {
        let _ = self.events.send(AggregatorEvent::Shutdown);
        if let Err(e) = self.task.await {
            warn!("payload aggregator {} terminated abnormally: {}", self.key, e);
        }
    }
}

async fn run_payload_aggregator(mut aggregator: PayloadAggregator, mut events: mpsc::UnboundedReceiver<AggregatorEvent>) {
    let mut deferred = VecDeque::new();

    loop {
        let replayed = if aggregator.is_awaiting_elision() { None } else { deferred.pop_front() };
        let event = match replayed {
            Some(event) => event,
            None => match events.recv().await {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            event @ (AggregatorEvent::SendDataItem { .. } | AggregatorEvent::TimerExpired { .. }) if aggregator.is_awaiting_elision() => {
                trace!("deferring event for {} until the elision function responded", aggregator.key());
                deferred.push_back(event);
            }
            AggregatorEvent::SendDataItem { item, profile, elision, reply } => {
                let result = aggregator.send_data_item(item, profile, elision).await;
                let _ = reply.send(result);
            }
            AggregatorEvent::ElisionResponse { topic_id, modified, items } => {
                aggregator.elision_func_response(topic_id, modified, items).await;
            }
            AggregatorEvent::TimerExpired { seq_ctr, generation } => {
                aggregator.timer_expired(seq_ctr, generation).await;
            }
            AggregatorEvent::Retransmit { pdu, profile } => {
                aggregator.retransmit_pdu(pdu, profile).await;
            }
            AggregatorEvent::Shutdown => break,
        }
    }

    debug!("shutting down payload aggregator {}", aggregator.key());
    aggregator.shutdown();
    for event in deferred {
        if let AggregatorEvent::SendDataItem { reply, .. } = event {
            let _ = reply.send(Err(DtpcError::ShuttingDown));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::time;
    use crate::endpoint::EndpointId;
    use crate::store::MemoryStore;
    use crate::test_util::transport::TrackingTransport;
    use crate::util::clock::DtnClock;
    use super::*;

    fn dest() -> EndpointId {
        EndpointId::ipn(2, 129)
    }

    fn item(data: &'static [u8]) -> DataItem {
        DataItem::new(dest(), 7, Bytes::from_static(data))
    }

    fn send_item(handle: &AggregatorHandle, profile: &Arc<Profile>, data: &'static [u8], elision: Option<mpsc::UnboundedSender<ElisionRequest>>) -> oneshot::Receiver<DtpcResult<()>> {
        let (reply, result) = oneshot::channel();
        handle.post(AggregatorEvent::SendDataItem { item: item(data), profile: profile.clone(), elision, reply });
        result
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_deferred_while_awaiting_elision() {
        let transport = Arc::new(TrackingTransport::new());
        let (daemon_events, _daemon_recv) = mpsc::unbounded_channel();
        let ctx = Arc::new(AggregatorContext {
            local_eid: EndpointId::ipn(1, 129),
            clock: DtnClock::starting_at(1000),
            transport: transport.clone(),
            store: Arc::new(MemoryStore::new()),
            daemon_events,
        });
        let profile = Arc::new(Profile {
            aggregation_size_limit: 3,
            aggregation_time_limit: 60,
            ..Profile::new(1, 30)
        });
        let handle = AggregatorHandle::spawn(AggregationKey::new(dest(), 1), profile.clone(), ctx);
        let (elision_send, mut elision_recv) = mpsc::unbounded_channel();

        let mut first = send_item(&handle, &profile, b"ab", Some(elision_send.clone()));
        let mut second = send_item(&handle, &profile, b"cd", Some(elision_send));
        time::sleep(Duration::from_millis(1)).await;

        assert_eq!(first.try_recv(), Ok(Ok(())));
        assert!(second.try_recv().is_err());
        assert_eq!(elision_recv.try_recv().unwrap().items, vec![item(b"ab")]);
        assert!(elision_recv.try_recv().is_err());

        handle.post(AggregatorEvent::ElisionResponse { topic_id: 7, modified: false, items: Vec::new() });
        time::sleep(Duration::from_millis(1)).await;

        // the deferred item was processed and is now waiting for its own elision response
        assert_eq!(second.try_recv(), Ok(Ok(())));
        assert_eq!(elision_recv.try_recv().unwrap().items, vec![item(b"ab"), item(b"cd")]);
        transport.assert_no_remaining_bundles().await;

        handle.post(AggregatorEvent::ElisionResponse { topic_id: 7, modified: false, items: Vec::new() });
        time::sleep(Duration::from_millis(1)).await;
        transport.assert_bundle_sent(&dest(), &[0x00, 0x01, 0x00, 7, 2, 2, b'a', b'b', 2, b'c', b'd']).await;

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_deferred_items() {
        let (daemon_events, _daemon_recv) = mpsc::unbounded_channel();
        let ctx = Arc::new(AggregatorContext {
            local_eid: EndpointId::ipn(1, 129),
            clock: DtnClock::starting_at(1000),
            transport: Arc::new(TrackingTransport::new()),
            store: Arc::new(MemoryStore::new()),
            daemon_events,
        });
        let profile = Arc::new(Profile {
            aggregation_size_limit: 100,
            aggregation_time_limit: 60,
            ..Profile::new(1, 30)
        });
        let handle = AggregatorHandle::spawn(AggregationKey::new(dest(), 1), profile.clone(), ctx);
        let (elision_send, _elision_recv) = mpsc::unbounded_channel();

        let first = send_item(&handle, &profile, b"ab", Some(elision_send.clone()));
        let second = send_item(&handle, &profile, b"cd", Some(elision_send));
        handle.shutdown().await;

        assert_eq!(first.await, Ok(Ok(())));
        assert_eq!(second.await, Ok(Err(DtpcError::ShuttingDown)));
    }
}
