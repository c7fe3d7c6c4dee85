//! The daemon is the engine's central task. It owns profiles, topics, the data PDU collectors and
//!  the table of unacknowledged PDUs, and it routes everything else: application requests to
//!  payload aggregators, received bundles to collectors, and timer events to whoever armed them.
//!
//! ```ascii
//!  application ----> DtpcHandle ----+
//!                                   |            +--> PayloadAggregator (dest A, profile 1) --+
//!  bundle layer ---> DtpcHandle ----+--> daemon -+--> PayloadAggregator (dest B, profile 1) --+--> BundleTransport
//!                                   |     ^      |                                            |
//!  timers / aggregators ------------+     |      +--> DataPduCollector (source C, profile 2)  |
//!                                         +-------------- PduTransmitted, PduDeleteRequest ---+
//! ```
//!
//! All state changes are written through to the [DurableStore], and [DtpcDaemon::start] picks
//!  them up again.

mod handle;

pub use handle::DtpcHandle;

use std::sync::Arc;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::{select, time};
use tracing::{debug, error, info, trace, warn};
use crate::aggregator::payload_aggregator::AggregatorContext;
use crate::aggregator::{AggregatorEvent, AggregatorHandle};
use crate::collector::{CollectorContext, DataPduCollector, Reception};
use crate::config::DtpcConfig;
use crate::endpoint::{AggregationKey, EndpointId};
use crate::error::{DtpcError, DtpcResult};
use crate::pdu::header::PduHeader;
use crate::pdu::{ProtocolDataUnit, ReceivedPdu};
use crate::profile::{Profile, ProfileTable};
use crate::retransmit::UnackedPduTable;
use crate::store::{frame_record, unframe_record, DurableStore, StoreTable};
use crate::topic::{DataItem, ElisionRequest, Topic, TopicRegistration, TopicTable};
use crate::transport::{BundleTransport, OutboundBundle, ReceivedBundle};
use crate::util::clock::DtnClock;

const TOPIC_DESCRIPTION_REGISTRATION: &str = "<on the fly API topic registration>";
const TOPIC_DESCRIPTION_SEND: &str = "<on the fly SEND topic registration>";

pub enum DaemonEvent {
    RegisterTopic {
        topic_id: u32,
        has_elision_func: bool,
        reply: oneshot::Sender<DtpcResult<TopicRegistration>>,
    },
    UnregisterTopic {
        topic_id: u32,
        reply: oneshot::Sender<DtpcResult<()>>,
    },
    SendDataItem {
        topic_id: u32,
        dest_eid: EndpointId,
        profile_id: u32,
        data: Bytes,
        reply: oneshot::Sender<DtpcResult<()>>,
    },
    ElisionFuncResponse {
        topic_id: u32,
        dest_eid: EndpointId,
        profile_id: u32,
        modified: bool,
        items: Vec<DataItem>,
    },
    AddProfile {
        profile: Profile,
        reply: oneshot::Sender<DtpcResult<()>>,
    },
    DeleteProfile {
        profile_id: u32,
        reply: oneshot::Sender<DtpcResult<()>>,
    },
    AddTopic {
        topic_id: u32,
        description: String,
        reply: oneshot::Sender<DtpcResult<()>>,
    },
    DeleteTopic {
        topic_id: u32,
        reply: oneshot::Sender<DtpcResult<()>>,
    },
    BundleReceived(ReceivedBundle),
    Stats {
        reply: oneshot::Sender<DtpcResult<DtpcStats>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },

    /// a sequenced PDU is being sent or was resent
    PduTransmitted(ProtocolDataUnit),
    /// the transport refused a sequenced PDU's first transmission
    PduTransmitFailed {
        key: String,
    },
    /// a sequenced PDU was given up on
    PduDeleteRequest {
        key: String,
    },
    RetransmitTimerExpired {
        key: String,
        retransmit_count: u32,
    },
    DeliverTimerExpired {
        collector_key: AggregationKey,
        seq_ctr: u64,
    },
}

/// Counters since daemon start, plus the current sizes of the daemon's tables
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DtpcStats {
    pub events_processed: u64,
    /// sequenced PDUs only: best effort PDUs are not tracked after handing them to the transport
    pub pdus_sent: u64,
    pub pdus_retransmitted: u64,
    pub pdus_acked: u64,
    pub pdus_abandoned: u64,
    pub pdus_received: u64,
    pub pdus_delivered: u64,
    pub pdus_discarded: u64,
    pub acks_sent: u64,

    pub unacked_pdus: usize,
    pub payload_aggregators: usize,
    pub data_pdu_collectors: usize,
}

pub struct DtpcDaemon {
    config: Arc<DtpcConfig>,
    clock: DtnClock,
    profiles: ProfileTable,
    topics: TopicTable,
    aggregators: FxHashMap<AggregationKey, AggregatorHandle>,
    collectors: FxHashMap<AggregationKey, DataPduCollector>,
    unacked: UnackedPduTable,
    aggregator_ctx: Arc<AggregatorContext>,
    transport: Arc<dyn BundleTransport>,
    store: Arc<dyn DurableStore>,
    internal_events: mpsc::UnboundedSender<DaemonEvent>,
    stats: DtpcStats,
}

impl DtpcDaemon {
    /// Restores the daemon's durable state and spawns its event loop. Must be called from within
    ///  a tokio runtime.
    pub fn start(config: DtpcConfig, transport: Arc<dyn BundleTransport>, store: Arc<dyn DurableStore>) -> anyhow::Result<DtpcHandle> {
        config.validate()?;
        let config = Arc::new(config);
        let clock = DtnClock::new();

        let (api_send, api_recv) = mpsc::channel(config.event_queue_capacity);
        let (internal_send, internal_recv) = mpsc::unbounded_channel();

        let aggregator_ctx = Arc::new(AggregatorContext {
            local_eid: config.local_eid.clone(),
            clock,
            transport: transport.clone(),
            store: store.clone(),
            daemon_events: internal_send.clone(),
        });

        let mut daemon = DtpcDaemon {
            config,
            clock,
            profiles: ProfileTable::default(),
            topics: TopicTable::default(),
            aggregators: FxHashMap::default(),
            collectors: FxHashMap::default(),
            unacked: UnackedPduTable::new(internal_send.clone()),
            aggregator_ctx,
            transport,
            store,
            internal_events: internal_send,
            stats: DtpcStats::default(),
        };
        daemon.load()?;

        tokio::spawn(daemon.run(api_recv, internal_recv));
        Ok(DtpcHandle::new(api_send))
    }

    async fn run(mut self, mut api_events: mpsc::Receiver<DaemonEvent>, mut internal_events: mpsc::UnboundedReceiver<DaemonEvent>) {
        info!("DTPC daemon for {:?} started", self.config.local_eid);
        let mut sweep_ticks = time::interval(self.config.topic_expiration_check_interval);

        loop {
            let event = select! {
                // NB: a PDU must be tracked before its ACK is processed
                biased;
                Some(evt) = internal_events.recv() => evt,
                evt = api_events.recv() => match evt {
                    Some(evt) => evt,
                    None => {
                        debug!("all handles are gone");
                        break;
                    }
                },
                _ = sweep_ticks.tick() => {
                    self.remove_expired_topic_items();
                    continue;
                }
            };
            self.stats.events_processed += 1;

            if let DaemonEvent::Shutdown { reply } = event {
                self.shutdown().await;
                let _ = reply.send(());
                return;
            }
            self.on_event(event).await;
        }
        self.shutdown().await;
    }

    async fn on_event(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::RegisterTopic { topic_id, has_elision_func, reply } => {
                let _ = reply.send(self.register_topic(topic_id, has_elision_func));
            }
            DaemonEvent::UnregisterTopic { topic_id, reply } => {
                let _ = reply.send(self.unregister_topic(topic_id));
            }
            DaemonEvent::SendDataItem { topic_id, dest_eid, profile_id, data, reply } => {
                self.send_data_item(topic_id, dest_eid, profile_id, data, reply);
            }
            DaemonEvent::ElisionFuncResponse { topic_id, dest_eid, profile_id, modified, items } => {
                self.elision_func_response(topic_id, dest_eid, profile_id, modified, items);
            }
            DaemonEvent::AddProfile { profile, reply } => {
                let _ = reply.send(self.add_profile(profile));
            }
            DaemonEvent::DeleteProfile { profile_id, reply } => {
                let _ = reply.send(self.delete_profile(profile_id));
            }
            DaemonEvent::AddTopic { topic_id, description, reply } => {
                let _ = reply.send(self.add_topic(topic_id, description));
            }
            DaemonEvent::DeleteTopic { topic_id, reply } => {
                let _ = reply.send(self.delete_topic(topic_id));
            }
            DaemonEvent::BundleReceived(bundle) => {
                self.on_bundle_received(bundle).await;
            }
            DaemonEvent::Stats { reply } => {
                let _ = reply.send(Ok(self.stats_snapshot()));
            }
            DaemonEvent::Shutdown { reply } => {
                // handled by the event loop
                let _ = reply.send(());
            }
            DaemonEvent::PduTransmitted(pdu) => {
                self.on_pdu_transmitted(pdu);
            }
            DaemonEvent::PduTransmitFailed { key } => {
                if self.unacked.remove(&key) {
                    debug!("PDU {} was refused by the transport - no longer tracking it", key);
                    self.stats.pdus_sent = self.stats.pdus_sent.saturating_sub(1);
                }
            }
            DaemonEvent::PduDeleteRequest { key } => {
                if self.unacked.remove(&key) {
                    debug!("abandoned PDU {}", key);
                    self.stats.pdus_abandoned += 1;
                }
            }
            DaemonEvent::RetransmitTimerExpired { key, retransmit_count } => {
                self.on_retransmit_timer(&key, retransmit_count);
            }
            DaemonEvent::DeliverTimerExpired { collector_key, seq_ctr } => {
                self.on_deliver_timer(collector_key, seq_ctr);
            }
        }
    }

    fn register_topic(&mut self, topic_id: u32, has_elision_func: bool) -> DtpcResult<TopicRegistration> {
        let (topic, _) = self.topics.get_or_create(topic_id, self.config.require_predefined_topics, TOPIC_DESCRIPTION_REGISTRATION)?;
        if topic.registration().map(|r| r.is_alive()).unwrap_or(false) {
            return Err(DtpcError::TopicBusy(topic_id));
        }

        let (registration, link) = TopicRegistration::new(topic_id, has_elision_func, self.clock);
        topic.set_registration(link);
        info!("registered topic {} (elision function: {})", topic_id, has_elision_func);

        self.persist_topic(topic_id);
        Ok(registration)
    }

    fn unregister_topic(&mut self, topic_id: u32) -> DtpcResult<()> {
        let topic = self.topics.get_mut(topic_id)
            .ok_or_else(|| DtpcError::NotFound(format!("topic {}", topic_id)))?;
        if !topic.clear_registration() {
            return Err(DtpcError::NotFound(format!("registration for topic {}", topic_id)));
        }
        info!("unregistered topic {}", topic_id);
        Ok(())
    }

    fn send_data_item(&mut self, topic_id: u32, dest_eid: EndpointId, profile_id: u32, data: Bytes, reply: oneshot::Sender<DtpcResult<()>>) {
        let (profile, elision) = match self.check_send(topic_id, profile_id) {
            Ok(checked) => checked,
            Err(e) => {
                debug!("refusing data item for topic {} to {:?}: {}", topic_id, dest_eid, e);
                let _ = reply.send(Err(e));
                return;
            }
        };

        let key = AggregationKey::new(dest_eid.clone(), profile_id);
        let aggregator = self.aggregators.entry(key.clone())
            .or_insert_with(|| AggregatorHandle::spawn(key, profile.clone(), self.aggregator_ctx.clone()));
        aggregator.post(AggregatorEvent::SendDataItem {
            item: DataItem::new(dest_eid, topic_id, data),
            profile,
            elision,
            reply,
        });
    }

    /// Applies the node's topic and profile policies to a send request, returning the profile and
    ///  the topic registration's elision function
    fn check_send(&mut self, topic_id: u32, profile_id: u32) -> DtpcResult<(Arc<Profile>, Option<mpsc::UnboundedSender<ElisionRequest>>)> {
        let profile = self.profiles.get(profile_id)
            .ok_or(DtpcError::UnknownProfile(profile_id))?;

        let (topic, created) = self.topics.get_or_create(topic_id, self.config.require_predefined_topics, TOPIC_DESCRIPTION_SEND)?;
        let registration = topic.registration()
            .filter(|r| r.is_alive());
        let registered = registration.is_some();
        let elision = registration.and_then(|r| r.elision_sender());

        if created {
            self.persist_topic(topic_id);
        }
        if self.config.restrict_send_to_registered_client && !registered {
            return Err(DtpcError::NotRegistered(topic_id));
        }
        Ok((profile, elision))
    }

    fn elision_func_response(&mut self, topic_id: u32, dest_eid: EndpointId, profile_id: u32, modified: bool, items: Vec<DataItem>) {
        let key = AggregationKey::new(dest_eid, profile_id);
        match self.aggregators.get(&key) {
            Some(aggregator) => aggregator.post(AggregatorEvent::ElisionResponse { topic_id, modified, items }),
            None => warn!("elision function response for {}: no such payload aggregator", key),
        }
    }

    fn add_profile(&mut self, profile: Profile) -> DtpcResult<()> {
        let profile = self.profiles.add(profile)?;
        info!("added profile {}", profile.profile_id);
        self.persist(StoreTable::Profiles, &profile.profile_id.to_string(), |buf| profile.ser(buf));
        Ok(())
    }

    fn delete_profile(&mut self, profile_id: u32) -> DtpcResult<()> {
        self.profiles.del(profile_id)?;
        info!("deleted profile {}", profile_id);
        self.delete_record(StoreTable::Profiles, &profile_id.to_string());
        Ok(())
    }

    fn add_topic(&mut self, topic_id: u32, description: String) -> DtpcResult<()> {
        self.topics.add(Topic::new(topic_id, true, description))?;
        info!("added topic {}", topic_id);
        self.persist_topic(topic_id);
        Ok(())
    }

    fn delete_topic(&mut self, topic_id: u32) -> DtpcResult<()> {
        let topic = self.topics.del(topic_id)?;
        if topic.registration().is_some() {
            warn!("deleted topic {} had an active registration", topic_id);
        }
        info!("deleted topic {}", topic_id);
        self.delete_record(StoreTable::Topics, &topic_id.to_string());
        Ok(())
    }

    async fn on_bundle_received(&mut self, bundle: ReceivedBundle) {
        let ReceivedBundle { source, creation_ts, expiration_secs, payload } = bundle;
        match ReceivedPdu::decode(source.clone(), payload, creation_ts, expiration_secs) {
            Ok(ReceivedPdu::Data(pdu)) => self.on_data_pdu(pdu).await,
            Ok(ReceivedPdu::Ack(pdu)) => self.on_ack_pdu(pdu),
            Err(e) => {
                warn!("discarding invalid PDU from {:?}: {:#}", source, e);
                self.stats.pdus_discarded += 1;
            }
        }
    }

    async fn on_data_pdu(&mut self, pdu: ProtocolDataUnit) {
        trace!("received data PDU {} from {:?}", pdu.seq_ctr, pdu.remote_eid);
        self.stats.pdus_received += 1;
        if pdu.app_ack {
            self.send_ack(&pdu).await;
        }

        let key = pdu.collector_key();
        let mut ctx = CollectorContext {
            topics: &mut self.topics,
            require_predefined_topics: self.config.require_predefined_topics,
            clock: self.clock,
            events: &self.internal_events,
            touched_topics: Vec::new(),
        };
        let collector = self.collectors.entry(key.clone())
            .or_insert_with(|| DataPduCollector::new(key.clone()));
        match collector.pdu_received(pdu, &mut ctx) {
            Reception::Delivered(n) => self.stats.pdus_delivered += n as u64,
            Reception::Queued => {}
            Reception::Duplicate => self.stats.pdus_discarded += 1,
        }

        let touched_topics = ctx.touched_topics;
        self.persist_collector(&key);
        for topic_id in touched_topics {
            self.persist_topic(topic_id);
        }
    }

    /// ACKs go to the PDU's source, except for `ipn` sources that sent from the transmit service:
    ///  they expect ACKs on their receive service
    async fn send_ack(&mut self, pdu: &ProtocolDataUnit) {
        let dest = match pdu.remote_eid.ipn_parts() {
            Some((node, service)) if service == self.config.ipn_transmit_service_number => {
                EndpointId::ipn(node, self.config.ipn_receive_service_number)
            }
            _ => pdu.remote_eid.clone(),
        };

        let mut buf = BytesMut::new();
        PduHeader::ack(pdu.profile_id, pdu.seq_ctr).ser(&mut buf);

        let now = self.clock.now();
        let expiration_secs = pdu.expiration_ts.saturating_sub(now).max(1);
        let bundle = OutboundBundle::ack(self.config.local_eid.clone(), dest, now, expiration_secs, buf.freeze());

        debug!("sending ACK for PDU {} to {:?}", pdu.key(), bundle.dest);
        match self.transport.submit_for_delivery(bundle).await {
            Ok(()) => self.stats.acks_sent += 1,
            Err(e) => warn!("transport refused ACK for PDU {}: {}", pdu.key(), e),
        }
    }

    fn on_ack_pdu(&mut self, pdu: ProtocolDataUnit) {
        let key = pdu.key();
        let alt_key = pdu.ion_alt_key(self.config.ipn_receive_service_number);
        trace!("received ACK for {}", key);
        if self.unacked.on_ack(&key, alt_key.as_deref()) {
            debug!("PDU {} acknowledged", key);
            self.stats.pdus_acked += 1;
        }
    }

    fn on_pdu_transmitted(&mut self, pdu: ProtocolDataUnit) {
        let Some(profile) = self.profiles.get(pdu.profile_id) else {
            error!("profile {} of sent PDU {} no longer exists - not tracking it", pdu.profile_id, pdu.key());
            return;
        };
        if pdu.retransmit_count == 0 {
            self.stats.pdus_sent += 1;
        }
        else {
            self.stats.pdus_retransmitted += 1;
        }
        self.unacked.on_transmitted(pdu, &profile);
    }

    fn on_retransmit_timer(&mut self, key: &str, retransmit_count: u32) {
        let Some(pdu) = self.unacked.pdu_for_retransmit(key, retransmit_count) else {
            return;
        };

        let aggregator_key = AggregationKey::new(pdu.remote_eid.clone(), pdu.profile_id);
        match (self.profiles.get(pdu.profile_id), self.aggregators.get(&aggregator_key)) {
            (Some(profile), Some(aggregator)) => {
                aggregator.post(AggregatorEvent::Retransmit { pdu, profile });
            }
            _ => {
                error!("profile or payload aggregator for PDU {} no longer exists - abandoning it", key);
                self.unacked.remove(key);
                self.stats.pdus_abandoned += 1;
            }
        }
    }

    fn on_deliver_timer(&mut self, collector_key: AggregationKey, seq_ctr: u64) {
        let Some(collector) = self.collectors.get_mut(&collector_key) else {
            debug!("deliver timer for unknown collector {} - ignoring", collector_key);
            return;
        };
        let mut ctx = CollectorContext {
            topics: &mut self.topics,
            require_predefined_topics: self.config.require_predefined_topics,
            clock: self.clock,
            events: &self.internal_events,
            touched_topics: Vec::new(),
        };
        let num_delivered = collector.timer_expired(seq_ctr, &mut ctx);
        if num_delivered == 0 {
            return;
        }
        self.stats.pdus_delivered += num_delivered as u64;

        let touched_topics = ctx.touched_topics;
        self.persist_collector(&collector_key);
        for topic_id in touched_topics {
            self.persist_topic(topic_id);
        }
    }

    fn remove_expired_topic_items(&mut self) {
        let now = self.clock.now();
        let changed = self.topics.iter_mut()
            .filter_map(|topic| {
                let num_removed = topic.remove_expired_items(now);
                if num_removed > 0 {
                    debug!("removed {} expired collectors from topic {}", num_removed, topic.topic_id);
                    Some(topic.topic_id)
                }
                else {
                    None
                }
            })
            .collect::<Vec<_>>();
        for topic_id in changed {
            self.persist_topic(topic_id);
        }
    }

    fn stats_snapshot(&self) -> DtpcStats {
        DtpcStats {
            unacked_pdus: self.unacked.len(),
            payload_aggregators: self.aggregators.len(),
            data_pdu_collectors: self.collectors.len(),
            ..self.stats.clone()
        }
    }

    async fn shutdown(&mut self) {
        info!("shutting down DTPC daemon for {:?}", self.config.local_eid);
        for (_, aggregator) in self.aggregators.drain() {
            aggregator.shutdown().await;
        }
        for collector in self.collectors.values_mut() {
            collector.shutdown();
        }
        self.unacked.abort_all();
    }

    /// Startup: profiles first because aggregators need them, and topics before collectors
    ///  because collectors deliver into them
    fn load(&mut self) -> anyhow::Result<()> {
        for (key, record) in self.store.load_all(StoreTable::Profiles)? {
            match unframe_record(&record).and_then(|mut buf| Profile::deser(&mut buf)) {
                Ok(profile) => {
                    if let Err(e) = self.profiles.add(profile) {
                        error!("stored profile {} was rejected: {}", key, e);
                    }
                }
                Err(e) => error!("corrupt profile record {}: {}", key, e),
            }
        }

        for (key, record) in self.store.load_all(StoreTable::Topics)? {
            match unframe_record(&record).and_then(|mut buf| Topic::deser(&mut buf)) {
                Ok(topic) => {
                    if let Err(e) = self.topics.add(topic) {
                        error!("stored topic {} was rejected: {}", key, e);
                    }
                }
                Err(e) => error!("corrupt topic record {}: {}", key, e),
            }
        }

        for (key, record) in self.store.load_all(StoreTable::PayloadAggregators)? {
            match AggregatorHandle::spawn_reloaded(&record, &self.profiles, self.aggregator_ctx.clone()) {
                Ok(aggregator) => {
                    self.aggregators.insert(aggregator.key().clone(), aggregator);
                }
                Err(e) => {
                    error!("discarding stored payload aggregator {}: {}", key, e);
                    self.delete_record(StoreTable::PayloadAggregators, &key);
                }
            }
        }

        for (key, record) in self.store.load_all(StoreTable::DataPduCollectors)? {
            let mut ctx = CollectorContext {
                topics: &mut self.topics,
                require_predefined_topics: self.config.require_predefined_topics,
                clock: self.clock,
                events: &self.internal_events,
                touched_topics: Vec::new(),
            };
            match DataPduCollector::reload(&record, &mut ctx) {
                Ok((collector, num_delivered)) => {
                    self.stats.pdus_delivered += num_delivered as u64;
                    let touched_topics = ctx.touched_topics;
                    let collector_key = collector.key().clone();
                    self.collectors.insert(collector_key.clone(), collector);
                    self.persist_collector(&collector_key);
                    for topic_id in touched_topics {
                        self.persist_topic(topic_id);
                    }
                }
                Err(e) => {
                    error!("discarding stored data PDU collector {}: {}", key, e);
                    self.delete_record(StoreTable::DataPduCollectors, &key);
                }
            }
        }

        info!("loaded {} profiles, {} topics, {} payload aggregators, {} data PDU collectors",
            self.profiles.len(), self.topics.len(), self.aggregators.len(), self.collectors.len());
        Ok(())
    }

    fn persist_topic(&self, topic_id: u32) {
        if let Some(topic) = self.topics.get(topic_id) {
            self.persist(StoreTable::Topics, &topic_id.to_string(), |buf| topic.ser(buf));
        }
    }

    fn persist_collector(&self, key: &AggregationKey) {
        if let Some(collector) = self.collectors.get(key) {
            self.persist(StoreTable::DataPduCollectors, &key.durable_key(), |buf| collector.ser(buf));
        }
    }

    fn persist(&self, table: StoreTable, key: &str, ser: impl FnOnce(&mut BytesMut)) {
        if let Err(e) = self.store.put(table, key, frame_record(ser)) {
            error!("error persisting {:?} record {}: {}", table, key, e);
        }
    }

    fn delete_record(&self, table: StoreTable, key: &str) {
        if let Err(e) = self.store.delete(table, key) {
            error!("error deleting {:?} record {}: {}", table, key, e);
        }
    }
}
