use std::collections::BTreeMap;
use std::sync::Arc;
use anyhow::{anyhow, Context};
use bytes::{Buf, Bytes, BytesMut};
use bytes_varint::VarIntSupportMut;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};
use crate::aggregator::topic_aggregator::{Enqueued, TopicAggregator};
use crate::aggregator::AggregatorEvent;
use crate::daemon::DaemonEvent;
use crate::endpoint::{AggregationKey, EndpointId};
use crate::error::DtpcResult;
use crate::pdu::header::PduHeader;
use crate::pdu::ProtocolDataUnit;
use crate::profile::{Profile, ProfileTable};
use crate::retransmit::{decide_retransmit, RetransmitDecision};
use crate::store::{frame_record, unframe_record, DurableStore, StoreTable};
use crate::topic::{DataItem, ElisionRequest};
use crate::transport::{BundleTransport, OutboundBundle};
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::util::clock::{DtnClock, DtnTime};

/// Collaborators shared by all payload aggregators of a daemon
pub struct AggregatorContext {
    pub local_eid: EndpointId,
    pub clock: DtnClock,
    pub transport: Arc<dyn BundleTransport>,
    pub store: Arc<dyn DurableStore>,
    pub daemon_events: mpsc::UnboundedSender<DaemonEvent>,
}

struct AggregationTimer {
    deadline: DtnTime,
    generation: u64,
    handle: JoinHandle<()>,
}

/// Sender-side state for one destination and profile: queued data items per topic, the next
///  payload sequence number, and the aggregation timer.
pub struct PayloadAggregator {
    key: AggregationKey,
    profile: Arc<Profile>,
    /// next sequence number to assign
    seq_ctr: u64,
    /// bytes queued and not yet flushed, excluding items pending an elision response
    size: u64,
    /// NB: ordered so that topic blocks are written in a deterministic order
    topic_aggs: BTreeMap<u32, TopicAggregator>,
    awaiting_elision: Option<u32>,
    timer: Option<AggregationTimer>,
    /// incremented for every armed timer, identifies the one that is current
    timer_generation: u64,
    self_events: mpsc::UnboundedSender<AggregatorEvent>,
    ctx: Arc<AggregatorContext>,
}

impl PayloadAggregator {
    pub fn new(key: AggregationKey, profile: Arc<Profile>, self_events: mpsc::UnboundedSender<AggregatorEvent>, ctx: Arc<AggregatorContext>) -> PayloadAggregator {
        debug!("created payload aggregator for {}", key);
        PayloadAggregator {
            key,
            profile,
            seq_ctr: 1,
            size: 0,
            topic_aggs: BTreeMap::default(),
            awaiting_elision: None,
            timer: None,
            timer_generation: 0,
            self_events,
            ctx,
        }
    }

    pub fn key(&self) -> &AggregationKey {
        &self.key
    }

    pub fn seq_ctr(&self) -> u64 {
        self.seq_ctr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_awaiting_elision(&self) -> bool {
        self.awaiting_elision.is_some()
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Queues a data item, flushing or arming the aggregation timer as the profile requires.
    ///  If the topic's registration has an elision function (and the profile aggregates), the
    ///  aggregator is suspended until the response arrives.
    pub async fn send_data_item(&mut self, item: DataItem, profile: Arc<Profile>, elision: Option<mpsc::UnboundedSender<ElisionRequest>>) -> DtpcResult<()> {
        debug_assert!(self.awaiting_elision.is_none());
        trace!("send_data_item for {} - topic {}, {} bytes", self.key, item.topic_id, item.size());

        self.profile = profile;
        let optimize = self.profile.aggregation_size_limit != 0;
        let elision = elision.filter(|_| optimize);

        let topic_id = item.topic_id;
        let topic_agg = self.topic_aggs.entry(topic_id)
            .or_insert_with(|| TopicAggregator::new(topic_id));

        let result = match topic_agg.enqueue(item, elision.is_some()) {
            Enqueued::Sized(delta) => {
                self.size += delta;
                self.flush_or_arm_timer().await
            }
            Enqueued::PendingElision => {
                let request = ElisionRequest {
                    topic_id,
                    dest_eid: self.key.remote.clone(),
                    profile_id: self.key.profile_id,
                    items: topic_agg.items(),
                };
                match elision.map(|sender| sender.send(request)) {
                    Some(Ok(())) => {
                        debug!("waiting for elision function response for topic {} on {}", topic_id, self.key);
                        self.awaiting_elision = Some(topic_id);
                        Ok(())
                    }
                    _ => {
                        warn!("elision function for topic {} is no longer registered - proceeding without it", topic_id);
                        let delta = topic_agg.apply_elision_response(false, Vec::new());
                        self.size = self.size.saturating_add_signed(delta);
                        self.flush_or_arm_timer().await
                    }
                }
            }
        };

        self.persist();
        Ok(result?)
    }

    pub async fn elision_func_response(&mut self, topic_id: u32, modified: bool, items: Vec<DataItem>) {
        if self.awaiting_elision != Some(topic_id) {
            warn!("unsolicited elision function response for topic {} on {} - ignoring", topic_id, self.key);
            return;
        }
        self.awaiting_elision = None;

        match self.topic_aggs.get_mut(&topic_id) {
            None => error!("elision function response: no topic aggregator for topic {} on {}", topic_id, self.key),
            Some(topic_agg) => {
                let delta = topic_agg.apply_elision_response(modified, items);
                self.size = self.size.saturating_add_signed(delta);
                debug!("elision function response for topic {} on {}: size delta {}, now {}", topic_id, self.key, delta, self.size);
                if let Err(e) = self.flush_or_arm_timer().await {
                    error!("error sending payload for {} after elision: {}", self.key, e);
                }
            }
        }
        self.persist();
    }

    /// `seq_ctr` and `generation` identify the timer when it was armed. Timers that were
    ///  overtaken by a flush or replaced by a newer timer are ignored.
    pub async fn timer_expired(&mut self, seq_ctr: u64, generation: u64) {
        let current_generation = self.timer.as_ref().map(|t| t.generation);
        if seq_ctr != self.seq_ctr || current_generation != Some(generation) {
            trace!("aggregation timer for {} with seq {} / generation {} ignored - current seq is {}, current timer {:?}",
                self.key, seq_ctr, generation, self.seq_ctr, current_generation);
            return;
        }
        debug!("aggregation timer expired for {} - sending payload", self.key);
        self.cancel_timer();
        if let Err(e) = self.send_payload().await {
            error!("error sending payload for {}: {}", self.key, e);
        }
        self.persist();
    }

    /// Resends a sequenced PDU whose retransmit timer expired, or gives up on it. Either way,
    ///  the daemon is told what became of it.
    pub async fn retransmit_pdu(&mut self, mut pdu: ProtocolDataUnit, profile: Arc<Profile>) {
        let now = self.ctx.clock.now();
        let key = pdu.key();
        let expiration_remaining = match decide_retransmit(&pdu, &profile, now) {
            RetransmitDecision::GiveUp(reason) => {
                debug!("giving up on PDU {}: {}", key, reason);
                self.post_to_daemon(DaemonEvent::PduDeleteRequest { key });
                return;
            }
            RetransmitDecision::Resend { expiration_remaining } => expiration_remaining,
        };

        let mut bundle = OutboundBundle::for_profile(&profile, self.ctx.local_eid.clone(), pdu.remote_eid.clone(), now, pdu.payload.clone());
        bundle.expiration_secs = expiration_remaining;

        debug!("retransmitting PDU {} (attempt {}/{})", key, pdu.retransmit_count + 1, profile.retransmission_limit);
        if let Err(e) = self.ctx.transport.submit_for_delivery(bundle).await {
            //NB: counts as an attempt nonetheless
            warn!("transport refused retransmission of PDU {}: {}", key, e);
        }
        pdu.retransmit_count += 1;

        let limit_reached = pdu.retransmit_count >= profile.retransmission_limit;
        self.post_to_daemon(DaemonEvent::PduTransmitted(pdu));
        if limit_reached {
            debug!("PDU {} reached its retransmission limit", key);
            self.post_to_daemon(DaemonEvent::PduDeleteRequest { key });
        }
    }

    pub fn shutdown(&mut self) {
        self.cancel_timer();
    }

    async fn flush_or_arm_timer(&mut self) -> anyhow::Result<()> {
        let size_limit = self.profile.aggregation_size_limit;
        if size_limit == 0 || self.size > size_limit {
            debug!("size limit reached for {} ({} bytes) - sending payload", self.key, self.size);
            self.cancel_timer();
            self.send_payload().await
        }
        else {
            if self.timer.is_none() && self.profile.aggregation_time_limit > 0 {
                self.arm_timer(self.ctx.clock.now().saturating_add(self.profile.aggregation_time_limit));
            }
            Ok(())
        }
    }

    /// Serializes all queued items into a PDU and hands it to the transport. An empty payload
    ///  is not sent and does not consume a sequence number.
    async fn send_payload(&mut self) -> anyhow::Result<()> {
        let psn = if self.profile.transport_service() { self.seq_ctr } else { 0 };

        let mut buf = BytesMut::with_capacity(self.size as usize + self.topic_aggs.len() * 8 + 22);
        PduHeader::data(self.key.profile_id, psn).ser(&mut buf);
        let header_len = buf.len();

        for topic_agg in self.topic_aggs.values_mut() {
            topic_agg.load(&mut buf);
        }
        self.size = 0;

        let result = if buf.len() > header_len {
            let transmitted = self.transmit(psn, buf.freeze(), header_len).await;
            if transmitted.is_ok() {
                self.seq_ctr += 1;
            }
            transmitted
        }
        else {
            trace!("payload for {} is empty - skipping", self.key);
            Ok(())
        };

        if self.profile.aggregation_time_limit > 0 {
            self.cancel_timer();
            self.arm_timer(self.ctx.clock.now().saturating_add(self.profile.aggregation_time_limit));
        }
        result
    }

    async fn transmit(&mut self, psn: u64, payload: Bytes, body_offset: usize) -> anyhow::Result<()> {
        let creation_ts = self.ctx.clock.now();
        debug!("sending payload {}~{} - {} bytes", self.key, psn, payload.len());

        // NB: the daemon must track the PDU before its ACK can possibly arrive
        let tracked_key = if self.profile.transport_service() {
            let pdu = ProtocolDataUnit {
                remote_eid: self.key.remote.clone(),
                profile_id: self.key.profile_id,
                seq_ctr: psn,
                creation_ts,
                expiration_ts: creation_ts.saturating_add(self.profile.expiration),
                retransmit_count: 0,
                app_ack: false,
                payload: payload.clone(),
                body_offset,
            };
            let key = pdu.key();
            self.post_to_daemon(DaemonEvent::PduTransmitted(pdu));
            Some(key)
        }
        else {
            None
        };

        let bundle = OutboundBundle::for_profile(&self.profile, self.ctx.local_eid.clone(), self.key.remote.clone(), creation_ts, payload);
        let submitted = self.ctx.transport.submit_for_delivery(bundle).await;
        if submitted.is_err() {
            if let Some(key) = tracked_key {
                self.post_to_daemon(DaemonEvent::PduTransmitFailed { key });
            }
        }
        submitted.with_context(|| format!("transport refused payload for {}", self.key))
    }

    fn arm_timer(&mut self, deadline: DtnTime) {
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let seq_ctr = self.seq_ctr;
        let at = self.ctx.clock.instant_at(deadline);
        let events = self.self_events.clone();

        trace!("arming aggregation timer for {} at {} (seq {}, generation {})", self.key, deadline, seq_ctr, generation);
        let handle = tokio::spawn(async move {
            time::sleep_until(at).await;
            let _ = events.send(AggregatorEvent::TimerExpired { seq_ctr, generation });
        });
        self.timer = Some(AggregationTimer { deadline, generation, handle });
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }

    fn post_to_daemon(&self, event: DaemonEvent) {
        if self.ctx.daemon_events.send(event).is_err() {
            debug!("daemon is gone - dropping event from {}", self.key);
        }
    }

    fn persist(&self) {
        let record = frame_record(|buf| self.ser(buf));
        if let Err(e) = self.ctx.store.put(StoreTable::PayloadAggregators, &self.key.durable_key(), record) {
            error!("error persisting payload aggregator {}: {}", self.key, e);
        }
    }

    fn ser(&self, buf: &mut BytesMut) {
        self.key.remote.ser(buf);
        buf.put_u64_varint(self.key.profile_id.into());
        buf.put_u64_varint(self.seq_ctr);
        buf.put_u64_varint(self.timer.as_ref().map(|t| t.deadline).unwrap_or(0));
        buf.put_len_varint(self.topic_aggs.len());
        for topic_agg in self.topic_aggs.values() {
            topic_agg.ser(buf);
        }
    }

    /// Restores an aggregator from its durable record, re-arming a pending aggregation timer
    pub fn reload(record: &Bytes, profiles: &ProfileTable, self_events: mpsc::UnboundedSender<AggregatorEvent>, ctx: Arc<AggregatorContext>) -> anyhow::Result<PayloadAggregator> {
        let mut buf = unframe_record(record)?;

        let remote = EndpointId::deser(&mut buf)?;
        let profile_id = buf.checked_get_u32_varint()?;
        let key = AggregationKey::new(remote, profile_id);
        let profile = profiles.get(profile_id)
            .ok_or_else(|| anyhow!("profile {} of payload aggregator {} no longer exists", profile_id, key))?;

        let mut result = PayloadAggregator::new(key, profile, self_events, ctx);
        result.seq_ctr = buf.checked_get_u64_varint()?;
        let deadline = buf.checked_get_u64_varint()?;

        let num_topic_aggs = buf.checked_get_usize_varint()?;
        for _ in 0..num_topic_aggs {
            let topic_agg = TopicAggregator::deser(&mut buf)?;
            result.size += topic_agg.size();
            result.topic_aggs.insert(topic_agg.topic_id(), topic_agg);
        }
        if buf.has_remaining() {
            warn!("{} trailing bytes in payload aggregator record for {}", buf.remaining(), result.key);
        }

        if deadline != 0 {
            debug!("re-arming aggregation timer for reloaded aggregator {}", result.key);
            result.arm_timer(deadline);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use tokio::sync::mpsc::UnboundedReceiver;
    use crate::store::MemoryStore;
    use crate::test_util::transport::TrackingTransport;
    use super::*;

    struct Fixture {
        aggregator: PayloadAggregator,
        own_events: UnboundedReceiver<AggregatorEvent>,
        daemon_events: UnboundedReceiver<DaemonEvent>,
        transport: Arc<TrackingTransport>,
        store: Arc<MemoryStore>,
    }

    fn profile(size_limit: u64, time_limit: u64, retransmission_limit: u32) -> Arc<Profile> {
        Arc::new(Profile {
            aggregation_size_limit: size_limit,
            aggregation_time_limit: time_limit,
            retransmission_limit,
            ..Profile::new(1, 30)
        })
    }

    fn dest() -> EndpointId {
        EndpointId::ipn(2, 129)
    }

    fn item(topic_id: u32, data: &'static [u8]) -> DataItem {
        DataItem::new(dest(), topic_id, Bytes::from_static(data))
    }

    fn fixture(profile: Arc<Profile>) -> Fixture {
        let transport = Arc::new(TrackingTransport::new());
        let store = Arc::new(MemoryStore::new());
        let (daemon_send, daemon_events) = mpsc::unbounded_channel();
        let (own_send, own_events) = mpsc::unbounded_channel();
        let ctx = Arc::new(AggregatorContext {
            local_eid: EndpointId::ipn(1, 129),
            clock: DtnClock::starting_at(1000),
            transport: transport.clone(),
            store: store.clone(),
            daemon_events: daemon_send,
        });
        Fixture {
            aggregator: PayloadAggregator::new(AggregationKey::new(dest(), 1), profile, own_send, ctx),
            own_events,
            daemon_events,
            transport,
            store,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_size_threshold() {
        let p = profile(10, 0, 0);
        let mut f = fixture(p.clone());

        f.aggregator.send_data_item(item(7, b"aaaaaa"), p.clone(), None).await.unwrap();
        f.transport.assert_no_remaining_bundles().await;
        assert_eq!(f.aggregator.size(), 6);

        f.aggregator.send_data_item(item(7, b"bbbbbb"), p.clone(), None).await.unwrap();
        f.transport.assert_bundle_sent(&dest(), &[
            0x00, 0x01, 0x00,
            7, 2, 6, b'a', b'a', b'a', b'a', b'a', b'a', 6, b'b', b'b', b'b', b'b', b'b', b'b',
        ]).await;
        f.transport.assert_no_remaining_bundles().await;
        assert_eq!(f.aggregator.size(), 0);
        assert!(f.daemon_events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_flush_without_aggregation() {
        let p = profile(0, 0, 0);
        let mut f = fixture(p.clone());

        for data in [&b"x"[..], b"", b"yz"] {
            f.aggregator.send_data_item(item(3, data), p.clone(), None).await.unwrap();
        }

        f.transport.assert_bundle_sent(&dest(), &[0x00, 0x01, 0x00, 3, 1, 1, b'x']).await;
        f.transport.assert_bundle_sent(&dest(), &[0x00, 0x01, 0x00, 3, 1, 0]).await;
        f.transport.assert_bundle_sent(&dest(), &[0x00, 0x01, 0x00, 3, 1, 2, b'y', b'z']).await;
        assert!(!f.aggregator.has_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_topic_blocks_in_topic_order() {
        let p = profile(0, 0, 0);
        let mut f = fixture(p.clone());
        f.aggregator.topic_aggs.insert(9, TopicAggregator::new(9));
        f.aggregator.topic_aggs.get_mut(&9).unwrap().enqueue(item(9, b"n"), false);

        f.aggregator.send_data_item(item(4, b"f"), p, None).await.unwrap();
        f.transport.assert_bundle_sent(&dest(), &[0x00, 0x01, 0x00, 4, 1, 1, b'f', 9, 1, 1, b'n']).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_timer() {
        let p = profile(100, 5, 0);
        let mut f = fixture(p.clone());

        f.aggregator.send_data_item(item(7, b"abc"), p.clone(), None).await.unwrap();
        assert!(f.aggregator.has_timer());
        f.transport.assert_no_remaining_bundles().await;

        let start = time::Instant::now();
        let Some(AggregatorEvent::TimerExpired { seq_ctr, generation }) = f.own_events.recv().await else { panic!("expected timer event") };
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(seq_ctr, 1);

        f.aggregator.timer_expired(seq_ctr, generation).await;
        f.transport.assert_bundle_sent(&dest(), &[0x00, 0x01, 0x00, 7, 1, 3, b'a', b'b', b'c']).await;
        assert_eq!(f.aggregator.seq_ctr(), 2);
        // re-armed for the next batch
        assert!(f.aggregator.has_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_flush_consumes_no_sequence_number() {
        let p = profile(100, 5, 0);
        let mut f = fixture(p);
        f.aggregator.arm_timer(1005);

        let Some(AggregatorEvent::TimerExpired { seq_ctr, generation }) = f.own_events.recv().await else { panic!("expected timer event") };
        f.aggregator.timer_expired(seq_ctr, generation).await;
        f.transport.assert_no_remaining_bundles().await;
        assert_eq!(f.aggregator.seq_ctr(), 1);
        assert!(f.aggregator.has_timer());
    }

    #[rstest]
    #[case::stale_seq(1, 0, false)]
    #[case::current(2, 0, true)]
    #[case::future_seq(3, 0, false)]
    #[case::replaced_timer(2, -1, false)]
    #[case::unknown_timer(2, 1, false)]
    fn test_timer_token(#[case] timer_seq: u64, #[case] generation_offset: i64, #[case] expect_flush: bool) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async move {
            let p = profile(100, 5, 0);
            let mut f = fixture(p.clone());
            f.aggregator.seq_ctr = 2;
            f.aggregator.send_data_item(item(7, b"abc"), p, None).await.unwrap();
            let generation = f.aggregator.timer.as_ref().unwrap().generation;

            f.aggregator.timer_expired(timer_seq, generation.saturating_add_signed(generation_offset)).await;
            assert_eq!(f.transport.sent_count().await, if expect_flush { 1 } else { 0 });
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_event_queued_behind_refused_flush_is_ignored() {
        let p = profile(100, 5, 0);
        let mut f = fixture(p.clone());
        f.aggregator.send_data_item(item(7, b"abc"), p.clone(), None).await.unwrap();

        // the timer fires, but its event is processed only after a refused flush
        let Some(AggregatorEvent::TimerExpired { seq_ctr, generation }) = f.own_events.recv().await else { panic!("expected timer event") };
        f.transport.set_rejecting(true);
        let big = DataItem::new(dest(), 7, vec![0u8; 200]);
        assert!(f.aggregator.send_data_item(big, p.clone(), None).await.is_err());
        f.transport.set_rejecting(false);
        assert_eq!(f.aggregator.seq_ctr(), seq_ctr);

        f.aggregator.timer_expired(seq_ctr, generation).await;
        assert!(f.aggregator.has_timer());

        time::sleep(Duration::from_secs(6)).await;
        let mut num_expired = 0;
        while let Ok(AggregatorEvent::TimerExpired { .. }) = f.own_events.try_recv() {
            num_expired += 1;
        }
        assert_eq!(num_expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequenced_pdu_is_reported_to_daemon() {
        let p = profile(0, 0, 2);
        let mut f = fixture(p.clone());
        f.aggregator.seq_ctr = 5;

        f.aggregator.send_data_item(item(7, b"q"), p, None).await.unwrap();

        let bundle = f.transport.assert_bundle_sent(&dest(), &[0x00, 0x01, 0x05, 7, 1, 1, b'q']).await;
        assert_eq!(bundle.expiration_secs, 30);
        assert_eq!(bundle.source, EndpointId::ipn(1, 129));

        let Ok(DaemonEvent::PduTransmitted(pdu)) = f.daemon_events.try_recv() else { panic!("expected PduTransmitted") };
        assert_eq!(pdu.key(), "ipn:2.129~1~5");
        assert_eq!(pdu.creation_ts, 1000);
        assert_eq!(pdu.expiration_ts, 1030);
        assert_eq!(pdu.body_offset, 3);
        assert_eq!(f.aggregator.seq_ctr(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_refusal_keeps_sequence_number() {
        let p = profile(0, 0, 2);
        let mut f = fixture(p.clone());
        f.transport.set_rejecting(true);

        assert!(f.aggregator.send_data_item(item(7, b"q"), p, None).await.is_err());
        assert_eq!(f.aggregator.seq_ctr(), 1);

        // tracked before submission, and released again after the refusal
        let Ok(DaemonEvent::PduTransmitted(pdu)) = f.daemon_events.try_recv() else { panic!("expected PduTransmitted") };
        assert_eq!(pdu.key(), "ipn:2.129~1~1");
        let Ok(DaemonEvent::PduTransmitFailed { key }) = f.daemon_events.try_recv() else { panic!("expected PduTransmitFailed") };
        assert_eq!(key, "ipn:2.129~1~1");
        assert!(f.daemon_events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_elision_suspends_until_response() {
        let p = profile(4, 60, 0);
        let mut f = fixture(p.clone());
        let (elision_send, mut elision_recv) = mpsc::unbounded_channel();

        f.aggregator.send_data_item(item(7, b"ab"), p.clone(), Some(elision_send.clone())).await.unwrap();
        assert!(f.aggregator.is_awaiting_elision());
        assert_eq!(f.aggregator.size(), 0);

        let request = elision_recv.try_recv().unwrap();
        assert_eq!(request.topic_id, 7);
        assert_eq!(request.dest_eid, dest());
        assert_eq!(request.items, vec![item(7, b"ab")]);

        f.aggregator.elision_func_response(7, false, Vec::new()).await;
        assert!(!f.aggregator.is_awaiting_elision());
        assert_eq!(f.aggregator.size(), 2);
        assert!(f.aggregator.has_timer());

        f.aggregator.send_data_item(item(7, b"cd"), p.clone(), Some(elision_send)).await.unwrap();
        let request = elision_recv.try_recv().unwrap();
        assert_eq!(request.items, vec![item(7, b"ab"), item(7, b"cd")]);

        // merged into something above the size limit: flush
        f.aggregator.elision_func_response(7, true, vec![item(7, b"abcd!")]).await;
        f.transport.assert_bundle_sent(&dest(), &[0x00, 0x01, 0x00, 7, 1, 5, b'a', b'b', b'c', b'd', b'!']).await;
        assert_eq!(f.aggregator.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elision_not_used_without_aggregation() {
        let p = profile(0, 0, 0);
        let mut f = fixture(p.clone());
        let (elision_send, mut elision_recv) = mpsc::unbounded_channel();

        f.aggregator.send_data_item(item(7, b"ab"), p, Some(elision_send)).await.unwrap();
        assert!(!f.aggregator.is_awaiting_elision());
        assert!(elision_recv.try_recv().is_err());
        assert_eq!(f.transport.sent_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elision_with_dropped_registration() {
        let p = profile(4, 60, 0);
        let mut f = fixture(p.clone());
        let (elision_send, elision_recv) = mpsc::unbounded_channel();
        drop(elision_recv);

        f.aggregator.send_data_item(item(7, b"abcdef"), p, Some(elision_send)).await.unwrap();
        assert!(!f.aggregator.is_awaiting_elision());
        assert_eq!(f.transport.sent_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_elision_response_is_ignored() {
        let p = profile(4, 60, 0);
        let mut f = fixture(p.clone());
        f.aggregator.elision_func_response(7, true, vec![item(7, b"abcdef")]).await;
        assert_eq!(f.aggregator.size(), 0);
        f.transport.assert_no_remaining_bundles().await;
    }

    fn sent_pdu(retransmit_count: u32, creation_ts: DtnTime) -> ProtocolDataUnit {
        ProtocolDataUnit {
            remote_eid: dest(),
            profile_id: 1,
            seq_ctr: 4,
            creation_ts,
            expiration_ts: creation_ts + 30,
            retransmit_count,
            app_ack: false,
            payload: Bytes::from_static(&[0x00, 0x01, 0x04, 7, 1, 1, b'x']),
            body_offset: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit() {
        let p = profile(0, 0, 2);
        let mut f = fixture(p.clone());
        time::sleep(Duration::from_secs(10)).await;

        f.aggregator.retransmit_pdu(sent_pdu(0, 1000), p).await;

        let bundle = f.transport.assert_bundle_sent(&dest(), &[0x00, 0x01, 0x04, 7, 1, 1, b'x']).await;
        assert_eq!(bundle.expiration_secs, 20);
        let Ok(DaemonEvent::PduTransmitted(pdu)) = f.daemon_events.try_recv() else { panic!("expected PduTransmitted") };
        assert_eq!(pdu.retransmit_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_retransmit_requests_deletion() {
        let p = profile(0, 0, 2);
        let mut f = fixture(p.clone());
        time::sleep(Duration::from_secs(20)).await;

        f.aggregator.retransmit_pdu(sent_pdu(1, 1000), p).await;

        assert_eq!(f.transport.sent_count().await, 1);
        let Ok(DaemonEvent::PduTransmitted(pdu)) = f.daemon_events.try_recv() else { panic!("expected PduTransmitted") };
        assert_eq!(pdu.retransmit_count, 2);
        let Ok(DaemonEvent::PduDeleteRequest { key }) = f.daemon_events.try_recv() else { panic!("expected PduDeleteRequest") };
        assert_eq!(key, "ipn:2.129~1~4");
    }

    #[rstest]
    #[case::limit_reached(2, 1010)]
    #[case::expired(0, 990)]
    fn test_retransmit_gives_up(#[case] retransmit_count: u32, #[case] creation_ts: DtnTime) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async move {
            let p = profile(0, 0, 2);
            let mut f = fixture(p.clone());
            time::sleep(Duration::from_secs(15)).await;

            f.aggregator.retransmit_pdu(sent_pdu(retransmit_count, creation_ts), p).await;

            f.transport.assert_no_remaining_bundles().await;
            assert!(matches!(f.daemon_events.try_recv(), Ok(DaemonEvent::PduDeleteRequest { .. })));
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_and_reload() {
        let p = profile(100, 5, 1);
        let mut f = fixture(p.clone());
        f.aggregator.seq_ctr = 8;
        f.aggregator.send_data_item(item(7, b"abc"), p.clone(), None).await.unwrap();
        f.aggregator.send_data_item(item(2, b"de"), p.clone(), None).await.unwrap();

        let records = f.store.load_all(StoreTable::PayloadAggregators).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "ipn:2.129~1");

        let mut profiles = ProfileTable::default();
        profiles.add(p.as_ref().clone()).unwrap();
        let (own_send, mut own_events) = mpsc::unbounded_channel();
        let mut reloaded = PayloadAggregator::reload(&records[0].1, &profiles, own_send, f.aggregator.ctx.clone()).unwrap();
        assert_eq!(reloaded.seq_ctr(), 8);
        assert_eq!(reloaded.size(), 5);
        assert!(reloaded.has_timer());

        let Some(AggregatorEvent::TimerExpired { seq_ctr, generation }) = own_events.recv().await else { panic!() };
        reloaded.timer_expired(seq_ctr, generation).await;
        f.transport.assert_bundle_sent(&dest(), &[0x00, 0x01, 0x08, 2, 1, 2, b'd', b'e', 7, 1, 3, b'a', b'b', b'c']).await;
    }

    #[tokio::test]
    async fn test_reload_without_profile_fails() {
        let p = profile(100, 5, 0);
        let mut f = fixture(p.clone());
        f.aggregator.send_data_item(item(7, b"abc"), p, None).await.unwrap();
        f.aggregator.shutdown();

        let records = f.store.load_all(StoreTable::PayloadAggregators).unwrap();
        let (own_send, _own_events) = mpsc::unbounded_channel();
        assert!(PayloadAggregator::reload(&records[0].1, &ProfileTable::default(), own_send, f.aggregator.ctx.clone()).is_err());
    }
}
