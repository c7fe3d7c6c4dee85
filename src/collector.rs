//! Receive side of the engine: one [DataPduCollector] per `(source, profile)`, owned by the daemon.
//!
//! Sequenced PDUs are delivered in order. A PDU that arrives ahead of its predecessors is held
//!  back, but only until shortly before it expires itself: then the gap is given up on and
//!  delivery continues from there.

use std::collections::BTreeMap;
use bytes::{Buf, Bytes, BytesMut};
use bytes_varint::VarIntSupportMut;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};
use crate::daemon::DaemonEvent;
use crate::endpoint::{AggregationKey, EndpointId};
use crate::pdu::ProtocolDataUnit;
use crate::store::unframe_record;
use crate::topic::{TopicCollector, TopicTable};
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::util::clock::{DtnClock, DtnTime};

const TOPIC_DESCRIPTION_RECEIVED: &str = "<on the fly API topic received>";

/// What a collector's caller needs for delivering data items
pub struct CollectorContext<'a> {
    pub topics: &'a mut TopicTable,
    pub require_predefined_topics: bool,
    pub clock: DtnClock,
    pub events: &'a mpsc::UnboundedSender<DaemonEvent>,
    /// topics that received data items and need to be persisted
    pub touched_topics: Vec<u32>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Reception {
    /// this many PDUs were delivered, including previously queued ones
    Delivered(usize),
    Queued,
    Duplicate,
}

struct DeliverTimer {
    seq_ctr: u64,
    handle: JoinHandle<()>,
}

pub struct DataPduCollector {
    key: AggregationKey,
    /// next expected sequence number
    seq_ctr: u64,
    queue: BTreeMap<u64, ProtocolDataUnit>,
    timer: Option<DeliverTimer>,
}

impl DataPduCollector {
    pub fn new(key: AggregationKey) -> DataPduCollector {
        debug!("created data PDU collector for {}", key);
        DataPduCollector {
            key,
            seq_ctr: 1,
            queue: BTreeMap::default(),
            timer: None,
        }
    }

    pub fn key(&self) -> &AggregationKey {
        &self.key
    }

    pub fn seq_ctr(&self) -> u64 {
        self.seq_ctr
    }

    pub fn queued_pdu_count(&self) -> usize {
        self.queue.len()
    }

    pub fn pdu_received(&mut self, pdu: ProtocolDataUnit, ctx: &mut CollectorContext) -> Reception {
        let seq = pdu.seq_ctr;
        if seq == 0 {
            trace!("unsequenced PDU from {}", self.key);
            Self::deliver(&self.key, pdu, ctx);
            return Reception::Delivered(1);
        }

        if seq < self.seq_ctr || self.queue.contains_key(&seq) {
            debug!("duplicate PDU {} from {} (expecting {}) - discarding", seq, self.key, self.seq_ctr);
            return Reception::Duplicate;
        }

        if seq == self.seq_ctr {
            Self::deliver(&self.key, pdu, ctx);
            self.seq_ctr += 1;
            let num_delivered = 1 + self.drain(ctx);
            self.update_timer(ctx);
            return Reception::Delivered(num_delivered);
        }

        debug!("PDU {} from {} arrived ahead of {} - queueing", seq, self.key, self.seq_ctr);
        self.queue.insert(seq, pdu);
        self.update_timer(ctx);
        Reception::Queued
    }

    /// Gives up on the gap before `seq_ctr` if that PDU is still the first one waiting. Returns
    ///  the number of delivered PDUs.
    pub fn timer_expired(&mut self, seq_ctr: u64, ctx: &mut CollectorContext) -> usize {
        if self.queue.first_key_value().map(|(&seq, _)| seq) != Some(seq_ctr) {
            trace!("deliver timer for {} / {} is stale - ignoring", self.key, seq_ctr);
            return 0;
        }
        self.cancel_timer();

        warn!("giving up on PDUs {} to {} from {}", self.seq_ctr, seq_ctr - 1, self.key);
        self.seq_ctr = seq_ctr;
        let num_delivered = self.drain(ctx);
        self.update_timer(ctx);
        num_delivered
    }

    pub fn shutdown(&mut self) {
        self.cancel_timer();
    }

    fn drain(&mut self, ctx: &mut CollectorContext) -> usize {
        let mut num_delivered = 0;
        while let Some(entry) = self.queue.first_entry() {
            if *entry.key() != self.seq_ctr {
                break;
            }
            Self::deliver(&self.key, entry.remove(), ctx);
            self.seq_ctr += 1;
            num_delivered += 1;
        }
        num_delivered
    }

    fn deliver(key: &AggregationKey, pdu: ProtocolDataUnit, ctx: &mut CollectorContext) {
        let topic_blocks = match pdu.topic_blocks() {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!("invalid PDU {} from {}: {} - discarding", pdu.seq_ctr, key, e);
                return;
            }
        };

        for block in topic_blocks {
            let topic = match ctx.topics.get_or_create(block.topic_id, ctx.require_predefined_topics, TOPIC_DESCRIPTION_RECEIVED) {
                Ok((topic, _)) => topic,
                Err(e) => {
                    warn!("skipping {} data items from {}: {}", block.records.len(), key, e);
                    continue;
                }
            };

            let mut collector = TopicCollector::new(block.topic_id, pdu.remote_eid.clone(), pdu.expiration_ts);
            for record in block.records {
                collector.push(record);
            }
            trace!("delivering {} data items for topic {} from {}", collector.item_count(), block.topic_id, key);
            topic.deliver(collector);

            if !ctx.touched_topics.contains(&block.topic_id) {
                ctx.touched_topics.push(block.topic_id);
            }
        }
    }

    /// Keeps the deliver timer in line with the first queued PDU
    fn update_timer(&mut self, ctx: &CollectorContext) {
        let Some((first_seq, deadline)) = self.queue.first_key_value()
            .map(|(&seq, pdu)| (seq, pdu.expiration_ts.saturating_sub(1)))
        else {
            self.cancel_timer();
            return;
        };
        if self.timer.as_ref().map(|t| t.seq_ctr) == Some(first_seq) {
            return;
        }
        self.cancel_timer();

        let at = ctx.clock.instant_at(deadline);
        let events = ctx.events.clone();
        let collector_key = self.key.clone();
        trace!("arming deliver timer for {} / {} at {}", self.key, first_seq, deadline);
        let handle = tokio::spawn(async move {
            time::sleep_until(at).await;
            let _ = events.send(DaemonEvent::DeliverTimerExpired { collector_key, seq_ctr: first_seq });
        });
        self.timer = Some(DeliverTimer { seq_ctr: first_seq, handle });
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.key.remote.ser(buf);
        buf.put_u64_varint(self.key.profile_id.into());
        buf.put_u64_varint(self.seq_ctr);
        buf.put_len_varint(self.queue.len());
        for pdu in self.queue.values() {
            pdu.ser(buf);
        }
    }

    /// Restores a collector from its durable record. Queued PDUs that expired in the meantime are
    ///  dropped along with the gaps in front of them, and the deliver timer is re-armed for what
    ///  is left.
    pub fn reload(record: &Bytes, ctx: &mut CollectorContext) -> anyhow::Result<(DataPduCollector, usize)> {
        let mut buf = unframe_record(record)?;

        let remote = EndpointId::deser(&mut buf)?;
        let profile_id = buf.checked_get_u32_varint()?;
        let mut result = DataPduCollector::new(AggregationKey::new(remote, profile_id));
        result.seq_ctr = buf.checked_get_u64_varint()?;

        let num_pdus = buf.checked_get_usize_varint()?;
        for _ in 0..num_pdus {
            let pdu = ProtocolDataUnit::deser(&mut buf)?;
            result.queue.insert(pdu.seq_ctr, pdu);
        }
        if buf.has_remaining() {
            warn!("{} trailing bytes in data PDU collector record for {}", buf.remaining(), result.key);
        }

        let now = ctx.clock.now();
        let expired = result.queue.iter()
            .filter(|(_, pdu)| pdu.expiration_ts <= now)
            .map(|(&seq, _)| seq)
            .collect::<Vec<_>>();
        if let Some(&last_expired) = expired.last() {
            debug!("discarding {} expired PDUs from reloaded collector {}", expired.len(), result.key);
            for seq in &expired {
                result.queue.remove(seq);
            }
            result.seq_ctr = result.seq_ctr.max(last_expired + 1);
        }

        let num_delivered = result.drain(ctx);
        result.update_timer(ctx);
        Ok((result, num_delivered))
    }
}
