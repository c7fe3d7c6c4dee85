use std::collections::VecDeque;
use std::time::Duration;
use bytes::{Buf, Bytes, BytesMut};
use bytes_varint::VarIntSupportMut;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, trace};
use crate::endpoint::EndpointId;
use crate::error::{DtpcError, DtpcResult};
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::util::clock::{DtnClock, DtnTime};

/// An application data item: one opaque application message for a topic. `remote_eid` is the
///  destination when sending and the source when receiving.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataItem {
    pub remote_eid: EndpointId,
    pub topic_id: u32,
    pub data: Bytes,
}

impl DataItem {
    pub fn new(remote_eid: EndpointId, topic_id: u32, data: impl Into<Bytes>) -> DataItem {
        DataItem { remote_eid, topic_id, data: data.into() }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.remote_eid.ser(buf);
        buf.put_u64_varint(self.topic_id.into());
        buf.put_bytes_with_len(&self.data);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DataItem> {
        Ok(DataItem {
            remote_eid: EndpointId::deser(buf)?,
            topic_id: buf.checked_get_u32_varint()?,
            data: buf.checked_get_bytes()?,
        })
    }
}

/// The data items of one topic block in a received PDU, sharing that PDU's source and
///  expiration
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TopicCollector {
    pub topic_id: u32,
    pub remote_eid: EndpointId,
    pub expiration_ts: DtnTime,
    items: VecDeque<DataItem>,
}

impl TopicCollector {
    pub fn new(topic_id: u32, remote_eid: EndpointId, expiration_ts: DtnTime) -> TopicCollector {
        TopicCollector {
            topic_id,
            remote_eid,
            expiration_ts,
            items: VecDeque::new(),
        }
    }

    pub fn push(&mut self, data: Bytes) {
        self.items.push_back(DataItem::new(self.remote_eid.clone(), self.topic_id, data));
    }

    pub fn pop_data_item(&mut self) -> Option<DataItem> {
        self.items.pop_front()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn expired(&self, now: DtnTime) -> bool {
        now >= self.expiration_ts
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64_varint(self.topic_id.into());
        self.remote_eid.ser(buf);
        buf.put_u64_varint(self.expiration_ts);
        buf.put_len_varint(self.items.len());
        for item in &self.items {
            buf.put_bytes_with_len(&item.data);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<TopicCollector> {
        let mut result = TopicCollector::new(
            buf.checked_get_u32_varint()?,
            EndpointId::deser(buf)?,
            buf.checked_get_u64_varint()?,
        );
        let num_items = buf.checked_get_usize_varint()?;
        for _ in 0..num_items {
            result.push(buf.checked_get_bytes()?);
        }
        Ok(result)
    }
}

/// Sent to an application that registered an elision function for a topic: the data items
///  currently queued for one destination and profile. The application answers through
///  `DtpcHandle::elision_func_response`, and the aggregator for that destination does not
///  proceed until it does.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ElisionRequest {
    pub topic_id: u32,
    pub dest_eid: EndpointId,
    pub profile_id: u32,
    pub items: Vec<DataItem>,
}

/// The daemon's side of an active topic registration
#[derive(Debug, Clone)]
pub struct RegistrationLink {
    collectors: mpsc::UnboundedSender<TopicCollector>,
    elision_requests: Option<mpsc::UnboundedSender<ElisionRequest>>,
}

impl RegistrationLink {
    pub fn elision_sender(&self) -> Option<mpsc::UnboundedSender<ElisionRequest>> {
        self.elision_requests.clone()
    }

    /// `false` once the application dropped its [TopicRegistration]
    pub fn is_alive(&self) -> bool {
        !self.collectors.is_closed()
    }
}

/// The application's side of an active topic registration: received data items, and elision
///  requests if the registration has an elision function
pub struct TopicRegistration {
    topic_id: u32,
    clock: DtnClock,
    collectors: mpsc::UnboundedReceiver<TopicCollector>,
    current: Option<TopicCollector>,
    elision_requests: Option<mpsc::UnboundedReceiver<ElisionRequest>>,
}

impl TopicRegistration {
    pub fn new(topic_id: u32, has_elision_func: bool, clock: DtnClock) -> (TopicRegistration, RegistrationLink) {
        let (collector_send, collector_recv) = mpsc::unbounded_channel();
        let (elision_send, elision_recv) = if has_elision_func {
            let (s, r) = mpsc::unbounded_channel();
            (Some(s), Some(r))
        }
        else {
            (None, None)
        };

        let registration = TopicRegistration {
            topic_id,
            clock,
            collectors: collector_recv,
            current: None,
            elision_requests: elision_recv,
        };
        let link = RegistrationLink {
            collectors: collector_send,
            elision_requests: elision_send,
        };
        (registration, link)
    }

    pub fn topic_id(&self) -> u32 {
        self.topic_id
    }

    /// Returns the next non-expired data item if one is available without waiting
    pub fn try_pop_next(&mut self) -> Option<DataItem> {
        loop {
            if self.current.is_none() {
                self.current = Some(self.collectors.try_recv().ok()?);
            }
            if let Some(item) = self.pop_from_current() {
                return Some(item);
            }
        }
    }

    /// Waits up to `timeout` for the next non-expired data item
    pub async fn pop_next(&mut self, timeout: Duration) -> Option<DataItem> {
        let deadline = time::Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_pop_next() {
                return Some(item);
            }
            match time::timeout_at(deadline, self.collectors.recv()).await {
                Ok(Some(collector)) => self.current = Some(collector),
                Ok(None) => return None,
                Err(_) => {
                    trace!("pop_next for topic {}: timeout", self.topic_id);
                    return None;
                }
            }
        }
    }

    /// The next elision request, or `None` if this registration has no elision function
    pub async fn next_elision_request(&mut self) -> Option<ElisionRequest> {
        self.elision_requests.as_mut()?.recv().await
    }

    fn pop_from_current(&mut self) -> Option<DataItem> {
        let collector = self.current.as_mut()?;
        if collector.expired(self.clock.now()) {
            debug!("discarding expired data items for topic {} from {:?}", self.topic_id, collector.remote_eid);
            self.current = None;
            return None;
        }
        let item = collector.pop_data_item();
        if collector.item_count() == 0 {
            self.current = None;
        }
        item
    }
}

pub struct Topic {
    pub topic_id: u32,
    pub user_defined: bool,
    pub description: String,
    registration: Option<RegistrationLink>,
    /// received data items waiting for a registration
    collectors: VecDeque<TopicCollector>,
}

impl Topic {
    pub fn new(topic_id: u32, user_defined: bool, description: impl Into<String>) -> Topic {
        Topic {
            topic_id,
            user_defined,
            description: description.into(),
            registration: None,
            collectors: VecDeque::new(),
        }
    }

    pub fn registration(&self) -> Option<&RegistrationLink> {
        self.registration.as_ref()
    }

    /// Attaches a registration, handing it all collectors that were queued while there was none
    pub fn set_registration(&mut self, link: RegistrationLink) {
        self.registration = Some(link);
        while let Some(collector) = self.collectors.pop_front() {
            self.deliver(collector);
        }
    }

    pub fn clear_registration(&mut self) -> bool {
        self.registration.take().is_some()
    }

    /// Hands received data items to the registered application, or queues them if there is no
    ///  (live) registration
    pub fn deliver(&mut self, collector: TopicCollector) {
        let collector = match &self.registration {
            Some(link) => match link.collectors.send(collector) {
                Ok(()) => return,
                Err(mpsc::error::SendError(collector)) => {
                    debug!("registration for topic {} was dropped - queueing data items", self.topic_id);
                    self.registration = None;
                    collector
                }
            },
            None => collector,
        };
        self.collectors.push_back(collector);
    }

    pub fn queued_item_count(&self) -> usize {
        self.collectors.iter()
            .map(|c| c.item_count())
            .sum()
    }

    /// Returns the number of dropped collectors
    pub fn remove_expired_items(&mut self, now: DtnTime) -> usize {
        let before = self.collectors.len();
        self.collectors.retain(|c| !c.expired(now));
        before - self.collectors.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64_varint(self.topic_id.into());
        buf.put_bool(self.user_defined);
        buf.put_string(&self.description);
        buf.put_len_varint(self.collectors.len());
        for collector in &self.collectors {
            collector.ser(buf);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Topic> {
        let mut topic = Topic::new(
            buf.checked_get_u32_varint()?,
            buf.checked_get_bool()?,
            buf.checked_get_string()?,
        );
        let num_collectors = buf.checked_get_usize_varint()?;
        for _ in 0..num_collectors {
            topic.collectors.push_back(TopicCollector::deser(buf)?);
        }
        Ok(topic)
    }
}

#[derive(Default)]
pub struct TopicTable {
    topics: FxHashMap<u32, Topic>,
}

impl TopicTable {
    pub fn add(&mut self, topic: Topic) -> DtpcResult<&mut Topic> {
        if self.topics.contains_key(&topic.topic_id) {
            return Err(DtpcError::AlreadyExists(format!("topic {}", topic.topic_id)));
        }
        let topic_id = topic.topic_id;
        Ok(self.topics.entry(topic_id).or_insert(topic))
    }

    /// Looks up a topic, creating it on the fly if the node's policy allows it. The flag in the
    ///  result is `true` if the topic was created.
    pub fn get_or_create(&mut self, topic_id: u32, require_predefined_topics: bool, description: &str) -> DtpcResult<(&mut Topic, bool)> {
        if self.topics.contains_key(&topic_id) {
            return self.topics.get_mut(&topic_id)
                .map(|t| (t, false))
                .ok_or_else(|| DtpcError::Internal(format!("topic {} vanished", topic_id)));
        }
        if require_predefined_topics {
            return Err(DtpcError::UnknownTopic(topic_id));
        }
        debug!("creating topic {} on the fly: {}", topic_id, description);
        Ok((self.topics.entry(topic_id).or_insert(Topic::new(topic_id, false, description)), true))
    }

    pub fn get(&self, topic_id: u32) -> Option<&Topic> {
        self.topics.get(&topic_id)
    }

    pub fn get_mut(&mut self, topic_id: u32) -> Option<&mut Topic> {
        self.topics.get_mut(&topic_id)
    }

    pub fn del(&mut self, topic_id: u32) -> DtpcResult<Topic> {
        self.topics.remove(&topic_id)
            .ok_or_else(|| DtpcError::NotFound(format!("topic {}", topic_id)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Topic> {
        self.topics.values_mut()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;
    use super::*;

    fn collector(topic_id: u32, expiration_ts: DtnTime, items: &[&'static [u8]]) -> TopicCollector {
        let mut result = TopicCollector::new(topic_id, EndpointId::ipn(2, 129), expiration_ts);
        for item in items {
            result.push(Bytes::from_static(item));
        }
        result
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_without_registration_queues() {
        let mut topic = Topic::new(7, true, "test topic");
        topic.deliver(collector(7, 100, &[b"a", b"b"]));
        topic.deliver(collector(7, 200, &[b"c"]));
        assert_eq!(topic.queued_item_count(), 3);

        assert_eq!(topic.remove_expired_items(150), 1);
        assert_eq!(topic.queued_item_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_receives_queued_and_new_items() {
        let clock = DtnClock::starting_at(50);
        let mut topic = Topic::new(7, true, "test topic");
        topic.deliver(collector(7, 100, &[b"a", b"b"]));

        let (mut registration, link) = TopicRegistration::new(7, false, clock);
        topic.set_registration(link);
        assert_eq!(topic.queued_item_count(), 0);

        topic.deliver(collector(7, 100, &[b"c"]));

        for expected in [b"a", b"b", b"c"] {
            let item = registration.pop_next(Duration::from_secs(1)).await.unwrap();
            assert_eq!(item.data.as_ref(), expected);
            assert_eq!(item.topic_id, 7);
        }

        let start = Instant::now();
        assert!(registration.pop_next(Duration::from_secs(3)).await.is_none());
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_skips_expired_collectors() {
        let clock = DtnClock::starting_at(50);
        let (mut registration, link) = TopicRegistration::new(7, false, clock);
        let mut topic = Topic::new(7, true, "");
        topic.set_registration(link);

        topic.deliver(collector(7, 55, &[b"old"]));
        topic.deliver(collector(7, 500, &[b"new"]));

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(registration.try_pop_next().unwrap().data.as_ref(), b"new");
        assert!(registration.try_pop_next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_waits_for_delivery() {
        let (mut registration, link) = TopicRegistration::new(7, false, DtnClock::starting_at(0));
        let mut topic = Topic::new(7, true, "");
        topic.set_registration(link);

        let handle = tokio::spawn(async move {
            registration.pop_next(Duration::from_secs(10)).await
        });
        time::sleep(Duration::from_secs(2)).await;
        topic.deliver(collector(7, 100, &[b"x"]));

        assert_eq!(handle.await.unwrap().unwrap().data.as_ref(), b"x");
    }

    #[tokio::test]
    async fn test_dropped_registration_falls_back_to_queue() {
        let (registration, link) = TopicRegistration::new(7, true, DtnClock::starting_at(0));
        let mut topic = Topic::new(7, true, "");
        topic.set_registration(link);
        assert!(topic.registration().unwrap().elision_sender().is_some());

        drop(registration);
        topic.deliver(collector(7, 100, &[b"x"]));
        assert!(topic.registration().is_none());
        assert_eq!(topic.queued_item_count(), 1);
    }

    #[test]
    fn test_table_policy() {
        let mut table = TopicTable::default();
        table.add(Topic::new(1, true, "predefined")).unwrap();
        assert!(table.add(Topic::new(1, true, "again")).is_err());

        let (topic, created) = table.get_or_create(1, true, "x").unwrap();
        assert_eq!(topic.description, "predefined");
        assert!(!created);

        assert_eq!(table.get_or_create(2, true, "x").err(), Some(DtpcError::UnknownTopic(2)));

        let (topic, created) = table.get_or_create(2, false, "<on the fly>").unwrap();
        assert!(created);
        assert!(!topic.user_defined);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_topic_ser_deser() {
        let mut topic = Topic::new(9, true, "with items");
        topic.deliver(collector(9, 100, &[b"a", b""]));

        let mut buf = BytesMut::new();
        topic.ser(&mut buf);
        let mut b: &[u8] = &buf;
        let restored = Topic::deser(&mut b).unwrap();

        assert_eq!(restored.topic_id, 9);
        assert!(restored.user_defined);
        assert_eq!(restored.description, "with items");
        assert_eq!(restored.collectors, topic.collectors);
    }
}
